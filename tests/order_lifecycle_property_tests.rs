//! Property-based tests for the order status machine
//!
//! The first group drives a bare `Order` through arbitrary requested statuses
//! and checks the flags that must move in step with the status. The second
//! group runs arbitrary operation sequences against a real service and checks
//! that escrow and seller metrics always agree with where the order ended up.

use std::sync::Arc;

use paylink::files::MemoryObjectStore;
use paylink::ledger::EscrowStatus;
use paylink::notify::TracingNotificationSink;
use paylink::order::{NewOrder, Order, OrderStatus};
use paylink::types::{Price, TimeStamp};
use paylink::{DisputeOutcome, OrderService};
use proptest::prelude::*;
use tempfile::tempdir;

fn status_strategy() -> impl Strategy<Value = OrderStatus> {
    prop::sample::select(OrderStatus::ALL.to_vec())
}

fn fresh_order(with_requirements: bool) -> Order {
    let mut draft = NewOrder::new("user_buyer", "user_seller", Price::from_minor(2500, 2).unwrap());
    if with_requirements {
        draft = draft.set_requirements("a logo");
    }
    draft.into_order("order_prop".to_string(), TimeStamp::new())
}

#[derive(Debug, Clone)]
enum Op {
    Update(OrderStatus),
    Dispute,
    Resolve(DisputeOutcome),
    Requirements,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => status_strategy().prop_map(Op::Update),
        1 => Just(Op::Dispute),
        1 => Just(Op::Resolve(DisputeOutcome::Continue)),
        1 => Just(Op::Resolve(DisputeOutcome::Cancel)),
        1 => Just(Op::Requirements),
    ]
}

proptest! {
    /// Property: whatever is requested, the paused flag and the completion
    /// stamp always match the status, and a rejected request changes nothing.
    #[test]
    fn prop_flags_follow_status(
        with_requirements in any::<bool>(),
        requests in prop::collection::vec(status_strategy(), 1..=20)
    ) {
        let mut order = fresh_order(with_requirements);

        for to in requests {
            let before = order.clone();
            let allowed = order.status.can_transition_to(to);

            match order.apply_transition(to, TimeStamp::new()) {
                Ok(()) => prop_assert!(allowed),
                Err(_) => {
                    prop_assert!(!allowed);
                    prop_assert_eq!(&order, &before);
                }
            }

            prop_assert_eq!(order.is_paused, order.status == OrderStatus::Disputed);
            prop_assert_eq!(order.completed_at.is_some(), order.status == OrderStatus::Completed);
        }
    }

    /// Property: terminal statuses are final.
    #[test]
    fn prop_terminal_is_final(
        requests in prop::collection::vec(status_strategy(), 1..=10),
        cancel in any::<bool>()
    ) {
        let mut order = fresh_order(true);
        if cancel {
            order.apply_transition(OrderStatus::Cancelled, TimeStamp::new()).unwrap();
        } else {
            order.apply_transition(OrderStatus::Delivered, TimeStamp::new()).unwrap();
            order.apply_transition(OrderStatus::Completed, TimeStamp::new()).unwrap();
        }
        let settled = order.clone();

        for to in requests {
            prop_assert!(order.apply_transition(to, TimeStamp::new()).is_err());
        }
        prop_assert_eq!(order, settled);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Property: escrow is settled exactly when the order is terminal, in the
    /// matching direction, and the seller is counted exactly once.
    #[test]
    fn prop_escrow_and_metrics_agree_with_status(
        with_requirements in any::<bool>(),
        ops in prop::collection::vec(op_strategy(), 0..=15)
    ) {
        let temp_dir = tempdir().unwrap();
        let db = Arc::new(sled::open(temp_dir.path().join("lifecycle.db")).unwrap());
        let service = OrderService::new(
            db,
            Arc::new(MemoryObjectStore::new()),
            Arc::new(TracingNotificationSink),
        ).unwrap();

        let mut draft = NewOrder::new("user_buyer", "user_seller", Price::from_minor(2500, 2).unwrap());
        if with_requirements {
            draft = draft.set_requirements("a logo");
        }
        let order = service.create_order(draft).unwrap();

        for op in ops {
            // rejected operations are expected; only the end state matters
            let _ = match op {
                Op::Update(status) => service.update_order_status(&order.id, status),
                Op::Dispute => service.raise_dispute(&order.id, "late"),
                Op::Resolve(outcome) => service.resolve_dispute(&order.id, outcome),
                Op::Requirements => service.submit_requirements(&order.id, "a logo"),
            };
        }

        let order = service.get_order(&order.id).unwrap();
        let escrow = service.get_transaction(&order.id).unwrap();
        let metrics = service.get_seller_metrics("user_seller").unwrap();

        let expected_escrow = match order.status {
            OrderStatus::Completed => EscrowStatus::Released,
            OrderStatus::Cancelled => EscrowStatus::Refunded,
            _ => EscrowStatus::Held,
        };
        prop_assert_eq!(escrow.status, expected_escrow);
        prop_assert_eq!(metrics.completed_orders, (order.status == OrderStatus::Completed) as u64);
        prop_assert_eq!(metrics.cancelled_orders, (order.status == OrderStatus::Cancelled) as u64);
        prop_assert_eq!(metrics.total_orders, metrics.completed_orders + metrics.cancelled_orders);
        prop_assert_eq!(order.is_paused, order.status == OrderStatus::Disputed);
    }
}
