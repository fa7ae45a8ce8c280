//! Service layer API for the order lifecycle
//!
//! Every status change goes through [`OrderService::transition`], which reads
//! the order, checks the move against the transition table and writes the new
//! order, the escrow settlement and the queued side effects in one sled
//! transaction. Concurrent changes to one order are therefore serialized: the
//! loser re-runs against the winner's state and is rejected by the table.
use std::sync::Arc;

use chrono::Utc;
use sled::transaction::{ConflictableTransactionResult, Transactional};
use tracing::{info, instrument, warn};

use crate::config::{MarketConfig, RetryPolicy};
use crate::error::{MarketError, Result, ValidationError};
use crate::files::{FileUpload, FileVersionStore, FsObjectStore, ObjectStore, OrderFile};
use crate::ledger::{EscrowStatus, Transaction, TransactionLedger};
use crate::metrics::{Outcome, SellerMetrics, SellerMetricsAggregator};
use crate::notify::{Notification, NotificationSink, TracingNotificationSink};
use crate::order::{NewOrder, Order, OrderStatus};
use crate::outbox::{self, DrainReport, OutboxProcessor, SideEffect};
use crate::profile::{FollowGraph, ProfileStats, ProfileStatsGateway};
use crate::store::{Store, decode, encode};
use crate::types::TimeStamp;
use crate::utils::new_uuid_to_bech32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisputeOutcome {
    /// Work resumes and the order goes back to `active`
    Continue,
    /// The order is cancelled and the buyer refunded
    Cancel,
}

pub struct OrderService {
    store: Store,
    ledger: TransactionLedger,
    metrics: SellerMetricsAggregator,
    files: FileVersionStore,
    outbox: OutboxProcessor,
    retry: RetryPolicy,
}

impl OrderService {
    pub fn new(
        instance: Arc<sled::Db>,
        objects: Arc<dyn ObjectStore>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Result<Self> {
        Self::build(&instance, objects, notifier, &MarketConfig::default())
    }

    /// Open the database and object root named in `config`.
    pub fn open(config: &MarketConfig) -> Result<Self> {
        let db = sled::open(&config.db_path)?;
        let objects = FsObjectStore::new(&config.object_root).map_err(MarketError::Io)?;

        info!(db_path = %config.db_path.display(), "order service opened");
        Self::build(
            &db,
            Arc::new(objects),
            Arc::new(TracingNotificationSink),
            config,
        )
    }

    fn build(
        db: &sled::Db,
        objects: Arc<dyn ObjectStore>,
        notifier: Arc<dyn NotificationSink>,
        config: &MarketConfig,
    ) -> Result<Self> {
        let store = Store::new(db)?;

        Ok(Self {
            ledger: TransactionLedger::new(store.transactions.clone()),
            metrics: SellerMetricsAggregator::new(store.metrics.clone()),
            files: FileVersionStore::new(
                store.files.clone(),
                store.file_latest.clone(),
                store.file_sequence.clone(),
                objects,
            ),
            outbox: OutboxProcessor::new(
                store.outbox.clone(),
                store.dead_letters.clone(),
                store.metrics.clone(),
                notifier,
                config.outbox_policy(),
            ),
            retry: config.retry.clone(),
            store,
        })
    }

    /// Place an order and hold its price in escrow.
    #[instrument(skip(self, new_order), fields(buyer_id = %new_order.buyer_id, seller_id = %new_order.seller_id))]
    pub fn create_order(&self, new_order: NewOrder) -> Result<Order> {
        new_order.validate()?;

        let order_id = new_uuid_to_bech32("order_").map_err(MarketError::Io)?;
        let txn_id = new_uuid_to_bech32("txn_").map_err(MarketError::Io)?;
        let order = new_order.into_order(order_id, TimeStamp::new());
        let bytes = encode(&order)?;
        let placed = Notification::new(
            &order.seller_id,
            "New order",
            format!("You received a new order worth {}", order.price),
            Some(order.link()),
        );

        // order row and escrow entry land together or not at all
        (
            &self.store.orders,
            &self.store.transactions,
            &self.store.outbox,
        )
            .transaction(
                |(orders, transactions, queue)| -> ConflictableTransactionResult<(), MarketError> {
                    if orders.get(order.id.as_bytes())?.is_some() {
                        return Err(MarketError::Conflict(format!("order {} already exists", order.id)).into());
                    }
                    orders.insert(order.id.as_bytes(), bytes.clone())?;
                    TransactionLedger::open_in(
                        transactions,
                        &txn_id,
                        &order.id,
                        order.price,
                        order.created_at.clone(),
                    )?;
                    outbox::enqueue_in(
                        queue,
                        &order.id,
                        SideEffect::Notify {
                            notification: placed.clone(),
                        },
                    )?;
                    Ok(())
                },
            )?;

        info!(order_id = %order.id, status = %order.status, price = %order.price, "order created");
        self.drain_after_commit();
        Ok(order)
    }

    /// Move an order to `status`. Completing releases escrow to the seller,
    /// cancelling refunds the buyer. Repeating a terminal status is a no-op.
    #[instrument(skip(self))]
    pub fn update_order_status(&self, order_id: &str, status: OrderStatus) -> Result<Order> {
        self.transition(order_id, |order, now| {
            if order.status == status && status.is_terminal() {
                return Ok(None);
            }
            let mut next = order.clone();
            next.apply_transition(status, now)?;
            Ok(Some(next))
        })
    }

    /// The buyer's requirements arrive and work can start.
    #[instrument(skip(self, requirements))]
    pub fn submit_requirements(&self, order_id: &str, requirements: &str) -> Result<Order> {
        if requirements.trim().is_empty() {
            return Err(ValidationError::Blank("requirements").into());
        }

        self.transition(order_id, |order, now| {
            if order.status != OrderStatus::Incomplete {
                return Err(MarketError::InvalidTransition {
                    from: order.status,
                    to: OrderStatus::Active,
                });
            }
            let mut next = order.clone();
            next.requirements = Some(requirements.trim().to_string());
            next.apply_transition(OrderStatus::Active, now)?;
            Ok(Some(next))
        })
    }

    /// Freeze an open order until the dispute is resolved.
    #[instrument(skip(self))]
    pub fn raise_dispute(&self, order_id: &str, reason: &str) -> Result<Order> {
        if reason.trim().is_empty() {
            return Err(ValidationError::Blank("dispute reason").into());
        }

        self.transition(order_id, |order, now| {
            let mut next = order.clone();
            next.apply_transition(OrderStatus::Disputed, now)?;
            next.dispute_reason = Some(reason.trim().to_string());
            Ok(Some(next))
        })
    }

    #[instrument(skip(self))]
    pub fn resolve_dispute(&self, order_id: &str, outcome: DisputeOutcome) -> Result<Order> {
        self.transition(order_id, |order, now| {
            if order.status != OrderStatus::Disputed {
                return Err(MarketError::NotFound(format!(
                    "no open dispute for order {}",
                    order.id
                )));
            }
            let target = match outcome {
                DisputeOutcome::Continue => OrderStatus::Active,
                DisputeOutcome::Cancel => OrderStatus::Cancelled,
            };
            let mut next = order.clone();
            next.apply_transition(target, now)?;
            // a resumed order has no open dispute; a cancelled one keeps the reason
            if outcome == DisputeOutcome::Continue {
                next.dispute_reason = None;
            }
            Ok(Some(next))
        })
    }

    /// Rate the seller of a completed order. Each order can be rated once,
    /// and only by its buyer.
    #[instrument(skip(self))]
    pub fn rate_order(&self, order_id: &str, reviewer_id: &str, rating: u8) -> Result<SellerMetrics> {
        if !(1..=5).contains(&rating) {
            return Err(ValidationError::RatingOutOfRange(rating).into());
        }
        let order = self.get_order(order_id)?;
        if order.buyer_id != reviewer_id {
            return Err(ValidationError::NotParticipant(reviewer_id.to_string()).into());
        }
        if order.status != OrderStatus::Completed {
            return Err(MarketError::NotFound(format!(
                "no completed order {order_id} to rate"
            )));
        }

        Ok((&self.store.reviews, &self.store.metrics).transaction(
            |(reviews, metrics)| -> ConflictableTransactionResult<SellerMetrics, MarketError> {
                if reviews.get(order_id.as_bytes())?.is_some() {
                    return Err(MarketError::Conflict(format!("order {order_id} was already rated")).into());
                }
                reviews.insert(order_id.as_bytes(), vec![rating])?;
                SellerMetricsAggregator::rate_in(metrics, &order.seller_id, rating)
            },
        )?)
    }

    pub fn get_order(&self, order_id: &str) -> Result<Order> {
        match self.store.orders.get(order_id.as_bytes())? {
            Some(bytes) => decode(&bytes),
            None => Err(MarketError::NotFound(format!("order {order_id}"))),
        }
    }

    pub fn list_orders_for_buyer(&self, buyer_id: &str) -> Result<Vec<Order>> {
        self.list_orders(|order| order.buyer_id == buyer_id)
    }

    pub fn list_orders_for_seller(&self, seller_id: &str) -> Result<Vec<Order>> {
        self.list_orders(|order| order.seller_id == seller_id)
    }

    pub fn get_transaction(&self, order_id: &str) -> Result<Transaction> {
        self.ledger
            .get(order_id)?
            .ok_or_else(|| MarketError::NotFound(format!("escrow for order {order_id}")))
    }

    pub fn get_seller_metrics(&self, seller_id: &str) -> Result<SellerMetrics> {
        self.metrics.get(seller_id)
    }

    /// Store a new version of a deliverable. Either side of the order may upload.
    #[instrument(skip(self, upload))]
    pub fn upload_order_file(&self, order_id: &str, upload: FileUpload, uploader_id: &str) -> Result<OrderFile> {
        let order = self.get_order(order_id)?;
        let Some(counterparty) = order.counterparty(uploader_id) else {
            return Err(ValidationError::NotParticipant(uploader_id.to_string()).into());
        };

        let file = self.files.upload(order_id, upload, uploader_id)?;

        let notification = Notification::new(
            counterparty,
            "New file",
            format!("{} (version {}) was uploaded", file.file_name, file.version),
            Some(order.link()),
        );
        match outbox::enqueue(&self.store.outbox, order_id, SideEffect::Notify { notification }) {
            Ok(()) => self.drain_after_commit(),
            Err(err) => warn!(order_id, error = %err, "could not queue upload notification"),
        }

        Ok(file)
    }

    pub fn get_order_files(&self, order_id: &str) -> Result<Vec<OrderFile>> {
        self.files.get_order_files(order_id)
    }

    pub fn get_file_history(&self, order_id: &str, file_name: &str) -> Result<Vec<OrderFile>> {
        self.files.get_file_history(order_id, file_name)
    }

    /// Latest deliverables of every completed order the buyer placed, newest first.
    pub fn get_vault_files(&self, buyer_id: &str) -> Result<Vec<OrderFile>> {
        let mut vault = Vec::new();
        for order in self.list_orders_for_buyer(buyer_id)? {
            if order.status == OrderStatus::Completed {
                vault.extend(self.files.get_order_files(&order.id)?);
            }
        }

        vault.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(vault)
    }

    pub fn download_file(&self, file: &OrderFile) -> Result<Vec<u8>> {
        self.files.download(file)
    }

    /// Apply queued side effects. Safe to call at any time, from any thread.
    pub fn drain_outbox(&self) -> Result<DrainReport> {
        self.outbox.drain()
    }

    pub fn ledger(&self) -> &TransactionLedger {
        &self.ledger
    }

    pub fn metrics(&self) -> &SellerMetricsAggregator {
        &self.metrics
    }

    pub fn outbox(&self) -> &OutboxProcessor {
        &self.outbox
    }

    pub fn follow_graph(&self) -> FollowGraph {
        FollowGraph::new(self.store.follows.clone(), self.store.followers.clone())
    }

    /// Follower counts for `target_user_id`, retried with the configured policy.
    pub fn profile_stats(&self, target_user_id: &str, viewer_id: Option<&str>) -> Result<ProfileStats> {
        ProfileStatsGateway::new(Arc::new(self.follow_graph()), self.retry.clone())
            .get_profile_stats(target_user_id, viewer_id)
    }

    /// Write everything buffered so far to disk.
    pub fn flush(&self) -> Result<usize> {
        self.store.flush()
    }

    fn list_orders<P>(&self, keep: P) -> Result<Vec<Order>>
    where
        P: Fn(&Order) -> bool,
    {
        let mut orders = Vec::new();
        for bytes in self.store.orders.iter().values() {
            let order: Order = decode(&bytes?)?;
            if keep(&order) {
                orders.push(order);
            }
        }

        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(orders)
    }

    /// Read, check and write one order atomically. `plan` returns the new
    /// order, or `None` when the request is already satisfied.
    fn transition<F>(&self, order_id: &str, plan: F) -> Result<Order>
    where
        F: Fn(&Order, TimeStamp<Utc>) -> Result<Option<Order>>,
    {
        let (order, previous) = (
            &self.store.orders,
            &self.store.transactions,
            &self.store.outbox,
        )
            .transaction(
                |(orders, transactions, queue)| -> ConflictableTransactionResult<(Order, Option<OrderStatus>), MarketError> {
                    let Some(bytes) = orders.get(order_id.as_bytes())? else {
                        return Err(MarketError::NotFound(format!("order {order_id}")).into());
                    };
                    let current: Order = decode(&bytes)?;

                    let Some(next) = plan(&current, TimeStamp::new())? else {
                        return Ok((current, None));
                    };
                    orders.insert(order_id.as_bytes(), encode(&next)?)?;

                    if next.status != current.status {
                        let settlement = match next.status {
                            OrderStatus::Completed => Some((EscrowStatus::Released, Outcome::Completed)),
                            OrderStatus::Cancelled => Some((EscrowStatus::Refunded, Outcome::Cancelled)),
                            _ => None,
                        };
                        if let Some((escrow, outcome)) = settlement {
                            TransactionLedger::settle_in(transactions, order_id, escrow)?;
                            outbox::enqueue_in(
                                queue,
                                order_id,
                                SideEffect::RecordOutcome {
                                    seller_id: next.seller_id.clone(),
                                    outcome,
                                },
                            )?;
                        }
                    }

                    for notification in status_notifications(&current, &next) {
                        outbox::enqueue_in(queue, order_id, SideEffect::Notify { notification })?;
                    }

                    Ok((next, Some(current.status)))
                },
            )?;

        match previous {
            Some(from) => {
                info!(order_id, %from, to = %order.status, "order status changed");
                self.drain_after_commit();
            }
            None => info!(order_id, status = %order.status, "order already in requested state"),
        }
        Ok(order)
    }

    // The transition is already committed; failures here only delay effects.
    fn drain_after_commit(&self) {
        if let Err(err) = self.outbox.drain() {
            warn!(error = %err, "outbox drain failed, effects stay queued");
        }
    }
}

fn status_notifications(previous: &Order, next: &Order) -> Vec<Notification> {
    if previous.status == next.status {
        return Vec::new();
    }
    let link = Some(next.link());
    let both = |title: &str, message: String| {
        vec![
            Notification::new(&next.buyer_id, title, message.clone(), link.clone()),
            Notification::new(&next.seller_id, title, message, link.clone()),
        ]
    };

    match (previous.status, next.status) {
        (OrderStatus::Incomplete, OrderStatus::Active) => vec![Notification::new(
            &next.seller_id,
            "Requirements received",
            "The buyer sent their requirements, work can start",
            link.clone(),
        )],
        (OrderStatus::Disputed, OrderStatus::Active) => {
            both("Dispute resolved", "The dispute was resolved and work resumes".to_string())
        }
        (_, OrderStatus::Delivered) => vec![Notification::new(
            &next.buyer_id,
            "Order delivered",
            "The seller delivered your order",
            link.clone(),
        )],
        (_, OrderStatus::InRevision) => vec![Notification::new(
            &next.seller_id,
            "Revision requested",
            "The buyer asked for a revision",
            link.clone(),
        )],
        (_, OrderStatus::Completed) => vec![Notification::new(
            &next.seller_id,
            "Order completed",
            format!("{} has been released to you", next.price),
            link.clone(),
        )],
        (_, OrderStatus::Cancelled) => both(
            "Order cancelled",
            format!("The order was cancelled and {} refunded to the buyer", next.price),
        ),
        (_, OrderStatus::Disputed) => both(
            "Dispute opened",
            next.dispute_reason
                .clone()
                .unwrap_or_else(|| "A dispute was opened on this order".to_string()),
        ),
        _ => Vec::new(),
    }
}
