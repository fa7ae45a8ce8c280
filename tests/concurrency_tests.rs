//! Races that the storage layer must serialize: counter increments, version
//! reservation and conflicting status changes on one order.

use std::collections::BTreeSet;
use std::sync::{Arc, Barrier};
use std::thread;

use paylink::files::{FileUpload, MemoryObjectStore};
use paylink::ledger::EscrowStatus;
use paylink::metrics::Outcome;
use paylink::notify::TracingNotificationSink;
use paylink::order::{NewOrder, OrderStatus};
use paylink::types::Price;
use paylink::OrderService;
use tempfile::{TempDir, tempdir};

const THREADS: usize = 8;

fn shared_service(temp_dir: &TempDir) -> anyhow::Result<Arc<OrderService>> {
    let db = Arc::new(sled::open(temp_dir.path().join("race.db"))?);
    Ok(Arc::new(OrderService::new(
        db,
        Arc::new(MemoryObjectStore::new()),
        Arc::new(TracingNotificationSink),
    )?))
}

fn delivered_order(service: &OrderService) -> anyhow::Result<String> {
    let order = service.create_order(
        NewOrder::new("user_buyer", "user_seller", Price::from_minor(9900, 2)?).set_requirements("logo"),
    )?;
    service.update_order_status(&order.id, OrderStatus::Delivered)?;
    Ok(order.id)
}

#[test]
fn parallel_outcomes_lose_no_updates() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let service = shared_service(&temp_dir)?;
    let per_thread = 25;
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let service = Arc::clone(&service);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..per_thread {
                    service
                        .metrics()
                        .record_outcome("user_seller", Outcome::Completed)
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let metrics = service.get_seller_metrics("user_seller")?;
    let expected = (THREADS * per_thread) as u64;
    assert_eq!(metrics.completed_orders, expected);
    assert_eq!(metrics.total_orders, expected);
    Ok(())
}

#[test]
fn parallel_uploads_get_distinct_versions() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let service = shared_service(&temp_dir)?;
    let order_id = delivered_order(&service)?;
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|i| {
            let service = Arc::clone(&service);
            let barrier = Arc::clone(&barrier);
            let order_id = order_id.clone();
            thread::spawn(move || {
                barrier.wait();
                service
                    .upload_order_file(&order_id, FileUpload::new("design.png", format!("draft {i}")), "user_seller")
                    .unwrap()
                    .version
            })
        })
        .collect();
    let versions: BTreeSet<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(versions, (1..=THREADS as u64).collect());

    let history = service.get_file_history(&order_id, "design.png")?;
    assert_eq!(history.len(), THREADS);
    let latest: Vec<_> = history.iter().filter(|f| f.is_latest).collect();
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].version, THREADS as u64);
    Ok(())
}

#[test]
fn conflicting_transitions_admit_one_winner() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let service = shared_service(&temp_dir)?;

    for _ in 0..10 {
        let order_id = delivered_order(&service)?;
        let barrier = Arc::new(Barrier::new(2));

        // completed -> in_revision and in_revision -> completed are both illegal
        let handles: Vec<_> = [OrderStatus::Completed, OrderStatus::InRevision]
            .into_iter()
            .map(|target| {
                let service = Arc::clone(&service);
                let barrier = Arc::clone(&barrier);
                let order_id = order_id.clone();
                thread::spawn(move || {
                    barrier.wait();
                    service.update_order_status(&order_id, target).is_ok()
                })
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);

        let order = service.get_order(&order_id)?;
        let escrow = service.get_transaction(&order_id)?;
        match order.status {
            OrderStatus::Completed => assert_eq!(escrow.status, EscrowStatus::Released),
            OrderStatus::InRevision => assert_eq!(escrow.status, EscrowStatus::Held),
            other => panic!("unexpected status {other}"),
        }
    }
    Ok(())
}

#[test]
fn racing_completions_settle_once() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let service = shared_service(&temp_dir)?;
    let order_id = delivered_order(&service)?;
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let service = Arc::clone(&service);
            let barrier = Arc::clone(&barrier);
            let order_id = order_id.clone();
            thread::spawn(move || {
                barrier.wait();
                service.update_order_status(&order_id, OrderStatus::Completed)
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap()?.status, OrderStatus::Completed);
    }

    service.drain_outbox()?;
    assert_eq!(service.get_transaction(&order_id)?.status, EscrowStatus::Released);
    let metrics = service.get_seller_metrics("user_seller")?;
    assert_eq!((metrics.total_orders, metrics.completed_orders), (1, 1));
    Ok(())
}
