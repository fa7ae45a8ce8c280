//! Side effects recorded in the same transaction as the order change and
//! applied afterwards. A failed effect stays queued and never undoes the
//! transition that produced it.
//!
//! Failed entries wait out an exponential backoff before the next attempt, so
//! `max_attempts` bounds retries over time rather than over drain calls.
use std::sync::{Arc, Mutex, TryLockError};

use chrono::Utc;
use sled::Tree;
use sled::transaction::{ConflictableTransactionResult, TransactionalTree, Transactional};
use tracing::{debug, warn};
use uuid7::uuid7;

use crate::config::RetryPolicy;
use crate::error::{MarketError, Result};
use crate::metrics::{Outcome, SellerMetricsAggregator};
use crate::notify::{Notification, NotificationSink};
use crate::store::{decode, encode};
use crate::types::TimeStamp;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub enum SideEffect {
    #[n(0)]
    RecordOutcome {
        #[n(0)]
        seller_id: String,
        #[n(1)]
        outcome: Outcome,
    },
    #[n(1)]
    Notify {
        #[n(0)]
        notification: Notification,
    },
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct OutboxEntry {
    #[n(0)]
    pub order_id: String,
    #[n(1)]
    pub effect: SideEffect,
    #[n(2)]
    pub attempts: u32,
    #[n(3)]
    pub last_error: Option<String>,
    #[n(4)]
    pub created_at: TimeStamp<Utc>,
    #[n(5)]
    pub next_attempt_at: Option<TimeStamp<Utc>>, // unset until the first failure
}

impl OutboxEntry {
    pub fn is_due(&self, now: &TimeStamp<Utc>) -> bool {
        self.next_attempt_at.as_ref().is_none_or(|at| at <= now)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub applied: usize,
    pub failed: usize,
    pub deferred: usize,
    pub dead_lettered: usize,
}

pub(crate) fn enqueue_in(
    tx: &TransactionalTree,
    order_id: &str,
    effect: SideEffect,
) -> ConflictableTransactionResult<(), MarketError> {
    let entry = OutboxEntry {
        order_id: order_id.to_string(),
        effect,
        attempts: 0,
        last_error: None,
        created_at: TimeStamp::new(),
        next_attempt_at: None,
    };
    // uuid7 keys keep the queue in creation order
    tx.insert(uuid7().as_bytes().to_vec(), encode(&entry)?)?;
    Ok(())
}

pub(crate) fn enqueue(outbox: &Tree, order_id: &str, effect: SideEffect) -> Result<()> {
    Ok(outbox.transaction(|tx| enqueue_in(tx, order_id, effect.clone()))?)
}

pub struct OutboxProcessor {
    outbox: Tree,
    dead_letters: Tree,
    metrics: Tree,
    sink: Arc<dyn NotificationSink>,
    backoff: RetryPolicy,
    // one drain at a time, so a notification is never handed to the sink twice
    draining: Mutex<()>,
}

impl OutboxProcessor {
    pub fn new(
        outbox: Tree,
        dead_letters: Tree,
        metrics: Tree,
        sink: Arc<dyn NotificationSink>,
        backoff: RetryPolicy,
    ) -> Self {
        Self {
            outbox,
            dead_letters,
            metrics,
            sink,
            backoff: RetryPolicy::new(backoff.max_attempts.max(1), backoff.base_delay),
            draining: Mutex::new(()),
        }
    }

    /// Apply every due effect once, oldest first. Entries still backing off are
    /// skipped. Returns an empty report when another drain is already running.
    pub fn drain(&self) -> Result<DrainReport> {
        let _guard = match self.draining.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                debug!("outbox drain already running");
                return Ok(DrainReport::default());
            }
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };
        let mut report = DrainReport::default();
        let now = TimeStamp::new();

        for item in self.outbox.iter() {
            let (key, bytes) = item?;
            let entry: OutboxEntry = match decode(&bytes) {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(error = %err, "unreadable outbox entry moved to dead letters");
                    (&self.outbox, &self.dead_letters).transaction(
                        |(outbox, dead)| -> ConflictableTransactionResult<(), MarketError> {
                            outbox.remove(&key[..])?;
                            dead.insert(&key[..], &bytes[..])?;
                            Ok(())
                        },
                    )?;
                    report.dead_lettered += 1;
                    continue;
                }
            };

            if !entry.is_due(&now) {
                report.deferred += 1;
                continue;
            }

            match self.apply(&key, &entry) {
                Ok(true) => report.applied += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(
                        order_id = %entry.order_id,
                        attempts = entry.attempts + 1,
                        error = %err,
                        "side effect failed"
                    );
                    if self.record_failure(&key, &entry, &err)? {
                        report.dead_lettered += 1;
                    } else {
                        report.failed += 1;
                    }
                }
            }
        }

        if report != DrainReport::default() {
            debug!(?report, "outbox drained");
        }
        Ok(report)
    }

    pub fn pending(&self) -> Result<Vec<OutboxEntry>> {
        Self::entries(&self.outbox)
    }

    pub fn dead_letters(&self) -> Result<Vec<OutboxEntry>> {
        Self::entries(&self.dead_letters)
    }

    /// Put dead letters back in the queue with a fresh attempt budget.
    pub fn requeue_dead_letters(&self) -> Result<usize> {
        let mut moved = 0;

        for item in self.dead_letters.iter() {
            let (key, bytes) = item?;
            let mut entry: OutboxEntry = decode(&bytes)?;
            entry.attempts = 0;
            entry.next_attempt_at = None;
            let bytes = encode(&entry)?;

            (&self.outbox, &self.dead_letters).transaction(
                |(outbox, dead)| -> ConflictableTransactionResult<(), MarketError> {
                    dead.remove(&key[..])?;
                    outbox.insert(&key[..], bytes.clone())?;
                    Ok(())
                },
            )?;
            moved += 1;
        }

        Ok(moved)
    }

    // false when another drain got to the entry first
    fn apply(&self, key: &[u8], entry: &OutboxEntry) -> Result<bool> {
        match &entry.effect {
            SideEffect::RecordOutcome { seller_id, outcome } => {
                Ok((&self.metrics, &self.outbox).transaction(
                    |(metrics, outbox)| -> ConflictableTransactionResult<bool, MarketError> {
                        if outbox.get(key)?.is_none() {
                            return Ok(false);
                        }
                        SellerMetricsAggregator::record_in(metrics, seller_id, *outcome)?;
                        outbox.remove(key)?;
                        Ok(true)
                    },
                )?)
            }
            SideEffect::Notify { notification } => {
                self.sink.notify(notification).map_err(MarketError::Io)?;
                Ok(self.outbox.remove(key)?.is_some())
            }
        }
    }

    // true when the entry ran out of attempts and was moved to dead letters
    fn record_failure(&self, key: &[u8], entry: &OutboxEntry, err: &MarketError) -> Result<bool> {
        let mut failed = entry.clone();
        failed.attempts += 1;
        failed.last_error = Some(err.to_string());
        let now = TimeStamp::new();
        let delay = self.backoff.delay_for(failed.attempts);
        failed.next_attempt_at = Some(now.checked_add(delay).unwrap_or(now));
        let bury = failed.attempts >= self.backoff.max_attempts;
        let bytes = encode(&failed)?;

        (&self.outbox, &self.dead_letters).transaction(
            |(outbox, dead)| -> ConflictableTransactionResult<(), MarketError> {
                if outbox.get(key)?.is_none() {
                    return Ok(());
                }
                if bury {
                    outbox.remove(key)?;
                    dead.insert(key, bytes.clone())?;
                } else {
                    outbox.insert(key, bytes.clone())?;
                }
                Ok(())
            },
        )?;

        Ok(bury)
    }

    fn entries(tree: &Tree) -> Result<Vec<OutboxEntry>> {
        tree.iter()
            .values()
            .map(|bytes| decode(&bytes?))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;
    use tempfile::tempdir;

    struct FailingSink {
        calls: AtomicUsize,
    }

    impl NotificationSink for FailingSink {
        fn notify(&self, _: &Notification) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("mail server unavailable")
        }
    }

    // succeeds slowly, so two drains overlap
    struct SlowSink {
        calls: AtomicUsize,
    }

    impl NotificationSink for SlowSink {
        fn notify(&self, _: &Notification) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(50));
            Ok(())
        }
    }

    fn processor(
        db: &sled::Db,
        sink: Arc<dyn NotificationSink>,
        base_delay: Duration,
    ) -> anyhow::Result<OutboxProcessor> {
        Ok(OutboxProcessor::new(
            db.open_tree("outbox")?,
            db.open_tree("dead_letters")?,
            db.open_tree("seller_metrics")?,
            sink,
            RetryPolicy::new(2, base_delay),
        ))
    }

    fn enqueue_hello(db: &sled::Db) -> anyhow::Result<()> {
        let notification = Notification::new("user_a", "Hello", "hi", None);
        enqueue(
            &db.open_tree("outbox")?,
            "order_1",
            SideEffect::Notify { notification },
        )?;
        Ok(())
    }

    #[test]
    fn failing_notifications_end_in_dead_letters() -> anyhow::Result<()> {
        let temp_dir = tempdir()?;
        let db = sled::open(temp_dir.path().join("outbox.db"))?;
        let sink = Arc::new(FailingSink {
            calls: AtomicUsize::new(0),
        });
        let processor = processor(&db, sink.clone(), Duration::ZERO)?;
        enqueue_hello(&db)?;

        let first = processor.drain()?;
        assert_eq!(first.failed, 1);
        assert_eq!(processor.pending()?[0].attempts, 1);

        let second = processor.drain()?;
        assert_eq!(second.dead_lettered, 1);
        assert!(processor.pending()?.is_empty());
        assert_eq!(processor.dead_letters()?.len(), 1);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 2);

        assert_eq!(processor.requeue_dead_letters()?, 1);
        let requeued = &processor.pending()?[0];
        assert_eq!(requeued.attempts, 0);
        assert!(requeued.next_attempt_at.is_none());
        Ok(())
    }

    #[test]
    fn failed_entries_wait_out_their_backoff() -> anyhow::Result<()> {
        let temp_dir = tempdir()?;
        let db = sled::open(temp_dir.path().join("outbox.db"))?;
        let sink = Arc::new(FailingSink {
            calls: AtomicUsize::new(0),
        });
        let processor = processor(&db, sink.clone(), Duration::from_secs(60))?;
        enqueue_hello(&db)?;

        assert_eq!(processor.drain()?.failed, 1);
        for _ in 0..5 {
            let report = processor.drain()?;
            assert_eq!((report.failed, report.deferred), (0, 1));
        }

        let pending = processor.pending()?;
        assert_eq!(pending[0].attempts, 1);
        assert!(pending[0].next_attempt_at.is_some());
        assert!(processor.dead_letters()?.is_empty());
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn overlapping_drains_notify_once() -> anyhow::Result<()> {
        let temp_dir = tempdir()?;
        let db = sled::open(temp_dir.path().join("outbox.db"))?;
        let sink = Arc::new(SlowSink {
            calls: AtomicUsize::new(0),
        });
        let processor = Arc::new(processor(&db, sink.clone(), Duration::ZERO)?);
        enqueue_hello(&db)?;

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let processor = Arc::clone(&processor);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    processor.drain().unwrap().applied
                })
            })
            .collect();
        let applied: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(applied, 1);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
        assert!(processor.pending()?.is_empty());
        Ok(())
    }

    #[test]
    fn outcome_is_applied_once_across_drains() -> anyhow::Result<()> {
        let temp_dir = tempdir()?;
        let db = sled::open(temp_dir.path().join("outbox.db"))?;
        let processor = processor(&db, Arc::new(crate::notify::TracingNotificationSink), Duration::ZERO)?;

        enqueue(
            &db.open_tree("outbox")?,
            "order_1",
            SideEffect::RecordOutcome {
                seller_id: "seller".into(),
                outcome: Outcome::Completed,
            },
        )?;

        assert_eq!(processor.drain()?.applied, 1);
        assert_eq!(processor.drain()?.applied, 0);

        let metrics = SellerMetricsAggregator::new(db.open_tree("seller_metrics")?);
        assert_eq!(metrics.get("seller")?.completed_orders, 1);
        Ok(())
    }
}
