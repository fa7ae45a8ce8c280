//! Escrow ledger: one entry per order, settled exactly once.
use std::fmt;

use chrono::Utc;
use sled::Tree;
use sled::transaction::{ConflictableTransactionResult, TransactionalTree};
use tracing::info;

use crate::error::{MarketError, Result};
use crate::store::{decode, encode};
use crate::types::{Price, TimeStamp};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscrowStatus {
    #[n(0)]
    Held,
    #[n(1)]
    Released,
    #[n(2)]
    Refunded,
}

impl fmt::Display for EscrowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EscrowStatus::Held => "held",
            EscrowStatus::Released => "released",
            EscrowStatus::Refunded => "refunded",
        })
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub order_id: String,
    #[n(2)]
    pub amount: Price,
    #[n(3)]
    pub status: EscrowStatus,
    #[n(4)]
    pub created_at: TimeStamp<Utc>,
    #[n(5)]
    pub released_at: Option<TimeStamp<Utc>>, // set on release and on refund
}

#[derive(Clone)]
pub struct TransactionLedger {
    tree: Tree,
}

impl TransactionLedger {
    pub fn new(tree: Tree) -> Self {
        Self { tree }
    }

    pub fn get(&self, order_id: &str) -> Result<Option<Transaction>> {
        self.tree
            .get(order_id.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    /// Pay the held funds out to the seller.
    pub fn release(&self, order_id: &str) -> Result<Transaction> {
        let entry = self
            .tree
            .transaction(|tx| Self::settle_in(tx, order_id, EscrowStatus::Released))?;
        info!(order_id, amount = %entry.amount, "escrow released");
        Ok(entry)
    }

    /// Return the held funds to the buyer.
    pub fn refund(&self, order_id: &str) -> Result<Transaction> {
        let entry = self
            .tree
            .transaction(|tx| Self::settle_in(tx, order_id, EscrowStatus::Refunded))?;
        info!(order_id, amount = %entry.amount, "escrow refunded");
        Ok(entry)
    }

    pub(crate) fn open_in(
        tx: &TransactionalTree,
        id: &str,
        order_id: &str,
        amount: Price,
        now: TimeStamp<Utc>,
    ) -> ConflictableTransactionResult<Transaction, MarketError> {
        if tx.get(order_id.as_bytes())?.is_some() {
            return Err(MarketError::Conflict(format!("escrow already exists for order {order_id}")).into());
        }

        let entry = Transaction {
            id: id.to_string(),
            order_id: order_id.to_string(),
            amount,
            status: EscrowStatus::Held,
            created_at: now,
            released_at: None,
        };
        tx.insert(order_id.as_bytes(), encode(&entry)?)?;

        Ok(entry)
    }

    /// Moves a held entry to `outcome`. Anything but `held` is rejected so a
    /// repeated call can never pay out twice.
    pub(crate) fn settle_in(
        tx: &TransactionalTree,
        order_id: &str,
        outcome: EscrowStatus,
    ) -> ConflictableTransactionResult<Transaction, MarketError> {
        let Some(bytes) = tx.get(order_id.as_bytes())? else {
            return Err(MarketError::NotFound(format!("escrow for order {order_id}")).into());
        };
        let mut entry: Transaction = decode(&bytes)?;

        if entry.status != EscrowStatus::Held {
            return Err(MarketError::InvalidState {
                order_id: order_id.to_string(),
                status: entry.status,
            }
            .into());
        }

        entry.status = outcome;
        entry.released_at = Some(TimeStamp::new());
        tx.insert(order_id.as_bytes(), encode(&entry)?)?;

        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ledger_with_entry(order_id: &str) -> anyhow::Result<(tempfile::TempDir, TransactionLedger)> {
        let temp_dir = tempdir()?;
        let db = sled::open(temp_dir.path().join("ledger.db"))?;
        let ledger = TransactionLedger::new(db.open_tree("transactions")?);
        let amount = Price::from_minor(5000, 2)?;

        ledger
            .tree
            .transaction(|tx| {
                TransactionLedger::open_in(tx, "txn_test", order_id, amount, TimeStamp::new())
            })
            .map_err(MarketError::from)?;

        Ok((temp_dir, ledger))
    }

    #[test]
    fn release_happens_once() -> anyhow::Result<()> {
        let (_dir, ledger) = ledger_with_entry("order_1")?;

        let entry = ledger.release("order_1")?;
        assert_eq!(entry.status, EscrowStatus::Released);
        assert!(entry.released_at.is_some());

        let err = ledger.release("order_1").unwrap_err();
        assert!(matches!(
            err,
            MarketError::InvalidState { status: EscrowStatus::Released, .. }
        ));
        Ok(())
    }

    #[test]
    fn refund_after_release_is_rejected() -> anyhow::Result<()> {
        let (_dir, ledger) = ledger_with_entry("order_2")?;

        ledger.release("order_2")?;
        assert!(ledger.refund("order_2").is_err());
        assert_eq!(ledger.get("order_2")?.unwrap().status, EscrowStatus::Released);
        Ok(())
    }

    #[test]
    fn missing_entry_is_not_found() -> anyhow::Result<()> {
        let (_dir, ledger) = ledger_with_entry("order_3")?;

        assert!(matches!(
            ledger.refund("order_missing").unwrap_err(),
            MarketError::NotFound(_)
        ));
        Ok(())
    }
}
