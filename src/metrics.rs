//! Per-seller counters derived from terminal order transitions
use chrono::Utc;
use sled::Tree;
use sled::transaction::{ConflictableTransactionResult, TransactionalTree};
use tracing::debug;

use crate::error::{MarketError, Result, ValidationError};
use crate::store::{decode, encode};
use crate::types::TimeStamp;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    #[n(0)]
    Completed,
    #[n(1)]
    Cancelled,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct SellerMetrics {
    #[n(0)]
    pub seller_id: String,
    #[n(1)]
    pub total_orders: u64,
    #[n(2)]
    pub completed_orders: u64,
    #[n(3)]
    pub cancelled_orders: u64,
    #[n(4)]
    pub avg_rating: f64,
    #[n(5)]
    pub rating_count: u64,
    #[n(6)]
    pub on_time_delivery_rate: f64,
    #[n(7)]
    pub avg_response_time_minutes: f64,
    #[n(8)]
    pub updated_at: TimeStamp<Utc>,
}

impl SellerMetrics {
    pub fn empty(seller_id: &str) -> Self {
        Self {
            seller_id: seller_id.to_string(),
            total_orders: 0,
            completed_orders: 0,
            cancelled_orders: 0,
            avg_rating: 0.0,
            rating_count: 0,
            on_time_delivery_rate: 0.0,
            avg_response_time_minutes: 0.0,
            updated_at: TimeStamp::new(),
        }
    }
}

/// Counters are only ever changed inside a sled transaction, so concurrent
/// outcomes for one seller serialize instead of overwriting each other.
#[derive(Clone)]
pub struct SellerMetricsAggregator {
    tree: Tree,
}

impl SellerMetricsAggregator {
    pub fn new(tree: Tree) -> Self {
        Self { tree }
    }

    /// Counters for `seller_id`, all zero when nothing was recorded yet.
    pub fn get(&self, seller_id: &str) -> Result<SellerMetrics> {
        match self.tree.get(seller_id.as_bytes())? {
            Some(bytes) => decode(&bytes),
            None => Ok(SellerMetrics::empty(seller_id)),
        }
    }

    pub fn record_outcome(&self, seller_id: &str, outcome: Outcome) -> Result<SellerMetrics> {
        Ok(self
            .tree
            .transaction(|tx| Self::record_in(tx, seller_id, outcome))?)
    }

    pub fn record_rating(&self, seller_id: &str, rating: u8) -> Result<SellerMetrics> {
        if !(1..=5).contains(&rating) {
            return Err(ValidationError::RatingOutOfRange(rating).into());
        }
        Ok(self
            .tree
            .transaction(|tx| Self::rate_in(tx, seller_id, rating))?)
    }

    pub(crate) fn rate_in(
        tx: &TransactionalTree,
        seller_id: &str,
        rating: u8,
    ) -> ConflictableTransactionResult<SellerMetrics, MarketError> {
        let mut metrics = Self::load_in(tx, seller_id)?;

        let sum = metrics.avg_rating * metrics.rating_count as f64 + f64::from(rating);
        metrics.rating_count += 1;
        metrics.avg_rating = sum / metrics.rating_count as f64;
        metrics.updated_at = TimeStamp::new();
        tx.insert(seller_id.as_bytes(), encode(&metrics)?)?;

        Ok(metrics)
    }

    pub(crate) fn record_in(
        tx: &TransactionalTree,
        seller_id: &str,
        outcome: Outcome,
    ) -> ConflictableTransactionResult<SellerMetrics, MarketError> {
        let mut metrics = Self::load_in(tx, seller_id)?;

        metrics.total_orders += 1;
        match outcome {
            Outcome::Completed => metrics.completed_orders += 1,
            Outcome::Cancelled => metrics.cancelled_orders += 1,
        }
        metrics.updated_at = TimeStamp::new();
        tx.insert(seller_id.as_bytes(), encode(&metrics)?)?;

        debug!(
            seller_id,
            ?outcome,
            total = metrics.total_orders,
            "seller metrics updated"
        );
        Ok(metrics)
    }

    fn load_in(
        tx: &TransactionalTree,
        seller_id: &str,
    ) -> ConflictableTransactionResult<SellerMetrics, MarketError> {
        match tx.get(seller_id.as_bytes())? {
            Some(bytes) => Ok(decode(&bytes)?),
            None => Ok(SellerMetrics::empty(seller_id)),
        }
    }
}
