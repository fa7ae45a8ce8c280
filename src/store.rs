//! sled-backed persistence
//!
//! | Tree             | Key                                   | Value              |
//! |------------------|---------------------------------------|--------------------|
//! | `orders`         | order id                              | `Order`            |
//! | `transactions`   | order id (1:1 with the order)         | `Transaction`      |
//! | `seller_metrics` | seller id                             | `SellerMetrics`    |
//! | `order_files`    | order id, 0, file name, 0, version BE | `OrderFile`        |
//! | `file_latest`    | order id, 0, file name                | latest version BE  |
//! | `file_sequence`  | order id, 0, file name                | last reserved BE   |
//! | `outbox`         | uuid7 bytes                           | `OutboxEntry`      |
//! | `dead_letters`   | uuid7 bytes                           | `OutboxEntry`      |
//! | `reviews`        | order id                              | rating (one byte)  |
//! | `follows`        | follower, 0, target                   | empty              |
//! | `followers`      | target, 0, follower                   | empty              |
//!
//! Rows are CBOR. Every multi-row change goes through a sled transaction.
use sled::{Db, Tree};

use crate::error::{MarketError, Result};

#[derive(Clone)]
pub struct Store {
    db: Db,
    pub(crate) orders: Tree,
    pub(crate) transactions: Tree,
    pub(crate) metrics: Tree,
    pub(crate) files: Tree,
    pub(crate) file_latest: Tree,
    pub(crate) file_sequence: Tree,
    pub(crate) outbox: Tree,
    pub(crate) dead_letters: Tree,
    pub(crate) reviews: Tree,
    pub(crate) follows: Tree,
    pub(crate) followers: Tree,
}

impl Store {
    pub fn new(db: &Db) -> Result<Self> {
        Ok(Self {
            db: db.clone(),
            orders: db.open_tree("orders")?,
            transactions: db.open_tree("transactions")?,
            metrics: db.open_tree("seller_metrics")?,
            files: db.open_tree("order_files")?,
            file_latest: db.open_tree("file_latest")?,
            file_sequence: db.open_tree("file_sequence")?,
            outbox: db.open_tree("outbox")?,
            dead_letters: db.open_tree("dead_letters")?,
            reviews: db.open_tree("reviews")?,
            follows: db.open_tree("follows")?,
            followers: db.open_tree("followers")?,
        })
    }

    pub fn flush(&self) -> Result<usize> {
        Ok(self.db.flush()?)
    }
}

pub(crate) fn encode<T: minicbor::Encode<()>>(value: &T) -> Result<Vec<u8>> {
    Ok(minicbor::to_vec(value)?)
}

pub(crate) fn decode<T>(bytes: &[u8]) -> Result<T>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    Ok(minicbor::decode(bytes)?)
}

pub(crate) fn decode_u64(bytes: &[u8]) -> Result<u64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| MarketError::Decode(minicbor::decode::Error::message("expected 8 byte counter")))?;
    Ok(u64::from_be_bytes(raw))
}

/// Joins key parts with a NUL separator. Parts must not contain NUL.
pub(crate) fn compound_key(parts: &[&str]) -> Vec<u8> {
    let mut key = Vec::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            key.push(0);
        }
        key.extend_from_slice(part.as_bytes());
    }
    key
}

/// Prefix matching every key that starts with `parts` followed by a separator.
pub(crate) fn compound_prefix(parts: &[&str]) -> Vec<u8> {
    let mut key = compound_key(parts);
    key.push(0);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_does_not_match_longer_names() {
        let prefix = compound_prefix(&["order", "a.png"]);
        let same = compound_key(&["order", "a.png", "1"]);
        let other = compound_key(&["order", "a.png.bak", "1"]);

        assert!(same.starts_with(&prefix));
        assert!(!other.starts_with(&prefix));
    }

    #[test]
    fn counter_round_trip_rejects_short_input() {
        assert_eq!(decode_u64(&7u64.to_be_bytes()).unwrap(), 7);
        assert!(decode_u64(&[1, 2, 3]).is_err());
    }
}
