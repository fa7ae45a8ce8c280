//! Orders and the status transition table
use std::fmt;

use chrono::Utc;

use crate::error::{MarketError, Result, ValidationError};
use crate::types::{Price, TimeStamp};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrderStatus {
    #[n(0)]
    Incomplete,
    #[n(1)]
    Active,
    #[n(2)]
    Delivered,
    #[n(3)]
    InRevision,
    #[n(4)]
    Completed,
    #[n(5)]
    Cancelled,
    #[n(6)]
    Disputed,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 7] = [
        OrderStatus::Incomplete,
        OrderStatus::Active,
        OrderStatus::Delivered,
        OrderStatus::InRevision,
        OrderStatus::Completed,
        OrderStatus::Cancelled,
        OrderStatus::Disputed,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Completed | OrderStatus::Cancelled)
    }

    /// The only place that decides which moves are legal.
    pub fn can_transition_to(&self, to: OrderStatus) -> bool {
        use OrderStatus::*;

        matches!(
            (self, to),
            (Incomplete, Active | Disputed | Cancelled)
                | (Active, Delivered | Disputed | Cancelled)
                | (Delivered, InRevision | Completed | Disputed)
                | (InRevision, Delivered | Disputed)
                | (Disputed, Active | Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Incomplete => "incomplete",
            OrderStatus::Active => "active",
            OrderStatus::Delivered => "delivered",
            OrderStatus::InRevision => "in_revision",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Disputed => "disputed",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Order {
    #[n(0)]
    pub id: String, // uuid7, bech32 with an `order_` prefix
    #[n(1)]
    pub buyer_id: String,
    #[n(2)]
    pub seller_id: String,
    #[n(3)]
    pub service_id: Option<String>,
    #[n(4)]
    pub tier_id: Option<String>,
    #[n(5)]
    pub status: OrderStatus,
    #[n(6)]
    pub price: Price,
    #[n(7)]
    pub requirements: Option<String>,
    #[n(8)]
    pub dispute_reason: Option<String>,
    #[n(9)]
    pub is_paused: bool,
    #[n(10)]
    pub created_at: TimeStamp<Utc>,
    #[n(11)]
    pub updated_at: TimeStamp<Utc>,
    #[n(12)]
    pub completed_at: Option<TimeStamp<Utc>>,
}

impl Order {
    /// Move to `to`, keeping `is_paused` and `completed_at` in step with the status.
    pub fn apply_transition(&mut self, to: OrderStatus, now: TimeStamp<Utc>) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(MarketError::InvalidTransition {
                from: self.status,
                to,
            });
        }

        self.status = to;
        self.is_paused = to == OrderStatus::Disputed;
        if to == OrderStatus::Completed {
            self.completed_at = Some(now.clone());
        }
        self.updated_at = now;

        Ok(())
    }

    pub fn is_participant(&self, user_id: &str) -> bool {
        self.buyer_id == user_id || self.seller_id == user_id
    }

    /// The other side of the order, if `user_id` takes part in it.
    pub fn counterparty(&self, user_id: &str) -> Option<&str> {
        if self.buyer_id == user_id {
            Some(&self.seller_id)
        } else if self.seller_id == user_id {
            Some(&self.buyer_id)
        } else {
            None
        }
    }

    pub fn link(&self) -> String {
        format!("/orders/{}", self.id)
    }
}

/// Input for a purchase. Built up like a draft, then validated once.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub buyer_id: String,
    pub seller_id: String,
    pub price: Price,
    pub service_id: Option<String>,
    pub tier_id: Option<String>,
    pub requirements: Option<String>,
}

impl NewOrder {
    pub fn new(buyer_id: impl Into<String>, seller_id: impl Into<String>, price: Price) -> Self {
        Self {
            buyer_id: buyer_id.into(),
            seller_id: seller_id.into(),
            price,
            service_id: None,
            tier_id: None,
            requirements: None,
        }
    }
    pub fn set_service(mut self, service_id: impl Into<String>) -> Self {
        self.service_id = Some(service_id.into());
        self
    }
    pub fn set_tier(mut self, tier_id: impl Into<String>) -> Self {
        self.tier_id = Some(tier_id.into());
        self
    }
    pub fn set_requirements(mut self, requirements: impl Into<String>) -> Self {
        self.requirements = Some(requirements.into());
        self
    }

    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        if self.buyer_id.trim().is_empty() {
            return Err(ValidationError::Blank("buyer id"));
        }
        if self.seller_id.trim().is_empty() {
            return Err(ValidationError::Blank("seller id"));
        }
        if self.buyer_id == self.seller_id {
            return Err(ValidationError::SelfPurchase);
        }
        Ok(())
    }

    /// Orders without requirements wait in `incomplete` until the buyer sends them.
    pub fn initial_status(&self) -> OrderStatus {
        match self.requirements.as_deref().map(str::trim) {
            Some(text) if !text.is_empty() => OrderStatus::Active,
            _ => OrderStatus::Incomplete,
        }
    }

    pub fn into_order(self, id: String, now: TimeStamp<Utc>) -> Order {
        let status = self.initial_status();
        let requirements = self.requirements.filter(|text| !text.trim().is_empty());

        Order {
            id,
            buyer_id: self.buyer_id,
            seller_id: self.seller_id,
            service_id: self.service_id,
            tier_id: self.tier_id,
            status,
            price: self.price,
            requirements,
            dispute_reason: None,
            is_paused: false,
            created_at: now.clone(),
            updated_at: now,
            completed_at: None,
        }
    }
}
