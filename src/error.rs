use rust_decimal::Decimal;
use sled::transaction::{ConflictableTransactionError, TransactionError};

use crate::ledger::EscrowStatus;
use crate::order::OrderStatus;

#[derive(thiserror::Error, Debug)]
pub enum ValidationError {
    #[error("Price must be greater than zero, got {0}")]
    NonPositivePrice(Decimal),
    #[error("Buyer and seller must be different users")]
    SelfPurchase,
    #[error("{0} must not be blank")]
    Blank(&'static str),
    #[error("Rating must be between 1 and 5, got {0}")]
    RatingOutOfRange(u8),
    #[error("Invalid file name: {0:?}")]
    InvalidFileName(String),
    #[error("Uploaded file is empty")]
    EmptyFile,
    #[error("User {0} is not a participant of this order")]
    NotParticipant(String),
    #[error("A user cannot follow themselves")]
    SelfFollow,
}

#[derive(thiserror::Error, Debug)]
pub enum MarketError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("Order cannot move from {from} to {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },
    #[error("Escrow for order {order_id} is already {status}")]
    InvalidState {
        order_id: String,
        status: EscrowStatus,
    },
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflicting write: {0}")]
    Conflict(String),
    #[error("Storage error: {0}")]
    Persistence(#[from] sled::Error),
    #[error("External service error: {0:#}")]
    Io(anyhow::Error),
    #[error("Partial failure: {0}")]
    PartialFailure(String),
    #[error("Failed to encode record: {0}")]
    Encode(#[from] minicbor::encode::Error<std::convert::Infallible>),
    #[error("Failed to decode record: {0}")]
    Decode(#[from] minicbor::decode::Error),
}

/// How a caller should react to a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input, show the message and let the user fix it
    Validation,
    /// The request is well formed but not allowed in the current state
    Rejected,
    /// Transient, the same call may succeed later
    Retryable,
    /// Stored data is unreadable; retrying will not help
    Fatal,
}

impl MarketError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MarketError::Validation(_) => ErrorKind::Validation,
            MarketError::InvalidTransition { .. }
            | MarketError::InvalidState { .. }
            | MarketError::NotFound(_) => ErrorKind::Rejected,
            MarketError::Conflict(_)
            | MarketError::Persistence(_)
            | MarketError::Io(_)
            | MarketError::PartialFailure(_) => ErrorKind::Retryable,
            MarketError::Encode(_) | MarketError::Decode(_) => ErrorKind::Fatal,
        }
    }
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Retryable
    }
}

impl From<TransactionError<MarketError>> for MarketError {
    fn from(value: TransactionError<MarketError>) -> Self {
        match value {
            TransactionError::Abort(err) => err,
            TransactionError::Storage(err) => MarketError::Persistence(err),
        }
    }
}

// lets `?` abort a sled transaction with a domain error
impl From<MarketError> for ConflictableTransactionError<MarketError> {
    fn from(value: MarketError) -> Self {
        ConflictableTransactionError::Abort(value)
    }
}

impl From<ValidationError> for ConflictableTransactionError<MarketError> {
    fn from(value: ValidationError) -> Self {
        ConflictableTransactionError::Abort(value.into())
    }
}

pub type Result<T, E = MarketError> = std::result::Result<T, E>;
