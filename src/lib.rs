pub mod config;
pub mod error;
pub mod files;
pub mod ledger;
pub mod metrics;
pub mod notify;
pub mod order;
pub mod outbox;
pub mod profile;
pub mod service;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod utils;

pub use error::{ErrorKind, MarketError, ValidationError};
pub use service::{DisputeOutcome, OrderService};
