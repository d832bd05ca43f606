//! `leasebus-core`: shared building blocks for the pub/sub client.
//!
//! This crate contains **pure** primitives (no I/O, no async): identifiers,
//! the error taxonomy and subscriber configuration.

pub mod config;
pub mod error;
pub mod id;

pub use config::{ConfigError, SubscriberConfig};
pub use error::{BackendError, LeaseError, PubSubError, PubSubResult};
pub use id::MessageId;
