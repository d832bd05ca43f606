//! Pub/sub client contracts and the at-least-once lease engine.
//!
//! Three delivery contracts are exposed over an abstract [`BrokerBackend`]:
//!
//! - [`Publisher`]: fire-and-forget send to a topic bound at construction
//! - [`AtMostOnceSubscriber`]: best-effort streaming, no state
//! - [`AtLeastOnceSubscriber`]: leased delivery with explicit ack and
//!   deadline extension
//!
//! The lease engine ([`lease`]) keeps one lease per in-flight message,
//! redelivers expired leases through the backend and drops messages that
//! exceed their redelivery budget as poison.
//!
//! All subscribers spawn tokio tasks; `start` must be called from within a
//! runtime. Cancellation is driven by a [`CancellationToken`].

pub mod at_most_once;
pub mod backend;
pub mod contract;
pub mod in_memory;
pub mod lease;
pub mod publisher;
mod reporter;
pub mod subscriber;

pub use at_most_once::StreamSubscriber;
pub use backend::{BrokerBackend, RawMessage, ReceiveStream};
pub use contract::{AtLeastOnceMessage, AtLeastOnceSubscriber, AtMostOnceSubscriber, Publisher};
pub use in_memory::{BrokerCalls, InMemoryBackend, InMemoryBroker};
pub use lease::{LeaseSnapshot, LeaseState, LeaseTable, MessageHandle};
pub use publisher::TopicPublisher;
pub use subscriber::LeaseSubscriber;

pub use leasebus_core::{
    BackendError, ConfigError, LeaseError, MessageId, PubSubError, PubSubResult,
    SubscriberConfig,
};
pub use tokio_util::sync::CancellationToken;
