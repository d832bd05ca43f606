//! Broker backend capability.
//!
//! A `BrokerBackend` is the **transport layer**: everything that talks to a
//! real broker (network, wire encoding, broker-side retry/backoff) lives behind
//! this trait. The lease engine is generic over it and never depends on a
//! specific transport.
//!
//! ```text
//! Publisher ──publish──▶ BrokerBackend ──receive──▶ Delivery Pump ──▶ consumers
//!                             ▲                                         │
//!                             └──── delete / extend / make_visible ◀────┘
//! ```
//!
//! ## Contract
//!
//! - `receive` yields messages until the context is cancelled or the broker
//!   connection is lost for good. A message that is not deleted must
//!   eventually reappear (the broker's visibility timeout).
//! - Per-message decode failures are yielded as `BackendError::Serialization`
//!   and must not end the stream.
//! - A fatal `BackendError::Transport` ends the subscription; the backend
//!   should only yield one after its own retry policy gave up.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;

use leasebus_core::{BackendError, MessageId};

/// Message as received from the broker, before any lease exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub id: MessageId,
    pub payload: Vec<u8>,
    /// Broker-suggested ack window for this delivery, if it has one.
    pub deadline_hint: Option<Duration>,
}

impl RawMessage {
    pub fn new(id: impl Into<MessageId>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
            deadline_hint: None,
        }
    }

    pub fn with_deadline_hint(mut self, hint: Duration) -> Self {
        self.deadline_hint = Some(hint);
        self
    }
}

/// Stream of received messages (or per-message / fatal failures).
pub type ReceiveStream = Pin<Box<dyn Stream<Item = Result<RawMessage, BackendError>> + Send>>;

#[async_trait]
pub trait BrokerBackend: Send + Sync + 'static {
    /// Hand a payload to the broker. Returns once the broker accepted it.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BackendError>;

    /// Start receiving. The stream ends when `ctx` is cancelled.
    fn receive(&self, ctx: CancellationToken) -> ReceiveStream;

    /// Remove a message for good (acknowledgment).
    async fn delete(&self, id: &MessageId) -> Result<(), BackendError>;

    /// Keep a message hidden from other consumers for `duration` from now.
    async fn extend_visibility(&self, id: &MessageId, duration: Duration)
    -> Result<(), BackendError>;

    /// Make a message deliverable again (negative acknowledgment).
    async fn make_visible_again(&self, id: &MessageId) -> Result<(), BackendError>;

    /// Park a message that exceeded its redelivery budget.
    ///
    /// Backends without a dead-letter destination simply delete it.
    async fn dead_letter(
        &self,
        id: &MessageId,
        payload: &[u8],
        delivery_count: u32,
    ) -> Result<(), BackendError> {
        let _ = (payload, delivery_count);
        self.delete(id).await
    }
}

#[async_trait]
impl<B> BrokerBackend for Arc<B>
where
    B: BrokerBackend + ?Sized,
{
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BackendError> {
        (**self).publish(topic, payload).await
    }

    fn receive(&self, ctx: CancellationToken) -> ReceiveStream {
        (**self).receive(ctx)
    }

    async fn delete(&self, id: &MessageId) -> Result<(), BackendError> {
        (**self).delete(id).await
    }

    async fn extend_visibility(
        &self,
        id: &MessageId,
        duration: Duration,
    ) -> Result<(), BackendError> {
        (**self).extend_visibility(id, duration).await
    }

    async fn make_visible_again(&self, id: &MessageId) -> Result<(), BackendError> {
        (**self).make_visible_again(id).await
    }

    async fn dead_letter(
        &self,
        id: &MessageId,
        payload: &[u8],
        delivery_count: u32,
    ) -> Result<(), BackendError> {
        (**self).dead_letter(id, payload, delivery_count).await
    }
}
