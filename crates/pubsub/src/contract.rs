//! Client-facing delivery contracts.
//!
//! These traits are the transport-agnostic surface applications code
//! against; [`crate::TopicPublisher`], [`crate::StreamSubscriber`] and
//! [`crate::LeaseSubscriber`] implement them over any
//! [`crate::BrokerBackend`].
//!
//! ## Delivery guarantees
//!
//! - **At-most-once**: a message is handed out at most once and lost if the
//!   consumer crashes before processing it.
//! - **At-least-once**: a message stays leased until acked; an expired lease
//!   is redelivered, so consumers must be idempotent.
//!
//! Neither contract orders messages relative to each other.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::Receiver;
use tokio_util::sync::CancellationToken;

use leasebus_core::{MessageId, PubSubError, PubSubResult};

/// Sends messages to a topic known at construction.
#[async_trait]
pub trait Publisher<M>: Send + Sync {
    /// Returns once the broker accepted the message. No retry is attempted.
    async fn publish(&self, ctx: &CancellationToken, message: M) -> PubSubResult<()>;
}

#[async_trait]
impl<M, P> Publisher<M> for Arc<P>
where
    M: Send + 'static,
    P: Publisher<M> + ?Sized,
{
    async fn publish(&self, ctx: &CancellationToken, message: M) -> PubSubResult<()> {
        (**self).publish(ctx, message).await
    }
}

/// Best-effort streaming subscriber.
pub trait AtMostOnceSubscriber: Send + Sync {
    /// Start receiving raw payloads.
    ///
    /// Both channels close when `ctx` is cancelled or the backend stream ends;
    /// a fatal transport error is reported once before closure.
    fn start(&self, ctx: &CancellationToken) -> (Receiver<Vec<u8>>, Receiver<PubSubError>);
}

/// Leased-delivery subscriber with explicit acknowledgment.
#[async_trait]
pub trait AtLeastOnceSubscriber: Send + Sync {
    type Message: AtLeastOnceMessage;

    /// Start receiving leased messages.
    fn start(&self, ctx: &CancellationToken) -> (Receiver<Self::Message>, Receiver<PubSubError>);

    /// Delete the message from its queue. `NotFound` if it is not outstanding.
    async fn ack_message(&self, ctx: &CancellationToken, id: &MessageId) -> PubSubResult<()>;

    /// Postpone redelivery of an in-flight message by `duration` from now.
    async fn extend_ack_deadline(
        &self,
        ctx: &CancellationToken,
        id: &MessageId,
        duration: Duration,
    ) -> PubSubResult<()>;
}

/// A message delivered with at-least-once semantics.
#[async_trait]
pub trait AtLeastOnceMessage: Send + Sync {
    /// Stable identifier; usable with the subscriber's ack / extend calls.
    fn message_id(&self) -> &MessageId;

    fn message(&self) -> &[u8];

    /// Call when processing takes longer than the current ack window.
    async fn extend_ack_deadline(&self, duration: Duration) -> PubSubResult<()>;

    /// Signal that the message was processed and may be deleted.
    async fn ack(&self) -> PubSubResult<()>;
}
