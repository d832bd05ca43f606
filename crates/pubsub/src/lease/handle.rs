use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use leasebus_core::{MessageId, PubSubError, PubSubResult};

use crate::contract::AtLeastOnceMessage;
use crate::lease::coordinator::LeaseControl;

/// A leased message handed to a consumer.
///
/// Ack and extend go through the subscription's coordinator, bound to the
/// subscription's context: once the subscription is cancelled they fail with
/// `Cancelled`; once the lease is acked or dropped they fail with `NotFound`.
#[derive(Clone)]
pub struct MessageHandle {
    message_id: MessageId,
    payload: Arc<[u8]>,
    delivery_count: u32,
    control: Arc<dyn LeaseControl>,
    ctx: CancellationToken,
}

impl MessageHandle {
    pub(crate) fn new(
        message_id: MessageId,
        payload: Arc<[u8]>,
        delivery_count: u32,
        control: Arc<dyn LeaseControl>,
        ctx: CancellationToken,
    ) -> Self {
        Self {
            message_id,
            payload,
            delivery_count,
            control,
            ctx,
        }
    }

    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    pub fn message(&self) -> &[u8] {
        &self.payload
    }

    /// 1 on first delivery, +1 for every redelivery after an expired lease.
    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    /// Decode the JSON payload.
    pub fn decode<T: DeserializeOwned>(&self) -> PubSubResult<T> {
        serde_json::from_slice(&self.payload).map_err(PubSubError::from)
    }

    pub async fn ack(&self) -> PubSubResult<()> {
        self.control.ack(&self.ctx, &self.message_id).await
    }

    pub async fn extend_ack_deadline(&self, duration: Duration) -> PubSubResult<()> {
        self.control
            .extend(&self.ctx, &self.message_id, duration)
            .await
    }
}

impl core::fmt::Debug for MessageHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MessageHandle")
            .field("message_id", &self.message_id)
            .field("len", &self.payload.len())
            .field("delivery_count", &self.delivery_count)
            .finish()
    }
}

#[async_trait]
impl AtLeastOnceMessage for MessageHandle {
    fn message_id(&self) -> &MessageId {
        MessageHandle::message_id(self)
    }

    fn message(&self) -> &[u8] {
        MessageHandle::message(self)
    }

    async fn extend_ack_deadline(&self, duration: Duration) -> PubSubResult<()> {
        MessageHandle::extend_ack_deadline(self, duration).await
    }

    async fn ack(&self) -> PubSubResult<()> {
        MessageHandle::ack(self).await
    }
}
