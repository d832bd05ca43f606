//! Topic-bound publisher.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use leasebus_core::{PubSubError, PubSubResult};

use crate::backend::BrokerBackend;
use crate::contract::Publisher;

/// Publishes JSON-encoded messages to one topic.
#[derive(Debug, Clone)]
pub struct TopicPublisher<B> {
    backend: Arc<B>,
    topic: String,
}

impl<B: BrokerBackend> TopicPublisher<B> {
    pub fn new(backend: B, topic: impl Into<String>) -> Self {
        Self::from_shared(Arc::new(backend), topic)
    }

    pub fn from_shared(backend: Arc<B>, topic: impl Into<String>) -> Self {
        Self {
            backend,
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publish an already-encoded payload.
    #[instrument(skip(self, ctx, payload), fields(topic = %self.topic, len = payload.len()), err)]
    pub async fn publish_bytes(
        &self,
        ctx: &CancellationToken,
        payload: Vec<u8>,
    ) -> PubSubResult<()> {
        if ctx.is_cancelled() {
            return Err(PubSubError::Cancelled);
        }

        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(PubSubError::Cancelled),
            res = self.backend.publish(&self.topic, payload) => res.map_err(PubSubError::from),
        }
    }
}

#[async_trait]
impl<B, M> Publisher<M> for TopicPublisher<B>
where
    B: BrokerBackend,
    M: Serialize + Send + 'static,
{
    async fn publish(&self, ctx: &CancellationToken, message: M) -> PubSubResult<()> {
        let payload = serde_json::to_vec(&message)?;
        self.publish_bytes(ctx, payload).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde::Serialize;
    use serde::ser::Error as _;

    use super::*;
    use crate::in_memory::InMemoryBroker;

    #[derive(Debug, Serialize)]
    struct OrderPlaced {
        order_id: u64,
    }

    struct Unencodable;

    impl Serialize for Unencodable {
        fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(S::Error::custom("refusing to encode"))
        }
    }

    #[tokio::test]
    async fn publish_encodes_json_to_bound_topic() {
        let broker = InMemoryBroker::new();
        let publisher = TopicPublisher::new(broker.backend("orders"), "orders");
        let ctx = CancellationToken::new();

        publisher
            .publish(&ctx, OrderPlaced { order_id: 7 })
            .await
            .unwrap();

        assert_eq!(broker.depth("orders"), 1);
        assert_eq!(broker.depth("invoices"), 0);
        assert_eq!(broker.calls().publishes, 1);
    }

    #[tokio::test]
    async fn encode_failure_is_a_serialization_error() {
        let broker = InMemoryBroker::new();
        let publisher = TopicPublisher::new(broker.backend("orders"), "orders");
        let ctx = CancellationToken::new();

        let err = publisher.publish(&ctx, Unencodable).await.unwrap_err();

        assert!(matches!(err, PubSubError::Serialization(_)));
        assert_eq!(broker.depth("orders"), 0);
    }

    #[tokio::test]
    async fn cancelled_context_is_not_published() {
        let broker = InMemoryBroker::new();
        let publisher = TopicPublisher::new(broker.backend("orders"), "orders");
        let ctx = CancellationToken::new();
        ctx.cancel();

        let err = publisher
            .publish(&ctx, BTreeMap::from([("k", "v")]))
            .await
            .unwrap_err();

        assert_eq!(err, PubSubError::Cancelled);
        assert_eq!(broker.calls().publishes, 0);
    }

    #[tokio::test]
    async fn transport_failure_is_wrapped() {
        let broker = InMemoryBroker::new();
        broker.fail_next_publishes(1);
        let publisher = TopicPublisher::new(broker.backend("orders"), "orders");
        let ctx = CancellationToken::new();

        let err = publisher.publish_bytes(&ctx, b"x".to_vec()).await.unwrap_err();

        assert!(matches!(err, PubSubError::Transport { fatal: false, .. }));
    }
}
