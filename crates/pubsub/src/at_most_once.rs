//! At-most-once subscriber: pure streaming, no lease state.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use leasebus_core::{ConfigError, PubSubError, SubscriberConfig};

use crate::backend::BrokerBackend;
use crate::contract::AtMostOnceSubscriber;
use crate::reporter::ErrorReporter;

const NAME: &str = "at-most-once";

/// Streams raw payloads, deleting each message as soon as it is received.
///
/// If the delete fails the message is dropped (and the failure reported)
/// rather than forwarded, so a message is never handed out twice. Anything
/// not yet read when the consumer stops is lost.
#[derive(Debug, Clone)]
pub struct StreamSubscriber<B> {
    backend: Arc<B>,
    delivery_capacity: usize,
    error_capacity: usize,
}

impl<B: BrokerBackend> StreamSubscriber<B> {
    /// Only the channel capacities of `config` apply; there are no leases.
    pub fn new(backend: B, config: &SubscriberConfig) -> Result<Self, ConfigError> {
        if config.delivery_capacity == 0 || config.error_capacity == 0 {
            return Err(ConfigError::Invalid("channel capacities must be non-zero".into()));
        }
        Ok(Self {
            backend: Arc::new(backend),
            delivery_capacity: config.delivery_capacity,
            error_capacity: config.error_capacity,
        })
    }
}

impl<B: BrokerBackend> AtMostOnceSubscriber for StreamSubscriber<B> {
    fn start(
        &self,
        ctx: &CancellationToken,
    ) -> (mpsc::Receiver<Vec<u8>>, mpsc::Receiver<PubSubError>) {
        let (tx, rx) = mpsc::channel(self.delivery_capacity);
        let (reporter, errors) = ErrorReporter::channel(NAME, self.error_capacity);

        let backend = self.backend.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            stream_loop(backend, ctx, tx, reporter).await;
        });

        (rx, errors)
    }
}

async fn stream_loop<B: BrokerBackend>(
    backend: Arc<B>,
    ctx: CancellationToken,
    tx: mpsc::Sender<Vec<u8>>,
    reporter: ErrorReporter,
) {
    let mut stream = backend.receive(ctx.clone());
    info!(subscriber = NAME, "subscription started");

    loop {
        let next = tokio::select! {
            biased;
            _ = ctx.cancelled() => break,
            next = stream.next() => next,
        };

        let raw = match next {
            None => break,
            Some(Ok(raw)) => raw,
            Some(Err(err)) if err.is_fatal() => {
                error!(subscriber = NAME, error = %err, "backend connection lost; stopping subscription");
                reporter.report_reliably(&ctx, err.into()).await;
                break;
            }
            Some(Err(err)) => {
                warn!(subscriber = NAME, error = %err, "receive failed; skipping");
                reporter.report(err.into());
                continue;
            }
        };

        let deleted = tokio::select! {
            biased;
            _ = ctx.cancelled() => break,
            res = backend.delete(&raw.id) => res,
        };
        if let Err(err) = deleted {
            warn!(subscriber = NAME, message_id = %raw.id, error = %err, "delete on receive failed; dropping message");
            reporter.report(err.into());
            continue;
        }

        debug!(subscriber = NAME, message_id = %raw.id, "message received");
        let sent = tokio::select! {
            biased;
            _ = ctx.cancelled() => break,
            res = tx.send(raw.payload) => res,
        };
        if sent.is_err() {
            break;
        }
    }

    info!(subscriber = NAME, "subscription stopped");
}
