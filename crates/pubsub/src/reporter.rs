//! Error channel writer shared by the subscriber tasks.

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use leasebus_core::PubSubError;

/// Sending half of a subscriber's error channel.
///
/// Ordinary reports never block: when the consumer falls behind and the buffer
/// is full, the report is logged and dropped so delivery keeps flowing.
/// Reports that must arrive exactly once (poison, fatal) use
/// [`ErrorReporter::report_reliably`], which waits for room.
#[derive(Debug, Clone)]
pub(crate) struct ErrorReporter {
    tx: mpsc::Sender<PubSubError>,
    subscriber: &'static str,
}

impl ErrorReporter {
    pub(crate) fn channel(
        subscriber: &'static str,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<PubSubError>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx, subscriber }, rx)
    }

    pub(crate) fn report(&self, err: PubSubError) {
        match self.tx.try_send(err) {
            Ok(()) => {}
            Err(TrySendError::Full(err)) => {
                warn!(subscriber = self.subscriber, error = %err, "error channel full; report dropped");
            }
            Err(TrySendError::Closed(err)) => {
                debug!(subscriber = self.subscriber, error = %err, "error channel closed; report dropped");
            }
        }
    }

    /// Wait for buffer space, giving up only if `ctx` is cancelled first.
    pub(crate) async fn report_reliably(&self, ctx: &CancellationToken, err: PubSubError) {
        tokio::select! {
            biased;
            res = self.tx.send(err) => {
                if let Err(mpsc::error::SendError(err)) = res {
                    debug!(subscriber = self.subscriber, error = %err, "error channel closed; report dropped");
                }
            }
            _ = ctx.cancelled() => {
                debug!(subscriber = self.subscriber, "cancelled while reporting error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn full_channel_drops_instead_of_blocking() {
        let (reporter, mut rx) = ErrorReporter::channel("test", 1);

        reporter.report(PubSubError::Cancelled);
        reporter.report(PubSubError::serialization("second"));

        assert_eq!(rx.recv().await, Some(PubSubError::Cancelled));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn reliable_report_gives_up_on_cancellation() {
        let (reporter, mut rx) = ErrorReporter::channel("test", 1);
        let ctx = CancellationToken::new();

        reporter.report(PubSubError::Cancelled);
        ctx.cancel();
        reporter
            .report_reliably(&ctx, PubSubError::serialization("blocked"))
            .await;

        assert_eq!(rx.recv().await, Some(PubSubError::Cancelled));
        assert!(rx.try_recv().is_err());
    }
}
