//! Ack coordinator: applies Ack / ExtendAckDeadline against the lease table
//! and performs the matching backend call.
//!
//! Each request follows the same shape:
//!
//! 1. reserve the transition in the table (short critical section)
//! 2. release the lock and call the backend, racing the caller's context
//! 3. finalize on success, roll back on failure or cancellation
//!
//! The lock is never held across backend I/O, so a slow broker cannot stall
//! the delivery pump or the deadline monitor.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use leasebus_core::{MessageId, PubSubError, PubSubResult};

use crate::backend::BrokerBackend;
use crate::lease::table::{Extension, LeaseTable};

/// Ack / extend operations, independent of the backend type.
///
/// Message handles hold this as a trait object so they stay non-generic.
#[async_trait]
pub(crate) trait LeaseControl: Send + Sync {
    async fn ack(&self, ctx: &CancellationToken, id: &MessageId) -> PubSubResult<()>;

    async fn extend(
        &self,
        ctx: &CancellationToken,
        id: &MessageId,
        duration: Duration,
    ) -> PubSubResult<()>;
}

#[derive(Debug)]
pub(crate) struct AckCoordinator<B> {
    table: Arc<LeaseTable>,
    backend: Arc<B>,
}

impl<B: BrokerBackend> AckCoordinator<B> {
    pub(crate) fn new(table: Arc<LeaseTable>, backend: Arc<B>) -> Self {
        Self { table, backend }
    }

    pub(crate) async fn ack_message(
        &self,
        ctx: &CancellationToken,
        id: &MessageId,
    ) -> PubSubResult<()> {
        if ctx.is_cancelled() {
            return Err(PubSubError::Cancelled);
        }

        let reservation = self.table.reserve_ack(id)?;

        let outcome = tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(PubSubError::Cancelled),
            res = self.backend.delete(id) => res.map_err(PubSubError::from),
        };

        match outcome {
            Ok(()) => {
                self.table.finalize_ack(reservation);
                debug!(message_id = %id, "lease acked");
                Ok(())
            }
            Err(err) => {
                self.table.rollback_ack(reservation);
                warn!(message_id = %id, error = %err, "ack failed; lease restored");
                Err(err)
            }
        }
    }

    pub(crate) async fn extend_ack_deadline(
        &self,
        ctx: &CancellationToken,
        id: &MessageId,
        duration: Duration,
    ) -> PubSubResult<()> {
        if ctx.is_cancelled() {
            return Err(PubSubError::Cancelled);
        }

        let (previous, installed) = match self.table.extend(id, Instant::now(), duration)? {
            Extension::Unchanged => return Ok(()),
            Extension::Extended {
                previous,
                installed,
            } => (previous, installed),
        };

        let outcome = tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(PubSubError::Cancelled),
            res = self.backend.extend_visibility(id, duration) => res.map_err(PubSubError::from),
        };

        if let Err(err) = outcome {
            self.table.rollback_extend(id, previous, installed);
            warn!(message_id = %id, error = %err, "deadline extension failed; previous deadline restored");
            return Err(err);
        }

        debug!(message_id = %id, extension_ms = duration.as_millis() as u64, "ack deadline extended");
        Ok(())
    }
}

#[async_trait]
impl<B: BrokerBackend> LeaseControl for AckCoordinator<B> {
    async fn ack(&self, ctx: &CancellationToken, id: &MessageId) -> PubSubResult<()> {
        self.ack_message(ctx, id).await
    }

    async fn extend(
        &self,
        ctx: &CancellationToken,
        id: &MessageId,
        duration: Duration,
    ) -> PubSubResult<()> {
        self.extend_ack_deadline(ctx, id, duration).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory::InMemoryBroker;
    use crate::lease::table::{Admission, LeaseState};
    use leasebus_core::BackendError;

    const WINDOW: Duration = Duration::from_secs(10);

    fn setup() -> (Arc<LeaseTable>, InMemoryBroker, AckCoordinator<crate::InMemoryBackend>) {
        let table = Arc::new(LeaseTable::new());
        let broker = InMemoryBroker::new();
        let coordinator = AckCoordinator::new(table.clone(), Arc::new(broker.backend("orders")));
        (table, broker, coordinator)
    }

    fn lease(table: &LeaseTable, id: &str) {
        let admitted = table.admit(&MessageId::from(id), b"hello".to_vec(), Instant::now(), WINDOW);
        assert!(matches!(admitted, Admission::Leased { .. }));
    }

    #[tokio::test]
    async fn ack_deletes_and_removes_lease() {
        let (table, broker, coordinator) = setup();
        lease(&table, "m1");
        let ctx = CancellationToken::new();

        coordinator.ack_message(&ctx, &"m1".into()).await.unwrap();

        assert_eq!(table.outstanding(), 0);
        assert_eq!(broker.calls().deletes, 1);
    }

    #[tokio::test]
    async fn second_ack_is_not_found() {
        let (table, broker, coordinator) = setup();
        lease(&table, "m1");
        let ctx = CancellationToken::new();

        coordinator.ack_message(&ctx, &"m1".into()).await.unwrap();
        let err = coordinator.ack_message(&ctx, &"m1".into()).await.unwrap_err();

        assert!(err.is_not_found());
        assert_eq!(broker.calls().deletes, 1);
    }

    #[tokio::test]
    async fn failed_delete_leaves_lease_retryable() {
        let (table, broker, coordinator) = setup();
        lease(&table, "m1");
        broker.fail_next_deletes(1);
        let ctx = CancellationToken::new();

        let err = coordinator.ack_message(&ctx, &"m1".into()).await.unwrap_err();
        assert_eq!(err, PubSubError::from(BackendError::transport("injected delete failure")));
        assert_eq!(
            table.snapshot(&"m1".into()).unwrap().state,
            LeaseState::Pending
        );

        coordinator.ack_message(&ctx, &"m1".into()).await.unwrap();
        assert_eq!(table.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_mid_ack_rolls_back() {
        let (table, broker, coordinator) = setup();
        lease(&table, "m1");
        broker.set_call_latency(Duration::from_secs(5));
        let ctx = CancellationToken::new();

        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let err = coordinator.ack_message(&ctx, &"m1".into()).await.unwrap_err();
        assert_eq!(err, PubSubError::Cancelled);
        assert_eq!(
            table.snapshot(&"m1".into()).unwrap().state,
            LeaseState::Pending
        );
    }

    #[tokio::test]
    async fn cancelled_context_issues_no_backend_call() {
        let (table, broker, coordinator) = setup();
        lease(&table, "m1");
        let ctx = CancellationToken::new();
        ctx.cancel();

        let err = coordinator.ack_message(&ctx, &"m1".into()).await.unwrap_err();
        assert_eq!(err, PubSubError::Cancelled);
        assert_eq!(broker.calls().deletes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn extend_calls_backend_only_when_deadline_moves() {
        let (table, broker, coordinator) = setup();
        lease(&table, "m1");
        let ctx = CancellationToken::new();
        let before = table.snapshot(&"m1".into()).unwrap().deadline;

        coordinator
            .extend_ack_deadline(&ctx, &"m1".into(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(broker.calls().extends, 0);
        assert_eq!(table.snapshot(&"m1".into()).unwrap().deadline, before);

        coordinator
            .extend_ack_deadline(&ctx, &"m1".into(), WINDOW * 3)
            .await
            .unwrap();
        assert_eq!(broker.calls().extends, 1);
        assert!(table.snapshot(&"m1".into()).unwrap().deadline > before);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_extension_restores_deadline() {
        let (table, broker, coordinator) = setup();
        lease(&table, "m1");
        broker.fail_next_extends(1);
        let ctx = CancellationToken::new();
        let before = table.snapshot(&"m1".into()).unwrap().deadline;

        let err = coordinator
            .extend_ack_deadline(&ctx, &"m1".into(), WINDOW * 3)
            .await
            .unwrap_err();

        assert!(matches!(err, PubSubError::Transport { fatal: false, .. }));
        assert_eq!(table.snapshot(&"m1".into()).unwrap().deadline, before);
    }

    #[tokio::test]
    async fn extend_after_ack_is_not_found() {
        let (table, _broker, coordinator) = setup();
        lease(&table, "m1");
        let ctx = CancellationToken::new();

        coordinator.ack_message(&ctx, &"m1".into()).await.unwrap();
        let err = coordinator
            .extend_ack_deadline(&ctx, &"m1".into(), WINDOW)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
