//! Deadline monitor: periodic sweep for expired leases.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use leasebus_core::PubSubError;

use crate::backend::BrokerBackend;
use crate::lease::table::{Expiry, LeaseTable, deadline_after};
use crate::reporter::ErrorReporter;

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct SweepOutcome {
    pub(crate) redelivered: usize,
    pub(crate) poisoned: usize,
    pub(crate) abandoned: usize,
}

pub(crate) struct DeadlineMonitor<B> {
    table: Arc<LeaseTable>,
    backend: Arc<B>,
    reporter: ErrorReporter,
    interval: Duration,
    max_retries: u32,
    /// How long an expired lease waits for its message to come back.
    grace: Duration,
}

impl<B: BrokerBackend> DeadlineMonitor<B> {
    pub(crate) fn new(
        table: Arc<LeaseTable>,
        backend: Arc<B>,
        reporter: ErrorReporter,
        interval: Duration,
        max_retries: u32,
        grace: Duration,
    ) -> Self {
        Self {
            table,
            backend,
            reporter,
            interval,
            max_retries,
            grace,
        }
    }

    /// Sweep every `interval` until `ctx` is cancelled.
    pub(crate) async fn run(self, ctx: CancellationToken) {
        let mut ticker = tokio::time::interval_at(deadline_after(Instant::now(), self.interval), self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = ctx.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep(&ctx).await;
                }
            }
        }

        info!("deadline monitor stopped");
    }

    pub(crate) async fn sweep(&self, ctx: &CancellationToken) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();

        for expiry in self.table.sweep(Instant::now(), self.max_retries, self.grace) {
            if ctx.is_cancelled() {
                break;
            }

            match expiry {
                Expiry::Abandoned {
                    message_id,
                    delivery_count,
                } => {
                    warn!(message_id = %message_id, delivery_count, "expired message never came back; lease dropped");
                    outcome.abandoned += 1;
                }
                Expiry::Redeliver {
                    message_id,
                    delivery_count,
                } => {
                    debug!(message_id = %message_id, delivery_count, "lease expired; requesting redelivery");
                    let res = tokio::select! {
                        biased;
                        _ = ctx.cancelled() => break,
                        res = self.backend.make_visible_again(&message_id) => res,
                    };
                    match res {
                        Ok(()) => outcome.redelivered += 1,
                        // The broker's own visibility timeout still brings it back.
                        Err(err) => {
                            warn!(message_id = %message_id, error = %err, "redelivery request failed");
                            self.reporter.report(err.into());
                        }
                    }
                }
                Expiry::Poison {
                    message_id,
                    payload,
                    delivery_count,
                } => {
                    warn!(message_id = %message_id, delivery_count, "redelivery budget exhausted; dropping poison message");
                    let res = tokio::select! {
                        biased;
                        _ = ctx.cancelled() => break,
                        res = self.backend.dead_letter(&message_id, &payload, delivery_count) => res,
                    };
                    if let Err(err) = res {
                        warn!(message_id = %message_id, error = %err, "dead-lettering failed");
                        self.reporter.report(err.into());
                    }

                    outcome.poisoned += 1;
                    self.reporter
                        .report_reliably(
                            ctx,
                            PubSubError::PoisonMessage {
                                message_id,
                                delivery_count,
                            },
                        )
                        .await;
                }
            }
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory::{InMemoryBackend, InMemoryBroker};
    use crate::lease::table::LeaseState;
    use leasebus_core::MessageId;

    const WINDOW: Duration = Duration::from_millis(100);

    fn setup(
        max_retries: u32,
    ) -> (
        Arc<LeaseTable>,
        InMemoryBroker,
        DeadlineMonitor<InMemoryBackend>,
        tokio::sync::mpsc::Receiver<PubSubError>,
    ) {
        let table = Arc::new(LeaseTable::new());
        let broker = InMemoryBroker::new();
        let (reporter, errors) = ErrorReporter::channel("test", 8);
        let monitor = DeadlineMonitor::new(
            table.clone(),
            Arc::new(broker.backend("orders")),
            reporter,
            Duration::from_millis(10),
            max_retries,
            WINDOW,
        );
        (table, broker, monitor, errors)
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_requests_redelivery_for_expired_lease() {
        let (table, broker, monitor, _errors) = setup(3);
        let id = MessageId::from("m1");
        table.admit(&id, b"hello".to_vec(), Instant::now(), WINDOW);
        let ctx = CancellationToken::new();

        assert_eq!(monitor.sweep(&ctx).await, SweepOutcome::default());

        tokio::time::advance(WINDOW).await;
        let outcome = monitor.sweep(&ctx).await;

        assert_eq!(outcome.redelivered, 1);
        assert_eq!(broker.calls().redeliveries, 1);
        assert_eq!(table.snapshot(&id).unwrap().state, LeaseState::Expired);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_lease_is_reported_as_poison() {
        let (table, broker, monitor, mut errors) = setup(1);
        let id = MessageId::from("m1");
        table.admit(&id, b"hello".to_vec(), Instant::now(), WINDOW);
        let ctx = CancellationToken::new();

        tokio::time::advance(WINDOW).await;
        let outcome = monitor.sweep(&ctx).await;

        assert_eq!(outcome.poisoned, 1);
        assert_eq!(broker.calls().dead_letters, 1);
        assert_eq!(
            errors.recv().await,
            Some(PubSubError::PoisonMessage {
                message_id: id.clone(),
                delivery_count: 1
            })
        );
        assert!(table.snapshot(&id).is_none());
        assert!(table.is_poisoned(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_redelivery_request_is_reported() {
        let (table, broker, monitor, mut errors) = setup(3);
        table.admit(&MessageId::from("m1"), b"hello".to_vec(), Instant::now(), WINDOW);
        broker.fail_next_redeliveries(1);
        let ctx = CancellationToken::new();

        tokio::time::advance(WINDOW).await;
        monitor.sweep(&ctx).await;

        assert!(matches!(
            errors.recv().await,
            Some(PubSubError::Transport { fatal: false, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_monitor_issues_no_backend_calls() {
        let (table, broker, monitor, _errors) = setup(3);
        table.admit(&MessageId::from("m1"), b"hello".to_vec(), Instant::now(), WINDOW);
        let ctx = CancellationToken::new();
        ctx.cancel();

        tokio::time::advance(WINDOW).await;
        monitor.sweep(&ctx).await;

        assert_eq!(broker.calls().redeliveries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_without_redelivery_is_dropped_after_grace() {
        let (table, broker, monitor, _errors) = setup(3);
        let id = MessageId::from("m1");
        table.admit(&id, b"hello".to_vec(), Instant::now(), WINDOW);
        let ctx = CancellationToken::new();

        tokio::time::advance(WINDOW).await;
        assert_eq!(monitor.sweep(&ctx).await.redelivered, 1);

        tokio::time::advance(WINDOW).await;
        let outcome = monitor.sweep(&ctx).await;

        assert_eq!(outcome.abandoned, 1);
        assert_eq!(table.outstanding(), 0);
        assert_eq!(broker.calls().redeliveries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn running_monitor_redelivers_within_one_interval_of_the_deadline() {
        let interval = Duration::from_millis(10);
        let (table, broker, monitor, _errors) = setup(3);
        let start = Instant::now();
        table.admit(&MessageId::from("m1"), b"hello".to_vec(), start, WINDOW);
        let ctx = CancellationToken::new();
        let task = tokio::spawn(monitor.run(ctx.clone()));

        tokio::time::sleep_until(start + WINDOW - Duration::from_millis(1)).await;
        assert_eq!(broker.calls().redeliveries, 0);

        tokio::time::sleep_until(start + WINDOW + interval).await;
        tokio::task::yield_now().await;
        assert_eq!(broker.calls().redeliveries, 1);

        ctx.cancel();
        task.await.unwrap();
    }
}
