//! At-least-once subscriber: wires the lease engine to a backend.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{info, warn};

use leasebus_core::{ConfigError, MessageId, PubSubError, PubSubResult, SubscriberConfig};

use crate::backend::BrokerBackend;
use crate::contract::AtLeastOnceSubscriber;
use crate::lease::coordinator::AckCoordinator;
use crate::lease::handle::MessageHandle;
use crate::lease::monitor::DeadlineMonitor;
use crate::lease::pump::DeliveryPump;
use crate::lease::table::{LeaseSnapshot, LeaseTable};
use crate::reporter::ErrorReporter;

const NAME: &str = "at-least-once";

/// Leased-delivery subscriber over a [`BrokerBackend`].
///
/// One subscription runs at a time; `start` while one is running yields an
/// immediately closed delivery channel and an `AlreadyStarted` report.
pub struct LeaseSubscriber<B: BrokerBackend> {
    backend: Arc<B>,
    config: SubscriberConfig,
    table: Arc<LeaseTable>,
    coordinator: Arc<AckCoordinator<B>>,
    running: Arc<AtomicBool>,
}

impl<B: BrokerBackend> LeaseSubscriber<B> {
    pub fn new(backend: B, config: SubscriberConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let backend = Arc::new(backend);
        let table = Arc::new(LeaseTable::new());
        let coordinator = Arc::new(AckCoordinator::new(table.clone(), backend.clone()));

        Ok(Self {
            backend,
            config,
            table,
            coordinator,
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn config(&self) -> &SubscriberConfig {
        &self.config
    }

    /// Leases not yet acked (Pending or Expired).
    pub fn outstanding(&self) -> usize {
        self.table.outstanding()
    }

    pub fn lease(&self, id: &MessageId) -> Option<LeaseSnapshot> {
        self.table.snapshot(id)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn spawn(
        &self,
        ctx: &CancellationToken,
    ) -> (mpsc::Receiver<MessageHandle>, mpsc::Receiver<PubSubError>) {
        let (tx, rx) = mpsc::channel(self.config.delivery_capacity);
        let (reporter, errors) = ErrorReporter::channel(NAME, self.config.error_capacity);

        if self.running.swap(true, Ordering::AcqRel) {
            warn!("start called while a subscription is running");
            reporter.report(PubSubError::AlreadyStarted);
            return (rx, errors);
        }

        // The run token also stops the monitor when the pump exits on its own.
        let run = ctx.child_token();

        let pump = DeliveryPump::new(
            self.backend.clone(),
            self.table.clone(),
            self.coordinator.clone(),
            reporter.clone(),
            self.config.default_ack_window,
        );
        let monitor = DeadlineMonitor::new(
            self.table.clone(),
            self.backend.clone(),
            reporter,
            self.config.monitor_interval,
            self.config.max_retries,
            self.config.default_ack_window,
        );
        let table = self.table.clone();
        let running = self.running.clone();

        info!(
            ack_window_ms = self.config.default_ack_window.as_millis() as u64,
            monitor_interval_ms = self.config.monitor_interval.as_millis() as u64,
            max_retries = self.config.max_retries,
            "subscription started"
        );

        tokio::spawn(async move {
            let teardown = Teardown {
                table,
                running,
                _stop: run.clone().drop_guard(),
            };
            let monitor_task = tokio::spawn(monitor.run(run.clone()));

            let exit = pump.run(run.clone(), tx).await;
            run.cancel();
            if let Err(err) = monitor_task.await {
                warn!(error = %err, "deadline monitor task failed");
            }

            // Outstanding leases are left to the broker's visibility timeout.
            let abandoned = teardown.table.outstanding();
            drop(teardown);
            info!(?exit, abandoned, "subscription stopped");
        });

        (rx, errors)
    }
}

/// Releases a subscription's state when its supervisor exits, even by panic.
struct Teardown {
    table: Arc<LeaseTable>,
    running: Arc<AtomicBool>,
    _stop: DropGuard,
}

impl Drop for Teardown {
    fn drop(&mut self) {
        self.table.clear();
        self.running.store(false, Ordering::Release);
    }
}

#[async_trait]
impl<B: BrokerBackend> AtLeastOnceSubscriber for LeaseSubscriber<B> {
    type Message = MessageHandle;

    fn start(
        &self,
        ctx: &CancellationToken,
    ) -> (mpsc::Receiver<MessageHandle>, mpsc::Receiver<PubSubError>) {
        self.spawn(ctx)
    }

    async fn ack_message(&self, ctx: &CancellationToken, id: &MessageId) -> PubSubResult<()> {
        self.coordinator.ack_message(ctx, id).await
    }

    async fn extend_ack_deadline(
        &self,
        ctx: &CancellationToken,
        id: &MessageId,
        duration: Duration,
    ) -> PubSubResult<()> {
        self.coordinator.extend_ack_deadline(ctx, id, duration).await
    }
}
