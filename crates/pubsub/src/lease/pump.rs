//! Delivery pump: backend receive loop feeding leased handles to consumers.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{BrokerBackend, RawMessage};
use crate::lease::coordinator::LeaseControl;
use crate::lease::handle::MessageHandle;
use crate::lease::table::{Admission, LeaseTable};
use crate::reporter::ErrorReporter;

/// Why the pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PumpExit {
    Cancelled,
    StreamEnded,
    Fatal,
    ConsumerGone,
}

pub(crate) struct DeliveryPump<B> {
    backend: Arc<B>,
    table: Arc<LeaseTable>,
    control: Arc<dyn LeaseControl>,
    reporter: ErrorReporter,
    ack_window: Duration,
}

impl<B: BrokerBackend> DeliveryPump<B> {
    pub(crate) fn new(
        backend: Arc<B>,
        table: Arc<LeaseTable>,
        control: Arc<dyn LeaseControl>,
        reporter: ErrorReporter,
        ack_window: Duration,
    ) -> Self {
        Self {
            backend,
            table,
            control,
            reporter,
            ack_window,
        }
    }

    /// Receive until cancelled, the stream ends, or a fatal error occurs.
    ///
    /// `tx` is dropped on return, which closes the delivery channel.
    pub(crate) async fn run(
        self,
        ctx: CancellationToken,
        tx: mpsc::Sender<MessageHandle>,
    ) -> PumpExit {
        let mut stream = self.backend.receive(ctx.clone());

        let exit = loop {
            let next = tokio::select! {
                biased;
                _ = ctx.cancelled() => break PumpExit::Cancelled,
                next = stream.next() => next,
            };

            match next {
                None => break PumpExit::StreamEnded,
                Some(Err(err)) if err.is_fatal() => {
                    error!(error = %err, "backend connection lost; stopping subscription");
                    self.reporter.report_reliably(&ctx, err.into()).await;
                    break PumpExit::Fatal;
                }
                Some(Err(err)) => {
                    warn!(error = %err, "receive failed; skipping");
                    self.reporter.report(err.into());
                }
                Some(Ok(raw)) => {
                    if let Some(exit) = self.deliver(&ctx, &tx, raw).await {
                        break exit;
                    }
                }
            }
        };

        info!(?exit, "delivery pump stopped");
        exit
    }

    async fn deliver(
        &self,
        ctx: &CancellationToken,
        tx: &mpsc::Sender<MessageHandle>,
        raw: RawMessage,
    ) -> Option<PumpExit> {
        let RawMessage {
            id,
            payload,
            deadline_hint,
        } = raw;
        let window = deadline_hint.unwrap_or(self.ack_window);

        let (payload, delivery_count) =
            match self.table.admit(&id, payload, Instant::now(), window) {
                Admission::Leased {
                    payload,
                    delivery_count,
                } => (payload, delivery_count),
                Admission::Duplicate => {
                    debug!(message_id = %id, "lease already outstanding; ignoring duplicate");
                    return None;
                }
                Admission::Poisoned => {
                    debug!(message_id = %id, "ignoring poison message");
                    return None;
                }
            };

        debug!(message_id = %id, delivery_count, "lease created");
        let handle = MessageHandle::new(
            id.clone(),
            payload,
            delivery_count,
            self.control.clone(),
            ctx.clone(),
        );

        // Blocks while the channel is full (backpressure).
        let sent = tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(PumpExit::Cancelled),
            res = tx.send(handle) => res.map_err(|_| PumpExit::ConsumerGone),
        };

        match sent {
            Ok(()) => None,
            Err(exit) => {
                self.table.retract(&id, delivery_count);
                Some(exit)
            }
        }
    }
}
