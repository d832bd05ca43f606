//! In-memory broker for tests/dev.
//!
//! - Queue semantics per topic with visibility timeouts (SQS-style)
//! - Sequential message ids: `m1`, `m2`, ...
//! - Fault injection (failing calls, injected receive errors, call latency)
//! - Call counters for assertions

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use leasebus_core::{BackendError, MessageId};

use crate::backend::{BrokerBackend, RawMessage, ReceiveStream};
use crate::lease::table::deadline_after;

/// Matches the Redis Streams backend's default pending timeout.
const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(60);

/// Fallback wake-up for visibility timeout recovery.
const IDLE_POLL: Duration = Duration::from_millis(50);

/// Number of backend calls that reached the broker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerCalls {
    pub publishes: u64,
    pub deletes: u64,
    pub extends: u64,
    pub redeliveries: u64,
    pub dead_letters: u64,
}

/// A message parked by [`BrokerBackend::dead_letter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub message_id: MessageId,
    pub payload: Vec<u8>,
    pub delivery_count: u32,
}

#[derive(Debug, Default)]
struct TopicQueue {
    ready: VecDeque<MessageId>,
    in_flight: HashMap<MessageId, Instant>,
    payloads: HashMap<MessageId, Vec<u8>>,
    receive_errors: VecDeque<BackendError>,
}

impl TopicQueue {
    fn remove(&mut self, id: &MessageId) -> Option<Vec<u8>> {
        self.ready.retain(|r| r != id);
        self.in_flight.remove(id);
        self.payloads.remove(id)
    }

    /// Return in-flight messages whose visibility timeout elapsed.
    fn recover_timed_out(&mut self, now: Instant) {
        let timed_out: Vec<MessageId> = self
            .in_flight
            .iter()
            .filter(|(_, visible_at)| **visible_at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in timed_out {
            self.in_flight.remove(&id);
            self.ready.push_back(id);
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    publishes: u32,
    deletes: u32,
    extends: u32,
    redeliveries: u32,
}

fn take_fault(counter: &mut u32, op: &str) -> Result<(), BackendError> {
    if *counter > 0 {
        *counter -= 1;
        return Err(BackendError::transport(format!("injected {op} failure")));
    }
    Ok(())
}

#[derive(Debug)]
struct State {
    topics: HashMap<String, TopicQueue>,
    next_id: u64,
    calls: BrokerCalls,
    faults: Faults,
    dead_letters: Vec<DeadLetter>,
    latency: Option<Duration>,
    visibility_timeout: Duration,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn simulate_latency(&self) {
        let latency = self.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

/// Shared in-memory broker. Clones share state.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    topics: HashMap::new(),
                    next_id: 0,
                    calls: BrokerCalls::default(),
                    faults: Faults::default(),
                    dead_letters: Vec::new(),
                    latency: None,
                    visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// How long a received, un-deleted message stays hidden.
    pub fn with_visibility_timeout(self, timeout: Duration) -> Self {
        self.shared.lock().visibility_timeout = timeout;
        self
    }

    /// Backend receiving from `topic` (publishing may target any topic).
    pub fn backend(&self, topic: impl Into<String>) -> InMemoryBackend {
        InMemoryBackend {
            shared: self.shared.clone(),
            topic: topic.into(),
        }
    }

    /// Enqueue a payload directly, bypassing fault injection and latency.
    pub fn push(&self, topic: &str, payload: Vec<u8>) -> MessageId {
        let id = {
            let mut state = self.shared.lock();
            enqueue(&mut state, topic, payload)
        };
        self.shared.notify.notify_waiters();
        id
    }

    /// Messages neither deleted nor dead-lettered (ready or in flight).
    pub fn depth(&self, topic: &str) -> usize {
        self.shared
            .lock()
            .topics
            .get(topic)
            .map(|q| q.payloads.len())
            .unwrap_or(0)
    }

    pub fn calls(&self) -> BrokerCalls {
        self.shared.lock().calls
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.shared.lock().dead_letters.clone()
    }

    pub fn fail_next_publishes(&self, n: u32) {
        self.shared.lock().faults.publishes = n;
    }

    pub fn fail_next_deletes(&self, n: u32) {
        self.shared.lock().faults.deletes = n;
    }

    pub fn fail_next_extends(&self, n: u32) {
        self.shared.lock().faults.extends = n;
    }

    pub fn fail_next_redeliveries(&self, n: u32) {
        self.shared.lock().faults.redeliveries = n;
    }

    /// Delay every subsequent backend call (not `receive`) by `latency`.
    pub fn set_call_latency(&self, latency: Duration) {
        self.shared.lock().latency = Some(latency);
    }

    /// Yield `err` from the next receive on `topic`, ahead of any message.
    pub fn inject_receive_error(&self, topic: &str, err: BackendError) {
        self.shared
            .lock()
            .topics
            .entry(topic.to_string())
            .or_default()
            .receive_errors
            .push_back(err);
        self.shared.notify.notify_waiters();
    }
}

fn enqueue(state: &mut State, topic: &str, payload: Vec<u8>) -> MessageId {
    state.next_id += 1;
    let id = MessageId::new(format!("m{}", state.next_id));
    let queue = state.topics.entry(topic.to_string()).or_default();
    queue.payloads.insert(id.clone(), payload);
    queue.ready.push_back(id.clone());
    id
}

/// [`BrokerBackend`] view of an [`InMemoryBroker`], bound to one topic.
#[derive(Debug, Clone)]
pub struct InMemoryBackend {
    shared: Arc<Shared>,
    topic: String,
}

impl InMemoryBackend {
    fn next_item(&self) -> Option<Result<RawMessage, BackendError>> {
        let mut state = self.shared.lock();
        let now = Instant::now();
        let visibility_timeout = state.visibility_timeout;
        let queue = state.topics.entry(self.topic.clone()).or_default();

        if let Some(err) = queue.receive_errors.pop_front() {
            return Some(Err(err));
        }

        queue.recover_timed_out(now);
        while let Some(id) = queue.ready.pop_front() {
            // Skip ids deleted while queued.
            let Some(payload) = queue.payloads.get(&id) else {
                continue;
            };
            let raw = RawMessage::new(id.clone(), payload.clone());
            queue.in_flight.insert(id, deadline_after(now, visibility_timeout));
            return Some(Ok(raw));
        }
        None
    }
}

#[async_trait]
impl BrokerBackend for InMemoryBackend {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BackendError> {
        self.shared.simulate_latency().await;
        {
            let mut state = self.shared.lock();
            take_fault(&mut state.faults.publishes, "publish")?;
            state.calls.publishes += 1;
            enqueue(&mut state, topic, payload);
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    fn receive(&self, ctx: CancellationToken) -> ReceiveStream {
        let (tx, rx) = mpsc::channel(1);
        let backend = self.clone();

        tokio::spawn(async move {
            loop {
                let notified = backend.shared.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                match backend.next_item() {
                    Some(item) => {
                        tokio::select! {
                            biased;
                            _ = ctx.cancelled() => return,
                            res = tx.send(item) => {
                                if res.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    None => {
                        tokio::select! {
                            biased;
                            _ = ctx.cancelled() => return,
                            _ = &mut notified => {}
                            _ = tokio::time::sleep(IDLE_POLL) => {}
                        }
                    }
                }
            }
        });

        Box::pin(ReceiverStream::new(rx))
    }

    async fn delete(&self, id: &MessageId) -> Result<(), BackendError> {
        self.shared.simulate_latency().await;
        let mut state = self.shared.lock();
        take_fault(&mut state.faults.deletes, "delete")?;
        state.calls.deletes += 1;
        if let Some(queue) = state.topics.get_mut(&self.topic) {
            queue.remove(id);
        }
        Ok(())
    }

    async fn extend_visibility(
        &self,
        id: &MessageId,
        duration: Duration,
    ) -> Result<(), BackendError> {
        self.shared.simulate_latency().await;
        let mut state = self.shared.lock();
        take_fault(&mut state.faults.extends, "extend")?;
        state.calls.extends += 1;
        if let Some(visible_at) = state
            .topics
            .get_mut(&self.topic)
            .and_then(|q| q.in_flight.get_mut(id))
        {
            *visible_at = deadline_after(Instant::now(), duration);
        }
        Ok(())
    }

    async fn make_visible_again(&self, id: &MessageId) -> Result<(), BackendError> {
        self.shared.simulate_latency().await;
        {
            let mut state = self.shared.lock();
            take_fault(&mut state.faults.redeliveries, "redelivery")?;
            state.calls.redeliveries += 1;
            if let Some(queue) = state.topics.get_mut(&self.topic) {
                if queue.in_flight.remove(id).is_some() {
                    queue.ready.push_back(id.clone());
                }
            }
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn dead_letter(
        &self,
        id: &MessageId,
        payload: &[u8],
        delivery_count: u32,
    ) -> Result<(), BackendError> {
        self.shared.simulate_latency().await;
        let mut state = self.shared.lock();
        state.calls.dead_letters += 1;
        if let Some(queue) = state.topics.get_mut(&self.topic) {
            queue.remove(id);
        }
        state.dead_letters.push(DeadLetter {
            message_id: id.clone(),
            payload: payload.to_vec(),
            delivery_count,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio_stream::StreamExt;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn received_message_is_hidden_until_timeout() {
        let broker = InMemoryBroker::new().with_visibility_timeout(Duration::from_secs(5));
        let backend = broker.backend("orders");
        let id = broker.push("orders", b"hello".to_vec());
        let ctx = CancellationToken::new();

        let mut stream = backend.receive(ctx.clone());
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.id, id);

        // Redelivered by the visibility timeout alone.
        let again = stream.next().await.unwrap().unwrap();
        assert_eq!(again.id, id);
        assert_eq!(again.payload, b"hello");
        ctx.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn make_visible_again_redelivers_immediately() {
        let broker = InMemoryBroker::new();
        let backend = broker.backend("orders");
        let id = broker.push("orders", b"hello".to_vec());
        let ctx = CancellationToken::new();

        let mut stream = backend.receive(ctx.clone());
        stream.next().await.unwrap().unwrap();

        let before = Instant::now();
        backend.make_visible_again(&id).await.unwrap();
        let again = stream.next().await.unwrap().unwrap();

        assert_eq!(again.id, id);
        assert!(Instant::now() - before < DEFAULT_VISIBILITY_TIMEOUT);
        ctx.cancel();
    }

    #[tokio::test]
    async fn delete_removes_message() {
        let broker = InMemoryBroker::new();
        let backend = broker.backend("orders");
        let id = broker.push("orders", b"hello".to_vec());

        backend.delete(&id).await.unwrap();

        assert_eq!(broker.depth("orders"), 0);
        assert_eq!(broker.calls().deletes, 1);
    }

    #[tokio::test]
    async fn default_dead_letter_parks_payload() {
        let broker = InMemoryBroker::new();
        let backend = broker.backend("orders");
        let id = broker.push("orders", b"bad".to_vec());

        backend.dead_letter(&id, b"bad", 5).await.unwrap();

        assert_eq!(broker.depth("orders"), 0);
        assert_eq!(
            broker.dead_letters(),
            vec![DeadLetter {
                message_id: id,
                payload: b"bad".to_vec(),
                delivery_count: 5
            }]
        );
    }

    #[tokio::test]
    async fn injected_faults_are_consumed() {
        let broker = InMemoryBroker::new();
        let backend = broker.backend("orders");
        broker.fail_next_deletes(1);

        assert!(backend.delete(&MessageId::from("m1")).await.is_err());
        assert!(backend.delete(&MessageId::from("m1")).await.is_ok());
    }
}
