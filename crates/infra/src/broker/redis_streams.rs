//! Redis Streams-backed broker (durable, consumer groups).
//!
//! Maps the [`BrokerBackend`] contract onto Redis Streams:
//!
//! - **publish**: `XADD <topic> * payload <bytes>`
//! - **receive**: reclaim idle pending entries (`XPENDING IDLE` + `XCLAIM`),
//!   then read new ones (`XREADGROUP ... >`)
//! - **delete**: `XACK` + `XDEL`
//! - **extend_visibility / make_visible_again**: `XCLAIM ... IDLE <ms> JUSTID`
//!   rewinds the entry's idle time so it becomes reclaimable after the
//!   requested duration (or immediately)
//! - **dead_letter**: `XADD` to the DLQ stream, then `XACK` + `XDEL`
//!
//! The pending timeout plays the role of the broker's visibility timeout: an
//! entry nobody acks is reclaimed once it has been idle that long, even if
//! the client process died. Extensions are therefore capped at the pending
//! timeout.
//!
//! The synchronous `redis` client runs on the blocking thread pool; every
//! call opens its own connection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

use leasebus_core::{BackendError, ConfigError, MessageId};
use leasebus_pubsub::{BrokerBackend, RawMessage, ReceiveStream};

use crate::config::RedisStreamsConfig;

const PAYLOAD_FIELD: &str = "payload";

#[derive(Debug, thiserror::Error)]
pub enum RedisStreamsError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Command(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Consumer group error: {0}")]
    ConsumerGroup(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<RedisStreamsError> for BackendError {
    fn from(value: RedisStreamsError) -> Self {
        match value {
            RedisStreamsError::Deserialization(msg) => BackendError::serialization(msg),
            other => BackendError::transport(other.to_string()),
        }
    }
}

/// Stream entry that could not be turned into a [`RawMessage`].
#[derive(Debug, Clone, PartialEq, Eq)]
struct MalformedEntry {
    id: Option<String>,
    reason: String,
}

type ReadItem = Result<RawMessage, BackendError>;

#[derive(Debug, Clone)]
pub struct RedisStreamsBackend {
    client: Arc<redis::Client>,
    config: Arc<RedisStreamsConfig>,
}

impl RedisStreamsBackend {
    /// Create a backend. No connection is made until the first call.
    pub fn new(config: RedisStreamsConfig) -> Result<Self, RedisStreamsError> {
        config.validate()?;
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &RedisStreamsConfig {
        &self.config
    }

    /// Create the consumer group (and the stream) if missing. Idempotent.
    pub async fn ensure_consumer_group(&self) -> Result<(), RedisStreamsError> {
        self.blocking(ensure_consumer_group_sync).await
    }

    /// Run `op` on the blocking pool with a fresh connection.
    async fn blocking<T, F>(&self, op: F) -> Result<T, RedisStreamsError>
    where
        T: Send + 'static,
        F: FnOnce(&mut redis::Connection, &RedisStreamsConfig) -> Result<T, RedisStreamsError>
            + Send
            + 'static,
    {
        let client = self.client.clone();
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = client
                .get_connection()
                .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;
            op(&mut conn, &config)
        })
        .await
        .map_err(|e| RedisStreamsError::Connection(format!("blocking task failed: {e}")))?
    }
}

fn ensure_consumer_group_sync(
    conn: &mut redis::Connection,
    config: &RedisStreamsConfig,
) -> Result<(), RedisStreamsError> {
    // "0" starts the group at the beginning of the stream.
    let created: redis::RedisResult<String> = redis::cmd("XGROUP")
        .arg("CREATE")
        .arg(&config.stream_key)
        .arg(&config.group)
        .arg("0")
        .arg("MKSTREAM")
        .query(conn);

    match created {
        Ok(_) => Ok(()),
        Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
        Err(e) => Err(RedisStreamsError::ConsumerGroup(e.to_string())),
    }
}

#[instrument(skip(conn, payload), fields(len = payload.len()), err)]
fn publish_sync(
    conn: &mut redis::Connection,
    topic: &str,
    payload: &[u8],
) -> Result<(), RedisStreamsError> {
    let _: String = redis::cmd("XADD")
        .arg(topic)
        .arg("*")
        .arg(PAYLOAD_FIELD)
        .arg(payload)
        .query(conn)
        .map_err(|e| RedisStreamsError::Command(format!("XADD failed: {e}")))?;
    Ok(())
}

fn ack_and_delete_sync(
    conn: &mut redis::Connection,
    config: &RedisStreamsConfig,
    ids: &[String],
) -> Result<(), RedisStreamsError> {
    if ids.is_empty() {
        return Ok(());
    }

    redis::pipe()
        .atomic()
        .cmd("XACK")
        .arg(&config.stream_key)
        .arg(&config.group)
        .arg(ids)
        .ignore()
        .cmd("XDEL")
        .arg(&config.stream_key)
        .arg(ids)
        .ignore()
        .query::<()>(conn)
        .map_err(|e| RedisStreamsError::Command(format!("XACK/XDEL failed: {e}")))
}

/// Reset an entry's idle time to `idle`. It becomes reclaimable once its idle
/// time reaches the pending timeout.
fn set_idle_sync(
    conn: &mut redis::Connection,
    config: &RedisStreamsConfig,
    id: &str,
    idle: Duration,
) -> Result<(), RedisStreamsError> {
    let _: redis::Value = redis::cmd("XCLAIM")
        .arg(&config.stream_key)
        .arg(&config.group)
        .arg(&config.consumer)
        .arg(0)
        .arg(id)
        .arg("IDLE")
        .arg(idle.as_millis() as u64)
        .arg("JUSTID")
        .query(conn)
        .map_err(|e| RedisStreamsError::Command(format!("XCLAIM failed: {e}")))?;
    Ok(())
}

/// Idle time that makes an entry reclaimable `extension` from now.
fn idle_for_extension(pending_timeout: Duration, extension: Duration) -> Duration {
    pending_timeout.saturating_sub(extension)
}

fn dead_letter_sync(
    conn: &mut redis::Connection,
    config: &RedisStreamsConfig,
    id: &str,
    payload: &[u8],
    delivery_count: u32,
) -> Result<(), RedisStreamsError> {
    let _: String = redis::cmd("XADD")
        .arg(&config.dlq_key)
        .arg("*")
        .arg("original_message_id")
        .arg(id)
        .arg("delivery_count")
        .arg(delivery_count.to_string())
        .arg("failed_at")
        .arg(chrono::Utc::now().to_rfc3339())
        .arg(PAYLOAD_FIELD)
        .arg(payload)
        .query(conn)
        .map_err(|e| RedisStreamsError::Command(format!("DLQ XADD failed: {e}")))?;

    ack_and_delete_sync(conn, config, &[id.to_string()])?;

    warn!(message_id = %id, delivery_count, "message sent to dead-letter stream");
    Ok(())
}

/// One receive round: reclaimed idle entries first, otherwise new ones.
fn read_round_sync(
    conn: &mut redis::Connection,
    config: &RedisStreamsConfig,
) -> Result<Vec<ReadItem>, RedisStreamsError> {
    let mut entries = read_reclaimable_sync(conn, config)?;
    if entries.is_empty() {
        entries = read_new_sync(conn, config)?;
    }

    let mut items = Vec::with_capacity(entries.len());
    let mut malformed_ids = Vec::new();
    for entry in &entries {
        match parse_entry(entry) {
            Ok(raw) => items.push(Ok(raw)),
            Err(bad) => {
                warn!(message_id = ?bad.id, reason = %bad.reason, "skipping malformed stream entry");
                if let Some(id) = bad.id {
                    malformed_ids.push(id);
                }
                items.push(Err(BackendError::serialization(bad.reason)));
            }
        }
    }

    // A malformed entry would otherwise be reclaimed forever.
    ack_and_delete_sync(conn, config, &malformed_ids)?;

    Ok(items)
}

fn read_reclaimable_sync(
    conn: &mut redis::Connection,
    config: &RedisStreamsConfig,
) -> Result<Vec<redis::Value>, RedisStreamsError> {
    let min_idle_ms = config.pending_timeout.as_millis() as u64;

    let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
        .arg(&config.stream_key)
        .arg(&config.group)
        .arg("IDLE")
        .arg(min_idle_ms)
        .arg("-")
        .arg("+")
        .arg(config.read_count)
        .query(conn)
        .map_err(|e| RedisStreamsError::Command(format!("XPENDING failed: {e}")))?;

    if pending.is_empty() {
        return Ok(vec![]);
    }

    let ids: Vec<String> = pending.into_iter().map(|(id, _, _, _)| id).collect();
    let claimed: redis::Value = redis::cmd("XCLAIM")
        .arg(&config.stream_key)
        .arg(&config.group)
        .arg(&config.consumer)
        .arg(min_idle_ms)
        .arg(&ids[..])
        .query(conn)
        .map_err(|e| RedisStreamsError::Command(format!("XCLAIM failed: {e}")))?;

    match claimed {
        // Entries deleted since XPENDING come back as nil.
        redis::Value::Bulk(entries) => Ok(entries
            .into_iter()
            .filter(|e| !matches!(e, redis::Value::Nil))
            .collect()),
        redis::Value::Nil => Ok(vec![]),
        other => Err(RedisStreamsError::Deserialization(format!(
            "unexpected XCLAIM reply: {other:?}"
        ))),
    }
}

fn read_new_sync(
    conn: &mut redis::Connection,
    config: &RedisStreamsConfig,
) -> Result<Vec<redis::Value>, RedisStreamsError> {
    let reply: redis::Value = redis::cmd("XREADGROUP")
        .arg("GROUP")
        .arg(&config.group)
        .arg(&config.consumer)
        .arg("COUNT")
        .arg(config.read_count)
        .arg("BLOCK")
        .arg(config.block.as_millis() as u64)
        .arg("STREAMS")
        .arg(&config.stream_key)
        .arg(">")
        .query(conn)
        .map_err(|e| RedisStreamsError::Command(format!("XREADGROUP failed: {e}")))?;

    stream_entries(reply)
}

/// Unwrap an XREADGROUP reply: `[[stream, [entry, ...]], ...]` or nil on timeout.
fn stream_entries(reply: redis::Value) -> Result<Vec<redis::Value>, RedisStreamsError> {
    let streams = match reply {
        redis::Value::Nil => return Ok(vec![]),
        redis::Value::Bulk(streams) => streams,
        other => {
            return Err(RedisStreamsError::Deserialization(format!(
                "unexpected XREADGROUP reply: {other:?}"
            )));
        }
    };

    let mut entries = Vec::new();
    for stream in streams {
        match stream {
            redis::Value::Bulk(mut pair) if pair.len() == 2 => {
                if let redis::Value::Bulk(items) = pair.swap_remove(1) {
                    entries.extend(items);
                }
            }
            other => {
                return Err(RedisStreamsError::Deserialization(format!(
                    "unexpected stream block: {other:?}"
                )));
            }
        }
    }
    Ok(entries)
}

/// Parse `[id, [field, value, ...]]` into a message.
fn parse_entry(entry: &redis::Value) -> Result<RawMessage, MalformedEntry> {
    let parts = match entry {
        redis::Value::Bulk(parts) if parts.len() >= 2 => parts,
        _ => {
            return Err(MalformedEntry {
                id: None,
                reason: "invalid entry format".to_string(),
            });
        }
    };

    let id = match &parts[0] {
        redis::Value::Data(data) => String::from_utf8_lossy(data).to_string(),
        redis::Value::Status(s) => s.clone(),
        _ => {
            return Err(MalformedEntry {
                id: None,
                reason: "invalid message id format".to_string(),
            });
        }
    };

    let fields = match &parts[1] {
        redis::Value::Bulk(fields) => fields,
        _ => {
            return Err(MalformedEntry {
                id: Some(id),
                reason: "invalid fields format".to_string(),
            });
        }
    };

    let payload = fields.chunks(2).find_map(|chunk| match chunk {
        [redis::Value::Data(key), redis::Value::Data(value)] if key == PAYLOAD_FIELD.as_bytes() => {
            Some(value.clone())
        }
        _ => None,
    });

    match payload {
        Some(payload) => Ok(RawMessage::new(id, payload)),
        None => Err(MalformedEntry {
            id: Some(id.clone()),
            reason: format!("entry {id} has no payload field"),
        }),
    }
}

#[async_trait]
impl BrokerBackend for RedisStreamsBackend {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BackendError> {
        let topic = topic.to_string();
        self.blocking(move |conn, _| publish_sync(conn, &topic, &payload))
            .await
            .map_err(BackendError::from)
    }

    fn receive(&self, ctx: CancellationToken) -> ReceiveStream {
        let (tx, rx) = mpsc::channel(self.config.read_count.max(1));
        let backend = self.clone();

        tokio::spawn(async move {
            if let Err(e) = backend.ensure_consumer_group().await {
                error!(error = %e, "failed to create consumer group");
                let _ = tx.send(Err(BackendError::fatal(e.to_string()))).await;
                return;
            }

            let mut failures = 0u32;
            loop {
                let round = tokio::select! {
                    biased;
                    _ = ctx.cancelled() => return,
                    round = backend.blocking(read_round_sync) => round,
                };

                let items = match round {
                    Ok(items) => {
                        failures = 0;
                        items
                    }
                    Err(e) => {
                        failures += 1;
                        if failures >= backend.config.max_read_failures {
                            error!(error = %e, failures, "giving up on Redis stream");
                            let _ = tx.send(Err(BackendError::fatal(e.to_string()))).await;
                            return;
                        }
                        warn!(error = %e, failures, "stream read failed; backing off");
                        if tx.send(Err(e.into())).await.is_err() {
                            return;
                        }
                        tokio::select! {
                            _ = ctx.cancelled() => return,
                            _ = tokio::time::sleep(backend.config.retry_backoff) => continue,
                        }
                    }
                };

                for item in items {
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
            }
        });

        Box::pin(ReceiverStream::new(rx))
    }

    async fn delete(&self, id: &MessageId) -> Result<(), BackendError> {
        let ids = vec![id.to_string()];
        self.blocking(move |conn, config| ack_and_delete_sync(conn, config, &ids))
            .await
            .map_err(BackendError::from)
    }

    async fn extend_visibility(
        &self,
        id: &MessageId,
        duration: Duration,
    ) -> Result<(), BackendError> {
        let id = id.to_string();
        let idle = idle_for_extension(self.config.pending_timeout, duration);
        if duration > self.config.pending_timeout {
            debug!(message_id = %id, "extension capped at the pending timeout");
        }
        self.blocking(move |conn, config| set_idle_sync(conn, config, &id, idle))
            .await
            .map_err(BackendError::from)
    }

    async fn make_visible_again(&self, id: &MessageId) -> Result<(), BackendError> {
        let id = id.to_string();
        self.blocking(move |conn, config| {
            set_idle_sync(conn, config, &id, config.pending_timeout)
        })
        .await
        .map_err(BackendError::from)
    }

    async fn dead_letter(
        &self,
        id: &MessageId,
        payload: &[u8],
        delivery_count: u32,
    ) -> Result<(), BackendError> {
        let id = id.to_string();
        let payload = payload.to_vec();
        self.blocking(move |conn, config| {
            dead_letter_sync(conn, config, &id, &payload, delivery_count)
        })
        .await
        .map_err(BackendError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(s: &str) -> redis::Value {
        redis::Value::Data(s.as_bytes().to_vec())
    }

    fn entry(id: &str, fields: &[(&str, &str)]) -> redis::Value {
        let mut flat = Vec::new();
        for (k, v) in fields {
            flat.push(data(k));
            flat.push(data(v));
        }
        redis::Value::Bulk(vec![data(id), redis::Value::Bulk(flat)])
    }

    #[test]
    fn parses_payload_field() {
        let raw = parse_entry(&entry("1700000000000-0", &[("payload", "hello")])).unwrap();
        assert_eq!(raw.id, MessageId::from("1700000000000-0"));
        assert_eq!(raw.payload, b"hello");
        assert_eq!(raw.deadline_hint, None);
    }

    #[test]
    fn entry_without_payload_keeps_its_id_for_cleanup() {
        let err = parse_entry(&entry("1-0", &[("other", "x")])).unwrap_err();
        assert_eq!(err.id.as_deref(), Some("1-0"));
    }

    #[test]
    fn garbage_entry_has_no_id() {
        let err = parse_entry(&redis::Value::Int(3)).unwrap_err();
        assert_eq!(err.id, None);
    }

    #[test]
    fn unwraps_xreadgroup_reply() {
        let reply = redis::Value::Bulk(vec![redis::Value::Bulk(vec![
            data("leasebus:messages"),
            redis::Value::Bulk(vec![
                entry("1-0", &[("payload", "a")]),
                entry("2-0", &[("payload", "b")]),
            ]),
        ])]);

        let entries = stream_entries(reply).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(stream_entries(redis::Value::Nil).unwrap().is_empty());
    }

    #[test]
    fn extension_rewinds_idle_time() {
        let timeout = Duration::from_secs(60);
        assert_eq!(
            idle_for_extension(timeout, Duration::from_secs(15)),
            Duration::from_secs(45)
        );
        assert_eq!(idle_for_extension(timeout, Duration::from_secs(90)), Duration::ZERO);
    }

    #[test]
    fn decode_failures_map_to_serialization_errors() {
        let err: BackendError = RedisStreamsError::Deserialization("bad".into()).into();
        assert_eq!(err, BackendError::serialization("bad"));

        let err: BackendError = RedisStreamsError::Connection("refused".into()).into();
        assert!(!err.is_fatal());
    }
}
