//! Backend configuration loading and representation.

use std::time::Duration;

use leasebus_core::ConfigError;

/// Default stream key messages are published to and read from.
pub const DEFAULT_STREAM_KEY: &str = "leasebus:messages";

/// Default dead-letter stream.
pub const DEFAULT_DLQ_KEY: &str = "leasebus:messages:dlq";

pub const DEFAULT_GROUP: &str = "default";

/// Pending entries idle this long are reclaimed (broker-side visibility timeout).
pub const DEFAULT_PENDING_TIMEOUT: Duration = Duration::from_secs(60);

pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

/// Redis Streams connection and consumer-group settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisStreamsConfig {
    pub url: String,
    pub stream_key: String,
    pub dlq_key: String,
    pub group: String,
    /// Unique consumer name within the group.
    pub consumer: String,
    pub pending_timeout: Duration,
    /// Max entries per XREADGROUP / XCLAIM round.
    pub read_count: usize,
    /// XREADGROUP BLOCK duration.
    pub block: Duration,
    /// Consecutive failed reads before the connection is declared lost.
    pub max_read_failures: u32,
    /// Pause between failed reads.
    pub retry_backoff: Duration,
}

impl Default for RedisStreamsConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_REDIS_URL.to_string(),
            stream_key: DEFAULT_STREAM_KEY.to_string(),
            dlq_key: DEFAULT_DLQ_KEY.to_string(),
            group: DEFAULT_GROUP.to_string(),
            consumer: format!("consumer-{}", uuid::Uuid::now_v7()),
            pending_timeout: DEFAULT_PENDING_TIMEOUT,
            read_count: 10,
            block: Duration::from_millis(100),
            max_read_failures: 5,
            retry_backoff: Duration::from_millis(200),
        }
    }
}

impl RedisStreamsConfig {
    /// Defaults overridden by `REDIS_URL`, `LEASEBUS_REDIS_STREAM`,
    /// `LEASEBUS_REDIS_DLQ`, `LEASEBUS_REDIS_GROUP`, `LEASEBUS_REDIS_CONSUMER`
    /// and `LEASEBUS_REDIS_PENDING_TIMEOUT_MS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(url) = lookup("REDIS_URL") {
            cfg.url = url;
        }
        if let Some(key) = lookup("LEASEBUS_REDIS_STREAM") {
            cfg.stream_key = key;
        }
        if let Some(key) = lookup("LEASEBUS_REDIS_DLQ") {
            cfg.dlq_key = key;
        }
        if let Some(group) = lookup("LEASEBUS_REDIS_GROUP") {
            cfg.group = group;
        }
        if let Some(consumer) = lookup("LEASEBUS_REDIS_CONSUMER") {
            cfg.consumer = consumer;
        }
        if let Some(raw) = lookup("LEASEBUS_REDIS_PENDING_TIMEOUT_MS") {
            let ms = raw.trim().parse::<u64>().map_err(|_| ConfigError::InvalidEnv {
                var: "LEASEBUS_REDIS_PENDING_TIMEOUT_MS",
                value: raw.clone(),
            })?;
            cfg.pending_timeout = Duration::from_millis(ms);
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn with_stream(mut self, stream_key: impl Into<String>) -> Self {
        self.stream_key = stream_key.into();
        self
    }

    pub fn with_group(mut self, group: impl Into<String>, consumer: impl Into<String>) -> Self {
        self.group = group.into();
        self.consumer = consumer.into();
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stream_key.is_empty() || self.group.is_empty() || self.consumer.is_empty() {
            return Err(ConfigError::Invalid(
                "stream key, group and consumer must be set".into(),
            ));
        }
        if self.stream_key == self.dlq_key {
            return Err(ConfigError::Invalid(
                "dead-letter stream must differ from the message stream".into(),
            ));
        }
        if self.read_count == 0 || self.max_read_failures == 0 {
            return Err(ConfigError::Invalid(
                "read_count and max_read_failures must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overrides_connection_settings() {
        let cfg = RedisStreamsConfig::from_lookup(|key| match key {
            "REDIS_URL" => Some("redis://cache:6380".to_string()),
            "LEASEBUS_REDIS_GROUP" => Some("billing".to_string()),
            "LEASEBUS_REDIS_PENDING_TIMEOUT_MS" => Some("1500".to_string()),
            _ => None,
        })
        .unwrap();

        assert_eq!(cfg.url, "redis://cache:6380");
        assert_eq!(cfg.group, "billing");
        assert_eq!(cfg.pending_timeout, Duration::from_millis(1500));
        assert_eq!(cfg.stream_key, DEFAULT_STREAM_KEY);
        assert!(cfg.consumer.starts_with("consumer-"));
    }

    #[test]
    fn dlq_must_be_a_separate_stream() {
        let mut cfg = RedisStreamsConfig::default();
        cfg.dlq_key = cfg.stream_key.clone();
        assert!(cfg.validate().is_err());
    }
}
