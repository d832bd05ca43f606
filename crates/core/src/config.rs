//! Subscriber configuration.

use std::time::Duration;

use thiserror::Error;

/// Default time a consumer has to ack a message before it is redelivered.
pub const DEFAULT_ACK_WINDOW: Duration = Duration::from_secs(30);

/// Default period of the deadline monitor sweep.
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(1);

/// Default number of deliveries before a message is treated as poison.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default capacity of the delivery channel (backpressure threshold).
pub const DEFAULT_DELIVERY_CAPACITY: usize = 64;

/// Default capacity of the error channel.
pub const DEFAULT_ERROR_CAPACITY: usize = 256;

pub const ENV_ACK_WINDOW_MS: &str = "LEASEBUS_ACK_WINDOW_MS";
pub const ENV_MONITOR_INTERVAL_MS: &str = "LEASEBUS_MONITOR_INTERVAL_MS";
pub const ENV_MAX_RETRIES: &str = "LEASEBUS_MAX_RETRIES";
pub const ENV_DELIVERY_CAPACITY: &str = "LEASEBUS_DELIVERY_CAPACITY";
pub const ENV_ERROR_CAPACITY: &str = "LEASEBUS_ERROR_CAPACITY";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv { var: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration for an at-least-once subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberConfig {
    /// Lease length for a freshly delivered message (unless the backend hints otherwise).
    pub default_ack_window: Duration,
    /// How often the deadline monitor sweeps for expired leases.
    pub monitor_interval: Duration,
    /// Deliveries allowed before a message is dropped as poison.
    pub max_retries: u32,
    /// Bound of the delivery channel.
    pub delivery_capacity: usize,
    /// Bound of the error channel; reports beyond it are dropped (and logged).
    pub error_capacity: usize,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            default_ack_window: DEFAULT_ACK_WINDOW,
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
            max_retries: DEFAULT_MAX_RETRIES,
            delivery_capacity: DEFAULT_DELIVERY_CAPACITY,
            error_capacity: DEFAULT_ERROR_CAPACITY,
        }
    }
}

impl SubscriberConfig {
    /// Defaults overridden by `LEASEBUS_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`SubscriberConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(ms) = parse_var::<u64>(&lookup, ENV_ACK_WINDOW_MS)? {
            cfg.default_ack_window = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, ENV_MONITOR_INTERVAL_MS)? {
            cfg.monitor_interval = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var(&lookup, ENV_MAX_RETRIES)? {
            cfg.max_retries = n;
        }
        if let Some(n) = parse_var(&lookup, ENV_DELIVERY_CAPACITY)? {
            cfg.delivery_capacity = n;
        }
        if let Some(n) = parse_var(&lookup, ENV_ERROR_CAPACITY)? {
            cfg.error_capacity = n;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn with_ack_window(mut self, window: Duration) -> Self {
        self.default_ack_window = window;
        self
    }

    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn with_delivery_capacity(mut self, capacity: usize) -> Self {
        self.delivery_capacity = capacity;
        self
    }

    pub fn with_error_capacity(mut self, capacity: usize) -> Self {
        self.error_capacity = capacity;
        self
    }

    /// Check the settings are usable together.
    ///
    /// The monitor must sweep more often than leases expire, otherwise expiry
    /// detection lags by more than a full ack window.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries == 0 {
            return Err(ConfigError::Invalid("max_retries must be at least 1".into()));
        }
        if self.delivery_capacity == 0 || self.error_capacity == 0 {
            return Err(ConfigError::Invalid("channel capacities must be non-zero".into()));
        }
        if self.monitor_interval.is_zero() {
            return Err(ConfigError::Invalid("monitor_interval must be non-zero".into()));
        }
        if self.monitor_interval >= self.default_ack_window {
            return Err(ConfigError::Invalid(format!(
                "monitor_interval ({:?}) must be shorter than the ack window ({:?})",
                self.monitor_interval, self.default_ack_window
            )));
        }
        Ok(())
    }
}

fn parse_var<T: core::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { var, value: raw }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        assert!(SubscriberConfig::default().validate().is_ok());
    }

    #[test]
    fn env_overrides_defaults() {
        let cfg = SubscriberConfig::from_lookup(lookup_from(&[
            (ENV_ACK_WINDOW_MS, "5000"),
            (ENV_MONITOR_INTERVAL_MS, "250"),
            (ENV_MAX_RETRIES, "3"),
        ]))
        .unwrap();

        assert_eq!(cfg.default_ack_window, Duration::from_secs(5));
        assert_eq!(cfg.monitor_interval, Duration::from_millis(250));
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.delivery_capacity, DEFAULT_DELIVERY_CAPACITY);
    }

    #[test]
    fn unparsable_env_value_is_rejected() {
        let err = SubscriberConfig::from_lookup(lookup_from(&[(ENV_MAX_RETRIES, "many")]))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidEnv {
                var: ENV_MAX_RETRIES,
                value: "many".to_string()
            }
        );
    }

    #[test]
    fn monitor_must_sweep_faster_than_leases_expire() {
        let cfg = SubscriberConfig::default()
            .with_ack_window(Duration::from_secs(1))
            .with_monitor_interval(Duration::from_secs(1));
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn zero_retries_is_rejected() {
        let cfg = SubscriberConfig::default().with_max_retries(0);
        assert!(cfg.validate().is_err());
    }
}
