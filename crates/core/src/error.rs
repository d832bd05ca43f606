//! Error model shared by publishers, subscribers and broker backends.

use thiserror::Error;

use crate::id::MessageId;

/// Result type used across the client surface.
pub type PubSubResult<T> = Result<T, PubSubError>;

/// Lease lookup failure, returned synchronously from Ack / Extend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LeaseError {
    /// The lease is unknown, already acked, or permanently dropped.
    #[error("no outstanding lease for message {0}")]
    NotFound(MessageId),
}

/// Failure reported by a broker backend.
///
/// Backends classify their own failures; the engine only distinguishes
/// per-message problems (skip and continue) from fatal connectivity loss.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Network / broker failure. `fatal` means the backend gave up retrying.
    #[error("transport error: {message}")]
    Transport { message: String, fatal: bool },

    /// A received payload could not be decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl BackendError {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport {
            message: msg.into(),
            fatal: false,
        }
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Transport {
            message: msg.into(),
            fatal: true,
        }
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport { fatal: true, .. })
    }
}

/// Client-level error.
///
/// Returned from `publish`, `ack_message` and `extend_ack_deadline`, and
/// reported asynchronously on a subscriber's error channel.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PubSubError {
    /// Backend or network failure. A fatal transport error ends the subscription.
    #[error("transport error: {message}")]
    Transport { message: String, fatal: bool },

    /// Malformed payload (publish side: encode failure; receive side: decode failure).
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Lease(#[from] LeaseError),

    /// The caller's context was cancelled before the operation completed.
    #[error("operation cancelled")]
    Cancelled,

    /// The message exceeded its redelivery budget and was dropped for good.
    #[error("poison message {message_id} dropped after {delivery_count} deliveries")]
    PoisonMessage {
        message_id: MessageId,
        delivery_count: u32,
    },

    /// `start` was called while a previous subscription is still running.
    #[error("subscription already running")]
    AlreadyStarted,
}

impl PubSubError {
    pub fn not_found(id: impl Into<MessageId>) -> Self {
        Self::Lease(LeaseError::NotFound(id.into()))
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Lease(LeaseError::NotFound(_)))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport { fatal: true, .. })
    }
}

impl From<BackendError> for PubSubError {
    fn from(value: BackendError) -> Self {
        match value {
            BackendError::Transport { message, fatal } => Self::Transport { message, fatal },
            BackendError::Serialization(msg) => Self::Serialization(msg),
        }
    }
}

impl From<serde_json::Error> for PubSubError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_errors_keep_their_classification() {
        let fatal: PubSubError = BackendError::fatal("connection refused").into();
        assert!(fatal.is_fatal());

        let transient: PubSubError = BackendError::transport("timeout").into();
        assert!(!transient.is_fatal());

        let bad: PubSubError = BackendError::serialization("truncated").into();
        assert_eq!(bad, PubSubError::Serialization("truncated".to_string()));
    }

    #[test]
    fn not_found_is_recognizable() {
        let err = PubSubError::not_found("m1");
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "no outstanding lease for message m1");
    }
}
