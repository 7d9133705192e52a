//! Error types for message bus adapters.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum BusError {
    // Connection lifecycle
    #[error("Connection refused by broker at {url}: {reason}")]
    ConnectionRefused { url: String, reason: String },

    #[error("Broker at {url} reached its connection limit: {reason}")]
    ResourceExhausted { url: String, reason: String },

    #[error("Connection backoff active for {url}, retry in {retry_in_secs}s")]
    BackoffActive { url: String, retry_in_secs: u64 },

    // Runtime failures
    #[error("Transient broker error on {topic}: {reason}")]
    Transient { topic: String, reason: String },

    #[error("Failed to serialize message for {topic}: {reason}")]
    Serialization { topic: String, reason: String },

    #[error("Malformed message {message_id} on {topic}: {reason}")]
    MalformedMessage {
        topic: String,
        message_id: String,
        reason: String,
    },

    #[error("Unknown subscription: {id}")]
    UnknownSubscription { id: String },

    #[error("Bus adapter is closed")]
    Closed,

    #[error("Unsupported bus operation: {0}")]
    Unsupported(String),
}

impl BusError {
    /// Whether a caller may retry the operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BusError::ConnectionRefused { .. }
                | BusError::ResourceExhausted { .. }
                | BusError::BackoffActive { .. }
                | BusError::Transient { .. }
        )
    }

    /// Suggested wait before retrying, when the error carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            BusError::BackoffActive { retry_in_secs, .. } => {
                Some(Duration::from_secs(*retry_in_secs))
            }
            _ => None,
        }
    }

    pub fn transient(topic: &str, reason: impl ToString) -> Self {
        BusError::Transient {
            topic: topic.to_string(),
            reason: reason.to_string(),
        }
    }
}

pub type BusResult<T> = std::result::Result<T, BusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_display_includes_retry_hint() {
        let error = BusError::BackoffActive {
            url: "redis://localhost:6379".to_string(),
            retry_in_secs: 42,
        };
        assert_eq!(
            error.to_string(),
            "Connection backoff active for redis://localhost:6379, retry in 42s"
        );
        assert_eq!(error.retry_after(), Some(Duration::from_secs(42)));
        assert!(error.is_retryable());
    }

    #[test]
    fn test_malformed_is_not_retryable() {
        let error = BusError::MalformedMessage {
            topic: "audio".to_string(),
            message_id: "1-0".to_string(),
            reason: "missing data field".to_string(),
        };
        assert!(!error.is_retryable());
        assert!(error.retry_after().is_none());
    }
}
