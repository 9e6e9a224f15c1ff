use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use herald_common::types::NotificationType;

/// Result type alias for producer-facing operations.
pub type Result<T> = std::result::Result<T, NotifyError>;

/// Errors returned synchronously to producers.
///
/// Anything that goes wrong after a notification was accepted is recorded on
/// the notification itself and never comes back through this type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotifyError {
    /// Backpressure: the delivery queue is at capacity.
    #[error("notification queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("notification service is shutting down")]
    ShuttingDown,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The notification is unknown, already dispatching, or settled.
    #[error("notification {0} is not pending")]
    NotPending(Uuid),

    #[error("delivery workers did not stop within {timeout:?}")]
    ShutdownTimeout { timeout: Duration },
}

/// Failure reported by a [`Dispatcher`](crate::dispatcher::Dispatcher).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// Worth retrying: timeouts, 5xx, rate limits, network blips.
    #[error("transient delivery failure: {0}")]
    Transient(String),

    /// Retrying cannot help: rejected payload, bad recipient.
    #[error("permanent delivery failure: {0}")]
    Permanent(String),

    #[error("no dispatcher registered for channel {0}")]
    Unsupported(NotificationType),
}

impl DispatchError {
    pub fn transient(message: impl Into<String>) -> Self {
        DispatchError::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        DispatchError::Permanent(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, DispatchError::Transient(_))
    }
}
