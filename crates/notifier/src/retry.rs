//! Retry policy for failed dispatches.
//!
//! The retry ceiling lives on each notification (`max_retries`); this module
//! only decides *when* the next attempt happens. The delay itself comes from a
//! pluggable [`BackoffStrategy`] so the worker loop never changes when the
//! policy does.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use herald_common::types::Notification;

use crate::error::DispatchError;

/// Computes the wait before a retry.
pub trait BackoffStrategy: Send + Sync + std::fmt::Debug {
    /// Delay before retry number `retry` (1-based).
    fn delay(&self, retry: u32) -> Duration;
}

/// Same delay before every retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedBackoff {
    pub delay: Duration,
}

impl FixedBackoff {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl BackoffStrategy for FixedBackoff {
    fn delay(&self, _retry: u32) -> Duration {
        self.delay
    }
}

/// Delay doubles with each retry, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }
}

impl BackoffStrategy for ExponentialBackoff {
    fn delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

/// What the worker should do with a notification after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enqueue once `at` has passed.
    Retry { at: DateTime<Utc> },
    /// The notification is now `Failed`.
    GiveUp { reason: String },
}

/// Applies a failed attempt to a notification and picks the next step.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    backoff: Arc<dyn BackoffStrategy>,
}

impl RetryPolicy {
    pub fn new(backoff: Arc<dyn BackoffStrategy>) -> Self {
        Self { backoff }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self::new(Arc::new(FixedBackoff::new(delay)))
    }

    /// Record `error` on `notification` and decide whether to retry.
    ///
    /// Non-retryable errors fail the notification without touching
    /// `retry_count`. Otherwise the retry budget is consumed as described on
    /// [`Notification::record_failure`].
    pub fn on_failure(
        &self,
        notification: &mut Notification,
        error: &DispatchError,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        if !error.is_retryable() {
            notification.mark_failed(error.to_string(), now);
            return RetryDecision::GiveUp {
                reason: format!("non-retryable error: {error}"),
            };
        }

        if !notification.record_failure(error.to_string(), now) {
            return RetryDecision::GiveUp {
                reason: format!(
                    "retries exhausted after {} attempts",
                    notification.retry_count + 1
                ),
            };
        }

        let delay = self.backoff.delay(notification.retry_count);
        let Ok(delay) = chrono::Duration::from_std(delay) else {
            notification.mark_failed(error.to_string(), now);
            return RetryDecision::GiveUp {
                reason: "retry delay out of range".to_string(),
            };
        };

        RetryDecision::Retry { at: now + delay }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(300))
    }
}
