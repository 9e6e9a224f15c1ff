//! Delivery statistics and settlement notifications.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::Serialize;

use herald_common::types::{Notification, NotificationStatus, NotificationType, Priority, Trigger};

/// Counters describing everything the engine has done since startup.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeliveryStats {
    /// Accepted onto the delivery queue by `send_notification`.
    pub enqueued: u64,
    /// Accepted into the deferred timer queue by `schedule_notification`.
    pub scheduled: u64,
    /// Refused because the queue was full.
    pub rejected: u64,
    pub dispatch_attempts: u64,
    /// Successful dispatches (`sent` or `delivered`).
    pub sent: u64,
    /// Subset of `sent` confirmed by the channel.
    pub delivered: u64,
    pub retried: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Dropped at shutdown while still queued or deferred.
    pub abandoned: u64,
    pub by_type: HashMap<NotificationType, u64>,
    pub by_priority: HashMap<Priority, u64>,
    pub by_trigger: HashMap<Trigger, u64>,
    total_delivery_ms: u64,
}

impl DeliveryStats {
    /// Share of settled dispatches that succeeded, in `[0, 1]`.
    pub fn success_rate(&self) -> f64 {
        let settled = self.sent + self.failed;
        if settled == 0 {
            return 0.0;
        }
        self.sent as f64 / settled as f64
    }

    /// Mean time from creation to successful send.
    pub fn average_delivery_ms(&self) -> Option<u64> {
        (self.sent > 0).then(|| self.total_delivery_ms / self.sent)
    }

    fn record_settled(&mut self, notification: &Notification) {
        match notification.status {
            NotificationStatus::Sent | NotificationStatus::Delivered => {
                self.sent += 1;
                if notification.status == NotificationStatus::Delivered {
                    self.delivered += 1;
                }
                if let Some(sent_at) = notification.sent_at {
                    let elapsed = (sent_at - notification.created_at).num_milliseconds();
                    self.total_delivery_ms += u64::try_from(elapsed).unwrap_or(0);
                }
            }
            NotificationStatus::Failed => self.failed += 1,
            NotificationStatus::Cancelled => self.cancelled += 1,
            NotificationStatus::Pending => return,
        }
        *self.by_type.entry(notification.kind).or_default() += 1;
        *self.by_priority.entry(notification.priority).or_default() += 1;
        *self.by_trigger.entry(notification.trigger).or_default() += 1;
    }
}

/// Thread-safe recorder shared by producers and workers.
#[derive(Debug, Default)]
pub(crate) struct StatsRecorder {
    inner: Mutex<DeliveryStats>,
}

impl StatsRecorder {
    pub(crate) fn snapshot(&self) -> DeliveryStats {
        self.lock().clone()
    }

    pub(crate) fn enqueued(&self) {
        self.lock().enqueued += 1;
    }

    pub(crate) fn scheduled(&self) {
        self.lock().scheduled += 1;
    }

    pub(crate) fn rejected(&self) {
        self.lock().rejected += 1;
    }

    pub(crate) fn attempt(&self) {
        self.lock().dispatch_attempts += 1;
    }

    pub(crate) fn retried(&self) {
        self.lock().retried += 1;
    }

    pub(crate) fn abandoned(&self, count: usize) {
        self.lock().abandoned += count as u64;
    }

    pub(crate) fn settled(&self, notification: &Notification) {
        self.lock().record_settled(notification);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DeliveryStats> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Observer for notifications leaving the pipeline.
///
/// Called once per notification that reaches `sent`, `delivered`, `failed`
/// or `cancelled`. Implementations should return quickly; they run on the
/// delivery worker.
#[async_trait]
pub trait DeliveryListener: Send + Sync + std::fmt::Debug {
    async fn on_settled(&self, notification: &Notification);
}

/// Default listener: one structured log line per settled notification.
#[derive(Debug, Default)]
pub struct TracingListener;

#[async_trait]
impl DeliveryListener for TracingListener {
    async fn on_settled(&self, notification: &Notification) {
        if notification.status == NotificationStatus::Failed {
            tracing::warn!(
                notification_id = %notification.id,
                task_id = notification.task_id,
                channel = %notification.kind,
                retry_count = notification.retry_count,
                error = notification.last_error.as_deref().unwrap_or_default(),
                "Notification failed"
            );
        } else {
            tracing::info!(
                notification_id = %notification.id,
                task_id = notification.task_id,
                channel = %notification.kind,
                status = %notification.status,
                "Notification settled"
            );
        }
    }
}
