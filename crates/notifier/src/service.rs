//! The notification service: public face of the delivery engine.
//!
//! Owns the delivery queue, the deferred timer, the worker pool and the
//! shutdown token. Producers only ever call the non-blocking submission
//! methods; everything after acceptance happens on background tasks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use herald_common::config::AppConfig;
use herald_common::time::{Clock, SystemClock};
use herald_common::types::{DEFAULT_MAX_RETRIES, Notification, NotificationType};

use crate::dispatcher::DispatcherRegistry;
use crate::error::{NotifyError, Result};
use crate::queue::{DeliveryQueue, EnqueueError};
use crate::retry::{BackoffStrategy, RetryPolicy};
use crate::stats::{DeliveryListener, DeliveryStats, StatsRecorder, TracingListener};
use crate::timer::DeferredQueue;
use crate::worker::{WorkerContext, WorkerPool};

/// Tuning knobs for [`NotificationService`].
#[derive(Debug, Clone)]
pub struct NotifierConfig {
    pub worker_count: usize,
    pub queue_capacity: usize,
    /// Retry ceiling stamped on notifications built by the service helpers.
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub shutdown_timeout: Duration,
    /// Channel used for task reminders.
    pub reminder_channel: NotificationType,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            worker_count: 5,
            queue_capacity: 100,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(30),
            reminder_channel: NotificationType::Email,
        }
    }
}

impl From<&AppConfig> for NotifierConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            worker_count: config.worker_count,
            queue_capacity: config.queue_capacity,
            max_retries: config.max_retries,
            retry_delay: config.retry_delay(),
            shutdown_timeout: config.shutdown_timeout(),
            ..Self::default()
        }
    }
}

/// Point-in-time view of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub worker_count: usize,
    /// Notifications waiting in the timer (deferred sends and retries).
    pub deferred: usize,
    pub is_running: bool,
}

#[derive(Debug)]
struct RunningTasks {
    workers: WorkerPool,
    timer: JoinHandle<()>,
}

/// Asynchronous notification delivery engine.
#[derive(Debug)]
pub struct NotificationService {
    config: NotifierConfig,
    queue: Arc<DeliveryQueue>,
    deferred: Arc<DeferredQueue>,
    dispatchers: Arc<DispatcherRegistry>,
    retry: RetryPolicy,
    stats: Arc<StatsRecorder>,
    listener: Arc<dyn DeliveryListener>,
    clock: Arc<dyn Clock>,
    token: CancellationToken,
    running: AtomicBool,
    tasks: tokio::sync::Mutex<Option<RunningTasks>>,
}

impl NotificationService {
    /// # Panics
    ///
    /// Panics if `config.queue_capacity` is zero.
    pub fn new(config: NotifierConfig, dispatchers: DispatcherRegistry) -> Self {
        Self {
            queue: Arc::new(DeliveryQueue::new(config.queue_capacity)),
            deferred: Arc::new(DeferredQueue::new()),
            dispatchers: Arc::new(dispatchers),
            retry: RetryPolicy::fixed(config.retry_delay),
            stats: Arc::new(StatsRecorder::default()),
            listener: Arc::new(TracingListener),
            clock: Arc::new(SystemClock),
            token: CancellationToken::new(),
            running: AtomicBool::new(false),
            tasks: tokio::sync::Mutex::new(None),
            config,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn DeliveryListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the fixed retry delay with another strategy.
    pub fn with_backoff(mut self, backoff: Arc<dyn BackoffStrategy>) -> Self {
        self.retry = RetryPolicy::new(backoff);
        self
    }

    /// Spawn the worker pool and the deferred timer.
    ///
    /// Calling it on a running service is a no-op; calling it after
    /// [`stop`](Self::stop) fails with [`NotifyError::ShuttingDown`].
    pub async fn start(&self) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        if self.token.is_cancelled() {
            return Err(NotifyError::ShuttingDown);
        }
        if tasks.is_some() {
            return Ok(());
        }

        let ctx = WorkerContext {
            queue: self.queue.clone(),
            deferred: self.deferred.clone(),
            dispatchers: self.dispatchers.clone(),
            retry: self.retry.clone(),
            stats: self.stats.clone(),
            listener: self.listener.clone(),
            clock: self.clock.clone(),
            token: self.token.clone(),
        };
        let workers = WorkerPool::spawn(self.config.worker_count, &ctx);
        let timer = tokio::spawn(self.deferred.clone().run(
            self.queue.clone(),
            self.clock.clone(),
            self.token.clone(),
        ));

        *tasks = Some(RunningTasks { workers, timer });
        self.running.store(true, Ordering::SeqCst);

        tracing::info!(
            worker_count = self.config.worker_count,
            queue_capacity = self.config.queue_capacity,
            channels = ?self.dispatchers.channels(),
            "Notification service started"
        );
        Ok(())
    }

    /// Submit a notification for immediate delivery.
    ///
    /// Never waits: a full queue is reported as [`NotifyError::QueueFull`].
    pub fn send_notification(&self, notification: Notification) -> Result<Uuid> {
        self.check_accepting(&notification)?;
        self.enqueue(notification)
    }

    /// Submit a notification for delivery no earlier than `at`.
    ///
    /// A time that has already passed is treated as "now".
    pub fn schedule_notification(
        &self,
        mut notification: Notification,
        at: DateTime<Utc>,
    ) -> Result<Uuid> {
        self.check_accepting(&notification)?;

        let now = self.clock.now();
        let due = notification.defer_until(at, now);
        if due <= now {
            return self.enqueue(notification);
        }

        let id = notification.id;
        self.deferred.schedule(notification, due)?;
        self.stats.scheduled();
        tracing::debug!(notification_id = %id, scheduled_at = %due, "Notification scheduled");
        Ok(id)
    }

    /// Cancel a notification that has not been dispatched yet.
    ///
    /// Works for deferred notifications, pending retries and items still
    /// waiting in the queue. Anything already handed to a dispatcher or
    /// settled returns [`NotifyError::NotPending`].
    pub async fn cancel_notification(&self, id: Uuid) -> Result<()> {
        if let Some(mut notification) = self.deferred.withdraw(id) {
            notification.mark_cancelled(self.clock.now());
            self.stats.settled(&notification);
            self.listener.on_settled(&notification).await;
            tracing::info!(notification_id = %id, "Deferred notification cancelled");
            return Ok(());
        }

        // Settled as cancelled by whichever worker dequeues it.
        if self.queue.withdraw(id) {
            tracing::info!(notification_id = %id, "Queued notification withdrawn");
            return Ok(());
        }

        Err(NotifyError::NotPending(id))
    }

    /// Stop accepting work, let in-flight dispatches finish, and drop the rest.
    ///
    /// Waits at most `shutdown_timeout` for workers; stragglers are aborted
    /// and [`NotifyError::ShutdownTimeout`] is returned. Notifications still
    /// queued or deferred are counted as abandoned. Safe to call repeatedly.
    pub async fn stop(&self) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        self.token.cancel();

        let mut outcome = Ok(());
        if let Some(RunningTasks { workers, timer }) = tasks.take() {
            tracing::info!(
                worker_count = workers.len(),
                timeout_seconds = self.config.shutdown_timeout.as_secs(),
                "Stopping notification service"
            );
            outcome = workers.join(self.config.shutdown_timeout).await;

            let abort = timer.abort_handle();
            match tokio::time::timeout(self.config.shutdown_timeout, timer).await {
                Ok(Ok(())) => {}
                Ok(Err(join_error)) => {
                    tracing::error!(error = %join_error, "Deferred timer panicked");
                }
                Err(_elapsed) => abort.abort(),
            }
        }

        let abandoned = self.queue.close().await.len() + self.deferred.close().len();
        if abandoned > 0 {
            self.stats.abandoned(abandoned);
            tracing::warn!(abandoned, "Dropped undelivered notifications at shutdown");
        }

        if self.running.swap(false, Ordering::SeqCst) {
            tracing::info!("Notification service stopped");
        }
        outcome
    }

    pub fn queue_status(&self) -> QueueStatus {
        QueueStatus {
            queue_depth: self.queue.depth(),
            queue_capacity: self.queue.capacity(),
            worker_count: self.config.worker_count,
            deferred: self.deferred.len(),
            is_running: self.running.load(Ordering::SeqCst),
        }
    }

    pub fn stats(&self) -> DeliveryStats {
        self.stats.snapshot()
    }

    /// Notifications waiting in the timer, ordered by due time.
    pub fn deferred(&self) -> Vec<(DateTime<Utc>, Notification)> {
        self.deferred.snapshot()
    }

    /// Token cancelled when the service stops. Background loops tied to the
    /// service lifetime (such as the task scheduler) select on it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn config(&self) -> &NotifierConfig {
        &self.config
    }

    fn check_accepting(&self, notification: &Notification) -> Result<()> {
        if self.token.is_cancelled() || self.queue.is_closed() {
            return Err(NotifyError::ShuttingDown);
        }
        if notification.status.is_settled() {
            return Err(NotifyError::InvalidRequest(format!(
                "notification {} is already {}",
                notification.id, notification.status
            )));
        }
        Ok(())
    }

    fn enqueue(&self, notification: Notification) -> Result<Uuid> {
        let id = notification.id;
        match self.queue.try_enqueue(notification) {
            Ok(()) => {
                self.stats.enqueued();
                tracing::debug!(notification_id = %id, "Notification queued");
                Ok(id)
            }
            Err(EnqueueError::Full(_)) => {
                self.stats.rejected();
                tracing::warn!(
                    notification_id = %id,
                    capacity = self.queue.capacity(),
                    "Notification queue full, rejecting"
                );
                Err(NotifyError::QueueFull {
                    capacity: self.queue.capacity(),
                })
            }
            Err(EnqueueError::Closed(_)) => Err(NotifyError::ShuttingDown),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use herald_common::time::ManualClock;
    use herald_common::types::{Priority, Trigger};

    use super::*;

    fn make_notification() -> Notification {
        Notification::new(
            1,
            1,
            NotificationType::InApp,
            Priority::Normal,
            Trigger::Custom,
            "t",
            "m",
        )
    }

    fn service(capacity: usize) -> NotificationService {
        NotificationService::new(
            NotifierConfig {
                queue_capacity: capacity,
                ..NotifierConfig::default()
            },
            DispatcherRegistry::new(),
        )
    }

    #[test]
    fn test_config_from_app_config() {
        let app = AppConfig::from_lookup(|key| match key {
            "NOTIFY_WORKER_COUNT" => Some("8".to_string()),
            "NOTIFY_RETRY_DELAY_SECS" => Some("10".to_string()),
            _ => None,
        })
        .unwrap();
        let config = NotifierConfig::from(&app);
        assert_eq!(config.worker_count, 8);
        assert_eq!(config.queue_capacity, 100);
        assert_eq!(config.retry_delay, Duration::from_secs(10));
        assert_eq!(config.reminder_channel, NotificationType::Email);
    }

    #[tokio::test]
    async fn test_send_rejects_when_full() {
        let service = service(1);
        service.send_notification(make_notification()).unwrap();

        assert_eq!(
            service.send_notification(make_notification()),
            Err(NotifyError::QueueFull { capacity: 1 })
        );
        assert_eq!(service.stats().rejected, 1);
        assert_eq!(service.queue_status().queue_depth, 1);
    }

    #[tokio::test]
    async fn test_settled_notification_is_refused() {
        let service = service(4);
        let mut n = make_notification();
        n.mark_sent(Utc::now(), false);
        assert!(matches!(
            service.send_notification(n),
            Err(NotifyError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_schedule_in_past_goes_straight_to_queue() {
        let clock = ManualClock::new(Utc::now());
        let service = service(4).with_clock(Arc::new(clock.clone()));

        service
            .schedule_notification(make_notification(), clock.now() - ChronoDuration::minutes(5))
            .unwrap();
        service
            .schedule_notification(make_notification(), clock.now() + ChronoDuration::minutes(5))
            .unwrap();

        let status = service.queue_status();
        assert_eq!(status.queue_depth, 1);
        assert_eq!(status.deferred, 1);
        assert_eq!(service.deferred()[0].0, clock.now() + ChronoDuration::minutes(5));
    }

    #[tokio::test]
    async fn test_cancel_deferred_and_unknown() {
        let service = service(4);
        let n = make_notification();
        let id = service
            .schedule_notification(n, Utc::now() + ChronoDuration::hours(1))
            .unwrap();

        service.cancel_notification(id).await.unwrap();
        assert_eq!(service.stats().cancelled, 1);
        assert_eq!(service.queue_status().deferred, 0);
        assert_eq!(
            service.cancel_notification(id).await,
            Err(NotifyError::NotPending(id))
        );
    }

    #[tokio::test]
    async fn test_stop_without_start_abandons_pending_work() {
        let service = service(4);
        service.send_notification(make_notification()).unwrap();
        service
            .schedule_notification(make_notification(), Utc::now() + ChronoDuration::hours(1))
            .unwrap();

        service.stop().await.unwrap();
        assert_eq!(service.stats().abandoned, 2);
        assert_eq!(
            service.send_notification(make_notification()),
            Err(NotifyError::ShuttingDown)
        );
        assert_eq!(service.start().await, Err(NotifyError::ShuttingDown));
        service.stop().await.unwrap();
        assert_eq!(service.stats().abandoned, 2);
    }
}
