//! End-to-end tests for the delivery pipeline.
//!
//! Everything runs in memory with fake dispatchers:
//!
//! ```bash
//! cargo test -p herald-notifier --test integration
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use herald_common::types::{Notification, NotificationStatus, NotificationType, Priority, Trigger};
use herald_notifier::retry::ExponentialBackoff;
use herald_notifier::{
    Delivery, DeliveryListener, DispatchError, Dispatcher, DispatcherRegistry, NotificationService,
    NotifierConfig, NotifyError,
};

// ============================================================
// Fakes
// ============================================================

/// Succeeds every time; `confirm` selects `Confirmed` over `Accepted`.
#[derive(Debug, Default)]
struct AlwaysOk {
    confirm: bool,
    attempts: AtomicU32,
}

#[async_trait]
impl Dispatcher for AlwaysOk {
    async fn send(&self, _notification: &Notification) -> Result<Delivery, DispatchError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Ok(if self.confirm {
            Delivery::Confirmed
        } else {
            Delivery::Accepted
        })
    }
}

/// Fails every time with the configured error.
#[derive(Debug)]
struct AlwaysFail {
    error: DispatchError,
    attempts: AtomicU32,
}

impl AlwaysFail {
    fn transient() -> Self {
        Self {
            error: DispatchError::transient("connection reset"),
            attempts: AtomicU32::new(0),
        }
    }

    fn permanent() -> Self {
        Self {
            error: DispatchError::permanent("mailbox does not exist"),
            attempts: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Dispatcher for AlwaysFail {
    async fn send(&self, _notification: &Notification) -> Result<Delivery, DispatchError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }
}

/// Fails the first `failures` attempts, then succeeds.
#[derive(Debug)]
struct Intermittent {
    failures: u32,
    attempts: AtomicU32,
}

#[async_trait]
impl Dispatcher for Intermittent {
    async fn send(&self, _notification: &Notification) -> Result<Delivery, DispatchError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            Err(DispatchError::transient("503 service unavailable"))
        } else {
            Ok(Delivery::Accepted)
        }
    }
}

/// Takes `delay` per dispatch.
#[derive(Debug)]
struct Slow {
    delay: Duration,
    attempts: AtomicU32,
}

#[async_trait]
impl Dispatcher for Slow {
    async fn send(&self, _notification: &Notification) -> Result<Delivery, DispatchError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(Delivery::Accepted)
    }
}

/// Collects every settled notification.
#[derive(Debug, Default)]
struct RecordingListener {
    settled: Mutex<Vec<Notification>>,
}

impl RecordingListener {
    fn settled(&self) -> Vec<Notification> {
        self.settled.lock().unwrap().clone()
    }

    /// Poll until at least `count` notifications settled or `timeout` passes.
    async fn wait_for(&self, count: usize, timeout: Duration) -> Vec<Notification> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let settled = self.settled();
            if settled.len() >= count || tokio::time::Instant::now() >= deadline {
                return settled;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl DeliveryListener for RecordingListener {
    async fn on_settled(&self, notification: &Notification) {
        self.settled.lock().unwrap().push(notification.clone());
    }
}

// ============================================================
// Shared helpers
// ============================================================

const WAIT: Duration = Duration::from_secs(5);

fn config(worker_count: usize, queue_capacity: usize) -> NotifierConfig {
    NotifierConfig {
        worker_count,
        queue_capacity,
        retry_delay: Duration::from_millis(10),
        shutdown_timeout: Duration::from_secs(2),
        ..NotifierConfig::default()
    }
}

fn build(
    config: NotifierConfig,
    dispatcher: Arc<dyn Dispatcher>,
) -> (Arc<NotificationService>, Arc<RecordingListener>) {
    let listener = Arc::new(RecordingListener::default());
    let service = NotificationService::new(config, DispatcherRegistry::new().with_all(dispatcher))
        .with_listener(listener.clone());
    (Arc::new(service), listener)
}

fn make_notification(user_id: i64) -> Notification {
    Notification::new(
        user_id,
        user_id * 10,
        NotificationType::Email,
        Priority::Normal,
        Trigger::DueDate,
        "Task Reminder: Quarterly report",
        "Your task 'Quarterly report' is due in 30 minutes.",
    )
}

// ============================================================
// Delivery outcomes
// ============================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_producers_all_delivered() {
    let dispatcher = Arc::new(AlwaysOk::default());
    let (service, listener) = build(config(5, 128), dispatcher.clone());
    service.start().await.unwrap();

    let producers: Vec<_> = (0..10)
        .map(|producer| {
            let service = service.clone();
            tokio::spawn(async move {
                for _ in 0..10 {
                    service.send_notification(make_notification(producer)).unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.await.unwrap();
    }

    let settled = listener.wait_for(100, WAIT).await;
    assert_eq!(settled.len(), 100);
    assert!(settled.iter().all(|n| n.status == NotificationStatus::Sent));
    assert!(settled.iter().all(|n| n.retry_count == 0 && n.sent_at.is_some()));
    assert_eq!(dispatcher.attempts.load(Ordering::SeqCst), 100);

    let status = service.queue_status();
    assert_eq!(status.queue_depth, 0);
    assert_eq!(status.worker_count, 5);
    assert!(status.is_running);

    let stats = service.stats();
    assert_eq!(stats.enqueued, 100);
    assert_eq!(stats.sent, 100);
    assert_eq!(stats.by_type[&NotificationType::Email], 100);

    service.stop().await.unwrap();
}

#[tokio::test]
async fn test_always_failing_dispatcher_exhausts_retries() {
    let dispatcher = Arc::new(AlwaysFail::transient());
    let (service, listener) = build(config(2, 16), dispatcher.clone());
    service.start().await.unwrap();

    service
        .send_notification(make_notification(1).with_max_retries(3))
        .unwrap();

    let settled = listener.wait_for(1, WAIT).await;
    assert_eq!(settled.len(), 1);
    let failed = &settled[0];
    assert_eq!(failed.status, NotificationStatus::Failed);
    assert_eq!(failed.retry_count, 3);
    assert!(failed.last_error.as_deref().unwrap().contains("connection reset"));
    assert_eq!(dispatcher.attempts.load(Ordering::SeqCst), 4);

    let stats = service.stats();
    assert_eq!(stats.retried, 3);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.dispatch_attempts, 4);

    service.stop().await.unwrap();
}

#[tokio::test]
async fn test_confirmed_on_first_attempt() {
    let dispatcher = Arc::new(AlwaysOk {
        confirm: true,
        ..AlwaysOk::default()
    });
    let (service, listener) = build(config(1, 4), dispatcher.clone());
    service.start().await.unwrap();

    let id = service.send_notification(make_notification(1)).unwrap();

    let settled = listener.wait_for(1, WAIT).await;
    assert_eq!(settled[0].id, id);
    assert_eq!(settled[0].status, NotificationStatus::Delivered);
    assert_eq!(settled[0].retry_count, 0);
    assert!(settled[0].delivered_at.is_some());
    assert_eq!(dispatcher.attempts.load(Ordering::SeqCst), 1);

    service.stop().await.unwrap();
}

#[tokio::test]
async fn test_intermittent_failure_recovers() {
    let dispatcher = Arc::new(Intermittent {
        failures: 2,
        attempts: AtomicU32::new(0),
    });
    let (service, listener) = build(config(1, 4), dispatcher.clone());
    service.start().await.unwrap();

    service.send_notification(make_notification(1)).unwrap();

    let settled = listener.wait_for(1, WAIT).await;
    assert_eq!(settled[0].status, NotificationStatus::Sent);
    assert_eq!(settled[0].retry_count, 2);
    assert!(settled[0].last_error.is_some());
    assert!(settled[0].scheduled_at.is_some());
    assert_eq!(dispatcher.attempts.load(Ordering::SeqCst), 3);

    service.stop().await.unwrap();
}

#[tokio::test]
async fn test_permanent_error_skips_retries() {
    let dispatcher = Arc::new(AlwaysFail::permanent());
    let (service, listener) = build(config(1, 4), dispatcher.clone());
    service.start().await.unwrap();

    service.send_notification(make_notification(1)).unwrap();

    let settled = listener.wait_for(1, WAIT).await;
    assert_eq!(settled[0].status, NotificationStatus::Failed);
    assert_eq!(settled[0].retry_count, 0);
    assert_eq!(dispatcher.attempts.load(Ordering::SeqCst), 1);

    service.stop().await.unwrap();
}

#[tokio::test]
async fn test_unregistered_channel_fails() {
    let listener = Arc::new(RecordingListener::default());
    let registry = DispatcherRegistry::new()
        .with(NotificationType::InApp, Arc::new(AlwaysOk::default()));
    let service =
        NotificationService::new(config(1, 4), registry).with_listener(listener.clone());
    service.start().await.unwrap();

    service.send_notification(make_notification(1)).unwrap();

    let settled = listener.wait_for(1, WAIT).await;
    assert_eq!(settled[0].status, NotificationStatus::Failed);
    assert!(settled[0].last_error.as_deref().unwrap().contains("email"));
    assert_eq!(service.stats().retried, 0);

    service.stop().await.unwrap();
}

#[tokio::test]
async fn test_exponential_backoff_strategy() {
    let dispatcher = Arc::new(Intermittent {
        failures: 3,
        attempts: AtomicU32::new(0),
    });
    let listener = Arc::new(RecordingListener::default());
    let service = NotificationService::new(
        config(1, 4),
        DispatcherRegistry::new().with_all(dispatcher.clone()),
    )
    .with_listener(listener.clone())
    .with_backoff(Arc::new(ExponentialBackoff::new(
        Duration::from_millis(5),
        Duration::from_millis(20),
    )));
    service.start().await.unwrap();

    let created = Utc::now();
    service.send_notification(make_notification(1)).unwrap();

    let settled = listener.wait_for(1, WAIT).await;
    assert_eq!(settled[0].status, NotificationStatus::Sent);
    assert_eq!(settled[0].retry_count, 3);
    // 5 + 10 + 20 ms of backoff at least
    let elapsed = settled[0].sent_at.unwrap() - created;
    assert!(elapsed >= chrono::Duration::milliseconds(35));

    service.stop().await.unwrap();
}

// ============================================================
// Backpressure, scheduling and cancellation
// ============================================================

#[tokio::test]
async fn test_full_queue_errors_immediately() {
    let (service, _listener) = build(config(1, 3), Arc::new(AlwaysOk::default()));

    for user in 0..3 {
        service.send_notification(make_notification(user)).unwrap();
    }

    let started = std::time::Instant::now();
    let result = service.send_notification(make_notification(99));
    assert_eq!(result, Err(NotifyError::QueueFull { capacity: 3 }));
    assert!(started.elapsed() < Duration::from_millis(100));
    assert_eq!(service.stats().rejected, 1);
}

#[tokio::test]
async fn test_scheduled_notification_fires_after_delay() {
    let dispatcher = Arc::new(AlwaysOk::default());
    let (service, listener) = build(config(1, 4), dispatcher.clone());
    service.start().await.unwrap();

    let at = Utc::now() + chrono::Duration::milliseconds(80);
    let id = service
        .schedule_notification(make_notification(1), at)
        .unwrap();
    assert_eq!(service.queue_status().deferred, 1);

    let settled = listener.wait_for(1, WAIT).await;
    assert_eq!(settled[0].id, id);
    assert_eq!(settled[0].scheduled_at, Some(at));
    assert!(settled[0].sent_at.unwrap() >= at);
    assert_eq!(service.queue_status().deferred, 0);

    service.stop().await.unwrap();
}

#[tokio::test]
async fn test_cancel_queued_notification() {
    let dispatcher = Arc::new(AlwaysOk::default());
    let (service, listener) = build(config(1, 4), dispatcher.clone());

    let cancelled = service.send_notification(make_notification(1)).unwrap();
    let kept = service.send_notification(make_notification(2)).unwrap();
    service.cancel_notification(cancelled).await.unwrap();
    service.start().await.unwrap();

    let settled = listener.wait_for(2, WAIT).await;
    let status_of = |id| settled.iter().find(|n| n.id == id).map(|n| n.status);
    assert_eq!(status_of(cancelled), Some(NotificationStatus::Cancelled));
    assert_eq!(status_of(kept), Some(NotificationStatus::Sent));
    assert_eq!(dispatcher.attempts.load(Ordering::SeqCst), 1);

    assert_eq!(
        service.cancel_notification(kept).await,
        Err(NotifyError::NotPending(kept))
    );
    service.stop().await.unwrap();
}

// ============================================================
// Shutdown
// ============================================================

#[tokio::test]
async fn test_no_dispatch_after_stop() -> anyhow::Result<()> {
    let dispatcher = Arc::new(Slow {
        delay: Duration::from_millis(30),
        attempts: AtomicU32::new(0),
    });
    let (service, _listener) = build(config(2, 32), dispatcher.clone());
    service.start().await?;

    for user in 0..20 {
        service.send_notification(make_notification(user))?;
    }
    tokio::time::sleep(Duration::from_millis(40)).await;

    service.stop().await?;
    let attempts = dispatcher.attempts.load(Ordering::SeqCst);
    assert!(attempts < 20);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(dispatcher.attempts.load(Ordering::SeqCst), attempts);

    assert_eq!(
        service.send_notification(make_notification(1)),
        Err(NotifyError::ShuttingDown)
    );
    assert!(!service.queue_status().is_running);
    assert_eq!(service.stats().abandoned, u64::from(20 - attempts));

    // Idempotent
    service.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_stop_cancels_deferred_sends() {
    let dispatcher = Arc::new(AlwaysOk::default());
    let (service, _listener) = build(config(1, 4), dispatcher.clone());
    service.start().await.unwrap();

    service
        .schedule_notification(make_notification(1), Utc::now() + chrono::Duration::hours(1))
        .unwrap();
    service.stop().await.unwrap();

    assert_eq!(service.queue_status().deferred, 0);
    assert_eq!(service.stats().abandoned, 1);
    assert_eq!(dispatcher.attempts.load(Ordering::SeqCst), 0);
    assert_eq!(
        service.schedule_notification(make_notification(1), Utc::now()),
        Err(NotifyError::ShuttingDown)
    );
}

#[tokio::test]
async fn test_stop_times_out_on_stuck_dispatcher() {
    let dispatcher = Arc::new(Slow {
        delay: Duration::from_secs(30),
        attempts: AtomicU32::new(0),
    });
    let (service, _listener) = build(
        NotifierConfig {
            shutdown_timeout: Duration::from_millis(50),
            ..config(1, 4)
        },
        dispatcher.clone(),
    );
    service.start().await.unwrap();
    service.send_notification(make_notification(1)).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let result = service.stop().await;
    assert_eq!(
        result,
        Err(NotifyError::ShutdownTimeout {
            timeout: Duration::from_millis(50)
        })
    );
    assert!(!service.queue_status().is_running);
}
