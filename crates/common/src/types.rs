use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Retry ceiling applied when a producer does not pick one.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Delivery channel a notification is sent over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    Email,
    InApp,
    Sms,
    Webhook,
    Slack,
    Discord,
}

impl NotificationType {
    pub const ALL: [NotificationType; 6] = [
        NotificationType::Email,
        NotificationType::InApp,
        NotificationType::Sms,
        NotificationType::Webhook,
        NotificationType::Slack,
        NotificationType::Discord,
    ];
}

/// Notification priority levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

/// Task-lifecycle event that produced a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    DueDate,
    Overdue,
    StatusChange,
    Created,
    Updated,
    Custom,
}

/// Notification delivery status.
///
/// `Delivered`, `Failed` and `Cancelled` are terminal. `Sent` is terminal for
/// channels that never confirm delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Pending,
    Sent,
    Delivered,
    Failed,
    Cancelled,
}

impl NotificationStatus {
    /// Whether the notification has left the delivery pipeline for good.
    pub fn is_settled(self) -> bool {
        !matches!(self, NotificationStatus::Pending)
    }

    /// Whether the notification reached its recipient's channel.
    pub fn is_success(self) -> bool {
        matches!(self, NotificationStatus::Sent | NotificationStatus::Delivered)
    }
}

/// A notification travelling through the delivery engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: i64,
    pub task_id: i64,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub priority: Priority,
    pub trigger: Trigger,
    pub status: NotificationStatus,
    pub title: String,
    pub message: String,
    /// Address or channel target (email address, phone number, webhook URL...).
    /// `None` lets the sender fall back to its configured default.
    pub recipient: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
}

impl Notification {
    pub fn new(
        user_id: i64,
        task_id: i64,
        kind: NotificationType,
        priority: Priority,
        trigger: Trigger,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            task_id,
            kind,
            priority,
            trigger,
            status: NotificationStatus::Pending,
            title: title.into(),
            message: message.into(),
            recipient: None,
            metadata: serde_json::json!({}),
            created_at: now,
            updated_at: now,
            scheduled_at: None,
            sent_at: None,
            delivered_at: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            last_error: None,
        }
    }

    pub fn with_recipient(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Stamp creation time from an injected clock instead of the wall clock.
    pub fn with_created_at(mut self, now: DateTime<Utc>) -> Self {
        self.created_at = now;
        self.updated_at = now;
        self
    }

    /// Push back the time this notification becomes eligible for dispatch.
    ///
    /// `scheduled_at` never moves backwards; an earlier `at` keeps the current
    /// value. Returns the effective eligibility time.
    pub fn defer_until(&mut self, at: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
        let effective = match self.scheduled_at {
            Some(current) if current > at => current,
            _ => at,
        };
        self.scheduled_at = Some(effective);
        self.updated_at = now;
        effective
    }

    /// Record a successful dispatch. `confirmed` channels go straight to
    /// `Delivered`.
    pub fn mark_sent(&mut self, now: DateTime<Utc>, confirmed: bool) {
        self.status = NotificationStatus::Sent;
        self.sent_at = Some(now);
        if confirmed {
            self.status = NotificationStatus::Delivered;
            self.delivered_at = Some(now);
        }
        self.updated_at = now;
    }

    /// Record a retryable dispatch failure.
    ///
    /// Returns `true` when a retry remains (the notification stays `Pending`
    /// with `retry_count` bumped), `false` when retries are exhausted and the
    /// notification is now `Failed`.
    pub fn record_failure(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> bool {
        self.last_error = Some(error.into());
        self.updated_at = now;
        if self.retry_count < self.max_retries {
            self.retry_count += 1;
            self.status = NotificationStatus::Pending;
            true
        } else {
            self.status = NotificationStatus::Failed;
            false
        }
    }

    /// Fail without consuming the retry budget (permanent errors).
    pub fn mark_failed(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.last_error = Some(error.into());
        self.status = NotificationStatus::Failed;
        self.updated_at = now;
    }

    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) {
        self.status = NotificationStatus::Cancelled;
        self.updated_at = now;
    }
}

/// Lifecycle status of a task in the external task store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[repr(i32)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending = 0,
    InProgress = 1,
    Completed = 2,
}

/// Read-only view of a task, as far as reminders are concerned.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Task {
    pub id: i64,
    pub title: String,
    pub status: TaskStatus,
    pub due_date: Option<DateTime<Utc>>,
    pub user_id: Option<i64>,
    pub is_archived: bool,
}

impl Task {
    pub fn is_completed(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    /// Past due and still open.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        !self.is_completed() && self.due_date.is_some_and(|due| due < now)
    }

    /// Due strictly after `now` and strictly before `now + window`.
    pub fn is_due_within(&self, now: DateTime<Utc>, window: Duration) -> bool {
        !self.is_completed()
            && self
                .due_date
                .is_some_and(|due| due > now && due < now + window)
    }
}

impl std::fmt::Display for NotificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationType::Email => write!(f, "email"),
            NotificationType::InApp => write!(f, "in_app"),
            NotificationType::Sms => write!(f, "sms"),
            NotificationType::Webhook => write!(f, "webhook"),
            NotificationType::Slack => write!(f, "slack"),
            NotificationType::Discord => write!(f, "discord"),
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trigger::DueDate => write!(f, "due_date"),
            Trigger::Overdue => write!(f, "overdue"),
            Trigger::StatusChange => write!(f, "status_change"),
            Trigger::Created => write!(f, "created"),
            Trigger::Updated => write!(f, "updated"),
            Trigger::Custom => write!(f, "custom"),
        }
    }
}

impl std::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationStatus::Pending => write!(f, "pending"),
            NotificationStatus::Sent => write!(f, "sent"),
            NotificationStatus::Delivered => write!(f, "delivered"),
            NotificationStatus::Failed => write!(f, "failed"),
            NotificationStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Completed => write!(f, "completed"),
        }
    }
}
