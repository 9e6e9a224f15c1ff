//! Task-lifecycle hooks.
//!
//! Thin builders that turn a task event into a [`Notification`] and hand it
//! to the send or schedule path. The reminder builders are public so the
//! scheduler produces the exact same messages.

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use herald_common::time::Clock;
use herald_common::types::{Notification, NotificationType, Priority, Task, TaskStatus, Trigger};

use crate::error::{NotifyError, Result};
use crate::service::NotificationService;

/// Free-form notification request from an application component.
#[derive(Debug, Clone)]
pub struct CustomNotification {
    pub user_id: i64,
    pub task_id: i64,
    pub kind: NotificationType,
    pub priority: Priority,
    pub title: String,
    pub message: String,
    pub recipient: Option<String>,
    /// Deliver no earlier than this; `None` sends right away.
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl NotificationService {
    /// "Task due in N minutes" reminder on the configured reminder channel.
    ///
    /// `sequence` is `(k, total)` for one reminder out of a recurring series.
    pub fn due_reminder(
        &self,
        user_id: i64,
        task: &Task,
        minutes_until_due: i64,
        sequence: Option<(u32, u32)>,
    ) -> Notification {
        let title = match sequence {
            Some((k, total)) => format!("Task Reminder {k}/{total}: {}", task.title),
            None => format!("Task Reminder: {}", task.title),
        };
        Notification::new(
            user_id,
            task.id,
            self.config().reminder_channel,
            Priority::Normal,
            Trigger::DueDate,
            title,
            format!(
                "Your task '{}' is due in {minutes_until_due} minutes.",
                task.title
            ),
        )
        .with_created_at(self.clock().now())
        .with_max_retries(self.config().max_retries)
        .with_metadata(task_metadata(task))
    }

    /// High-priority "task is N hours overdue" reminder.
    pub fn overdue_reminder(&self, user_id: i64, task: &Task, overdue_hours: i64) -> Notification {
        Notification::new(
            user_id,
            task.id,
            self.config().reminder_channel,
            Priority::High,
            Trigger::Overdue,
            format!("Overdue Task: {}", task.title),
            format!("Your task '{}' is {overdue_hours} hours overdue.", task.title),
        )
        .with_created_at(self.clock().now())
        .with_max_retries(self.config().max_retries)
        .with_metadata(task_metadata(task))
    }

    /// Remind `user_id` `lead_minutes` before the task is due.
    ///
    /// A reminder time already in the past is sent immediately.
    pub fn create_task_reminder(&self, user_id: i64, task: &Task, lead_minutes: i64) -> Result<Uuid> {
        if lead_minutes < 0 {
            return Err(NotifyError::InvalidRequest(format!(
                "reminder lead time must not be negative (got {lead_minutes})"
            )));
        }
        let due = require_due_date(task)?;
        let at = reminder_time(due, lead_minutes).ok_or_else(|| {
            NotifyError::InvalidRequest(format!(
                "reminder {lead_minutes} minutes before task {} is out of range",
                task.id
            ))
        })?;

        let notification = self.due_reminder(user_id, task, lead_minutes, None);
        self.schedule_notification(notification, at)
    }

    pub fn create_overdue_reminder(
        &self,
        user_id: i64,
        task: &Task,
        overdue_hours: i64,
    ) -> Result<Uuid> {
        self.send_notification(self.overdue_reminder(user_id, task, overdue_hours))
    }

    /// In-app notice that a task moved from `old_status` to `new_status`.
    pub fn create_status_change_notification(
        &self,
        user_id: i64,
        task: &Task,
        old_status: TaskStatus,
        new_status: TaskStatus,
    ) -> Result<Uuid> {
        if old_status == new_status {
            return Err(NotifyError::InvalidRequest(format!(
                "task {} status did not change ({new_status})",
                task.id
            )));
        }

        let notification = Notification::new(
            user_id,
            task.id,
            NotificationType::InApp,
            Priority::Normal,
            Trigger::StatusChange,
            "Task Status Updated",
            format!(
                "Task '{}' status changed from {old_status} to {new_status}",
                task.title
            ),
        )
        .with_created_at(self.clock().now())
        .with_max_retries(self.config().max_retries)
        .with_metadata(json!({
            "task_title": task.title,
            "old_status": old_status,
            "new_status": new_status,
        }));
        self.send_notification(notification)
    }

    pub fn create_custom_notification(&self, request: CustomNotification) -> Result<Uuid> {
        if request.title.trim().is_empty() {
            return Err(NotifyError::InvalidRequest(
                "notification title must not be empty".to_string(),
            ));
        }

        let mut notification = Notification::new(
            request.user_id,
            request.task_id,
            request.kind,
            request.priority,
            Trigger::Custom,
            request.title,
            request.message,
        )
        .with_created_at(self.clock().now())
        .with_max_retries(self.config().max_retries);
        if let Some(recipient) = request.recipient {
            notification = notification.with_recipient(recipient);
        }

        match request.scheduled_at {
            Some(at) => self.schedule_notification(notification, at),
            None => self.send_notification(notification),
        }
    }
}

/// `due` minus `lead_minutes`, or `None` when that falls outside the
/// representable date range.
pub fn reminder_time(due: DateTime<Utc>, lead_minutes: i64) -> Option<DateTime<Utc>> {
    Duration::try_minutes(lead_minutes).and_then(|lead| due.checked_sub_signed(lead))
}

fn require_due_date(task: &Task) -> Result<DateTime<Utc>> {
    task.due_date.ok_or_else(|| {
        NotifyError::InvalidRequest(format!("task {} has no due date", task.id))
    })
}

fn task_metadata(task: &Task) -> serde_json::Value {
    json!({
        "task_title": task.title,
        "due_date": task.due_date,
    })
}
