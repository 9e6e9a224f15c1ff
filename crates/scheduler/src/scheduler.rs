//! Task scheduler.
//!
//! Every tick it scans the task store and turns two conditions into
//! notifications:
//! 1. Overdue, not completed tasks → high-priority overdue reminders
//! 2. Tasks due within the lookahead window → due-soon reminders
//!
//! It also schedules explicit one-shot and recurring reminders ahead of a
//! task's due date. The scheduler stops with the notification service it
//! feeds.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use herald_common::config::AppConfig;
use herald_common::time::Clock;
use herald_common::types::{Notification, Task};
use herald_notifier::hooks::reminder_time;
use herald_notifier::{NotificationService, NotifyError};

use crate::cooldown::{ReminderCooldown, ReminderKey};
use crate::error::SchedulerError;
use crate::repository::TaskRepository;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Time between scans.
    pub interval: Duration,
    /// How far ahead a task counts as "due soon".
    pub due_soon_window: chrono::Duration,
    /// Minimum gap between two overdue reminders for one task.
    pub overdue_interval: chrono::Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            due_soon_window: chrono::Duration::minutes(60),
            overdue_interval: chrono::Duration::hours(24),
        }
    }
}

impl From<&AppConfig> for SchedulerConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            interval: config.scheduler_interval(),
            due_soon_window: chrono::Duration::minutes(config.due_soon_window_minutes),
            overdue_interval: chrono::Duration::hours(config.overdue_reminder_interval_hours),
        }
    }
}

/// Outcome of one scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub overdue_found: usize,
    pub due_soon_found: usize,
    /// Reminders accepted by the notification service.
    pub submitted: usize,
    /// Reminders skipped because the same one went out recently.
    pub suppressed: usize,
    /// Tasks with nobody to notify.
    pub unassigned: usize,
    /// Failed repository queries and rejected submissions.
    pub errors: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerStatus {
    pub is_running: bool,
    pub interval: Duration,
    pub ticks: u64,
}

pub struct Scheduler {
    repository: Arc<dyn TaskRepository>,
    service: Arc<NotificationService>,
    config: SchedulerConfig,
    cooldown: ReminderCooldown,
    running: AtomicBool,
    ticks: AtomicU64,
}

impl Scheduler {
    pub fn new(
        repository: Arc<dyn TaskRepository>,
        service: Arc<NotificationService>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            repository,
            service,
            config,
            cooldown: ReminderCooldown::new(),
            running: AtomicBool::new(false),
            ticks: AtomicU64::new(0),
        }
    }

    /// Scan on every tick until the notification service shuts down.
    ///
    /// The first scan runs immediately.
    pub async fn run(&self) {
        let shutdown = self.service.shutdown_token();
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.running.store(true, Ordering::SeqCst);
        tracing::info!(
            interval_secs = self.config.interval.as_secs(),
            due_soon_minutes = self.config.due_soon_window.num_minutes(),
            "Task scheduler started"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            // A hung query must not outlive the service.
            let report = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                report = self.scan_once() => report,
            };
            let tick = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;

            if report.submitted > 0 || report.errors > 0 {
                tracing::info!(
                    tick,
                    overdue = report.overdue_found,
                    due_soon = report.due_soon_found,
                    submitted = report.submitted,
                    suppressed = report.suppressed,
                    errors = report.errors,
                    "Task scan complete"
                );
            } else {
                tracing::debug!(tick, suppressed = report.suppressed, "Task scan complete");
            }
        }

        self.running.store(false, Ordering::SeqCst);
        tracing::info!("Task scheduler stopped");
    }

    /// Run one scan pass.
    ///
    /// A failing query or submission is logged and counted; the rest of the
    /// pass carries on.
    pub async fn scan_once(&self) -> ScanReport {
        let now = self.service.clock().now();
        let mut report = ScanReport::default();
        self.cooldown.prune(now);

        match self.repository.overdue_tasks(now).await {
            Ok(tasks) => {
                for task in tasks.iter().filter(|task| !task.is_archived && task.is_overdue(now)) {
                    report.overdue_found += 1;
                    self.remind_overdue(task, now, &mut report);
                }
            }
            Err(err) => {
                report.errors += 1;
                tracing::warn!(
                    error = %err,
                    transient = err.is_transient(),
                    "Overdue task query failed"
                );
            }
        }

        match self.repository.all_tasks().await {
            Ok(tasks) => {
                for task in tasks
                    .iter()
                    .filter(|task| !task.is_archived && task.is_due_within(now, self.config.due_soon_window))
                {
                    report.due_soon_found += 1;
                    self.remind_due_soon(task, now, &mut report);
                }
            }
            Err(err) => {
                report.errors += 1;
                tracing::warn!(
                    error = %err,
                    transient = err.is_transient(),
                    "Task listing failed"
                );
            }
        }

        report
    }

    fn remind_overdue(&self, task: &Task, now: DateTime<Utc>, report: &mut ScanReport) {
        let (Some(user_id), Some(due)) = (task.user_id, task.due_date) else {
            report.unassigned += 1;
            return;
        };

        let key = ReminderKey::Overdue(task.id);
        if !self
            .cooldown
            .check_and_set(key, now, now + self.config.overdue_interval)
        {
            report.suppressed += 1;
            return;
        }

        let overdue_hours = (now - due).num_hours();
        let notification = self.service.overdue_reminder(user_id, task, overdue_hours);
        self.submit(task, key, notification, report);
    }

    fn remind_due_soon(&self, task: &Task, now: DateTime<Utc>, report: &mut ScanReport) {
        let (Some(user_id), Some(due)) = (task.user_id, task.due_date) else {
            report.unassigned += 1;
            return;
        };

        let key = ReminderKey::DueSoon {
            task_id: task.id,
            due,
        };
        if !self.cooldown.check_and_set(key, now, due) {
            report.suppressed += 1;
            return;
        }

        let minutes_until_due = (due - now).num_minutes();
        let notification = self
            .service
            .due_reminder(user_id, task, minutes_until_due, None);
        self.submit(task, key, notification, report);
    }

    fn submit(
        &self,
        task: &Task,
        key: ReminderKey,
        notification: Notification,
        report: &mut ScanReport,
    ) {
        match self.service.send_notification(notification) {
            Ok(id) => {
                report.submitted += 1;
                tracing::debug!(task_id = task.id, notification_id = %id, "Reminder submitted");
            }
            Err(err) => {
                // Let the next tick try again.
                self.cooldown.clear(key);
                report.errors += 1;
                tracing::warn!(task_id = task.id, error = %err, "Reminder submission failed");
            }
        }
    }

    /// Schedule one reminder `lead_minutes` before the task is due.
    ///
    /// Fails with [`SchedulerError::InvalidRequest`] when the task has no due
    /// date or the reminder time has already passed; nothing is enqueued then.
    pub async fn schedule_task_reminder(
        &self,
        user_id: i64,
        task_id: i64,
        lead_minutes: i64,
    ) -> Result<Uuid, SchedulerError> {
        if lead_minutes < 0 {
            return Err(SchedulerError::InvalidRequest(format!(
                "reminder lead time must not be negative (got {lead_minutes})"
            )));
        }
        let (task, due) = self.task_with_due_date(task_id).await?;

        let at = reminder_time(due, lead_minutes).ok_or_else(|| {
            SchedulerError::InvalidRequest(format!(
                "reminder {lead_minutes} minutes before task {task_id} is out of range"
            ))
        })?;
        let now = self.service.clock().now();
        if at <= now {
            return Err(SchedulerError::InvalidRequest(format!(
                "reminder time {at} for task {task_id} is in the past"
            )));
        }

        let notification = self.service.due_reminder(user_id, &task, lead_minutes, None);
        let id = self.service.schedule_notification(notification, at)?;
        tracing::info!(task_id, notification_id = %id, reminder_at = %at, "Task reminder scheduled");
        Ok(id)
    }

    /// Schedule up to `max_reminders` reminders at `due - k * interval_minutes`.
    ///
    /// Reminder times already in the past are skipped, so a task due soon
    /// gets fewer reminders. A reminder the service refuses is logged and the
    /// rest still go out; the call only fails when none could be scheduled.
    /// Returns the ids that were scheduled, nearest to the due date last.
    pub async fn schedule_recurring_reminder(
        &self,
        user_id: i64,
        task_id: i64,
        interval_minutes: i64,
        max_reminders: u32,
    ) -> Result<Vec<Uuid>, SchedulerError> {
        if interval_minutes <= 0 || max_reminders == 0 {
            return Err(SchedulerError::InvalidRequest(format!(
                "recurring reminders need a positive interval and count \
                 (got {interval_minutes} minutes x {max_reminders})"
            )));
        }
        let (task, due) = self.task_with_due_date(task_id).await?;
        let now = self.service.clock().now();

        let plan = recurring_plan(task_id, due, now, interval_minutes, max_reminders)?;
        let scheduled = submit_each(task_id, &plan, |reminder| {
            let notification = self.service.due_reminder(
                user_id,
                &task,
                reminder.lead_minutes,
                Some((reminder.sequence, max_reminders)),
            );
            self.service.schedule_notification(notification, reminder.at)
        })?;

        tracing::info!(
            task_id,
            scheduled = scheduled.len(),
            requested = max_reminders,
            "Recurring reminders scheduled"
        );
        Ok(scheduled)
    }

    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            is_running: self.running.load(Ordering::SeqCst),
            interval: self.config.interval,
            ticks: self.ticks.load(Ordering::SeqCst),
        }
    }

    async fn task_with_due_date(&self, task_id: i64) -> Result<(Task, DateTime<Utc>), SchedulerError> {
        let task = self
            .repository
            .get_task(task_id)
            .await?
            .ok_or(SchedulerError::TaskNotFound(task_id))?;
        let due = task.due_date.ok_or_else(|| {
            SchedulerError::InvalidRequest(format!("task {task_id} has no due date"))
        })?;
        Ok((task, due))
    }
}

/// One reminder out of a recurring series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PlannedReminder {
    sequence: u32,
    lead_minutes: i64,
    at: DateTime<Utc>,
}

/// Reminder times for `due - k * interval_minutes`, furthest first, skipping
/// those at or before `now`. Any time outside the date range rejects the
/// whole series before anything is submitted.
fn recurring_plan(
    task_id: i64,
    due: DateTime<Utc>,
    now: DateTime<Utc>,
    interval_minutes: i64,
    max_reminders: u32,
) -> Result<Vec<PlannedReminder>, SchedulerError> {
    let mut plan = Vec::new();
    for sequence in (1..=max_reminders).rev() {
        let planned = interval_minutes
            .checked_mul(i64::from(sequence))
            .and_then(|lead_minutes| reminder_time(due, lead_minutes).map(|at| (lead_minutes, at)));
        let Some((lead_minutes, at)) = planned else {
            return Err(SchedulerError::InvalidRequest(format!(
                "reminder {sequence} x {interval_minutes} minutes before task {task_id} is out of range"
            )));
        };
        if at <= now {
            tracing::debug!(task_id, reminder = sequence, "Skipping reminder in the past");
            continue;
        }
        plan.push(PlannedReminder {
            sequence,
            lead_minutes,
            at,
        });
    }
    Ok(plan)
}

fn submit_each<F>(
    task_id: i64,
    plan: &[PlannedReminder],
    mut submit: F,
) -> Result<Vec<Uuid>, SchedulerError>
where
    F: FnMut(&PlannedReminder) -> Result<Uuid, NotifyError>,
{
    let mut scheduled = Vec::with_capacity(plan.len());
    let mut last_error = None;
    for reminder in plan {
        match submit(reminder) {
            Ok(id) => scheduled.push(id),
            Err(err) => {
                tracing::warn!(
                    task_id,
                    reminder = reminder.sequence,
                    error = %err,
                    "Recurring reminder not scheduled"
                );
                last_error = Some(err);
            }
        }
    }

    match last_error {
        Some(err) if scheduled.is_empty() => Err(err.into()),
        _ => Ok(scheduled),
    }
}
