use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::AppError;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string for the (read-only) task store
    pub database_url: Option<String>,

    /// Maximum number of PostgreSQL connections in the pool (default: 5)
    pub db_max_connections: u32,

    /// Number of concurrent delivery workers (default: 5)
    pub worker_count: usize,

    /// Bounded delivery queue capacity (default: 100)
    pub queue_capacity: usize,

    /// Retries after the first failed attempt (default: 3)
    pub max_retries: u32,

    /// Fixed backoff between a failed attempt and its retry, in seconds (default: 300)
    pub retry_delay_secs: u64,

    /// Upper bound on how long `stop()` waits for workers, in seconds (default: 30)
    pub shutdown_timeout_secs: u64,

    /// Scheduler tick interval in seconds (default: 60)
    pub scheduler_interval_secs: u64,

    /// Lookahead window for due-soon reminders, in minutes (default: 60)
    pub due_soon_window_minutes: i64,

    /// Hours between two overdue reminders for the same task (default: 24)
    pub overdue_reminder_interval_hours: i64,

    /// Generic webhook endpoint
    pub webhook_url: Option<String>,

    /// Slack incoming-webhook URL
    pub slack_webhook_url: Option<String>,

    /// Discord webhook URL
    pub discord_webhook_url: Option<String>,
}

impl AppConfig {
    /// Load configuration from environment variables (and `.env`, if present).
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let config = Self::from_lookup(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            database_url: lookup("DATABASE_URL"),
            db_max_connections: parse_or(&lookup, "DB_MAX_CONNECTIONS", 5)?,
            worker_count: parse_or(&lookup, "NOTIFY_WORKER_COUNT", 5)?,
            queue_capacity: parse_or(&lookup, "NOTIFY_QUEUE_CAPACITY", 100)?,
            max_retries: parse_or(&lookup, "NOTIFY_MAX_RETRIES", 3)?,
            retry_delay_secs: parse_or(&lookup, "NOTIFY_RETRY_DELAY_SECS", 300)?,
            shutdown_timeout_secs: parse_or(&lookup, "NOTIFY_SHUTDOWN_TIMEOUT_SECS", 30)?,
            scheduler_interval_secs: parse_or(&lookup, "SCHEDULER_INTERVAL_SECS", 60)?,
            due_soon_window_minutes: parse_or(&lookup, "SCHEDULER_DUE_SOON_MINUTES", 60)?,
            overdue_reminder_interval_hours: parse_or(
                &lookup,
                "OVERDUE_REMINDER_INTERVAL_HOURS",
                24,
            )?,
            webhook_url: lookup("WEBHOOK_URL"),
            slack_webhook_url: lookup("SLACK_WEBHOOK_URL"),
            discord_webhook_url: lookup("DISCORD_WEBHOOK_URL"),
        })
    }

    /// Reject values the delivery engine cannot run with.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.worker_count == 0 {
            return Err(AppError::Config(
                "NOTIFY_WORKER_COUNT must be at least 1".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(AppError::Config(
                "NOTIFY_QUEUE_CAPACITY must be at least 1".to_string(),
            ));
        }
        if self.scheduler_interval_secs == 0 {
            return Err(AppError::Config(
                "SCHEDULER_INTERVAL_SECS must be at least 1".to_string(),
            ));
        }
        if self.due_soon_window_minutes <= 0 || self.overdue_reminder_interval_hours <= 0 {
            return Err(AppError::Config(
                "reminder windows must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler_interval_secs)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, AppError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AppError::Config(format!("{key} must be a valid {}", std::any::type_name::<T>()))),
        None => Ok(default),
    }
}
