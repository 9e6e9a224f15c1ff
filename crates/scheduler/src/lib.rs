//! Periodic task scanning and reminder scheduling on top of the notifier.

pub mod cooldown;
pub mod error;
pub mod repository;
pub mod scheduler;

pub use error::SchedulerError;
pub use repository::{PgTaskRepository, TaskRepository};
pub use scheduler::{ScanReport, Scheduler, SchedulerConfig, SchedulerStatus};
