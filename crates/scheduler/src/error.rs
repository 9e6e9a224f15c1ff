use thiserror::Error;

use herald_common::error::AppError;
use herald_notifier::NotifyError;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Notify(#[from] NotifyError),

    #[error("task repository error: {0}")]
    Repository(#[from] AppError),

    #[error("task {0} not found")]
    TaskNotFound(i64),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}
