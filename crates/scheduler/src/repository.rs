//! Read access to the external task store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use herald_common::error::AppError;
use herald_common::types::Task;

/// Task lookups the scheduler needs. Never writes.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn get_task(&self, id: i64) -> Result<Option<Task>, AppError>;

    /// Open tasks whose due date is before `now`, oldest first.
    async fn overdue_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>, AppError>;

    /// Every non-archived task.
    async fn all_tasks(&self) -> Result<Vec<Task>, AppError>;
}

/// PostgreSQL-backed repository over the `tasks` table.
#[derive(Debug, Clone)]
pub struct PgTaskRepository {
    pool: PgPool,
}

impl PgTaskRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskRepository for PgTaskRepository {
    async fn get_task(&self, id: i64) -> Result<Option<Task>, AppError> {
        let task = sqlx::query_as::<_, Task>(
            r#"
            SELECT id, title, status, due_date, user_id, is_archived
            FROM tasks
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(task)
    }

    async fn overdue_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>, AppError> {
        let tasks = sqlx::query_as::<_, Task>(
            r#"
            SELECT id, title, status, due_date, user_id, is_archived
            FROM tasks
            WHERE due_date < $1
              AND status != 2
              AND is_archived = FALSE
            ORDER BY due_date
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(tasks)
    }

    async fn all_tasks(&self) -> Result<Vec<Task>, AppError> {
        let tasks = sqlx::query_as::<_, Task>(
            r#"
            SELECT id, title, status, due_date, user_id, is_archived
            FROM tasks
            WHERE is_archived = FALSE
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(tasks)
    }
}
