//! Repository for the delivery attempt history.
//!
//! Attempt rows are append-only. They are the only record of whether a
//! processed task was delivered or given up on.

use std::sync::Arc;

use sqlx::{postgres::PgRow, PgPool, Row};
use uuid::Uuid;

use super::column_u32;
use crate::{
    error::Result,
    models::{DeliveryAttempt, TaskId},
};

impl sqlx::FromRow<'_, PgRow> for DeliveryAttempt {
    fn from_row(row: &PgRow) -> std::result::Result<Self, sqlx::Error> {
        let response_status: Option<i32> = row.try_get("response_status")?;
        let duration_ms: i64 = row.try_get("duration_ms")?;
        Ok(Self {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            attempt_number: column_u32(row, "attempt_number")?,
            url: row.try_get("url")?,
            response_status: response_status.and_then(|s| u16::try_from(s).ok()),
            succeeded: row.try_get("succeeded")?,
            error_message: row.try_get("error_message")?,
            duration_ms: u64::try_from(duration_ms).unwrap_or_default(),
            attempted_at: row.try_get("attempted_at")?,
        })
    }
}

/// Repository for delivery attempt rows.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Records a delivery attempt.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn create(&self, attempt: &DeliveryAttempt) -> Result<Uuid> {
        let id = sqlx::query_scalar(
            r"
            INSERT INTO hookwire_delivery_attempts (
                id, task_id, attempt_number, url, response_status,
                succeeded, error_message, duration_ms, attempted_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id
            ",
        )
        .bind(attempt.id)
        .bind(attempt.task_id)
        .bind(i32::try_from(attempt.attempt_number).unwrap_or(i32::MAX))
        .bind(&attempt.url)
        .bind(attempt.response_status.map(i32::from))
        .bind(attempt.succeeded)
        .bind(&attempt.error_message)
        .bind(i64::try_from(attempt.duration_ms).unwrap_or(i64::MAX))
        .bind(attempt.attempted_at)
        .fetch_one(&*self.pool)
        .await?;

        Ok(id)
    }

    /// Returns the attempts of a task in attempt order.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_task(&self, task_id: TaskId) -> Result<Vec<DeliveryAttempt>> {
        let attempts = sqlx::query_as::<_, DeliveryAttempt>(
            r"
            SELECT id, task_id, attempt_number, url, response_status,
                   succeeded, error_message, duration_ms, attempted_at
            FROM hookwire_delivery_attempts
            WHERE task_id = $1
            ORDER BY attempt_number ASC
            ",
        )
        .bind(task_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(attempts)
    }
}
