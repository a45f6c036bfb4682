//! Repository for per-listener delivery tasks.
//!
//! Tasks are created in the same transaction that marks their message
//! processed. After that the only mutations are attempt bookkeeping and the
//! sweeper's bulk exhaustion, both of which respect `processed` as terminal.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, FromRow, PgPool, Postgres, Row, Transaction};

use super::column_u32;
use crate::{
    error::Result,
    models::{DeliveryTask, MessageId, PendingDelivery, SubjectRef, SubjectType, TaskId},
};

const PENDING_SELECT: &str = r"
    SELECT t.id, t.message_id, t.listener_id, t.processed, t.attempts,
           t.failed_at, t.created_at, t.updated_at,
           l.url, m.payload, m.subject_type, m.subject_id
    FROM hookwire_delivery_tasks t
    JOIN hookwire_listeners l ON l.id = t.listener_id
    JOIN hookwire_messages m ON m.id = t.message_id
";

impl FromRow<'_, PgRow> for DeliveryTask {
    fn from_row(row: &PgRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            message_id: row.try_get("message_id")?,
            listener_id: row.try_get("listener_id")?,
            processed: row.try_get("processed")?,
            attempts: column_u32(row, "attempts")?,
            failed_at: row.try_get("failed_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl FromRow<'_, PgRow> for PendingDelivery {
    fn from_row(row: &PgRow) -> std::result::Result<Self, sqlx::Error> {
        let payload: Vec<u8> = row.try_get("payload")?;
        Ok(Self {
            task: DeliveryTask::from_row(row)?,
            url: row.try_get("url")?,
            payload: Bytes::from(payload),
            subject: SubjectRef::new(
                row.try_get::<String, _>("subject_type")?,
                row.try_get::<String, _>("subject_id")?,
            ),
        })
    }
}

/// Repository for delivery task rows.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts tasks within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if any insert fails.
    pub async fn create_many_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        tasks: &[DeliveryTask],
    ) -> Result<()> {
        for task in tasks {
            sqlx::query(
                r"
                INSERT INTO hookwire_delivery_tasks (
                    id, message_id, listener_id, processed, attempts,
                    failed_at, created_at, updated_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ",
            )
            .bind(task.id)
            .bind(task.message_id)
            .bind(task.listener_id)
            .bind(task.processed)
            .bind(i32::try_from(task.attempts).unwrap_or(i32::MAX))
            .bind(task.failed_at)
            .bind(task.created_at)
            .bind(task.updated_at)
            .execute(&mut **tx)
            .await?;
        }

        Ok(())
    }

    /// Writes back the attempt state of a task.
    ///
    /// The update never lowers `attempts` and never reopens a processed
    /// task. Returns false when the row was left untouched.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn save(&self, task: &DeliveryTask) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE hookwire_delivery_tasks
            SET processed = $2, attempts = $3, failed_at = $4, updated_at = $5
            WHERE id = $1
              AND processed = FALSE
              AND attempts <= $3
            ",
        )
        .bind(task.id)
        .bind(task.processed)
        .bind(i32::try_from(task.attempts).unwrap_or(i32::MAX))
        .bind(task.failed_at)
        .bind(task.updated_at)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Finds a task by id.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, id: TaskId) -> Result<Option<DeliveryTask>> {
        let task = sqlx::query_as::<_, DeliveryTask>(
            r"
            SELECT id, message_id, listener_id, processed, attempts,
                   failed_at, created_at, updated_at
            FROM hookwire_delivery_tasks
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(task)
    }

    /// Returns all tasks of a message.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_message(&self, message_id: MessageId) -> Result<Vec<DeliveryTask>> {
        let tasks = sqlx::query_as::<_, DeliveryTask>(
            r"
            SELECT id, message_id, listener_id, processed, attempts,
                   failed_at, created_at, updated_at
            FROM hookwire_delivery_tasks
            WHERE message_id = $1
            ORDER BY created_at ASC, id ASC
            ",
        )
        .bind(message_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(tasks)
    }

    /// Loads a task joined with its listener URL and message payload.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_pending(&self, id: TaskId) -> Result<Option<PendingDelivery>> {
        let query = format!("{PENDING_SELECT} WHERE t.id = $1");
        let pending = sqlx::query_as::<_, PendingDelivery>(&query)
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?;

        Ok(pending)
    }

    /// Returns open tasks of a subject type that still have attempts left.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_retryable(
        &self,
        subject_type: &SubjectType,
        max_attempts: u32,
    ) -> Result<Vec<PendingDelivery>> {
        let query = format!(
            "{PENDING_SELECT}
            WHERE m.subject_type = $1
              AND t.processed = FALSE
              AND t.attempts < $2
            ORDER BY t.created_at ASC, t.id ASC"
        );
        let pending = sqlx::query_as::<_, PendingDelivery>(&query)
            .bind(subject_type.as_str())
            .bind(i32::try_from(max_attempts).unwrap_or(i32::MAX))
            .fetch_all(&*self.pool)
            .await?;

        Ok(pending)
    }

    /// Marks every open task of a subject type with no attempts left as
    /// processed, without delivering it. Returns the affected tasks.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn exhaust(
        &self,
        subject_type: &SubjectType,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<DeliveryTask>> {
        let tasks = sqlx::query_as::<_, DeliveryTask>(
            r"
            UPDATE hookwire_delivery_tasks t
            SET processed = TRUE, updated_at = $3
            FROM hookwire_messages m
            WHERE m.id = t.message_id
              AND m.subject_type = $1
              AND t.processed = FALSE
              AND t.attempts >= $2
            RETURNING t.id, t.message_id, t.listener_id, t.processed, t.attempts,
                      t.failed_at, t.created_at, t.updated_at
            ",
        )
        .bind(subject_type.as_str())
        .bind(i32::try_from(max_attempts).unwrap_or(i32::MAX))
        .bind(now)
        .fetch_all(&*self.pool)
        .await?;

        Ok(tasks)
    }
}
