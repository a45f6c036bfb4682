//! Repository for captured messages.

use std::sync::Arc;

use bytes::Bytes;
use sqlx::{postgres::PgRow, PgPool, Postgres, Row, Transaction};

use crate::{
    error::Result,
    models::{Message, MessageId, SubjectRef},
};

impl sqlx::FromRow<'_, PgRow> for Message {
    fn from_row(row: &PgRow) -> std::result::Result<Self, sqlx::Error> {
        let payload: Vec<u8> = row.try_get("payload")?;
        Ok(Self {
            id: row.try_get("id")?,
            subject: SubjectRef::new(
                row.try_get::<String, _>("subject_type")?,
                row.try_get::<String, _>("subject_id")?,
            ),
            payload: Bytes::from(payload),
            digest: row.try_get("digest")?,
            processed: row.try_get("processed")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Repository for message rows.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Inserts a new message.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn create(&self, message: &Message) -> Result<MessageId> {
        let id = sqlx::query_scalar(
            r"
            INSERT INTO hookwire_messages (
                id, subject_type, subject_id, payload, digest,
                processed, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id
            ",
        )
        .bind(message.id)
        .bind(message.subject.subject_type.as_str())
        .bind(&message.subject.subject_id)
        .bind(message.payload.as_ref())
        .bind(&message.digest)
        .bind(message.processed)
        .bind(message.created_at)
        .bind(message.updated_at)
        .fetch_one(&*self.pool)
        .await?;

        Ok(id)
    }

    /// Finds a message by id.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, id: MessageId) -> Result<Option<Message>> {
        let message = sqlx::query_as::<_, Message>(
            r"
            SELECT id, subject_type, subject_id, payload, digest,
                   processed, created_at, updated_at
            FROM hookwire_messages
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(message)
    }

    /// Returns every unprocessed message, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_unprocessed(&self) -> Result<Vec<Message>> {
        let messages = sqlx::query_as::<_, Message>(
            r"
            SELECT id, subject_type, subject_id, payload, digest,
                   processed, created_at, updated_at
            FROM hookwire_messages
            WHERE processed = FALSE
            ORDER BY created_at ASC, id ASC
            ",
        )
        .fetch_all(&*self.pool)
        .await?;

        Ok(messages)
    }

    /// Deletes an unprocessed message. Returns whether a row was removed.
    ///
    /// # Errors
    ///
    /// Returns error if delete fails.
    pub async fn delete(&self, id: MessageId) -> Result<bool> {
        let result = sqlx::query(
            r"
            DELETE FROM hookwire_messages
            WHERE id = $1 AND processed = FALSE
            ",
        )
        .bind(id)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Stores the payload and marks the message processed within a
    /// transaction. Returns false if the message was already processed.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn mark_processed_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        message: &Message,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE hookwire_messages
            SET payload = $2, digest = $3, processed = TRUE, updated_at = $4
            WHERE id = $1 AND processed = FALSE
            ",
        )
        .bind(message.id)
        .bind(message.payload.as_ref())
        .bind(&message.digest)
        .bind(message.updated_at)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
