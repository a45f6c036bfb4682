//! Repository for listener subscriptions.

use std::sync::Arc;

use sqlx::{postgres::PgRow, PgPool, Row};

use crate::{
    error::Result,
    models::{Listener, ListenerId, SubjectRef, SubjectType},
};

impl sqlx::FromRow<'_, PgRow> for Listener {
    fn from_row(row: &PgRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            subject_type: SubjectType::new(row.try_get::<String, _>("subject_type")?),
            property: row.try_get("property")?,
            value: row.try_get("value")?,
            url: row.try_get("url")?,
            owner: SubjectRef::new(
                row.try_get::<String, _>("owner_type")?,
                row.try_get::<String, _>("owner_id")?,
            ),
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Repository for listener rows.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts a listener.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn create(&self, listener: &Listener) -> Result<ListenerId> {
        let id = sqlx::query_scalar(
            r"
            INSERT INTO hookwire_listeners (
                id, subject_type, property, value, url,
                owner_type, owner_id, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id
            ",
        )
        .bind(listener.id)
        .bind(listener.subject_type.as_str())
        .bind(&listener.property)
        .bind(&listener.value)
        .bind(&listener.url)
        .bind(listener.owner.subject_type.as_str())
        .bind(&listener.owner.subject_id)
        .bind(listener.created_at)
        .bind(listener.updated_at)
        .fetch_one(&*self.pool)
        .await?;

        Ok(id)
    }

    /// Returns every listener for a subject type.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_subject_type(&self, subject_type: &SubjectType) -> Result<Vec<Listener>> {
        let listeners = sqlx::query_as::<_, Listener>(
            r"
            SELECT id, subject_type, property, value, url,
                   owner_type, owner_id, created_at, updated_at
            FROM hookwire_listeners
            WHERE subject_type = $1
            ORDER BY created_at ASC, id ASC
            ",
        )
        .bind(subject_type.as_str())
        .fetch_all(&*self.pool)
        .await?;

        Ok(listeners)
    }

    /// Deletes a listener and, through the foreign key, its delivery tasks.
    /// Returns whether a row was removed.
    ///
    /// # Errors
    ///
    /// Returns error if delete fails.
    pub async fn delete(&self, id: ListenerId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM hookwire_listeners WHERE id = $1")
            .bind(id)
            .execute(&*self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
