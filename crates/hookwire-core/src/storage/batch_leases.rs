//! Repository for batch leases.
//!
//! A lease is a named row with a holder and an expiry. Acquiring succeeds
//! when the row is absent or expired, so a crashed holder blocks other
//! batches for at most one TTL.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::Result;

/// Repository for lease rows.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Takes the lease `name` for `holder` until `expires_at` unless another
    /// holder has an unexpired lease. Returns whether the lease was taken.
    ///
    /// # Errors
    ///
    /// Returns error if the upsert fails.
    pub async fn try_acquire(
        &self,
        name: &str,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let acquired: Option<String> = sqlx::query_scalar(
            r"
            INSERT INTO hookwire_batch_leases (name, holder, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (name) DO UPDATE
            SET holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at
            WHERE hookwire_batch_leases.expires_at <= $4
            RETURNING holder
            ",
        )
        .bind(name)
        .bind(holder)
        .bind(expires_at)
        .bind(now)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(acquired.is_some())
    }

    /// Releases the lease if `holder` still owns it.
    ///
    /// # Errors
    ///
    /// Returns error if delete fails.
    pub async fn release(&self, name: &str, holder: &str) -> Result<()> {
        sqlx::query("DELETE FROM hookwire_batch_leases WHERE name = $1 AND holder = $2")
            .bind(name)
            .bind(holder)
            .execute(&*self.pool)
            .await?;

        Ok(())
    }
}
