//! PostgreSQL persistence for messages, listeners, delivery tasks and their
//! attempt history.
//!
//! All SQL lives in this module. Repositories share one pool; operations
//! spanning several tables (fan-out) are exposed on `Storage` itself and run
//! in a single transaction.

use std::sync::Arc;

use sqlx::{postgres::PgRow, PgPool, Row};

pub mod batch_leases;
pub mod delivery_attempts;
pub mod delivery_tasks;
pub mod listeners;
pub mod messages;
pub mod schema;
pub mod subjects;

pub use schema::run_migrations;
pub use subjects::PgSubjectResolver;

use crate::{
    error::{CoreError, Result},
    models::{DeliveryTask, Message},
};

/// Container for all repository instances.
#[derive(Clone)]
pub struct Storage {
    /// Captured messages.
    pub messages: Arc<messages::Repository>,

    /// Listener subscriptions.
    pub listeners: Arc<listeners::Repository>,

    /// Per-listener delivery tasks.
    pub delivery_tasks: Arc<delivery_tasks::Repository>,

    /// Delivery attempt history.
    pub delivery_attempts: Arc<delivery_attempts::Repository>,

    /// Batch single-flight leases.
    pub batch_leases: Arc<batch_leases::Repository>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            messages: Arc::new(messages::Repository::new(pool.clone())),
            listeners: Arc::new(listeners::Repository::new(pool.clone())),
            delivery_tasks: Arc::new(delivery_tasks::Repository::new(pool.clone())),
            delivery_attempts: Arc::new(delivery_attempts::Repository::new(pool.clone())),
            batch_leases: Arc::new(batch_leases::Repository::new(pool)),
        }
    }

    /// Stores the message payload, marks the message processed and creates
    /// its delivery tasks atomically.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` if the message was already
    /// processed (or deleted) by someone else; nothing is written in that
    /// case. Returns `CoreError::Database` on any database failure.
    pub async fn commit_fan_out(&self, message: &Message, tasks: &[DeliveryTask]) -> Result<()> {
        let mut tx = self.messages.pool().begin().await?;

        if !self.messages.mark_processed_in_tx(&mut tx, message).await? {
            tx.rollback().await?;
            return Err(CoreError::InvalidInput(format!(
                "message {} is no longer unprocessed",
                message.id
            )));
        }

        self.delivery_tasks.create_many_in_tx(&mut tx, tasks).await?;
        tx.commit().await?;

        Ok(())
    }

    /// Verifies database connectivity.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.messages.pool()).await?;

        Ok(())
    }
}

/// Reads a non-negative `INTEGER` column as `u32`.
pub(crate) fn column_u32(row: &PgRow, column: &str) -> std::result::Result<u32, sqlx::Error> {
    let value: i32 = row.try_get(column)?;
    u32::try_from(value)
        .map_err(|e| sqlx::Error::ColumnDecode { index: column.to_string(), source: Box::new(e) })
}
