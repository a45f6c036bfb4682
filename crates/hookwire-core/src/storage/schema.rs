//! Table definitions.
//!
//! Statements are idempotent so the scheduled binary can run them on every
//! start.

use sqlx::PgPool;

use crate::error::Result;

const STATEMENTS: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS hookwire_messages (
        id UUID PRIMARY KEY,
        subject_type TEXT NOT NULL,
        subject_id TEXT NOT NULL,
        payload BYTEA NOT NULL DEFAULT ''::bytea,
        digest TEXT NOT NULL DEFAULT '',
        processed BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_hookwire_messages_unprocessed
        ON hookwire_messages (created_at)
        WHERE processed = FALSE
    ",
    r"
    CREATE TABLE IF NOT EXISTS hookwire_listeners (
        id UUID PRIMARY KEY,
        subject_type TEXT NOT NULL,
        property TEXT NOT NULL DEFAULT '',
        value TEXT NOT NULL DEFAULT '',
        url TEXT NOT NULL,
        owner_type TEXT NOT NULL,
        owner_id TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_hookwire_listeners_subject_type
        ON hookwire_listeners (subject_type)
    ",
    r"
    CREATE TABLE IF NOT EXISTS hookwire_delivery_tasks (
        id UUID PRIMARY KEY,
        message_id UUID NOT NULL REFERENCES hookwire_messages (id) ON DELETE CASCADE,
        listener_id UUID NOT NULL REFERENCES hookwire_listeners (id) ON DELETE CASCADE,
        processed BOOLEAN NOT NULL DEFAULT FALSE,
        attempts INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
        failed_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        UNIQUE (message_id, listener_id)
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_hookwire_delivery_tasks_open
        ON hookwire_delivery_tasks (message_id)
        WHERE processed = FALSE
    ",
    r"
    CREATE TABLE IF NOT EXISTS hookwire_delivery_attempts (
        id UUID PRIMARY KEY,
        task_id UUID NOT NULL REFERENCES hookwire_delivery_tasks (id) ON DELETE CASCADE,
        attempt_number INTEGER NOT NULL,
        url TEXT NOT NULL,
        response_status INTEGER,
        succeeded BOOLEAN NOT NULL,
        error_message TEXT,
        duration_ms BIGINT NOT NULL,
        attempted_at TIMESTAMPTZ NOT NULL
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS hookwire_batch_leases (
        name TEXT PRIMARY KEY,
        holder TEXT NOT NULL,
        expires_at TIMESTAMPTZ NOT NULL
    )
    ",
];

/// Creates all tables and indexes that do not exist yet.
///
/// # Errors
///
/// Returns `CoreError::Database` if any statement fails.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    tracing::debug!(statements = STATEMENTS.len(), "schema is up to date");
    Ok(())
}
