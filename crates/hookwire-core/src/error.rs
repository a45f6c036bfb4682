//! Error types and result handling for webhook registration, capture and
//! persistence.
//!
//! `CoreError` is the error surface of everything that does not touch the
//! network: registry lookups, serialization, and storage. Delivery failures
//! live in the delivery crate and wrap this type.

use thiserror::Error;

use crate::models::SubjectType;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for internal operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Entity not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A webhook registration was rejected by the registry builder.
    #[error("Invalid registration: {0}")]
    InvalidRegistration(String),

    /// A message references a subject type with no webhook registration.
    ///
    /// Fatal for that message: it is never silently dropped.
    #[error("Unregistered subject type: {subject_type}")]
    UnregisteredType {
        /// The subject type that has no registration
        subject_type: SubjectType,
    },

    /// The subject could not be serialized into a payload.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CoreError {
    /// Creates an unregistered type error.
    pub fn unregistered(subject_type: &SubjectType) -> Self {
        Self::UnregisteredType { subject_type: subject_type.clone() }
    }

    /// Returns true for errors that leave the work item untouched so that the
    /// next batch can pick it up again.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Serialization(_))
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested entity not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                Self::InvalidInput(format!("foreign key constraint violation: {db_err}"))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
