//! Error types for capture, fan-out and delivery.
//!
//! Transport failures (`NetworkError`, `Timeout`, `InvalidUrl`,
//! `UnsuccessfulStatus`) describe a failed attempt and are persisted on the
//! task before they are ever returned. Everything else is a failure of the
//! machinery itself and leaves the work item for the next batch.

use hookwire_core::{CoreError, TaskId};
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Errors raised by the delivery crate.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Connection, DNS or other network-level failure.
    #[error("network connection failed: {message}")]
    NetworkError {
        /// Error message describing the network failure
        message: String,
    },

    /// The request exceeded the client timeout.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// Configured timeout in seconds
        timeout_seconds: u64,
    },

    /// The listener URL could not be used for a request.
    #[error("invalid listener url '{url}': {message}")]
    InvalidUrl {
        /// The offending URL
        url: String,
        /// Why it was rejected
        message: String,
    },

    /// The listener answered with a non-2xx status while success statuses
    /// are required.
    #[error("listener responded with HTTP {status_code}")]
    UnsuccessfulStatus {
        /// Returned status code
        status_code: u16,
    },

    /// The task is already delivered or exhausted.
    #[error("task {task_id} is already processed")]
    TaskTerminal {
        /// The terminal task
        task_id: TaskId,
    },

    /// Registry, serialization or storage failure.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The HTTP client could not be built.
    #[error("invalid delivery configuration: {message}")]
    ConfigurationError {
        /// Configuration error message
        message: String,
    },
}

impl DeliveryError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into(), message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Returns true when the error describes a failed delivery attempt
    /// rather than a failure of the system.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::NetworkError { .. }
                | Self::Timeout { .. }
                | Self::InvalidUrl { .. }
                | Self::UnsuccessfulStatus { .. }
        )
    }

    /// Returns true when a message references a subject type with no
    /// registration.
    pub fn is_unregistered_type(&self) -> bool {
        matches!(self, Self::Core(CoreError::UnregisteredType { .. }))
    }

    /// HTTP status carried by the error, if any.
    pub fn response_status(&self) -> Option<u16> {
        match self {
            Self::UnsuccessfulStatus { status_code } => Some(*status_code),
            _ => None,
        }
    }
}
