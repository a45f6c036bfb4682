//! Core domain models and strongly-typed identifiers.
//!
//! Defines messages, listeners, delivery tasks and their attempt history,
//! plus newtype ID wrappers for compile-time type safety. The state
//! transition helpers on `DeliveryTask` are the only place where `attempts`
//! and `processed` are mutated.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl sqlx::Type<PgDb> for $name {
            fn type_info() -> PgTypeInfo {
                <Uuid as sqlx::Type<PgDb>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, PgDb> for $name {
            fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
                let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
                Ok(Self(uuid))
            }
        }

        impl sqlx::Encode<'_, PgDb> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
                <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
            }
        }
    };
}

uuid_id!(
    /// Strongly-typed message identifier.
    ///
    /// A message is one captured mutation event. Its ID follows it from
    /// capture until it is either deleted or marked processed.
    MessageId
);

uuid_id!(
    /// Strongly-typed listener identifier.
    ListenerId
);

uuid_id!(
    /// Strongly-typed delivery task identifier.
    ///
    /// One task exists per (message, matched listener) pair.
    TaskId
);

/// Identifier of a kind of subject, such as `article` or `user`.
///
/// Registrations, listeners and messages are all keyed by subject type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectType(String);

impl SubjectType {
    /// Creates a subject type from its identifier.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubjectType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for SubjectType {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Reference to a subject of any type: `(type, id)`.
///
/// Messages hold a reference rather than a copy; the live subject is loaded
/// through a `SubjectResolver` when it is needed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubjectRef {
    /// Type of the referenced subject.
    pub subject_type: SubjectType,
    /// Identifier of the subject within its type.
    pub subject_id: String,
}

impl SubjectRef {
    /// Creates a new subject reference.
    pub fn new(subject_type: impl Into<SubjectType>, subject_id: impl Into<String>) -> Self {
        Self { subject_type: subject_type.into(), subject_id: subject_id.into() }
    }
}

impl fmt::Display for SubjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.subject_type, self.subject_id)
    }
}

/// A captured mutation event awaiting listener resolution and fan-out.
///
/// ```text
/// unprocessed --(no listeners)--> deleted
///             --(fan-out)-------> processed
/// ```
///
/// Both end states are terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier for this message.
    pub id: MessageId,
    /// Subject whose mutation produced this message.
    pub subject: SubjectRef,
    /// Serialized subject; empty until the message is processed.
    pub payload: Bytes,
    /// Hex SHA-256 of the payload; empty until the message is processed.
    pub digest: String,
    /// Whether the message has been fanned out.
    pub processed: bool,
    /// When the message was captured.
    pub created_at: DateTime<Utc>,
    /// When the message was last modified.
    pub updated_at: DateTime<Utc>,
}

impl Message {
    /// Creates a new unprocessed message for the given subject.
    pub fn new(subject: SubjectRef, now: DateTime<Utc>) -> Self {
        Self {
            id: MessageId::new(),
            subject,
            payload: Bytes::new(),
            digest: String::new(),
            processed: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Stores the serialized payload and its digest.
    pub fn set_payload(&mut self, payload: Bytes, now: DateTime<Utc>) {
        self.digest = payload_digest(&payload);
        self.payload = payload;
        self.updated_at = now;
    }

    /// Marks the message as fanned out.
    pub fn mark_processed(&mut self, now: DateTime<Utc>) {
        self.processed = true;
        self.updated_at = now;
    }
}

/// Computes the lowercase hex SHA-256 digest of a payload.
pub fn payload_digest(payload: &[u8]) -> String {
    use sha2::{Digest, Sha256};

    hex::encode(Sha256::digest(payload))
}

/// A subscription: subject type, optional property filter, delivery URL and
/// owner.
///
/// An empty `property` is a wildcard. Wildcard listeners only match when no
/// listener of the same subject type filters on a property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listener {
    /// Unique identifier for this listener.
    pub id: ListenerId,
    /// Subject type this listener is interested in.
    pub subject_type: SubjectType,
    /// Property name to filter on; empty for no filter.
    pub property: String,
    /// Value the property must have for the listener to match.
    pub value: String,
    /// URL the serialized payload is POSTed to.
    pub url: String,
    /// Owner of this subscription.
    pub owner: SubjectRef,
    /// When the listener was created.
    pub created_at: DateTime<Utc>,
    /// When the listener was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Listener {
    /// Creates a listener that matches every message of its subject type
    /// (subject to the open-subscription rule).
    pub fn new(
        subject_type: impl Into<SubjectType>,
        url: impl Into<String>,
        owner: SubjectRef,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ListenerId::new(),
            subject_type: subject_type.into(),
            property: String::new(),
            value: String::new(),
            url: url.into(),
            owner,
            created_at: now,
            updated_at: now,
        }
    }

    /// Restricts the listener to subjects whose `property` equals `value`.
    #[must_use]
    pub fn filtered(mut self, property: impl Into<String>, value: impl Into<String>) -> Self {
        self.property = property.into();
        self.value = value.into();
        self
    }

    /// Returns true when the listener has no property filter.
    pub fn is_wildcard(&self) -> bool {
        self.property.is_empty()
    }
}

/// One (message, listener) delivery unit with its own attempt state.
///
/// ```text
/// pending(attempts=0) --fail--> retrying(0<attempts<max) --sweep--> exhausted
///         |                           |
///         +-----------success---------+--------------------------> delivered
/// ```
///
/// `delivered` and `exhausted` both have `processed = true`; only the
/// attempt history tells them apart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryTask {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// Message being delivered.
    pub message_id: MessageId,
    /// Listener receiving the message.
    pub listener_id: ListenerId,
    /// Terminal flag: delivered or given up.
    pub processed: bool,
    /// Number of delivery attempts made so far.
    pub attempts: u32,
    /// When the most recent attempt failed.
    pub failed_at: Option<DateTime<Utc>>,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When the task was last updated.
    pub updated_at: DateTime<Utc>,
}

impl DeliveryTask {
    /// Creates a new pending task.
    pub fn new(message_id: MessageId, listener_id: ListenerId, now: DateTime<Utc>) -> Self {
        Self {
            id: TaskId::new(),
            message_id,
            listener_id,
            processed: false,
            attempts: 0,
            failed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Records the start of an attempt and returns its 1-based number.
    pub fn begin_attempt(&mut self, now: DateTime<Utc>) -> u32 {
        self.attempts = self.attempts.saturating_add(1);
        self.updated_at = now;
        self.attempts
    }

    /// Records a successful attempt.
    pub fn mark_delivered(&mut self, now: DateTime<Utc>) {
        self.processed = true;
        self.updated_at = now;
    }

    /// Records a failed attempt.
    pub fn mark_failed(&mut self, now: DateTime<Utc>) {
        self.failed_at = Some(now);
        self.updated_at = now;
    }

    /// Returns true when the sweeper may attempt this task again.
    pub fn is_retryable(&self, max_attempts: u32) -> bool {
        !self.processed && self.attempts < max_attempts
    }

    /// Returns true when the sweeper must give up on this task.
    pub fn is_exhausted(&self, max_attempts: u32) -> bool {
        !self.processed && self.attempts >= max_attempts
    }
}

/// A delivery task joined with what the worker needs to perform an attempt.
#[derive(Debug, Clone)]
pub struct PendingDelivery {
    /// Task being attempted.
    pub task: DeliveryTask,
    /// Listener URL to POST to.
    pub url: String,
    /// Serialized message payload.
    pub payload: Bytes,
    /// Subject of the underlying message.
    pub subject: SubjectRef,
}

/// Record of a single delivery attempt for audit and debugging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    /// Unique identifier for this attempt.
    pub id: Uuid,
    /// Task this attempt belongs to.
    pub task_id: TaskId,
    /// 1-based attempt number, equal to the task's `attempts` after it.
    pub attempt_number: u32,
    /// URL the request was sent to.
    pub url: String,
    /// HTTP status, if a response was received.
    pub response_status: Option<u16>,
    /// Whether the attempt counted as a delivery.
    pub succeeded: bool,
    /// Failure description for unsuccessful attempts.
    pub error_message: Option<String>,
    /// Wall-clock duration of the attempt in milliseconds.
    pub duration_ms: u64,
    /// When the attempt was made.
    pub attempted_at: DateTime<Utc>,
}
