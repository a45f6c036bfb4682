//! Subject capability and subject loading.
//!
//! A subject is any application entity whose mutations are watched. The
//! system never owns subjects: it sees them through the `Subject` trait and
//! loads them by reference through an injected `SubjectResolver`.

use std::{collections::HashMap, fmt, sync::Arc};

use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::{
    error::Result,
    models::{SubjectRef, SubjectType},
};

/// Capability interface implemented by every watched entity.
pub trait Subject: Send + Sync + fmt::Debug {
    /// Type identifier of this subject.
    fn subject_type(&self) -> SubjectType;

    /// Identifier of this subject within its type.
    fn subject_id(&self) -> String;

    /// Current value of a named property, or `None` if it does not exist.
    fn property(&self, name: &str) -> Option<Value>;

    /// Reference to this subject.
    fn subject_ref(&self) -> SubjectRef {
        SubjectRef::new(self.subject_type(), self.subject_id())
    }
}

/// Renders a live property value for comparison against a listener value.
///
/// Strings compare as-is, numbers by their JSON text and booleans as
/// `true`/`false`. Null, arrays and objects never match anything.
pub fn render_property(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// Subject backed by a JSON object.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonSubject {
    subject_type: SubjectType,
    subject_id: String,
    fields: Map<String, Value>,
}

impl JsonSubject {
    /// Creates a subject from its reference and field map.
    pub fn new(reference: SubjectRef, fields: Map<String, Value>) -> Self {
        Self { subject_type: reference.subject_type, subject_id: reference.subject_id, fields }
    }

    /// Creates a subject from a JSON value, which must be an object.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` for non-object values.
    pub fn from_value(reference: SubjectRef, value: Value) -> Result<Self> {
        match value {
            Value::Object(fields) => Ok(Self::new(reference, fields)),
            other => Err(crate::CoreError::InvalidInput(format!(
                "subject {reference} is not a JSON object: {other}"
            ))),
        }
    }

    /// Sets a field, replacing any previous value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(name.into(), value.into());
    }

    /// Returns all fields.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }
}

impl Subject for JsonSubject {
    fn subject_type(&self) -> SubjectType {
        self.subject_type.clone()
    }

    fn subject_id(&self) -> String {
        self.subject_id.clone()
    }

    fn property(&self, name: &str) -> Option<Value> {
        self.fields.get(name).cloned()
    }
}

/// Loads live subjects by reference.
///
/// Production wiring reads rows from the application database; tests use
/// `InMemorySubjects`.
#[async_trait::async_trait]
pub trait SubjectResolver: Send + Sync {
    /// Loads the subject, or `None` if it no longer exists.
    async fn load(&self, reference: &SubjectRef) -> Result<Option<Arc<dyn Subject>>>;
}

/// In-memory subject table.
#[derive(Debug, Clone, Default)]
pub struct InMemorySubjects {
    subjects: Arc<RwLock<HashMap<SubjectRef, Arc<dyn Subject>>>>,
}

impl InMemorySubjects {
    /// Creates an empty subject table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a subject.
    pub async fn upsert(&self, subject: Arc<dyn Subject>) {
        self.subjects.write().await.insert(subject.subject_ref(), subject);
    }

    /// Removes a subject.
    pub async fn remove(&self, reference: &SubjectRef) {
        self.subjects.write().await.remove(reference);
    }
}

#[async_trait::async_trait]
impl SubjectResolver for InMemorySubjects {
    async fn load(&self, reference: &SubjectRef) -> Result<Option<Arc<dyn Subject>>> {
        Ok(self.subjects.read().await.get(reference).cloned())
    }
}
