//! Builders for subjects and listeners with sensible defaults.

use hookwire_core::{JsonSubject, Listener, SubjectRef, SubjectType};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Builder for JSON-backed test subjects.
pub struct SubjectBuilder {
    reference: SubjectRef,
    fields: Map<String, Value>,
}

impl SubjectBuilder {
    /// Starts a subject of the given type and id with no fields.
    pub fn new(subject_type: impl Into<SubjectType>, subject_id: impl Into<String>) -> Self {
        Self { reference: SubjectRef::new(subject_type, subject_id), fields: Map::new() }
    }

    /// An `article` with a title and a `draft` status.
    pub fn article(subject_id: impl Into<String>) -> Self {
        let subject_id = subject_id.into();
        Self::new("article", subject_id.clone())
            .field("title", format!("Article {subject_id}"))
            .field("status", "draft")
    }

    /// Sets a field.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Builds the subject.
    pub fn build(self) -> JsonSubject {
        JsonSubject::new(self.reference, self.fields)
    }
}

/// Builder for listeners.
pub struct ListenerBuilder {
    subject_type: SubjectType,
    url: String,
    owner: SubjectRef,
    filter: Option<(String, String)>,
}

impl ListenerBuilder {
    /// Starts a wildcard listener for `subject_type` owned by a fresh user.
    pub fn new(subject_type: impl Into<SubjectType>) -> Self {
        Self {
            subject_type: subject_type.into(),
            url: "http://127.0.0.1:1/hook".to_string(),
            owner: SubjectRef::new("user", Uuid::new_v4().to_string()),
            filter: None,
        }
    }

    /// Sets the delivery URL.
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Sets the owner.
    #[must_use]
    pub fn owner(mut self, owner: SubjectRef) -> Self {
        self.owner = owner;
        self
    }

    /// Restricts the listener to subjects whose `property` equals `value`.
    #[must_use]
    pub fn filter(mut self, property: impl Into<String>, value: impl Into<String>) -> Self {
        self.filter = Some((property.into(), value.into()));
        self
    }

    /// Builds the listener.
    pub fn build(self) -> Listener {
        let listener = Listener::new(self.subject_type, self.url, self.owner);
        match self.filter {
            Some((property, value)) => listener.filtered(property, value),
            None => listener,
        }
    }
}
