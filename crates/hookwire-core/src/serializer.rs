//! Payload serializers.
//!
//! A serializer turns a live subject, restricted to the registered fields,
//! into the bytes POSTed to every listener.

use std::fmt;

use bytes::Bytes;
use serde_json::{json, Map};

use tracing::debug;

use crate::{error::Result, subject::Subject};

/// Produces the payload for a subject.
pub trait Serializer: Send + Sync + fmt::Debug {
    /// Serializes `subject`, restricted to `fields` in the given order.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Serialization` if the payload cannot be built.
    fn serialize(&self, subject: &dyn Subject, fields: &[String]) -> Result<Bytes>;

    /// MIME type of the produced payload.
    fn content_type(&self) -> &'static str;
}

/// JSON serializer producing a one-element array:
///
/// ```text
/// [{"model": "article", "pk": "42", "fields": {"title": "Hello"}}]
/// ```
///
/// Registered fields the subject does not have are left out.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl JsonSerializer {
    /// Creates a new JSON serializer.
    pub fn new() -> Self {
        Self
    }
}

impl Serializer for JsonSerializer {
    fn serialize(&self, subject: &dyn Subject, fields: &[String]) -> Result<Bytes> {
        let mut selected = Map::new();
        for field in fields {
            match subject.property(field) {
                Some(value) => {
                    selected.insert(field.clone(), value);
                },
                None => {
                    debug!(
                        subject = %subject.subject_ref(),
                        field = %field,
                        "field not on subject; omitted"
                    );
                },
            }
        }

        let document = json!([{
            "model": subject.subject_type(),
            "pk": subject.subject_id(),
            "fields": selected,
        }]);

        Ok(Bytes::from(serde_json::to_vec(&document)?))
    }

    fn content_type(&self) -> &'static str {
        "application/json"
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::{models::SubjectRef, subject::JsonSubject};

    fn article() -> JsonSubject {
        let mut subject = JsonSubject::new(SubjectRef::new("article", "42"), Map::new());
        subject.set("title", "Hello");
        subject.set("status", "published");
        subject.set("body", "secret draft notes");
        subject
    }

    #[test]
    fn serializes_only_registered_fields() {
        let payload =
            JsonSerializer.serialize(&article(), &["title".to_string()]).expect("serializes");
        let value: Value = serde_json::from_slice(&payload).unwrap();

        assert_eq!(
            value,
            json!([{"model": "article", "pk": "42", "fields": {"title": "Hello"}}])
        );
    }

    #[test]
    fn missing_fields_are_omitted() {
        let fields = ["author".to_string(), "title".to_string()];
        let payload = JsonSerializer.serialize(&article(), &fields).expect("serializes");
        let value: Value = serde_json::from_slice(&payload).unwrap();

        assert_eq!(value[0]["fields"], json!({"title": "Hello"}));
    }

    #[test]
    fn content_type_is_json() {
        assert_eq!(JsonSerializer::new().content_type(), "application/json");
    }
}
