//! Listener resolution.
//!
//! For a subject type, collect the distinct property names any listener
//! filters on. With none, every listener of the type is interested. With
//! some, a listener is interested when its `(property, value)` equals
//! `(name, live value)` for one of those names; wildcard listeners are then
//! excluded.

use std::{collections::BTreeSet, sync::Arc};

use hookwire_core::{render_property, Listener, Message, Subject};

use crate::{error::Result, storage::DeliveryStorage};

/// Resolves the listeners interested in a message.
#[derive(Clone)]
pub struct ListenerResolver {
    storage: Arc<dyn DeliveryStorage>,
}

impl ListenerResolver {
    /// Creates a resolver over the given storage.
    pub fn new(storage: Arc<dyn DeliveryStorage>) -> Self {
        Self { storage }
    }

    /// Loads the listeners of the message's subject type and selects those
    /// matching the subject's current state.
    ///
    /// # Errors
    ///
    /// Returns a storage error if listeners cannot be loaded.
    pub async fn resolve(&self, message: &Message, subject: &dyn Subject) -> Result<Vec<Listener>> {
        let listeners = self.storage.listeners_for(message.subject.subject_type.clone()).await?;
        let matched = select_listeners(listeners, subject);

        tracing::debug!(
            message_id = %message.id,
            subject_type = %message.subject.subject_type,
            matched = matched.len(),
            "resolved listeners"
        );

        Ok(matched)
    }
}

/// Selects the listeners matching `subject` from all listeners of its type.
pub fn select_listeners(listeners: Vec<Listener>, subject: &dyn Subject) -> Vec<Listener> {
    let properties: BTreeSet<&str> = listeners
        .iter()
        .filter(|listener| !listener.is_wildcard())
        .map(|listener| listener.property.as_str())
        .collect();

    if properties.is_empty() {
        return listeners;
    }

    let live: Vec<(String, String)> = properties
        .into_iter()
        .filter_map(|name| {
            let value = subject.property(name)?;
            render_property(&value).map(|rendered| (name.to_string(), rendered))
        })
        .collect();

    listeners
        .into_iter()
        .filter(|listener| {
            live.iter().any(|(name, value)| listener.property == *name && listener.value == *value)
        })
        .collect()
}
