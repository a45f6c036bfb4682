//! Webhook registry: static configuration keyed by subject type.
//!
//! Registrations are collected in a `RegistryBuilder` at startup and frozen
//! into an immutable `WebhookRegistry`, which is shared by reference with
//! event capture, the message processor and the retry sweeper.

use std::{collections::BTreeMap, fmt, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    error::{CoreError, Result},
    models::SubjectType,
    serializer::{JsonSerializer, Serializer},
};

/// Kind of mutation reported by the external observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    /// The subject was inserted.
    Created,
    /// An existing subject was modified.
    Updated,
    /// The subject was removed.
    Deleted,
}

/// Mutation a registration is bound to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerEvent {
    /// Fires on both creation and update.
    #[default]
    Saved,
    /// Fires on creation only.
    Created,
    /// Fires on update only.
    Updated,
    /// Fires on deletion. The subject is gone by the time a batch runs, so
    /// registrations using it must be synchronous.
    Deleted,
}

impl TriggerEvent {
    /// Returns true when a mutation of `kind` fires this trigger.
    pub const fn fires_on(self, kind: MutationKind) -> bool {
        matches!(
            (self, kind),
            (Self::Saved, MutationKind::Created | MutationKind::Updated)
                | (Self::Created, MutationKind::Created)
                | (Self::Updated, MutationKind::Updated)
                | (Self::Deleted, MutationKind::Deleted)
        )
    }
}

/// Options for a webhook, applied to every subject type it is registered for.
#[derive(Clone)]
pub struct WebhookConfig {
    /// Properties to serialize, in order.
    pub fields: Vec<String>,
    /// Mutation that captures a message.
    pub trigger: TriggerEvent,
    /// Payload producer.
    pub serializer: Arc<dyn Serializer>,
    /// Delivery attempts per listener before giving up.
    pub max_attempts: u32,
    /// Whether messages are processed at capture time instead of by the
    /// next batch.
    pub synchronous: bool,
}

impl WebhookConfig {
    /// Creates a config with the default trigger (`Saved`), JSON serializer,
    /// one attempt and batch processing.
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
            trigger: TriggerEvent::default(),
            serializer: Arc::new(JsonSerializer),
            max_attempts: 1,
            synchronous: false,
        }
    }

    /// Sets the trigger event.
    #[must_use]
    pub fn trigger(mut self, trigger: TriggerEvent) -> Self {
        self.trigger = trigger;
        self
    }

    /// Sets the serializer.
    #[must_use]
    pub fn serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Sets the attempt ceiling.
    #[must_use]
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Enables or disables inline processing at capture time.
    #[must_use]
    pub fn synchronous(mut self, synchronous: bool) -> Self {
        self.synchronous = synchronous;
        self
    }
}

impl fmt::Debug for WebhookConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookConfig")
            .field("fields", &self.fields)
            .field("trigger", &self.trigger)
            .field("serializer", &self.serializer)
            .field("max_attempts", &self.max_attempts)
            .field("synchronous", &self.synchronous)
            .finish()
    }
}

/// Immutable webhook registration for one subject type.
#[derive(Debug, Clone)]
pub struct Registration {
    /// Subject type this registration applies to.
    pub subject_type: SubjectType,
    /// Properties to serialize, in order, without duplicates.
    pub fields: Vec<String>,
    /// Mutation that captures a message.
    pub trigger: TriggerEvent,
    /// Payload producer.
    pub serializer: Arc<dyn Serializer>,
    /// Delivery attempts per listener before giving up (at least 1).
    pub max_attempts: u32,
    /// Whether messages are processed at capture time.
    pub synchronous: bool,
}

/// Collects registrations before the registry is frozen.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    registrations: BTreeMap<SubjectType, Registration>,
}

impl RegistryBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `config` to each of `subject_types`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidRegistration` when no subject type or no
    /// field is given, when `max_attempts` is zero, when a `Deleted` trigger
    /// is not synchronous, or when a subject type is already registered.
    /// Nothing is registered on error.
    pub fn register<I, T>(&mut self, subject_types: I, config: WebhookConfig) -> Result<&mut Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<SubjectType>,
    {
        let subject_types: Vec<SubjectType> = subject_types.into_iter().map(Into::into).collect();

        if subject_types.is_empty() {
            return Err(CoreError::InvalidRegistration(
                "at least one subject type is required".to_string(),
            ));
        }
        if config.fields.is_empty() {
            return Err(CoreError::InvalidRegistration(
                "at least one field is required".to_string(),
            ));
        }
        if config.max_attempts == 0 {
            return Err(CoreError::InvalidRegistration(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if config.trigger == TriggerEvent::Deleted && !config.synchronous {
            return Err(CoreError::InvalidRegistration(
                "the deleted trigger requires synchronous processing".to_string(),
            ));
        }

        let mut fields: Vec<String> = Vec::with_capacity(config.fields.len());
        for field in config.fields {
            if !fields.contains(&field) {
                fields.push(field);
            }
        }

        for (index, subject_type) in subject_types.iter().enumerate() {
            if self.registrations.contains_key(subject_type)
                || subject_types[..index].contains(subject_type)
            {
                return Err(CoreError::InvalidRegistration(format!(
                    "subject type '{subject_type}' is already registered"
                )));
            }
        }

        for subject_type in subject_types {
            self.registrations.insert(subject_type.clone(), Registration {
                subject_type,
                fields: fields.clone(),
                trigger: config.trigger,
                serializer: config.serializer.clone(),
                max_attempts: config.max_attempts,
                synchronous: config.synchronous,
            });
        }

        Ok(self)
    }

    /// Freezes the registrations.
    pub fn build(self) -> WebhookRegistry {
        WebhookRegistry { registrations: self.registrations }
    }
}

/// Frozen, read-only set of webhook registrations.
#[derive(Debug, Clone, Default)]
pub struct WebhookRegistry {
    registrations: BTreeMap<SubjectType, Registration>,
}

impl WebhookRegistry {
    /// Creates a builder.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Returns the registration for `subject_type`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::UnregisteredType` if there is none.
    pub fn lookup(&self, subject_type: &SubjectType) -> Result<&Registration> {
        self.registrations.get(subject_type).ok_or_else(|| CoreError::unregistered(subject_type))
    }

    /// Iterates registrations ordered by subject type.
    pub fn registrations(&self) -> impl Iterator<Item = &Registration> {
        self.registrations.values()
    }

    /// Number of registered subject types.
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    /// Returns true when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_binds_every_type() {
        let mut builder = WebhookRegistry::builder();
        builder
            .register(["article", "page"], WebhookConfig::new(["title"]).max_attempts(3))
            .unwrap();
        let registry = builder.build();

        assert_eq!(registry.len(), 2);
        let page = registry.lookup(&SubjectType::new("page")).unwrap();
        assert_eq!(page.fields, vec!["title".to_string()]);
        assert_eq!(page.max_attempts, 3);
        assert_eq!(page.trigger, TriggerEvent::Saved);
        assert!(!page.synchronous);
    }

    #[test]
    fn lookup_of_unknown_type_fails() {
        let registry = WebhookRegistry::builder().build();
        let error = registry.lookup(&SubjectType::new("comment")).unwrap_err();
        assert!(matches!(error, CoreError::UnregisteredType { .. }));
    }

    #[test]
    fn duplicate_fields_are_collapsed_in_order() {
        let mut builder = WebhookRegistry::builder();
        builder.register(["article"], WebhookConfig::new(["title", "status", "title"])).unwrap();
        let registry = builder.build();

        let article = registry.lookup(&SubjectType::new("article")).unwrap();
        assert_eq!(article.fields, vec!["title".to_string(), "status".to_string()]);
    }

    #[test]
    fn invalid_registrations_are_rejected() {
        let mut builder = WebhookRegistry::builder();

        assert!(builder.register(Vec::<&str>::new(), WebhookConfig::new(["title"])).is_err());
        assert!(builder.register(["article"], WebhookConfig::new(Vec::<String>::new())).is_err());
        assert!(builder.register(["article"], WebhookConfig::new(["title"]).max_attempts(0)).is_err());
        assert!(builder.register(["a", "a"], WebhookConfig::new(["title"])).is_err());
        assert!(builder
            .register(["article"], WebhookConfig::new(["title"]).trigger(TriggerEvent::Deleted))
            .is_err());

        builder.register(["article"], WebhookConfig::new(["title"])).unwrap();
        assert!(builder.register(["page", "article"], WebhookConfig::new(["title"])).is_err());

        // The failed call must not have registered "page".
        let registry = builder.build();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn registrations_iterate_in_type_order() {
        let mut builder = WebhookRegistry::builder();
        builder.register(["page"], WebhookConfig::new(["title"])).unwrap();
        builder.register(["article"], WebhookConfig::new(["title"])).unwrap();
        let registry = builder.build();

        let order: Vec<&str> = registry.registrations().map(|r| r.subject_type.as_str()).collect();
        assert_eq!(order, vec!["article", "page"]);
    }

    #[test]
    fn deleted_trigger_is_accepted_when_synchronous() {
        let mut builder = WebhookRegistry::builder();
        let config = WebhookConfig::new(["title"]).trigger(TriggerEvent::Deleted).synchronous(true);
        builder.register(["article"], config).unwrap();

        let registry = builder.build();
        let article = registry.lookup(&SubjectType::new("article")).unwrap();
        assert_eq!(article.trigger, TriggerEvent::Deleted);
        assert!(article.synchronous);
    }

    #[test]
    fn trigger_matching() {
        assert!(TriggerEvent::Saved.fires_on(MutationKind::Created));
        assert!(TriggerEvent::Saved.fires_on(MutationKind::Updated));
        assert!(!TriggerEvent::Saved.fires_on(MutationKind::Deleted));
        assert!(TriggerEvent::Created.fires_on(MutationKind::Created));
        assert!(!TriggerEvent::Created.fires_on(MutationKind::Updated));
        assert!(TriggerEvent::Deleted.fires_on(MutationKind::Deleted));
    }
}
