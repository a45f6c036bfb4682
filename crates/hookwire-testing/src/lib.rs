//! Test infrastructure for deterministic hookwire tests.
//!
//! `TestEnv` wires a full `DeliveryEngine` over in-memory storage, an
//! in-memory subject table, a manually driven clock and a recording event
//! handler. Listener endpoints are served by a wiremock server.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use hookwire_core::{
    InMemorySubjects, JsonSubject, Listener, Message, MutationKind, Subject, SubjectType,
    TestClock, WebhookConfig, WebhookRegistry,
};
use hookwire_delivery::{
    storage::{memory::InMemoryDeliveryStorage, DeliveryStorage},
    BatchReport, ClientConfig, DeliveryConfig, DeliveryEngine,
};

pub mod events;
pub mod fixtures;
pub mod http;

pub use events::RecordingEventHandler;
pub use fixtures::{ListenerBuilder, SubjectBuilder};
pub use http::{MockServer, RecordedRequest};

/// Builder for `TestEnv`.
pub struct TestEnvBuilder {
    registrations: Vec<(Vec<SubjectType>, WebhookConfig)>,
    concurrency: usize,
    timeout: Duration,
    require_success_status: bool,
}

impl Default for TestEnvBuilder {
    fn default() -> Self {
        Self {
            registrations: Vec::new(),
            concurrency: 1, // deterministic request order
            timeout: Duration::from_secs(1),
            require_success_status: false,
        }
    }
}

impl TestEnvBuilder {
    /// Creates a builder with no registrations.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `subject_types` with `config`.
    #[must_use]
    pub fn register<I, T>(mut self, subject_types: I, config: WebhookConfig) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<SubjectType>,
    {
        self.registrations.push((subject_types.into_iter().map(Into::into).collect(), config));
        self
    }

    /// Sets the attempt concurrency (default 1).
    #[must_use]
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Sets the per-request timeout (default 1s).
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Treats non-2xx responses as failures.
    #[must_use]
    pub fn require_success_status(mut self, required: bool) -> Self {
        self.require_success_status = required;
        self
    }

    /// Builds the environment and starts the mock server.
    pub async fn build(self) -> Result<TestEnv> {
        let mut builder = WebhookRegistry::builder();
        for (subject_types, config) in self.registrations {
            builder.register(subject_types, config).context("invalid test registration")?;
        }
        let registry = Arc::new(builder.build());

        let storage = Arc::new(InMemoryDeliveryStorage::new());
        let subjects = Arc::new(InMemorySubjects::new());
        let events = Arc::new(RecordingEventHandler::new());
        let clock = TestClock::new();

        let config = DeliveryConfig {
            client_config: ClientConfig {
                timeout: self.timeout,
                require_success_status: self.require_success_status,
                ..ClientConfig::default()
            },
            concurrency: self.concurrency,
            ..DeliveryConfig::default()
        };

        let engine = DeliveryEngine::new(
            storage.clone(),
            subjects.clone(),
            registry.clone(),
            events.clone(),
            Arc::new(clock.clone()),
            config,
        )
        .context("failed to build delivery engine")?;

        Ok(TestEnv {
            http: MockServer::start().await,
            clock,
            storage,
            subjects,
            events,
            registry,
            engine,
        })
    }
}

/// Fully wired in-memory delivery environment.
pub struct TestEnv {
    /// Mock listener endpoints.
    pub http: MockServer,
    /// Clock shared with the engine.
    pub clock: TestClock,
    /// Delivery storage shared with the engine.
    pub storage: Arc<InMemoryDeliveryStorage>,
    /// Live subjects visible to the engine.
    pub subjects: Arc<InMemorySubjects>,
    /// Every event the engine published.
    pub events: Arc<RecordingEventHandler>,
    /// Registry the engine was built with.
    pub registry: Arc<WebhookRegistry>,
    /// The engine under test.
    pub engine: DeliveryEngine,
}

impl TestEnv {
    /// Starts building an environment.
    pub fn builder() -> TestEnvBuilder {
        TestEnvBuilder::new()
    }

    /// Stores a listener pointing at `path` on the mock server.
    pub async fn add_listener(&self, builder: ListenerBuilder, path: &str) -> Result<Listener> {
        let listener = builder.url(self.http.url(path)).build();
        self.storage.add_listener(listener.clone()).await?;
        Ok(listener)
    }

    /// Makes `subject` visible to the engine in its current state.
    pub async fn save_subject(&self, subject: &JsonSubject) {
        self.subjects.upsert(Arc::new(subject.clone())).await;
    }

    /// Applies the mutation to the subject table and reports it to the
    /// engine: deletions remove the subject, everything else saves it.
    pub async fn mutate(
        &self,
        subject: &JsonSubject,
        kind: MutationKind,
    ) -> Result<Option<Message>> {
        match kind {
            MutationKind::Deleted => self.delete_subject(subject).await,
            MutationKind::Created | MutationKind::Updated => self.save_subject(subject).await,
        }
        Ok(self.engine.capture().on_mutation(subject, kind).await?)
    }

    /// Removes `subject` from the subject table.
    pub async fn delete_subject(&self, subject: &JsonSubject) {
        self.subjects.remove(&subject.subject_ref()).await;
    }

    /// Runs one batch.
    pub async fn run_batch(&self) -> Result<BatchReport> {
        Ok(self.engine.run_once().await?)
    }
}
