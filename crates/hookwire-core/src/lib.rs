//! Core types for hookwire.
//!
//! Domain models, the subject capability, payload serializers, the webhook
//! registry, delivery events, a clock abstraction and PostgreSQL
//! persistence. The delivery crate builds the capture, fan-out and retry
//! machinery on top of these.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod models;
pub mod registry;
pub mod serializer;
pub mod storage;
pub mod subject;
pub mod time;

pub use error::{CoreError, Result};
pub use events::{
    DeliveryEvent, DeliveryExhaustedEvent, DeliveryFailedEvent, DeliverySucceededEvent,
    EventHandler, MulticastEventHandler, NoOpEventHandler,
};
pub use models::{
    payload_digest, DeliveryAttempt, DeliveryTask, Listener, ListenerId, Message, MessageId,
    PendingDelivery, SubjectRef, SubjectType, TaskId,
};
pub use registry::{
    MutationKind, Registration, RegistryBuilder, TriggerEvent, WebhookConfig, WebhookRegistry,
};
pub use serializer::{JsonSerializer, Serializer};
pub use subject::{render_property, InMemorySubjects, JsonSubject, Subject, SubjectResolver};
pub use time::{Clock, RealClock, TestClock};
