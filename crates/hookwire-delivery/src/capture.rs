//! Event capture: the entry point the application calls when a subject is
//! mutated.

use std::sync::Arc;

use hookwire_core::{Clock, Message, MutationKind, Subject, WebhookRegistry};
use tracing::debug;

use crate::{error::Result, processor::MessageProcessor, storage::DeliveryStorage};

/// Records mutations as messages.
#[derive(Clone)]
pub struct EventCapture {
    storage: Arc<dyn DeliveryStorage>,
    registry: Arc<WebhookRegistry>,
    processor: MessageProcessor,
    clock: Arc<dyn Clock>,
}

impl EventCapture {
    /// Creates a capture endpoint.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        registry: Arc<WebhookRegistry>,
        processor: MessageProcessor,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { storage, registry, processor, clock }
    }

    /// Stores an unprocessed message referencing `subject`. Nothing is
    /// serialized yet.
    ///
    /// # Errors
    ///
    /// Returns `Core` if the message cannot be stored.
    pub async fn capture(&self, subject: &dyn Subject) -> Result<Message> {
        let message = Message::new(subject.subject_ref(), self.clock.now());
        self.storage.create_message(message.clone()).await?;

        debug!(message_id = %message.id, subject = %message.subject, "message captured");
        Ok(message)
    }

    /// Reacts to a mutation reported by the application.
    ///
    /// Returns `None` when the registration's trigger does not fire on
    /// `kind`. Synchronous registrations process the message inline against
    /// `subject` before returning; a processing failure is returned but the
    /// message stays captured for the next batch.
    ///
    /// # Errors
    ///
    /// - `Core(UnregisteredType)` if the subject type has no registration
    /// - any error of `capture` and, for synchronous registrations,
    ///   `MessageProcessor::process_with_subject`
    pub async fn on_mutation(
        &self,
        subject: &dyn Subject,
        kind: MutationKind,
    ) -> Result<Option<Message>> {
        let registration = self.registry.lookup(&subject.subject_type())?;
        if !registration.trigger.fires_on(kind) {
            return Ok(None);
        }

        let message = self.capture(subject).await?;
        if registration.synchronous {
            self.processor.process_with_subject(message.clone(), subject).await?;
        }

        Ok(Some(message))
    }
}
