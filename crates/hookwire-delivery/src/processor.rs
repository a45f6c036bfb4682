//! Message processing: listener resolution, serialization and fan-out.
//!
//! A message is processed at most once. It either has no interested
//! listeners (or no subject any more) and is deleted, or it is serialized
//! and fanned out into one delivery task per listener in a single atomic
//! storage step. First attempts follow immediately, concurrently and
//! silently.

use std::sync::Arc;

use futures::{stream, StreamExt};
use hookwire_core::{
    Clock, DeliveryTask, Message, MessageId, PendingDelivery, Subject, SubjectResolver,
    WebhookRegistry,
};
use tracing::{debug, info, warn};

use crate::{
    error::{DeliveryError, Result},
    resolver::ListenerResolver,
    storage::DeliveryStorage,
    worker::DeliveryWorker,
};

/// Why a message was deleted instead of fanned out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// No listener matched the subject.
    NoListeners,
    /// The subject no longer exists.
    SubjectMissing,
}

/// Result of processing one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The message was deleted.
    Discarded {
        /// Deleted message.
        message_id: MessageId,
        /// Why it was deleted.
        reason: DiscardReason,
    },
    /// The message was serialized and fanned out.
    FannedOut {
        /// Processed message.
        message_id: MessageId,
        /// Delivery tasks created.
        tasks: usize,
        /// Tasks delivered by their first attempt.
        delivered: usize,
    },
}

/// A message that could not be processed in this batch.
#[derive(Debug)]
pub struct MessageFailure {
    /// Message left unprocessed.
    pub message_id: MessageId,
    /// Cause.
    pub error: DeliveryError,
}

/// Summary of `process_pending`.
#[derive(Debug, Default)]
pub struct ProcessReport {
    /// Per-message outcomes.
    pub outcomes: Vec<ProcessOutcome>,
    /// Messages left unprocessed.
    pub failures: Vec<MessageFailure>,
}

impl ProcessReport {
    /// Number of messages fanned out.
    pub fn fanned_out(&self) -> usize {
        self.outcomes.iter().filter(|o| matches!(o, ProcessOutcome::FannedOut { .. })).count()
    }

    /// Number of messages deleted.
    pub fn discarded(&self) -> usize {
        self.outcomes.iter().filter(|o| matches!(o, ProcessOutcome::Discarded { .. })).count()
    }

    /// Delivery tasks created.
    pub fn tasks_created(&self) -> usize {
        self.outcomes
            .iter()
            .map(|o| match o {
                ProcessOutcome::FannedOut { tasks, .. } => *tasks,
                ProcessOutcome::Discarded { .. } => 0,
            })
            .sum()
    }

    /// Tasks delivered on their first attempt.
    pub fn delivered(&self) -> usize {
        self.outcomes
            .iter()
            .map(|o| match o {
                ProcessOutcome::FannedOut { delivered, .. } => *delivered,
                ProcessOutcome::Discarded { .. } => 0,
            })
            .sum()
    }

    /// Messages whose subject type has no registration.
    pub fn unregistered(&self) -> usize {
        self.failures.iter().filter(|f| f.error.is_unregistered_type()).count()
    }
}

/// Processes captured messages.
#[derive(Clone)]
pub struct MessageProcessor {
    storage: Arc<dyn DeliveryStorage>,
    subjects: Arc<dyn SubjectResolver>,
    registry: Arc<WebhookRegistry>,
    resolver: ListenerResolver,
    worker: DeliveryWorker,
    clock: Arc<dyn Clock>,
    concurrency: usize,
}

impl MessageProcessor {
    /// Creates a processor. `concurrency` bounds the first attempts of one
    /// fan-out and is raised to at least 1.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        subjects: Arc<dyn SubjectResolver>,
        registry: Arc<WebhookRegistry>,
        worker: DeliveryWorker,
        clock: Arc<dyn Clock>,
        concurrency: usize,
    ) -> Self {
        Self {
            resolver: ListenerResolver::new(storage.clone()),
            storage,
            subjects,
            registry,
            worker,
            clock,
            concurrency: concurrency.max(1),
        }
    }

    /// Processes a message against the current state of its subject.
    ///
    /// # Errors
    ///
    /// - `Core(UnregisteredType)` if the subject type has no registration
    /// - `Core(Serialization)` if the payload cannot be built; nothing is
    ///   persisted and the message stays unprocessed
    /// - `Core` for storage failures
    pub async fn process(&self, message: Message) -> Result<ProcessOutcome> {
        self.registry.lookup(&message.subject.subject_type)?;

        match self.subjects.load(&message.subject).await? {
            Some(subject) => self.process_with_subject(message, subject.as_ref()).await,
            None => {
                warn!(
                    message_id = %message.id,
                    subject = %message.subject,
                    "subject no longer exists; discarding message"
                );
                self.discard(message.id, DiscardReason::SubjectMissing).await
            },
        }
    }

    /// Processes a message against an already loaded subject instance.
    ///
    /// # Errors
    ///
    /// Same as `process`.
    pub async fn process_with_subject(
        &self,
        message: Message,
        subject: &dyn Subject,
    ) -> Result<ProcessOutcome> {
        let registration = self.registry.lookup(&message.subject.subject_type)?;

        let listeners = self.resolver.resolve(&message, subject).await?;
        if listeners.is_empty() {
            return self.discard(message.id, DiscardReason::NoListeners).await;
        }

        let payload = registration.serializer.serialize(subject, &registration.fields)?;

        let now = self.clock.now();
        let mut message = message;
        message.set_payload(payload, now);
        message.mark_processed(now);

        let tasks: Vec<DeliveryTask> =
            listeners.iter().map(|l| DeliveryTask::new(message.id, l.id, now)).collect();
        self.storage.commit_fan_out(message.clone(), tasks.clone()).await?;

        info!(
            message_id = %message.id,
            subject_type = %message.subject.subject_type,
            tasks = tasks.len(),
            "message fanned out"
        );

        let pending: Vec<PendingDelivery> = tasks
            .into_iter()
            .zip(listeners)
            .map(|(task, listener)| PendingDelivery {
                task,
                url: listener.url,
                payload: message.payload.clone(),
                subject: message.subject.clone(),
            })
            .collect();
        let task_count = pending.len();

        let delivered = stream::iter(pending)
            .map(|pending| {
                let task_id = pending.task.id;
                async move { (task_id, self.worker.attempt(pending, true).await) }
            })
            .buffer_unordered(self.concurrency)
            .fold(0usize, |delivered, (task_id, result)| async move {
                match result {
                    Ok(true) => delivered + 1,
                    Ok(false) => delivered,
                    Err(error) => {
                        warn!(task_id = %task_id, error = %error, "first attempt not recorded");
                        delivered
                    },
                }
            })
            .await;

        Ok(ProcessOutcome::FannedOut { message_id: message.id, tasks: task_count, delivered })
    }

    /// Processes every unprocessed message, oldest first.
    ///
    /// Per-message failures are collected in the report and leave the
    /// message for the next batch.
    ///
    /// # Errors
    ///
    /// Returns `Core` if the unprocessed messages cannot be listed.
    pub async fn process_pending(&self) -> Result<ProcessReport> {
        let messages = self.storage.unprocessed_messages().await?;
        debug!(count = messages.len(), "processing pending messages");

        let mut report = ProcessReport::default();
        for message in messages {
            let message_id = message.id;
            match self.process(message).await {
                Ok(outcome) => report.outcomes.push(outcome),
                Err(error) => {
                    if error.is_unregistered_type() {
                        tracing::error!(message_id = %message_id, error = %error, "message has no registration");
                    } else {
                        warn!(message_id = %message_id, error = %error, "message not processed");
                    }
                    report.failures.push(MessageFailure { message_id, error });
                },
            }
        }

        Ok(report)
    }

    async fn discard(&self, message_id: MessageId, reason: DiscardReason) -> Result<ProcessOutcome> {
        self.storage.delete_message(message_id).await?;
        debug!(message_id = %message_id, reason = ?reason, "message discarded");
        Ok(ProcessOutcome::Discarded { message_id, reason })
    }
}
