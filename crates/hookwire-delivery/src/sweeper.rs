//! Retry sweeping.
//!
//! For each registration, in subject type order, the sweeper first gives up
//! on open tasks that have used all their attempts, then makes one more
//! attempt on every other open task. A task whose attempt in this sweep
//! reaches the ceiling is therefore given up by the next sweep.

use std::sync::Arc;

use futures::{stream, StreamExt};
use hookwire_core::{
    Clock, DeliveryEvent, DeliveryExhaustedEvent, EventHandler, Registration, TaskId,
    WebhookRegistry,
};
use tracing::{debug, info, warn};

use crate::{
    error::{DeliveryError, Result},
    storage::DeliveryStorage,
    worker::DeliveryWorker,
};

/// A retry whose outcome could not be recorded.
#[derive(Debug)]
pub struct RetryFailure {
    /// Affected task.
    pub task_id: TaskId,
    /// Cause.
    pub error: DeliveryError,
}

/// Summary of one sweep.
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Attempts made.
    pub retried: usize,
    /// Attempts that delivered.
    pub delivered: usize,
    /// Attempts that failed.
    pub failed: usize,
    /// Tasks given up on.
    pub exhausted: usize,
    /// Attempts whose state could not be persisted.
    pub errors: Vec<RetryFailure>,
}

/// Retries open tasks and gives up on exhausted ones.
#[derive(Clone)]
pub struct RetrySweeper {
    storage: Arc<dyn DeliveryStorage>,
    registry: Arc<WebhookRegistry>,
    worker: DeliveryWorker,
    event_handler: Arc<dyn EventHandler>,
    clock: Arc<dyn Clock>,
    concurrency: usize,
}

impl RetrySweeper {
    /// Creates a sweeper. `concurrency` bounds simultaneous attempts and is
    /// raised to at least 1.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        registry: Arc<WebhookRegistry>,
        worker: DeliveryWorker,
        event_handler: Arc<dyn EventHandler>,
        clock: Arc<dyn Clock>,
        concurrency: usize,
    ) -> Self {
        Self {
            storage,
            registry,
            worker,
            event_handler,
            clock,
            concurrency: concurrency.max(1),
        }
    }

    /// Runs one sweep over every registration.
    ///
    /// # Errors
    ///
    /// Returns `Core` if tasks cannot be selected or exhausted. Failures of
    /// individual retries are collected in the report.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        for registration in self.registry.registrations() {
            self.sweep_registration(registration, &mut report).await?;
        }

        debug!(
            retried = report.retried,
            delivered = report.delivered,
            failed = report.failed,
            exhausted = report.exhausted,
            "sweep finished"
        );
        Ok(report)
    }

    async fn sweep_registration(
        &self,
        registration: &Registration,
        report: &mut SweepReport,
    ) -> Result<()> {
        let subject_type = &registration.subject_type;
        let max_attempts = registration.max_attempts;

        let now = self.clock.now();
        let exhausted = self.storage.exhaust_tasks(subject_type.clone(), max_attempts, now).await?;
        for task in &exhausted {
            warn!(
                task_id = %task.id,
                message_id = %task.message_id,
                listener_id = %task.listener_id,
                subject_type = %subject_type,
                attempts = task.attempts,
                "giving up on delivery"
            );
            self.event_handler
                .handle_event(DeliveryEvent::Exhausted(DeliveryExhaustedEvent {
                    task_id: task.id,
                    message_id: task.message_id,
                    listener_id: task.listener_id,
                    attempts: task.attempts,
                    exhausted_at: now,
                }))
                .await;
        }
        report.exhausted += exhausted.len();

        let retryable = self.storage.retryable_tasks(subject_type.clone(), max_attempts).await?;
        if retryable.is_empty() {
            return Ok(());
        }
        info!(subject_type = %subject_type, tasks = retryable.len(), "retrying deliveries");

        let results: Vec<(TaskId, Result<bool>)> = stream::iter(retryable)
            .map(|pending| {
                let task_id = pending.task.id;
                async move { (task_id, self.worker.attempt(pending, true).await) }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (task_id, result) in results {
            match result {
                Ok(true) => {
                    report.retried += 1;
                    report.delivered += 1;
                },
                Ok(false) => {
                    report.retried += 1;
                    report.failed += 1;
                },
                // Processed since it was selected; nothing to do.
                Err(DeliveryError::TaskTerminal { .. }) => {},
                Err(error) => {
                    warn!(task_id = %task_id, error = %error, "retry not recorded");
                    report.errors.push(RetryFailure { task_id, error });
                },
            }
        }

        Ok(())
    }
}
