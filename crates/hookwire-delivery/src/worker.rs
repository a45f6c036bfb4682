//! Single delivery attempts.
//!
//! The worker owns the attempt state machine: bump `attempts`, POST once,
//! then record `processed` or `failed_at`, persist, append to the attempt
//! history and publish a `DeliveryEvent`. It never schedules a retry; the
//! sweeper decides that.

use std::{sync::Arc, time::Instant};

use hookwire_core::{
    Clock, CoreError, DeliveryAttempt, DeliveryEvent, DeliveryFailedEvent, DeliverySucceededEvent,
    EventHandler, PendingDelivery, TaskId, WebhookRegistry,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    client::{DeliveryClient, DeliveryRequest},
    error::{DeliveryError, Result},
    storage::DeliveryStorage,
};

const FALLBACK_CONTENT_TYPE: &str = "application/json";

/// Performs delivery attempts for individual tasks.
#[derive(Clone)]
pub struct DeliveryWorker {
    storage: Arc<dyn DeliveryStorage>,
    client: DeliveryClient,
    registry: Arc<WebhookRegistry>,
    event_handler: Arc<dyn EventHandler>,
    clock: Arc<dyn Clock>,
}

impl DeliveryWorker {
    /// Creates a worker.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        client: DeliveryClient,
        registry: Arc<WebhookRegistry>,
        event_handler: Arc<dyn EventHandler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { storage, client, registry, event_handler, clock }
    }

    /// Makes one delivery attempt.
    ///
    /// Returns `Ok(true)` when delivered. A failed attempt returns
    /// `Ok(false)` when `fail_silently` is set and the transport error
    /// otherwise; in both cases the task state has been persisted first.
    ///
    /// # Errors
    ///
    /// - `TaskTerminal` if the task is already processed (no request is made)
    ///   or was saved by a concurrent attempt while this one was in flight
    /// - the transport error of a failed attempt when `fail_silently` is false
    /// - `Core` if the task state cannot be persisted
    pub async fn attempt(&self, pending: PendingDelivery, fail_silently: bool) -> Result<bool> {
        let PendingDelivery { mut task, url, payload, subject } = pending;

        if task.processed {
            return Err(DeliveryError::TaskTerminal { task_id: task.id });
        }

        let attempt_number = task.begin_attempt(self.clock.now());
        let content_type = self
            .registry
            .lookup(&subject.subject_type)
            .map_or(FALLBACK_CONTENT_TYPE, |registration| registration.serializer.content_type());

        debug!(
            task_id = %task.id,
            message_id = %task.message_id,
            listener_id = %task.listener_id,
            attempt = attempt_number,
            url = %url,
            "attempting delivery"
        );

        let started = Instant::now();
        let outcome = self
            .client
            .deliver(DeliveryRequest {
                task_id: task.id,
                message_id: task.message_id,
                url: url.clone(),
                body: payload.clone(),
                content_type,
                attempt_number,
            })
            .await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let now = self.clock.now();

        let (response_status, error_message) = match &outcome {
            Ok(response) => {
                task.mark_delivered(now);
                (Some(response.status_code), None)
            },
            Err(error) => {
                task.mark_failed(now);
                (error.response_status(), Some(error.to_string()))
            },
        };

        // Another attempt finished or advanced the task first; this one is dropped.
        if !self.storage.save_task(task.clone()).await? {
            warn!(
                task_id = %task.id,
                attempt = attempt_number,
                "task changed concurrently; attempt discarded"
            );
            return Err(DeliveryError::TaskTerminal { task_id: task.id });
        }

        self.storage
            .record_attempt(DeliveryAttempt {
                id: Uuid::new_v4(),
                task_id: task.id,
                attempt_number,
                url: url.clone(),
                response_status,
                succeeded: outcome.is_ok(),
                error_message,
                duration_ms,
                attempted_at: now,
            })
            .await?;

        match outcome {
            Ok(response) => {
                info!(
                    task_id = %task.id,
                    listener_id = %task.listener_id,
                    attempt = attempt_number,
                    status = response.status_code,
                    duration_ms,
                    "delivery succeeded"
                );
                self.event_handler
                    .handle_event(DeliveryEvent::Succeeded(DeliverySucceededEvent {
                        task_id: task.id,
                        message_id: task.message_id,
                        listener_id: task.listener_id,
                        subject,
                        url,
                        response_status: response.status_code,
                        attempt_number,
                        delivered_at: now,
                        payload_size: payload.len(),
                    }))
                    .await;
                Ok(true)
            },
            Err(error) => {
                warn!(
                    task_id = %task.id,
                    listener_id = %task.listener_id,
                    attempt = attempt_number,
                    error = %error,
                    "delivery failed"
                );
                self.event_handler
                    .handle_event(DeliveryEvent::Failed(DeliveryFailedEvent {
                        task_id: task.id,
                        message_id: task.message_id,
                        listener_id: task.listener_id,
                        subject,
                        url,
                        response_status,
                        attempt_number,
                        failed_at: now,
                        error_message: error.to_string(),
                    }))
                    .await;

                if fail_silently {
                    Ok(false)
                } else {
                    Err(error)
                }
            },
        }
    }

    /// Loads a task and makes one attempt, surfacing delivery failures.
    ///
    /// # Errors
    ///
    /// Returns `Core(NotFound)` for unknown tasks, plus everything
    /// `attempt` returns with `fail_silently = false`.
    pub async fn deliver_task(&self, task_id: TaskId) -> Result<bool> {
        let pending = self
            .storage
            .find_pending_delivery(task_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("delivery task {task_id}")))?;

        self.attempt(pending, false).await
    }
}
