//! Delivery events and handler traits.
//!
//! The delivery worker and retry sweeper report every outcome as a
//! `DeliveryEvent`. Subscribers (audit logs, metrics exporters, tests)
//! implement `EventHandler`; the delivery path never depends on them.
//!
//! ```text
//! ┌────────────────┐  Succeeded/Failed   ┌────────────────────────┐
//! │ DeliveryWorker │ ──────────────────▶ │                        │
//! └────────────────┘                     │ MulticastEventHandler  │ ──▶ subscribers
//! ┌────────────────┐      Exhausted      │                        │
//! │ RetrySweeper   │ ──────────────────▶ │                        │
//! └────────────────┘                     └────────────────────────┘
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{ListenerId, MessageId, SubjectRef, TaskId};

/// Events emitted by the delivery system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DeliveryEvent {
    /// An attempt delivered the payload.
    Succeeded(DeliverySucceededEvent),

    /// An attempt failed; the task stays open until retried or exhausted.
    Failed(DeliveryFailedEvent),

    /// The sweeper gave up on a task.
    Exhausted(DeliveryExhaustedEvent),
}

impl DeliveryEvent {
    /// Task the event is about.
    pub fn task_id(&self) -> TaskId {
        match self {
            Self::Succeeded(e) => e.task_id,
            Self::Failed(e) => e.task_id,
            Self::Exhausted(e) => e.task_id,
        }
    }
}

/// Emitted when an attempt succeeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliverySucceededEvent {
    /// Delivered task.
    pub task_id: TaskId,
    /// Message the payload came from.
    pub message_id: MessageId,
    /// Receiving listener.
    pub listener_id: ListenerId,
    /// Subject of the message.
    pub subject: SubjectRef,
    /// URL the payload was POSTed to.
    pub url: String,
    /// Status returned by the listener.
    pub response_status: u16,
    /// Attempt number (1-based).
    pub attempt_number: u32,
    /// When the delivery completed.
    pub delivered_at: DateTime<Utc>,
    /// Size of the payload in bytes.
    pub payload_size: usize,
}

/// Emitted when an attempt fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryFailedEvent {
    /// Failed task.
    pub task_id: TaskId,
    /// Message the payload came from.
    pub message_id: MessageId,
    /// Target listener.
    pub listener_id: ListenerId,
    /// Subject of the message.
    pub subject: SubjectRef,
    /// URL the payload was POSTed to.
    pub url: String,
    /// Status, if the listener responded.
    pub response_status: Option<u16>,
    /// Attempt number (1-based).
    pub attempt_number: u32,
    /// When the attempt failed.
    pub failed_at: DateTime<Utc>,
    /// Failure description.
    pub error_message: String,
}

/// Emitted when the sweeper marks a task processed without delivering it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryExhaustedEvent {
    /// Abandoned task.
    pub task_id: TaskId,
    /// Message the task belonged to.
    pub message_id: MessageId,
    /// Listener that never received it.
    pub listener_id: ListenerId,
    /// Attempts made before giving up.
    pub attempts: u32,
    /// When the task was abandoned.
    pub exhausted_at: DateTime<Utc>,
}

/// Receives delivery events.
///
/// Implementations must not fail the delivery path: errors are logged by the
/// handler, never returned.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + std::fmt::Debug {
    /// Handles a delivery event.
    async fn handle_event(&self, event: DeliveryEvent);
}

/// Discards all events.
#[derive(Debug, Default)]
pub struct NoOpEventHandler;

impl NoOpEventHandler {
    /// Creates a new no-op event handler.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl EventHandler for NoOpEventHandler {
    async fn handle_event(&self, _event: DeliveryEvent) {}
}

/// Forwards every event to all subscribers concurrently.
#[derive(Debug, Clone, Default)]
pub struct MulticastEventHandler {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl MulticastEventHandler {
    /// Creates a handler with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subscriber.
    pub fn add_subscriber(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    /// Number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.handlers.len()
    }
}

#[async_trait::async_trait]
impl EventHandler for MulticastEventHandler {
    async fn handle_event(&self, event: DeliveryEvent) {
        let futures = self.handlers.iter().map(|handler| {
            let event = event.clone();
            async move {
                handler.handle_event(event).await;
            }
        });

        futures::future::join_all(futures).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Debug, Default)]
    struct CountingHandler {
        count: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl EventHandler for CountingHandler {
        async fn handle_event(&self, _event: DeliveryEvent) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn exhausted_event() -> DeliveryEvent {
        DeliveryEvent::Exhausted(DeliveryExhaustedEvent {
            task_id: TaskId::new(),
            message_id: MessageId::new(),
            listener_id: ListenerId::new(),
            attempts: 3,
            exhausted_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn multicast_reaches_every_subscriber() {
        let first = Arc::new(CountingHandler::default());
        let second = Arc::new(CountingHandler::default());

        let mut multicast = MulticastEventHandler::new();
        multicast.add_subscriber(first.clone());
        multicast.add_subscriber(second.clone());
        assert_eq!(multicast.subscriber_count(), 2);

        multicast.handle_event(exhausted_event()).await;

        assert_eq!(first.count.load(Ordering::SeqCst), 1);
        assert_eq!(second.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_multicast_and_noop_accept_events() {
        MulticastEventHandler::new().handle_event(exhausted_event()).await;
        NoOpEventHandler::new().handle_event(exhausted_event()).await;
    }

    #[test]
    fn task_id_is_exposed_for_every_variant() {
        let event = exhausted_event();
        let DeliveryEvent::Exhausted(ref inner) = event else { unreachable!() };
        assert_eq!(event.task_id(), inner.task_id);
    }
}
