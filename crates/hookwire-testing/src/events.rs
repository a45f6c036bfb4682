//! Event recording for assertions on delivery outcomes.

use hookwire_core::{DeliveryEvent, EventHandler, TaskId};
use tokio::sync::RwLock;

/// Records every delivery event it receives.
#[derive(Debug, Default)]
pub struct RecordingEventHandler {
    events: RwLock<Vec<DeliveryEvent>>,
}

impl RecordingEventHandler {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Events received so far, in arrival order.
    pub async fn events(&self) -> Vec<DeliveryEvent> {
        self.events.read().await.clone()
    }

    /// Events concerning `task_id`.
    pub async fn events_for(&self, task_id: TaskId) -> Vec<DeliveryEvent> {
        self.events.read().await.iter().filter(|e| e.task_id() == task_id).cloned().collect()
    }

    /// Number of `Succeeded` events.
    pub async fn succeeded_count(&self) -> usize {
        self.count(|e| matches!(e, DeliveryEvent::Succeeded(_))).await
    }

    /// Number of `Failed` events.
    pub async fn failed_count(&self) -> usize {
        self.count(|e| matches!(e, DeliveryEvent::Failed(_))).await
    }

    /// Number of `Exhausted` events.
    pub async fn exhausted_count(&self) -> usize {
        self.count(|e| matches!(e, DeliveryEvent::Exhausted(_))).await
    }

    /// Forgets all recorded events.
    pub async fn clear(&self) {
        self.events.write().await.clear();
    }

    async fn count(&self, predicate: impl Fn(&DeliveryEvent) -> bool) -> usize {
        self.events.read().await.iter().filter(|e| predicate(e)).count()
    }
}

#[async_trait::async_trait]
impl EventHandler for RecordingEventHandler {
    async fn handle_event(&self, event: DeliveryEvent) {
        self.events.write().await.push(event);
    }
}
