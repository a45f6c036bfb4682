//! Storage abstraction for capture, fan-out and delivery.
//!
//! `PostgresDeliveryStorage` adapts `hookwire_core::storage::Storage`;
//! `memory::InMemoryDeliveryStorage` keeps everything in process and is the
//! test double used across the workspace. Both implementations give the
//! same guarantees:
//!
//! - fan-out is atomic: payload, `processed = true` and all tasks or nothing
//! - a processed message or task is never reopened
//! - a task's `attempts` never goes down
//! - removing a listener removes its tasks

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use hookwire_core::{
    error::Result, storage::Storage, DeliveryAttempt, DeliveryTask, Listener, ListenerId, Message,
    MessageId, PendingDelivery, SubjectType, TaskId,
};

/// Boxed future returned by storage operations.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Storage operations required by the delivery machinery.
pub trait DeliveryStorage: Send + Sync + 'static {
    /// Stores a newly captured message.
    fn create_message(&self, message: Message) -> StorageFuture<'_, ()>;

    /// Finds a message by id.
    fn find_message(&self, id: MessageId) -> StorageFuture<'_, Option<Message>>;

    /// Returns every unprocessed message, oldest first.
    fn unprocessed_messages(&self) -> StorageFuture<'_, Vec<Message>>;

    /// Deletes an unprocessed message. Returns whether it existed.
    fn delete_message(&self, id: MessageId) -> StorageFuture<'_, bool>;

    /// Stores the payload and digest, marks the message processed and
    /// creates its tasks in one atomic step.
    ///
    /// Fails without writing anything if the message is no longer
    /// unprocessed.
    fn commit_fan_out(&self, message: Message, tasks: Vec<DeliveryTask>)
        -> StorageFuture<'_, ()>;

    /// Stores a listener.
    fn add_listener(&self, listener: Listener) -> StorageFuture<'_, ()>;

    /// Removes a listener and its tasks. Returns whether it existed.
    fn remove_listener(&self, id: ListenerId) -> StorageFuture<'_, bool>;

    /// Returns every listener for a subject type.
    fn listeners_for(&self, subject_type: SubjectType) -> StorageFuture<'_, Vec<Listener>>;

    /// Finds a task by id.
    fn find_task(&self, id: TaskId) -> StorageFuture<'_, Option<DeliveryTask>>;

    /// Returns the tasks of a message.
    fn tasks_for_message(&self, message_id: MessageId) -> StorageFuture<'_, Vec<DeliveryTask>>;

    /// Loads a task with its listener URL and message payload.
    fn find_pending_delivery(&self, id: TaskId) -> StorageFuture<'_, Option<PendingDelivery>>;

    /// Writes back a task's attempt state. Returns false if the stored task
    /// is already processed or has more attempts recorded.
    fn save_task(&self, task: DeliveryTask) -> StorageFuture<'_, bool>;

    /// Open tasks of a subject type with `attempts < max_attempts`.
    fn retryable_tasks(
        &self,
        subject_type: SubjectType,
        max_attempts: u32,
    ) -> StorageFuture<'_, Vec<PendingDelivery>>;

    /// Marks open tasks of a subject type with `attempts >= max_attempts`
    /// processed and returns them.
    fn exhaust_tasks(
        &self,
        subject_type: SubjectType,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, Vec<DeliveryTask>>;

    /// Appends to a task's attempt history.
    fn record_attempt(&self, attempt: DeliveryAttempt) -> StorageFuture<'_, ()>;

    /// Returns a task's attempt history in attempt order.
    fn find_attempts(&self, task_id: TaskId) -> StorageFuture<'_, Vec<DeliveryAttempt>>;

    /// Takes the named lease for `ttl` unless another holder has it.
    fn try_acquire_lease(
        &self,
        name: String,
        holder: String,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> StorageFuture<'_, bool>;

    /// Releases the named lease if `holder` owns it.
    fn release_lease(&self, name: String, holder: String) -> StorageFuture<'_, ()>;
}

fn lease_expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
    now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// PostgreSQL storage adapter.
pub struct PostgresDeliveryStorage {
    storage: Arc<Storage>,
}

impl PostgresDeliveryStorage {
    /// Creates a new PostgreSQL storage adapter.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl DeliveryStorage for PostgresDeliveryStorage {
    fn create_message(&self, message: Message) -> StorageFuture<'_, ()> {
        Box::pin(async move {
            self.storage.messages.create(&message).await?;
            Ok(())
        })
    }

    fn find_message(&self, id: MessageId) -> StorageFuture<'_, Option<Message>> {
        Box::pin(async move { self.storage.messages.find_by_id(id).await })
    }

    fn unprocessed_messages(&self) -> StorageFuture<'_, Vec<Message>> {
        Box::pin(async move { self.storage.messages.find_unprocessed().await })
    }

    fn delete_message(&self, id: MessageId) -> StorageFuture<'_, bool> {
        Box::pin(async move { self.storage.messages.delete(id).await })
    }

    fn commit_fan_out(
        &self,
        message: Message,
        tasks: Vec<DeliveryTask>,
    ) -> StorageFuture<'_, ()> {
        Box::pin(async move { self.storage.commit_fan_out(&message, &tasks).await })
    }

    fn add_listener(&self, listener: Listener) -> StorageFuture<'_, ()> {
        Box::pin(async move {
            self.storage.listeners.create(&listener).await?;
            Ok(())
        })
    }

    fn remove_listener(&self, id: ListenerId) -> StorageFuture<'_, bool> {
        Box::pin(async move { self.storage.listeners.delete(id).await })
    }

    fn listeners_for(&self, subject_type: SubjectType) -> StorageFuture<'_, Vec<Listener>> {
        Box::pin(async move { self.storage.listeners.find_by_subject_type(&subject_type).await })
    }

    fn find_task(&self, id: TaskId) -> StorageFuture<'_, Option<DeliveryTask>> {
        Box::pin(async move { self.storage.delivery_tasks.find_by_id(id).await })
    }

    fn tasks_for_message(&self, message_id: MessageId) -> StorageFuture<'_, Vec<DeliveryTask>> {
        Box::pin(async move { self.storage.delivery_tasks.find_by_message(message_id).await })
    }

    fn find_pending_delivery(&self, id: TaskId) -> StorageFuture<'_, Option<PendingDelivery>> {
        Box::pin(async move { self.storage.delivery_tasks.find_pending(id).await })
    }

    fn save_task(&self, task: DeliveryTask) -> StorageFuture<'_, bool> {
        Box::pin(async move { self.storage.delivery_tasks.save(&task).await })
    }

    fn retryable_tasks(
        &self,
        subject_type: SubjectType,
        max_attempts: u32,
    ) -> StorageFuture<'_, Vec<PendingDelivery>> {
        Box::pin(async move {
            self.storage.delivery_tasks.find_retryable(&subject_type, max_attempts).await
        })
    }

    fn exhaust_tasks(
        &self,
        subject_type: SubjectType,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, Vec<DeliveryTask>> {
        Box::pin(async move {
            self.storage.delivery_tasks.exhaust(&subject_type, max_attempts, now).await
        })
    }

    fn record_attempt(&self, attempt: DeliveryAttempt) -> StorageFuture<'_, ()> {
        Box::pin(async move {
            self.storage.delivery_attempts.create(&attempt).await?;
            Ok(())
        })
    }

    fn find_attempts(&self, task_id: TaskId) -> StorageFuture<'_, Vec<DeliveryAttempt>> {
        Box::pin(async move { self.storage.delivery_attempts.find_by_task(task_id).await })
    }

    fn try_acquire_lease(
        &self,
        name: String,
        holder: String,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> StorageFuture<'_, bool> {
        Box::pin(async move {
            self.storage.batch_leases.try_acquire(&name, &holder, now, lease_expiry(now, ttl)).await
        })
    }

    fn release_lease(&self, name: String, holder: String) -> StorageFuture<'_, ()> {
        Box::pin(async move { self.storage.batch_leases.release(&name, &holder).await })
    }
}

pub mod memory {
    //! In-process storage with the same guarantees as the PostgreSQL
    //! adapter.
    //!
    //! Supports injecting a failure into the next message listing to
    //! exercise batch-level error handling.

    use std::{collections::HashMap, sync::Arc, time::Duration};

    use chrono::{DateTime, Utc};
    use hookwire_core::{
        error::{CoreError, Result},
        DeliveryAttempt, DeliveryTask, Listener, ListenerId, Message, MessageId,
        PendingDelivery, SubjectType, TaskId,
    };
    use tokio::sync::RwLock;

    use super::{lease_expiry, DeliveryStorage, StorageFuture};

    #[derive(Debug, Default)]
    struct State {
        messages: HashMap<MessageId, Message>,
        listeners: HashMap<ListenerId, Listener>,
        tasks: HashMap<TaskId, DeliveryTask>,
        attempts: Vec<DeliveryAttempt>,
        leases: HashMap<String, (String, DateTime<Utc>)>,
        listing_error: Option<String>,
    }

    impl State {
        fn pending(&self, task: &DeliveryTask) -> Option<PendingDelivery> {
            let listener = self.listeners.get(&task.listener_id)?;
            let message = self.messages.get(&task.message_id)?;
            Some(PendingDelivery {
                task: task.clone(),
                url: listener.url.clone(),
                payload: message.payload.clone(),
                subject: message.subject.clone(),
            })
        }

        fn open_tasks_of(&self, subject_type: &SubjectType) -> Vec<&DeliveryTask> {
            let mut tasks: Vec<&DeliveryTask> = self
                .tasks
                .values()
                .filter(|task| !task.processed)
                .filter(|task| {
                    self.messages
                        .get(&task.message_id)
                        .is_some_and(|m| &m.subject.subject_type == subject_type)
                })
                .collect();
            tasks.sort_by_key(|task| (task.created_at, task.id));
            tasks
        }
    }

    /// In-memory `DeliveryStorage`.
    #[derive(Debug, Clone, Default)]
    pub struct InMemoryDeliveryStorage {
        state: Arc<RwLock<State>>,
    }

    impl InMemoryDeliveryStorage {
        /// Creates empty storage.
        pub fn new() -> Self {
            Self::default()
        }

        /// Makes the next `unprocessed_messages` call fail with a database
        /// error.
        pub async fn fail_next_listing(&self, message: impl Into<String>) {
            self.state.write().await.listing_error = Some(message.into());
        }

        /// Returns every stored message.
        pub async fn messages(&self) -> Vec<Message> {
            let mut messages: Vec<Message> =
                self.state.read().await.messages.values().cloned().collect();
            messages.sort_by_key(|m| (m.created_at, m.id));
            messages
        }

        /// Returns every stored task.
        pub async fn tasks(&self) -> Vec<DeliveryTask> {
            let mut tasks: Vec<DeliveryTask> =
                self.state.read().await.tasks.values().cloned().collect();
            tasks.sort_by_key(|t| (t.created_at, t.id));
            tasks
        }

        /// Returns the full attempt history.
        pub async fn attempts(&self) -> Vec<DeliveryAttempt> {
            self.state.read().await.attempts.clone()
        }
    }

    impl DeliveryStorage for InMemoryDeliveryStorage {
        fn create_message(&self, message: Message) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                self.state.write().await.messages.insert(message.id, message);
                Ok(())
            })
        }

        fn find_message(&self, id: MessageId) -> StorageFuture<'_, Option<Message>> {
            Box::pin(async move { Ok(self.state.read().await.messages.get(&id).cloned()) })
        }

        fn unprocessed_messages(&self) -> StorageFuture<'_, Vec<Message>> {
            Box::pin(async move {
                if let Some(error) = self.state.write().await.listing_error.take() {
                    return Err(CoreError::Database(error));
                }
                let mut messages: Vec<Message> = self
                    .state
                    .read()
                    .await
                    .messages
                    .values()
                    .filter(|m| !m.processed)
                    .cloned()
                    .collect();
                messages.sort_by_key(|m| (m.created_at, m.id));
                Ok(messages)
            })
        }

        fn delete_message(&self, id: MessageId) -> StorageFuture<'_, bool> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                let deletable = state.messages.get(&id).is_some_and(|m| !m.processed);
                if deletable {
                    state.messages.remove(&id);
                }
                Ok(deletable)
            })
        }

        fn commit_fan_out(
            &self,
            message: Message,
            tasks: Vec<DeliveryTask>,
        ) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                match state.messages.get(&message.id) {
                    Some(stored) if !stored.processed => {},
                    _ => {
                        return Err(CoreError::InvalidInput(format!(
                            "message {} is no longer unprocessed",
                            message.id
                        )))
                    },
                }
                if let Some(task) = tasks.iter().find(|t| !state.listeners.contains_key(&t.listener_id)) {
                    return Err(CoreError::InvalidInput(format!(
                        "foreign key constraint violation: listener {} does not exist",
                        task.listener_id
                    )));
                }

                let mut stored = message;
                stored.processed = true;
                state.messages.insert(stored.id, stored);
                for task in tasks {
                    state.tasks.insert(task.id, task);
                }
                Ok(())
            })
        }

        fn add_listener(&self, listener: Listener) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                self.state.write().await.listeners.insert(listener.id, listener);
                Ok(())
            })
        }

        fn remove_listener(&self, id: ListenerId) -> StorageFuture<'_, bool> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                if state.listeners.remove(&id).is_none() {
                    return Ok(false);
                }
                let removed: Vec<TaskId> = state
                    .tasks
                    .values()
                    .filter(|t| t.listener_id == id)
                    .map(|t| t.id)
                    .collect();
                state.tasks.retain(|_, t| t.listener_id != id);
                state.attempts.retain(|a| !removed.contains(&a.task_id));
                Ok(true)
            })
        }

        fn listeners_for(&self, subject_type: SubjectType) -> StorageFuture<'_, Vec<Listener>> {
            Box::pin(async move {
                let mut listeners: Vec<Listener> = self
                    .state
                    .read()
                    .await
                    .listeners
                    .values()
                    .filter(|l| l.subject_type == subject_type)
                    .cloned()
                    .collect();
                listeners.sort_by_key(|l| (l.created_at, l.id));
                Ok(listeners)
            })
        }

        fn find_task(&self, id: TaskId) -> StorageFuture<'_, Option<DeliveryTask>> {
            Box::pin(async move { Ok(self.state.read().await.tasks.get(&id).cloned()) })
        }

        fn tasks_for_message(
            &self,
            message_id: MessageId,
        ) -> StorageFuture<'_, Vec<DeliveryTask>> {
            Box::pin(async move {
                let mut tasks: Vec<DeliveryTask> = self
                    .state
                    .read()
                    .await
                    .tasks
                    .values()
                    .filter(|t| t.message_id == message_id)
                    .cloned()
                    .collect();
                tasks.sort_by_key(|t| (t.created_at, t.id));
                Ok(tasks)
            })
        }

        fn find_pending_delivery(
            &self,
            id: TaskId,
        ) -> StorageFuture<'_, Option<PendingDelivery>> {
            Box::pin(async move {
                let state = self.state.read().await;
                Ok(state.tasks.get(&id).and_then(|task| state.pending(task)))
            })
        }

        fn save_task(&self, task: DeliveryTask) -> StorageFuture<'_, bool> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                match state.tasks.get_mut(&task.id) {
                    Some(stored) if !stored.processed && stored.attempts <= task.attempts => {
                        stored.processed = task.processed;
                        stored.attempts = task.attempts;
                        stored.failed_at = task.failed_at;
                        stored.updated_at = task.updated_at;
                        Ok(true)
                    },
                    _ => Ok(false),
                }
            })
        }

        fn retryable_tasks(
            &self,
            subject_type: SubjectType,
            max_attempts: u32,
        ) -> StorageFuture<'_, Vec<PendingDelivery>> {
            Box::pin(async move {
                let state = self.state.read().await;
                Ok(state
                    .open_tasks_of(&subject_type)
                    .into_iter()
                    .filter(|task| task.is_retryable(max_attempts))
                    .filter_map(|task| state.pending(task))
                    .collect())
            })
        }

        fn exhaust_tasks(
            &self,
            subject_type: SubjectType,
            max_attempts: u32,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, Vec<DeliveryTask>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                let ids: Vec<TaskId> = state
                    .open_tasks_of(&subject_type)
                    .into_iter()
                    .filter(|task| task.is_exhausted(max_attempts))
                    .map(|task| task.id)
                    .collect();

                let mut exhausted = Vec::with_capacity(ids.len());
                for id in ids {
                    if let Some(task) = state.tasks.get_mut(&id) {
                        task.processed = true;
                        task.updated_at = now;
                        exhausted.push(task.clone());
                    }
                }
                Ok(exhausted)
            })
        }

        fn record_attempt(&self, attempt: DeliveryAttempt) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                if !state.tasks.contains_key(&attempt.task_id) {
                    return Err(CoreError::InvalidInput(format!(
                        "foreign key constraint violation: task {} does not exist",
                        attempt.task_id
                    )));
                }
                state.attempts.push(attempt);
                Ok(())
            })
        }

        fn find_attempts(&self, task_id: TaskId) -> StorageFuture<'_, Vec<DeliveryAttempt>> {
            Box::pin(async move {
                let mut attempts: Vec<DeliveryAttempt> = self
                    .state
                    .read()
                    .await
                    .attempts
                    .iter()
                    .filter(|a| a.task_id == task_id)
                    .cloned()
                    .collect();
                attempts.sort_by_key(|a| a.attempt_number);
                Ok(attempts)
            })
        }

        fn try_acquire_lease(
            &self,
            name: String,
            holder: String,
            now: DateTime<Utc>,
            ttl: Duration,
        ) -> StorageFuture<'_, bool> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                let held = state.leases.get(&name).is_some_and(|(_, expires_at)| *expires_at > now);
                if held {
                    return Ok(false);
                }
                state.leases.insert(name, (holder, lease_expiry(now, ttl)));
                Ok(true)
            })
        }

        fn release_lease(&self, name: String, holder: String) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                if state.leases.get(&name).is_some_and(|(owner, _)| *owner == holder) {
                    state.leases.remove(&name);
                }
                Ok(())
            })
        }
    }

    #[cfg(test)]
    mod tests {
        use chrono::Utc;
        use hookwire_core::SubjectRef;

        use super::*;

        fn owner() -> SubjectRef {
            SubjectRef::new("user", "1")
        }

        async fn fanned_out(storage: &InMemoryDeliveryStorage) -> (Message, Listener, DeliveryTask) {
            let now = Utc::now();
            let listener = Listener::new("article", "http://example.com/hook", owner());
            storage.add_listener(listener.clone()).await.unwrap();

            let message = Message::new(SubjectRef::new("article", "1"), now);
            storage.create_message(message.clone()).await.unwrap();

            let task = DeliveryTask::new(message.id, listener.id, now);
            storage.commit_fan_out(message.clone(), vec![task.clone()]).await.unwrap();
            (message, listener, task)
        }

        #[tokio::test]
        async fn fan_out_is_rejected_for_processed_messages() {
            let storage = InMemoryDeliveryStorage::new();
            let (message, listener, _) = fanned_out(&storage).await;

            let again = DeliveryTask::new(message.id, listener.id, Utc::now());
            assert!(storage.commit_fan_out(message.clone(), vec![again]).await.is_err());
            assert_eq!(storage.tasks().await.len(), 1);
            assert!(!storage.delete_message(message.id).await.unwrap());
        }

        #[tokio::test]
        async fn save_task_never_reopens_or_lowers_attempts() {
            let storage = InMemoryDeliveryStorage::new();
            let (_, _, mut task) = fanned_out(&storage).await;

            task.attempts = 2;
            assert!(storage.save_task(task.clone()).await.unwrap());

            let mut stale = task.clone();
            stale.attempts = 1;
            assert!(!storage.save_task(stale).await.unwrap());

            task.processed = true;
            assert!(storage.save_task(task.clone()).await.unwrap());
            task.processed = false;
            task.attempts = 3;
            assert!(!storage.save_task(task.clone()).await.unwrap());

            let stored = storage.find_task(task.id).await.unwrap().unwrap();
            assert!(stored.processed);
            assert_eq!(stored.attempts, 2);
        }

        #[tokio::test]
        async fn removing_a_listener_cascades_to_tasks() {
            let storage = InMemoryDeliveryStorage::new();
            let (_, listener, task) = fanned_out(&storage).await;

            assert!(storage.remove_listener(listener.id).await.unwrap());
            assert!(storage.find_task(task.id).await.unwrap().is_none());
            assert!(!storage.remove_listener(listener.id).await.unwrap());
        }

        #[tokio::test]
        async fn leases_expire() {
            let storage = InMemoryDeliveryStorage::new();
            let now = Utc::now();
            let ttl = Duration::from_secs(60);

            assert!(storage.try_acquire_lease("batch".into(), "a".into(), now, ttl).await.unwrap());
            assert!(!storage.try_acquire_lease("batch".into(), "b".into(), now, ttl).await.unwrap());

            let later = now + chrono::Duration::seconds(61);
            assert!(storage.try_acquire_lease("batch".into(), "b".into(), later, ttl).await.unwrap());

            // "a" no longer owns the lease, so its release is a no-op.
            storage.release_lease("batch".into(), "a".into()).await.unwrap();
            assert!(!storage.try_acquire_lease("batch".into(), "c".into(), later, ttl).await.unwrap());
        }

        #[tokio::test]
        async fn injected_listing_failure_fires_once() {
            let storage = InMemoryDeliveryStorage::new();
            storage.fail_next_listing("connection reset").await;

            assert!(matches!(
                storage.unprocessed_messages().await,
                Err(CoreError::Database(_))
            ));
            assert!(storage.unprocessed_messages().await.unwrap().is_empty());
        }
    }
}
