//! Subscription registry
//!
//! Maps each topic to its handler and the consumer task currently serving
//! it. Entries outlive connections: after a reconnect the same entries are
//! re-established against the new session. The lock is a plain std mutex and
//! is never held across an await.

use super::MessageHandler;
use crate::error::{BrokerError, BrokerResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Cancellation capability for a running consumer task
#[derive(Debug)]
pub struct ConsumerHandle {
    cancel_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    pub fn new(cancel_tx: watch::Sender<bool>, task: JoinHandle<()>) -> Self {
        Self { cancel_tx, task }
    }

    /// Signal the consumer loop to stop; the task finishes on its own
    pub fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

struct Entry {
    handler: Arc<dyn MessageHandler>,
    generation: u64,
    consumer: Option<ConsumerHandle>,
}

/// Topic to subscription map with at most one entry per topic
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: Mutex<HashMap<String, Entry>>,
    next_generation: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `topic` for `handler`, returning the new subscription's generation
    pub fn reserve(&self, topic: &str, handler: Arc<dyn MessageHandler>) -> BrokerResult<u64> {
        let mut entries = self.lock();
        if entries.contains_key(topic) {
            return Err(BrokerError::AlreadySubscribed {
                topic: topic.to_string(),
            });
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        entries.insert(
            topic.to_string(),
            Entry {
                handler,
                generation,
                consumer: None,
            },
        );
        Ok(generation)
    }

    /// Attach a running consumer to the entry, replacing any previous one
    ///
    /// Returns false and cancels `consumer` when the entry was removed or
    /// replaced in the meantime.
    pub fn activate(&self, topic: &str, generation: u64, consumer: ConsumerHandle) -> bool {
        let mut entries = self.lock();
        match entries.get_mut(topic) {
            Some(entry) if entry.generation == generation => {
                if let Some(previous) = entry.consumer.replace(consumer) {
                    previous.cancel();
                }
                true
            }
            _ => {
                consumer.cancel();
                false
            }
        }
    }

    /// Drop a reservation whose consumer could not be started
    pub fn release(&self, topic: &str, generation: u64) {
        let mut entries = self.lock();
        if entries
            .get(topic)
            .is_some_and(|entry| entry.generation == generation)
        {
            if let Some(entry) = entries.remove(topic) {
                if let Some(consumer) = entry.consumer {
                    consumer.cancel();
                }
            }
        }
    }

    /// Remove the subscription for `topic` and cancel its consumer
    pub fn remove(&self, topic: &str) -> BrokerResult<()> {
        let entry = self
            .lock()
            .remove(topic)
            .ok_or_else(|| BrokerError::NotSubscribed {
                topic: topic.to_string(),
            })?;
        if let Some(consumer) = entry.consumer {
            consumer.cancel();
        }
        Ok(())
    }

    /// Handler for a delivery, only if the subscription generation still matches
    pub fn handler_for(&self, topic: &str, generation: u64) -> Option<Arc<dyn MessageHandler>> {
        self.lock()
            .get(topic)
            .filter(|entry| entry.generation == generation)
            .map(|entry| Arc::clone(&entry.handler))
    }

    /// Every (topic, generation) pair, for re-establishing after a reconnect
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        let mut pairs: Vec<(String, u64)> = self
            .lock()
            .iter()
            .map(|(topic, entry)| (topic.clone(), entry.generation))
            .collect();
        pairs.sort();
        pairs
    }

    /// Remove every entry and cancel all consumers
    pub fn clear(&self) -> usize {
        let drained: Vec<Entry> = self.lock().drain().map(|(_, entry)| entry).collect();
        let count = drained.len();
        for entry in drained {
            if let Some(consumer) = entry.consumer {
                consumer.cancel();
            }
        }
        count
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.lock().keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.lock().contains_key(topic)
    }

    /// Entries with a consumer attached whose task is still running
    pub fn active_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|entry| entry.consumer.as_ref().is_some_and(|c| !c.is_finished()))
            .count()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{handler_fn, DeliveryContext};
    use crate::error::HandlerError;

    fn noop_handler() -> Arc<dyn MessageHandler> {
        handler_fn(|_ctx: DeliveryContext, _body: Vec<u8>| async { Ok::<(), HandlerError>(()) })
    }

    fn idle_consumer() -> (ConsumerHandle, watch::Receiver<bool>) {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut task_rx = cancel_rx.clone();
        let task = tokio::spawn(async move {
            let _ = task_rx.wait_for(|cancelled| *cancelled).await;
        });
        (ConsumerHandle::new(cancel_tx, task), cancel_rx)
    }

    #[tokio::test]
    async fn test_reserve_rejects_second_subscription() {
        let registry = SubscriptionRegistry::new();

        registry.reserve("user.created", noop_handler()).unwrap();
        let second = registry.reserve("user.created", noop_handler());

        assert!(matches!(
            second,
            Err(BrokerError::AlreadySubscribed { topic }) if topic == "user.created"
        ));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_cancels_consumer() {
        let registry = SubscriptionRegistry::new();
        let generation = registry.reserve("user.deleted", noop_handler()).unwrap();
        let (consumer, cancel_rx) = idle_consumer();
        assert!(registry.activate("user.deleted", generation, consumer));

        registry.remove("user.deleted").unwrap();

        assert!(*cancel_rx.borrow());
        assert!(registry.is_empty());
        assert!(matches!(
            registry.remove("user.deleted"),
            Err(BrokerError::NotSubscribed { .. })
        ));
    }

    #[tokio::test]
    async fn test_activate_after_remove_cancels_new_consumer() {
        let registry = SubscriptionRegistry::new();
        let generation = registry.reserve("user.updated", noop_handler()).unwrap();
        registry.remove("user.updated").unwrap();

        let (consumer, cancel_rx) = idle_consumer();
        assert!(!registry.activate("user.updated", generation, consumer));
        assert!(*cancel_rx.borrow());
    }

    #[tokio::test]
    async fn test_activate_replaces_previous_consumer() {
        let registry = SubscriptionRegistry::new();
        let generation = registry.reserve("user.created", noop_handler()).unwrap();
        let (first, first_rx) = idle_consumer();
        let (second, second_rx) = idle_consumer();

        assert!(registry.activate("user.created", generation, first));
        assert!(registry.activate("user.created", generation, second));

        assert!(*first_rx.borrow());
        assert!(!*second_rx.borrow());
    }

    #[tokio::test]
    async fn test_handler_lookup_checks_generation() {
        let registry = SubscriptionRegistry::new();
        let old = registry.reserve("user.created", noop_handler()).unwrap();
        registry.remove("user.created").unwrap();
        let new = registry.reserve("user.created", noop_handler()).unwrap();

        assert_ne!(old, new);
        assert!(registry.handler_for("user.created", old).is_none());
        assert!(registry.handler_for("user.created", new).is_some());
    }

    #[tokio::test]
    async fn test_release_only_matching_generation() {
        let registry = SubscriptionRegistry::new();
        let generation = registry.reserve("user.created", noop_handler()).unwrap();

        registry.release("user.created", generation + 100);
        assert!(registry.contains("user.created"));

        registry.release("user.created", generation);
        assert!(!registry.contains("user.created"));
    }

    #[tokio::test]
    async fn test_snapshot_and_clear() {
        let registry = SubscriptionRegistry::new();
        let created = registry.reserve("user.created", noop_handler()).unwrap();
        let deleted = registry.reserve("user.deleted", noop_handler()).unwrap();
        let (consumer, cancel_rx) = idle_consumer();
        registry.activate("user.created", created, consumer);

        assert_eq!(
            registry.snapshot(),
            vec![
                ("user.created".to_string(), created),
                ("user.deleted".to_string(), deleted)
            ]
        );

        assert_eq!(registry.clear(), 2);
        assert!(*cancel_rx.borrow());
        assert!(registry.topics().is_empty());
    }
}
