//! Mock implementations for testing
//!
//! [`MockBroker`] implements the broker port without any transport, for
//! testing code that only publishes or subscribes. [`RecordingHandler`]
//! records deliveries and can be told to fail.

use crate::broker::{ConnectionState, DeliveryContext, MessageBroker, MessageHandler};
use crate::domain::DomainEvent;
use crate::error::{BrokerError, BrokerResult, HandlerError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

pub type PublishedMessage = (String, Vec<u8>);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Broker port double that records calls
#[derive(Default)]
pub struct MockBroker {
    published: Mutex<Vec<PublishedMessage>>,
    handlers: Mutex<HashMap<String, Arc<dyn MessageHandler>>>,
    should_fail: bool,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Broker whose every operation fails as if disconnected
    pub fn with_failure() -> Self {
        Self {
            should_fail: true,
            ..Default::default()
        }
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.published).clone()
    }

    pub fn subscribed_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = lock(&self.handlers).keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Run the handler subscribed to `topic` as if the broker delivered `body`
    pub async fn deliver(&self, topic: &str, body: &[u8]) -> Option<Result<(), HandlerError>> {
        let handler = lock(&self.handlers).get(topic).cloned()?;
        let context = DeliveryContext {
            topic: topic.to_string(),
            delivery_tag: 1,
            redelivered: false,
        };
        Some(handler.handle(&context, body).await)
    }

    fn check(&self) -> BrokerResult<()> {
        if self.should_fail {
            Err(BrokerError::NotConnected {
                state: ConnectionState::Disconnected("mock failure".to_string()),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MessageBroker for MockBroker {
    async fn connect(&self) -> BrokerResult<()> {
        self.check()
    }

    async fn close(&self) -> BrokerResult<()> {
        lock(&self.handlers).clear();
        Ok(())
    }

    fn health(&self) -> BrokerResult<()> {
        self.check()
    }

    fn state(&self) -> ConnectionState {
        if self.should_fail {
            ConnectionState::Disconnected("mock failure".to_string())
        } else {
            ConnectionState::Connected
        }
    }

    async fn publish(&self, topic: &str, event: &dyn DomainEvent) -> BrokerResult<()> {
        self.check()?;
        let body = event.encode().map_err(BrokerError::Serialization)?;
        lock(&self.published).push((topic.to_string(), body));
        Ok(())
    }

    async fn publish_batch(&self, topic: &str, events: &[&dyn DomainEvent]) -> BrokerResult<()> {
        for event in events {
            self.publish(topic, *event).await?;
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: Arc<dyn MessageHandler>) -> BrokerResult<()> {
        self.check()?;
        let mut handlers = lock(&self.handlers);
        if handlers.contains_key(topic) {
            return Err(BrokerError::AlreadySubscribed {
                topic: topic.to_string(),
            });
        }
        handlers.insert(topic.to_string(), handler);
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> BrokerResult<()> {
        lock(&self.handlers)
            .remove(topic)
            .map(|_| ())
            .ok_or_else(|| BrokerError::NotSubscribed {
                topic: topic.to_string(),
            })
    }
}

/// Handler that records every delivery it sees
#[derive(Default)]
pub struct RecordingHandler {
    deliveries: Mutex<Vec<(DeliveryContext, Vec<u8>)>>,
    failures_remaining: AtomicU32,
    notify: Notify,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Handler that fails its first `count` deliveries
    pub fn failing_first(count: u32) -> Arc<Self> {
        let handler = Self::default();
        handler.failures_remaining.store(count, Ordering::SeqCst);
        Arc::new(handler)
    }

    pub fn deliveries(&self) -> Vec<(DeliveryContext, Vec<u8>)> {
        lock(&self.deliveries).clone()
    }

    pub fn count(&self) -> usize {
        lock(&self.deliveries).len()
    }

    /// Wait until at least `count` deliveries were seen, or the timeout passes
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                if self.count() >= count {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, context: &DeliveryContext, body: &[u8]) -> Result<(), HandlerError> {
        lock(&self.deliveries).push((context.clone(), body.to_vec()));
        self.notify.notify_waiters();

        let fail = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err("handler failure requested by test".into());
        }
        Ok(())
    }
}
