//! Consumes user domain events
//!
//! [`UserEventConsumer`] subscribes to the four user topics and hands each
//! decoded event to a [`UserEventListener`]. Payloads that do not decode are
//! logged and acknowledged, since redelivering them cannot succeed. Listener
//! failures are returned to the broker so the message is redelivered.

use crate::broker::{DeliveryContext, MessageBroker, MessageHandler};
use crate::domain::{
    event_types, DomainEvent, UserCreatedEvent, UserDeletedEvent, UserLoggedInEvent,
    UserUpdatedEvent,
};
use crate::error::{BrokerResult, HandlerError};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Topics the consumer subscribes to, in subscription order
pub const USER_TOPICS: [&str; 4] = [
    event_types::USER_CREATED,
    event_types::USER_UPDATED,
    event_types::USER_DELETED,
    event_types::USER_LOGGED_IN,
];

/// A decoded user event
#[derive(Debug, Clone, PartialEq)]
pub enum UserEvent {
    Created(UserCreatedEvent),
    Updated(UserUpdatedEvent),
    Deleted(UserDeletedEvent),
    LoggedIn(UserLoggedInEvent),
}

/// Failure to turn a delivery into a [`UserEvent`]
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Unknown user event topic: {0}")]
    UnknownTopic(String),
    #[error("Malformed {topic} payload: {source}")]
    Malformed {
        topic: String,
        #[source]
        source: serde_json::Error,
    },
}

impl UserEvent {
    /// Decode a payload according to the topic it arrived on
    pub fn decode(topic: &str, body: &[u8]) -> Result<Self, DecodeError> {
        let malformed = |source| DecodeError::Malformed {
            topic: topic.to_string(),
            source,
        };
        match topic {
            event_types::USER_CREATED => serde_json::from_slice(body)
                .map(UserEvent::Created)
                .map_err(malformed),
            event_types::USER_UPDATED => serde_json::from_slice(body)
                .map(UserEvent::Updated)
                .map_err(malformed),
            event_types::USER_DELETED => serde_json::from_slice(body)
                .map(UserEvent::Deleted)
                .map_err(malformed),
            event_types::USER_LOGGED_IN => serde_json::from_slice(body)
                .map(UserEvent::LoggedIn)
                .map_err(malformed),
            other => Err(DecodeError::UnknownTopic(other.to_string())),
        }
    }

    pub fn as_domain_event(&self) -> &dyn DomainEvent {
        match self {
            UserEvent::Created(event) => event,
            UserEvent::Updated(event) => event,
            UserEvent::Deleted(event) => event,
            UserEvent::LoggedIn(event) => event,
        }
    }
}

/// Reacts to user events
#[async_trait]
pub trait UserEventListener: Send + Sync {
    async fn on_event(&self, event: UserEvent) -> Result<(), HandlerError>;
}

/// Listener that records every event in the log
#[derive(Debug, Default, Clone)]
pub struct LoggingListener;

#[async_trait]
impl UserEventListener for LoggingListener {
    async fn on_event(&self, event: UserEvent) -> Result<(), HandlerError> {
        match &event {
            UserEvent::Created(e) => info!(
                user_id = %e.aggregate_id(),
                email = %e.email(),
                name = %e.name(),
                occurred_at = %e.occurred_at(),
                "User created"
            ),
            UserEvent::Updated(e) => info!(
                user_id = %e.aggregate_id(),
                name = %e.name(),
                occurred_at = %e.occurred_at(),
                "User updated"
            ),
            UserEvent::Deleted(e) => info!(
                user_id = %e.aggregate_id(),
                occurred_at = %e.occurred_at(),
                "User deleted"
            ),
            UserEvent::LoggedIn(e) => info!(
                user_id = %e.aggregate_id(),
                email = %e.email(),
                occurred_at = %e.occurred_at(),
                "User logged in"
            ),
        }
        Ok(())
    }
}

struct UserEventHandler {
    listener: Arc<dyn UserEventListener>,
}

#[async_trait]
impl MessageHandler for UserEventHandler {
    async fn handle(&self, context: &DeliveryContext, body: &[u8]) -> Result<(), HandlerError> {
        let event = match UserEvent::decode(&context.topic, body) {
            Ok(event) => event,
            Err(e) => {
                error!(
                    topic = %context.topic,
                    delivery_tag = context.delivery_tag,
                    error = %e,
                    "Dropping undecodable user event"
                );
                return Ok(());
            }
        };
        self.listener.on_event(event).await
    }
}

/// Subscribes a listener to every user topic
pub struct UserEventConsumer {
    broker: Option<Arc<dyn MessageBroker>>,
    listener: Arc<dyn UserEventListener>,
}

impl UserEventConsumer {
    /// Consumer that logs every event
    pub fn new(broker: Option<Arc<dyn MessageBroker>>) -> Self {
        Self::with_listener(broker, Arc::new(LoggingListener))
    }

    pub fn with_listener(
        broker: Option<Arc<dyn MessageBroker>>,
        listener: Arc<dyn UserEventListener>,
    ) -> Self {
        Self { broker, listener }
    }

    /// Subscribe to every user topic, stopping at the first failure
    pub async fn start(&self) -> BrokerResult<()> {
        let Some(broker) = &self.broker else {
            return Ok(());
        };

        let handler: Arc<dyn MessageHandler> = Arc::new(UserEventHandler {
            listener: Arc::clone(&self.listener),
        });
        for topic in USER_TOPICS {
            broker.subscribe(topic, Arc::clone(&handler)).await?;
        }
        info!(topics = ?USER_TOPICS, "User event consumer started");
        Ok(())
    }

    /// Unsubscribe from every user topic; failures are logged, not returned
    pub async fn stop(&self) {
        let Some(broker) = &self.broker else {
            return;
        };

        for topic in USER_TOPICS {
            if let Err(e) = broker.unsubscribe(topic).await {
                warn!(topic = %topic, error = %e, "Failed to unsubscribe");
            }
        }
        info!("User event consumer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BrokerError;
    use crate::testing::MockBroker;
    use uuid::Uuid;

    #[test]
    fn test_decode_by_topic() {
        let event = UserLoggedInEvent::new(Uuid::new_v4(), "a@b.com");
        let body = event.encode().unwrap();

        let decoded = UserEvent::decode("user.logged_in", &body).unwrap();

        assert_eq!(decoded, UserEvent::LoggedIn(event.clone()));
        assert_eq!(decoded.as_domain_event().event_id(), event.event_id());
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(
            UserEvent::decode("order.created", b"{}"),
            Err(DecodeError::UnknownTopic(_))
        ));
        assert!(matches!(
            UserEvent::decode("user.created", b"not json"),
            Err(DecodeError::Malformed { .. })
        ));
    }

    #[tokio::test]
    async fn test_start_subscribes_all_topics() {
        let broker = Arc::new(MockBroker::new());
        let consumer = UserEventConsumer::new(Some(broker.clone()));

        consumer.start().await.unwrap();

        assert_eq!(
            broker.subscribed_topics(),
            vec!["user.created", "user.deleted", "user.logged_in", "user.updated"]
        );
    }

    #[tokio::test]
    async fn test_start_fails_fast() {
        let broker = Arc::new(MockBroker::with_failure());
        let consumer = UserEventConsumer::new(Some(broker.clone()));

        let result = consumer.start().await;

        assert!(matches!(result, Err(BrokerError::NotConnected { .. })));
        assert!(broker.subscribed_topics().is_empty());
    }

    #[tokio::test]
    async fn test_stop_tolerates_missing_subscriptions() {
        let broker = Arc::new(MockBroker::new());
        let consumer = UserEventConsumer::new(Some(broker.clone()));
        consumer.start().await.unwrap();
        broker.unsubscribe("user.updated").await.unwrap();

        consumer.stop().await;

        assert!(broker.subscribed_topics().is_empty());
    }

    #[tokio::test]
    async fn test_without_broker_is_noop() {
        let consumer = UserEventConsumer::new(None);
        assert!(consumer.start().await.is_ok());
        consumer.stop().await;
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_acknowledged() {
        let handler = UserEventHandler {
            listener: Arc::new(LoggingListener),
        };
        let context = DeliveryContext {
            topic: "user.created".to_string(),
            delivery_tag: 1,
            redelivered: false,
        };

        assert!(handler.handle(&context, b"garbage").await.is_ok());
    }
}
