//! Publishes user domain events to their topics
//!
//! Messaging is optional infrastructure for the user service: a failed
//! publish is logged and the caller carries on.

use crate::broker::MessageBroker;
use crate::domain::{
    event_types, DomainEvent, UserCreatedEvent, UserDeletedEvent, UserLoggedInEvent,
    UserUpdatedEvent,
};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// User event publisher
///
/// Without a broker every publish is a successful no-op, so the service runs
/// unchanged when messaging is disabled.
#[derive(Clone, Default)]
pub struct UserEventPublisher {
    broker: Option<Arc<dyn MessageBroker>>,
}

impl UserEventPublisher {
    pub fn new(broker: Option<Arc<dyn MessageBroker>>) -> Self {
        Self { broker }
    }

    /// Publisher that discards every event
    pub fn disabled() -> Self {
        Self { broker: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.broker.is_some()
    }

    pub async fn publish_user_created(&self, event: &UserCreatedEvent) {
        self.publish(event_types::USER_CREATED, event).await
    }

    pub async fn publish_user_updated(&self, event: &UserUpdatedEvent) {
        self.publish(event_types::USER_UPDATED, event).await
    }

    pub async fn publish_user_deleted(&self, event: &UserDeletedEvent) {
        self.publish(event_types::USER_DELETED, event).await
    }

    pub async fn publish_user_logged_in(&self, event: &UserLoggedInEvent) {
        self.publish(event_types::USER_LOGGED_IN, event).await
    }

    async fn publish(&self, topic: &str, event: &dyn DomainEvent) {
        let Some(broker) = &self.broker else {
            debug!(topic = %topic, "Broker disabled, event not published");
            return;
        };

        match broker.publish(topic, event).await {
            Ok(()) => {}
            Err(e) if e.is_connectivity() => warn!(
                topic = %topic,
                event_id = %event.event_id(),
                error = %e,
                "Broker unavailable, user event dropped"
            ),
            Err(e) => error!(
                topic = %topic,
                event_id = %event.event_id(),
                error = %e,
                "Failed to publish user event"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockBroker;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_disabled_publisher_is_noop() {
        let publisher = UserEventPublisher::disabled();
        let event = UserDeletedEvent::new(Uuid::new_v4());

        assert!(!publisher.is_enabled());
        publisher.publish_user_deleted(&event).await;
    }

    #[tokio::test]
    async fn test_events_go_to_their_topics() {
        // Arrange
        let broker = Arc::new(MockBroker::new());
        let publisher = UserEventPublisher::new(Some(broker.clone()));
        let user_id = Uuid::new_v4();

        // Act
        publisher
            .publish_user_created(&UserCreatedEvent::new(user_id, "a@b.com", "Alice"))
            .await;
        publisher
            .publish_user_updated(&UserUpdatedEvent::new(user_id, "Alicia"))
            .await;
        publisher
            .publish_user_deleted(&UserDeletedEvent::new(user_id))
            .await;
        publisher
            .publish_user_logged_in(&UserLoggedInEvent::new(user_id, "a@b.com"))
            .await;

        // Assert
        let topics: Vec<String> = broker
            .published()
            .into_iter()
            .map(|(topic, _)| topic)
            .collect();
        assert_eq!(
            topics,
            vec!["user.created", "user.updated", "user.deleted", "user.logged_in"]
        );
    }

    #[tokio::test]
    async fn test_publish_failure_is_swallowed() {
        let broker = Arc::new(MockBroker::with_failure());
        let publisher = UserEventPublisher::new(Some(broker.clone()));

        publisher
            .publish_user_deleted(&UserDeletedEvent::new(Uuid::new_v4()))
            .await;

        assert!(broker.published().is_empty());
    }
}
