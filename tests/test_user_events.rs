//! User event publisher and consumer wired through the broker client


use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use test_helpers::{connected_client, queue, wait_until, EXCHANGE};
use user_events::broker::MessageBroker;
use user_events::domain::{UserCreatedEvent, UserDeletedEvent, UserLoggedInEvent, UserUpdatedEvent};
use user_events::error::HandlerError;
use user_events::events::{UserEvent, UserEventConsumer, UserEventListener, UserEventPublisher};
use user_events::testing::MemoryBroker;
use uuid::Uuid;

const TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Default)]
struct CollectingListener {
    events: Mutex<Vec<UserEvent>>,
    fail_once: Mutex<bool>,
}

impl CollectingListener {
    fn events(&self) -> Vec<UserEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl UserEventListener for CollectingListener {
    async fn on_event(&self, event: UserEvent) -> Result<(), HandlerError> {
        let mut fail_once = self.fail_once.lock().unwrap();
        if *fail_once {
            *fail_once = false;
            return Err("listener temporarily unavailable".into());
        }
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

#[tokio::test]
async fn test_published_user_events_reach_listener() {
    // Arrange
    let broker = MemoryBroker::new();
    let client: Arc<dyn MessageBroker> = Arc::new(connected_client(&broker).await);
    let listener = Arc::new(CollectingListener::default());
    let consumer = UserEventConsumer::with_listener(Some(client.clone()), listener.clone());
    consumer.start().await.unwrap();
    let publisher = UserEventPublisher::new(Some(client.clone()));
    let user_id = Uuid::new_v4();

    let created = UserCreatedEvent::new(user_id, "ada@example.com", "Ada");
    let updated = UserUpdatedEvent::new(user_id, "Ada Lovelace");
    let logged_in = UserLoggedInEvent::new(user_id, "ada@example.com");
    let deleted = UserDeletedEvent::new(user_id);

    // Act
    publisher.publish_user_created(&created).await;
    publisher.publish_user_updated(&updated).await;
    publisher.publish_user_logged_in(&logged_in).await;
    publisher.publish_user_deleted(&deleted).await;

    // Assert
    assert!(wait_until(TIMEOUT, || listener.events().len() == 4).await);
    let events = listener.events();
    assert!(events.contains(&UserEvent::Created(created)));
    assert!(events.contains(&UserEvent::Updated(updated)));
    assert!(events.contains(&UserEvent::LoggedIn(logged_in)));
    assert!(events.contains(&UserEvent::Deleted(deleted)));

    consumer.stop().await;
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_undecodable_event_is_acked_and_dropped() {
    let broker = MemoryBroker::new();
    let client: Arc<dyn MessageBroker> = Arc::new(connected_client(&broker).await);
    let listener = Arc::new(CollectingListener::default());
    let consumer = UserEventConsumer::with_listener(Some(client.clone()), listener.clone());
    consumer.start().await.unwrap();

    broker.inject(EXCHANGE, "user.created", b"not json");

    assert!(
        wait_until(TIMEOUT, || {
            broker.queue_depth(&queue("user.created")) == 0
                && broker.unacked_count(&queue("user.created")) == 0
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(listener.events().is_empty());
}

#[tokio::test]
async fn test_listener_failure_is_redelivered() {
    let broker = MemoryBroker::new();
    let client: Arc<dyn MessageBroker> = Arc::new(connected_client(&broker).await);
    let listener = Arc::new(CollectingListener {
        fail_once: Mutex::new(true),
        ..Default::default()
    });
    let consumer = UserEventConsumer::with_listener(Some(client.clone()), listener.clone());
    consumer.start().await.unwrap();
    let event = UserDeletedEvent::new(Uuid::new_v4());

    UserEventPublisher::new(Some(client.clone()))
        .publish_user_deleted(&event)
        .await;

    assert!(wait_until(TIMEOUT, || listener.events().len() == 1).await);
    assert_eq!(listener.events(), vec![UserEvent::Deleted(event)]);
}

#[tokio::test]
async fn test_publish_failure_does_not_reach_caller() {
    let broker = MemoryBroker::new();
    let client = connected_client(&broker).await;
    let publisher = UserEventPublisher::new(Some(Arc::new(client.clone())));
    broker.fail_publishes_after(0);

    publisher
        .publish_user_created(&UserCreatedEvent::new(Uuid::new_v4(), "a@b.com", "A"))
        .await;

    assert!(broker.published().is_empty());
    assert_eq!(client.metrics().snapshot().publish_failures, 1);
}

#[tokio::test]
async fn test_stop_removes_every_user_subscription() {
    let broker = MemoryBroker::new();
    let client = connected_client(&broker).await;
    let consumer = UserEventConsumer::new(Some(Arc::new(client.clone())));
    consumer.start().await.unwrap();
    assert_eq!(client.subscribed_topics().len(), 4);

    consumer.stop().await;

    assert!(client.subscribed_topics().is_empty());
    assert!(
        wait_until(TIMEOUT, || broker.consumer_count(&queue("user.logged_in")) == 0).await
    );
}
