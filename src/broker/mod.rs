//! Message broker client
//!
//! [`MessageBroker`] is the port the rest of the service depends on.
//! [`BrokerClient`] implements it on top of a durable AMQP connection that
//! reconnects on its own and re-establishes every subscription afterwards.
//!
//! # Example
//!
//! ```rust
//! # tokio_test::block_on(async {
//! use std::sync::Arc;
//! use user_events::broker::{BrokerClient, BrokerSettings, MessageBroker};
//! use user_events::config::RabbitMqSection;
//! use user_events::domain::UserDeletedEvent;
//! use user_events::observability::BrokerMetrics;
//! use user_events::testing::MemoryBroker;
//!
//! let memory = MemoryBroker::new();
//! let settings = BrokerSettings::with_url(&RabbitMqSection::default(), "amqp://localhost".into());
//! let client = BrokerClient::new(settings, Arc::new(memory.clone()), Arc::new(BrokerMetrics::new()));
//!
//! client.connect().await?;
//! let event = UserDeletedEvent::new(uuid::Uuid::new_v4());
//! client.publish("user.deleted", &event).await?;
//! assert_eq!(memory.published_to("user.deleted").len(), 1);
//! client.close().await?;
//! # Ok::<(), user_events::BrokerError>(())
//! # }).unwrap();
//! ```

use crate::domain::DomainEvent;
use crate::error::{BrokerResult, HandlerError};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

pub mod amqp;
pub mod client;
pub mod connection;
pub mod consumer;
pub mod factory;
pub mod publisher;
pub mod registry;
pub mod supervisor;
pub mod transport;

pub use client::{BrokerClient, BrokerSettings};
pub use connection::ConnectionState;
pub use factory::new_message_broker;
pub use supervisor::ReconnectPolicy;

/// Metadata about a delivery passed to handlers alongside the body
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryContext {
    pub topic: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
}

/// Processes messages delivered on a subscribed topic
///
/// Returning `Ok` acknowledges the delivery. Returning `Err` negatively
/// acknowledges it with requeue, so the broker delivers it again.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, context: &DeliveryContext, body: &[u8]) -> Result<(), HandlerError>;
}

/// Adapter turning an async closure into a [`MessageHandler`]
pub struct FnHandler<F> {
    handler: F,
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(DeliveryContext, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, context: &DeliveryContext, body: &[u8]) -> Result<(), HandlerError> {
        (self.handler)(context.clone(), body.to_vec()).await
    }
}

/// Wrap an async closure as a shareable handler
pub fn handler_fn<F, Fut>(handler: F) -> Arc<dyn MessageHandler>
where
    F: Fn(DeliveryContext, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler { handler })
}

/// Broker port used by publishers and consumers
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Connect to the broker; a no-op when already connected
    async fn connect(&self) -> BrokerResult<()>;

    /// Close the client; terminal and idempotent
    async fn close(&self) -> BrokerResult<()>;

    /// Fails when the broker connection is not usable
    fn health(&self) -> BrokerResult<()>;

    fn state(&self) -> ConnectionState;

    async fn publish(&self, topic: &str, event: &dyn DomainEvent) -> BrokerResult<()>;

    /// Publish sequentially, stopping at the first failure
    async fn publish_batch(&self, topic: &str, events: &[&dyn DomainEvent]) -> BrokerResult<()>;

    async fn subscribe(&self, topic: &str, handler: Arc<dyn MessageHandler>) -> BrokerResult<()>;

    async fn unsubscribe(&self, topic: &str) -> BrokerResult<()>;
}
