//! User Events - durable AMQP event broker client
//!
//! Publishes and consumes the user service's domain events over RabbitMQ.
//!
//! # Overview
//!
//! This crate provides:
//! - A broker port ([`broker::MessageBroker`]) with an AMQP implementation
//!   ([`broker::BrokerClient`]) built on lapin
//! - Automatic reconnection that replays every registered subscription
//! - Per-topic durable queues with manual acknowledgement and requeue on
//!   handler failure
//! - User event facades for publishing and consuming the four user topics
//! - An in-memory broker for tests
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use user_events::broker::{new_message_broker, MessageBroker};
//! use user_events::config::ServiceConfig;
//! use user_events::domain::UserCreatedEvent;
//! use user_events::events::UserEventPublisher;
//! use user_events::observability::BrokerMetrics;
//! use uuid::Uuid;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ServiceConfig::load_from_file("user-events.toml".as_ref())?;
//! let broker = new_message_broker(&config.broker, Arc::new(BrokerMetrics::new()))?;
//! broker.connect().await?;
//!
//! let publisher = UserEventPublisher::new(Some(broker.clone()));
//! let event = UserCreatedEvent::new(Uuid::new_v4(), "ada@example.com", "Ada");
//! publisher.publish_user_created(&event).await;
//!
//! broker.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod domain;
pub mod error;
pub mod events;
pub mod observability;
pub mod testing;

pub use broker::{BrokerClient, ConnectionState, MessageBroker, MessageHandler};
pub use config::{ConfigError, ServiceConfig};
pub use error::{BrokerError, BrokerResult, HandlerError, TransportError};
