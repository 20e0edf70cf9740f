//! User event publishing and consumption on top of the broker port

pub mod consumer;
pub mod publisher;

pub use consumer::{LoggingListener, UserEvent, UserEventConsumer, UserEventListener, USER_TOPICS};
pub use publisher::UserEventPublisher;
