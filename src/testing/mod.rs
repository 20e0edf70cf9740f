//! Testing utilities
//!
//! An in-memory AMQP broker for exercising the broker client without
//! RabbitMQ, plus mocks of the broker port and message handlers.

pub mod memory;
pub mod mocks;

pub use memory::{MemoryBroker, PublishedMessage};
pub use mocks::{MockBroker, RecordingHandler};
