//! Transport abstraction over AMQP 0.9.1 primitives
//!
//! The broker client only talks to these traits. The production
//! implementation lives in [`crate::broker::amqp`] and drives lapin; the
//! in-memory implementation in [`crate::testing::memory`] lets the
//! reconnection and subscription logic run without a real broker.

use crate::error::TransportError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;
use tokio::sync::oneshot;

/// Parameters for dialing the broker
#[derive(Debug, Clone, PartialEq)]
pub struct DialOptions {
    /// AMQP URL including credentials
    pub url: String,
    pub heartbeat: Duration,
    pub connection_name: Option<String>,
}

/// Message ready to be published
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub content_type: String,
    pub message_id: String,
    /// AMQP `type` property
    pub kind: String,
    /// Unix seconds
    pub timestamp: u64,
    pub persistent: bool,
}

impl OutboundMessage {
    /// AMQP delivery mode: 2 for persistent, 1 for transient
    pub fn delivery_mode(&self) -> u8 {
        if self.persistent {
            2
        } else {
            1
        }
    }
}

/// Settles a single delivery with the broker
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), TransportError>;
    async fn nack(&self, requeue: bool) -> Result<(), TransportError>;
}

/// A message received from a queue, pending acknowledgement
pub struct Delivery {
    pub body: Vec<u8>,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub async fn ack(&self) -> Result<(), TransportError> {
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<(), TransportError> {
        self.acker.nack(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// Deliveries for one consumer; ends or errors when the channel goes away
pub type DeliveryStream = BoxStream<'static, Result<Delivery, TransportError>>;

/// Opens connections to the broker
#[async_trait]
pub trait Connector: Send + Sync {
    async fn dial(&self, options: &DialOptions) -> Result<Box<dyn Connection>, TransportError>;
}

/// A live broker connection
#[async_trait]
pub trait Connection: Send + Sync {
    async fn open_channel(&self) -> Result<Box<dyn Channel>, TransportError>;

    /// True once the connection has been closed by either side
    fn is_closed(&self) -> bool;

    /// Receiver that resolves with the error when the connection fails
    ///
    /// Can be taken once per connection. If the connection is closed
    /// gracefully the sender is dropped without a value.
    fn take_close_notification(&self) -> Option<oneshot::Receiver<TransportError>>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// A channel multiplexed on a connection
#[async_trait]
pub trait Channel: Send + Sync {
    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError>;

    async fn declare_exchange(
        &self,
        name: &str,
        kind: &str,
        durable: bool,
    ) -> Result<(), TransportError>;

    /// Declare a queue, returning the name the broker assigned to it
    async fn declare_queue(&self, name: &str, durable: bool) -> Result<String, TransportError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError>;

    /// Start a manual-ack consumer on `queue`
    async fn consume(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, TransportError>;

    async fn cancel_consumer(&self, consumer_tag: &str) -> Result<(), TransportError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_mode() {
        let mut message = OutboundMessage {
            body: b"{}".to_vec(),
            content_type: "application/json".to_string(),
            message_id: "id".to_string(),
            kind: "user.created".to_string(),
            timestamp: 0,
            persistent: true,
        };
        assert_eq!(message.delivery_mode(), 2);

        message.persistent = false;
        assert_eq!(message.delivery_mode(), 1);
    }
}
