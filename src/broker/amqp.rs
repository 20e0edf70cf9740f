//! AMQP 0.9.1 transport backed by lapin
//!
//! Maps the [`transport`](super::transport) traits onto lapin connections
//! and channels. Topology calls use durable declarations and empty argument
//! tables; deliveries are consumed with manual acknowledgement.

use super::transport::{
    Acknowledger, Channel, Connection, Connector, Delivery, DeliveryStream, DialOptions,
    OutboundMessage,
};
use crate::error::TransportError;
use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, ConnectionProperties, ExchangeKind,
};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;
use tracing::debug;
use url::Url;

const REPLY_SUCCESS: u16 = 200;

impl From<lapin::Error> for TransportError {
    fn from(error: lapin::Error) -> Self {
        TransportError::new(error.to_string())
    }
}

/// Map a configured exchange type onto lapin's exchange kind
pub fn exchange_kind(kind: &str) -> ExchangeKind {
    match kind {
        "direct" => ExchangeKind::Direct,
        "fanout" => ExchangeKind::Fanout,
        "headers" => ExchangeKind::Headers,
        "topic" => ExchangeKind::Topic,
        other => ExchangeKind::Custom(other.to_string()),
    }
}

/// Append the heartbeat interval to the URL as lapin's `heartbeat` query parameter
fn url_with_heartbeat(options: &DialOptions) -> Result<String, TransportError> {
    let mut url = Url::parse(&options.url)
        .map_err(|e| TransportError::new(format!("invalid broker url: {e}")))?;
    if !url.query_pairs().any(|(key, _)| key == "heartbeat") {
        url.query_pairs_mut()
            .append_pair("heartbeat", &options.heartbeat.as_secs().to_string());
    }
    Ok(url.to_string())
}

type CloseSender = Arc<Mutex<Option<oneshot::Sender<TransportError>>>>;

/// Dials RabbitMQ through lapin
#[derive(Debug, Default, Clone)]
pub struct LapinConnector;

impl LapinConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for LapinConnector {
    async fn dial(&self, options: &DialOptions) -> Result<Box<dyn Connection>, TransportError> {
        let uri = url_with_heartbeat(options)?;
        let mut properties = ConnectionProperties::default();
        if let Some(name) = &options.connection_name {
            properties = properties.with_connection_name(name.clone().into());
        }

        let connection = lapin::Connection::connect(&uri, properties).await?;

        let (close_tx, close_rx) = oneshot::channel();
        let close_tx: CloseSender = Arc::new(Mutex::new(Some(close_tx)));
        let notifier = Arc::clone(&close_tx);
        connection.on_error(move |error| {
            let sender = notifier
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(sender) = sender {
                let _ = sender.send(TransportError::from(error));
            }
        });

        Ok(Box::new(LapinConnection {
            connection,
            close_tx,
            close_rx: Mutex::new(Some(close_rx)),
        }))
    }
}

struct LapinConnection {
    connection: lapin::Connection,
    close_tx: CloseSender,
    close_rx: Mutex<Option<oneshot::Receiver<TransportError>>>,
}

#[async_trait]
impl Connection for LapinConnection {
    async fn open_channel(&self) -> Result<Box<dyn Channel>, TransportError> {
        let channel = self.connection.create_channel().await?;
        Ok(Box::new(LapinChannel { channel }))
    }

    fn is_closed(&self) -> bool {
        !self.connection.status().connected()
    }

    fn take_close_notification(&self) -> Option<oneshot::Receiver<TransportError>> {
        self.close_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    async fn close(&self) -> Result<(), TransportError> {
        // Dropping the sender tells the watcher this was a graceful close.
        drop(
            self.close_tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        self.connection.close(REPLY_SUCCESS, "OK").await?;
        Ok(())
    }
}

struct LapinChannel {
    channel: lapin::Channel,
}

#[async_trait]
impl Channel for LapinChannel {
    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: &str,
        durable: bool,
    ) -> Result<(), TransportError> {
        self.channel
            .exchange_declare(
                name,
                exchange_kind(kind),
                ExchangeDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, name: &str, durable: bool) -> Result<String, TransportError> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(queue.name().as_str().to_string())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, TransportError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let stream = consumer.map(|delivery| -> Result<Delivery, TransportError> {
            let delivery = delivery?;
            Ok(Delivery {
                delivery_tag: delivery.delivery_tag,
                redelivered: delivery.redelivered,
                body: delivery.data,
                acker: Box::new(LapinAcker {
                    acker: delivery.acker,
                }),
            })
        });
        Ok(stream.boxed())
    }

    async fn cancel_consumer(&self, consumer_tag: &str) -> Result<(), TransportError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), TransportError> {
        let properties = BasicProperties::default()
            .with_content_type(message.content_type.clone().into())
            .with_message_id(message.message_id.clone().into())
            .with_kind(message.kind.clone().into())
            .with_timestamp(message.timestamp)
            .with_delivery_mode(message.delivery_mode());

        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await?
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.channel.close(REPLY_SUCCESS, "OK").await?;
        debug!(channel_id = self.channel.id(), "AMQP channel closed");
        Ok(())
    }
}

struct LapinAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        self.acker.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), TransportError> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn options(url: &str) -> DialOptions {
        DialOptions {
            url: url.to_string(),
            heartbeat: Duration::from_secs(10),
            connection_name: None,
        }
    }

    #[test]
    fn test_exchange_kind_mapping() {
        assert!(matches!(exchange_kind("topic"), ExchangeKind::Topic));
        assert!(matches!(exchange_kind("direct"), ExchangeKind::Direct));
        assert!(matches!(exchange_kind("fanout"), ExchangeKind::Fanout));
        assert!(matches!(exchange_kind("headers"), ExchangeKind::Headers));
        assert!(matches!(
            exchange_kind("x-delayed-message"),
            ExchangeKind::Custom(name) if name == "x-delayed-message"
        ));
    }

    #[test]
    fn test_heartbeat_appended_to_url() {
        let url = url_with_heartbeat(&options("amqp://localhost:5672/%2f")).unwrap();
        assert_eq!(url, "amqp://localhost:5672/%2f?heartbeat=10");
    }

    #[test]
    fn test_explicit_heartbeat_kept() {
        let url = url_with_heartbeat(&options("amqp://localhost:5672/%2f?heartbeat=30")).unwrap();
        assert_eq!(url, "amqp://localhost:5672/%2f?heartbeat=30");
    }

    #[test]
    fn test_invalid_url_rejected() {
        assert!(url_with_heartbeat(&options("not a url")).is_err());
    }
}
