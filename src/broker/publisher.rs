//! Event encoding and publishing
//!
//! Events are encoded before any network call, so a serialization failure
//! never reaches the broker.

use super::connection::Session;
use super::transport::OutboundMessage;
use crate::domain::DomainEvent;
use crate::error::{BrokerError, BrokerResult};

pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Encode `event` into an AMQP message carrying its id, type and timestamp
pub fn build_message(event: &dyn DomainEvent, persistent: bool) -> BrokerResult<OutboundMessage> {
    let body = event.encode().map_err(BrokerError::Serialization)?;
    let timestamp = u64::try_from(event.occurred_at().timestamp()).unwrap_or(0);

    Ok(OutboundMessage {
        body,
        content_type: CONTENT_TYPE_JSON.to_string(),
        message_id: event.event_id().to_string(),
        kind: event.event_type().to_string(),
        timestamp,
        persistent,
    })
}

/// Send one encoded event to `exchange` with the topic as routing key
pub async fn publish_on(
    session: &Session,
    exchange: &str,
    topic: &str,
    message: OutboundMessage,
) -> BrokerResult<()> {
    session
        .channel()
        .publish(exchange, topic, message)
        .await
        .map_err(|e| BrokerError::publish(topic, e))
}
