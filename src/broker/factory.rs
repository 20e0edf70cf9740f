//! Broker construction from configuration

use super::{BrokerClient, MessageBroker};
use crate::config::BrokerSection;
use crate::error::{BrokerError, BrokerResult};
use crate::observability::BrokerMetrics;
use std::sync::Arc;
use tracing::warn;

pub const RABBITMQ: &str = "rabbitmq";

/// Build the configured message broker
///
/// Fails with [`BrokerError::Disabled`] when the broker is turned off and
/// [`BrokerError::UnsupportedBroker`] for unknown broker types. The returned
/// broker is not yet connected.
pub fn new_message_broker(
    config: &BrokerSection,
    metrics: Arc<BrokerMetrics>,
) -> BrokerResult<Arc<dyn MessageBroker>> {
    if !config.enabled {
        return Err(BrokerError::Disabled);
    }

    match config.kind.to_ascii_lowercase().as_str() {
        RABBITMQ => {
            let client = BrokerClient::rabbitmq(&config.rabbitmq, metrics).map_err(|e| {
                warn!(error = %e, "Invalid RabbitMQ configuration");
                BrokerError::from(e)
            })?;
            Ok(Arc::new(client))
        }
        other => Err(BrokerError::UnsupportedBroker(other.to_string())),
    }
}
