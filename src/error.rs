//! Error taxonomy for the event broker client
//!
//! Every broker operation returns [`BrokerResult`]. Transport-level failures
//! are carried as [`TransportError`] sources so callers see which stage of an
//! operation failed without depending on the AMQP library's error types.

use crate::broker::connection::ConnectionState;
use crate::config::ConfigError;
use thiserror::Error;

/// Failure reported by the underlying transport (AMQP library or test double)
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct TransportError(String);

impl TransportError {
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

/// Main error type for broker operations
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Connection failed while trying to {stage}: {source}")]
    Connection {
        stage: &'static str,
        #[source]
        source: TransportError,
    },

    #[error("Not connected to broker - current state: {state:?}")]
    NotConnected { state: ConnectionState },

    #[error("Broker client has been closed")]
    Closed,

    #[error("Failed to serialize event: {0}")]
    Serialization(#[source] serde_json::Error),

    #[error("Failed to publish message to topic {topic}: {source}")]
    Publish {
        topic: String,
        #[source]
        source: TransportError,
    },

    #[error("Failed to subscribe to topic {topic}: {source}")]
    Subscription {
        topic: String,
        #[source]
        source: TransportError,
    },

    #[error("Already subscribed to topic: {topic}")]
    AlreadySubscribed { topic: String },

    #[error("Not subscribed to topic: {topic}")]
    NotSubscribed { topic: String },

    #[error("Failed to acknowledge delivery {delivery_tag}: {source}")]
    Acknowledgment {
        delivery_tag: u64,
        #[source]
        source: TransportError,
    },

    #[error("Message broker is disabled")]
    Disabled,

    #[error("Unsupported broker type: {0}")]
    UnsupportedBroker(String),

    #[error("Invalid broker configuration: {0}")]
    Configuration(#[from] ConfigError),
}

impl BrokerError {
    pub fn connection(stage: &'static str, source: TransportError) -> Self {
        Self::Connection { stage, source }
    }

    pub fn publish<S: Into<String>>(topic: S, source: TransportError) -> Self {
        Self::Publish {
            topic: topic.into(),
            source,
        }
    }

    pub fn subscription<S: Into<String>>(topic: S, source: TransportError) -> Self {
        Self::Subscription {
            topic: topic.into(),
            source,
        }
    }

    /// True for failures that mean the broker is unreachable right now,
    /// as opposed to caller mistakes such as double subscription.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            BrokerError::Connection { .. }
                | BrokerError::NotConnected { .. }
                | BrokerError::Closed
                | BrokerError::Disabled
        )
    }
}

/// Result type for broker operations
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Error returned by message handlers; any error type can be boxed into it
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
