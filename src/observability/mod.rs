//! Observability for the broker client
//!
//! Structured logging, broker metrics and the health check endpoints.

pub mod health;
pub mod logging;
pub mod metrics;

pub use health::{BrokerHealth, HealthServer, HealthStatus};
pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{BrokerMetrics, MetricsSnapshot};

// Span macros for structured logging
pub use logging::{broker_span, consumer_span};
