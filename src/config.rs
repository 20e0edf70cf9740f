//! Configuration system for the user event service
//!
//! Configuration is read from a TOML file, then selected values can be
//! overridden from the environment. Broker credentials are never stored in
//! the file: the file names the environment variables that hold them and
//! they are resolved when the connection URL is built.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Exchange used when none is configured
pub const DEFAULT_EXCHANGE: &str = "amq.topic";

const SUPPORTED_EXCHANGE_TYPES: [&str; 4] = ["direct", "fanout", "topic", "headers"];

/// Top-level service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServiceConfig {
    #[serde(default)]
    pub service: ServiceSection,
    #[serde(default)]
    pub broker: BrokerSection,
    #[serde(default)]
    pub health: HealthSection,
}

/// Service identity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceSection {
    #[serde(default = "default_service_name")]
    pub name: String,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            name: default_service_name(),
        }
    }
}

fn default_service_name() -> String {
    "user-service".to_string()
}

/// Message broker selection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// When false the service runs without publishing or consuming events
    #[serde(default)]
    pub enabled: bool,
    /// Broker implementation; only "rabbitmq" is supported
    #[serde(rename = "type", default = "default_broker_type")]
    pub kind: String,
    #[serde(default)]
    pub rabbitmq: RabbitMqSection,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            enabled: false,
            kind: default_broker_type(),
            rabbitmq: RabbitMqSection::default(),
        }
    }
}

fn default_broker_type() -> String {
    "rabbitmq".to_string()
}

/// RabbitMQ connection, topology and recovery settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RabbitMqSection {
    /// Full AMQP URL; takes precedence over host/port/vhost when set
    pub url: Option<String>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_vhost")]
    pub vhost: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    /// Name reported to the broker for this connection
    pub connection_name: Option<String>,
    /// Exchange to publish to and bind queues on; empty means amq.topic
    #[serde(default)]
    pub exchange: String,
    #[serde(default = "default_exchange_type")]
    pub exchange_type: String,
    /// Prepended to the topic to form the queue name
    #[serde(default)]
    pub queue_prefix: String,
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u32,
    /// Mark published messages persistent (delivery mode 2)
    #[serde(default = "default_persistent")]
    pub persistent: bool,
    /// Reconnection attempts before giving up (default: 10)
    #[serde(default = "default_max_reconnect")]
    pub max_reconnect: u32,
    /// Fixed delay between reconnection attempts (default: 5000ms)
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// AMQP heartbeat interval (default: 10s)
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

impl Default for RabbitMqSection {
    fn default() -> Self {
        Self {
            url: None,
            host: default_host(),
            port: default_port(),
            vhost: default_vhost(),
            username_env: None,
            password_env: None,
            connection_name: None,
            exchange: String::new(),
            exchange_type: default_exchange_type(),
            queue_prefix: String::new(),
            prefetch_count: default_prefetch_count(),
            persistent: default_persistent(),
            max_reconnect: default_max_reconnect(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            heartbeat_secs: default_heartbeat_secs(),
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5672
}

fn default_vhost() -> String {
    "/".to_string()
}

fn default_exchange_type() -> String {
    "topic".to_string()
}

fn default_prefetch_count() -> u32 {
    10
}

fn default_persistent() -> bool {
    true
}

fn default_max_reconnect() -> u32 {
    10
}

fn default_reconnect_delay_ms() -> u64 {
    5000
}

fn default_heartbeat_secs() -> u64 {
    10
}

/// Health endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthSection {
    #[serde(default = "default_health_port")]
    pub port: u16,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            port: default_health_port(),
        }
    }
}

fn default_health_port() -> u16 {
    8080
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ServiceConfig {
    /// Load configuration from a TOML file, apply environment overrides and validate
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: ServiceConfig = toml::from_str(&content)?;
        config.apply_env_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Defaults with environment overrides, for running without a config file
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = ServiceConfig::default();
        config.apply_env_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Override selected values from the environment
    ///
    /// The lookup is injected so overrides can be exercised without touching
    /// the process environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(enabled) = lookup("BROKER_ENABLED") {
            self.broker.enabled = enabled.eq_ignore_ascii_case("true") || enabled == "1";
        }
        if let Some(url) = lookup("RABBITMQ_URL").filter(|v| !v.is_empty()) {
            self.broker.rabbitmq.url = Some(url);
        }
        if let Some(exchange) = lookup("RABBITMQ_EXCHANGE") {
            self.broker.rabbitmq.exchange = exchange;
        }
        if let Some(prefix) = lookup("RABBITMQ_QUEUE_PREFIX") {
            self.broker.rabbitmq.queue_prefix = prefix;
        }
        if let Some(port) = lookup("HEALTH_PORT").and_then(|p| p.parse().ok()) {
            self.health.port = port;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service.name.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "service.name must not be empty".to_string(),
            ));
        }
        self.broker.rabbitmq.validate()
    }
}

impl RabbitMqSection {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !SUPPORTED_EXCHANGE_TYPES.contains(&self.exchange_type.as_str()) {
            return Err(ConfigError::InvalidConfig(format!(
                "exchange_type '{}' must be one of {:?}",
                self.exchange_type, SUPPORTED_EXCHANGE_TYPES
            )));
        }

        if self.prefetch_count == 0 || self.prefetch_count > u32::from(u16::MAX) {
            return Err(ConfigError::InvalidConfig(format!(
                "prefetch_count must be between 1 and {}",
                u16::MAX
            )));
        }

        if self.max_reconnect == 0 {
            return Err(ConfigError::InvalidConfig(
                "max_reconnect must be greater than 0".to_string(),
            ));
        }

        if self.reconnect_delay_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "reconnect_delay_ms must be greater than 0".to_string(),
            ));
        }

        if self.heartbeat_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "heartbeat_secs must be greater than 0".to_string(),
            ));
        }

        if let Some(url) = &self.url {
            let parsed = Url::parse(url)
                .map_err(|e| ConfigError::InvalidConfig(format!("invalid broker url: {e}")))?;
            if parsed.scheme() != "amqp" && parsed.scheme() != "amqps" {
                return Err(ConfigError::InvalidConfig(format!(
                    "broker url scheme must be amqp or amqps, got '{}'",
                    parsed.scheme()
                )));
            }
        }

        Ok(())
    }

    /// Exchange name, falling back to amq.topic
    pub fn exchange_name(&self) -> &str {
        if self.exchange.is_empty() {
            DEFAULT_EXCHANGE
        } else {
            &self.exchange
        }
    }

    /// Queue name for a topic: the configured prefix followed by the topic
    pub fn queue_name(&self, topic: &str) -> String {
        format!("{}{}", self.queue_prefix, topic)
    }

    pub fn prefetch(&self) -> u16 {
        u16::try_from(self.prefetch_count).unwrap_or(u16::MAX)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    /// Get broker username from environment variable
    pub fn username(&self) -> Option<String> {
        Self::get_env_var_optional(self.username_env.as_ref())
    }

    /// Get broker password from environment variable
    pub fn password(&self) -> Option<String> {
        Self::get_env_var_optional(self.password_env.as_ref())
    }

    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    /// Build the AMQP URL including credentials resolved from the environment
    pub fn amqp_url(&self) -> Result<String, ConfigError> {
        self.amqp_url_with(self.username(), self.password())
    }

    /// Build the AMQP URL with explicit credentials
    ///
    /// Credentials given here replace any embedded in a configured `url`.
    pub fn amqp_url_with(
        &self,
        username: Option<String>,
        password: Option<String>,
    ) -> Result<String, ConfigError> {
        let mut url = match &self.url {
            Some(raw) => Url::parse(raw)
                .map_err(|e| ConfigError::InvalidConfig(format!("invalid broker url: {e}")))?,
            None => {
                let base = format!("amqp://{}:{}", self.host, self.port);
                let mut url = Url::parse(&base)
                    .map_err(|e| ConfigError::InvalidConfig(format!("invalid broker host: {e}")))?;
                url.path_segments_mut()
                    .map_err(|_| ConfigError::InvalidConfig("broker url cannot be a base".into()))?
                    .push(&self.vhost);
                url
            }
        };

        if let Some(username) = username {
            url.set_username(&username)
                .map_err(|_| ConfigError::InvalidConfig("cannot set broker username".into()))?;
            url.set_password(password.as_deref())
                .map_err(|_| ConfigError::InvalidConfig("cannot set broker password".into()))?;
        }

        Ok(url.to_string())
    }
}

/// Strip credentials from a URL so it can be logged
pub fn redact_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) => {
            if !url.username().is_empty() {
                let _ = url.set_username("***");
            }
            if url.password().is_some() {
                let _ = url.set_password(Some("***"));
            }
            url.to_string()
        }
        Err(_) => "<invalid url>".to_string(),
    }
}

#[cfg(test)]
impl ServiceConfig {
    /// Create a test configuration for unit testing
    pub fn test_config() -> Self {
        let toml_content = r#"
[service]
name = "test-service"

[broker]
enabled = true
type = "rabbitmq"

[broker.rabbitmq]
exchange = "test.events"
queue_prefix = "test."
reconnect_delay_ms = 10
max_reconnect = 3
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}
