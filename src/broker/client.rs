//! Durable broker client
//!
//! [`BrokerClient`] composes the connection manager, subscription registry,
//! consumer tasks and reconnection supervisor behind the [`MessageBroker`]
//! port. It is cheap to clone; all clones share one connection.
//!
//! Reconnection is driven by a close watcher spawned for every installed
//! session. When the connection fails the watcher runs the supervisor, and
//! on success every registered subscription is re-established on the new
//! session with the same handler.

use super::amqp::LapinConnector;
use super::connection::{ConnectionManager, ConnectionState, Session, Topology};
use super::consumer::ConsumerTask;
use super::publisher;
use super::registry::{ConsumerHandle, SubscriptionRegistry};
use super::supervisor::{wait_for_signal, ReconnectPolicy, ReconnectionSupervisor, SupervisorOutcome};
use super::transport::{Connector, DialOptions};
use super::{MessageBroker, MessageHandler};
use crate::config::{redact_url, ConfigError, RabbitMqSection};
use crate::domain::DomainEvent;
use crate::error::{BrokerError, BrokerResult};
use crate::observability::BrokerMetrics;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn, Instrument};

/// Resolved client settings
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerSettings {
    pub dial: DialOptions,
    /// Exchange to declare on connect; `None` publishes to `amq.topic`
    pub exchange: Option<String>,
    pub exchange_kind: String,
    pub queue_prefix: String,
    pub prefetch: u16,
    pub persistent: bool,
    pub reconnect: ReconnectPolicy,
}

impl BrokerSettings {
    /// Build settings from configuration, resolving credentials from the environment
    pub fn from_config(section: &RabbitMqSection) -> Result<Self, ConfigError> {
        Ok(Self::with_url(section, section.amqp_url()?))
    }

    /// Build settings from configuration with an explicit URL
    pub fn with_url(section: &RabbitMqSection, url: String) -> Self {
        Self {
            dial: DialOptions {
                url,
                heartbeat: section.heartbeat(),
                connection_name: section.connection_name.clone(),
            },
            exchange: (!section.exchange.is_empty()).then(|| section.exchange.clone()),
            exchange_kind: section.exchange_type.clone(),
            queue_prefix: section.queue_prefix.clone(),
            prefetch: section.prefetch(),
            persistent: section.persistent,
            reconnect: ReconnectPolicy {
                max_attempts: section.max_reconnect,
                delay: section.reconnect_delay(),
            },
        }
    }

    /// Exchange used for publishing and binding
    pub fn exchange_name(&self) -> &str {
        self.exchange
            .as_deref()
            .unwrap_or(crate::config::DEFAULT_EXCHANGE)
    }

    pub fn queue_name(&self, topic: &str) -> String {
        format!("{}{}", self.queue_prefix, topic)
    }
}

struct Inner {
    settings: BrokerSettings,
    manager: ConnectionManager,
    registry: Arc<SubscriptionRegistry>,
    /// Serializes connect and reconnection attempts
    connect_lock: Mutex<()>,
    reconnecting: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    metrics: Arc<BrokerMetrics>,
}

/// Message broker client with automatic reconnection
#[derive(Clone)]
pub struct BrokerClient {
    inner: Arc<Inner>,
}

impl BrokerClient {
    pub fn new(
        settings: BrokerSettings,
        connector: Arc<dyn Connector>,
        metrics: Arc<BrokerMetrics>,
    ) -> Self {
        let topology = Topology {
            exchange: settings.exchange.clone(),
            exchange_kind: settings.exchange_kind.clone(),
            prefetch: settings.prefetch,
        };
        let manager = ConnectionManager::new(connector, settings.dial.clone(), topology);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                settings,
                manager,
                registry: Arc::new(SubscriptionRegistry::new()),
                connect_lock: Mutex::new(()),
                reconnecting: AtomicBool::new(false),
                shutdown_tx,
                metrics,
            }),
        }
    }

    /// Client for RabbitMQ using lapin
    pub fn rabbitmq(
        section: &RabbitMqSection,
        metrics: Arc<BrokerMetrics>,
    ) -> Result<Self, ConfigError> {
        let settings = BrokerSettings::from_config(section)?;
        Ok(Self::new(settings, Arc::new(LapinConnector::new()), metrics))
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.inner.settings
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.manager.watch_state()
    }

    pub fn metrics(&self) -> Arc<BrokerMetrics> {
        Arc::clone(&self.inner.metrics)
    }

    /// Topics with a registered subscription, including dormant ones
    pub fn subscribed_topics(&self) -> Vec<String> {
        self.inner.registry.topics()
    }

    /// Number of subscriptions with a running consumer task
    pub fn active_consumers(&self) -> usize {
        self.inner.registry.active_count()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.inner.reconnecting.load(Ordering::SeqCst)
    }
}

impl Inner {
    /// Bring up a session on behalf of an external `connect`
    async fn connect(self: &Arc<Self>) -> BrokerResult<()> {
        let _guard = self.connect_lock.lock().await;

        if self.manager.is_closed() {
            return Err(BrokerError::Closed);
        }
        if self.reconnecting.load(Ordering::SeqCst) {
            return Err(BrokerError::NotConnected {
                state: self.manager.state(),
            });
        }
        if self.manager.is_live() {
            debug!("Already connected, connect is a no-op");
            return Ok(());
        }

        info!(
            url = %redact_url(&self.settings.dial.url),
            exchange = %self.settings.exchange_name(),
            "Connecting to message broker"
        );
        if !self.manager.set_state(ConnectionState::Connecting) {
            return Err(BrokerError::Closed);
        }

        let session = match self.manager.open_session().await {
            Ok(session) => session,
            Err(e) => {
                self.manager
                    .set_state(ConnectionState::Disconnected(e.to_string()));
                return Err(e);
            }
        };

        self.resubscribe_all(&session).await;
        self.finish_session(&session).await?;
        self.spawn_close_watcher(session);
        Ok(())
    }

    /// One supervisor attempt: new session, replayed subscriptions, Connected
    async fn reconnect_attempt(self: &Arc<Self>, attempt: u32) -> BrokerResult<Arc<Session>> {
        let _guard = self.connect_lock.lock().await;
        if !self.manager.set_state(ConnectionState::Reconnecting(attempt)) {
            return Err(BrokerError::Closed);
        }
        self.metrics.record_reconnect_attempt();

        let session = self.manager.open_session().await?;
        self.resubscribe_all(&session).await;
        self.finish_session(&session).await?;
        Ok(session)
    }

    /// Mark a freshly replayed session Connected
    ///
    /// A `close` that landed while subscriptions were replayed wins: the
    /// session is shut down and `Closed` is returned.
    async fn finish_session(&self, session: &Session) -> BrokerResult<()> {
        if !self.manager.set_state(ConnectionState::Connected) {
            debug!(session_id = session.id(), "Client closed during connect, discarding session");
            session.shutdown().await;
            return Err(BrokerError::Closed);
        }
        self.metrics.record_connected();
        Ok(())
    }

    /// Re-establish every registry entry on `session`
    ///
    /// A topic that fails stays registered without a consumer and is retried
    /// on the next successful connection.
    async fn resubscribe_all(self: &Arc<Self>, session: &Arc<Session>) {
        let entries = self.registry.snapshot();
        if entries.is_empty() {
            return;
        }

        let mut restored = 0;
        for (topic, generation) in &entries {
            match self.start_consumer(session, topic, *generation).await {
                Ok(handle) => {
                    if self.registry.activate(topic, *generation, handle) {
                        restored += 1;
                    }
                }
                Err(e) => {
                    error!(topic = %topic, error = %e, "Failed to re-establish subscription");
                }
            }
        }
        info!(
            restored,
            total = entries.len(),
            "Re-established subscriptions after connect"
        );
    }

    /// Declare and bind the topic's queue, start consuming and spawn the consumer task
    async fn start_consumer(
        self: &Arc<Self>,
        session: &Arc<Session>,
        topic: &str,
        generation: u64,
    ) -> BrokerResult<ConsumerHandle> {
        let queue = self.settings.queue_name(topic);
        let channel = session.channel();

        let queue = channel
            .declare_queue(&queue, true)
            .await
            .map_err(|e| BrokerError::subscription(topic, e))?;
        channel
            .bind_queue(&queue, self.settings.exchange_name(), topic)
            .await
            .map_err(|e| BrokerError::subscription(topic, e))?;

        let consumer_tag = format!("{}-{}-s{}", topic, generation, session.id());
        let stream = channel
            .consume(&queue, &consumer_tag)
            .await
            .map_err(|e| BrokerError::subscription(topic, e))?;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = ConsumerTask {
            topic: topic.to_string(),
            generation,
            consumer_tag,
            session: Arc::clone(session),
            registry: Arc::clone(&self.registry),
            metrics: Arc::clone(&self.metrics),
            cancel_rx,
            shutdown_rx: self.shutdown_tx.subscribe(),
        };
        let handle = tokio::spawn(async move {
            task.run(stream).await;
        });

        debug!(topic = %topic, queue = %queue, "Consumer started");
        Ok(ConsumerHandle::new(cancel_tx, handle))
    }

    /// Spawn the single watcher for `session`'s close notification
    fn spawn_close_watcher(self: &Arc<Self>, session: Arc<Session>) {
        let Some(notification) = session.connection().take_close_notification() else {
            warn!(
                session_id = session.id(),
                "Close notification already taken, reconnection disabled for this session"
            );
            return;
        };

        let inner = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let session_id = session.id();
        drop(session);

        let span = crate::broker_span!(session_id);
        tokio::spawn(
            async move {
                tokio::select! {
                    _ = wait_for_signal(&mut shutdown_rx) => {
                        debug!("Close watcher stopped for shutdown");
                    }
                    result = notification => match result {
                        Ok(error) => inner.handle_disconnect(session_id, error.to_string()).await,
                        Err(_) => debug!("Connection closed gracefully, not reconnecting"),
                    },
                }
            }
            .instrument(span),
        );
    }

    /// Run the reconnection supervisor for a lost session
    async fn handle_disconnect(self: &Arc<Self>, session_id: u64, reason: String) {
        if self.manager.is_closed() {
            return;
        }
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Reconnection already in progress");
            return;
        }
        if !self.manager.mark_disconnected(session_id, &reason) {
            debug!("Stale session closed, nothing to recover");
            self.reconnecting.store(false, Ordering::SeqCst);
            return;
        }
        self.metrics.record_disconnect();

        let supervisor = ReconnectionSupervisor::new(self.settings.reconnect.clone());
        let outcome = supervisor
            .run(self.shutdown_tx.subscribe(), |attempt| {
                let inner = Arc::clone(self);
                async move { inner.reconnect_attempt(attempt).await }
            })
            .await;

        match outcome {
            SupervisorOutcome::Reconnected { attempt, value } => {
                self.metrics.record_reconnect();
                self.reconnecting.store(false, Ordering::SeqCst);
                info!(attempt, "Reconnected to message broker");
                self.spawn_close_watcher(value);
            }
            SupervisorOutcome::GaveUp {
                attempts,
                last_error,
            } => {
                let last_error = last_error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| reason.clone());
                self.manager.set_state(ConnectionState::Disconnected(format!(
                    "gave up after {attempts} reconnection attempts: {last_error}"
                )));
                self.metrics.record_give_up();
                self.reconnecting.store(false, Ordering::SeqCst);
                warn!(
                    attempts,
                    subscriptions = self.registry.len(),
                    error = %last_error,
                    "Giving up on reconnection; call connect to retry"
                );
            }
            SupervisorOutcome::ShutdownRequested => {
                self.reconnecting.store(false, Ordering::SeqCst);
                debug!("Reconnection stopped for shutdown");
            }
        }
    }
}

#[async_trait]
impl MessageBroker for BrokerClient {
    async fn connect(&self) -> BrokerResult<()> {
        self.inner.connect().await
    }

    async fn close(&self) -> BrokerResult<()> {
        if self.inner.shutdown_tx.send_replace(true) {
            return Ok(());
        }

        self.inner.manager.close().await;
        let cancelled = self.inner.registry.clear();
        self.inner.metrics.record_closed();
        info!(subscriptions = cancelled, "Message broker client closed");
        Ok(())
    }

    fn health(&self) -> BrokerResult<()> {
        self.inner.manager.health()
    }

    fn state(&self) -> ConnectionState {
        self.inner.manager.state()
    }

    async fn publish(&self, topic: &str, event: &dyn DomainEvent) -> BrokerResult<()> {
        let session = self.inner.manager.current()?;
        let message = publisher::build_message(event, self.inner.settings.persistent)?;

        let result = publisher::publish_on(
            &session,
            self.inner.settings.exchange_name(),
            topic,
            message,
        )
        .await;
        self.inner.metrics.record_publish(result.is_ok());

        match &result {
            Ok(()) => debug!(
                topic = %topic,
                event_id = %event.event_id(),
                event_type = %event.event_type(),
                "Event published"
            ),
            Err(e) => error!(topic = %topic, error = %e, "Failed to publish event"),
        }
        result
    }

    async fn publish_batch(&self, topic: &str, events: &[&dyn DomainEvent]) -> BrokerResult<()> {
        for event in events {
            self.publish(topic, *event).await?;
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: Arc<dyn MessageHandler>) -> BrokerResult<()> {
        let session = self.inner.manager.current()?;
        let generation = self.inner.registry.reserve(topic, handler)?;

        match self.inner.start_consumer(&session, topic, generation).await {
            Ok(consumer) => {
                if !self.inner.registry.activate(topic, generation, consumer) {
                    debug!(topic = %topic, "Subscription removed while starting consumer");
                }
                info!(
                    topic = %topic,
                    queue = %self.inner.settings.queue_name(topic),
                    "Subscribed to topic"
                );
                Ok(())
            }
            Err(e) => {
                self.inner.registry.release(topic, generation);
                error!(topic = %topic, error = %e, "Failed to subscribe");
                Err(e)
            }
        }
    }

    async fn unsubscribe(&self, topic: &str) -> BrokerResult<()> {
        self.inner.registry.remove(topic)?;
        info!(topic = %topic, "Unsubscribed from topic");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_settings_from_config_defaults() {
        let section = RabbitMqSection::default();
        let settings = BrokerSettings::with_url(&section, "amqp://localhost:5672/%2f".into());

        assert_eq!(settings.exchange, None);
        assert_eq!(settings.exchange_name(), "amq.topic");
        assert_eq!(settings.queue_name("user.created"), "user.created");
        assert_eq!(settings.dial.heartbeat, Duration::from_secs(10));
        assert_eq!(settings.reconnect, ReconnectPolicy::default());
        assert!(settings.persistent);
    }

    #[test]
    fn test_settings_with_exchange_and_prefix() {
        let section = RabbitMqSection {
            exchange: "user.events".to_string(),
            queue_prefix: "svc.".to_string(),
            connection_name: Some("user-service".to_string()),
            max_reconnect: 3,
            reconnect_delay_ms: 20,
            ..Default::default()
        };
        let settings = BrokerSettings::with_url(&section, "amqp://localhost".into());

        assert_eq!(settings.exchange.as_deref(), Some("user.events"));
        assert_eq!(settings.exchange_name(), "user.events");
        assert_eq!(settings.queue_name("user.deleted"), "svc.user.deleted");
        assert_eq!(settings.dial.connection_name.as_deref(), Some("user-service"));
        assert_eq!(settings.reconnect.max_attempts, 3);
        assert_eq!(settings.reconnect.delay, Duration::from_millis(20));
    }
}
