//! Connection state and session management for the broker client
//!
//! A [`Session`] is one connection plus the single channel used for topology,
//! publishing and consuming. The [`ConnectionManager`] owns the current
//! session and publishes the [`ConnectionState`] through a watch channel so
//! every other component can observe it without locking.

use super::transport::{Channel, Connection, Connector, DialOptions};
use crate::error::{BrokerError, BrokerResult, TransportError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Connection state for the broker client
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Not connected, with the reason for the last transition
    Disconnected(String),
    /// First connection attempt in progress
    Connecting,
    /// Session installed and ready for operations
    Connected,
    /// Reconnection attempt in progress (attempt number, starting at 1)
    Reconnecting(u32),
    /// Client closed; terminal
    Closed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Short lowercase label for health output and metrics
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected(_) => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting(_) => "reconnecting",
            ConnectionState::Closed => "closed",
        }
    }
}

/// Exchange and channel settings applied to every new session
#[derive(Debug, Clone, PartialEq)]
pub struct Topology {
    /// Exchange to declare; `None` uses the broker's predeclared `amq.topic`
    pub exchange: Option<String>,
    pub exchange_kind: String,
    pub prefetch: u16,
}

/// One live connection and its channel
pub struct Session {
    id: u64,
    connection: Box<dyn Connection>,
    channel: Box<dyn Channel>,
}

impl Session {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn connection(&self) -> &dyn Connection {
        self.connection.as_ref()
    }

    pub fn channel(&self) -> &dyn Channel {
        self.channel.as_ref()
    }

    /// Close channel then connection, ignoring failures from already-dead resources
    pub(crate) async fn shutdown(&self) {
        if let Err(e) = self.channel.close().await {
            debug!(session_id = self.id, error = %e, "Channel close failed, ignoring");
        }
        if let Err(e) = self.connection.close().await {
            debug!(session_id = self.id, error = %e, "Connection close failed, ignoring");
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("closed", &self.connection.is_closed())
            .finish()
    }
}

/// Owns the current session and the connection state
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    dial: DialOptions,
    topology: Topology,
    session: RwLock<Option<Arc<Session>>>,
    state_tx: watch::Sender<ConnectionState>,
    next_session_id: AtomicU64,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, dial: DialOptions, topology: Topology) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected("not connected".into()));
        Self {
            connector,
            dial,
            topology,
            session: RwLock::new(None),
            state_tx,
            next_session_id: AtomicU64::new(1),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    /// Watch state transitions
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Move to `state` unless the manager is closed
    ///
    /// Returns false, leaving the state untouched, once `Closed` is reached;
    /// only [`ConnectionManager::close`] enters `Closed`.
    pub fn set_state(&self, state: ConnectionState) -> bool {
        let mut previous = None;
        self.state_tx.send_if_modified(|current| {
            if matches!(current, ConnectionState::Closed) || *current == state {
                return false;
            }
            previous = Some(std::mem::replace(current, state.clone()));
            true
        });

        match previous {
            Some(previous) => {
                log_state_transition(&previous, &state);
                true
            }
            None => !self.is_closed(),
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.state_tx.borrow(), ConnectionState::Closed)
    }

    /// True when connected and the transport still reports the connection open
    pub fn is_live(&self) -> bool {
        self.state().is_connected()
            && self
                .read_session()
                .is_some_and(|session| !session.connection.is_closed())
    }

    /// Session for publish/subscribe, failing fast when not connected
    pub fn current(&self) -> BrokerResult<Arc<Session>> {
        let state = self.state();
        if !state.is_connected() {
            return Err(BrokerError::NotConnected { state });
        }
        self.read_session()
            .ok_or(BrokerError::NotConnected { state })
    }

    /// Liveness check that never blocks on the network
    pub fn health(&self) -> BrokerResult<()> {
        let session = self.current()?;
        if session.connection.is_closed() {
            return Err(BrokerError::connection(
                "check health",
                TransportError::new("connection is closed"),
            ));
        }
        Ok(())
    }

    /// Dial, open a channel, apply QoS and declare the exchange, then install the session
    ///
    /// The caller decides the resulting state; this only installs the session.
    pub async fn open_session(&self) -> BrokerResult<Arc<Session>> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }

        let session = Arc::new(self.establish().await?);
        self.install(Arc::clone(&session)).await?;
        Ok(session)
    }

    async fn establish(&self) -> BrokerResult<Session> {
        let connection = self
            .connector
            .dial(&self.dial)
            .await
            .map_err(|e| BrokerError::connection("dial broker", e))?;

        let channel = match connection.open_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                let _ = connection.close().await;
                return Err(BrokerError::connection("open channel", e));
            }
        };

        if let Err(error) = self.apply_topology(channel.as_ref()).await {
            let _ = channel.close().await;
            let _ = connection.close().await;
            return Err(error);
        }

        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        debug!(session_id = id, "Broker session established");
        Ok(Session {
            id,
            connection,
            channel,
        })
    }

    async fn apply_topology(&self, channel: &dyn Channel) -> BrokerResult<()> {
        channel
            .set_prefetch(self.topology.prefetch)
            .await
            .map_err(|e| BrokerError::connection("set prefetch", e))?;

        if let Some(exchange) = &self.topology.exchange {
            channel
                .declare_exchange(exchange, &self.topology.exchange_kind, true)
                .await
                .map_err(|e| BrokerError::connection("declare exchange", e))?;
        }
        Ok(())
    }

    /// Replace the current session; a concurrent close wins and tears the new one down
    async fn install(&self, session: Arc<Session>) -> BrokerResult<()> {
        let rejected = {
            let mut slot = self.session.write().unwrap_or_else(PoisonError::into_inner);
            if self.is_closed() {
                true
            } else {
                *slot = Some(Arc::clone(&session));
                false
            }
        };

        if rejected {
            session.shutdown().await;
            return Err(BrokerError::Closed);
        }
        Ok(())
    }

    /// Record a lost connection, dropping the dead session
    ///
    /// Ignored when `session_id` is no longer the installed session.
    pub fn mark_disconnected(&self, session_id: u64, reason: &str) -> bool {
        {
            let mut slot = self.session.write().unwrap_or_else(PoisonError::into_inner);
            match slot.as_ref() {
                Some(current) if current.id == session_id => {
                    *slot = None;
                }
                _ => return false,
            }
        }
        self.set_state(ConnectionState::Disconnected(reason.to_string()));
        true
    }

    /// Enter the terminal Closed state and close the current session
    ///
    /// Returns false when already closed.
    pub async fn close(&self) -> bool {
        let previous = self.state_tx.send_replace(ConnectionState::Closed);
        if previous == ConnectionState::Closed {
            return false;
        }
        log_state_transition(&previous, &ConnectionState::Closed);

        let session = self
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(session) = session {
            session.shutdown().await;
        }
        true
    }

    fn read_session(&self) -> Option<Arc<Session>> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Log a connection state transition
fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
    match (from, to) {
        (ConnectionState::Connecting, ConnectionState::Connected) => {
            info!("Broker connection established");
        }
        (ConnectionState::Connected, ConnectionState::Disconnected(reason)) => {
            warn!(reason = %reason, "Broker connection lost");
        }
        (ConnectionState::Reconnecting(attempt), ConnectionState::Connected) => {
            info!(attempt = *attempt, "Reconnection successful");
        }
        (_, ConnectionState::Reconnecting(attempt)) => {
            debug!(attempt = *attempt, "Reconnection attempt started");
        }
        (_, ConnectionState::Closed) => {
            info!("Broker client closed");
        }
        _ => {
            debug!(from = ?from, to = ?to, "Broker connection state changed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::memory::MemoryBroker;
    use std::time::Duration;

    fn manager(broker: &MemoryBroker, exchange: Option<&str>) -> ConnectionManager {
        ConnectionManager::new(
            Arc::new(broker.clone()),
            DialOptions {
                url: "amqp://localhost:5672/%2f".to_string(),
                heartbeat: Duration::from_secs(10),
                connection_name: Some("test".to_string()),
            },
            Topology {
                exchange: exchange.map(str::to_string),
                exchange_kind: "topic".to_string(),
                prefetch: 10,
            },
        )
    }

    #[test]
    fn test_connection_state_labels() {
        assert_eq!(ConnectionState::Connected.label(), "connected");
        assert_eq!(ConnectionState::Reconnecting(2).label(), "reconnecting");
        assert_eq!(
            ConnectionState::Disconnected("gone".to_string()).label(),
            "disconnected"
        );
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Closed.is_connected());
    }

    #[tokio::test]
    async fn test_current_fails_before_connect() {
        let broker = MemoryBroker::new();
        let manager = manager(&broker, None);

        let result = manager.current();
        assert!(matches!(result, Err(BrokerError::NotConnected { .. })));
        assert!(manager.health().is_err());
    }

    #[tokio::test]
    async fn test_open_session_declares_exchange() {
        // Arrange
        let broker = MemoryBroker::new();
        let manager = manager(&broker, Some("user.events"));

        // Act
        let session = manager.open_session().await.unwrap();
        manager.set_state(ConnectionState::Connected);

        // Assert
        assert!(broker.has_exchange("user.events"));
        assert!(manager.is_live());
        assert_eq!(manager.current().unwrap().id(), session.id());
        assert!(manager.health().is_ok());
    }

    #[tokio::test]
    async fn test_dial_failure_names_stage() {
        let broker = MemoryBroker::new();
        broker.set_refuse_connections(true);
        let manager = manager(&broker, None);

        let error = manager.open_session().await.unwrap_err();
        assert!(matches!(
            error,
            BrokerError::Connection {
                stage: "dial broker",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_exchange_failure_releases_connection() {
        // Arrange: amq.* names cannot be redeclared with a different kind
        let broker = MemoryBroker::new();
        let manager = ConnectionManager::new(
            Arc::new(broker.clone()),
            DialOptions {
                url: "amqp://localhost".to_string(),
                heartbeat: Duration::from_secs(10),
                connection_name: None,
            },
            Topology {
                exchange: Some("amq.topic".to_string()),
                exchange_kind: "direct".to_string(),
                prefetch: 10,
            },
        );

        // Act
        let error = manager.open_session().await.unwrap_err();

        // Assert
        assert!(matches!(
            error,
            BrokerError::Connection {
                stage: "declare exchange",
                ..
            }
        ));
        assert_eq!(broker.live_connections(), 0);
    }

    #[tokio::test]
    async fn test_close_is_terminal() {
        let broker = MemoryBroker::new();
        let manager = manager(&broker, None);
        manager.open_session().await.unwrap();
        manager.set_state(ConnectionState::Connected);

        assert!(manager.close().await);
        assert!(!manager.close().await);
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert_eq!(broker.live_connections(), 0);
        assert!(matches!(
            manager.open_session().await,
            Err(BrokerError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_set_state_cannot_leave_closed() {
        let broker = MemoryBroker::new();
        let manager = manager(&broker, None);
        assert!(manager.set_state(ConnectionState::Connecting));
        assert!(manager.set_state(ConnectionState::Connecting));

        manager.close().await;

        assert!(!manager.set_state(ConnectionState::Connected));
        assert!(!manager.set_state(ConnectionState::Reconnecting(1)));
        assert!(!manager.set_state(ConnectionState::Disconnected("late".to_string())));
        assert_eq!(manager.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_mark_disconnected_ignores_stale_session() {
        let broker = MemoryBroker::new();
        let manager = manager(&broker, None);
        let session = manager.open_session().await.unwrap();
        manager.set_state(ConnectionState::Connected);

        assert!(!manager.mark_disconnected(session.id() + 1, "stale"));
        assert!(manager.state().is_connected());

        assert!(manager.mark_disconnected(session.id(), "connection reset"));
        assert_eq!(
            manager.state(),
            ConnectionState::Disconnected("connection reset".to_string())
        );
        assert!(manager.current().is_err());
    }
}
