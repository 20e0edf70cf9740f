//! In-memory AMQP broker
//!
//! Implements the transport traits with enough of RabbitMQ's behaviour to
//! exercise the broker client end to end: exchanges with topic, direct and
//! fanout routing, durable queues, round-robin consumers, manual
//! acknowledgement, requeue with the redelivered flag, and connection loss
//! that returns unacknowledged messages to their queues.
//!
//! Failure injection covers refused dials, dropped connections and rejected
//! publishes. Queue declarations can be held open to freeze a client midway
//! through subscribing.

use crate::broker::transport::{
    Acknowledger, Channel, Connection, Connector, Delivery, DeliveryStream, DialOptions,
    OutboundMessage,
};
use crate::error::TransportError;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot, watch};

/// A message accepted by [`Channel::publish`]
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub message: OutboundMessage,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug, Clone, PartialEq)]
struct Binding {
    queue: String,
    exchange: String,
    routing_key: String,
}

struct ConsumerSlot {
    tag: String,
    connection_id: u64,
    sender: mpsc::UnboundedSender<Result<Delivery, TransportError>>,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
}

struct Unacked {
    queue: String,
    connection_id: u64,
    message: StoredMessage,
}

struct ConnectionSlot {
    closer: Option<oneshot::Sender<TransportError>>,
    closed: Arc<AtomicBool>,
}

struct BrokerState {
    exchanges: HashMap<String, String>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    connections: HashMap<u64, ConnectionSlot>,
    unacked: HashMap<u64, Unacked>,
    published: Vec<PublishedMessage>,
    next_connection_id: u64,
    next_delivery_tag: u64,
    dial_attempts: u32,
    failing_dials: u32,
    refuse_connections: bool,
    publish_budget: Option<u32>,
    last_dial: Option<DialOptions>,
    declare_gate: watch::Sender<bool>,
    held_declares: usize,
}

impl Default for BrokerState {
    fn default() -> Self {
        let exchanges = [
            ("", "direct"),
            ("amq.direct", "direct"),
            ("amq.fanout", "fanout"),
            ("amq.topic", "topic"),
        ]
        .into_iter()
        .map(|(name, kind)| (name.to_string(), kind.to_string()))
        .collect();

        Self {
            exchanges,
            queues: HashMap::new(),
            bindings: Vec::new(),
            connections: HashMap::new(),
            unacked: HashMap::new(),
            published: Vec::new(),
            next_connection_id: 1,
            next_delivery_tag: 1,
            dial_attempts: 0,
            failing_dials: 0,
            refuse_connections: false,
            publish_budget: None,
            last_dial: None,
            declare_gate: watch::channel(false).0,
            held_declares: 0,
        }
    }
}

type Shared = Arc<Mutex<BrokerState>>;

fn lock(shared: &Shared) -> MutexGuard<'_, BrokerState> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// AMQP topic pattern match: `*` is exactly one word, `#` zero or more
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&"*", rest)) => !key.is_empty() && matches(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && matches(rest, &key[1..]),
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

/// In-memory broker shared by every connection dialed through it
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Shared,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        lock(&self.state)
    }

    /// Fail the next `count` dials with a connection error
    pub fn fail_next_dials(&self, count: u32) {
        self.lock().failing_dials = count;
    }

    /// Refuse every dial until turned off
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.lock().refuse_connections = refuse;
    }

    /// Accept `count` more publishes, then reject the rest
    pub fn fail_publishes_after(&self, count: u32) {
        self.lock().publish_budget = Some(count);
    }

    pub fn allow_publishes(&self) {
        self.lock().publish_budget = None;
    }

    /// Make `declare_queue` wait while `hold` is true
    pub fn hold_queue_declares(&self, hold: bool) {
        self.lock().declare_gate.send_replace(hold);
    }

    /// Queue declarations currently waiting on [`MemoryBroker::hold_queue_declares`]
    pub fn held_queue_declares(&self) -> usize {
        self.lock().held_declares
    }

    /// Simulate the network dropping every open connection
    pub fn drop_connections(&self, reason: &str) {
        let mut state = self.lock();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            close_connection(&mut state, id, Some(reason));
        }
        dispatch_all(&self.state, &mut state);
    }

    /// Publish from outside any connection, as another service would
    pub fn inject(&self, exchange: &str, routing_key: &str, body: &[u8]) {
        let mut state = self.lock();
        route(&self.state, &mut state, exchange, routing_key, body);
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    pub fn published_to(&self, routing_key: &str) -> Vec<PublishedMessage> {
        self.lock()
            .published
            .iter()
            .filter(|m| m.routing_key == routing_key)
            .cloned()
            .collect()
    }

    /// Messages waiting in `queue`, not counting unacknowledged ones
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    pub fn unacked_count(&self, queue: &str) -> usize {
        self.lock()
            .unacked
            .values()
            .filter(|u| u.queue == queue)
            .count()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.len())
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.lock().exchanges.contains_key(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    pub fn is_bound(&self, queue: &str, exchange: &str, routing_key: &str) -> bool {
        self.lock().bindings.contains(&Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        })
    }

    pub fn dial_attempts(&self) -> u32 {
        self.lock().dial_attempts
    }

    pub fn live_connections(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn last_dial(&self) -> Option<DialOptions> {
        self.lock().last_dial.clone()
    }
}

/// Close a connection: fire or drop its notifier, detach consumers, requeue unacked
fn close_connection(state: &mut BrokerState, id: u64, error: Option<&str>) {
    let Some(mut slot) = state.connections.remove(&id) else {
        return;
    };
    slot.closed.store(true, Ordering::SeqCst);
    if let (Some(closer), Some(reason)) = (slot.closer.take(), error) {
        let _ = closer.send(TransportError::new(reason));
    }
    release_connection_resources(state, id);
}

fn release_connection_resources(state: &mut BrokerState, connection_id: u64) {
    for queue in state.queues.values_mut() {
        queue.consumers.retain(|c| c.connection_id != connection_id);
    }

    let mut tags: Vec<u64> = state
        .unacked
        .iter()
        .filter(|(_, u)| u.connection_id == connection_id)
        .map(|(tag, _)| *tag)
        .collect();
    tags.sort_unstable_by(|a, b| b.cmp(a));
    for tag in tags {
        if let Some(unacked) = state.unacked.remove(&tag) {
            requeue(state, unacked);
        }
    }
}

fn requeue(state: &mut BrokerState, unacked: Unacked) {
    if let Some(queue) = state.queues.get_mut(&unacked.queue) {
        queue.ready.push_front(StoredMessage {
            body: unacked.message.body,
            redelivered: true,
        });
    }
}

fn route(shared: &Shared, state: &mut BrokerState, exchange: &str, routing_key: &str, body: &[u8]) {
    let Some(kind) = state.exchanges.get(exchange).cloned() else {
        return;
    };

    let mut targets: Vec<String> = if exchange.is_empty() {
        vec![routing_key.to_string()]
    } else {
        state
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange)
            .filter(|b| match kind.as_str() {
                "topic" => topic_matches(&b.routing_key, routing_key),
                "direct" => b.routing_key == routing_key,
                "fanout" => true,
                _ => false,
            })
            .map(|b| b.queue.clone())
            .collect()
    };
    targets.sort();
    targets.dedup();

    for name in targets {
        if let Some(queue) = state.queues.get_mut(&name) {
            queue.ready.push_back(StoredMessage {
                body: body.to_vec(),
                redelivered: false,
            });
            dispatch(shared, state, &name);
        }
    }
}

fn dispatch_all(shared: &Shared, state: &mut BrokerState) {
    let names: Vec<String> = state.queues.keys().cloned().collect();
    for name in names {
        dispatch(shared, state, &name);
    }
}

/// Hand ready messages to consumers round-robin
fn dispatch(shared: &Shared, state: &mut BrokerState, queue_name: &str) {
    loop {
        let tag = state.next_delivery_tag;
        let Some(queue) = state.queues.get_mut(queue_name) else {
            return;
        };
        if queue.consumers.is_empty() {
            return;
        }
        let Some(message) = queue.ready.pop_front() else {
            return;
        };

        let index = queue.next_consumer % queue.consumers.len();
        let connection_id = queue.consumers[index].connection_id;
        let delivery = Delivery {
            body: message.body.clone(),
            delivery_tag: tag,
            redelivered: message.redelivered,
            acker: Box::new(MemoryAcker {
                state: Arc::clone(shared),
                delivery_tag: tag,
            }),
        };

        if queue.consumers[index].sender.send(Ok(delivery)).is_err() {
            queue.consumers.remove(index);
            queue.ready.push_front(message);
            continue;
        }
        queue.next_consumer = index + 1;

        state.next_delivery_tag += 1;
        state.unacked.insert(
            tag,
            Unacked {
                queue: queue_name.to_string(),
                connection_id,
                message,
            },
        );
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn dial(&self, options: &DialOptions) -> Result<Box<dyn Connection>, TransportError> {
        let mut state = self.lock();
        state.dial_attempts += 1;
        state.last_dial = Some(options.clone());

        if state.refuse_connections {
            return Err(TransportError::new("connection refused"));
        }
        if state.failing_dials > 0 {
            state.failing_dials -= 1;
            return Err(TransportError::new("connection refused"));
        }

        let id = state.next_connection_id;
        state.next_connection_id += 1;
        let (close_tx, close_rx) = oneshot::channel();
        let closed = Arc::new(AtomicBool::new(false));
        state.connections.insert(
            id,
            ConnectionSlot {
                closer: Some(close_tx),
                closed: Arc::clone(&closed),
            },
        );

        Ok(Box::new(MemoryConnection {
            id,
            state: Arc::clone(&self.state),
            closed,
            close_rx: Mutex::new(Some(close_rx)),
        }))
    }
}

struct MemoryConnection {
    id: u64,
    state: Shared,
    closed: Arc<AtomicBool>,
    close_rx: Mutex<Option<oneshot::Receiver<TransportError>>>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn open_channel(&self) -> Result<Box<dyn Channel>, TransportError> {
        if self.is_closed() {
            return Err(TransportError::new("connection is closed"));
        }
        Ok(Box::new(MemoryChannel {
            connection_id: self.id,
            state: Arc::clone(&self.state),
            connection_closed: Arc::clone(&self.closed),
            closed: AtomicBool::new(false),
        }))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn take_close_notification(&self) -> Option<oneshot::Receiver<TransportError>> {
        self.close_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::new("connection already closed"));
        }
        let mut state = lock(&self.state);
        close_connection(&mut state, self.id, None);
        dispatch_all(&self.state, &mut state);
        Ok(())
    }
}

struct MemoryChannel {
    connection_id: u64,
    state: Shared,
    connection_closed: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl MemoryChannel {
    fn open_state(&self) -> Result<MutexGuard<'_, BrokerState>, TransportError> {
        if self.connection_closed.load(Ordering::SeqCst) || self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::new("channel is closed"));
        }
        Ok(lock(&self.state))
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn set_prefetch(&self, _count: u16) -> Result<(), TransportError> {
        self.open_state().map(|_| ())
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: &str,
        _durable: bool,
    ) -> Result<(), TransportError> {
        let mut state = self.open_state()?;
        match state.exchanges.get(name) {
            Some(existing) if existing != kind => Err(TransportError::new(format!(
                "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{name}'"
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), kind.to_string());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str, _durable: bool) -> Result<String, TransportError> {
        let mut gate = {
            let mut state = lock(&self.state);
            let gate = state.declare_gate.subscribe();
            if *gate.borrow() {
                state.held_declares += 1;
                Some(gate)
            } else {
                None
            }
        };
        if let Some(gate) = gate.as_mut() {
            let _ = gate.wait_for(|held| !*held).await;
            lock(&self.state).held_declares -= 1;
        }

        let mut state = self.open_state()?;
        state.queues.entry(name.to_string()).or_default();
        Ok(name.to_string())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        let mut state = self.open_state()?;
        if !state.queues.contains_key(queue) {
            return Err(TransportError::new(format!("NOT_FOUND - no queue '{queue}'")));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(TransportError::new(format!(
                "NOT_FOUND - no exchange '{exchange}'"
            )));
        }
        let binding = Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, TransportError> {
        let mut state = self.open_state()?;
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let Some(slot) = state.queues.get_mut(queue) else {
            return Err(TransportError::new(format!("NOT_FOUND - no queue '{queue}'")));
        };
        slot.consumers.push(ConsumerSlot {
            tag: consumer_tag.to_string(),
            connection_id: self.connection_id,
            sender,
        });
        dispatch(&self.state, &mut state, queue);

        Ok(futures::stream::poll_fn(move |cx| receiver.poll_recv(cx)).boxed())
    }

    async fn cancel_consumer(&self, consumer_tag: &str) -> Result<(), TransportError> {
        let mut state = self.open_state()?;
        for queue in state.queues.values_mut() {
            queue.consumers.retain(|c| c.tag != consumer_tag);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), TransportError> {
        let mut state = self.open_state()?;
        if !state.exchanges.contains_key(exchange) {
            return Err(TransportError::new(format!(
                "NOT_FOUND - no exchange '{exchange}'"
            )));
        }
        match state.publish_budget {
            Some(0) => return Err(TransportError::new("publish rejected by broker")),
            Some(remaining) => state.publish_budget = Some(remaining - 1),
            None => {}
        }

        let body = message.body.clone();
        state.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            message,
        });
        route(&self.state, &mut state, exchange, routing_key, &body);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(TransportError::new("channel already closed"));
        }
        let mut state = lock(&self.state);
        release_connection_resources(&mut state, self.connection_id);
        dispatch_all(&self.state, &mut state);
        Ok(())
    }
}

struct MemoryAcker {
    state: Shared,
    delivery_tag: u64,
}

impl MemoryAcker {
    fn settle(&self, requeue_message: Option<bool>) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        let Some(unacked) = state.unacked.remove(&self.delivery_tag) else {
            return Err(TransportError::new(format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                self.delivery_tag
            )));
        };

        if requeue_message == Some(true) {
            let queue = unacked.queue.clone();
            requeue(&mut state, unacked);
            dispatch(&self.state, &mut state, &queue);
        }
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        self.settle(None)
    }

    async fn nack(&self, requeue: bool) -> Result<(), TransportError> {
        self.settle(Some(requeue))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn dial_options() -> DialOptions {
        DialOptions {
            url: "amqp://memory".to_string(),
            heartbeat: Duration::from_secs(10),
            connection_name: None,
        }
    }

    fn message(body: &str) -> OutboundMessage {
        OutboundMessage {
            body: body.as_bytes().to_vec(),
            content_type: "application/json".to_string(),
            message_id: "id".to_string(),
            kind: "test".to_string(),
            timestamp: 0,
            persistent: true,
        }
    }

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("user.created", "user.created"));
        assert!(!topic_matches("user.created", "user.deleted"));
        assert!(topic_matches("user.*", "user.created"));
        assert!(!topic_matches("user.*", "user.created.v2"));
        assert!(topic_matches("user.#", "user.created.v2"));
        assert!(topic_matches("user.#", "user"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("*.created", "order.created"));
        assert!(!topic_matches("*.created", "created"));
    }

    #[tokio::test]
    async fn test_publish_routes_to_bound_queue() {
        let broker = MemoryBroker::new();
        let connection = broker.dial(&dial_options()).await.unwrap();
        let channel = connection.open_channel().await.unwrap();

        channel.declare_queue("users", true).await.unwrap();
        channel
            .bind_queue("users", "amq.topic", "user.*")
            .await
            .unwrap();
        channel
            .publish("amq.topic", "user.created", message("{}"))
            .await
            .unwrap();
        channel
            .publish("amq.topic", "order.created", message("{}"))
            .await
            .unwrap();

        assert_eq!(broker.queue_depth("users"), 1);
        assert_eq!(broker.published().len(), 2);
    }

    #[tokio::test]
    async fn test_nack_requeues_with_redelivered_flag() {
        let broker = MemoryBroker::new();
        let connection = broker.dial(&dial_options()).await.unwrap();
        let channel = connection.open_channel().await.unwrap();
        channel.declare_queue("q", true).await.unwrap();
        channel.bind_queue("q", "amq.topic", "t").await.unwrap();
        let mut stream = channel.consume("q", "c1").await.unwrap();

        broker.inject("amq.topic", "t", b"hello");
        let first = stream.next().await.unwrap().unwrap();
        assert!(!first.redelivered);
        first.nack(true).await.unwrap();

        let second = stream.next().await.unwrap().unwrap();
        assert!(second.redelivered);
        assert_eq!(second.body, b"hello");
        second.ack().await.unwrap();

        assert_eq!(broker.unacked_count("q"), 0);
        assert_eq!(broker.queue_depth("q"), 0);
        assert!(second.ack().await.is_err());
    }

    #[tokio::test]
    async fn test_drop_connections_notifies_and_requeues() {
        let broker = MemoryBroker::new();
        let connection = broker.dial(&dial_options()).await.unwrap();
        let notification = connection.take_close_notification().unwrap();
        let channel = connection.open_channel().await.unwrap();
        channel.declare_queue("q", true).await.unwrap();
        channel.bind_queue("q", "amq.topic", "t").await.unwrap();
        let mut stream = channel.consume("q", "c1").await.unwrap();
        broker.inject("amq.topic", "t", b"pending");
        let _unacked = stream.next().await.unwrap().unwrap();

        broker.drop_connections("network down");

        assert_eq!(notification.await.unwrap().message(), "network down");
        assert!(connection.is_closed());
        assert!(stream.next().await.is_none());
        assert_eq!(broker.queue_depth("q"), 1);
        assert_eq!(broker.live_connections(), 0);
    }

    #[tokio::test]
    async fn test_graceful_close_drops_notifier() {
        let broker = MemoryBroker::new();
        let connection = broker.dial(&dial_options()).await.unwrap();
        let notification = connection.take_close_notification().unwrap();

        connection.close().await.unwrap();

        assert!(notification.await.is_err());
        assert!(connection.close().await.is_err());
    }

    #[tokio::test]
    async fn test_dial_failures() {
        let broker = MemoryBroker::new();
        broker.fail_next_dials(2);

        assert!(broker.dial(&dial_options()).await.is_err());
        assert!(broker.dial(&dial_options()).await.is_err());
        assert!(broker.dial(&dial_options()).await.is_ok());
        assert_eq!(broker.dial_attempts(), 3);
    }

    #[tokio::test]
    async fn test_publish_budget() {
        let broker = MemoryBroker::new();
        let connection = broker.dial(&dial_options()).await.unwrap();
        let channel = connection.open_channel().await.unwrap();
        broker.fail_publishes_after(1);

        assert!(channel.publish("amq.topic", "a", message("1")).await.is_ok());
        assert!(channel.publish("amq.topic", "a", message("2")).await.is_err());
        assert_eq!(broker.published().len(), 1);
    }
}
