//! Thread-safe broker metrics
//!
//! Atomic counters shared between the broker client, its consumer tasks and
//! the health endpoint. A collector is created by the caller and injected
//! into the client.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Counters for broker activity
#[derive(Debug, Default)]
pub struct BrokerMetrics {
    connected: AtomicBool,
    connections_established: AtomicU64,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    deliveries_received: AtomicU64,
    deliveries_acked: AtomicU64,
    deliveries_requeued: AtomicU64,
    ack_failures: AtomicU64,
    disconnects: AtomicU64,
    reconnect_attempts: AtomicU64,
    reconnects: AtomicU64,
    reconnect_give_ups: AtomicU64,
    last_connected_at: AtomicU64,
}

impl BrokerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a session being installed and marked connected
    pub fn record_connected(&self) {
        self.connected.store(true, Ordering::Relaxed);
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.last_connected_at
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn record_disconnect(&self) {
        self.connected.store(false, Ordering::Relaxed);
        self.disconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_closed(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }

    pub fn record_publish(&self, success: bool) {
        if success {
            self.messages_published.fetch_add(1, Ordering::Relaxed);
        } else {
            self.publish_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_delivery(&self) {
        self.deliveries_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ack(&self) {
        self.deliveries_acked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_requeue(&self) {
        self.deliveries_requeued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ack_failure(&self) {
        self.ack_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_give_up(&self) {
        self.reconnect_give_ups.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: current_timestamp(),
            connected: self.connected.load(Ordering::Relaxed),
            connections_established: self.connections_established.load(Ordering::Relaxed),
            messages_published: self.messages_published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            deliveries_received: self.deliveries_received.load(Ordering::Relaxed),
            deliveries_acked: self.deliveries_acked.load(Ordering::Relaxed),
            deliveries_requeued: self.deliveries_requeued.load(Ordering::Relaxed),
            ack_failures: self.ack_failures.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            reconnect_give_ups: self.reconnect_give_ups.load(Ordering::Relaxed),
            last_connected_at: match self.last_connected_at.load(Ordering::Relaxed) {
                0 => None,
                ts => Some(ts),
            },
        }
    }
}

/// Serializable view of [`BrokerMetrics`]
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricsSnapshot {
    pub timestamp: u64,
    pub connected: bool,
    pub connections_established: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub deliveries_received: u64,
    pub deliveries_acked: u64,
    pub deliveries_requeued: u64,
    pub ack_failures: u64,
    pub disconnects: u64,
    pub reconnect_attempts: u64,
    pub reconnects: u64,
    pub reconnect_give_ups: u64,
    pub last_connected_at: Option<u64>,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
