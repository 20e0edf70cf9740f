//! Per-subscription consumer loop
//!
//! One task per subscription reads deliveries from its queue, looks up the
//! handler in the registry and settles every delivery: ack on success, nack
//! with requeue on handler failure or when the subscription is gone.
//! Deliveries still buffered when a subscription is cancelled go through the
//! same path and are requeued.

use super::connection::Session;
use super::registry::SubscriptionRegistry;
use super::supervisor::wait_for_signal;
use super::transport::{Delivery, DeliveryStream};
use super::DeliveryContext;
use crate::error::BrokerError;
use crate::observability::BrokerMetrics;
use futures::{FutureExt, StreamExt};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Instrument};

/// Everything a consumer task needs, moved into the task
pub struct ConsumerTask {
    pub topic: String,
    pub generation: u64,
    pub consumer_tag: String,
    pub session: Arc<Session>,
    pub registry: Arc<SubscriptionRegistry>,
    pub metrics: Arc<BrokerMetrics>,
    pub cancel_rx: watch::Receiver<bool>,
    pub shutdown_rx: watch::Receiver<bool>,
}

/// Why a consumer loop stopped
#[derive(Debug, Clone, PartialEq)]
pub enum ExitReason {
    Cancelled,
    Shutdown,
    StreamEnded,
    StreamFailed(String),
}

impl ConsumerTask {
    pub async fn run(self, stream: DeliveryStream) -> ExitReason {
        let span = crate::consumer_span!(
            topic = %self.topic,
            consumer_tag = %self.consumer_tag,
            session_id = self.session.id()
        );
        self.run_loop(stream).instrument(span).await
    }

    async fn run_loop(self, mut stream: DeliveryStream) -> ExitReason {
        debug!("Consumer loop started");
        let mut cancel_rx = self.cancel_rx.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();

        let reason = loop {
            tokio::select! {
                biased;

                _ = wait_for_signal(&mut cancel_rx) => break ExitReason::Cancelled,
                _ = wait_for_signal(&mut shutdown_rx) => break ExitReason::Shutdown,
                next = stream.next() => match next {
                    Some(Ok(delivery)) => self.process(delivery).await,
                    Some(Err(e)) => break ExitReason::StreamFailed(e.to_string()),
                    None => break ExitReason::StreamEnded,
                },
            }
        };

        match &reason {
            ExitReason::Cancelled => {
                if let Err(e) = self
                    .session
                    .channel()
                    .cancel_consumer(&self.consumer_tag)
                    .await
                {
                    debug!(error = %e, "Consumer cancel failed, ignoring");
                }
                let released = self.release_buffered(&mut stream).await;
                info!(released, "Consumer stopped after unsubscribe");
            }
            ExitReason::Shutdown => debug!("Consumer stopped for shutdown"),
            ExitReason::StreamEnded => info!("Delivery stream ended"),
            ExitReason::StreamFailed(e) => warn!(error = %e, "Delivery stream failed"),
        }
        reason
    }

    /// Settle deliveries already handed to this consumer but not yet processed
    ///
    /// Without a live subscription they are requeued for the next consumer.
    async fn release_buffered(&self, stream: &mut DeliveryStream) -> usize {
        let mut released = 0;
        while let Some(Some(Ok(delivery))) = stream.next().now_or_never() {
            self.process(delivery).await;
            released += 1;
        }
        released
    }

    async fn process(&self, delivery: Delivery) {
        self.metrics.record_delivery();
        let context = DeliveryContext {
            topic: self.topic.clone(),
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
        };

        let Some(handler) = self.registry.handler_for(&self.topic, self.generation) else {
            debug!(
                delivery_tag = delivery.delivery_tag,
                "No active subscription for delivery, requeueing"
            );
            self.settle(&delivery, false).await;
            return;
        };

        match handler.handle(&context, &delivery.body).await {
            Ok(()) => self.settle(&delivery, true).await,
            Err(e) => {
                warn!(
                    delivery_tag = delivery.delivery_tag,
                    redelivered = delivery.redelivered,
                    error = %e,
                    "Handler failed, requeueing message"
                );
                self.settle(&delivery, false).await;
            }
        }
    }

    /// Ack when `success`, otherwise nack with requeue
    async fn settle(&self, delivery: &Delivery, success: bool) {
        let result = if success {
            delivery.ack().await
        } else {
            delivery.nack(true).await
        };

        match result {
            Ok(()) if success => self.metrics.record_ack(),
            Ok(()) => self.metrics.record_requeue(),
            Err(source) => {
                self.metrics.record_ack_failure();
                let error = BrokerError::Acknowledgment {
                    delivery_tag: delivery.delivery_tag,
                    source,
                };
                error!(error = %error, "Failed to settle delivery");
            }
        }
    }
}
