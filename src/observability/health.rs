//! Health check HTTP server for container orchestration
//!
//! `/health` always answers 200 so a degraded broker never gets the service
//! restarted; the body says whether the broker is connected. `/ready` answers
//! 503 while an enabled broker is down.

use crate::broker::MessageBroker;
use crate::observability::metrics::BrokerMetrics;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use warp::http::StatusCode;
use warp::Filter;

/// HTTP health check server
pub struct HealthServer {
    service: String,
    port: u16,
    broker: Option<Arc<dyn MessageBroker>>,
    metrics: Arc<BrokerMetrics>,
    started: Instant,
}

impl HealthServer {
    /// Create new health server; `broker` is `None` when messaging is disabled
    pub fn new(
        service: impl Into<String>,
        port: u16,
        broker: Option<Arc<dyn MessageBroker>>,
        metrics: Arc<BrokerMetrics>,
    ) -> Self {
        Self {
            service: service.into(),
            port,
            broker,
            metrics,
            started: Instant::now(),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Routes served by [`HealthServer::start`]
    pub fn routes(
        self: &Arc<Self>,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        let server = Arc::clone(self);
        let with_server = warp::any().map(move || Arc::clone(&server));

        // GET /health - service status with broker details
        let health_route = warp::path("health")
            .and(warp::path::end())
            .and(warp::get())
            .and(with_server.clone())
            .map(|server: Arc<HealthServer>| warp::reply::json(&server.health_status()));

        // GET /ready - readiness probe
        let ready_route = warp::path("ready")
            .and(warp::path::end())
            .and(warp::get())
            .and(with_server.clone())
            .map(|server: Arc<HealthServer>| {
                let ready = server.is_ready();
                let status = if ready {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                warp::reply::with_status(
                    warp::reply::json(&ReadinessResponse {
                        ready,
                        timestamp: current_timestamp(),
                    }),
                    status,
                )
            });

        // GET /live - liveness probe
        let live_route = warp::path("live")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| {
                warp::reply::json(&LivenessResponse {
                    alive: true,
                    timestamp: current_timestamp(),
                })
            });

        // GET /metrics - broker counters
        let metrics_route = warp::path("metrics")
            .and(warp::path::end())
            .and(warp::get())
            .and(with_server)
            .map(|server: Arc<HealthServer>| warp::reply::json(&server.metrics.snapshot()));

        health_route.or(ready_route).or(live_route).or(metrics_route)
    }

    /// Serve until `shutdown` turns true
    pub async fn start(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), warp::Error> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let routes = self.routes();

        tracing::info!(port = self.port, "Starting health server");
        let (bound, server) =
            warp::serve(routes).try_bind_with_graceful_shutdown(addr, async move {
                while !*shutdown.borrow_and_update() {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                }
            })?;
        tracing::debug!(%bound, "Health server listening");
        server.await;
        tracing::info!("Health server stopped");
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.broker
            .as_ref()
            .map_or(true, |broker| broker.health().is_ok())
    }

    pub fn health_status(&self) -> HealthStatus {
        let broker = match &self.broker {
            None => BrokerHealth {
                enabled: false,
                state: "disabled".to_string(),
                error: None,
            },
            Some(broker) => BrokerHealth {
                enabled: true,
                state: broker.state().label().to_string(),
                error: broker.health().err().map(|e| e.to_string()),
            },
        };

        let status = if broker.enabled && broker.error.is_none() {
            "healthy"
        } else {
            "degraded"
        };

        HealthStatus {
            status: status.to_string(),
            service: self.service.clone(),
            timestamp: current_timestamp(),
            uptime_seconds: self.started.elapsed().as_secs(),
            broker,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub service: String,
    pub timestamp: u64,
    pub uptime_seconds: u64,
    pub broker: BrokerHealth,
}

#[derive(Debug, Clone, Serialize)]
pub struct BrokerHealth {
    pub enabled: bool,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockBroker;
    use serde_json::Value;

    fn server(broker: Option<Arc<dyn MessageBroker>>) -> Arc<HealthServer> {
        Arc::new(HealthServer::new(
            "user-service",
            8080,
            broker,
            Arc::new(BrokerMetrics::new()),
        ))
    }

    async fn get(server: &Arc<HealthServer>, path: &str) -> (StatusCode, Value) {
        let response = warp::test::request()
            .method("GET")
            .path(path)
            .reply(&server.routes())
            .await;
        let body = serde_json::from_slice(response.body()).unwrap();
        (response.status(), body)
    }

    #[tokio::test]
    async fn test_health_connected_broker() {
        let server = server(Some(Arc::new(MockBroker::new())));

        let (status, body) = get(&server, "/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"], "user-service");
        assert_eq!(body["broker"]["state"], "connected");
        assert!(body["broker"].get("error").is_none());
    }

    #[tokio::test]
    async fn test_health_degraded_is_still_ok() {
        let server = server(Some(Arc::new(MockBroker::with_failure())));

        let (status, body) = get(&server, "/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["broker"]["state"], "disconnected");
        assert!(body["broker"]["error"]
            .as_str()
            .unwrap()
            .contains("Not connected"));
    }

    #[tokio::test]
    async fn test_health_without_broker() {
        let server = server(None);

        let (status, body) = get(&server, "/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["broker"]["enabled"], false);
        assert_eq!(body["broker"]["state"], "disabled");
    }

    #[tokio::test]
    async fn test_ready_follows_broker_health() {
        let up = server(Some(Arc::new(MockBroker::new())));
        let down = server(Some(Arc::new(MockBroker::with_failure())));
        let disabled = server(None);

        assert_eq!(get(&up, "/ready").await.0, StatusCode::OK);
        assert_eq!(get(&down, "/ready").await.0, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(get(&disabled, "/ready").await.0, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_live_and_metrics() {
        let server = server(None);
        server.metrics.record_publish(true);

        let (status, live) = get(&server, "/live").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(live["alive"], true);

        let (status, metrics) = get(&server, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(metrics["messages_published"], 1);
    }

    #[tokio::test]
    async fn test_unknown_path_is_rejected() {
        let server = server(None);

        let response = warp::test::request()
            .method("GET")
            .path("/nope")
            .reply(&server.routes())
            .await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
