//! Reconnection supervisor
//!
//! Pure decision logic ([`ReconnectPolicy::decide`]) plus the retry loop that
//! drives it. The loop sleeps the configured delay before every attempt and
//! stops early when the shutdown signal fires.

use crate::error::{BrokerError, BrokerResult};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Reconnection limits
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    /// Fixed delay before each attempt
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            delay: Duration::from_secs(5),
        }
    }
}

impl ReconnectPolicy {
    /// Decide whether another attempt should be made after `attempts_made` failures
    pub fn decide(&self, attempts_made: u32, shutdown_requested: bool) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }
        if attempts_made >= self.max_attempts {
            return ReconnectionDecision::AbortMaxAttemptsExceeded;
        }
        ReconnectionDecision::Proceed {
            attempt: attempts_made + 1,
            delay: self.delay,
        }
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    Proceed { attempt: u32, delay: Duration },
    AbortShutdownRequested,
    AbortMaxAttemptsExceeded,
}

/// How a supervisor run ended
#[derive(Debug)]
pub enum SupervisorOutcome<T> {
    Reconnected { attempt: u32, value: T },
    GaveUp { attempts: u32, last_error: Option<BrokerError> },
    ShutdownRequested,
}

/// Runs reconnection attempts until one succeeds, the policy gives up or shutdown fires
pub struct ReconnectionSupervisor {
    policy: ReconnectPolicy,
}

impl ReconnectionSupervisor {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy }
    }

    /// Drive `attempt_fn` with attempt numbers starting at 1
    ///
    /// An attempt returning [`BrokerError::Closed`] ends the run as a shutdown.
    pub async fn run<T, F, Fut>(
        &self,
        shutdown_rx: watch::Receiver<bool>,
        mut attempt_fn: F,
    ) -> SupervisorOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = BrokerResult<T>>,
    {
        let mut attempts_made = 0;
        let mut last_error = None;

        loop {
            let decision = self.policy.decide(attempts_made, *shutdown_rx.borrow());
            match decision {
                ReconnectionDecision::Proceed { attempt, delay } => {
                    info!(
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Attempting reconnection after delay"
                    );

                    if !interruptible_sleep(shutdown_rx.clone(), delay).await {
                        return SupervisorOutcome::ShutdownRequested;
                    }

                    match attempt_fn(attempt).await {
                        Ok(value) => return SupervisorOutcome::Reconnected { attempt, value },
                        Err(BrokerError::Closed) => return SupervisorOutcome::ShutdownRequested,
                        Err(e) => {
                            warn!(attempt, error = %e, "Reconnection attempt failed");
                            attempts_made = attempt;
                            last_error = Some(e);
                        }
                    }
                }
                ReconnectionDecision::AbortShutdownRequested => {
                    return SupervisorOutcome::ShutdownRequested;
                }
                ReconnectionDecision::AbortMaxAttemptsExceeded => {
                    return SupervisorOutcome::GaveUp {
                        attempts: attempts_made,
                        last_error,
                    };
                }
            }
        }
    }
}

/// Sleep for `delay` unless shutdown is requested first
///
/// Returns true if the sleep completed, false if shutdown was requested.
pub async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay: Duration) -> bool {
    if *shutdown_rx.borrow() {
        return false;
    }
    tokio::select! {
        _ = wait_for_signal(&mut shutdown_rx) => {
            info!("Shutdown signal received during reconnection delay, stopping");
            false
        }
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Resolve once the flag is set or its sender is dropped
pub async fn wait_for_signal(signal_rx: &mut watch::Receiver<bool>) {
    loop {
        if *signal_rx.borrow_and_update() {
            return;
        }
        if signal_rx.changed().await.is_err() {
            return;
        }
    }
}
