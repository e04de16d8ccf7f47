//! Fail-fast guard for a named category of remote operations.
//!
//! ```text
//! CLOSED --(failures >= threshold)--> OPEN --(cooldown elapsed)--> HALF_OPEN
//!   ^                                   ^                              |
//!   +------------(success)--------------+---------(failure)------------+
//! ```
//!
//! The call that observes an elapsed cooldown only arms the probe: it flips the
//! state to HALF_OPEN and returns [`CircuitOutcome::ProbeArmed`] without running
//! the operation. The next caller's operation is the actual trial.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{QueueError, SyncError};
use crate::UnixTimeMs;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub name: String,
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Cooldown spent OPEN before a probe is allowed.
    pub timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "sync".to_string(),
            failure_threshold: 5,
            timeout_ms: 60_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.name.trim().is_empty() {
            return Err(QueueError::Config("circuit_breaker.name is empty".into()));
        }
        if self.failure_threshold == 0 {
            return Err(QueueError::Config(
                "circuit_breaker.failure_threshold must be > 0".into(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(QueueError::Config(
                "circuit_breaker.timeout_ms must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a call that was not fast-failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitOutcome<T> {
    /// The operation ran and succeeded.
    Executed(T),
    /// The cooldown had elapsed; this call moved the circuit to HALF_OPEN and
    /// did not run the operation.
    ProbeArmed,
}

impl<T> CircuitOutcome<T> {
    pub fn into_executed(self) -> Option<T> {
        match self {
            CircuitOutcome::Executed(value) => Some(value),
            CircuitOutcome::ProbeArmed => None,
        }
    }

    pub fn is_probe_armed(&self) -> bool {
        matches!(self, CircuitOutcome::ProbeArmed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitStatus {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u64,
    pub total_requests: u64,
    pub last_failure_at: Option<UnixTimeMs>,
    /// Time left until an OPEN circuit accepts a probe.
    pub retry_in_ms: Option<u64>,
    pub healthy: bool,
}

// `next_attempt` exists only while OPEN.
#[derive(Debug, Clone, Copy)]
enum Phase {
    Closed,
    Open { next_attempt: Instant },
    HalfOpen,
}

impl Phase {
    fn state(&self) -> CircuitState {
        match self {
            Phase::Closed => CircuitState::Closed,
            Phase::Open { .. } => CircuitState::Open,
            Phase::HalfOpen => CircuitState::HalfOpen,
        }
    }
}

#[derive(Debug)]
struct Inner {
    phase: Phase,
    failure_count: u32,
    success_count: u64,
    total_requests: u64,
    last_failure_at: Option<UnixTimeMs>,
}

impl Inner {
    fn new() -> Self {
        Self {
            phase: Phase::Closed,
            failure_count: 0,
            success_count: 0,
            total_requests: 0,
            last_failure_at: None,
        }
    }
}

enum Gate {
    Run,
    Reject(u64),
    Probe,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    // Never held across an await.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> CircuitState {
        self.lock().phase.state()
    }

    fn admit(&self, operation_name: &str) -> Gate {
        let mut inner = self.lock();
        inner.total_requests += 1;

        match inner.phase {
            Phase::Open { next_attempt } => {
                let now = Instant::now();
                if now < next_attempt {
                    Gate::Reject(duration_ms(next_attempt - now))
                } else {
                    inner.phase = Phase::HalfOpen;
                    info!(
                        circuit = %self.config.name,
                        operation = operation_name,
                        "circuit half-open, next call is the probe"
                    );
                    Gate::Probe
                }
            }
            Phase::Closed | Phase::HalfOpen => Gate::Run,
        }
    }

    pub async fn execute<F, Fut, T>(
        &self,
        operation_name: &str,
        operation: F,
    ) -> Result<CircuitOutcome<T>, SyncError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        match self.admit(operation_name) {
            Gate::Reject(retry_in_ms) => {
                debug!(
                    circuit = %self.config.name,
                    operation = operation_name,
                    retry_in_ms,
                    "circuit open, failing fast"
                );
                return Err(SyncError::CircuitOpen {
                    name: self.config.name.clone(),
                    retry_in_ms,
                });
            }
            Gate::Probe => return Ok(CircuitOutcome::ProbeArmed),
            Gate::Run => {}
        }

        let started = Instant::now();
        let result = operation().await;
        let elapsed_ms = duration_ms(started.elapsed());

        match result {
            Ok(value) => {
                self.on_success(operation_name, elapsed_ms);
                Ok(CircuitOutcome::Executed(value))
            }
            Err(err) => {
                self.on_failure(operation_name, elapsed_ms, &err);
                Err(err)
            }
        }
    }

    fn on_success(&self, operation_name: &str, elapsed_ms: u64) {
        let mut inner = self.lock();
        inner.success_count += 1;
        inner.failure_count = 0;
        if matches!(inner.phase, Phase::HalfOpen) {
            inner.phase = Phase::Closed;
            info!(
                circuit = %self.config.name,
                operation = operation_name,
                elapsed_ms,
                "circuit closed after successful probe"
            );
        } else {
            debug!(
                circuit = %self.config.name,
                operation = operation_name,
                elapsed_ms,
                "operation succeeded"
            );
        }
    }

    fn on_failure(&self, operation_name: &str, elapsed_ms: u64, error: &SyncError) {
        let mut inner = self.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure_at = Some(UnixTimeMs::now());

        if inner.failure_count >= self.config.failure_threshold {
            inner.phase = Phase::Open {
                next_attempt: Instant::now() + Duration::from_millis(self.config.timeout_ms),
            };
            warn!(
                circuit = %self.config.name,
                operation = operation_name,
                failures = inner.failure_count,
                cooldown_ms = self.config.timeout_ms,
                error = %error,
                "circuit opened"
            );
        } else {
            debug!(
                circuit = %self.config.name,
                operation = operation_name,
                elapsed_ms,
                failures = inner.failure_count,
                error = %error,
                "operation failed"
            );
        }
    }

    pub fn status(&self) -> CircuitStatus {
        let inner = self.lock();
        let state = inner.phase.state();
        let retry_in_ms = match inner.phase {
            Phase::Open { next_attempt } => {
                Some(duration_ms(next_attempt.saturating_duration_since(Instant::now())))
            }
            Phase::Closed | Phase::HalfOpen => None,
        };
        CircuitStatus {
            name: self.config.name.clone(),
            state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            total_requests: inner.total_requests,
            last_failure_at: inner.last_failure_at,
            retry_in_ms,
            healthy: state == CircuitState::Closed,
        }
    }

    /// Forces CLOSED with zeroed counters.
    pub fn reset(&self) {
        *self.lock() = Inner::new();
        info!(circuit = %self.config.name, "circuit reset");
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
