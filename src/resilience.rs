//! Live-sync call path: coalesce, then circuit-break, then retry.
//!
//! Only in-memory state lives here. Requests that must survive a restart go
//! through [`crate::queue::PersistentRequestQueue`] instead, which runs its own
//! backoff loop.

use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tracing::info;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitOutcome, CircuitStatus};
use crate::config::SyncConfig;
use crate::debounce::{DebounceConfig, DebounceOutcome, DebounceQueue, DebounceStats, FlushResult, Pending};
use crate::error::{ErrorClassifier, SyncError};
use crate::retry::{RetryConfig, RetryExecutor, RetryMetricsSnapshot};

pub type SyncOutcome<T> = DebounceOutcome<CircuitOutcome<T>>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResilienceStatus {
    pub retry: RetryMetricsSnapshot,
    pub circuit: CircuitStatus,
    pub queue: DebounceStats,
}

pub struct SyncResilience<T> {
    retry: RetryExecutor,
    breaker: Arc<CircuitBreaker>,
    queue: DebounceQueue<CircuitOutcome<T>>,
}

impl<T> Clone for SyncResilience<T> {
    fn clone(&self) -> Self {
        Self {
            retry: self.retry.clone(),
            breaker: Arc::clone(&self.breaker),
            queue: self.queue.clone(),
        }
    }
}

impl<T: Send + 'static> SyncResilience<T> {
    pub fn new(
        retry: RetryConfig,
        circuit_breaker: CircuitBreakerConfig,
        debounce: DebounceConfig,
    ) -> Self {
        Self {
            retry: RetryExecutor::new(circuit_breaker.name.clone(), retry),
            breaker: Arc::new(CircuitBreaker::new(circuit_breaker)),
            queue: DebounceQueue::new(debounce),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(
            config.retry.clone(),
            config.circuit_breaker.clone(),
            config.debounce.clone(),
        )
    }

    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.retry = self.retry.with_classifier(classifier);
        self
    }

    /// Coalesces under `operation_type`; when the key's window closes the
    /// surviving call runs through the circuit breaker and the retry loop.
    pub fn enqueue<F, Fut, D>(
        &self,
        operation_type: impl Into<String>,
        operation: F,
        data: D,
    ) -> Pending<CircuitOutcome<T>>
    where
        F: Fn(D) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
        D: Clone + Send + Sync + 'static,
    {
        let operation_type = operation_type.into();
        let operation_name = operation_type.clone();
        let retry = self.retry.clone();
        let breaker = Arc::clone(&self.breaker);

        self.queue.enqueue(
            operation_type,
            move |data: D| async move {
                breaker
                    .execute(&operation_name, || {
                        retry.execute(|| operation(data.clone()))
                    })
                    .await
            },
            data,
        )
    }

    /// Circuit breaker and retry without coalescing, for callers that need
    /// the result of this exact call.
    pub async fn execute<F, Fut, U>(
        &self,
        operation_name: &str,
        operation: F,
    ) -> Result<CircuitOutcome<U>, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<U, SyncError>>,
    {
        self.breaker
            .execute(operation_name, || self.retry.execute(operation))
            .await
    }

    pub async fn flush(&self) -> Vec<FlushResult> {
        self.queue.flush().await
    }

    pub fn status(&self) -> ResilienceStatus {
        ResilienceStatus {
            retry: self.retry.metrics(),
            circuit: self.breaker.status(),
            queue: self.queue.stats(),
        }
    }

    /// Zeroes retry metrics, closes the circuit, and cancels queued items.
    pub fn reset(&self) {
        self.retry.reset_metrics();
        self.breaker.reset();
        self.queue.clear();
        self.queue.reset_stats();
        info!(name = %self.breaker.name(), "resilience stack reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn stack(threshold: u32, attempts: u32) -> SyncResilience<String> {
        SyncResilience::new(
            RetryConfig {
                max_attempts: attempts,
                base_delay_ms: 100,
                max_delay_ms: 1_000,
                jitter_factor: 0.25,
            },
            CircuitBreakerConfig {
                name: "envelopes".into(),
                failure_threshold: threshold,
                timeout_ms: 60_000,
            },
            DebounceConfig {
                name: "envelopes".into(),
                debounce_ms: 500,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn enqueued_operation_is_retried_until_success() {
        let resilience = stack(5, 3);
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        let outcome = resilience
            .enqueue(
                "push",
                move |id: String| {
                    let counter = Arc::clone(&counter);
                    async move {
                        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                            Err(SyncError::network("reset"))
                        } else {
                            Ok(format!("pushed {id}"))
                        }
                    }
                },
                "env-1".to_string(),
            )
            .await;

        assert_eq!(
            outcome,
            DebounceOutcome::Completed(CircuitOutcome::Executed("pushed env-1".to_string()))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let status = resilience.status();
        assert_eq!(status.retry.total_retries, 1);
        assert_eq!(status.circuit.state, CircuitState::Closed);
        assert_eq!(status.queue.processed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_fails_fast_through_the_queue() {
        let resilience = stack(1, 1);
        let calls = Arc::new(AtomicUsize::new(0));

        let op = {
            let calls = Arc::clone(&calls);
            move |_: ()| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<String, _>(SyncError::http(503, "down"))
                }
            }
        };

        let first = resilience.enqueue("push", op.clone(), ()).await;
        assert_eq!(
            first,
            DebounceOutcome::Failed(SyncError::http(503, "down"))
        );

        let second = resilience.enqueue("push", op, ()).await;
        match second {
            DebounceOutcome::Failed(err) => assert!(err.is_circuit_open()),
            other => panic!("expected circuit open, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn execute_bypasses_coalescing() {
        let resilience = stack(5, 3);
        let outcome = resilience
            .execute("pull", || async { Ok::<_, SyncError>(3u8) })
            .await
            .unwrap();
        assert_eq!(outcome, CircuitOutcome::Executed(3));
        assert_eq!(resilience.status().queue.enqueued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_clears_every_layer() {
        let resilience = stack(1, 1);
        let _ = resilience
            .execute("pull", || async { Err::<(), _>(SyncError::timeout(5)) })
            .await;
        let pending = resilience.enqueue(
            "push",
            |_: ()| async { Ok("never".to_string()) },
            (),
        );

        resilience.reset();

        assert!(pending.await.is_cancelled());
        let status = resilience.status();
        assert_eq!(status.circuit.state, CircuitState::Closed);
        assert_eq!(status.retry.total_operations, 0);
        assert_eq!(status.queue, DebounceStats::default());
    }
}
