//! Bounded retries with exponential backoff and jitter.
//!
//! [`RetryExecutor`] runs one async operation up to `max_attempts` times,
//! classifying every failure through [`ErrorClassifier`] and sleeping
//! `min(base * 2^(n-1), cap)` (jittered) between attempt `n` and `n + 1`.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{ErrorClass, ErrorClassifier, QueueError, SyncError};

/// Largest exponent applied to the base delay; beyond it every realistic cap
/// has already been reached.
const MAX_BACKOFF_EXPONENT: u32 = 20;

/// `min(base * 2^(attempt - 1), cap)` in milliseconds. `attempt` is 1-based;
/// attempt 0 is treated as 1.
pub fn backoff_delay(attempt: u32, base_ms: u64, cap_ms: u64) -> u64 {
    let exponent = attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
    base_ms.saturating_mul(1u64 << exponent).min(cap_ms)
}

/// Spreads `delay_ms` uniformly over `±factor` of itself.
pub fn apply_jitter(delay_ms: u64, factor: f64) -> u64 {
    let factor = factor.clamp(0.0, 1.0);
    if factor == 0.0 || delay_ms == 0 {
        return delay_ms;
    }
    let offset = rand::thread_rng().gen_range(-factor..=factor);
    let jittered = delay_ms as f64 * (1.0 + offset);
    jittered.round().max(0.0) as u64
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Relative jitter applied to each delay, 0.25 = ±25%.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter_factor: 0.25,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.max_attempts == 0 {
            return Err(QueueError::Config("retry.max_attempts must be > 0".into()));
        }
        if self.base_delay_ms == 0 {
            return Err(QueueError::Config("retry.base_delay_ms must be > 0".into()));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(QueueError::Config(
                "retry.max_delay_ms must be >= base_delay_ms".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(QueueError::Config(
                "retry.jitter_factor must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }

    /// Un-jittered delay slept after failed attempt `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        Duration::from_millis(backoff_delay(
            attempt,
            self.base_delay_ms,
            self.max_delay_ms,
        ))
    }
}

// ============================================================================
// Metrics
// ============================================================================

#[derive(Debug, Default)]
pub struct RetryMetrics {
    total_operations: AtomicU64,
    successful_operations: AtomicU64,
    retried_operations: AtomicU64,
    total_retries: AtomicU64,
    errors_by_class: Mutex<BTreeMap<ErrorClass, u64>>,
}

impl RetryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_error(&self, class: ErrorClass) {
        let mut errors = self
            .errors_by_class
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *errors.entry(class).or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> RetryMetricsSnapshot {
        RetryMetricsSnapshot {
            total_operations: self.total_operations.load(Ordering::Relaxed),
            successful_operations: self.successful_operations.load(Ordering::Relaxed),
            retried_operations: self.retried_operations.load(Ordering::Relaxed),
            total_retries: self.total_retries.load(Ordering::Relaxed),
            errors_by_class: self
                .errors_by_class
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }

    pub fn reset(&self) {
        self.total_operations.store(0, Ordering::Relaxed);
        self.successful_operations.store(0, Ordering::Relaxed);
        self.retried_operations.store(0, Ordering::Relaxed);
        self.total_retries.store(0, Ordering::Relaxed);
        self.errors_by_class
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetryMetricsSnapshot {
    pub total_operations: u64,
    pub successful_operations: u64,
    pub retried_operations: u64,
    pub total_retries: u64,
    pub errors_by_class: BTreeMap<ErrorClass, u64>,
}

impl RetryMetricsSnapshot {
    pub fn average_retries(&self) -> f64 {
        ratio(self.total_retries, self.total_operations)
    }

    pub fn success_rate(&self) -> f64 {
        ratio(self.successful_operations, self.total_operations)
    }

    pub fn retry_rate(&self) -> f64 {
        ratio(self.retried_operations, self.total_operations)
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

// ============================================================================
// Executor
// ============================================================================

/// Cheap to clone; clones share one metrics instance.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    name: String,
    config: RetryConfig,
    classifier: ErrorClassifier,
    metrics: Arc<RetryMetrics>,
}

impl RetryExecutor {
    pub fn new(name: impl Into<String>, config: RetryConfig) -> Self {
        Self {
            name: name.into(),
            config,
            classifier: ErrorClassifier::default(),
            metrics: Arc::new(RetryMetrics::new()),
        }
    }

    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn metrics(&self) -> RetryMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }

    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        self.execute_with(&self.config, operation).await
    }

    /// Like [`execute`](Self::execute) with a per-call policy.
    pub async fn execute_with<F, Fut, T>(
        &self,
        config: &RetryConfig,
        mut operation: F,
    ) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        self.metrics.total_operations.fetch_add(1, Ordering::Relaxed);
        let max_attempts = config.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match operation().await {
                Ok(value) => {
                    self.metrics
                        .successful_operations
                        .fetch_add(1, Ordering::Relaxed);
                    if attempt > 1 {
                        self.metrics.retried_operations.fetch_add(1, Ordering::Relaxed);
                        debug!(retrier = %self.name, attempt, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    let class = self.classifier.classify(&err);
                    self.metrics.record_error(class);

                    if !class.is_retryable() || attempt >= max_attempts {
                        if attempt > 1 {
                            self.metrics.retried_operations.fetch_add(1, Ordering::Relaxed);
                        }
                        warn!(
                            retrier = %self.name,
                            attempt,
                            max_attempts,
                            error_class = %class,
                            error = %err,
                            "operation failed, giving up"
                        );
                        return Err(err);
                    }

                    let delay = apply_jitter(
                        backoff_delay(attempt, config.base_delay_ms, config.max_delay_ms),
                        config.jitter_factor,
                    );
                    warn!(
                        retrier = %self.name,
                        attempt,
                        max_attempts,
                        error_class = %class,
                        delay_ms = delay,
                        error = %err,
                        "operation failed, retrying"
                    );
                    self.metrics.total_retries.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay_ms: 10,
            max_delay_ms: 100,
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn backoff_doubles_then_caps() {
        assert_eq!(backoff_delay(1, 1_000, 30_000), 1_000);
        assert_eq!(backoff_delay(2, 1_000, 30_000), 2_000);
        assert_eq!(backoff_delay(5, 1_000, 30_000), 16_000);
        assert_eq!(backoff_delay(8, 1_000, 30_000), 30_000);
        assert_eq!(backoff_delay(0, 1_000, 30_000), 1_000);
        assert_eq!(backoff_delay(u32::MAX, 1_000, 30_000), 30_000);
    }

    #[test]
    fn zero_jitter_is_identity() {
        assert_eq!(apply_jitter(1_000, 0.0), 1_000);
        assert_eq!(apply_jitter(0, 0.25), 0);
    }

    proptest! {
        #[test]
        fn backoff_never_exceeds_cap(attempt in 0u32..200, base in 1u64..10_000, cap in 1u64..100_000) {
            prop_assert!(backoff_delay(attempt, base, cap) <= cap);
        }

        #[test]
        fn backoff_is_monotonic(attempt in 1u32..64) {
            prop_assert!(backoff_delay(attempt, 1_000, 30_000) <= backoff_delay(attempt + 1, 1_000, 30_000));
        }

        #[test]
        fn jitter_stays_within_quarter(delay in 1u64..1_000_000) {
            let jittered = apply_jitter(delay, 0.25) as f64;
            let d = delay as f64;
            prop_assert!(jittered >= (d * 0.75).floor());
            prop_assert!(jittered <= (d * 1.25).ceil());
        }
    }

    #[test]
    fn config_validation() {
        assert!(RetryConfig::default().validate().is_ok());
        assert!(RetryConfig { max_attempts: 0, ..Default::default() }.validate().is_err());
        assert!(RetryConfig { jitter_factor: 1.5, ..Default::default() }.validate().is_err());
        assert!(RetryConfig { max_delay_ms: 10, ..Default::default() }.validate().is_err());
        assert_eq!(RetryConfig::default().delay_for(5), Duration::from_millis(16_000));
    }

    #[tokio::test]
    async fn success_on_first_attempt() {
        let retry = RetryExecutor::new("test", fast_config(3));
        let result = retry.execute(|| async { Ok::<_, SyncError>(42) }).await;
        assert_eq!(result.unwrap(), 42);

        let metrics = retry.metrics();
        assert_eq!(metrics.total_operations, 1);
        assert_eq!(metrics.successful_operations, 1);
        assert_eq!(metrics.total_retries, 0);
        assert_eq!(metrics.success_rate(), 1.0);
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let retry = RetryExecutor::new("test", fast_config(3));

        let counter = Arc::clone(&attempts);
        let result = retry
            .execute(move || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(SyncError::http(503, "unavailable"))
                    } else {
                        Ok("synced")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "synced");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        let metrics = retry.metrics();
        assert_eq!(metrics.total_retries, 2);
        assert_eq!(metrics.retried_operations, 1);
        assert_eq!(metrics.errors_by_class.get(&ErrorClass::ServerError), Some(&2));
        assert_eq!(metrics.average_retries(), 2.0);
        assert_eq!(metrics.retry_rate(), 1.0);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let retry = RetryExecutor::new("test", fast_config(5));

        let counter = Arc::clone(&attempts);
        let result: Result<(), _> = retry
            .execute(move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(SyncError::http(422, "bad envelope"))
                }
            })
            .await;

        assert_eq!(result.unwrap_err().status(), Some(422));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(
            retry.metrics().errors_by_class.get(&ErrorClass::PermanentClientError),
            Some(&1)
        );
    }

    #[tokio::test]
    async fn stops_after_max_attempts() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let retry = RetryExecutor::new("test", fast_config(3));

        let counter = Arc::clone(&attempts);
        let result: Result<(), _> = retry
            .execute(move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(SyncError::network("offline"))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        let metrics = retry.metrics();
        assert_eq!(metrics.total_retries, 2);
        assert_eq!(metrics.successful_operations, 0);
        assert_eq!(metrics.success_rate(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn sleeps_exponential_delays_between_attempts() {
        let retry = RetryExecutor::new(
            "test",
            RetryConfig {
                max_attempts: 4,
                base_delay_ms: 1_000,
                max_delay_ms: 30_000,
                jitter_factor: 0.0,
            },
        );
        let started = tokio::time::Instant::now();
        let _: Result<(), _> = retry
            .execute(|| async { Err(SyncError::timeout(10)) })
            .await;
        // 1s + 2s + 4s between four attempts
        assert_eq!(started.elapsed(), Duration::from_millis(7_000));
    }

    #[tokio::test]
    async fn per_call_config_overrides_default() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let retry = RetryExecutor::new("test", fast_config(5));

        let counter = Arc::clone(&attempts);
        let _: Result<(), _> = retry
            .execute_with(&fast_config(1), move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(SyncError::network("down"))
                }
            })
            .await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reset_clears_metrics() {
        let retry = RetryExecutor::new("test", fast_config(1));
        let _: Result<(), _> = retry.execute(|| async { Err(SyncError::network("x")) }).await;
        assert_eq!(retry.metrics().total_operations, 1);

        retry.reset_metrics();
        assert_eq!(retry.metrics(), RetryMetricsSnapshot::default());
    }
}
