//! Keyed coalescing of bursty operations.
//!
//! Each operation-type key holds at most one queued item. Enqueuing under a
//! busy key resolves the previous caller with [`DebounceOutcome::Superseded`]
//! and restarts the key's quiet window; only the last item enqueued within a
//! window runs. Nothing is ordered across distinct keys.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{QueueError, SyncError};
use crate::UnixTimeMs;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebounceConfig {
    pub name: String,
    /// Quiet period a key must see before its item runs.
    pub debounce_ms: u64,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            name: "sync".to_string(),
            debounce_ms: 2_000,
        }
    }
}

impl DebounceConfig {
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.name.trim().is_empty() {
            return Err(QueueError::Config("debounce.name is empty".into()));
        }
        if self.debounce_ms == 0 {
            return Err(QueueError::Config("debounce.debounce_ms must be > 0".into()));
        }
        Ok(())
    }
}

/// How a single `enqueue` call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebounceOutcome<T> {
    Completed(T),
    Failed(SyncError),
    /// A newer enqueue under the same key replaced this one before it ran.
    Superseded,
    /// Dropped by [`DebounceQueue::clear`].
    Cancelled,
}

impl<T> DebounceOutcome<T> {
    pub fn completed(self) -> Option<T> {
        match self {
            DebounceOutcome::Completed(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_superseded(&self) -> bool {
        matches!(self, DebounceOutcome::Superseded)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, DebounceOutcome::Cancelled)
    }

    /// Folds the outcome into a `Result`, mapping the two skip variants to
    /// `None`.
    pub fn into_result(self) -> Result<Option<T>, SyncError> {
        match self {
            DebounceOutcome::Completed(value) => Ok(Some(value)),
            DebounceOutcome::Failed(err) => Err(err),
            DebounceOutcome::Superseded | DebounceOutcome::Cancelled => Ok(None),
        }
    }
}

/// Resolves once the enqueued item has run, been superseded, or been cleared.
#[must_use = "the outcome is only observable by awaiting"]
#[derive(Debug)]
pub struct Pending<T> {
    rx: oneshot::Receiver<DebounceOutcome<T>>,
}

impl<T> Future for Pending<T> {
    type Output = DebounceOutcome<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(DebounceOutcome::Cancelled))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlushResult {
    pub operation_type: String,
    pub success: bool,
    pub error: Option<SyncError>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DebounceStats {
    pub enqueued: u64,
    pub superseded: u64,
    pub processed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub queued: usize,
    pub in_progress: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueuedItem {
    pub operation_type: String,
    pub enqueued_at: UnixTimeMs,
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T, SyncError>> + Send>>;
type BoxedOperation<T> = Box<dyn FnOnce() -> BoxFuture<T> + Send>;

struct PendingItem<T> {
    operation: BoxedOperation<T>,
    enqueued_at: UnixTimeMs,
    waiter: oneshot::Sender<DebounceOutcome<T>>,
    timer: JoinHandle<()>,
    generation: u64,
}

struct State<T> {
    items: HashMap<String, PendingItem<T>>,
    in_progress: HashSet<String>,
    next_generation: u64,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    superseded: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

struct Shared<T> {
    config: DebounceConfig,
    state: Mutex<State<T>>,
    counters: Counters,
}

#[derive(Clone, Copy)]
enum Trigger {
    /// The quiet window of the item with this generation elapsed.
    Timer(u64),
    Flush,
}

/// Cheap to clone; clones share the same keys and timers.
///
/// Enqueuing spawns a timer task, so it must happen inside a tokio runtime.
pub struct DebounceQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for DebounceQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + 'static> DebounceQueue<T> {
    pub fn new(config: DebounceConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(State {
                    items: HashMap::new(),
                    in_progress: HashSet::new(),
                    next_generation: 0,
                }),
                counters: Counters::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    pub fn enqueue<F, Fut, D>(
        &self,
        operation_type: impl Into<String>,
        operation: F,
        data: D,
    ) -> Pending<T>
    where
        F: FnOnce(D) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
        D: Send + 'static,
    {
        let key = operation_type.into();
        let operation: BoxedOperation<T> =
            Box::new(move || Box::pin(operation(data)) as BoxFuture<T>);
        let (tx, rx) = oneshot::channel();

        let shared = &self.shared;
        shared.counters.enqueued.fetch_add(1, Ordering::Relaxed);

        let mut state = shared.lock();
        let generation = state.next_generation;
        state.next_generation += 1;

        if let Some(previous) = state.items.remove(&key) {
            previous.timer.abort();
            let _ = previous.waiter.send(DebounceOutcome::Superseded);
            shared.counters.superseded.fetch_add(1, Ordering::Relaxed);
            warn!(
                queue = %shared.config.name,
                operation_type = %key,
                "queued operation superseded"
            );
        }

        let timer = shared.arm_timer(key.clone(), generation);
        state.items.insert(
            key.clone(),
            PendingItem {
                operation,
                enqueued_at: UnixTimeMs::now(),
                waiter: tx,
                timer,
                generation,
            },
        );
        debug!(queue = %shared.config.name, operation_type = %key, "operation queued");

        Pending { rx }
    }

    /// Runs every queued key now, ignoring timers. Keys whose previous item
    /// is still executing stay queued and are not reported.
    pub async fn flush(&self) -> Vec<FlushResult> {
        let mut keys: Vec<String> = self.shared.lock().items.keys().cloned().collect();
        keys.sort();

        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(result) = self.shared.process_operation(&key, Trigger::Flush).await {
                results.push(result);
            }
        }
        info!(queue = %self.shared.config.name, flushed = results.len(), "queue flushed");
        results
    }

    /// Cancels every queued item. Operations already executing finish.
    pub fn clear(&self) {
        let drained: Vec<PendingItem<T>> = {
            let mut state = self.shared.lock();
            state.items.drain().map(|(_, item)| item).collect()
        };
        let count = drained.len();
        for item in drained {
            item.timer.abort();
            let _ = item.waiter.send(DebounceOutcome::Cancelled);
        }
        self.shared
            .counters
            .cancelled
            .fetch_add(count as u64, Ordering::Relaxed);
        if count > 0 {
            info!(queue = %self.shared.config.name, cancelled = count, "queue cleared");
        }
    }

    pub fn queued(&self) -> Vec<QueuedItem> {
        let state = self.shared.lock();
        let mut items: Vec<QueuedItem> = state
            .items
            .iter()
            .map(|(key, item)| QueuedItem {
                operation_type: key.clone(),
                enqueued_at: item.enqueued_at,
            })
            .collect();
        items.sort_by(|a, b| a.operation_type.cmp(&b.operation_type));
        items
    }

    pub fn stats(&self) -> DebounceStats {
        let counters = &self.shared.counters;
        let state = self.shared.lock();
        DebounceStats {
            enqueued: counters.enqueued.load(Ordering::Relaxed),
            superseded: counters.superseded.load(Ordering::Relaxed),
            processed: counters.processed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            cancelled: counters.cancelled.load(Ordering::Relaxed),
            queued: state.items.len(),
            in_progress: state.in_progress.len(),
        }
    }

    /// Zeroes the counters. Queued items are untouched.
    pub fn reset_stats(&self) {
        let counters = &self.shared.counters;
        counters.enqueued.store(0, Ordering::Relaxed);
        counters.superseded.store(0, Ordering::Relaxed);
        counters.processed.store(0, Ordering::Relaxed);
        counters.failed.store(0, Ordering::Relaxed);
        counters.cancelled.store(0, Ordering::Relaxed);
    }
}

/// Marks a key as executing; releases it on drop, so a cancelled flush or a
/// panicking operation cannot leave the key busy.
struct BusyKey<'a, T> {
    shared: &'a Shared<T>,
    key: &'a str,
}

impl<T> Drop for BusyKey<'_, T> {
    fn drop(&mut self) {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .in_progress
            .remove(self.key);
    }
}

impl<T: Send + 'static> Shared<T> {
    // Never held across an await.
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn arm_timer(self: &Arc<Self>, key: String, generation: u64) -> JoinHandle<()> {
        let shared = Arc::clone(self);
        let window = Duration::from_millis(self.config.debounce_ms);
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            shared.process_operation(&key, Trigger::Timer(generation)).await;
        })
    }

    fn take_item(self: &Arc<Self>, key: &str, trigger: Trigger) -> Option<PendingItem<T>> {
        let mut state = self.lock();
        let generation = state.items.get(key)?.generation;

        if let Trigger::Timer(fired) = trigger {
            // A stale timer that lost the race with a supersede.
            if fired != generation {
                return None;
            }
        }

        if state.in_progress.contains(key) {
            if let Trigger::Timer(_) = trigger {
                debug!(queue = %self.config.name, operation_type = key, "key busy, timer re-armed");
                let timer = self.arm_timer(key.to_string(), generation);
                if let Some(item) = state.items.get_mut(key) {
                    item.timer = timer;
                }
            }
            return None;
        }

        let item = state.items.remove(key)?;
        state.in_progress.insert(key.to_string());
        if let Trigger::Flush = trigger {
            item.timer.abort();
        }
        Some(item)
    }

    async fn process_operation(self: &Arc<Self>, key: &str, trigger: Trigger) -> Option<FlushResult> {
        let item = self.take_item(key, trigger)?;
        let PendingItem {
            operation, waiter, ..
        } = item;

        let busy = BusyKey { shared: self, key };
        let result = operation().await;
        drop(busy);

        let (outcome, flush_result) = match result {
            Ok(value) => {
                self.counters.processed.fetch_add(1, Ordering::Relaxed);
                debug!(queue = %self.config.name, operation_type = key, "operation completed");
                (
                    DebounceOutcome::Completed(value),
                    FlushResult {
                        operation_type: key.to_string(),
                        success: true,
                        error: None,
                    },
                )
            }
            Err(err) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    queue = %self.config.name,
                    operation_type = key,
                    error = %err,
                    "operation failed"
                );
                (
                    DebounceOutcome::Failed(err.clone()),
                    FlushResult {
                        operation_type: key.to_string(),
                        success: false,
                        error: Some(err),
                    },
                )
            }
        };

        let _ = waiter.send(outcome);
        Some(flush_result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::Instant;

    fn queue() -> DebounceQueue<u32> {
        DebounceQueue::new(DebounceConfig {
            name: "test".into(),
            debounce_ms: 2_000,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn newer_enqueue_supersedes_older() {
        let queue = queue();
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&runs);
        let first = queue.enqueue(
            "sync",
            move |n: u32| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(n)
            },
            1,
        );
        let counter = Arc::clone(&runs);
        let second = queue.enqueue(
            "sync",
            move |n: u32| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(n * 10)
            },
            2,
        );

        assert_eq!(first.await, DebounceOutcome::Superseded);
        assert_eq!(second.await, DebounceOutcome::Completed(20));
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let stats = queue.stats();
        assert_eq!(stats.enqueued, 2);
        assert_eq!(stats.superseded, 1);
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.queued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_the_full_quiet_window() {
        let queue = queue();
        let started = Instant::now();
        let pending = queue.enqueue("sync", |n: u32| async move { Ok(n) }, 5);

        tokio::time::advance(Duration::from_millis(1_999)).await;
        assert_eq!(queue.stats().processed, 0);
        assert_eq!(queue.queued().len(), 1);

        assert_eq!(pending.await, DebounceOutcome::Completed(5));
        assert_eq!(started.elapsed(), Duration::from_millis(2_000));
    }

    #[tokio::test(start_paused = true)]
    async fn failures_reach_the_caller() {
        let queue = queue();
        let pending = queue.enqueue(
            "sync",
            |_: ()| async { Err(SyncError::http(500, "boom")) },
            (),
        );

        assert_eq!(
            pending.await,
            DebounceOutcome::Failed(SyncError::http(500, "boom"))
        );
        assert_eq!(queue.stats().failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_runs_all_keys_without_waiting() {
        let queue = queue();
        let started = Instant::now();
        let a = queue.enqueue("envelopes", |n: u32| async move { Ok(n) }, 1);
        let b = queue.enqueue(
            "transactions",
            |_: u32| async { Err(SyncError::network("offline")) },
            2,
        );

        let results = queue.flush().await;

        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].operation_type, "envelopes");
        assert!(results[0].success);
        assert_eq!(results[1].operation_type, "transactions");
        assert!(!results[1].success);
        assert_eq!(results[1].error, Some(SyncError::network("offline")));

        assert_eq!(a.await, DebounceOutcome::Completed(1));
        assert!(matches!(b.await, DebounceOutcome::Failed(_)));
        assert_eq!(queue.stats().queued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_cancels_waiters() {
        let queue = queue();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let pending = queue.enqueue(
            "sync",
            move |n: u32| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(n)
            },
            1,
        );

        queue.clear();
        assert!(pending.await.is_cancelled());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(queue.stats().cancelled, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn busy_key_is_not_drained_twice() {
        let queue = queue();
        let running = Arc::new(AtomicUsize::new(0));
        let max_running = Arc::new(AtomicUsize::new(0));

        let op = {
            let running = Arc::clone(&running);
            let max_running = Arc::clone(&max_running);
            move |n: u32| {
                let running = Arc::clone(&running);
                let max_running = Arc::clone(&max_running);
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    max_running.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(n)
                }
            }
        };

        let first = queue.enqueue("sync", op.clone(), 1);
        // first runs from t=2s to t=7s
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(queue.stats().in_progress, 1);

        let second = queue.enqueue("sync", op, 2);

        assert_eq!(first.await, DebounceOutcome::Completed(1));
        assert_eq!(second.await, DebounceOutcome::Completed(2));
        assert_eq!(max_running.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_flush_releases_the_key() {
        let queue = queue();
        let stalled = queue.enqueue(
            "sync",
            |n: u32| async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(n)
            },
            1,
        );

        let flushed = tokio::time::timeout(Duration::from_secs(1), queue.flush()).await;
        assert!(flushed.is_err());
        assert!(stalled.await.is_cancelled());
        assert_eq!(queue.stats().in_progress, 0);

        let next = queue.enqueue("sync", |n: u32| async move { Ok(n) }, 2);
        let outcome = tokio::time::timeout(Duration::from_secs(60), next)
            .await
            .expect("key stayed busy");
        assert_eq!(outcome, DebounceOutcome::Completed(2));
    }

    #[test]
    fn outcome_helpers() {
        assert_eq!(DebounceOutcome::Completed(3).completed(), Some(3));
        assert_eq!(DebounceOutcome::<u32>::Superseded.into_result(), Ok(None));
        assert!(DebounceOutcome::<u32>::Failed(SyncError::network("x"))
            .into_result()
            .is_err());
    }

    #[test]
    fn config_validation() {
        assert!(DebounceConfig::default().validate().is_ok());
        assert!(DebounceConfig {
            debounce_ms: 0,
            ..Default::default()
        }
        .validate()
        .is_err());
    }
}
