//! Durable outbound request queue.
//!
//! Rows move `pending -> processing -> {completed | pending | failed}`. A drain
//! takes the due pending rows in priority-then-FIFO order and sends them one
//! at a time; a failure is recorded on its own row and never aborts the batch.
//! Drains are triggered by `enqueue`, by `retry_request`, by a reconnect, and
//! by a periodic sweep that picks up rows whose backoff has expired.
//!
//! Only one drain runs per queue instance. Several instances draining the
//! same table are not coordinated.

pub mod entry;
#[cfg(not(target_arch = "wasm32"))]
pub mod sqlite;
pub mod store;

pub use entry::{drain_order, EntryUpdate, NewRequest, QueueEntry, RequestStatus};
#[cfg(not(target_arch = "wasm32"))]
pub use sqlite::SqliteQueueStore;
pub use store::{MemoryQueueStore, QueueStore};

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::connectivity::Connectivity;
use crate::error::{ErrorClassifier, QueueError, SyncError};
use crate::request::{HttpMethod, Priority, RequestId};
use crate::retry::backoff_delay;
use crate::transport::{send_with_timeout, Transport};
use crate::UnixTimeMs;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Attempt budget for requests that do not set their own.
    pub default_max_retries: u32,
    pub base_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub request_timeout_ms: u64,
    /// How long a completed row stays visible before deletion.
    pub completed_retention_ms: u64,
    pub sweep_interval_ms: u64,
    /// Delay between an enqueue and the drain it triggers, so near-simultaneous
    /// enqueues share one drain.
    pub enqueue_drain_delay_ms: u64,
    /// Wait after coming online before draining.
    pub reconnect_settle_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            base_retry_delay_ms: 1_000,
            max_retry_delay_ms: 30_000,
            request_timeout_ms: 30_000,
            completed_retention_ms: 5_000,
            sweep_interval_ms: 30_000,
            enqueue_drain_delay_ms: 100,
            reconnect_settle_ms: 1_000,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.default_max_retries == 0 {
            return Err(QueueError::Config("queue.default_max_retries must be > 0".into()));
        }
        if self.base_retry_delay_ms == 0 {
            return Err(QueueError::Config("queue.base_retry_delay_ms must be > 0".into()));
        }
        if self.max_retry_delay_ms < self.base_retry_delay_ms {
            return Err(QueueError::Config(
                "queue.max_retry_delay_ms must be >= base_retry_delay_ms".into(),
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(QueueError::Config("queue.request_timeout_ms must be > 0".into()));
        }
        if self.sweep_interval_ms == 0 {
            return Err(QueueError::Config("queue.sweep_interval_ms must be > 0".into()));
        }
        Ok(())
    }

    /// Delay before attempt `retry_count + 1`, given `retry_count` failures.
    pub fn retry_delay(&self, retry_count: u32) -> u64 {
        backoff_delay(retry_count, self.base_retry_delay_ms, self.max_retry_delay_ms)
    }
}

// ============================================================================
// Status and metrics
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestSummary {
    pub id: i64,
    pub request_id: String,
    pub method: HttpMethod,
    pub url: String,
    pub status: RequestStatus,
    pub priority: Priority,
    pub retry_count: u32,
    pub max_retries: u32,
    pub timestamp: UnixTimeMs,
    pub next_retry_at: Option<UnixTimeMs>,
    pub error_message: Option<String>,
}

impl From<&QueueEntry> for RequestSummary {
    fn from(entry: &QueueEntry) -> Self {
        Self {
            id: entry.id,
            request_id: entry.request_id.as_str().to_string(),
            method: entry.method,
            url: entry.url.as_str().to_string(),
            status: entry.status,
            priority: entry.priority,
            retry_count: entry.retry_count,
            max_retries: entry.max_retries,
            timestamp: entry.timestamp,
            next_retry_at: entry.next_retry_at,
            error_message: entry.error_message.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStatus {
    pub is_online: bool,
    pub processing: bool,
    pub pending_count: usize,
    pub failed_count: usize,
    pub processing_count: usize,
    /// Pending, then failed, then processing rows.
    pub requests: Vec<RequestSummary>,
}

/// What one drain did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// The drain did not run: offline, or another drain held the guard.
    pub skipped: bool,
    pub attempted: usize,
    pub completed: usize,
    pub rescheduled: usize,
    pub failed: usize,
    /// Rows whose bookkeeping hit a storage error.
    pub errors: usize,
}

#[derive(Debug, Default)]
pub struct QueueMetrics {
    pub enqueued: AtomicU64,
    pub completed: AtomicU64,
    pub rescheduled: AtomicU64,
    pub failed: AtomicU64,
    pub storage_errors: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueMetricsSnapshot {
    pub enqueued: u64,
    pub completed: u64,
    pub rescheduled: u64,
    pub failed: u64,
    pub storage_errors: u64,
}

impl QueueMetrics {
    pub fn snapshot(&self) -> QueueMetricsSnapshot {
        QueueMetricsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            rescheduled: self.rescheduled.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Drain internals
// ============================================================================

/// Wall-clock source for row timestamps and backoff deadlines.
pub type Clock = Arc<dyn Fn() -> UnixTimeMs + Send + Sync>;

enum Attempt {
    Completed,
    Rescheduled { next_retry_at: UnixTimeMs },
    Failed,
}

/// Holds the non-reentrant drain flag; releases it on drop.
struct DrainGuard<'a>(&'a AtomicBool);

impl<'a> DrainGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct QueueInner<S> {
    store: Arc<S>,
    transport: Arc<dyn Transport>,
    connectivity: Connectivity,
    config: QueueConfig,
    classifier: ErrorClassifier,
    clock: Clock,
    processing: AtomicBool,
    /// Bumped by `stop`; scheduled drains from an older epoch never run.
    epoch: AtomicU64,
    metrics: QueueMetrics,
}

impl<S: QueueStore + 'static> QueueInner<S> {
    fn now(&self) -> UnixTimeMs {
        (self.clock)()
    }

    fn schedule_drain(self: &Arc<Self>, delay: Duration) {
        let inner = Arc::clone(self);
        let epoch = self.epoch.load(Ordering::Acquire);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if inner.epoch.load(Ordering::Acquire) != epoch {
                debug!("queue stopped, scheduled drain dropped");
                return;
            }
            if let Err(e) = inner.drain().await {
                error!(error = %e, "scheduled drain failed");
            }
        });
    }

    fn schedule_deletion(&self, id: i64) {
        let store = Arc::clone(&self.store);
        let retention = Duration::from_millis(self.config.completed_retention_ms);
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            if let Err(e) = store.delete(id).await {
                warn!(id, error = %e, "failed to delete completed request");
            }
        });
    }

    fn should_trigger_drain(&self) -> bool {
        self.connectivity.is_online() && !self.processing.load(Ordering::Acquire)
    }

    async fn pending_requests(&self) -> Result<Vec<QueueEntry>, QueueError> {
        let mut pending = self.store.list_by_status(RequestStatus::Pending).await?;
        pending.sort_by(drain_order);
        Ok(pending)
    }

    // Catches completed rows whose deletion timer was lost to a restart.
    async fn purge_completed(&self, now: UnixTimeMs) -> Result<usize, QueueError> {
        let expired: Vec<i64> = self
            .store
            .list_by_status(RequestStatus::Completed)
            .await?
            .into_iter()
            .filter(|entry| {
                let finished = entry.last_retry_at.unwrap_or(entry.timestamp);
                now.elapsed_since(finished) >= self.config.completed_retention_ms
            })
            .map(|entry| entry.id)
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }
        self.store.bulk_delete(&expired).await
    }

    #[instrument(skip(self))]
    async fn drain(&self) -> Result<DrainReport, QueueError> {
        let mut report = DrainReport::default();

        if !self.connectivity.is_online() {
            debug!("offline, drain skipped");
            report.skipped = true;
            return Ok(report);
        }
        let Some(_guard) = DrainGuard::acquire(&self.processing) else {
            debug!("drain already in flight");
            report.skipped = true;
            return Ok(report);
        };

        // Selects due rows only; each attempt reads the clock again.
        let now = self.now();
        if let Err(e) = self.purge_completed(now).await {
            self.metrics.storage_errors.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "failed to purge completed requests");
        }

        let due: Vec<QueueEntry> = self
            .pending_requests()
            .await?
            .into_iter()
            .filter(|entry| entry.is_due(now))
            .collect();

        if due.is_empty() {
            return Ok(report);
        }
        info!(due = due.len(), "draining request queue");

        for entry in &due {
            if !self.connectivity.is_online() {
                info!(remaining = due.len() - report.attempted, "went offline, drain paused");
                break;
            }
            report.attempted += 1;
            match self.execute_request(entry).await {
                Ok(Attempt::Completed) => report.completed += 1,
                Ok(Attempt::Rescheduled { next_retry_at }) => {
                    report.rescheduled += 1;
                    debug!(
                        request_id = %entry.request_id,
                        next_retry_at = next_retry_at.0,
                        "request rescheduled"
                    );
                }
                Ok(Attempt::Failed) => report.failed += 1,
                Err(e) => {
                    report.errors += 1;
                    self.metrics.storage_errors.fetch_add(1, Ordering::Relaxed);
                    error!(
                        request_id = %entry.request_id,
                        error = %e,
                        "storage error while processing request"
                    );
                }
            }
        }

        info!(
            attempted = report.attempted,
            completed = report.completed,
            rescheduled = report.rescheduled,
            failed = report.failed,
            "drain finished"
        );
        Ok(report)
    }

    #[instrument(skip(self, entry), fields(request_id = %entry.request_id, attempt = entry.retry_count + 1))]
    async fn execute_request(&self, entry: &QueueEntry) -> Result<Attempt, QueueError> {
        self.store
            .update(
                entry.id,
                EntryUpdate::status(RequestStatus::Processing).last_retry_at(Some(self.now())),
            )
            .await?;

        let timeout = Duration::from_millis(self.config.request_timeout_ms);
        match send_with_timeout(&*self.transport, &entry.to_outbound(), timeout).await {
            Ok(response) => {
                self.store
                    .update(
                        entry.id,
                        EntryUpdate::status(RequestStatus::Completed)
                            .next_retry_at(None)
                            .error_message(None),
                    )
                    .await?;
                self.schedule_deletion(entry.id);
                self.metrics.completed.fetch_add(1, Ordering::Relaxed);
                info!(status = response.status, "request completed");
                Ok(Attempt::Completed)
            }
            Err(err) => self.handle_request_failure(entry, &err).await,
        }
    }

    async fn handle_request_failure(
        &self,
        entry: &QueueEntry,
        err: &SyncError,
    ) -> Result<Attempt, QueueError> {
        let class = self.classifier.classify(err);
        let attempts = entry.retry_count.saturating_add(1);

        if !class.is_retryable() || attempts >= entry.max_retries {
            self.store
                .update(
                    entry.id,
                    EntryUpdate::status(RequestStatus::Failed)
                        .retry_count(attempts)
                        .next_retry_at(None)
                        .error_message(Some(err.to_string())),
                )
                .await?;
            self.metrics.failed.fetch_add(1, Ordering::Relaxed);
            error!(
                attempts,
                max_retries = entry.max_retries,
                error_class = %class,
                error = %err,
                "request failed permanently"
            );
            return Ok(Attempt::Failed);
        }

        let delay = self.config.retry_delay(attempts);
        let next_retry_at = self.now().add_millis(delay);
        self.store
            .update(
                entry.id,
                EntryUpdate::status(RequestStatus::Pending)
                    .retry_count(attempts)
                    .next_retry_at(Some(next_retry_at))
                    .error_message(Some(err.to_string())),
            )
            .await?;
        self.metrics.rescheduled.fetch_add(1, Ordering::Relaxed);
        warn!(
            attempts,
            max_retries = entry.max_retries,
            error_class = %class,
            delay_ms = delay,
            error = %err,
            "request failed, retry scheduled"
        );
        Ok(Attempt::Rescheduled { next_retry_at })
    }

    async fn watch_connectivity(self: Arc<Self>, mut rx: watch::Receiver<bool>) {
        let settle = Duration::from_millis(self.config.reconnect_settle_ms);
        while rx.changed().await.is_ok() {
            let online = *rx.borrow_and_update();
            if !online {
                info!("offline, queue draining paused");
                continue;
            }
            info!(settle_ms = self.config.reconnect_settle_ms, "online, draining after settle");
            tokio::time::sleep(settle).await;
            if self.connectivity.is_online() {
                if let Err(e) = self.drain().await {
                    error!(error = %e, "reconnect drain failed");
                }
            }
        }
    }

    async fn sweep(self: Arc<Self>) {
        let period = Duration::from_millis(self.config.sweep_interval_ms);
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if self.should_trigger_drain() {
                if let Err(e) = self.drain().await {
                    error!(error = %e, "sweep drain failed");
                }
            }
        }
    }
}

#[derive(Default)]
struct Tasks {
    sweep: Option<JoinHandle<()>>,
    watcher: Option<JoinHandle<()>>,
}

// ============================================================================
// Public queue
// ============================================================================

/// Constructed once by the host, which calls [`initialize`](Self::initialize)
/// at startup and [`stop`](Self::stop) at teardown. Background tasks are also
/// stopped on drop.
pub struct PersistentRequestQueue<S: QueueStore + 'static> {
    inner: Arc<QueueInner<S>>,
    tasks: Mutex<Tasks>,
}

impl<S: QueueStore + 'static> PersistentRequestQueue<S> {
    pub fn new(
        store: Arc<S>,
        transport: Arc<dyn Transport>,
        connectivity: Connectivity,
        config: QueueConfig,
    ) -> Result<Self, QueueError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(QueueInner {
                store,
                transport,
                connectivity,
                config,
                classifier: ErrorClassifier::default(),
                clock: Arc::new(UnixTimeMs::now),
                processing: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                metrics: QueueMetrics::default(),
            }),
            tasks: Mutex::new(Tasks::default()),
        })
    }

    /// Replaces the error classifier. Only valid before the queue is shared
    /// with background tasks.
    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Result<Self, QueueError> {
        let inner = Arc::get_mut(&mut self.inner)
            .ok_or_else(|| QueueError::Config("queue already started".into()))?;
        inner.classifier = classifier;
        Ok(self)
    }

    /// Replaces the wall clock, e.g. with one driven by tokio's paused time.
    pub fn with_clock(mut self, clock: Clock) -> Result<Self, QueueError> {
        let inner = Arc::get_mut(&mut self.inner)
            .ok_or_else(|| QueueError::Config("queue already started".into()))?;
        inner.clock = clock;
        Ok(self)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.inner.connectivity
    }

    pub fn metrics(&self) -> QueueMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Resets rows left `processing` by a crash to `pending`, starts the
    /// background tasks, and schedules a drain when online. Returns the
    /// number of recovered rows.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<usize, QueueError> {
        let stuck = self.inner.store.list_by_status(RequestStatus::Processing).await?;
        for entry in &stuck {
            self.inner
                .store
                .update(entry.id, EntryUpdate::status(RequestStatus::Pending))
                .await?;
        }
        if !stuck.is_empty() {
            warn!(count = stuck.len(), "recovered requests stuck in processing");
        }

        self.start();

        if self.inner.connectivity.is_online() {
            self.inner
                .schedule_drain(Duration::from_millis(self.inner.config.enqueue_drain_delay_ms));
        }
        let pending = self.get_queue_size().await?;
        info!(
            pending,
            online = self.inner.connectivity.is_online(),
            "request queue initialized"
        );
        Ok(stuck.len())
    }

    /// Spawns the sweep interval and the connectivity watcher, replacing any
    /// already running.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = tasks.sweep.take() {
            handle.abort();
        }
        if let Some(handle) = tasks.watcher.take() {
            handle.abort();
        }
        let rx = self.inner.connectivity.subscribe();
        tasks.watcher = Some(tokio::spawn(Arc::clone(&self.inner).watch_connectivity(rx)));
        tasks.sweep = Some(tokio::spawn(Arc::clone(&self.inner).sweep()));
        debug!("request queue background tasks started");
    }

    /// Stops the periodic sweep only; reconnect drains still happen.
    pub fn stop_processing_interval(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = tasks.sweep.take() {
            handle.abort();
            debug!("request queue sweep stopped");
        }
    }

    /// Ends the sweep and the connectivity watcher, and drops drains that
    /// were scheduled but have not started. A drain already in flight
    /// finishes its current batch.
    pub fn stop(&self) {
        self.inner.epoch.fetch_add(1, Ordering::AcqRel);
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        let had_tasks = tasks.sweep.is_some() || tasks.watcher.is_some();
        for handle in [tasks.sweep.take(), tasks.watcher.take()].into_iter().flatten() {
            handle.abort();
        }
        if had_tasks {
            info!("request queue stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        let tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.sweep.is_some() || tasks.watcher.is_some()
    }

    pub fn is_processing(&self) -> bool {
        self.inner.processing.load(Ordering::Acquire)
    }

    /// Validates and persists `request` as a pending row and returns its id.
    #[instrument(skip(self, request), fields(method = %request.method, url = %request.url))]
    pub async fn enqueue(&self, request: NewRequest) -> Result<i64, QueueError> {
        let entry = request.into_entry(self.inner.now(), self.inner.config.default_max_retries)?;
        let request_id = entry.request_id.clone();
        let priority = entry.priority;

        let id = self.inner.store.add(entry).await?;
        self.inner.metrics.enqueued.fetch_add(1, Ordering::Relaxed);
        info!(id, request_id = %request_id, priority = priority.as_str(), "request queued");

        if self.inner.should_trigger_drain() {
            self.inner
                .schedule_drain(Duration::from_millis(self.inner.config.enqueue_drain_delay_ms));
        }
        Ok(id)
    }

    /// Number of pending rows.
    pub async fn get_queue_size(&self) -> Result<usize, QueueError> {
        self.inner.store.count_by_status(RequestStatus::Pending).await
    }

    /// Pending rows in drain order.
    pub async fn get_pending_requests(&self) -> Result<Vec<QueueEntry>, QueueError> {
        self.inner.pending_requests().await
    }

    pub async fn process_queue(&self) -> Result<DrainReport, QueueError> {
        self.inner.drain().await
    }

    pub async fn get_status(&self) -> Result<QueueStatus, QueueError> {
        let store = &self.inner.store;
        let pending = store.list_by_status(RequestStatus::Pending).await?;
        let failed = store.list_by_status(RequestStatus::Failed).await?;
        let processing = store.list_by_status(RequestStatus::Processing).await?;

        let requests = pending
            .iter()
            .chain(&failed)
            .chain(&processing)
            .map(RequestSummary::from)
            .collect();

        Ok(QueueStatus {
            is_online: self.inner.connectivity.is_online(),
            processing: self.is_processing(),
            pending_count: pending.len(),
            failed_count: failed.len(),
            processing_count: processing.len(),
            requests,
        })
    }

    /// Deletes every failed row and returns how many were removed.
    pub async fn clear_failed_requests(&self) -> Result<usize, QueueError> {
        let ids: Vec<i64> = self
            .inner
            .store
            .list_by_status(RequestStatus::Failed)
            .await?
            .iter()
            .map(|entry| entry.id)
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }
        let removed = self.inner.store.bulk_delete(&ids).await?;
        info!(count = removed, "cleared failed requests");
        Ok(removed)
    }

    /// Puts a failed request back to pending with a fresh attempt budget.
    /// Rows in any other state are rejected.
    #[instrument(skip(self))]
    pub async fn retry_request(&self, request_id: &str) -> Result<(), QueueError> {
        let request_id = RequestId::new(request_id)?;
        let entry = self
            .inner
            .store
            .find_by_request_id(&request_id)
            .await?
            .ok_or_else(|| QueueError::NotFound(request_id.to_string()))?;
        if entry.status != RequestStatus::Failed {
            return Err(QueueError::Validation(format!(
                "request {request_id} is {}, only failed requests can be retried",
                entry.status
            )));
        }

        self.inner
            .store
            .update(
                entry.id,
                EntryUpdate::status(RequestStatus::Pending)
                    .retry_count(0)
                    .next_retry_at(None)
                    .error_message(None),
            )
            .await?;
        info!(request_id = %request_id, "request marked for retry");

        if self.inner.should_trigger_drain() {
            self.inner
                .schedule_drain(Duration::from_millis(self.inner.config.enqueue_drain_delay_ms));
        }
        Ok(())
    }

    pub async fn clear_all_requests(&self) -> Result<(), QueueError> {
        self.inner.store.clear().await?;
        warn!("cleared all queued requests");
        Ok(())
    }
}

impl<S: QueueStore + 'static> Drop for PersistentRequestQueue<S> {
    fn drop(&mut self) {
        self.stop();
    }
}
