// lib.rs - offline-first sync resilience

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod circuit_breaker;
pub mod config;
pub mod connectivity;
pub mod debounce;
pub mod error;
pub mod queue;
pub mod request;
pub mod resilience;
pub mod retry;
pub mod transport;

use serde::{Deserialize, Serialize};

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitOutcome, CircuitState, CircuitStatus,
};
pub use config::SyncConfig;
pub use connectivity::Connectivity;
pub use debounce::{
    DebounceConfig, DebounceOutcome, DebounceQueue, DebounceStats, FlushResult, Pending,
};
pub use error::{ErrorClass, ErrorClassifier, QueueError, SyncError};
pub use queue::{
    DrainReport, EntryUpdate, MemoryQueueStore, NewRequest, PersistentRequestQueue, QueueConfig,
    QueueEntry, QueueStatus, QueueStore, RequestStatus, RequestSummary,
};
#[cfg(not(target_arch = "wasm32"))]
pub use queue::SqliteQueueStore;
pub use request::{Headers, HttpMethod, OutboundRequest, Priority, RequestId, ValidatedUrl};
pub use resilience::{ResilienceStatus, SyncOutcome, SyncResilience};
pub use retry::{backoff_delay, RetryConfig, RetryExecutor, RetryMetricsSnapshot};
#[cfg(not(target_arch = "wasm32"))]
pub use transport::ReqwestTransport;
pub use transport::{Transport, TransportResponse};

#[must_use]
pub fn get_current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Wall-clock milliseconds since the Unix epoch, as persisted on queue rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    #[must_use]
    pub fn now() -> Self {
        Self(get_current_time_ms())
    }

    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn elapsed_since(self, earlier: Self) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    #[must_use]
    pub fn add_millis(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }

    #[must_use]
    pub fn is_before(self, other: Self) -> bool {
        self.0 < other.0
    }
}

impl Default for UnixTimeMs {
    fn default() -> Self {
        Self::now()
    }
}

impl std::fmt::Display for UnixTimeMs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_arithmetic_saturates() {
        let t = UnixTimeMs(1_700_000_000_000);
        assert_eq!(t.add_millis(500).as_millis(), 1_700_000_000_500);
        assert_eq!(UnixTimeMs(u64::MAX).add_millis(1), UnixTimeMs(u64::MAX));
        assert_eq!(t.elapsed_since(t.add_millis(10)), 0);
        assert!(t.is_before(t.add_millis(1)));
    }

    #[test]
    fn now_is_after_2023() {
        assert!(UnixTimeMs::now().as_millis() > 1_672_531_200_000);
    }
}
