use std::collections::BTreeMap;
use tokio::sync::RwLock;

use super::entry::{EntryUpdate, QueueEntry, RequestStatus};
use crate::error::QueueError;
use crate::request::RequestId;

/// Indexed CRUD table holding queue rows.
///
/// Every call is atomic on its own; the queue does no locking of its own over
/// the store.
#[async_trait::async_trait]
pub trait QueueStore: Send + Sync {
    /// Persists a new row and returns its assigned id. A duplicate
    /// `request_id` is a validation error.
    async fn add(&self, entry: QueueEntry) -> Result<i64, QueueError>;
    async fn get(&self, id: i64) -> Result<Option<QueueEntry>, QueueError>;
    async fn find_by_request_id(
        &self,
        request_id: &RequestId,
    ) -> Result<Option<QueueEntry>, QueueError>;
    /// Returns `false` when no row has `id`.
    async fn update(&self, id: i64, update: EntryUpdate) -> Result<bool, QueueError>;
    async fn delete(&self, id: i64) -> Result<(), QueueError>;
    /// Returns the number of rows removed.
    async fn bulk_delete(&self, ids: &[i64]) -> Result<usize, QueueError>;
    async fn clear(&self) -> Result<(), QueueError>;
    /// Rows with `status`, ordered by id.
    async fn list_by_status(&self, status: RequestStatus) -> Result<Vec<QueueEntry>, QueueError>;
    /// Every row, ordered by id.
    async fn list_all(&self) -> Result<Vec<QueueEntry>, QueueError>;
    async fn count_by_status(&self, status: RequestStatus) -> Result<usize, QueueError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    rows: BTreeMap<i64, QueueEntry>,
}

/// Volatile [`QueueStore`] for tests and hosts without disk.
#[derive(Debug, Default)]
pub struct MemoryQueueStore {
    state: RwLock<MemoryState>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl QueueStore for MemoryQueueStore {
    async fn add(&self, mut entry: QueueEntry) -> Result<i64, QueueError> {
        let mut state = self.state.write().await;
        if state
            .rows
            .values()
            .any(|row| row.request_id == entry.request_id)
        {
            return Err(QueueError::Validation(format!(
                "duplicate request id '{}'",
                entry.request_id
            )));
        }
        state.next_id += 1;
        let id = state.next_id;
        entry.id = id;
        state.rows.insert(id, entry);
        Ok(id)
    }

    async fn get(&self, id: i64) -> Result<Option<QueueEntry>, QueueError> {
        Ok(self.state.read().await.rows.get(&id).cloned())
    }

    async fn find_by_request_id(
        &self,
        request_id: &RequestId,
    ) -> Result<Option<QueueEntry>, QueueError> {
        Ok(self
            .state
            .read()
            .await
            .rows
            .values()
            .find(|row| &row.request_id == request_id)
            .cloned())
    }

    async fn update(&self, id: i64, update: EntryUpdate) -> Result<bool, QueueError> {
        let mut state = self.state.write().await;
        match state.rows.get_mut(&id) {
            Some(row) => {
                update.apply(row);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, id: i64) -> Result<(), QueueError> {
        self.state.write().await.rows.remove(&id);
        Ok(())
    }

    async fn bulk_delete(&self, ids: &[i64]) -> Result<usize, QueueError> {
        let mut state = self.state.write().await;
        Ok(ids.iter().filter(|id| state.rows.remove(*id).is_some()).count())
    }

    async fn clear(&self) -> Result<(), QueueError> {
        self.state.write().await.rows.clear();
        Ok(())
    }

    async fn list_by_status(&self, status: RequestStatus) -> Result<Vec<QueueEntry>, QueueError> {
        Ok(self
            .state
            .read()
            .await
            .rows
            .values()
            .filter(|row| row.status == status)
            .cloned()
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<QueueEntry>, QueueError> {
        Ok(self.state.read().await.rows.values().cloned().collect())
    }

    async fn count_by_status(&self, status: RequestStatus) -> Result<usize, QueueError> {
        Ok(self
            .state
            .read()
            .await
            .rows
            .values()
            .filter(|row| row.status == status)
            .count())
    }
}
