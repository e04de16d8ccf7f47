//! SQLite-backed [`QueueStore`].
//!
//! `rusqlite` is synchronous, so every call takes the connection mutex inside
//! [`tokio::task::spawn_blocking`]. Headers and metadata are stored as JSON
//! text. Rows that no longer decode are reported as
//! [`QueueError::CorruptedEntry`] by point lookups and skipped (with an error
//! log) by list queries, so one bad row cannot wedge a drain.

use rusqlite::types::Value;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info};

use super::entry::{EntryUpdate, QueueEntry, RequestStatus};
use super::store::QueueStore;
use crate::error::QueueError;
use crate::request::{Headers, HttpMethod, Priority, RequestId, ValidatedUrl};
use crate::UnixTimeMs;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS request_queue (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    request_id          TEXT    NOT NULL UNIQUE,
    url                 TEXT    NOT NULL,
    method              TEXT    NOT NULL,
    headers             TEXT    NOT NULL DEFAULT '{}',
    body                TEXT,
    timestamp           INTEGER NOT NULL,
    priority            TEXT    NOT NULL DEFAULT 'normal',
    retry_count         INTEGER NOT NULL DEFAULT 0,
    max_retries         INTEGER NOT NULL,
    status              TEXT    NOT NULL,
    next_retry_at       INTEGER,
    last_retry_at       INTEGER,
    error_message       TEXT,
    entity_type         TEXT,
    entity_id           TEXT,
    conflict_resolution TEXT,
    metadata            TEXT
);
CREATE INDEX IF NOT EXISTS idx_request_queue_status ON request_queue (status);
CREATE INDEX IF NOT EXISTS idx_request_queue_drain ON request_queue (status, priority, timestamp);
";

const SELECT_COLUMNS: &str = "id, request_id, url, method, headers, body, timestamp, priority, \
     retry_count, max_retries, status, next_retry_at, last_retry_at, error_message, \
     entity_type, entity_id, conflict_resolution, metadata";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteQueueStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteQueueStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        info!(path = %path.display(), "opened request queue database");
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, QueueError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, QueueError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<F, R>(&self, f: F) -> Result<R, QueueError>
    where
        F: FnOnce(&mut Connection) -> Result<R, QueueError> + Send + 'static,
        R: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|e| QueueError::Storage(format!("connection mutex poisoned: {e}")))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| QueueError::Storage(format!("storage task failed: {e}")))?
    }
}

/// Column values exactly as stored, before domain validation.
struct RawRow {
    id: i64,
    request_id: String,
    url: String,
    method: String,
    headers: String,
    body: Option<String>,
    timestamp: i64,
    priority: String,
    retry_count: i64,
    max_retries: i64,
    status: String,
    next_retry_at: Option<i64>,
    last_retry_at: Option<i64>,
    error_message: Option<String>,
    entity_type: Option<String>,
    entity_id: Option<String>,
    conflict_resolution: Option<String>,
    metadata: Option<String>,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        id: row.get(0)?,
        request_id: row.get(1)?,
        url: row.get(2)?,
        method: row.get(3)?,
        headers: row.get(4)?,
        body: row.get(5)?,
        timestamp: row.get(6)?,
        priority: row.get(7)?,
        retry_count: row.get(8)?,
        max_retries: row.get(9)?,
        status: row.get(10)?,
        next_retry_at: row.get(11)?,
        last_retry_at: row.get(12)?,
        error_message: row.get(13)?,
        entity_type: row.get(14)?,
        entity_id: row.get(15)?,
        conflict_resolution: row.get(16)?,
        metadata: row.get(17)?,
    })
}

fn to_millis(value: i64) -> UnixTimeMs {
    UnixTimeMs(u64::try_from(value).unwrap_or(0))
}

fn from_millis(value: UnixTimeMs) -> i64 {
    i64::try_from(value.0).unwrap_or(i64::MAX)
}

impl RawRow {
    fn decode(self) -> Result<QueueEntry, QueueError> {
        let id = self.id;
        let corrupted = |reason: String| QueueError::CorruptedEntry { id, reason };

        let headers: Headers = serde_json::from_str(&self.headers)
            .map_err(|e| corrupted(format!("headers: {e}")))?;
        let metadata = self
            .metadata
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| corrupted(format!("metadata: {e}")))?;

        Ok(QueueEntry {
            id,
            request_id: RequestId::new(self.request_id).map_err(|e| corrupted(e.to_string()))?,
            url: ValidatedUrl::new(self.url).map_err(|e| corrupted(e.to_string()))?,
            method: HttpMethod::from_str(&self.method).map_err(|e| corrupted(e.to_string()))?,
            headers,
            body: self.body,
            timestamp: to_millis(self.timestamp),
            priority: Priority::from_str(&self.priority).map_err(|e| corrupted(e.to_string()))?,
            retry_count: u32::try_from(self.retry_count)
                .map_err(|_| corrupted(format!("retry_count {}", self.retry_count)))?,
            max_retries: u32::try_from(self.max_retries)
                .map_err(|_| corrupted(format!("max_retries {}", self.max_retries)))?,
            status: RequestStatus::from_str(&self.status).map_err(|e| corrupted(e.to_string()))?,
            next_retry_at: self.next_retry_at.map(to_millis),
            last_retry_at: self.last_retry_at.map(to_millis),
            error_message: self.error_message,
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            conflict_resolution: self.conflict_resolution,
            metadata,
        })
    }
}

fn decode_all(rows: Vec<RawRow>) -> Vec<QueueEntry> {
    rows.into_iter()
        .filter_map(|raw| match raw.decode() {
            Ok(entry) => Some(entry),
            Err(e) => {
                error!(error = %e, "skipping undecodable queue row");
                None
            }
        })
        .collect()
}

fn optional_millis(value: Option<UnixTimeMs>) -> Value {
    value.map_or(Value::Null, |at| Value::Integer(from_millis(at)))
}

#[async_trait::async_trait]
impl QueueStore for SqliteQueueStore {
    async fn add(&self, entry: QueueEntry) -> Result<i64, QueueError> {
        let headers = serde_json::to_string(&entry.headers)
            .map_err(|e| QueueError::Validation(format!("headers: {e}")))?;
        let metadata = entry
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| QueueError::Validation(format!("metadata: {e}")))?;

        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT INTO request_queue (request_id, url, method, headers, body, timestamp, \
                 priority, retry_count, max_retries, status, next_retry_at, last_retry_at, \
                 error_message, entity_type, entity_id, conflict_resolution, metadata) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                params![
                    entry.request_id.as_str(),
                    entry.url.as_str(),
                    entry.method.as_str(),
                    headers,
                    entry.body,
                    from_millis(entry.timestamp),
                    entry.priority.as_str(),
                    entry.retry_count,
                    entry.max_retries,
                    entry.status.as_str(),
                    entry.next_retry_at.map(from_millis),
                    entry.last_retry_at.map(from_millis),
                    entry.error_message,
                    entry.entity_type,
                    entry.entity_id,
                    entry.conflict_resolution,
                    metadata,
                ],
            );
            match inserted {
                Ok(_) => Ok(conn.last_insert_rowid()),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == ErrorCode::ConstraintViolation =>
                {
                    Err(QueueError::Validation(format!(
                        "duplicate request id '{}'",
                        entry.request_id
                    )))
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn get(&self, id: i64) -> Result<Option<QueueEntry>, QueueError> {
        let raw = self
            .with_conn(move |conn| {
                let sql = format!("SELECT {SELECT_COLUMNS} FROM request_queue WHERE id = ?1");
                Ok(conn.query_row(&sql, params![id], read_row).optional()?)
            })
            .await?;
        raw.map(RawRow::decode).transpose()
    }

    async fn find_by_request_id(
        &self,
        request_id: &RequestId,
    ) -> Result<Option<QueueEntry>, QueueError> {
        let request_id = request_id.as_str().to_string();
        let raw = self
            .with_conn(move |conn| {
                let sql =
                    format!("SELECT {SELECT_COLUMNS} FROM request_queue WHERE request_id = ?1");
                Ok(conn
                    .query_row(&sql, params![request_id], read_row)
                    .optional()?)
            })
            .await?;
        raw.map(RawRow::decode).transpose()
    }

    async fn update(&self, id: i64, update: EntryUpdate) -> Result<bool, QueueError> {
        self.with_conn(move |conn| {
            let mut sets: Vec<&str> = Vec::new();
            let mut values: Vec<Value> = Vec::new();

            if let Some(status) = update.status {
                sets.push("status = ?");
                values.push(Value::Text(status.as_str().to_string()));
            }
            if let Some(retry_count) = update.retry_count {
                sets.push("retry_count = ?");
                values.push(Value::Integer(i64::from(retry_count)));
            }
            if let Some(at) = update.next_retry_at {
                sets.push("next_retry_at = ?");
                values.push(optional_millis(at));
            }
            if let Some(at) = update.last_retry_at {
                sets.push("last_retry_at = ?");
                values.push(optional_millis(at));
            }
            if let Some(message) = update.error_message {
                sets.push("error_message = ?");
                values.push(message.map_or(Value::Null, Value::Text));
            }

            if sets.is_empty() {
                let exists = conn
                    .query_row("SELECT 1 FROM request_queue WHERE id = ?1", params![id], |_| {
                        Ok(())
                    })
                    .optional()?;
                return Ok(exists.is_some());
            }

            let sql = format!("UPDATE request_queue SET {} WHERE id = ?", sets.join(", "));
            values.push(Value::Integer(id));
            let changed = conn.execute(&sql, rusqlite::params_from_iter(values))?;
            Ok(changed > 0)
        })
        .await
    }

    async fn delete(&self, id: i64) -> Result<(), QueueError> {
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM request_queue WHERE id = ?1", params![id])?;
            Ok(())
        })
        .await
    }

    async fn bulk_delete(&self, ids: &[i64]) -> Result<usize, QueueError> {
        let ids = ids.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut removed = 0;
            {
                let mut stmt = tx.prepare("DELETE FROM request_queue WHERE id = ?1")?;
                for id in ids {
                    removed += stmt.execute(params![id])?;
                }
            }
            tx.commit()?;
            Ok(removed)
        })
        .await
    }

    async fn clear(&self) -> Result<(), QueueError> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM request_queue", [])?;
            Ok(())
        })
        .await
    }

    async fn list_by_status(&self, status: RequestStatus) -> Result<Vec<QueueEntry>, QueueError> {
        let rows = self
            .with_conn(move |conn| {
                let sql = format!(
                    "SELECT {SELECT_COLUMNS} FROM request_queue WHERE status = ?1 ORDER BY id"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![status.as_str()], read_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(decode_all(rows))
    }

    async fn list_all(&self) -> Result<Vec<QueueEntry>, QueueError> {
        let rows = self
            .with_conn(|conn| {
                let sql = format!("SELECT {SELECT_COLUMNS} FROM request_queue ORDER BY id");
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([], read_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(decode_all(rows))
    }

    async fn count_by_status(&self, status: RequestStatus) -> Result<usize, QueueError> {
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM request_queue WHERE status = ?1",
                params![status.as_str()],
                |row| row.get(0),
            )?;
            Ok(usize::try_from(count).unwrap_or(0))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::entry::NewRequest;

    fn entry(request_id: &str) -> QueueEntry {
        NewRequest::new("POST", "https://api.example.com/transactions")
            .with_request_id(request_id)
            .with_header("Authorization", "Bearer t")
            .with_body(r#"{"amount":1250}"#)
            .with_priority(Priority::High)
            .with_entity("transaction", "txn-1")
            .with_metadata(serde_json::json!({ "source": "offline" }))
            .into_entry(UnixTimeMs(1_700_000_000_000), 3)
            .unwrap()
    }

    #[tokio::test]
    async fn row_survives_storage() {
        let store = SqliteQueueStore::open_in_memory().unwrap();
        let original = entry("txn-1");
        let id = store.add(original.clone()).await.unwrap();

        let loaded = store.get(id).await.unwrap().unwrap();
        assert_eq!(loaded, QueueEntry { id, ..original });
    }

    #[tokio::test]
    async fn duplicate_request_id_is_a_validation_error() {
        let store = SqliteQueueStore::open_in_memory().unwrap();
        store.add(entry("dup")).await.unwrap();
        let err = store.add(entry("dup")).await.unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));
    }

    #[tokio::test]
    async fn partial_update_touches_only_named_columns() {
        let store = SqliteQueueStore::open_in_memory().unwrap();
        let id = store.add(entry("txn-1")).await.unwrap();

        let changed = store
            .update(
                id,
                EntryUpdate::status(RequestStatus::Pending)
                    .retry_count(1)
                    .next_retry_at(Some(UnixTimeMs(1_700_000_001_000)))
                    .error_message(Some("HTTP 503: down".into())),
            )
            .await
            .unwrap();
        assert!(changed);

        let row = store.get(id).await.unwrap().unwrap();
        assert_eq!(row.retry_count, 1);
        assert_eq!(row.next_retry_at, Some(UnixTimeMs(1_700_000_001_000)));
        assert_eq!(row.error_message.as_deref(), Some("HTTP 503: down"));
        assert_eq!(row.headers.get("authorization"), Some("Bearer t"));

        store
            .update(id, EntryUpdate::default().next_retry_at(None))
            .await
            .unwrap();
        assert_eq!(store.get(id).await.unwrap().unwrap().next_retry_at, None);

        assert!(!store
            .update(999, EntryUpdate::status(RequestStatus::Failed))
            .await
            .unwrap());
        assert!(!store.update(999, EntryUpdate::default()).await.unwrap());
    }

    #[tokio::test]
    async fn corrupted_rows_are_skipped_by_lists() {
        let store = SqliteQueueStore::open_in_memory().unwrap();
        let good = store.add(entry("good")).await.unwrap();
        let bad = store.add(entry("bad")).await.unwrap();

        store
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE request_queue SET status = 'exploded' WHERE id = ?1",
                    params![bad],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let all = store.list_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, good);
        assert!(matches!(
            store.get(bad).await,
            Err(QueueError::CorruptedEntry { .. })
        ));
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");

        {
            let store = SqliteQueueStore::open(&path).unwrap();
            store.add(entry("txn-1")).await.unwrap();
            store.add(entry("txn-2")).await.unwrap();
        }

        let store = SqliteQueueStore::open(&path).unwrap();
        assert_eq!(store.count_by_status(RequestStatus::Pending).await.unwrap(), 2);
        let removed = store.bulk_delete(&[1, 2, 3]).await.unwrap();
        assert_eq!(removed, 2);
        store.clear().await.unwrap();
        assert!(store.list_all().await.unwrap().is_empty());
    }
}
