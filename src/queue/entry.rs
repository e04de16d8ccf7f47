use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::str::FromStr;

use crate::error::QueueError;
use crate::request::{Headers, HttpMethod, OutboundRequest, Priority, RequestId, ValidatedUrl};
use crate::UnixTimeMs;

pub const MAX_BODY_BYTES: usize = 5 * 1024 * 1024;
pub const MAX_ERROR_MESSAGE_BYTES: usize = 1024;

// ============================================================================
// Status
// ============================================================================

/// `Pending -> Processing -> {Completed | Pending | Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RequestStatus {
    pub const ALL: [RequestStatus; 4] = [
        RequestStatus::Pending,
        RequestStatus::Processing,
        RequestStatus::Completed,
        RequestStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Processing => "processing",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Failed)
    }
}

impl FromStr for RequestStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RequestStatus::Pending),
            "processing" => Ok(RequestStatus::Processing),
            "completed" => Ok(RequestStatus::Completed),
            "failed" => Ok(RequestStatus::Failed),
            other => Err(QueueError::Validation(format!("unknown status '{other}'"))),
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Entry
// ============================================================================

/// One persisted outbound request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Store-assigned row id; 0 until the entry is added.
    pub id: i64,
    pub request_id: RequestId,
    pub url: ValidatedUrl,
    pub method: HttpMethod,
    pub headers: Headers,
    pub body: Option<String>,
    /// Enqueue time; FIFO key within a priority tier.
    pub timestamp: UnixTimeMs,
    pub priority: Priority,
    pub retry_count: u32,
    /// Total attempt budget.
    pub max_retries: u32,
    pub status: RequestStatus,
    pub next_retry_at: Option<UnixTimeMs>,
    pub last_retry_at: Option<UnixTimeMs>,
    pub error_message: Option<String>,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub conflict_resolution: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl QueueEntry {
    /// Pending with no backoff, or with a backoff that has expired.
    pub fn is_due(&self, now: UnixTimeMs) -> bool {
        self.status == RequestStatus::Pending
            && self.next_retry_at.map_or(true, |at| !now.is_before(at))
    }

    pub fn to_outbound(&self) -> OutboundRequest {
        OutboundRequest {
            request_id: self.request_id.clone(),
            url: self.url.clone(),
            method: self.method,
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }
}

/// Drain order: priority tier, then enqueue time, then row id.
pub fn drain_order(a: &QueueEntry, b: &QueueEntry) -> Ordering {
    a.priority
        .rank()
        .cmp(&b.priority.rank())
        .then(a.timestamp.cmp(&b.timestamp))
        .then(a.id.cmp(&b.id))
}

// ============================================================================
// New requests
// ============================================================================

/// Unvalidated request as handed to `enqueue`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewRequest {
    pub request_id: Option<String>,
    pub url: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub priority: Priority,
    /// `None` or 0 selects the queue default.
    pub max_retries: Option<u32>,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub conflict_resolution: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl NewRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serializes `value` as the body and sets `content-type`.
    pub fn with_json<T: Serialize>(self, value: &T) -> Result<Self, QueueError> {
        let body = serde_json::to_string(value)
            .map_err(|e| QueueError::Validation(format!("body is not serializable: {e}")))?;
        Ok(self
            .with_header("content-type", "application/json")
            .with_body(body))
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_conflict_resolution(mut self, strategy: impl Into<String>) -> Self {
        self.conflict_resolution = Some(strategy.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Validates and normalizes into a pending entry.
    pub fn into_entry(
        self,
        now: UnixTimeMs,
        default_max_retries: u32,
    ) -> Result<QueueEntry, QueueError> {
        let request_id = match self.request_id {
            Some(id) => RequestId::new(id)?,
            None => RequestId::generate(),
        };
        let url = ValidatedUrl::new(self.url)?;
        let method = HttpMethod::from_str(&self.method)?;
        let headers = Headers::try_from(self.headers)?;

        if let Some(body) = &self.body {
            if matches!(method, HttpMethod::Get | HttpMethod::Head) {
                return Err(QueueError::Validation(format!(
                    "{method} requests cannot carry a body"
                )));
            }
            if body.len() > MAX_BODY_BYTES {
                return Err(QueueError::Validation(format!(
                    "body exceeds {MAX_BODY_BYTES} bytes"
                )));
            }
        }

        let max_retries = match self.max_retries {
            Some(n) if n > 0 => n,
            _ => default_max_retries,
        };

        Ok(QueueEntry {
            id: 0,
            request_id,
            url,
            method,
            headers,
            body: self.body,
            timestamp: now,
            priority: self.priority,
            retry_count: 0,
            max_retries,
            status: RequestStatus::Pending,
            next_retry_at: None,
            last_retry_at: None,
            error_message: None,
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            conflict_resolution: self.conflict_resolution,
            metadata: self.metadata,
        })
    }
}

// ============================================================================
// Partial updates
// ============================================================================

/// Partial row update. `None` leaves a field untouched; `Some(None)` clears a
/// nullable column.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntryUpdate {
    pub status: Option<RequestStatus>,
    pub retry_count: Option<u32>,
    pub next_retry_at: Option<Option<UnixTimeMs>>,
    pub last_retry_at: Option<Option<UnixTimeMs>>,
    pub error_message: Option<Option<String>>,
}

impl EntryUpdate {
    pub fn status(status: RequestStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    pub fn next_retry_at(mut self, at: Option<UnixTimeMs>) -> Self {
        self.next_retry_at = Some(at);
        self
    }

    pub fn last_retry_at(mut self, at: Option<UnixTimeMs>) -> Self {
        self.last_retry_at = Some(at);
        self
    }

    pub fn error_message(mut self, message: Option<String>) -> Self {
        self.error_message = Some(message.map(truncate_error));
        self
    }

    pub fn apply(&self, entry: &mut QueueEntry) {
        if let Some(status) = self.status {
            entry.status = status;
        }
        if let Some(retry_count) = self.retry_count {
            entry.retry_count = retry_count;
        }
        if let Some(at) = self.next_retry_at {
            entry.next_retry_at = at;
        }
        if let Some(at) = self.last_retry_at {
            entry.last_retry_at = at;
        }
        if let Some(message) = &self.error_message {
            entry.error_message = message.clone();
        }
    }
}

fn truncate_error(mut message: String) -> String {
    if message.len() > MAX_ERROR_MESSAGE_BYTES {
        let mut end = MAX_ERROR_MESSAGE_BYTES;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        message.truncate(end);
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn now() -> UnixTimeMs {
        UnixTimeMs(1_700_000_000_000)
    }

    #[test]
    fn new_request_defaults() {
        let entry = NewRequest::new("post", "https://api.example.com/envelopes")
            .with_body("{}")
            .into_entry(now(), 3)
            .unwrap();

        assert_eq!(entry.method, HttpMethod::Post);
        assert_eq!(entry.priority, Priority::Normal);
        assert_eq!(entry.max_retries, 3);
        assert_eq!(entry.retry_count, 0);
        assert_eq!(entry.status, RequestStatus::Pending);
        assert_eq!(entry.timestamp, now());
        assert!(entry.next_retry_at.is_none());
        assert!(!entry.request_id.as_str().is_empty());
    }

    #[test]
    fn zero_max_retries_selects_default() {
        let entry = NewRequest::new("PUT", "https://api.example.com/bills/1")
            .with_max_retries(0)
            .into_entry(now(), 4)
            .unwrap();
        assert_eq!(entry.max_retries, 4);
    }

    #[test]
    fn invalid_requests_are_rejected() {
        assert!(NewRequest::new("POST", "ftp://example.com/x")
            .into_entry(now(), 3)
            .is_err());
        assert!(NewRequest::new("FETCH", "https://example.com/x")
            .into_entry(now(), 3)
            .is_err());
        assert!(NewRequest::new("GET", "https://example.com/x")
            .with_body("nope")
            .into_entry(now(), 3)
            .is_err());
        assert!(NewRequest::new("POST", "https://example.com/x")
            .with_header("x-note", "line\r\nbreak")
            .into_entry(now(), 3)
            .is_err());
        assert!(NewRequest::new("POST", "https://example.com/x")
            .with_request_id("has spaces in it")
            .into_entry(now(), 3)
            .is_err());
    }

    #[test]
    fn json_body_sets_content_type() {
        let entry = NewRequest::new("POST", "https://api.example.com/transactions")
            .with_json(&serde_json::json!({ "amount": 1250 }))
            .unwrap()
            .into_entry(now(), 3)
            .unwrap();
        assert_eq!(entry.headers.get("Content-Type"), Some("application/json"));
        assert_eq!(entry.body.as_deref(), Some(r#"{"amount":1250}"#));
    }

    #[test]
    fn due_only_when_backoff_elapsed() {
        let mut entry = NewRequest::new("POST", "https://example.com/x")
            .into_entry(now(), 3)
            .unwrap();
        assert!(entry.is_due(now()));

        entry.next_retry_at = Some(now().add_millis(1_000));
        assert!(!entry.is_due(now()));
        assert!(entry.is_due(now().add_millis(1_000)));

        entry.status = RequestStatus::Failed;
        assert!(!entry.is_due(now().add_millis(5_000)));
    }

    #[test]
    fn drain_order_is_priority_then_fifo() {
        let make = |id: i64, priority: Priority, offset: u64| {
            let mut e = NewRequest::new("POST", "https://example.com/x")
                .with_priority(priority)
                .into_entry(now().add_millis(offset), 3)
                .unwrap();
            e.id = id;
            e
        };
        let mut entries = vec![
            make(1, Priority::Low, 0),
            make(2, Priority::Normal, 10),
            make(3, Priority::High, 20),
            make(4, Priority::Normal, 5),
        ];
        entries.sort_by(drain_order);
        let ids: Vec<i64> = entries.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![3, 4, 2, 1]);
    }

    proptest! {
        #[test]
        fn drain_order_is_tier_major_then_fifo(
            rows in prop::collection::vec((0usize..3, 0u64..50), 0..40)
        ) {
            let tiers = [Priority::High, Priority::Normal, Priority::Low];
            let mut entries: Vec<QueueEntry> = rows
                .iter()
                .enumerate()
                .map(|(i, &(tier, offset))| {
                    let mut e = NewRequest::new("POST", "https://example.com/x")
                        .with_priority(tiers[tier])
                        .into_entry(now().add_millis(offset), 3)
                        .unwrap();
                    e.id = i as i64;
                    e
                })
                .collect();
            entries.sort_by(drain_order);

            prop_assert_eq!(entries.len(), rows.len());
            for pair in entries.windows(2) {
                let (a, b) = (&pair[0], &pair[1]);
                let key = |e: &QueueEntry| (e.priority.rank(), e.timestamp, e.id);
                prop_assert!(key(a) < key(b), "{:?} drained before {:?}", key(a), key(b));
            }
        }
    }

    #[test]
    fn update_applies_only_named_fields() {
        let mut entry = NewRequest::new("POST", "https://example.com/x")
            .into_entry(now(), 3)
            .unwrap();
        entry.error_message = Some("old".into());

        EntryUpdate::status(RequestStatus::Pending)
            .retry_count(2)
            .next_retry_at(Some(now()))
            .apply(&mut entry);
        assert_eq!(entry.retry_count, 2);
        assert_eq!(entry.error_message.as_deref(), Some("old"));

        EntryUpdate::default().error_message(None).apply(&mut entry);
        assert_eq!(entry.error_message, None);
    }

    #[test]
    fn long_error_messages_are_truncated() {
        let mut entry = NewRequest::new("POST", "https://example.com/x")
            .into_entry(now(), 3)
            .unwrap();
        EntryUpdate::default()
            .error_message(Some("é".repeat(1_000)))
            .apply(&mut entry);
        assert!(entry.error_message.unwrap().len() <= MAX_ERROR_MESSAGE_BYTES);
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in RequestStatus::ALL {
            assert_eq!(status.as_str().parse::<RequestStatus>().unwrap(), status);
        }
        assert!("done".parse::<RequestStatus>().is_err());
    }
}
