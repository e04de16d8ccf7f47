use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// Failure of a network-bound operation.
///
/// The variant is chosen where the failure is raised (transport, timeout
/// wrapper, status check, caller code), so classification never has to look at
/// the message text.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum SyncError {
    #[error("network error: {message}")]
    Network { message: String },

    #[error("timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("{message}")]
    Application {
        code: Option<String>,
        message: String,
    },

    #[error("circuit '{name}' is open, retry in {retry_in_ms}ms")]
    CircuitOpen { name: String, retry_in_ms: u64 },
}

impl SyncError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
        }
    }

    pub fn application(message: impl Into<String>) -> Self {
        Self::Application {
            code: None,
            message: message.into(),
        }
    }

    pub fn application_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Application {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    /// True for the fail-fast signal of an open circuit, which is not a real
    /// attempt at the operation.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Classify with the default permanent-code table.
    pub fn class(&self) -> ErrorClass {
        ErrorClassifier::default().classify(self)
    }

    pub fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    TransientNetwork,
    Timeout,
    ServerError,
    RateLimited,
    RequestTimeout,
    PermanentClientError,
    Application,
    PermanentApplication,
    CircuitOpen,
}

impl ErrorClass {
    pub fn is_retryable(&self) -> bool {
        match self {
            ErrorClass::TransientNetwork
            | ErrorClass::Timeout
            | ErrorClass::ServerError
            | ErrorClass::RateLimited
            | ErrorClass::RequestTimeout
            | ErrorClass::Application => true,
            ErrorClass::PermanentClientError
            | ErrorClass::PermanentApplication
            | ErrorClass::CircuitOpen => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::TransientNetwork => "transient_network",
            ErrorClass::Timeout => "timeout",
            ErrorClass::ServerError => "server_error",
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::RequestTimeout => "request_timeout",
            ErrorClass::PermanentClientError => "permanent_client_error",
            ErrorClass::Application => "application",
            ErrorClass::PermanentApplication => "permanent_application",
            ErrorClass::CircuitOpen => "circuit_open",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Application error codes that never succeed on a retry.
pub const DEFAULT_PERMANENT_CODES: &[&str] = &[
    "VALIDATION_ERROR",
    "NOT_FOUND",
    "FORBIDDEN",
    "AUTH_ERROR",
    "CONFLICT",
];

#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    permanent_codes: HashSet<String>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_PERMANENT_CODES.iter().copied())
    }
}

impl ErrorClassifier {
    pub fn new<I, S>(permanent_codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            permanent_codes: permanent_codes.into_iter().map(Into::into).collect(),
        }
    }

    pub fn with_permanent_code(mut self, code: impl Into<String>) -> Self {
        self.permanent_codes.insert(code.into());
        self
    }

    pub fn classify(&self, error: &SyncError) -> ErrorClass {
        match error {
            SyncError::Network { .. } => ErrorClass::TransientNetwork,
            SyncError::Timeout { .. } => ErrorClass::Timeout,
            SyncError::Http { status, .. } => match *status {
                408 => ErrorClass::RequestTimeout,
                429 => ErrorClass::RateLimited,
                500..=599 => ErrorClass::ServerError,
                400..=499 => ErrorClass::PermanentClientError,
                // 1xx/3xx surfacing as errors are protocol oddities, not client mistakes
                _ => ErrorClass::Application,
            },
            SyncError::Application { code, .. } => match code {
                Some(code) if self.permanent_codes.contains(code) => {
                    ErrorClass::PermanentApplication
                }
                _ => ErrorClass::Application,
            },
            SyncError::CircuitOpen { .. } => ErrorClass::CircuitOpen,
        }
    }

    pub fn is_retryable(&self, error: &SyncError) -> bool {
        self.classify(error).is_retryable()
    }
}

/// Failures of the persistent queue itself, as opposed to the requests it
/// carries.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("request not found: {0}")]
    NotFound(String),

    #[error("corrupted entry {id}: {reason}")]
    CorruptedEntry { id: i64, reason: String },

    #[error("configuration error: {0}")]
    Config(String),
}

#[cfg(not(target_arch = "wasm32"))]
impl From<rusqlite::Error> for QueueError {
    fn from(e: rusqlite::Error) -> Self {
        QueueError::Storage(e.to_string())
    }
}
