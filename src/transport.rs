use std::time::Duration;

use crate::error::SyncError;
use crate::request::OutboundRequest;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub status_text: String,
}

impl TransportResponse {
    pub fn new(status: u16, status_text: impl Into<String>) -> Self {
        Self {
            status,
            status_text: status_text.into(),
        }
    }

    pub fn ok() -> Self {
        Self::new(200, "OK")
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Converts a non-2xx response into the tagged HTTP error.
    pub fn error_for_status(self) -> Result<Self, SyncError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(SyncError::http(self.status, self.status_text))
        }
    }
}

/// Outbound HTTP for queued requests.
///
/// Implementations report transport failures with the matching
/// [`SyncError`] variant and return every received response, successful or
/// not; the caller owns the 2xx check and the overall timeout.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &OutboundRequest) -> Result<TransportResponse, SyncError>;
}

#[cfg(not(target_arch = "wasm32"))]
pub use self::native::ReqwestTransport;

#[cfg(not(target_arch = "wasm32"))]
mod native {
    use super::*;
    use tracing::debug;

    const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    /// [`Transport`] backed by a shared `reqwest` client.
    #[derive(Debug, Clone)]
    pub struct ReqwestTransport {
        client: reqwest::Client,
        /// The client's own timeout, reported when it trips.
        timeout: Duration,
    }

    impl ReqwestTransport {
        pub fn new() -> Result<Self, SyncError> {
            let client = reqwest::Client::builder()
                .connect_timeout(CONNECT_TIMEOUT)
                .build()
                .map_err(|e| SyncError::application(format!("failed to build HTTP client: {e}")))?;
            Ok(Self {
                client,
                timeout: CONNECT_TIMEOUT,
            })
        }

        /// `timeout` is whatever timeout `client` was built with.
        pub fn with_client(client: reqwest::Client, timeout: Duration) -> Self {
            Self { client, timeout }
        }

        fn map_error(&self, e: reqwest::Error) -> SyncError {
            if e.is_timeout() {
                SyncError::timeout(self.timeout.as_millis() as u64)
            } else if e.is_connect() || e.is_request() || e.is_body() {
                SyncError::network(e.to_string())
            } else {
                SyncError::application(e.to_string())
            }
        }
    }

    #[async_trait::async_trait]
    impl Transport for ReqwestTransport {
        async fn send(&self, request: &OutboundRequest) -> Result<TransportResponse, SyncError> {
            let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
                .map_err(|e| SyncError::application(e.to_string()))?;

            let mut builder = self.client.request(method, request.url.as_str());
            for (name, value) in request.headers.iter() {
                builder = builder.header(name, value);
            }
            if let Some(body) = &request.body {
                builder = builder.body(body.clone());
            }

            let response = builder.send().await.map_err(|e| self.map_error(e))?;
            let status = response.status();
            debug!(
                request_id = %request.request_id,
                status = status.as_u16(),
                "response received"
            );

            Ok(TransportResponse::new(
                status.as_u16(),
                status.canonical_reason().unwrap_or_default(),
            ))
        }
    }
}

/// Runs `send` under `timeout`. Dropping the in-flight future on expiry is the
/// cancellation signal.
pub async fn send_with_timeout<T: Transport + ?Sized>(
    transport: &T,
    request: &OutboundRequest,
    timeout: Duration,
) -> Result<TransportResponse, SyncError> {
    match tokio::time::timeout(timeout, transport.send(request)).await {
        Ok(result) => result?.error_for_status(),
        Err(_) => Err(SyncError::timeout(timeout.as_millis() as u64)),
    }
}
