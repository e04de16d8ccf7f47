use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use url::Url;
use uuid::Uuid;

use crate::error::QueueError;

pub const MAX_URL_LENGTH: usize = 2048;
pub const MAX_HEADER_NAME_LENGTH: usize = 256;
pub const MAX_HEADER_VALUE_LENGTH: usize = 8192;
pub const MAX_HEADERS_COUNT: usize = 100;

/// Caller-visible token identifying one logical request - immutable after construction
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(String);

impl RequestId {
    const MAX_LENGTH: usize = 128;

    pub fn new(id: impl Into<String>) -> Result<Self, QueueError> {
        let id = id.into().trim().to_string();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(id: &str) -> Result<(), QueueError> {
        if id.is_empty() {
            return Err(QueueError::Validation("request id cannot be empty".into()));
        }
        if id.len() > Self::MAX_LENGTH {
            return Err(QueueError::Validation(format!(
                "request id exceeds {} characters",
                Self::MAX_LENGTH
            )));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == ':' || c == '.')
        {
            return Err(QueueError::Validation(
                "request id contains invalid characters (allowed: a-z, A-Z, 0-9, -, _, :, .)"
                    .into(),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }

    pub fn has_request_body(&self) -> bool {
        matches!(self, HttpMethod::Post | HttpMethod::Put | HttpMethod::Patch)
    }
}

impl FromStr for HttpMethod {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "PATCH" => Ok(HttpMethod::Patch),
            "DELETE" => Ok(HttpMethod::Delete),
            "HEAD" => Ok(HttpMethod::Head),
            "OPTIONS" => Ok(HttpMethod::Options),
            other => Err(QueueError::Validation(format!(
                "unsupported HTTP method '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An absolute http(s) URL, normalized by the `url` parser.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ValidatedUrl(String);

impl ValidatedUrl {
    pub fn new(url: impl Into<String>) -> Result<Self, QueueError> {
        let url = url.into();
        let trimmed = url.trim();

        if trimmed.is_empty() {
            return Err(QueueError::Validation("URL cannot be empty".into()));
        }
        if trimmed.len() > MAX_URL_LENGTH {
            return Err(QueueError::Validation(format!(
                "URL exceeds maximum length of {MAX_URL_LENGTH} bytes"
            )));
        }

        let parsed = Url::parse(trimmed)
            .map_err(|e| QueueError::Validation(format!("invalid URL '{}': {e}", truncate(trimmed))))?;

        match parsed.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(QueueError::Validation(format!(
                    "invalid scheme '{scheme}', only 'http' and 'https' are allowed"
                )))
            }
        }
        if parsed.host_str().is_none() {
            return Err(QueueError::Validation("URL must have a host".into()));
        }

        Ok(Self(parsed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ValidatedUrl {
    type Error = QueueError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ValidatedUrl> for String {
    fn from(url: ValidatedUrl) -> Self {
        url.0
    }
}

fn truncate(url: &str) -> String {
    if url.len() <= 100 {
        url.to_string()
    } else {
        let mut end = 100;
        while !url.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &url[..end])
    }
}

/// Header map keyed by lower-cased name. Later inserts of the same name win.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), QueueError> {
        let name = name.into();
        let value = value.into();
        validate_header_name(&name)?;
        validate_header_value(&name, &value)?;

        let key = name.to_ascii_lowercase();
        if !self.0.contains_key(&key) && self.0.len() >= MAX_HEADERS_COUNT {
            return Err(QueueError::Validation(format!(
                "too many headers, maximum is {MAX_HEADERS_COUNT}"
            )));
        }
        self.0.insert(key, value);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TryFrom<Vec<(String, String)>> for Headers {
    type Error = QueueError;

    fn try_from(pairs: Vec<(String, String)>) -> Result<Self, Self::Error> {
        let mut headers = Headers::new();
        for (name, value) in pairs {
            headers.insert(name, value)?;
        }
        Ok(headers)
    }
}

fn validate_header_name(name: &str) -> Result<(), QueueError> {
    if name.is_empty() {
        return Err(QueueError::Validation("header name cannot be empty".into()));
    }
    if name.len() > MAX_HEADER_NAME_LENGTH {
        return Err(QueueError::Validation(format!(
            "header name exceeds maximum length of {MAX_HEADER_NAME_LENGTH} bytes"
        )));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && *c != '-' && *c != '_')
    {
        return Err(QueueError::Validation(format!(
            "invalid character '{c}' in header name '{name}'"
        )));
    }
    let lower = name.to_ascii_lowercase();
    if lower == "host" || lower == "content-length" || lower == "transfer-encoding" {
        return Err(QueueError::Validation(format!(
            "header '{name}' is managed by the transport"
        )));
    }
    Ok(())
}

fn validate_header_value(name: &str, value: &str) -> Result<(), QueueError> {
    if value.len() > MAX_HEADER_VALUE_LENGTH {
        return Err(QueueError::Validation(format!(
            "value of header '{name}' exceeds maximum length of {MAX_HEADER_VALUE_LENGTH} bytes"
        )));
    }
    if value.chars().any(|c| c == '\r' || c == '\n' || c == '\0') {
        return Err(QueueError::Validation(format!(
            "value of header '{name}' contains CR, LF or NUL"
        )));
    }
    Ok(())
}

/// Drain tier of a queued request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Lower rank drains first.
    pub fn rank(&self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl FromStr for Priority {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(QueueError::Validation(format!("unknown priority '{other}'"))),
        }
    }
}

/// The wire-level shape handed to a [`crate::transport::Transport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    pub request_id: RequestId,
    pub url: ValidatedUrl,
    pub method: HttpMethod,
    pub headers: Headers,
    pub body: Option<String>,
}
