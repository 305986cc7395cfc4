//! Error taxonomy for the crawl pipeline
//!
//! Fetch failures are classified once, at the fetch client, and that
//! classification drives the retry decision. Everything below the
//! coordinator surfaces as a typed error for a single item; nothing here is
//! fatal to a task except `ConfigError` and persistence being unreachable
//! when the task starts.

use std::fmt;

use thiserror::Error;

use super::entities::{Platform, TaskStatus};

/// Errors a bounded retry loop may try again
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Outcome class of a failed fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// HTTP 429, or a platform block signal (login wall, captcha page)
    RateLimited,
    NotFound,
    /// HTTP 5xx
    ServerError,
    /// Connection, DNS, TLS or timeout failure
    NetworkError,
    /// Any other non-success status; the request itself is wrong
    ClientError,
    /// Stop signal observed before the request was issued
    Cancelled,
}

impl FailureKind {
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::RateLimited | Self::ServerError | Self::NetworkError)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RateLimited => "rate limited",
            Self::NotFound => "not found",
            Self::ServerError => "server error",
            Self::NetworkError => "network error",
            Self::ClientError => "client error",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single failed fetch attempt
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} fetching {url}: {message}")]
pub struct FetchError {
    pub kind: FailureKind,
    pub status: Option<u16>,
    pub url: String,
    pub message: String,
}

impl FetchError {
    pub fn new(kind: FailureKind, url: &str, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            url: url.to_string(),
            message: message.into(),
        }
    }

    /// Classify a non-success HTTP status
    pub fn from_status(status: u16, url: &str) -> Self {
        let kind = match status {
            429 | 403 => FailureKind::RateLimited,
            404 | 410 => FailureKind::NotFound,
            500..=599 => FailureKind::ServerError,
            _ => FailureKind::ClientError,
        };
        Self {
            kind,
            status: Some(status),
            url: url.to_string(),
            message: format!("HTTP {status}"),
        }
    }

    pub fn cancelled(url: &str) -> Self {
        Self::new(FailureKind::Cancelled, url, "stop requested before request start")
    }
}

impl Retryable for FetchError {
    fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Retries are exhausted (or the failure was not retryable)
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{last_error} (gave up after {attempts} attempt(s))")]
pub struct TerminalError<E = FetchError> {
    pub last_error: E,
    pub attempts: u32,
}

impl TerminalError<FetchError> {
    pub const fn kind(&self) -> FailureKind {
        self.last_error.kind
    }
}

/// Errors produced by page parsers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Invalid JSON payload in {context}: {message}")]
    InvalidJson { context: String, message: String },

    #[error("Required field '{field}' not found")]
    MissingField { field: String },

    #[error("Invalid CSS selector: {selector} - {reason}")]
    InvalidSelector { selector: String, reason: String },

    #[error("Unexpected page layout: {0}")]
    UnexpectedLayout(String),
}

impl ParseError {
    pub fn invalid_json(context: &str, error: &serde_json::Error) -> Self {
        Self::InvalidJson {
            context: context.to_string(),
            message: error.to_string(),
        }
    }

    pub fn missing_field(field: &str) -> Self {
        Self::MissingField {
            field: field.to_string(),
        }
    }
}

/// Errors surfaced by spider operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SpiderError {
    #[error(transparent)]
    Fetch(#[from] TerminalError),

    #[error("Product {product_id} not found on {platform}")]
    NotFound { platform: Platform, product_id: String },

    #[error("Failed to parse {platform} page: {source}")]
    Parse {
        platform: Platform,
        #[source]
        source: ParseError,
    },

    #[error("Crawl stopped")]
    Cancelled,
}

impl SpiderError {
    pub fn not_found(platform: Platform, product_id: &str) -> Self {
        Self::NotFound {
            platform,
            product_id: product_id.to_string(),
        }
    }

    pub const fn parse(platform: Platform, source: ParseError) -> Self {
        Self::Parse { platform, source }
    }

    pub const fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Fetch(terminal) => matches!(terminal.last_error.kind, FailureKind::NotFound),
            _ => false,
        }
    }

    pub const fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Fetch(terminal) => matches!(terminal.last_error.kind, FailureKind::Cancelled),
            _ => false,
        }
    }
}

/// Errors from the persistence layer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("Persistence unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to write {entity}: {message}")]
    Write { entity: &'static str, message: String },

    #[error("Failed to decode stored {entity}: {message}")]
    Decode { entity: &'static str, message: String },

    #[error("Crawl task {0} does not exist")]
    UnknownTask(i64),
}

impl PersistenceError {
    pub fn write(entity: &'static str, message: impl Into<String>) -> Self {
        Self::Write {
            entity,
            message: message.into(),
        }
    }

    pub fn decode(entity: &'static str, message: impl Into<String>) -> Self {
        Self::Decode {
            entity,
            message: message.into(),
        }
    }
}

impl Retryable for PersistenceError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Write { .. })
    }
}

/// Invalid configuration; fatal at task start
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Unknown platform: {0}")]
    UnknownPlatform(String),

    #[error("No spider registered for platform {0}")]
    NoSpider(Platform),
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// A record failed validation and is dropped from the batch
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Required field '{0}' is missing")]
    MissingField(&'static str),

    #[error("Field '{field}' out of range: {value} (expected {expected})")]
    OutOfRange {
        field: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("Field '{field}' exceeds {max} characters")]
    TooLong { field: &'static str, max: usize },

    #[error("Unrecognised time format: {0}")]
    InvalidTime(String),

    #[error("Unknown product status: {0}")]
    InvalidStatus(String),
}

impl ValidationError {
    pub fn out_of_range(field: &'static str, value: impl fmt::Display, expected: &'static str) -> Self {
        Self::OutOfRange {
            field,
            value: value.to_string(),
            expected,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskStateError {
    #[error("Crawl task already finished with status {0}")]
    AlreadyTerminal(TaskStatus),

    #[error("Unknown crawl task status: {0}")]
    UnknownStatus(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        let cases = [
            (429, FailureKind::RateLimited),
            (403, FailureKind::RateLimited),
            (404, FailureKind::NotFound),
            (500, FailureKind::ServerError),
            (503, FailureKind::ServerError),
            (400, FailureKind::ClientError),
        ];
        for (status, expected) in cases {
            let error = FetchError::from_status(status, "https://item.jd.com/1.html");
            assert_eq!(error.kind, expected, "status {status}");
            assert_eq!(error.status, Some(status));
        }
    }

    #[test]
    fn test_only_transient_failures_retry() {
        assert!(FailureKind::RateLimited.is_retryable());
        assert!(FailureKind::ServerError.is_retryable());
        assert!(FailureKind::NetworkError.is_retryable());
        assert!(!FailureKind::NotFound.is_retryable());
        assert!(!FailureKind::ClientError.is_retryable());
        assert!(!FailureKind::Cancelled.is_retryable());
    }

    #[test]
    fn test_spider_error_not_found_detection() {
        let terminal = TerminalError {
            last_error: FetchError::from_status(404, "https://item.jd.com/9.html"),
            attempts: 1,
        };
        assert!(SpiderError::from(terminal).is_not_found());
        assert!(SpiderError::not_found(Platform::Taobao, "9").is_not_found());
        assert!(!SpiderError::Cancelled.is_not_found());
    }
}
