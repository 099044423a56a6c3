//! Error types for the stream transport, frame decoding and record lookups.
//!
//! None of these cross the public boundary of the stream layer itself:
//! `StreamClient` folds them into `ConnectionState::last_error`.

use serde::{Deserialize, Serialize};

/// Failure opening or reading the event stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("unexpected status {status}")]
    Status { status: u16 },

    #[error("unauthorized (status {status})")]
    Unauthorized { status: u16 },

    #[error("stream error: {0}")]
    Stream(String),

    #[error("stream closed by server")]
    Closed,

    #[error("line longer than {limit} bytes")]
    LineTooLong { limit: usize },

    #[error("nothing received for {secs}s")]
    Idle { secs: u64 },

    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

impl TransportError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::Request(_) => "request",
            Self::Status { .. } => "status",
            Self::Unauthorized { .. } => "unauthorized",
            Self::Stream(_) => "stream",
            Self::Closed => "closed",
            Self::LineTooLong { .. } => "line_too_long",
            Self::Idle { .. } => "idle",
            Self::InvalidUrl(_) => "invalid_url",
        }
    }

    /// Whether the backoff policy should retry after this error.
    ///
    /// A rejected token will be rejected again, and a malformed URL never
    /// becomes valid; everything else is a transient transport condition.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Unauthorized { .. } | Self::InvalidUrl(_))
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            let status = status.as_u16();
            if status == 401 || status == 403 {
                return Self::Unauthorized { status };
            }
            return Self::Status { status };
        }
        if err.is_body() || err.is_decode() {
            return Self::Stream(err.to_string());
        }
        Self::Request(err.to_string())
    }
}

/// A named frame whose payload could not be decoded.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed {event} payload: {source}")]
    Json {
        event: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Failure reading a single record from the REST API.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("record {resource}/{id} not found")]
    NotFound { resource: String, id: String },

    #[error("session expired")]
    SessionExpired,

    #[error("unexpected status {status} for {resource}/{id}")]
    Status {
        resource: String,
        id: String,
        status: u16,
    },

    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

/// Serializable summary of the last transport error, for status displays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub code: String,
    pub message: String,
}

impl From<&TransportError> for ErrorSummary {
    fn from(err: &TransportError) -> Self {
        Self {
            code: err.error_code().to_string(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthorized_is_not_retryable() {
        assert!(!TransportError::Unauthorized { status: 401 }.is_retryable());
        assert!(!TransportError::InvalidUrl("x".into()).is_retryable());
    }

    #[test]
    fn transient_errors_are_retryable() {
        assert!(TransportError::Closed.is_retryable());
        assert!(TransportError::Status { status: 502 }.is_retryable());
        assert!(TransportError::Request("dns".into()).is_retryable());
        assert!(TransportError::Idle { secs: 90 }.is_retryable());
        assert!(TransportError::LineTooLong { limit: 1024 }.is_retryable());
    }

    #[test]
    fn error_summary_carries_code() {
        let summary = ErrorSummary::from(&TransportError::Unauthorized { status: 403 });
        assert_eq!(summary.code, "unauthorized");
        assert_eq!(summary.message, "unauthorized (status 403)");
    }
}
