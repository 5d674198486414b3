use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

use crate::retry::is_retryable_http_error;

/// Failure raised by a [`Transport`](crate::Transport) while sending a request
/// or reading a streamed body.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid transport configuration: {0}")]
    InvalidConfig(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("stream read failed: {0}")]
    Read(String),

    #[error("no bytes received for {0:?}")]
    IdleTimeout(Duration),

    #[error("invalid response body: {0}")]
    InvalidResponse(String),

    #[error("failed to serialize request body: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("request was cancelled")]
    Cancelled,
}

impl TransportError {
    /// Whether a fresh attempt could plausibly succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connect(_) | Self::Read(_) | Self::IdleTimeout(_) => true,
            Self::Status { status, message } => is_retryable_http_error(*status, message),
            Self::InvalidConfig(_)
            | Self::InvalidResponse(_)
            | Self::Serialize(_)
            | Self::Cancelled => false,
        }
    }

    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(StatusCode::NOT_FOUND.as_u16())
    }

    /// Maps an error raised while reading an already-open body.
    pub(crate) fn from_body(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            return Self::Read(format!("timed out: {error}"));
        }
        Self::Read(error.to_string())
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(error: reqwest::Error) -> Self {
        if let Some(status) = error.status() {
            return Self::Status {
                status: status.as_u16(),
                message: error.to_string(),
            };
        }
        if error.is_body() || error.is_decode() {
            return Self::Read(error.to_string());
        }
        if error.is_builder() {
            return Self::InvalidConfig(error.to_string());
        }
        Self::Connect(error.to_string())
    }
}

/// Failure to turn wire bytes into a typed event. Always terminal for a stream.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("frame exceeds {limit} bytes without a terminating blank line")]
    FrameTooLarge { limit: usize },

    #[error("frame data is not valid JSON ({source}): {preview}")]
    InvalidJson {
        preview: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("frame data has no event type")]
    MissingType,

    #[error("payload for '{event_type}' has an unexpected shape: {source}")]
    InvalidPayload {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    error: Option<ErrorPayloadFields>,
    detail: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorPayloadFields {
    message: Option<String>,
    code: Option<String>,
}

/// Extract a readable message from a failed response body.
pub fn parse_error_message(status: u16, body: &str) -> String {
    let fallback = || {
        if body.trim().is_empty() {
            StatusCode::from_u16(status)
                .ok()
                .and_then(|status| status.canonical_reason())
                .unwrap_or("request failed")
                .to_string()
        } else {
            body.trim().to_string()
        }
    };

    let Ok(parsed) = serde_json::from_str::<ErrorPayload>(body) else {
        return fallback();
    };

    if let Some(fields) = parsed.error {
        match (non_empty(fields.message), non_empty(fields.code)) {
            (Some(message), Some(code)) => return format!("{message} ({code})"),
            (Some(message), None) => return message,
            (None, Some(code)) => return code,
            (None, None) => {}
        }
    }

    non_empty(parsed.detail)
        .or_else(|| non_empty(parsed.message))
        .unwrap_or_else(fallback)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}
