//! # Error Types and Handling
//!
//! This module defines the error taxonomy for Courier and its mapping to
//! the retry machinery.
//!
//! ## Error Classification
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Error → Handling Policy                             │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  CourierError Variant   │  Handling                                     │
//! │  ───────────────────────┼───────────────────────────────────────────────│
//! │  NotStarted             │  Recovered internally (await start)           │
//! │  UnknownClient          │  Surfaced to caller                           │
//! │  DuplicateClient        │  Surfaced; halts the generator pass           │
//! │  Validation             │  Surfaced; halts the generator pass           │
//! │  Transport              │  Classified retryable/terminal per client     │
//! │  Redis                  │  Logged, retried opportunistically            │
//! │  Serialization          │  Surfaced (programming/wire error)            │
//! │  AuthRefresh            │  Surfaced through the request path            │
//! │  Encryption             │  Surfaced (bad key or corrupt ciphertext)     │
//! │  Timeout                │  Surfaced (abandoned record)                  │
//! │  Internal               │  Surfaced                                     │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Automatic Conversions
//!
//! `From` conversions keep the `?` operator working at every seam:
//! - `redis::RedisError` → `CourierError::Redis`
//! - `serde_json::Error` → `CourierError::Serialization`
//! - `reqwest::Error` → `CourierError::Transport` (with the transport code
//!   mapped to the conventional socket error names so retry predicates can
//!   match on `ECONNRESET` / `ETIMEDOUT` / `ECONNABORTED`)

use std::fmt;
use thiserror::Error;

/// Custom error type for all Courier operations.
///
/// Transport failures carry enough structure ([`TransportError`]) for the
/// retry machinery to classify them; everything else is terminal from the
/// request pipeline's point of view.
#[derive(Debug, Clone, Error)]
pub enum CourierError {
    /// `handle_request` was called before `start` completed. The pipeline
    /// recovers by awaiting startup internally; this surfaces only when the
    /// instance has been stopped for good.
    #[error("courier instance is not started")]
    NotStarted,

    /// No client is registered under the requested name.
    #[error("unknown client: {0}")]
    UnknownClient(String),

    /// A generator produced a client name that is already registered.
    #[error("duplicate client: {0}")]
    DuplicateClient(String),

    /// A generator produced a structurally invalid client spec.
    #[error("invalid client spec: {0}")]
    Validation(String),

    /// An outbound HTTP call failed. Retried or surfaced per the client's
    /// retry options.
    #[error("transport error: {0}")]
    Transport(TransportError),

    /// A Redis command or connection failed.
    #[error("redis error: {0}")]
    Redis(String),

    /// JSON encoding/decoding of a wire payload failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// An OAuth2 token refresh failed.
    #[error("auth refresh failed: {0}")]
    AuthRefresh(String),

    /// Token cache encryption or decryption failed.
    #[error("encryption error: {0}")]
    Encryption(String),

    /// A request record was abandoned: nothing admitted it within the
    /// client's cleanup timeout.
    #[error("request {request_id} timed out after {waited_ms}ms waiting for admission")]
    Timeout {
        /// Id of the abandoned request record
        request_id: String,
        /// How long the originator waited before giving up
        waited_ms: u64,
    },

    /// Unexpected internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Structured description of a failed outbound HTTP call.
///
/// Either `status` (an HTTP response arrived with a failure status) or
/// `code` (the transport itself failed, named with the conventional socket
/// error codes) is set; both may be absent for exotic failures.
#[derive(Debug, Clone, Default)]
pub struct TransportError {
    /// HTTP status code, when a response was received
    pub status: Option<u16>,
    /// Transport-level error code (`ECONNRESET`, `ETIMEDOUT`, `ECONNABORTED`)
    pub code: Option<String>,
    /// Human-readable description
    pub message: String,
    /// Response body, when one was received and could be read
    pub body: Option<String>,
}

impl TransportError {
    /// Builds a transport error from an HTTP response status and body.
    pub fn from_status(status: u16, body: Option<String>) -> Self {
        Self {
            status: Some(status),
            code: None,
            message: format!("upstream returned status {}", status),
            body,
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.status, self.code.as_deref()) {
            (Some(status), _) => write!(f, "status {}: {}", status, self.message),
            (None, Some(code)) => write!(f, "{}: {}", code, self.message),
            (None, None) => write!(f, "{}", self.message),
        }
    }
}

impl From<TransportError> for CourierError {
    fn from(err: TransportError) -> Self {
        CourierError::Transport(err)
    }
}

impl From<redis::RedisError> for CourierError {
    fn from(err: redis::RedisError) -> Self {
        CourierError::Redis(err.to_string())
    }
}

impl From<serde_json::Error> for CourierError {
    fn from(err: serde_json::Error) -> Self {
        CourierError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for CourierError {
    fn from(err: reqwest::Error) -> Self {
        // Map the reqwest failure modes onto the conventional socket error
        // names that retry predicates match against.
        let code = if err.is_timeout() {
            Some("ETIMEDOUT".to_string())
        } else if err.is_connect() {
            Some("ECONNRESET".to_string())
        } else if err.is_request() {
            Some("ECONNABORTED".to_string())
        } else {
            None
        };

        CourierError::Transport(TransportError {
            status: err.status().map(|s| s.as_u16()),
            code,
            message: err.to_string(),
            body: None,
        })
    }
}

pub type Result<T> = std::result::Result<T, CourierError>;
pub type CourierResult<T> = std::result::Result<T, CourierError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display_with_status() {
        let err = TransportError::from_status(503, None);
        assert_eq!(err.to_string(), "status 503: upstream returned status 503");
    }

    #[test]
    fn test_transport_error_display_with_code() {
        let err = TransportError {
            code: Some("ETIMEDOUT".to_string()),
            message: "connection timed out".to_string(),
            ..Default::default()
        };
        assert_eq!(err.to_string(), "ETIMEDOUT: connection timed out");
    }

    #[test]
    fn test_timeout_error_message() {
        let err = CourierError::Timeout {
            request_id: "abc".to_string(),
            waited_ms: 60000,
        };
        assert!(err.to_string().contains("abc"));
        assert!(err.to_string().contains("60000"));
    }
}
