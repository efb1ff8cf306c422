//! # Retry Decisions and Backoff
//!
//! Classification of failed outbound calls and computation of the freeze
//! window the controller honors before re-admitting.
//!
//! ## Eligibility (first match wins)
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  1. retries == maxRetries                  → give up            │
//! │  2. HTTP 429 and retry429s                 → retry, rate-limited│
//! │  3. HTTP ≥ 500 and retry5xxs               → retry              │
//! │  4. HTTP code ∈ retryStatusCodes           → retry              │
//! │  5. code ∈ {ECONNRESET,ETIMEDOUT,          → retry              │
//! │             ECONNABORTED}                                       │
//! │  6. retryHandler(error)                    → its verdict        │
//! │  7. otherwise                              → give up            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Backoff
//!
//! `waitTime = retries^p × base` with `p = 2` (exponential, default) or
//! `p = 1` (linear). For token-bucket clients the base is the bucket's
//! refill interval, so the minimum backoff is always at least one refill
//! cycle; everyone else uses `retryBackoffBaseTime`.

use crate::error::TransportError;
use std::fmt;
use std::sync::Arc;

/// Transport error codes treated as transient without consulting the
/// retry handler.
const TRANSIENT_CODES: [&str; 3] = ["ECONNRESET", "ETIMEDOUT", "ECONNABORTED"];

/// Application-supplied fallback predicate for errors the built-in rules
/// do not classify.
pub type RetryHandler = Arc<dyn Fn(&TransportError) -> bool + Send + Sync>;

/// Backoff growth curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffMethod {
    /// `retries² × base`
    Exponential,
    /// `retries × base`
    Linear,
}

/// Effective retry configuration for one client.
#[derive(Clone)]
pub struct RetryOptions {
    /// Maximum retries per request (executions = retries + 1)
    pub max_retries: u32,
    /// Backoff base in milliseconds for non-token-bucket clients
    pub retry_backoff_base_time: u64,
    pub retry_backoff_method: BackoffMethod,
    /// Retry HTTP 429 responses (marks the client rate-limited)
    pub retry_429s: bool,
    /// Retry HTTP 5xx responses
    pub retry_5xxs: bool,
    /// Additional HTTP status codes to retry
    pub retry_status_codes: Vec<u16>,
    /// Fallback predicate for unclassified errors
    pub retry_handler: Option<RetryHandler>,
    /// Guarded re-entry budget after a rate-limit freeze
    pub thaw_request_count: u32,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff_base_time: 1000,
            retry_backoff_method: BackoffMethod::Exponential,
            retry_429s: true,
            retry_5xxs: true,
            retry_status_codes: Vec::new(),
            retry_handler: None,
            thaw_request_count: 3,
        }
    }
}

impl fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_base_time", &self.retry_backoff_base_time)
            .field("retry_backoff_method", &self.retry_backoff_method)
            .field("retry_429s", &self.retry_429s)
            .field("retry_5xxs", &self.retry_5xxs)
            .field("retry_status_codes", &self.retry_status_codes)
            .field("retry_handler", &self.retry_handler.as_ref().map(|_| "<fn>"))
            .field("thaw_request_count", &self.thaw_request_count)
            .finish()
    }
}

/// Verdict for one failed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub should_retry: bool,
    /// The failure was a rate-limit signal; arms the thaw counter
    pub is_rate_limited: bool,
}

impl RetryDecision {
    const GIVE_UP: RetryDecision = RetryDecision {
        should_retry: false,
        is_rate_limited: false,
    };

    const RETRY: RetryDecision = RetryDecision {
        should_retry: true,
        is_rate_limited: false,
    };
}

impl RetryOptions {
    /// Classifies a failed execution. `retries` is the count of retries
    /// already performed for this request.
    pub fn evaluate(&self, error: &TransportError, retries: u32) -> RetryDecision {
        if retries >= self.max_retries {
            return RetryDecision::GIVE_UP;
        }

        if let Some(status) = error.status {
            if status == 429 && self.retry_429s {
                return RetryDecision {
                    should_retry: true,
                    is_rate_limited: true,
                };
            }
            if status >= 500 && self.retry_5xxs {
                return RetryDecision::RETRY;
            }
            if self.retry_status_codes.contains(&status) {
                return RetryDecision::RETRY;
            }
        }

        if let Some(code) = error.code.as_deref() {
            if TRANSIENT_CODES.contains(&code) {
                return RetryDecision::RETRY;
            }
        }

        if let Some(handler) = &self.retry_handler {
            return RetryDecision {
                should_retry: handler(error),
                is_rate_limited: false,
            };
        }

        RetryDecision::GIVE_UP
    }

    /// Backoff for the upcoming attempt. `retries` is the retry count
    /// *after* incrementing (≥ 1); `bucket_interval` overrides the base
    /// for token-bucket clients.
    pub fn backoff_ms(&self, retries: u32, bucket_interval: Option<u64>) -> u64 {
        let base = bucket_interval.unwrap_or(self.retry_backoff_base_time);
        let factor = match self.retry_backoff_method {
            BackoffMethod::Exponential => (retries as u64).saturating_mul(retries as u64),
            BackoffMethod::Linear => retries as u64,
        };
        factor.saturating_mul(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_error(status: u16) -> TransportError {
        TransportError::from_status(status, None)
    }

    fn code_error(code: &str) -> TransportError {
        TransportError {
            code: Some(code.to_string()),
            message: "transport failed".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_exhausted_retries_give_up_first() {
        let options = RetryOptions::default();
        let decision = options.evaluate(&status_error(429), 3);
        assert!(!decision.should_retry);
    }

    #[test]
    fn test_429_marks_rate_limited() {
        let options = RetryOptions::default();
        let decision = options.evaluate(&status_error(429), 0);
        assert!(decision.should_retry);
        assert!(decision.is_rate_limited);
    }

    #[test]
    fn test_429_disabled() {
        let options = RetryOptions {
            retry_429s: false,
            ..Default::default()
        };
        let decision = options.evaluate(&status_error(429), 0);
        assert!(!decision.should_retry);
    }

    #[test]
    fn test_5xx_retries_without_rate_limit_flag() {
        let options = RetryOptions::default();
        let decision = options.evaluate(&status_error(503), 1);
        assert!(decision.should_retry);
        assert!(!decision.is_rate_limited);
    }

    #[test]
    fn test_extra_status_codes() {
        let options = RetryOptions {
            retry_status_codes: vec![408],
            ..Default::default()
        };
        assert!(options.evaluate(&status_error(408), 0).should_retry);
        assert!(!options.evaluate(&status_error(404), 0).should_retry);
    }

    #[test]
    fn test_transient_transport_codes() {
        let options = RetryOptions::default();
        for code in ["ECONNRESET", "ETIMEDOUT", "ECONNABORTED"] {
            assert!(options.evaluate(&code_error(code), 0).should_retry);
        }
        assert!(!options.evaluate(&code_error("EHOSTDOWN"), 0).should_retry);
    }

    #[test]
    fn test_retry_handler_is_last_resort() {
        let options = RetryOptions {
            retry_handler: Some(Arc::new(|err: &TransportError| {
                err.code.as_deref() == Some("EHOSTDOWN")
            })),
            ..Default::default()
        };
        assert!(options.evaluate(&code_error("EHOSTDOWN"), 0).should_retry);
        assert!(!options.evaluate(&code_error("EWEIRD"), 0).should_retry);
    }

    #[test]
    fn test_exponential_backoff_table() {
        let options = RetryOptions::default();
        assert_eq!(options.backoff_ms(1, None), 1000);
        assert_eq!(options.backoff_ms(2, None), 4000);
        assert_eq!(options.backoff_ms(3, None), 9000);
    }

    #[test]
    fn test_linear_backoff_table() {
        let options = RetryOptions {
            retry_backoff_method: BackoffMethod::Linear,
            ..Default::default()
        };
        assert_eq!(options.backoff_ms(1, None), 1000);
        assert_eq!(options.backoff_ms(2, None), 2000);
    }

    #[test]
    fn test_bucket_interval_overrides_base() {
        let options = RetryOptions::default();
        assert_eq!(options.backoff_ms(1, Some(100)), 100);
        assert_eq!(options.backoff_ms(2, Some(100)), 400);
    }
}
