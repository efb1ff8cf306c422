//! # Request and Response Shapes
//!
//! The caller-facing description of one outbound call, the response handed
//! back, and the hook types a client can attach to the pipeline.
//!
//! ## Defaults Merge
//!
//! A client's configured defaults (headers, base URL, params) are merged
//! *under* the caller's config: the caller's explicit values always win,
//! defaults only fill gaps.

use crate::error::{CourierError, Result};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Per-request configuration submitted to `handle_request`.
#[derive(Debug, Clone)]
pub struct RequestConfig {
    /// Client that coordinates this call (`"default"` always exists)
    pub client_name: String,
    pub method: reqwest::Method,
    /// Absolute URL, or a path resolved against `base_url`
    pub url: String,
    pub base_url: Option<String>,
    pub headers: HashMap<String, String>,
    /// Query string parameters
    pub params: HashMap<String, String>,
    /// JSON request body
    pub data: Option<serde_json::Value>,
    /// Admission priority, higher first (default 1)
    pub priority: i32,
    /// Tokens / concurrency slots consumed (default 1)
    pub cost: u32,
    /// Opaque caller metadata, carried through untouched
    pub metadata: Option<serde_json::Value>,
}

impl RequestConfig {
    pub fn new(
        client_name: impl Into<String>,
        method: reqwest::Method,
        url: impl Into<String>,
    ) -> Self {
        Self {
            client_name: client_name.into(),
            method,
            url: url.into(),
            base_url: None,
            headers: HashMap::new(),
            params: HashMap::new(),
            data: None,
            priority: 1,
            cost: 1,
            metadata: None,
        }
    }

    /// Shorthand for the common case.
    pub fn get(client_name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(client_name, reqwest::Method::GET, url)
    }

    /// The URL the transport will actually dial: `url` resolved against
    /// `base_url` when `url` is not absolute.
    pub fn effective_url(&self) -> String {
        if self.url.starts_with("http://") || self.url.starts_with("https://") {
            return self.url.clone();
        }
        match &self.base_url {
            Some(base) => format!(
                "{}/{}",
                base.trim_end_matches('/'),
                self.url.trim_start_matches('/')
            ),
            None => self.url.clone(),
        }
    }
}

/// Client-level defaults merged under every request config.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestDefaults {
    pub headers: HashMap<String, String>,
    pub base_url: Option<String>,
    pub params: HashMap<String, String>,
}

impl RequestDefaults {
    /// Fills gaps in `config` without overriding anything the caller set.
    pub fn apply_under(&self, config: &mut RequestConfig) {
        for (name, value) in &self.headers {
            config
                .headers
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }
        for (name, value) in &self.params {
            config
                .params
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }
        if config.base_url.is_none() {
            config.base_url = self.base_url.clone();
        }
    }

    /// Sub-client composition: `self` (the child) shallow-merged over the
    /// parent, child values winning.
    pub fn merged_over(&self, parent: &RequestDefaults) -> RequestDefaults {
        let mut headers = parent.headers.clone();
        headers.extend(self.headers.clone());
        let mut params = parent.params.clone();
        params.extend(self.params.clone());
        RequestDefaults {
            headers,
            base_url: self.base_url.clone().or_else(|| parent.base_url.clone()),
            params,
        }
    }
}

/// Transport-level knobs forwarded to the underlying HTTP client.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HttpOptions {
    /// Per-request timeout, milliseconds
    pub timeout_ms: Option<u64>,
    pub user_agent: Option<String>,
}

impl HttpOptions {
    pub fn merged_over(&self, parent: &HttpOptions) -> HttpOptions {
        HttpOptions {
            timeout_ms: self.timeout_ms.or(parent.timeout_ms),
            user_agent: self
                .user_agent
                .clone()
                .or_else(|| parent.user_agent.clone()),
        }
    }
}

/// Response of a coordinated call, decoupled from the transport so
/// interceptors can rewrite it freely.
#[derive(Clone)]
pub struct Response {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body decoded as UTF-8, lossily.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Body decoded as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(CourierError::from)
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers.len())
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// Rewrites the request config just before execution (after admission).
pub type RequestInterceptor = Arc<dyn Fn(RequestConfig) -> RequestConfig + Send + Sync>;

/// Rewrites the response before it is returned to the caller.
pub type ResponseInterceptor = Arc<dyn Fn(Response) -> Response + Send + Sync>;

/// Inspects a successful response and optionally replaces the client's
/// rate limit (e.g. reading `X-RateLimit-*` headers).
pub type RateLimitChange =
    Arc<dyn Fn(&crate::rate_limit::RateLimitSpec, &Response) -> Option<crate::rate_limit::RateLimitSpec> + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_gaps_only() {
        let defaults = RequestDefaults {
            headers: HashMap::from([
                ("Accept".to_string(), "application/json".to_string()),
                ("X-Team".to_string(), "platform".to_string()),
            ]),
            base_url: Some("https://api.example".to_string()),
            params: HashMap::from([("page".to_string(), "1".to_string())]),
        };

        let mut config = RequestConfig::get("api", "/users");
        config
            .headers
            .insert("X-Team".to_string(), "caller-wins".to_string());

        defaults.apply_under(&mut config);
        assert_eq!(config.headers["X-Team"], "caller-wins");
        assert_eq!(config.headers["Accept"], "application/json");
        assert_eq!(config.params["page"], "1");
        assert_eq!(config.base_url.as_deref(), Some("https://api.example"));
    }

    #[test]
    fn test_effective_url_resolution() {
        let mut config = RequestConfig::get("api", "/v1/users");
        config.base_url = Some("https://api.example/".to_string());
        assert_eq!(config.effective_url(), "https://api.example/v1/users");

        let absolute = RequestConfig::get("api", "https://other.example/x");
        assert_eq!(absolute.effective_url(), "https://other.example/x");
    }

    #[test]
    fn test_child_defaults_win_over_parent() {
        let parent = RequestDefaults {
            headers: HashMap::from([("A".to_string(), "parent".to_string())]),
            base_url: Some("https://parent.example".to_string()),
            params: HashMap::new(),
        };
        let child = RequestDefaults {
            headers: HashMap::from([("A".to_string(), "child".to_string())]),
            base_url: Some("https://img.example".to_string()),
            params: HashMap::new(),
        };

        let merged = child.merged_over(&parent);
        assert_eq!(merged.headers["A"], "child");
        assert_eq!(merged.base_url.as_deref(), Some("https://img.example"));
    }

    #[test]
    fn test_response_json_decode() {
        let response = Response {
            status: 200,
            headers: HashMap::new(),
            body: br#"{"ok":true}"#.to_vec(),
        };
        let value: serde_json::Value = response.json().unwrap();
        assert_eq!(value["ok"], true);
        assert!(response.is_success());
    }
}
