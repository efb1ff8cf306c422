//! # Client Specifications
//!
//! The generator-facing description of a client, the merge rules for
//! instance-level defaults, and the flattening of sub-clients.
//!
//! ## Sub-Client Composition
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │  spec "api" { concurrencyLimit 5, auth: token,                      │
//! │               subClients: [ "images" { defaults.baseURL: img } ] }  │
//! │                                                                     │
//! │  flattens to:                                                       │
//! │                                                                     │
//! │  "api"        - concurrencyLimit 5, auth: token                     │
//! │  "api:images" - sharedLimit → "api" (admission shares api's slots), │
//! │                 auth: token (inherited),                            │
//! │                 defaults.baseURL: img (child's own)                 │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Merge rules: the child overrides scalars; `metadata`, `http_options`,
//! `request_options` (and its `defaults`), and `retry_options` are
//! shallow-merged with child values winning; a child without its own rate
//! limit shares the parent's via `sharedLimit`; `sub_clients` never appears
//! in an effective spec.

use crate::auth::AuthSpec;
use crate::http::{
    HttpOptions, RateLimitChange, RequestDefaults, RequestInterceptor, ResponseInterceptor,
};
use crate::rate_limit::RateLimitSpec;
use crate::retry::{BackoffMethod, RetryHandler, RetryOptions};
use std::fmt;
use std::sync::Arc;

/// Default per-client health check cadence.
pub const DEFAULT_HEALTH_CHECK_INTERVAL_MS: u64 = 10_000;

/// Default wait bound for abandoned request records.
pub const DEFAULT_CLEANUP_TIMEOUT_MS: u64 = 60_000;

/// Application-supplied factory producing the client set for one name.
pub type ClientGenerator = Arc<dyn Fn() -> Vec<ClientSpec> + Send + Sync>;

/// Partial retry configuration; unset fields fall back to the parent spec,
/// the instance defaults, and finally [`RetryOptions::default`].
#[derive(Clone, Default)]
pub struct RetryOptionsSpec {
    pub max_retries: Option<u32>,
    pub retry_backoff_base_time: Option<u64>,
    pub retry_backoff_method: Option<BackoffMethod>,
    pub retry_429s: Option<bool>,
    pub retry_5xxs: Option<bool>,
    pub retry_status_codes: Option<Vec<u16>>,
    pub retry_handler: Option<RetryHandler>,
    pub thaw_request_count: Option<u32>,
}

impl RetryOptionsSpec {
    /// Shallow merge, `self` (the child) winning per field.
    pub fn merged_over(&self, parent: &RetryOptionsSpec) -> RetryOptionsSpec {
        RetryOptionsSpec {
            max_retries: self.max_retries.or(parent.max_retries),
            retry_backoff_base_time: self
                .retry_backoff_base_time
                .or(parent.retry_backoff_base_time),
            retry_backoff_method: self.retry_backoff_method.or(parent.retry_backoff_method),
            retry_429s: self.retry_429s.or(parent.retry_429s),
            retry_5xxs: self.retry_5xxs.or(parent.retry_5xxs),
            retry_status_codes: self
                .retry_status_codes
                .clone()
                .or_else(|| parent.retry_status_codes.clone()),
            retry_handler: self
                .retry_handler
                .clone()
                .or_else(|| parent.retry_handler.clone()),
            thaw_request_count: self.thaw_request_count.or(parent.thaw_request_count),
        }
    }

    /// Resolves to effective options.
    pub fn build(&self) -> RetryOptions {
        let defaults = RetryOptions::default();
        RetryOptions {
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            retry_backoff_base_time: self
                .retry_backoff_base_time
                .unwrap_or(defaults.retry_backoff_base_time),
            retry_backoff_method: self
                .retry_backoff_method
                .unwrap_or(defaults.retry_backoff_method),
            retry_429s: self.retry_429s.unwrap_or(defaults.retry_429s),
            retry_5xxs: self.retry_5xxs.unwrap_or(defaults.retry_5xxs),
            retry_status_codes: self
                .retry_status_codes
                .clone()
                .unwrap_or(defaults.retry_status_codes),
            retry_handler: self.retry_handler.clone(),
            thaw_request_count: self
                .thaw_request_count
                .unwrap_or(defaults.thaw_request_count),
        }
    }
}

impl fmt::Debug for RetryOptionsSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptionsSpec")
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

/// Per-client request pipeline options.
#[derive(Clone, Default)]
pub struct RequestOptionsSpec {
    /// Wait bound for abandoned records, milliseconds
    pub cleanup_timeout_ms: Option<u64>,
    /// Metadata merged into every request's metadata
    pub metadata: Option<serde_json::Value>,
    /// Defaults merged under every request config
    pub defaults: RequestDefaults,
    pub request_interceptor: Option<RequestInterceptor>,
    pub response_interceptor: Option<ResponseInterceptor>,
}

impl RequestOptionsSpec {
    pub fn merged_over(&self, parent: &RequestOptionsSpec) -> RequestOptionsSpec {
        RequestOptionsSpec {
            cleanup_timeout_ms: self.cleanup_timeout_ms.or(parent.cleanup_timeout_ms),
            metadata: merge_metadata(parent.metadata.as_ref(), self.metadata.as_ref()),
            defaults: self.defaults.merged_over(&parent.defaults),
            request_interceptor: self
                .request_interceptor
                .clone()
                .or_else(|| parent.request_interceptor.clone()),
            response_interceptor: self
                .response_interceptor
                .clone()
                .or_else(|| parent.response_interceptor.clone()),
        }
    }

    pub fn cleanup_timeout_ms(&self) -> u64 {
        self.cleanup_timeout_ms.unwrap_or(DEFAULT_CLEANUP_TIMEOUT_MS)
    }
}

impl fmt::Debug for RequestOptionsSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOptionsSpec")
            .field("cleanup_timeout_ms", &self.cleanup_timeout_ms)
            .field("metadata", &self.metadata)
            .field("defaults", &self.defaults)
            .field(
                "request_interceptor",
                &self.request_interceptor.as_ref().map(|_| "<fn>"),
            )
            .field(
                "response_interceptor",
                &self.response_interceptor.as_ref().map(|_| "<fn>"),
            )
            .finish()
    }
}

/// Shallow-merges two JSON object values, child keys winning.
fn merge_metadata(
    parent: Option<&serde_json::Value>,
    child: Option<&serde_json::Value>,
) -> Option<serde_json::Value> {
    match (parent, child) {
        (Some(serde_json::Value::Object(p)), Some(serde_json::Value::Object(c))) => {
            let mut merged = p.clone();
            merged.extend(c.clone());
            Some(serde_json::Value::Object(merged))
        }
        (_, Some(child)) => Some(child.clone()),
        (Some(parent), None) => Some(parent.clone()),
        (None, None) => None,
    }
}

/// Generator output describing one client (and optionally its sub-clients).
#[derive(Clone, Default)]
pub struct ClientSpec {
    /// Fleet-unique name; sub-clients are renamed `parent:child`
    pub name: String,
    /// `None` means NoLimit at the top level, and "share the parent's
    /// limit" on a sub-client
    pub rate_limit: Option<RateLimitSpec>,
    pub rate_limit_change: Option<RateLimitChange>,
    pub request_options: RequestOptionsSpec,
    pub retry_options: RetryOptionsSpec,
    /// Status codes logged at debug instead of error
    pub http_status_codes_to_mute: Option<Vec<u16>>,
    pub health_check_interval_ms: Option<u64>,
    pub metadata: Option<serde_json::Value>,
    pub http_options: HttpOptions,
    pub authentication: Option<AuthSpec>,
    pub sub_clients: Vec<ClientSpec>,
}

impl ClientSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Effective rate limit for a flattened spec.
    pub fn effective_rate_limit(&self) -> RateLimitSpec {
        self.rate_limit.clone().unwrap_or(RateLimitSpec::NoLimit)
    }

    pub fn health_check_interval_ms(&self) -> u64 {
        self.health_check_interval_ms
            .unwrap_or(DEFAULT_HEALTH_CHECK_INTERVAL_MS)
    }

    /// True when the status should be muted down to debug logging.
    pub fn mutes_status(&self, status: u16) -> bool {
        self.http_status_codes_to_mute
            .as_ref()
            .map(|codes| codes.contains(&status))
            .unwrap_or(false)
    }

    /// Applies instance-level defaults *under* this spec (the spec wins).
    pub fn with_defaults(mut self, defaults: &DefaultClientOptions) -> ClientSpec {
        self.request_options = self.request_options.merged_over(&defaults.request_options);
        self.retry_options = self.retry_options.merged_over(&defaults.retry_options);
        self.http_options = self.http_options.merged_over(&defaults.http_options);
        self.http_status_codes_to_mute = self
            .http_status_codes_to_mute
            .or_else(|| defaults.http_status_codes_to_mute.clone());
        self.health_check_interval_ms = self
            .health_check_interval_ms
            .or(defaults.health_check_interval_ms);
        self
    }

    /// Flattens this spec and its sub-clients into effective specs.
    ///
    /// Children inherit by shallow-merge with their own values winning; a
    /// child without an explicit rate limit shares the parent's through
    /// `sharedLimit`. Nested sub-clients chain names: `a:b:c`.
    pub fn flatten(mut self) -> Vec<ClientSpec> {
        let children = std::mem::take(&mut self.sub_clients);
        let parent = self;

        let mut flattened = vec![parent.clone()];
        for child in children {
            let merged = merge_child(&parent, child);
            flattened.extend(merged.flatten());
        }
        flattened
    }
}

/// Builds the effective spec of one sub-client from its parent.
fn merge_child(parent: &ClientSpec, child: ClientSpec) -> ClientSpec {
    ClientSpec {
        name: format!("{}:{}", parent.name, child.name),
        rate_limit: child.rate_limit.clone().or_else(|| {
            Some(RateLimitSpec::SharedLimit {
                client_name: parent.name.clone(),
            })
        }),
        rate_limit_change: child
            .rate_limit_change
            .clone()
            .or_else(|| parent.rate_limit_change.clone()),
        request_options: child.request_options.merged_over(&parent.request_options),
        retry_options: child.retry_options.merged_over(&parent.retry_options),
        http_status_codes_to_mute: child
            .http_status_codes_to_mute
            .clone()
            .or_else(|| parent.http_status_codes_to_mute.clone()),
        health_check_interval_ms: child
            .health_check_interval_ms
            .or(parent.health_check_interval_ms),
        metadata: merge_metadata(parent.metadata.as_ref(), child.metadata.as_ref()),
        http_options: child.http_options.merged_over(&parent.http_options),
        authentication: child
            .authentication
            .clone()
            .or_else(|| parent.authentication.clone()),
        sub_clients: child.sub_clients,
    }
}

// Debug favors the scalar fields; hook closures print as "<fn>".
impl fmt::Debug for ClientSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSpec")
            .field("name", &self.name)
            .field("rate_limit", &self.rate_limit)
            .field(
                "rate_limit_change",
                &self.rate_limit_change.as_ref().map(|_| "<fn>"),
            )
            .field("request_options", &self.request_options)
            .field("retry_options", &self.retry_options)
            .field("http_status_codes_to_mute", &self.http_status_codes_to_mute)
            .field("health_check_interval_ms", &self.health_check_interval_ms)
            .field("metadata", &self.metadata)
            .field("http_options", &self.http_options)
            .field("authentication", &self.authentication)
            .field("sub_clients", &self.sub_clients)
            .finish()
    }
}

/// Instance-level defaults merged under every generated spec.
#[derive(Debug, Clone, Default)]
pub struct DefaultClientOptions {
    pub request_options: RequestOptionsSpec,
    pub retry_options: RetryOptionsSpec,
    pub http_options: HttpOptions,
    pub http_status_codes_to_mute: Option<Vec<u16>>,
    pub health_check_interval_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn parent_with_sub() -> ClientSpec {
        let mut parent = ClientSpec::new("api");
        parent.rate_limit = Some(RateLimitSpec::ConcurrencyLimit { max_concurrency: 5 });
        parent.authentication = Some(AuthSpec::Token {
            token: "X".to_string(),
            encode_base64: false,
            header_name: None,
            prefix: None,
            exclude_prefix: false,
        });

        let mut sub = ClientSpec::new("images");
        sub.request_options.defaults = RequestDefaults {
            base_url: Some("https://img.example".to_string()),
            ..Default::default()
        };
        parent.sub_clients = vec![sub];
        parent
    }

    #[test]
    fn test_sub_client_inherits_auth_and_shares_limit() {
        let flattened = parent_with_sub().flatten();
        assert_eq!(flattened.len(), 2);
        assert_eq!(flattened[0].name, "api");
        assert!(flattened[0].sub_clients.is_empty());

        let child = &flattened[1];
        assert_eq!(child.name, "api:images");
        assert_eq!(
            child.effective_rate_limit(),
            RateLimitSpec::SharedLimit {
                client_name: "api".to_string()
            }
        );
        assert!(matches!(
            child.authentication,
            Some(AuthSpec::Token { ref token, .. }) if token == "X"
        ));
        assert_eq!(
            child.request_options.defaults.base_url.as_deref(),
            Some("https://img.example")
        );
    }

    #[test]
    fn test_child_explicit_rate_limit_wins() {
        let mut parent = parent_with_sub();
        parent.sub_clients[0].rate_limit = Some(RateLimitSpec::NoLimit);

        let flattened = parent.flatten();
        assert_eq!(flattened[1].effective_rate_limit(), RateLimitSpec::NoLimit);
    }

    #[test]
    fn test_nested_sub_clients_chain_names() {
        let mut grandchild = ClientSpec::new("thumbs");
        grandchild.rate_limit = None;
        let mut child = ClientSpec::new("images");
        child.sub_clients = vec![grandchild];
        let mut parent = ClientSpec::new("api");
        parent.rate_limit = Some(RateLimitSpec::ConcurrencyLimit { max_concurrency: 2 });
        parent.sub_clients = vec![child];

        let flattened = parent.flatten();
        let names: Vec<&str> = flattened.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["api", "api:images", "api:images:thumbs"]);
        // The grandchild shares its immediate parent's limit.
        assert_eq!(
            flattened[2].effective_rate_limit(),
            RateLimitSpec::SharedLimit {
                client_name: "api:images".to_string()
            }
        );
    }

    #[test]
    fn test_metadata_shallow_merge() {
        let mut parent = ClientSpec::new("api");
        parent.metadata = Some(serde_json::json!({"team": "platform", "tier": "gold"}));
        let mut sub = ClientSpec::new("images");
        sub.metadata = Some(serde_json::json!({"tier": "silver"}));
        parent.sub_clients = vec![sub];

        let flattened = parent.flatten();
        let metadata = flattened[1].metadata.as_ref().unwrap();
        assert_eq!(metadata["team"], "platform");
        assert_eq!(metadata["tier"], "silver");
    }

    #[test]
    fn test_defaults_applied_under_spec() {
        let defaults = DefaultClientOptions {
            retry_options: RetryOptionsSpec {
                max_retries: Some(7),
                retry_429s: Some(false),
                ..Default::default()
            },
            http_options: HttpOptions {
                timeout_ms: Some(5000),
                user_agent: Some("courier".to_string()),
            },
            ..Default::default()
        };

        let mut spec = ClientSpec::new("api");
        spec.retry_options.max_retries = Some(1);
        spec.http_options.timeout_ms = Some(100);

        let merged = spec.with_defaults(&defaults);
        let retry = merged.retry_options.build();
        assert_eq!(retry.max_retries, 1);
        assert!(!retry.retry_429s);
        assert_eq!(merged.http_options.timeout_ms, Some(100));
        assert_eq!(merged.http_options.user_agent.as_deref(), Some("courier"));
    }

    #[test]
    fn test_retry_spec_build_defaults() {
        let built = RetryOptionsSpec::default().build();
        assert_eq!(built.max_retries, 3);
        assert_eq!(built.retry_backoff_base_time, 1000);
        assert!(built.retry_429s);
        assert_eq!(built.thaw_request_count, 3);
    }

    #[test]
    fn test_request_defaults_merge_in_sub_client() {
        let mut parent = ClientSpec::new("api");
        parent.request_options.defaults.headers =
            HashMap::from([("Accept".to_string(), "application/json".to_string())]);
        let mut sub = ClientSpec::new("images");
        sub.request_options.defaults.headers =
            HashMap::from([("Accept".to_string(), "image/png".to_string())]);
        parent.sub_clients = vec![sub];

        let flattened = parent.flatten();
        assert_eq!(
            flattened[1].request_options.defaults.headers["Accept"],
            "image/png"
        );
    }
}
