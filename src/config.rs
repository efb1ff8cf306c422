//! Instance construction options.

use crate::client_spec::{ClientGenerator, ClientSpec, DefaultClientOptions};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Options for constructing a [`crate::courier::Courier`] instance.
///
/// Every instance of a fleet must share the same `key` (so encrypted
/// tokens are readable fleet-wide) and the same `redis_key_prefix` (so
/// they meet on the same channels and keys).
#[derive(Clone)]
pub struct CourierOptions {
    /// Process-wide symmetric encryption secret for the token cache
    pub key: String,
    /// Redis connection URL, e.g. `redis://localhost:6379`
    pub redis_url: String,
    /// Namespace prefix for every key and channel (default empty)
    pub redis_key_prefix: String,
    /// Election priority of this instance, higher wins (default 1)
    pub priority: i32,
    /// Generators producing the client set, keyed by generator name
    pub client_generators: HashMap<String, ClientGenerator>,
    /// Defaults merged under every generated spec
    pub default_client_options: DefaultClientOptions,
}

impl CourierOptions {
    pub fn new(key: impl Into<String>, redis_url: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            redis_url: redis_url.into(),
            redis_key_prefix: String::new(),
            priority: 1,
            client_generators: HashMap::new(),
            default_client_options: DefaultClientOptions::default(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.redis_key_prefix = prefix.into();
        self
    }

    /// Registers a generator function under a name.
    pub fn with_generator<F>(mut self, name: impl Into<String>, generator: F) -> Self
    where
        F: Fn() -> Vec<ClientSpec> + Send + Sync + 'static,
    {
        self.client_generators
            .insert(name.into(), Arc::new(generator));
        self
    }

    pub fn with_default_client_options(mut self, defaults: DefaultClientOptions) -> Self {
        self.default_client_options = defaults;
        self
    }
}

impl fmt::Debug for CourierOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CourierOptions")
            .field("redis_url", &self.redis_url)
            .field("redis_key_prefix", &self.redis_key_prefix)
            .field("priority", &self.priority)
            .field(
                "client_generators",
                &self.client_generators.keys().collect::<Vec<_>>(),
            )
            .field("default_client_options", &self.default_client_options)
            .finish()
    }
}
