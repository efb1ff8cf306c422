//! # Courier - A Distributed Outbound Request Coordinator
//!
//! Courier coordinates outbound HTTP calls across a fleet of cooperating
//! processes that share one Redis deployment. Applications submit calls to
//! *named clients*; the fleet enforces per-client rate limits, retries,
//! authentication, and priority queueing as if it were one logical rate
//! limiter.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────┐     ┌──────────────────────────┐     ┌─────────────┐
//! │ Application │────▶│    Courier Instance      │◀───▶│    Redis    │
//! │             │     │                          │     │ (pub/sub +  │
//! └─────────────┘     └──────────────────────────┘     │  keys)      │
//!                                  │                   └──────┬──────┘
//!                     ┌────────────┼────────────┐             │
//!                     ▼            ▼            ▼             ▼
//!                ┌─────────┐ ┌──────────┐ ┌──────────┐  other instances
//!                │ Clients │ │Ownership │ │  Auth    │  (same fleet)
//!                │ + queues│ │ election │ │  cache   │
//!                └─────────┘ └──────────┘ └──────────┘
//! ```
//!
//! ## Core Components
//!
//! - **[`Courier`]** - Process-level façade: lifecycle, election, routing
//! - **[`Client`](client::Client)** - Per-upstream coordinator: admission
//!   loop, freeze/thaw, retries, heartbeats
//! - **[`RateLimiter`](rate_limit::RateLimiter)** - Cooperative admission
//!   engine for the policy variants
//! - **[`RedisTransport`](redis::RedisTransport)** - Publisher + subscriber
//!   connections and the namespaced key layout
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use courier::{ClientSpec, Courier, CourierOptions, RateLimitSpec, RequestConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = CourierOptions::new("fleet-secret", "redis://localhost:6379")
//!         .with_generator("github", || {
//!             let mut spec = ClientSpec::new("github");
//!             spec.rate_limit = Some(RateLimitSpec::RequestLimit {
//!                 interval: 1000,
//!                 tokens_to_add: 10,
//!                 max_tokens: 10,
//!             });
//!             vec![spec]
//!         });
//!
//!     let courier = Courier::new(options);
//!     courier.start().await?;
//!
//!     let response = courier
//!         .handle_request(RequestConfig::get("github", "https://api.github.com/zen"))
//!         .await?;
//!     println!("{}", response.text());
//!
//!     courier.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Request Flow
//!
//! 1. `handle_request` builds a request record and broadcasts `requestAdded`
//! 2. The elected controller for that client queues it in priority order
//! 3. When the rate-limit policy admits it, the controller publishes
//!    `requestReady`
//! 4. The originating instance executes the HTTP call and publishes
//!    `requestDone`, unblocking the next admission
//! 5. Failures are classified and retried with exponential backoff; rate
//!    limit responses freeze the controller and thaw it gradually
//!
//! ## One Controller Per Client
//!
//! Every instance heartbeats (1 s) a registration with a 3 s TTL. For each
//! client name the fleet orders instances by priority (ties: greater id)
//! and the first registrant is controller; everyone else is a worker that
//! submits requests and waits for `requestReady`. A dead controller is
//! replaced within one heartbeat expiry, resuming from the queue mirror
//! every instance maintains.
//!
//! ## Module Organization
//!
//! - [`auth`] - Basic/token/OAuth2 headers and the encrypted token cache
//! - [`client`] - Per-client coordinator and request pipeline
//! - [`client_spec`] - Generator specs, defaults merge, sub-clients
//! - [`config`] - Instance construction options
//! - [`courier`] - Instance façade and pub/sub router
//! - [`crypto`] - AES-256-GCM cipher for cached credentials
//! - [`error`] - Error taxonomy
//! - [`events`] - Request-id keyed one-shot completion bus
//! - [`http`] - Request/response shapes and pipeline hooks
//! - [`metrics`] - Instance-local request counters
//! - [`ownership`] - Peer table and leader election
//! - [`protocol`] - Pub/sub channels and payloads
//! - [`queue`] - Priority-ordered request map
//! - [`rate_limit`] - Rate-limit policies and admission engine
//! - [`record`] - Request record value object
//! - [`redis`] - Redis transport and key layout
//! - [`retry`] - Retry classification and backoff
//! - [`validation`] - Structural checks on generator output

pub mod auth;
pub mod client;
pub mod client_spec;
pub mod config;
pub mod courier;
pub mod crypto;
pub mod error;
pub mod events;
pub mod http;
pub mod metrics;
pub mod ownership;
pub mod protocol;
pub mod queue;
pub mod rate_limit;
pub mod record;
pub mod redis;
pub mod retry;
pub mod validation;

// Re-export commonly used types
pub use auth::AuthSpec;
pub use client::ClientStats;
pub use client_spec::{ClientSpec, DefaultClientOptions};
pub use config::CourierOptions;
pub use courier::{Courier, InstanceStatus};
pub use error::{CourierError, TransportError};
pub use http::{RequestConfig, Response};
pub use metrics::{ClientMetrics, MetricsCollector};
pub use rate_limit::RateLimitSpec;
pub use record::RequestRecord;
pub use retry::{BackoffMethod, RetryOptions};

/// Result type alias for courier operations
pub type Result<T> = std::result::Result<T, CourierError>;

/// Version of the courier library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
