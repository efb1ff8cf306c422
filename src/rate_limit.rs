//! # Rate-Limit Policies and Admission Engine
//!
//! Each client carries one [`RateLimitSpec`] variant; the controller for
//! that client runs the matching admission policy through a [`RateLimiter`].
//!
//! ## Policies
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                         Admission Policies                           │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                                                                      │
//! │  requestLimit (token bucket)                                         │
//! │  ┌────────────────────────────────────────────────────────────────┐  │
//! │  │ ticker: every `interval` ms add `tokensToAdd`, cap `maxTokens` │  │
//! │  │ admit(cost): wait until tokens ≥ cost, then tokens -= cost     │  │
//! │  │ freeze: tokens := 0, ticker paused                             │  │
//! │  └────────────────────────────────────────────────────────────────┘  │
//! │                                                                      │
//! │  concurrencyLimit (gate)                                             │
//! │  ┌────────────────────────────────────────────────────────────────┐  │
//! │  │ admit(cost): wait until inFlight + cost ≤ maxConcurrency       │  │
//! │  │ requestDone(cost): inFlight -= cost, re-evaluate waiters       │  │
//! │  └────────────────────────────────────────────────────────────────┘  │
//! │                                                                      │
//! │  noLimit     - admits immediately, never enqueues                    │
//! │  sharedLimit - forwards all admission to the named target client     │
//! │                                                                      │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Cooperative Waiting
//!
//! `admit` never spins: waiters park on a [`tokio::sync::Notify`] and are
//! woken by ticker ticks, `requestDone` observations, freeze/thaw edges and
//! spec changes. A freeze (or role loss) interrupts waiters so the admission
//! loop can re-check client state instead of admitting into a frozen client.

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};

/// Tagged rate-limit variant, wire-compatible across the fleet.
///
/// # Example
///
/// ```rust
/// use courier::rate_limit::RateLimitSpec;
///
/// let spec: RateLimitSpec = serde_json::from_str(
///     r#"{"type":"requestLimit","interval":1000,"tokensToAdd":1,"maxTokens":1}"#,
/// ).unwrap();
/// assert_eq!(spec.bucket_interval(), Some(1000));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RateLimitSpec {
    /// Admit immediately; the request pipeline skips the queue entirely.
    #[serde(rename = "noLimit")]
    NoLimit,

    /// Token bucket: `tokensToAdd` per `interval` ms, capped at `maxTokens`.
    #[serde(rename = "requestLimit", rename_all = "camelCase")]
    RequestLimit {
        /// Refill period in milliseconds
        interval: u64,
        /// Tokens added per refill
        tokens_to_add: u64,
        /// Bucket capacity
        max_tokens: u64,
    },

    /// Concurrency gate: admitted cost may not exceed `maxConcurrency`.
    #[serde(rename = "concurrencyLimit", rename_all = "camelCase")]
    ConcurrencyLimit {
        /// Maximum total cost in flight
        max_concurrency: u64,
    },

    /// Forwarder: all admission is delegated to the named client.
    #[serde(rename = "sharedLimit", rename_all = "camelCase")]
    SharedLimit {
        /// Client whose controller performs admission
        client_name: String,
    },
}

impl Default for RateLimitSpec {
    fn default() -> Self {
        RateLimitSpec::NoLimit
    }
}

impl RateLimitSpec {
    pub fn is_no_limit(&self) -> bool {
        matches!(self, RateLimitSpec::NoLimit)
    }

    /// Target client name for shared limits.
    pub fn shared_target(&self) -> Option<&str> {
        match self {
            RateLimitSpec::SharedLimit { client_name } => Some(client_name),
            _ => None,
        }
    }

    /// Refill period for token-bucket specs; also the retry backoff base
    /// for such clients.
    pub fn bucket_interval(&self) -> Option<u64> {
        match self {
            RateLimitSpec::RequestLimit { interval, .. } => Some(*interval),
            _ => None,
        }
    }
}

/// Outcome of an [`RateLimiter::admit`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Capacity was consumed; publish `requestReady`.
    Granted,
    /// A freeze, role change or shutdown interrupted the wait; the admission
    /// loop must re-check client state before continuing.
    Interrupted,
}

/// Point-in-time policy state, exposed through client stats and the
/// advisory `clientTokensUpdated` channel.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitSnapshot {
    /// The configured variant
    pub spec: RateLimitSpec,
    /// Current tokens (token bucket only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
    /// Current admitted cost (concurrency gate only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_flight: Option<u64>,
}

#[derive(Debug)]
struct LimiterState {
    spec: RateLimitSpec,
    /// Token bucket balance; unused by other variants
    tokens: u64,
    /// Admitted cost; maintained by the concurrency gate
    in_flight: u64,
    /// Set while waiters must not be granted admission
    interrupted: bool,
}

/// Admission engine for a single client.
///
/// The controller is the only instance whose decisions are authoritative;
/// workers hold a `RateLimiter` too, but only to mirror advisory token
/// counts for stats.
#[derive(Debug)]
pub struct RateLimiter {
    state: Mutex<LimiterState>,
    notify: Notify,
}

impl RateLimiter {
    /// Creates a limiter for the given spec. Token buckets start full.
    pub fn new(spec: RateLimitSpec) -> Self {
        let tokens = match &spec {
            RateLimitSpec::RequestLimit { max_tokens, .. } => *max_tokens,
            _ => 0,
        };

        Self {
            state: Mutex::new(LimiterState {
                spec,
                tokens,
                in_flight: 0,
                interrupted: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Waits until `cost` can be admitted, then consumes it.
    ///
    /// Returns [`Admission::Interrupted`] when [`RateLimiter::interrupt`]
    /// fires while waiting (freeze, role loss, shutdown). `NoLimit` and
    /// `SharedLimit` grant immediately; shared clients are never admitted
    /// here in practice because their records queue under the target.
    pub async fn admit(&self, cost: u64) -> Admission {
        loop {
            // Register interest before checking state so a notify between
            // the check and the await cannot be lost.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut guard = self.state.lock().await;
                let state = &mut *guard;
                if state.interrupted {
                    return Admission::Interrupted;
                }

                match &state.spec {
                    RateLimitSpec::NoLimit | RateLimitSpec::SharedLimit { .. } => {
                        return Admission::Granted;
                    }
                    RateLimitSpec::RequestLimit { .. } => {
                        if state.tokens >= cost {
                            state.tokens -= cost;
                            return Admission::Granted;
                        }
                    }
                    RateLimitSpec::ConcurrencyLimit { max_concurrency } => {
                        if state.in_flight + cost <= *max_concurrency {
                            state.in_flight += cost;
                            return Admission::Granted;
                        }
                    }
                }
            }

            notified.await;
        }
    }

    /// Observes a finished request, releasing concurrency capacity and
    /// re-evaluating waiters.
    pub async fn on_request_done(&self, cost: u64) {
        let mut state = self.state.lock().await;
        if matches!(state.spec, RateLimitSpec::ConcurrencyLimit { .. }) {
            state.in_flight = state.in_flight.saturating_sub(cost);
        }
        drop(state);
        self.notify.notify_waiters();
    }

    /// One refill tick. Returns the new balance for the advisory publish,
    /// or `None` when the spec has no bucket or the client is frozen.
    pub async fn tick(&self, frozen: bool) -> Option<u64> {
        let mut state = self.state.lock().await;
        if frozen {
            return None;
        }
        let (tokens_to_add, max_tokens) = match &state.spec {
            RateLimitSpec::RequestLimit {
                tokens_to_add,
                max_tokens,
                ..
            } => (*tokens_to_add, *max_tokens),
            _ => return None,
        };

        state.tokens = (state.tokens + tokens_to_add).min(max_tokens);
        let balance = state.tokens;
        drop(state);
        self.notify.notify_waiters();
        Some(balance)
    }

    /// Empties the bucket. Applied on every freeze of a token-bucket client.
    pub async fn zero_tokens(&self) {
        let mut state = self.state.lock().await;
        state.tokens = 0;
    }

    /// Overwrites the advisory token balance (workers mirroring the
    /// controller's `clientTokensUpdated` publishes).
    pub async fn set_tokens(&self, tokens: u64) {
        let mut state = self.state.lock().await;
        if matches!(state.spec, RateLimitSpec::RequestLimit { .. }) {
            state.tokens = tokens;
        }
    }

    /// Wakes all waiters with an interrupt; they return
    /// [`Admission::Interrupted`] until [`RateLimiter::resume`].
    pub async fn interrupt(&self) {
        let mut state = self.state.lock().await;
        state.interrupted = true;
        drop(state);
        self.notify.notify_waiters();
    }

    /// Clears the interrupt flag and re-evaluates waiters.
    pub async fn resume(&self) {
        let mut state = self.state.lock().await;
        state.interrupted = false;
        drop(state);
        self.notify.notify_waiters();
    }

    /// Replaces the spec at runtime (`rateLimitUpdated`). Token balances
    /// are clamped into the new capacity; concurrency accounting carries
    /// over so in-flight requests still release their cost.
    pub async fn set_spec(&self, spec: RateLimitSpec) {
        let mut state = self.state.lock().await;
        if let RateLimitSpec::RequestLimit { max_tokens, .. } = &spec {
            state.tokens = state.tokens.min(*max_tokens);
        }
        state.spec = spec;
        drop(state);
        self.notify.notify_waiters();
    }

    pub async fn spec(&self) -> RateLimitSpec {
        self.state.lock().await.spec.clone()
    }

    /// Current bucket balance, when the spec has one.
    pub async fn tokens(&self) -> Option<u64> {
        let state = self.state.lock().await;
        match state.spec {
            RateLimitSpec::RequestLimit { .. } => Some(state.tokens),
            _ => None,
        }
    }

    pub async fn snapshot(&self) -> RateLimitSnapshot {
        let state = self.state.lock().await;
        let tokens = match state.spec {
            RateLimitSpec::RequestLimit { .. } => Some(state.tokens),
            _ => None,
        };
        let in_flight = match state.spec {
            RateLimitSpec::ConcurrencyLimit { .. } => Some(state.in_flight),
            _ => None,
        };
        RateLimitSnapshot {
            spec: state.spec.clone(),
            tokens,
            in_flight,
        }
    }
}
