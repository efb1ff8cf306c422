//! # Client Coordinator
//!
//! One [`Client`] per named upstream. On every instance it mirrors the
//! request queue and executes the originator side of the pipeline; on the
//! one instance elected controller it additionally runs the admission loop,
//! the token ticker, the stale-request sweeper and the health check.
//!
//! ## Controller Admission Loop
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        Admission Loop (one per client)               │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                                                                      │
//! │   claim loop guard (UUID) ── already claimed? ──▶ return             │
//! │        │                                                             │
//! │        ▼                                                             │
//! │   ┌─▶ role still controller? frozen? thaw probe outstanding? ──▶ break
//! │   │    │                                                             │
//! │   │    ▼                                                             │
//! │   │   next eligible request (priority order) ── none ──▶ break       │
//! │   │    │                                                             │
//! │   │    ▼                                                             │
//! │   │   policy.admit(cost)  ── interrupted ──▶ break                   │
//! │   │    │                                                             │
//! │   │    ▼                                                             │
//! │   │   mark inProgress, publish requestReady                          │
//! │   │    │                                                             │
//! │   └────┘ (thawing: record the probe id and break)                    │
//! │                                                                      │
//! │   release loop guard                                                 │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The loop is restarted by `kick_admission` on every event that could
//! unblock it: a new request, a finished request, a refill tick, an
//! unfreeze, a promotion, or the health check. The UUID guard makes kicks
//! idempotent - at most one loop runs per client.
//!
//! ## Originator Pipeline
//!
//! `handle_request` merges the client defaults under the caller's config,
//! enqueues a record, heartbeats it every second, waits for `requestReady`,
//! executes the HTTP call, and publishes `requestDone` carrying the retry
//! verdict. Queued clients get their backoff from the controller freeze;
//! `noLimit` clients sleep it locally, having no controller.

use crate::auth::Authenticator;
use crate::client_spec::ClientSpec;
use crate::crypto::TokenCipher;
use crate::error::{CourierError, Result, TransportError};
use crate::events::ReadyBus;
use crate::http::{RequestConfig, Response};
use crate::metrics::MetricsCollector;
use crate::ownership::Role;
use crate::protocol::{Channel, RequestDoneMessage, RateLimitUpdatedMessage, TokensUpdatedMessage};
use crate::queue::{QueueTotals, RequestQueue};
use crate::rate_limit::{Admission, RateLimitSnapshot, RateLimiter, RateLimitSpec};
use crate::record::{RequestRecord, RequestStatus};
use crate::redis::RedisTransport;
use crate::retry::RetryOptions;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

/// Cadence of `requestHeartbeat` publishes on the originator.
const REQUEST_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// A record silent for this long is presumed abandoned by its originator.
const REQUEST_HEARTBEAT_EXPIRY: Duration = Duration::from_secs(3);

/// Cadence of the controller's stale-request sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Freeze/thaw state of the controller.
#[derive(Debug, Default)]
struct FreezeState {
    frozen: bool,
    /// Successes still required before normal admission resumes
    thaw_remaining: u32,
    /// The single probe allowed in flight while thawing
    thaw_request_id: Option<String>,
    freeze_timer: Option<JoinHandle<()>>,
}

/// Background tasks owned by the controller role.
#[derive(Debug, Default)]
struct ControllerTasks {
    ticker: Option<JoinHandle<()>>,
    sweeper: Option<JoinHandle<()>>,
    health: Option<JoinHandle<()>>,
}

impl ControllerTasks {
    fn abort_all(&mut self) {
        for handle in [
            self.ticker.take(),
            self.sweeper.take(),
            self.health.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

/// Point-in-time view of one client, shaped for the stats API.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientStats {
    pub client_name: String,
    pub is_frozen: bool,
    pub is_thawing: bool,
    pub thaw_request_count: u32,
    pub rate_limit: RateLimitSnapshot,
    pub requests_in_queue: QueueTotals,
    pub requests_in_progress: QueueTotals,
}

/// Per-named-target coordinator.
pub struct Client {
    /// Self-handle for the background tasks this client spawns
    weak: Weak<Client>,
    name: String,
    spec: ClientSpec,
    retry: RetryOptions,
    role: RwLock<Role>,
    limiter: RateLimiter,
    queue: Mutex<RequestQueue>,
    freeze: Mutex<FreezeState>,
    /// Single-owner guard for the admission loop
    loop_guard: Mutex<Option<Uuid>>,
    tasks: Mutex<ControllerTasks>,
    transport: Arc<RedisTransport>,
    bus: Arc<ReadyBus>,
    http: reqwest::Client,
    authenticator: Option<Authenticator>,
    metrics: MetricsCollector,
}

impl Client {
    /// Builds a client from an effective (flattened, defaults-merged) spec.
    /// All clients start as workers; ownership promotes one of them.
    pub fn new(
        spec: ClientSpec,
        transport: Arc<RedisTransport>,
        bus: Arc<ReadyBus>,
        cipher: TokenCipher,
        metrics: MetricsCollector,
    ) -> Result<Arc<Client>> {
        let mut builder = reqwest::Client::builder();
        if let Some(user_agent) = &spec.http_options.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let http = builder
            .build()
            .map_err(|e| CourierError::Internal(format!("failed to build http client: {}", e)))?;

        let authenticator = spec.authentication.clone().map(|auth| {
            Authenticator::new(
                auth,
                transport.keyspace().oauth2(&spec.name),
                cipher,
                http.clone(),
            )
        });

        let retry = spec.retry_options.build();
        let limiter = RateLimiter::new(spec.effective_rate_limit());

        Ok(Arc::new_cyclic(|weak| Client {
            weak: weak.clone(),
            name: spec.name.clone(),
            retry,
            limiter,
            spec,
            role: RwLock::new(Role::Worker),
            queue: Mutex::new(RequestQueue::new()),
            freeze: Mutex::new(FreezeState::default()),
            loop_guard: Mutex::new(None),
            tasks: Mutex::new(ControllerTasks::default()),
            transport,
            bus,
            http,
            authenticator,
            metrics,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn role(&self) -> Role {
        *self.role.read().await
    }

    /// Shared-limit clients delegate admission to their target and never
    /// become controllers themselves.
    pub async fn is_shared(&self) -> bool {
        self.limiter.spec().await.shared_target().is_some()
    }

    /// Redis keys this client owns; deleted on destroy instead of a scan.
    pub fn tracked_keys(&self) -> Vec<String> {
        self.authenticator
            .as_ref()
            .map(|a| vec![a.cache_key().to_string()])
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Role transitions
    // ------------------------------------------------------------------

    /// Applies an ownership decision. Idempotent: an unchanged role is a
    /// no-op.
    pub async fn set_role(&self, new_role: Role) {
        {
            let mut role = self.role.write().await;
            if *role == new_role {
                return;
            }
            *role = new_role;
        }

        match new_role {
            Role::Controller => {
                tracing::info!(client = %self.name, "promoted to controller");
                self.limiter.resume().await;
                self.start_controller_tasks().await;
                self.kick_admission();
            }
            Role::Worker => {
                tracing::info!(client = %self.name, "demoted to worker");
                self.limiter.interrupt().await;
                self.stop_controller_tasks().await;
            }
        }
    }

    async fn start_controller_tasks(&self) {
        let mut tasks = self.tasks.lock().await;
        tasks.abort_all();
        tasks.ticker = self.spawn_ticker().await;
        tasks.sweeper = self.spawn_sweeper();
        tasks.health = self.spawn_health_check();
    }

    async fn stop_controller_tasks(&self) {
        self.tasks.lock().await.abort_all();
    }

    /// Background refill ticker; only token-bucket clients have one.
    async fn spawn_ticker(&self) -> Option<JoinHandle<()>> {
        let interval_ms = self.limiter.spec().await.bucket_interval()?;
        let Some(client) = self.weak.upgrade() else {
            return None;
        };
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The immediate first tick would double the initial capacity.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let frozen = client.freeze.lock().await.frozen;
                if let Some(balance) = client.limiter.tick(frozen).await {
                    client.publish_tokens(balance).await;
                    client.kick_admission();
                }
            }
        }))
    }

    /// Drops records whose originator stopped heartbeating and frees any
    /// capacity they held.
    fn spawn_sweeper(&self) -> Option<JoinHandle<()>> {
        let client = self.weak.upgrade()?;
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let dropped = {
                    let mut queue = client.queue.lock().await;
                    queue.sweep_stale(REQUEST_HEARTBEAT_EXPIRY)
                };
                for record in &dropped {
                    tracing::warn!(
                        client = %client.name,
                        request = %record.request_id,
                        "dropping stale request (originator heartbeat lapsed)"
                    );
                    if record.is_in_progress() {
                        client.limiter.on_request_done(record.cost as u64).await;
                    }
                }
                if !dropped.is_empty() {
                    client.kick_admission();
                }
            }
        }))
    }

    /// Periodic reconciliation: restarts a dead ticker and re-kicks the
    /// admission loop in case a wakeup was lost.
    fn spawn_health_check(&self) -> Option<JoinHandle<()>> {
        let client = self.weak.upgrade()?;
        let interval_ms = self.spec.health_check_interval_ms();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                client.ensure_ticker().await;
                client.kick_admission();
                let queue_len = client.queue.lock().await.len();
                tracing::debug!(client = %client.name, queue_len, "health check");
            }
        }))
    }

    async fn ensure_ticker(&self) {
        if *self.role.read().await != Role::Controller {
            return;
        }
        let mut tasks = self.tasks.lock().await;
        let dead = tasks
            .ticker
            .as_ref()
            .map(|t| t.is_finished())
            .unwrap_or(true);
        if dead {
            if let Some(handle) = self.spawn_ticker().await {
                tracing::warn!(client = %self.name, "restarting dropped token ticker");
                tasks.ticker = Some(handle);
            }
        }
    }

    // ------------------------------------------------------------------
    // Admission loop
    // ------------------------------------------------------------------

    /// Starts the admission loop if it is not already running. Cheap to
    /// call on every wakeup-worthy event.
    pub fn kick_admission(&self) {
        let Some(client) = self.weak.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            client.run_admission_loop().await;
        });
    }

    async fn run_admission_loop(self: Arc<Self>) {
        let guard = Uuid::new_v4();
        {
            let mut slot = self.loop_guard.lock().await;
            if slot.is_some() {
                return;
            }
            *slot = Some(guard);
        }

        loop {
            if *self.role.read().await != Role::Controller {
                break;
            }
            {
                let freeze = self.freeze.lock().await;
                if freeze.frozen || freeze.thaw_request_id.is_some() {
                    break;
                }
            }

            let next = {
                let mut queue = self.queue.lock().await;
                queue.next_eligible()
            };
            let Some(next) = next else { break };

            if self.limiter.admit(next.cost as u64).await == Admission::Interrupted {
                break;
            }
            // Re-check after the cooperative wait: a demotion or freeze may
            // have landed while we were parked.
            if *self.role.read().await != Role::Controller {
                self.limiter.on_request_done(next.cost as u64).await;
                break;
            }

            let ready = {
                let mut queue = self.queue.lock().await;
                queue.mark_in_progress(&next.request_id)
            };
            let Some(ready) = ready else {
                // The record vanished while we waited (swept or done).
                self.limiter.on_request_done(next.cost as u64).await;
                continue;
            };

            if let Some(balance) = self.limiter.tokens().await {
                self.publish_tokens(balance).await;
            }

            if let Err(err) = self.transport.publish(Channel::RequestReady, &ready).await {
                tracing::warn!(
                    client = %self.name,
                    request = %ready.request_id,
                    error = %err,
                    "failed to publish requestReady, re-queueing"
                );
                let mut requeued = ready.clone();
                requeued.status = RequestStatus::InQueue;
                self.queue.lock().await.upsert(requeued);
                self.limiter.on_request_done(ready.cost as u64).await;
                break;
            }

            tracing::debug!(
                client = %self.name,
                request = %ready.request_id,
                cost = ready.cost,
                "request admitted"
            );

            {
                let mut freeze = self.freeze.lock().await;
                if freeze.thaw_remaining > 0 {
                    freeze.thaw_request_id = Some(ready.request_id.clone());
                    break;
                }
            }
        }

        let mut slot = self.loop_guard.lock().await;
        if *slot == Some(guard) {
            *slot = None;
        }
    }

    async fn publish_tokens(&self, tokens: u64) {
        let message = TokensUpdatedMessage {
            client_name: self.name.clone(),
            tokens,
        };
        if let Err(err) = self
            .transport
            .publish(Channel::ClientTokensUpdated, &message)
            .await
        {
            tracing::warn!(client = %self.name, error = %err, "failed to publish token balance");
        }
    }

    // ------------------------------------------------------------------
    // Freeze / thaw
    // ------------------------------------------------------------------

    async fn freeze_for(&self, wait_ms: u64, is_rate_limited: bool) {
        tracing::info!(
            client = %self.name,
            wait_ms,
            is_rate_limited,
            "freezing admissions"
        );

        {
            let mut freeze = self.freeze.lock().await;
            if let Some(timer) = freeze.freeze_timer.take() {
                timer.abort();
            }
            freeze.frozen = true;
            if is_rate_limited {
                freeze.thaw_remaining = self.retry.thaw_request_count;
            }

            if let Some(client) = self.weak.upgrade() {
                freeze.freeze_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                    {
                        let mut freeze = client.freeze.lock().await;
                        freeze.frozen = false;
                        freeze.freeze_timer = None;
                    }
                    tracing::debug!(client = %client.name, "freeze lapsed, resuming admission");
                    client.limiter.resume().await;
                    client.kick_admission();
                }));
            }
        }

        self.limiter.zero_tokens().await;
        self.limiter.interrupt().await;
    }

    // ------------------------------------------------------------------
    // Pub/sub event handlers (called by the instance router)
    // ------------------------------------------------------------------

    /// `requestAdded`: mirror the record; the controller also wakes the
    /// admission loop.
    pub async fn on_request_added(&self, record: RequestRecord) {
        self.queue.lock().await.upsert(record);
        if *self.role.read().await == Role::Controller {
            self.kick_admission();
        }
    }

    /// `requestHeartbeat`: refresh liveness. A heartbeat for an unknown
    /// record re-inserts it - this is how a record survives a lost
    /// `requestAdded` or a controller promotion with a cold map.
    pub async fn on_request_heartbeat(&self, record: RequestRecord) {
        let known = {
            let mut queue = self.queue.lock().await;
            if queue.contains(&record.request_id) {
                queue.touch(&record.request_id);
                true
            } else {
                queue.upsert(record);
                false
            }
        };
        if !known && *self.role.read().await == Role::Controller {
            self.kick_admission();
        }
    }

    /// `requestReady`: mirror the admission. (The originator's ready bus
    /// is completed by the instance router, not here.)
    pub async fn on_request_ready(&self, record: RequestRecord) {
        self.queue.lock().await.apply(record);
    }

    /// `requestDone`: retire the record everywhere; the controller also
    /// releases capacity and applies freeze/thaw bookkeeping.
    pub async fn on_request_done(&self, message: &RequestDoneMessage) {
        let removed = {
            let mut queue = self.queue.lock().await;
            queue.remove(&message.record.request_id)
        };

        if *self.role.read().await != Role::Controller {
            return;
        }

        let was_in_progress = removed
            .as_ref()
            .map(|r| r.is_in_progress())
            .unwrap_or_else(|| message.record.is_in_progress());
        if was_in_progress {
            self.limiter.on_request_done(message.record.cost as u64).await;
        }

        {
            let mut freeze = self.freeze.lock().await;
            if freeze.thaw_request_id.as_deref() == Some(message.record.request_id.as_str()) {
                freeze.thaw_request_id = None;
            }
            if message.success && freeze.thaw_remaining > 0 {
                freeze.thaw_remaining -= 1;
                if freeze.thaw_remaining == 0 {
                    tracing::info!(client = %self.name, "thaw complete, normal admission resumes");
                }
            }
        }

        if message.wait_time > 0 {
            self.freeze_for(message.wait_time, message.is_rate_limited).await;
        } else {
            self.kick_admission();
        }
    }

    /// `clientTokensUpdated`: workers mirror the advisory balance.
    pub async fn on_tokens_updated(&self, tokens: u64) {
        if *self.role.read().await == Role::Worker {
            self.limiter.set_tokens(tokens).await;
        }
    }

    /// `rateLimitUpdated`: apply a live spec change; the controller swaps
    /// its ticker to the new cadence.
    pub async fn on_rate_limit_updated(&self, spec: RateLimitSpec) {
        self.limiter.set_spec(spec).await;
        if *self.role.read().await == Role::Controller {
            let mut tasks = self.tasks.lock().await;
            if let Some(ticker) = tasks.ticker.take() {
                ticker.abort();
            }
            tasks.ticker = self.spawn_ticker().await;
            drop(tasks);
            self.kick_admission();
        }
    }

    // ------------------------------------------------------------------
    // Originator pipeline
    // ------------------------------------------------------------------

    /// Executes one coordinated request: enqueue, await admission, call,
    /// retry per policy. See the module docs for the full walk-through.
    pub async fn handle_request(&self, mut config: RequestConfig) -> Result<Response> {
        self.metrics.record_submitted(&self.name).await;
        self.spec.request_options.defaults.apply_under(&mut config);

        let policy = self.limiter.spec().await;
        let direct = policy.is_no_limit();
        let admission_client = policy
            .shared_target()
            .unwrap_or(self.name.as_str())
            .to_string();

        let cleanup_timeout =
            Duration::from_millis(self.spec.request_options.cleanup_timeout_ms());
        let mut record = RequestRecord::new(admission_client, config.priority, config.cost);

        loop {
            if direct {
                record.status = RequestStatus::InProgress;
            } else {
                record.status = RequestStatus::InQueue;
                record = self.await_admission(record, cleanup_timeout).await?;
            }

            let heartbeat = (!direct).then(|| self.spawn_request_heartbeat(record.clone()));
            let outcome = self.execute(&config).await;
            if let Some(handle) = heartbeat {
                handle.abort();
            }

            let failure = match outcome {
                Ok(response) if response.is_success() => {
                    let response = match &self.spec.request_options.response_interceptor {
                        Some(interceptor) => interceptor(response),
                        None => response,
                    };
                    self.apply_rate_limit_change(&response).await;
                    self.publish_done(&record, true, 0, false).await;
                    self.metrics.record_success(&self.name).await;
                    return Ok(response);
                }
                Ok(response) => {
                    let status = response.status;
                    let error = TransportError::from_status(status, Some(response.text()));
                    self.log_failure(&error);
                    error
                }
                Err(CourierError::Transport(error)) => {
                    self.log_failure(&error);
                    error
                }
                Err(other) => {
                    self.publish_done(&record, false, 0, false).await;
                    self.metrics.record_failure(&self.name).await;
                    return Err(other);
                }
            };

            let decision = self.retry.evaluate(&failure, record.retries);
            if !decision.should_retry {
                self.publish_done(&record, false, 0, false).await;
                self.metrics.record_failure(&self.name).await;
                return Err(CourierError::Transport(failure));
            }

            record.retries += 1;
            self.metrics
                .record_retry(&self.name, decision.is_rate_limited)
                .await;
            let bucket_interval = self.limiter.spec().await.bucket_interval();
            let wait_ms = self.retry.backoff_ms(record.retries, bucket_interval);
            tracing::debug!(
                client = %self.name,
                request = %record.request_id,
                retries = record.retries,
                wait_ms,
                "retrying request"
            );
            self.publish_done(&record, false, wait_ms, decision.is_rate_limited)
                .await;

            // Queued clients serve their backoff through the controller
            // freeze; direct clients have no controller to freeze for them.
            if direct {
                tokio::time::sleep(Duration::from_millis(wait_ms)).await;
            }
        }
    }

    /// Broadcasts the record and waits for its `requestReady`, heartbeating
    /// the whole time. The local queue entry arrives through the pub/sub
    /// loopback like everyone else's; a lost `requestAdded` is repaired by
    /// the next heartbeat.
    async fn await_admission(
        &self,
        record: RequestRecord,
        cleanup_timeout: Duration,
    ) -> Result<RequestRecord> {
        let ready_rx = self.bus.register(&record.request_id).await;
        let heartbeat = self.spawn_request_heartbeat(record.clone());

        if let Err(err) = self.transport.publish(Channel::RequestAdded, &record).await {
            heartbeat.abort();
            self.bus.forget(&record.request_id).await;
            return Err(err);
        }

        let readied = tokio::time::timeout(cleanup_timeout, ready_rx).await;
        heartbeat.abort();

        match readied {
            Ok(Ok(ready)) => Ok(ready),
            Ok(Err(_)) => Err(CourierError::Internal(
                "admission waiter dropped before completion".to_string(),
            )),
            Err(_) => {
                self.bus.forget(&record.request_id).await;
                self.queue.lock().await.remove(&record.request_id);
                tracing::warn!(
                    client = %self.name,
                    request = %record.request_id,
                    "abandoning request: no admission within cleanup timeout"
                );
                Err(CourierError::Timeout {
                    request_id: record.request_id.clone(),
                    waited_ms: cleanup_timeout.as_millis() as u64,
                })
            }
        }
    }

    fn spawn_request_heartbeat(&self, record: RequestRecord) -> JoinHandle<()> {
        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REQUEST_HEARTBEAT_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = transport.publish(Channel::RequestHeartbeat, &record).await {
                    tracing::debug!(
                        request = %record.request_id,
                        error = %err,
                        "request heartbeat publish failed"
                    );
                }
            }
        })
    }

    /// Builds and sends the HTTP call: request interceptor, auth headers,
    /// then the transport.
    async fn execute(&self, config: &RequestConfig) -> Result<Response> {
        let mut effective = config.clone();
        if let Some(interceptor) = &self.spec.request_options.request_interceptor {
            effective = interceptor(effective);
        }
        if let Some(authenticator) = &self.authenticator {
            let auth_headers = authenticator.headers(&self.transport).await?;
            effective.headers.extend(auth_headers);
        }

        let mut request = self
            .http
            .request(effective.method.clone(), effective.effective_url());
        if !effective.params.is_empty() {
            request = request.query(&effective.params);
        }
        for (name, value) in &effective.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(data) = &effective.data {
            request = request.json(data);
        }
        if let Some(timeout_ms) = self.spec.http_options.timeout_ms {
            request = request.timeout(Duration::from_millis(timeout_ms));
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response.bytes().await?.to_vec();

        Ok(Response {
            status,
            headers,
            body,
        })
    }

    /// Post-success hook: the application may inspect the response and
    /// swap the rate limit (e.g. following `X-RateLimit-*` headers). The
    /// change applies locally and broadcasts on `rateLimitUpdated`.
    async fn apply_rate_limit_change(&self, response: &Response) {
        let Some(hook) = &self.spec.rate_limit_change else {
            return;
        };
        let current = self.limiter.spec().await;
        let Some(new_spec) = hook(&current, response) else {
            return;
        };
        if new_spec == current {
            return;
        }

        tracing::info!(client = %self.name, ?new_spec, "rate limit changed by hook");
        self.on_rate_limit_updated(new_spec.clone()).await;
        let message = RateLimitUpdatedMessage {
            client_name: self.name.clone(),
            rate_limit: new_spec,
        };
        if let Err(err) = self
            .transport
            .publish(Channel::RateLimitUpdated, &message)
            .await
        {
            tracing::warn!(client = %self.name, error = %err, "failed to broadcast rate limit change");
        }
    }

    async fn publish_done(
        &self,
        record: &RequestRecord,
        success: bool,
        wait_time: u64,
        is_rate_limited: bool,
    ) {
        let message = RequestDoneMessage {
            record: record.clone(),
            success,
            wait_time,
            is_rate_limited,
        };
        if let Err(err) = self.transport.publish(Channel::RequestDone, &message).await {
            tracing::warn!(
                client = %self.name,
                request = %record.request_id,
                error = %err,
                "failed to publish requestDone"
            );
        }
    }

    fn log_failure(&self, error: &TransportError) {
        let muted = error
            .status
            .map(|status| self.spec.mutes_status(status))
            .unwrap_or(false);
        if muted {
            tracing::debug!(client = %self.name, error = %error, "request failed (muted)");
        } else {
            tracing::error!(client = %self.name, error = %error, "request failed");
        }
    }

    // ------------------------------------------------------------------
    // Stats and teardown
    // ------------------------------------------------------------------

    pub async fn stats(&self) -> ClientStats {
        let (is_frozen, thaw_remaining) = {
            let freeze = self.freeze.lock().await;
            (freeze.frozen, freeze.thaw_remaining)
        };
        let rate_limit = self.limiter.snapshot().await;
        let (requests_in_queue, requests_in_progress) = {
            let queue = self.queue.lock().await;
            (queue.in_queue_totals(), queue.in_progress_totals())
        };

        ClientStats {
            client_name: self.name.clone(),
            is_frozen,
            is_thawing: thaw_remaining > 0,
            thaw_request_count: thaw_remaining,
            rate_limit,
            requests_in_queue,
            requests_in_progress,
        }
    }

    /// Cancels every timer this client owns. In-flight HTTP calls are not
    /// aborted; their `requestDone` is simply received by whoever remains.
    pub async fn shutdown(&self) {
        self.stop_controller_tasks().await;
        {
            let mut freeze = self.freeze.lock().await;
            if let Some(timer) = freeze.freeze_timer.take() {
                timer.abort();
            }
        }
        self.limiter.interrupt().await;
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("name", &self.name)
            .field("spec", &self.spec)
            .finish()
    }
}
