//! # Courier Instance
//!
//! The process-level façade: one [`Courier`] per process joins the fleet,
//! loads its client set from the configured generators, takes part in
//! leader election for every client, and routes pub/sub traffic to the
//! right [`Client`].
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                           Courier (instance)                          │
//! ├───────────────────────────────────────────────────────────────────────┤
//! │                                                                       │
//! │  ┌──────────────┐   ┌───────────────┐   ┌───────────────────────┐     │
//! │  │  PeerTable   │   │ Client map    │   │ Background tasks      │     │
//! │  │              │   │ name → Client │   │                       │     │
//! │  │ id→priority, │   │               │   │ • router (pub/sub)    │     │
//! │  │ clients,     │   │ "default"     │   │ • heartbeat (1 s)     │     │
//! │  │ heartbeats   │   │ "github" …    │   │ • peer sweep (1 s)    │     │
//! │  └──────┬───────┘   └──────┬────────┘   └───────────┬───────────┘     │
//! │         │                  │                        │                 │
//! │         └─────────── ownership recompute ───────────┘                 │
//! │                            │                                          │
//! │                   Client::set_role(Controller | Worker)               │
//! │                                                                       │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Lifecycle
//!
//! `start` connects Redis, builds the client set, bootstraps the peer
//! table from the registration keys, announces itself, and begins
//! heartbeating (1 s cadence, 3 s registration TTL). `stop` announces the
//! departure, removes the registration, and cancels every timer; requests
//! already executing run to completion. Both are idempotent.

use crate::client::{Client, ClientStats};
use crate::client_spec::ClientSpec;
use crate::config::CourierOptions;
use crate::crypto::TokenCipher;
use crate::error::{CourierError, Result};
use crate::events::ReadyBus;
use crate::http::{RequestConfig, Response};
use crate::ownership::{PeerTable, Role};
use crate::protocol::{
    Channel, DestroyClientMessage, InstanceAnnouncement, InstanceRef, RateLimitUpdatedMessage,
    RegenerateClientsMessage, RequestDoneMessage, TokensUpdatedMessage,
};
use crate::metrics::{ClientMetrics, MetricsCollector};
use crate::record::RequestRecord;
use crate::redis::{KeySpace, RedisTransport};
use crate::validation::validate_family;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

/// Cadence of instance heartbeats and registration refreshes.
const INSTANCE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// A peer silent for this long is presumed gone.
const INSTANCE_HEARTBEAT_EXPIRY: Duration = Duration::from_secs(3);

/// Source tag for the built-in `"default"` client.
const BUILTIN_SOURCE: &str = "builtin";

/// Lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    Stopped,
    Starting,
    Started,
}

/// Process-level coordinator façade. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct Courier {
    inner: Arc<CourierInner>,
}

struct CourierInner {
    /// Self-handle for the background tasks this instance spawns
    weak: Weak<CourierInner>,
    id: String,
    options: CourierOptions,
    cipher: TokenCipher,
    bus: Arc<ReadyBus>,
    metrics: MetricsCollector,
    status_tx: watch::Sender<InstanceStatus>,
    status_rx: watch::Receiver<InstanceStatus>,
    transport: RwLock<Option<Arc<RedisTransport>>>,
    clients: RwLock<HashMap<String, Arc<Client>>>,
    /// client name → generator that produced it (for regeneration)
    sources: RwLock<HashMap<String, String>>,
    peers: Mutex<PeerTable>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Courier {
    /// Builds an instance. Nothing touches Redis until [`Courier::start`].
    pub fn new(options: CourierOptions) -> Self {
        let (status_tx, status_rx) = watch::channel(InstanceStatus::Stopped);
        let cipher = TokenCipher::new(&options.key);

        Self {
            inner: Arc::new_cyclic(|weak| CourierInner {
                weak: weak.clone(),
                id: Uuid::new_v4().to_string(),
                cipher,
                options,
                bus: Arc::new(ReadyBus::new()),
                metrics: MetricsCollector::new(),
                status_tx,
                status_rx,
                transport: RwLock::new(None),
                clients: RwLock::new(HashMap::new()),
                sources: RwLock::new(HashMap::new()),
                peers: Mutex::new(PeerTable::new()),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// This instance's fleet-unique id.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn status(&self) -> InstanceStatus {
        *self.inner.status_rx.borrow()
    }

    /// Joins the fleet. Idempotent: a started instance is left alone.
    pub async fn start(&self) -> Result<()> {
        self.inner.start().await
    }

    /// Leaves the fleet and cancels all timers. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        self.inner.stop().await
    }

    /// Submits one coordinated outbound request.
    ///
    /// Waits for startup to finish when called mid-`start`; fails with
    /// [`CourierError::NotStarted`] on a stopped instance, and with
    /// [`CourierError::UnknownClient`] for an unregistered client name.
    pub async fn handle_request(&self, config: RequestConfig) -> Result<Response> {
        self.inner.await_started().await?;
        let client = self
            .inner
            .client(&config.client_name)
            .await
            .ok_or_else(|| CourierError::UnknownClient(config.client_name.clone()))?;
        client.handle_request(config).await
    }

    /// Fleet-wide regeneration of the named generators (all when `None`).
    pub async fn regenerate_clients(&self, names: Option<Vec<String>>) -> Result<()> {
        self.inner.await_started().await?;
        let transport = self.inner.transport().await?;
        transport
            .publish(
                Channel::RegenerateClients,
                &RegenerateClientsMessage { names },
            )
            .await
    }

    /// Fleet-wide removal of one client.
    pub async fn destroy_client(&self, name: &str) -> Result<()> {
        self.inner.await_started().await?;
        let transport = self.inner.transport().await?;
        transport
            .publish(
                Channel::DestroyClient,
                &DestroyClientMessage {
                    client_name: name.to_string(),
                },
            )
            .await
    }

    /// Snapshot of one client's queue, policy and freeze state.
    pub async fn client_stats(&self, name: &str) -> Result<ClientStats> {
        let client = self
            .inner
            .client(name)
            .await
            .ok_or_else(|| CourierError::UnknownClient(name.to_string()))?;
        Ok(client.stats().await)
    }

    /// Names of the clients this instance currently serves.
    pub async fn client_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.clients.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Liveness probe: round-trips the Redis connection.
    pub async fn ping(&self) -> Result<()> {
        self.inner.transport().await?.ping().await
    }

    /// Instance-local request counters for one client.
    pub async fn client_metrics(&self, name: &str) -> ClientMetrics {
        self.inner.metrics.snapshot(name).await
    }

    /// Instance-local request counters for every client.
    pub async fn all_metrics(&self) -> HashMap<String, ClientMetrics> {
        self.inner.metrics.snapshot_all().await
    }

    /// This instance's current role for a client.
    pub async fn client_role(&self, name: &str) -> Result<Role> {
        let client = self
            .inner
            .client(name)
            .await
            .ok_or_else(|| CourierError::UnknownClient(name.to_string()))?;
        Ok(client.role().await)
    }
}

impl CourierInner {
    async fn client(&self, name: &str) -> Option<Arc<Client>> {
        self.clients.read().await.get(name).cloned()
    }

    async fn transport(&self) -> Result<Arc<RedisTransport>> {
        self.transport
            .read()
            .await
            .clone()
            .ok_or(CourierError::NotStarted)
    }

    /// Resolves once the instance is `Started`; follows an in-flight
    /// `start` to completion instead of failing.
    async fn await_started(&self) -> Result<()> {
        let mut rx = self.status_rx.clone();
        loop {
            let status = *rx.borrow_and_update();
            match status {
                InstanceStatus::Started => return Ok(()),
                InstanceStatus::Starting => {
                    rx.changed().await.map_err(|_| CourierError::NotStarted)?;
                }
                InstanceStatus::Stopped => return Err(CourierError::NotStarted),
            }
        }
    }

    async fn announcement(&self) -> InstanceAnnouncement {
        let mut registered_clients: Vec<String> =
            self.clients.read().await.keys().cloned().collect();
        registered_clients.sort();
        InstanceAnnouncement {
            id: self.id.clone(),
            priority: self.options.priority,
            registered_clients,
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    async fn start(&self) -> Result<()> {
        if *self.status_rx.borrow() != InstanceStatus::Stopped {
            return Ok(());
        }
        let _ = self.status_tx.send(InstanceStatus::Starting);
        tracing::info!(instance = %self.id, "starting courier instance");

        match self.start_inner().await {
            Ok(()) => {
                let _ = self.status_tx.send(InstanceStatus::Started);
                tracing::info!(instance = %self.id, "courier instance started");
                Ok(())
            }
            Err(err) => {
                tracing::error!(instance = %self.id, error = %err, "startup failed");
                self.teardown().await;
                let _ = self.status_tx.send(InstanceStatus::Stopped);
                Err(err)
            }
        }
    }

    async fn start_inner(&self) -> Result<()> {
        let transport = Arc::new(
            RedisTransport::connect(&self.options.redis_url, &self.options.redis_key_prefix)
                .await?,
        );
        *self.transport.write().await = Some(Arc::clone(&transport));

        self.build_clients(&transport).await?;

        let pubsub = transport.subscriber().await?;
        let router = self.spawn_router(pubsub);

        self.bootstrap_peers(&transport).await?;
        self.persist_registration(false).await?;

        let heartbeat = self.spawn_heartbeat();
        let peer_sweep = self.spawn_peer_sweeper();
        self.tasks
            .lock()
            .await
            .extend([router, heartbeat, peer_sweep].into_iter().flatten());

        self.recompute_ownership().await;
        transport
            .publish(Channel::InstanceStarted, &self.announcement().await)
            .await?;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if *self.status_rx.borrow() == InstanceStatus::Stopped {
            return Ok(());
        }
        let _ = self.status_tx.send(InstanceStatus::Stopped);
        tracing::info!(instance = %self.id, "stopping courier instance");

        if let Some(transport) = self.transport.read().await.clone() {
            let stopped = InstanceRef {
                id: self.id.clone(),
            };
            if let Err(err) = transport.publish(Channel::InstanceStopped, &stopped).await {
                tracing::warn!(error = %err, "failed to announce departure");
            }
            if let Err(err) = transport.deregister_instance(&self.id).await {
                tracing::warn!(error = %err, "failed to remove registration");
            }
        }

        self.teardown().await;
        Ok(())
    }

    async fn teardown(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        let clients: Vec<Arc<Client>> = self.clients.write().await.drain().map(|(_, c)| c).collect();
        for client in clients {
            client.shutdown().await;
        }
        self.sources.write().await.clear();
        *self.peers.lock().await = PeerTable::new();
        *self.transport.write().await = None;
    }

    // ------------------------------------------------------------------
    // Client set construction
    // ------------------------------------------------------------------

    async fn build_clients(&self, transport: &Arc<RedisTransport>) -> Result<()> {
        let mut generator_names: Vec<String> =
            self.options.client_generators.keys().cloned().collect();
        generator_names.sort();

        for name in generator_names {
            let generator = Arc::clone(&self.options.client_generators[&name]);
            self.install_specs(&name, generator(), transport).await?;
        }

        // The "default" client always exists.
        if !self.clients.read().await.contains_key("default") {
            self.create_client(BUILTIN_SOURCE, ClientSpec::new("default"), transport)
                .await?;
        }
        Ok(())
    }

    async fn install_specs(
        &self,
        generator_name: &str,
        specs: Vec<ClientSpec>,
        transport: &Arc<RedisTransport>,
    ) -> Result<()> {
        for spec in specs {
            let flattened = spec
                .with_defaults(&self.options.default_client_options)
                .flatten();
            validate_family(&flattened)?;
            for flat in flattened {
                self.create_client(generator_name, flat, transport).await?;
            }
        }
        Ok(())
    }

    async fn create_client(
        &self,
        source: &str,
        spec: ClientSpec,
        transport: &Arc<RedisTransport>,
    ) -> Result<()> {
        let name = spec.name.clone();
        {
            let clients = self.clients.read().await;
            if clients.contains_key(&name) {
                return Err(CourierError::DuplicateClient(name));
            }
        }

        let client = Client::new(
            spec,
            Arc::clone(transport),
            Arc::clone(&self.bus),
            self.cipher.clone(),
            self.metrics.clone(),
        )?;
        self.clients.write().await.insert(name.clone(), client);
        self.sources
            .write()
            .await
            .insert(name.clone(), source.to_string());
        tracing::debug!(client = %name, source, "client registered");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Membership and ownership
    // ------------------------------------------------------------------

    /// Seeds the peer table from the registration keys; ids whose key has
    /// already expired are dropped from the membership set.
    async fn bootstrap_peers(&self, transport: &Arc<RedisTransport>) -> Result<()> {
        for id in transport.instance_ids().await? {
            if id == self.id {
                continue;
            }
            match transport.fetch_instance(&id).await? {
                Some(announcement) => {
                    self.peers.lock().await.upsert(announcement);
                }
                None => {
                    tracing::warn!(peer = %id, "stale instance id in membership set, removing");
                    transport.remove_stale_instance(&id).await?;
                }
            }
        }
        Ok(())
    }

    /// Re-persists the registration (and keeps our own peer entry fresh);
    /// optionally announces the change on `instanceUpdated`.
    async fn persist_registration(&self, publish_updated: bool) -> Result<()> {
        let Some(transport) = self.transport.read().await.clone() else {
            return Ok(());
        };
        let announcement = self.announcement().await;
        self.peers.lock().await.upsert(announcement.clone());
        transport.register_instance(&announcement).await?;
        if publish_updated {
            transport
                .publish(Channel::InstanceUpdated, &announcement)
                .await?;
        }
        Ok(())
    }

    /// Recomputes every local client's role from the peer table and applies
    /// the changes idempotently.
    async fn recompute_ownership(&self) {
        let clients: Vec<Arc<Client>> = self.clients.read().await.values().cloned().collect();

        let mut decisions = Vec::with_capacity(clients.len());
        {
            let peers = self.peers.lock().await;
            for client in &clients {
                let role = peers.role_of(&self.id, client.name());
                decisions.push((Arc::clone(client), role));
            }
        }

        for (client, role) in decisions {
            // Shared-limit clients delegate admission and never control.
            let role = if client.is_shared().await {
                Role::Worker
            } else {
                role
            };
            client.set_role(role).await;
        }
    }

    fn spawn_heartbeat(&self) -> Option<JoinHandle<()>> {
        let inner = self.weak.upgrade()?;
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(INSTANCE_HEARTBEAT_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                inner.peers.lock().await.heartbeat(&inner.id);
                let Some(transport) = inner.transport.read().await.clone() else {
                    continue;
                };
                let announcement = inner.announcement().await;
                if let Err(err) = transport.register_instance(&announcement).await {
                    tracing::warn!(error = %err, "failed to refresh registration");
                }
                let beat = InstanceRef {
                    id: inner.id.clone(),
                };
                if let Err(err) = transport.publish(Channel::InstanceHeartbeat, &beat).await {
                    tracing::warn!(error = %err, "failed to publish heartbeat");
                }
            }
        }))
    }

    fn spawn_peer_sweeper(&self) -> Option<JoinHandle<()>> {
        let inner = self.weak.upgrade()?;
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(INSTANCE_HEARTBEAT_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let expired = {
                    let mut peers = inner.peers.lock().await;
                    let expired = peers.expire_stale(INSTANCE_HEARTBEAT_EXPIRY);
                    // Never expire ourselves out of our own table.
                    if !peers.contains(&inner.id) {
                        drop(peers);
                        let announcement = inner.announcement().await;
                        inner.peers.lock().await.upsert(announcement);
                    }
                    expired
                };
                if expired.is_empty() {
                    continue;
                }

                for id in &expired {
                    tracing::warn!(peer = %id, "peer heartbeat expired");
                }
                if let Some(transport) = inner.transport.read().await.clone() {
                    for id in &expired {
                        // Opportunistic membership cleanup: only ids whose
                        // registration key is really gone leave the set.
                        if let Ok(None) = transport.fetch_instance(id).await {
                            let _ = transport.remove_stale_instance(id).await;
                        }
                    }
                }
                inner.recompute_ownership().await;
            }
        }))
    }

    // ------------------------------------------------------------------
    // Pub/sub routing
    // ------------------------------------------------------------------

    fn spawn_router(&self, pubsub: redis::aio::PubSub) -> Option<JoinHandle<()>> {
        let inner = self.weak.upgrade()?;
        let keyspace = KeySpace::new(self.options.redis_key_prefix.clone());
        Some(tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(message) = stream.next().await {
                let channel_name = message.get_channel_name().to_string();
                let Some(channel) = keyspace.resolve_channel(&channel_name) else {
                    continue;
                };
                let payload: String = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        tracing::warn!(channel = channel.as_str(), error = %err, "unreadable payload");
                        continue;
                    }
                };
                if let Err(err) = inner.dispatch(channel, &payload).await {
                    tracing::warn!(
                        channel = channel.as_str(),
                        error = %err,
                        "failed to handle fleet message"
                    );
                }
            }
            tracing::warn!("pub/sub stream ended");
        }))
    }

    async fn dispatch(&self, channel: Channel, payload: &str) -> Result<()> {
        match channel {
            Channel::InstanceStarted | Channel::InstanceUpdated => {
                let announcement: InstanceAnnouncement = serde_json::from_str(payload)?;
                if announcement.id != self.id {
                    tracing::debug!(peer = %announcement.id, "peer announcement");
                }
                self.peers.lock().await.upsert(announcement);
                self.recompute_ownership().await;
            }
            Channel::InstanceHeartbeat => {
                let beat: InstanceRef = serde_json::from_str(payload)?;
                let known = self.peers.lock().await.heartbeat(&beat.id);
                if !known && beat.id != self.id {
                    // We missed the announcement; recover it from Redis.
                    if let Ok(transport) = self.transport().await {
                        if let Ok(Some(announcement)) = transport.fetch_instance(&beat.id).await {
                            self.peers.lock().await.upsert(announcement);
                            self.recompute_ownership().await;
                        }
                    }
                }
            }
            Channel::InstanceStopped => {
                let stopped: InstanceRef = serde_json::from_str(payload)?;
                if self.peers.lock().await.remove(&stopped.id) {
                    tracing::info!(peer = %stopped.id, "peer left the fleet");
                    self.recompute_ownership().await;
                }
            }
            Channel::RegenerateClients => {
                let message: RegenerateClientsMessage = serde_json::from_str(payload)?;
                self.apply_regenerate(message.names).await?;
            }
            Channel::DestroyClient => {
                let message: DestroyClientMessage = serde_json::from_str(payload)?;
                self.apply_destroy(&message.client_name).await?;
            }
            Channel::ClientTokensUpdated => {
                let message: TokensUpdatedMessage = serde_json::from_str(payload)?;
                if let Some(client) = self.client(&message.client_name).await {
                    client.on_tokens_updated(message.tokens).await;
                }
            }
            Channel::RequestAdded => {
                let record: RequestRecord = serde_json::from_str(payload)?;
                if let Some(client) = self.client(&record.client_name).await {
                    client.on_request_added(record).await;
                }
            }
            Channel::RequestHeartbeat => {
                let record: RequestRecord = serde_json::from_str(payload)?;
                if let Some(client) = self.client(&record.client_name).await {
                    client.on_request_heartbeat(record).await;
                }
            }
            Channel::RequestReady => {
                let record: RequestRecord = serde_json::from_str(payload)?;
                if let Some(client) = self.client(&record.client_name).await {
                    client.on_request_ready(record.clone()).await;
                }
                // The originator's waiter lives on the instance bus.
                self.bus.complete(record).await;
            }
            Channel::RequestDone => {
                let message: RequestDoneMessage = serde_json::from_str(payload)?;
                if let Some(client) = self.client(&message.record.client_name).await {
                    client.on_request_done(&message).await;
                }
            }
            Channel::RateLimitUpdated => {
                let message: RateLimitUpdatedMessage = serde_json::from_str(payload)?;
                if let Some(client) = self.client(&message.client_name).await {
                    client.on_rate_limit_updated(message.rate_limit).await;
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Fleet-wide mutations (applied on every instance via pub/sub)
    // ------------------------------------------------------------------

    async fn apply_regenerate(&self, names: Option<Vec<String>>) -> Result<()> {
        let names = match names {
            Some(names) => names,
            None => {
                let mut all: Vec<String> =
                    self.options.client_generators.keys().cloned().collect();
                all.sort();
                all
            }
        };
        let transport = self.transport().await?;

        for generator_name in names {
            let Some(generator) = self.options.client_generators.get(&generator_name) else {
                tracing::warn!(generator = %generator_name, "unknown generator, skipping");
                continue;
            };
            tracing::info!(generator = %generator_name, "regenerating clients");

            // Tear down the clients this generator produced last time.
            let stale: Vec<String> = {
                let sources = self.sources.read().await;
                sources
                    .iter()
                    .filter(|(_, source)| **source == generator_name)
                    .map(|(client, _)| client.clone())
                    .collect()
            };
            for name in stale {
                self.remove_client(&name, &transport).await;
            }

            let specs = generator();
            self.install_specs(&generator_name, specs, &transport).await?;
        }

        self.persist_registration(true).await?;
        self.recompute_ownership().await;
        Ok(())
    }

    async fn apply_destroy(&self, name: &str) -> Result<()> {
        let transport = self.transport().await?;
        if self.client(name).await.is_none() {
            return Ok(());
        }
        tracing::info!(client = %name, "destroying client");
        self.remove_client(name, &transport).await;
        self.persist_registration(true).await?;
        self.recompute_ownership().await;
        Ok(())
    }

    async fn remove_client(&self, name: &str, transport: &Arc<RedisTransport>) {
        let removed = self.clients.write().await.remove(name);
        self.sources.write().await.remove(name);
        if let Some(client) = removed {
            client.shutdown().await;
            for key in client.tracked_keys() {
                if let Err(err) = transport.delete_key(&key).await {
                    tracing::warn!(client = %name, key = %key, error = %err, "failed to delete tracked key");
                }
            }
        }
    }
}

impl std::fmt::Debug for Courier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Courier")
            .field("id", &self.inner.id)
            .field("status", &*self.inner.status_rx.borrow())
            .finish()
    }
}
