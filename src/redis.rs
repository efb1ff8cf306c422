//! # Redis Transport
//!
//! Thin wrapper over the fleet's shared Redis deployment: one multiplexed
//! connection for publishes and commands, one dedicated connection for the
//! subscriber, and pipelined writes for the registration key pair.
//!
//! ## Connections
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        Per-Instance Connections                      │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                                                                      │
//! │   ┌──────────────┐   publish / SET / SADD / HGETALL  ┌───────────┐   │
//! │   │  Multiplexed │──────────────────────────────────▶│           │   │
//! │   │  (shared)    │                                   │   Redis   │   │
//! │   └──────────────┘                                   │           │   │
//! │   ┌──────────────┐   SUBSCRIBE (12 channels)         │           │   │
//! │   │  PubSub      │◀──────────────────────────────────│           │   │
//! │   │  (dedicated) │                                   └───────────┘   │
//! │   └──────────────┘                                                   │
//! │                                                                      │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Key and Channel Layout
//!
//! Everything lives under `<prefix>requestHandler:`:
//!
//! - `…:instances` - set of live instance ids
//! - `…:instance:<id>` - registration JSON, TTL 3 s
//! - `…:<clientName>:oauth2` - encrypted token cache hash
//! - `…:<channelName>` - the pub/sub channels of [`crate::protocol`]
//!
//! Redis pub/sub is best-effort: messages may be lost. The design leans on
//! TTL heartbeats and periodic reconciliation, never on delivery guarantees.

use crate::error::{CourierError, Result};
use crate::protocol::{Channel, InstanceAnnouncement};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::Serialize;
use std::collections::HashMap;

/// Registration key TTL. Three missed heartbeats expire an instance.
pub const INSTANCE_TTL_SECS: u64 = 3;

/// Namespacing rules for keys and channels, separable from the live
/// connection so layout logic stays testable without a Redis.
#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Namespaces an arbitrary suffix: `<prefix>requestHandler:<suffix>`.
    pub fn key(&self, suffix: &str) -> String {
        format!("{}requestHandler:{}", self.prefix, suffix)
    }

    /// The live-instance set.
    pub fn instances(&self) -> String {
        self.key("instances")
    }

    /// One instance's registration key.
    pub fn instance(&self, id: &str) -> String {
        self.key(&format!("instance:{}", id))
    }

    /// A client's encrypted OAuth2 token cache.
    pub fn oauth2(&self, client_name: &str) -> String {
        self.key(&format!("{}:oauth2", client_name))
    }

    /// Full channel name for a [`Channel`]. Channels share the key
    /// namespace so co-tenant deployments cannot cross-talk.
    pub fn channel(&self, channel: Channel) -> String {
        self.key(channel.as_str())
    }

    /// Maps a received channel name back to its [`Channel`], rejecting
    /// traffic from other namespaces.
    pub fn resolve_channel(&self, full_name: &str) -> Option<Channel> {
        let ns = self.key("");
        full_name
            .strip_prefix(ns.as_str())
            .and_then(Channel::from_suffix)
    }
}

/// Redis client wrapper owning the publisher connection.
///
/// Cloning is cheap; the multiplexed connection is shared. The subscriber
/// connection is created separately via [`RedisTransport::subscriber`] and
/// handed to the instance's router task.
#[derive(Clone)]
pub struct RedisTransport {
    client: redis::Client,
    publisher: MultiplexedConnection,
    keyspace: KeySpace,
}

impl RedisTransport {
    /// Connects the publisher and validates the server is reachable.
    pub async fn connect(url: &str, prefix: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| CourierError::Redis(format!("failed to create redis client: {}", e)))?;

        let publisher = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| CourierError::Redis(format!("failed to connect publisher: {}", e)))?;

        Ok(Self {
            client,
            publisher,
            keyspace: KeySpace::new(prefix),
        })
    }

    pub fn keyspace(&self) -> &KeySpace {
        &self.keyspace
    }

    /// Opens the dedicated subscriber connection, subscribed to every
    /// fleet channel.
    pub async fn subscriber(&self) -> Result<redis::aio::PubSub> {
        let conn = self
            .client
            .get_async_connection()
            .await
            .map_err(|e| CourierError::Redis(format!("failed to connect subscriber: {}", e)))?;
        let mut pubsub = conn.into_pubsub();

        for channel in Channel::ALL {
            pubsub.subscribe(self.keyspace.channel(channel)).await?;
        }

        Ok(pubsub)
    }

    /// Publishes a payload on a fleet channel.
    pub async fn publish<T: Serialize>(&self, channel: Channel, payload: &T) -> Result<()> {
        let json = serde_json::to_string(payload)?;
        let mut conn = self.publisher.clone();
        let _: () = conn.publish(self.keyspace.channel(channel), json).await?;
        Ok(())
    }

    /// Persists an instance registration: the JSON key (TTL 3 s) and the
    /// membership set entry, pipelined.
    pub async fn register_instance(&self, announcement: &InstanceAnnouncement) -> Result<()> {
        let json = serde_json::to_string(announcement)?;
        let mut conn = self.publisher.clone();
        redis::pipe()
            .set_ex(
                self.keyspace.instance(&announcement.id),
                json,
                INSTANCE_TTL_SECS,
            )
            .ignore()
            .sadd(self.keyspace.instances(), &announcement.id)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Removes an instance's registration key and set entry, pipelined.
    pub async fn deregister_instance(&self, id: &str) -> Result<()> {
        let mut conn = self.publisher.clone();
        redis::pipe()
            .del(self.keyspace.instance(id))
            .ignore()
            .srem(self.keyspace.instances(), id)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Drops a stale id from the membership set (its registration key is
    /// already gone).
    pub async fn remove_stale_instance(&self, id: &str) -> Result<()> {
        let mut conn = self.publisher.clone();
        let _: () = conn.srem(self.keyspace.instances(), id).await?;
        Ok(())
    }

    /// All ids currently in the membership set.
    pub async fn instance_ids(&self) -> Result<Vec<String>> {
        let mut conn = self.publisher.clone();
        let ids: Vec<String> = conn.smembers(self.keyspace.instances()).await?;
        Ok(ids)
    }

    /// Fetches one instance's registration, if its key is still alive.
    pub async fn fetch_instance(&self, id: &str) -> Result<Option<InstanceAnnouncement>> {
        let mut conn = self.publisher.clone();
        let data: Option<String> = conn.get(self.keyspace.instance(id)).await?;
        match data {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Reads a hash key in full (OAuth2 token cache).
    pub async fn read_hash(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.publisher.clone();
        let fields: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(fields)
    }

    /// Writes hash fields (OAuth2 token cache), pipelined as one HSET.
    pub async fn write_hash(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.publisher.clone();
        let _: () = conn.hset_multiple(key, fields).await?;
        Ok(())
    }

    /// Deletes a tracked key. Client destruction enumerates its own keys
    /// explicitly; there is deliberately no scan-based variant.
    pub async fn delete_key(&self, key: &str) -> Result<()> {
        let mut conn = self.publisher.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    /// Round-trip health probe.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.publisher.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await?;
        Ok(())
    }
}
