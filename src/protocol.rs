//! # Pub/Sub Wire Protocol
//!
//! Channel names and typed payloads for the fleet's Redis pub/sub traffic.
//! Payloads are camelCase JSON; together with the key layout in
//! [`crate::redis`] they are the only compatibility-sensitive shapes -
//! distinct deployments sharing a key prefix must agree on them.
//!
//! ## Channels
//!
//! ```text
//! ┌───────────────────────┬──────────────────────────────────────────────┐
//! │ Channel               │ Payload / Meaning                            │
//! ├───────────────────────┼──────────────────────────────────────────────┤
//! │ instanceStarted       │ InstanceAnnouncement - newcomer announcement │
//! │ instanceUpdated       │ InstanceAnnouncement - registration changed  │
//! │ instanceHeartbeat     │ InstanceRef - liveness, 1 s cadence          │
//! │ instanceStopped       │ InstanceRef - orderly departure              │
//! │ regenerateClients     │ RegenerateClientsMessage - fleet-wide reload │
//! │ destroyClient         │ DestroyClientMessage - fleet-wide removal    │
//! │ clientTokensUpdated   │ TokensUpdatedMessage - advisory balance      │
//! │ requestAdded          │ RequestRecord - enqueue broadcast            │
//! │ requestHeartbeat      │ RequestRecord - originator liveness, 1 s     │
//! │ requestReady          │ RequestRecord - admission grant              │
//! │ requestDone           │ RequestDoneMessage - outcome + retry hints   │
//! │ rateLimitUpdated      │ RateLimitUpdatedMessage - live spec change   │
//! └───────────────────────┴──────────────────────────────────────────────┘
//! ```

use crate::rate_limit::RateLimitSpec;
use crate::record::RequestRecord;
use serde::{Deserialize, Serialize};

/// The authoritative channel list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    InstanceStarted,
    InstanceUpdated,
    InstanceHeartbeat,
    InstanceStopped,
    RegenerateClients,
    DestroyClient,
    ClientTokensUpdated,
    RequestAdded,
    RequestHeartbeat,
    RequestReady,
    RequestDone,
    RateLimitUpdated,
}

impl Channel {
    /// Every channel, in subscription order.
    pub const ALL: [Channel; 12] = [
        Channel::InstanceStarted,
        Channel::InstanceUpdated,
        Channel::InstanceHeartbeat,
        Channel::InstanceStopped,
        Channel::RegenerateClients,
        Channel::DestroyClient,
        Channel::ClientTokensUpdated,
        Channel::RequestAdded,
        Channel::RequestHeartbeat,
        Channel::RequestReady,
        Channel::RequestDone,
        Channel::RateLimitUpdated,
    ];

    /// Wire name, without the deployment namespace.
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::InstanceStarted => "instanceStarted",
            Channel::InstanceUpdated => "instanceUpdated",
            Channel::InstanceHeartbeat => "instanceHeartbeat",
            Channel::InstanceStopped => "instanceStopped",
            Channel::RegenerateClients => "regenerateClients",
            Channel::DestroyClient => "destroyClient",
            Channel::ClientTokensUpdated => "clientTokensUpdated",
            Channel::RequestAdded => "requestAdded",
            Channel::RequestHeartbeat => "requestHeartbeat",
            Channel::RequestReady => "requestReady",
            Channel::RequestDone => "requestDone",
            Channel::RateLimitUpdated => "rateLimitUpdated",
        }
    }

    /// Resolves a wire name back to a channel.
    pub fn from_suffix(suffix: &str) -> Option<Channel> {
        Channel::ALL.iter().copied().find(|c| c.as_str() == suffix)
    }
}

/// Instance metadata: the `instanceStarted`/`instanceUpdated` payload and
/// the JSON stored at the `:instance:<id>` registration key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceAnnouncement {
    /// Process-unique instance id
    pub id: String,
    /// Election priority, higher wins
    pub priority: i32,
    /// Names of the clients this instance serves
    pub registered_clients: Vec<String>,
}

/// Minimal instance reference for heartbeats and departures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRef {
    pub id: String,
}

/// Fleet-wide client regeneration request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegenerateClientsMessage {
    /// Generator names to reload; `None` reloads all of them
    pub names: Option<Vec<String>>,
}

/// Fleet-wide client removal request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestroyClientMessage {
    pub client_name: String,
}

/// Advisory token balance broadcast by the controller. Workers mirror it
/// for stats; they never admit locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokensUpdatedMessage {
    pub client_name: String,
    pub tokens: u64,
}

/// Outcome of an executed request, published by the originator.
///
/// `wait_time > 0` freezes the controller for that long; `is_rate_limited`
/// additionally arms the thaw counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestDoneMessage {
    pub record: RequestRecord,
    /// True when the HTTP call ultimately succeeded
    pub success: bool,
    /// Backoff the controller must freeze for, milliseconds
    pub wait_time: u64,
    /// True when the failure was a rate-limit signal (HTTP 429)
    pub is_rate_limited: bool,
}

/// Live rate-limit change, broadcast after a `rate_limit_change` hook fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitUpdatedMessage {
    pub client_name: String,
    pub rate_limit: RateLimitSpec,
}
