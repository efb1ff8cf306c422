//! # Ownership and Leader Election
//!
//! Every instance keeps an in-memory table of its peers, synced from
//! pub/sub announcements and heartbeats. Election is a pure function of
//! that table: no coordination round, no persistent leases - two instances
//! with the same table always elect the same controller.
//!
//! ## Ordering Function
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  sort instances by:                                              │
//! │    1. priority descending                                        │
//! │    2. id descending (the lexicographically greater id wins ties) │
//! │                                                                  │
//! │  controller(client) = first instance in that order               │
//! │                       that registers the client                  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! During membership churn two instances may transiently both believe they
//! control a client. That overlap is benign: every admission step re-checks
//! the current role, and an originator only proceeds on the single
//! `requestReady` it is waiting for.

use crate::protocol::InstanceAnnouncement;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;

/// An instance's relationship to one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Authoritative for admission decisions
    Controller,
    /// Submits requests and waits for `requestReady`
    Worker,
}

/// One known peer (possibly this instance itself).
#[derive(Debug, Clone)]
pub struct PeerInstance {
    pub id: String,
    pub priority: i32,
    pub registered_clients: HashSet<String>,
    /// Last `instanceHeartbeat` (or announcement) observed
    pub last_beat: Instant,
}

impl From<InstanceAnnouncement> for PeerInstance {
    fn from(announcement: InstanceAnnouncement) -> Self {
        Self {
            id: announcement.id,
            priority: announcement.priority,
            registered_clients: announcement.registered_clients.into_iter().collect(),
            last_beat: Instant::now(),
        }
    }
}

/// `Ordering::Less` means `a` precedes `b` in the election order.
pub fn compare_instances(a_priority: i32, a_id: &str, b_priority: i32, b_id: &str) -> Ordering {
    b_priority.cmp(&a_priority).then(b_id.cmp(a_id))
}

/// In-memory fleet membership, maintained by the pub/sub router.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: HashMap<String, PeerInstance>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a peer from an announcement, refreshing its
    /// heartbeat.
    pub fn upsert(&mut self, announcement: InstanceAnnouncement) {
        self.peers
            .insert(announcement.id.clone(), announcement.into());
    }

    /// Refreshes a peer's heartbeat. Returns `false` for unknown peers -
    /// a heartbeat from an instance we never saw announce means we missed
    /// its `instanceStarted` and should re-fetch its registration.
    pub fn heartbeat(&mut self, id: &str) -> bool {
        match self.peers.get_mut(id) {
            Some(peer) => {
                peer.last_beat = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: &str) -> bool {
        self.peers.remove(id).is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.peers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.peers.keys().cloned().collect()
    }

    /// Drops peers that have not heartbeat within `max_age`, returning
    /// the expired ids so the caller can re-run ownership.
    pub fn expire_stale(&mut self, max_age: Duration) -> Vec<String> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .peers
            .values()
            .filter(|p| now.duration_since(p.last_beat) > max_age)
            .map(|p| p.id.clone())
            .collect();
        for id in &expired {
            self.peers.remove(id);
        }
        expired
    }

    /// The instance currently controlling a client: the highest-ordered
    /// peer that registers it.
    pub fn controller_for(&self, client_name: &str) -> Option<&str> {
        self.peers
            .values()
            .filter(|p| p.registered_clients.contains(client_name))
            .min_by(|a, b| compare_instances(a.priority, &a.id, b.priority, &b.id))
            .map(|p| p.id.as_str())
    }

    /// This instance's role for a client it registers.
    pub fn role_of(&self, instance_id: &str, client_name: &str) -> Role {
        match self.controller_for(client_name) {
            Some(id) if id == instance_id => Role::Controller,
            // No peer registering the client at all means the table has
            // not caught up with our own registration; act as worker until
            // it does.
            _ => Role::Worker,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn announcement(id: &str, priority: i32, clients: &[&str]) -> InstanceAnnouncement {
        InstanceAnnouncement {
            id: id.to_string(),
            priority,
            registered_clients: clients.iter().map(|c| c.to_string()).collect(),
        }
    }

    #[test]
    fn test_higher_priority_controls() {
        let mut table = PeerTable::new();
        table.upsert(announcement("i-low", 1, &["test"]));
        table.upsert(announcement("i-high", 2, &["test"]));

        assert_eq!(table.controller_for("test"), Some("i-high"));
        assert_eq!(table.role_of("i-high", "test"), Role::Controller);
        assert_eq!(table.role_of("i-low", "test"), Role::Worker);
    }

    #[test]
    fn test_equal_priority_greater_id_wins() {
        let mut table = PeerTable::new();
        table.upsert(announcement("aaa", 1, &["test"]));
        table.upsert(announcement("zzz", 1, &["test"]));

        // Both sides of the tie compute the same winner.
        assert_eq!(table.controller_for("test"), Some("zzz"));
        assert_eq!(table.role_of("zzz", "test"), Role::Controller);
        assert_eq!(table.role_of("aaa", "test"), Role::Worker);
    }

    #[test]
    fn test_controller_must_register_the_client() {
        let mut table = PeerTable::new();
        table.upsert(announcement("i-high", 9, &["other"]));
        table.upsert(announcement("i-low", 1, &["test"]));

        assert_eq!(table.controller_for("test"), Some("i-low"));
    }

    #[test]
    fn test_failover_on_removal() {
        let mut table = PeerTable::new();
        table.upsert(announcement("i-1", 1, &["test"]));
        table.upsert(announcement("i-2", 2, &["test"]));
        table.upsert(announcement("i-3", 3, &["test"]));

        assert_eq!(table.controller_for("test"), Some("i-3"));
        table.remove("i-3");
        assert_eq!(table.controller_for("test"), Some("i-2"));
    }

    #[test]
    fn test_heartbeat_only_refreshes_known_peers() {
        let mut table = PeerTable::new();
        table.upsert(announcement("i-1", 1, &[]));
        assert!(table.heartbeat("i-1"));
        assert!(!table.heartbeat("i-unknown"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_stale_peers() {
        let mut table = PeerTable::new();
        table.upsert(announcement("i-old", 1, &["test"]));

        tokio::time::advance(Duration::from_secs(4)).await;
        table.upsert(announcement("i-new", 1, &["test"]));

        let expired = table.expire_stale(Duration::from_secs(3));
        assert_eq!(expired, vec!["i-old".to_string()]);
        assert!(table.contains("i-new"));
        assert_eq!(table.controller_for("test"), Some("i-new"));
    }

    #[test]
    fn test_compare_instances_order() {
        // Higher priority precedes.
        assert_eq!(compare_instances(2, "a", 1, "z"), Ordering::Less);
        // Equal priority: greater id precedes.
        assert_eq!(compare_instances(1, "zzz", 1, "aaa"), Ordering::Less);
        assert_eq!(compare_instances(1, "aaa", 1, "zzz"), Ordering::Greater);
    }
}
