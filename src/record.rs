//! # Request Records
//!
//! The value object describing one outbound call as it travels the fleet:
//! created by the originating instance, broadcast on `requestAdded`, ordered
//! and admitted by the controller, and retired on `requestDone`.
//!
//! ## Admission Ordering
//!
//! The controller pulls the next request using a four-level ranking:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                    Admission Ranking                       │
//! ├────────────────────────────────────────────────────────────┤
//! │                                                            │
//! │   1. priority    - higher first                            │
//! │   2. retries     - higher first (retries drain before new) │
//! │   3. timestamp   - earlier first                           │
//! │   4. requestId   - lexicographically smaller first         │
//! │                                                            │
//! │   inProgress records are ineligible and sort to the end.   │
//! │                                                            │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! The ranking is deterministic: two instances sorting the same set of
//! records always agree on the next admission.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Lifecycle state of a request record.
///
/// A record only ever moves `InQueue → InProgress`; terminal states are
/// represented by the record's removal, not a status value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
    /// Waiting for the controller to admit it
    #[serde(rename = "inQueue")]
    InQueue,
    /// Admitted; the originator is executing the HTTP call
    #[serde(rename = "inProgress")]
    InProgress,
}

/// Value object for one outbound call.
///
/// Serialized as camelCase JSON on every `request*` pub/sub channel; the
/// shape is compatibility-sensitive for deployments sharing a key prefix.
///
/// # Example
///
/// ```rust
/// use courier::record::RequestRecord;
///
/// let record = RequestRecord::new("github", 5, 1);
/// assert_eq!(record.client_name, "github");
/// assert_eq!(record.priority, 5);
/// assert_eq!(record.retries, 0);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    /// Unique id, also the key the originator waits on for `requestReady`
    pub request_id: String,
    /// Name of the client whose controller admits this record
    pub client_name: String,
    /// Current lifecycle state
    pub status: RequestStatus,
    /// Higher admits first (default 1)
    pub priority: i32,
    /// Tokens / concurrency slots this call consumes (default 1)
    pub cost: u32,
    /// Enqueue time, milliseconds since UNIX epoch
    pub timestamp: u64,
    /// Number of retries performed so far (default 0)
    pub retries: u32,
}

impl RequestRecord {
    /// Creates a fresh record in the `InQueue` state with a new UUID.
    pub fn new(client_name: impl Into<String>, priority: i32, cost: u32) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            client_name: client_name.into(),
            status: RequestStatus::InQueue,
            priority,
            cost,
            timestamp: now_ms(),
            retries: 0,
        }
    }

    /// True while the record is waiting for admission.
    pub fn is_in_queue(&self) -> bool {
        self.status == RequestStatus::InQueue
    }

    /// True once the controller has published `requestReady` for it.
    pub fn is_in_progress(&self) -> bool {
        self.status == RequestStatus::InProgress
    }
}

/// Comparator implementing the admission ranking.
///
/// `Ordering::Less` means "admit `a` before `b`". In-progress records are
/// ineligible and compare greater than anything still in queue.
pub fn compare_for_admission(a: &RequestRecord, b: &RequestRecord) -> Ordering {
    match (a.is_in_progress(), b.is_in_progress()) {
        (true, false) => return Ordering::Greater,
        (false, true) => return Ordering::Less,
        _ => {}
    }

    b.priority
        .cmp(&a.priority)
        .then(b.retries.cmp(&a.retries))
        .then(a.timestamp.cmp(&b.timestamp))
        .then(a.request_id.cmp(&b.request_id))
}

/// Current timestamp in milliseconds since UNIX epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, priority: i32, retries: u32, timestamp: u64) -> RequestRecord {
        RequestRecord {
            request_id: id.to_string(),
            client_name: "test".to_string(),
            status: RequestStatus::InQueue,
            priority,
            cost: 1,
            timestamp,
            retries,
        }
    }

    #[test]
    fn test_higher_priority_ranks_first() {
        let a = record("a", 5, 0, 100);
        let b = record("b", 1, 0, 50);
        assert_eq!(compare_for_admission(&a, &b), Ordering::Less);
    }

    #[test]
    fn test_retrying_requests_drain_before_new() {
        let a = record("a", 1, 2, 100);
        let b = record("b", 1, 0, 50);
        assert_eq!(compare_for_admission(&a, &b), Ordering::Less);
    }

    #[test]
    fn test_earlier_timestamp_wins_at_equal_priority() {
        let a = record("a", 1, 0, 50);
        let b = record("b", 1, 0, 100);
        assert_eq!(compare_for_admission(&a, &b), Ordering::Less);
    }

    #[test]
    fn test_request_id_is_deterministic_tiebreak() {
        let a = record("aaa", 1, 0, 100);
        let b = record("bbb", 1, 0, 100);
        assert_eq!(compare_for_admission(&a, &b), Ordering::Less);
        assert_eq!(compare_for_admission(&b, &a), Ordering::Greater);
    }

    #[test]
    fn test_in_progress_sorts_last() {
        let mut a = record("a", 99, 0, 0);
        a.status = RequestStatus::InProgress;
        let b = record("b", 1, 0, 100);
        assert_eq!(compare_for_admission(&a, &b), Ordering::Greater);
    }

    #[test]
    fn test_wire_shape_is_camel_case() {
        let record = record("r1", 2, 1, 42);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["requestId"], "r1");
        assert_eq!(json["clientName"], "test");
        assert_eq!(json["status"], "inQueue");
        assert_eq!(json["priority"], 2);
        assert_eq!(json["retries"], 1);
    }

    #[test]
    fn test_round_trip() {
        let original = RequestRecord::new("api", 3, 2);
        let json = serde_json::to_string(&original).unwrap();
        let parsed: RequestRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(original, parsed);
    }
}
