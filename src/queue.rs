//! # Per-Client Request Queue
//!
//! The ordered request map every instance keeps for every client. Workers
//! mirror it from pub/sub traffic so a promoted controller starts from a
//! warm map; the controller additionally uses it to select admissions and
//! to expire records whose originator stopped heartbeating.
//!
//! ## Lazy Sorting
//!
//! The map is append-heavy and read-ordered only at admission time, so
//! sorting is deferred: mutations set a dirty flag and the next
//! [`RequestQueue::next_eligible`] call re-sorts. Access is single-task per
//! client (the queue lives behind the client's mutex), so no concurrent
//! mutation can interleave with a sort.

use crate::record::{compare_for_admission, RequestRecord};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// One queued record plus the controller's view of its liveness.
#[derive(Debug, Clone)]
struct QueueEntry {
    record: RequestRecord,
    /// Refreshed by `requestHeartbeat`; a silent originator is presumed dead
    last_beat: Instant,
}

/// Aggregate view of one side of the queue, used by client stats.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueTotals {
    /// Number of records
    pub count: usize,
    /// Sum of record costs
    pub cost: u64,
    /// The records themselves
    pub requests: Vec<RequestRecord>,
}

/// Priority-ordered request map with lazy sorting and liveness tracking.
#[derive(Debug, Default)]
pub struct RequestQueue {
    entries: HashMap<String, QueueEntry>,
    /// Request ids in admission order; only valid while `dirty` is false
    order: Vec<String>,
    dirty: bool,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a record, refreshing its heartbeat.
    pub fn upsert(&mut self, record: RequestRecord) {
        self.entries.insert(
            record.request_id.clone(),
            QueueEntry {
                record,
                last_beat: Instant::now(),
            },
        );
        self.dirty = true;
    }

    /// Refreshes the heartbeat of a record, if present.
    pub fn touch(&mut self, request_id: &str) {
        if let Some(entry) = self.entries.get_mut(request_id) {
            entry.last_beat = Instant::now();
        }
    }

    /// Applies a broadcast record update (e.g. `requestReady` marking it
    /// in-progress) without resetting the heartbeat clock.
    pub fn apply(&mut self, record: RequestRecord) {
        if let Some(entry) = self.entries.get_mut(&record.request_id) {
            entry.record = record;
            self.dirty = true;
        }
    }

    /// Removes a record, returning it if it was present.
    pub fn remove(&mut self, request_id: &str) -> Option<RequestRecord> {
        let removed = self.entries.remove(request_id).map(|e| e.record);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    /// Marks a record in-progress and returns the updated copy.
    pub fn mark_in_progress(&mut self, request_id: &str) -> Option<RequestRecord> {
        let entry = self.entries.get_mut(request_id)?;
        entry.record.status = crate::record::RequestStatus::InProgress;
        self.dirty = true;
        Some(entry.record.clone())
    }

    /// Returns the next record eligible for admission, re-sorting first if
    /// the map is dirty. Does not mutate the record.
    pub fn next_eligible(&mut self) -> Option<RequestRecord> {
        if self.dirty {
            self.resort();
        }
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id))
            .map(|e| &e.record)
            .find(|r| r.is_in_queue())
            .cloned()
    }

    fn resort(&mut self) {
        self.order = self.entries.keys().cloned().collect();
        let entries = &self.entries;
        self.order.sort_by(|a, b| {
            compare_for_admission(&entries[a].record, &entries[b].record)
        });
        self.dirty = false;
    }

    /// Removes records whose originator has not heartbeat within `max_age`,
    /// returning them so the caller can release any held capacity.
    pub fn sweep_stale(&mut self, max_age: Duration) -> Vec<RequestRecord> {
        let now = Instant::now();
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_beat) > max_age)
            .map(|(id, _)| id.clone())
            .collect();

        stale
            .iter()
            .filter_map(|id| self.remove(id))
            .collect()
    }

    /// Totals for records still waiting for admission.
    pub fn in_queue_totals(&self) -> QueueTotals {
        self.totals(|r| r.is_in_queue())
    }

    /// Totals for admitted records.
    pub fn in_progress_totals(&self) -> QueueTotals {
        self.totals(|r| r.is_in_progress())
    }

    fn totals(&self, filter: impl Fn(&RequestRecord) -> bool) -> QueueTotals {
        let mut requests: Vec<RequestRecord> = self
            .entries
            .values()
            .map(|e| &e.record)
            .filter(|r| filter(r))
            .cloned()
            .collect();
        requests.sort_by(compare_for_admission);

        QueueTotals {
            count: requests.len(),
            cost: requests.iter().map(|r| r.cost as u64).sum(),
            requests,
        }
    }

    /// Sum of costs currently marked in-progress.
    pub fn in_progress_cost(&self) -> u64 {
        self.entries
            .values()
            .filter(|e| e.record.is_in_progress())
            .map(|e| e.record.cost as u64)
            .sum()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True if any record is still waiting for admission.
    pub fn has_queued(&self) -> bool {
        self.entries.values().any(|e| e.record.is_in_queue())
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.entries.contains_key(request_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RequestStatus;

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
    fn test_next_eligible_respects_ranking() {
        let mut queue = RequestQueue::new();
        queue.upsert(record("low", 1, 0, 10));
        queue.upsert(record("high", 5, 0, 20));
        queue.upsert(record("retry", 1, 2, 30));

        assert_eq!(queue.next_eligible().unwrap().request_id, "high");
        queue.remove("high");
        assert_eq!(queue.next_eligible().unwrap().request_id, "retry");
        queue.remove("retry");
        assert_eq!(queue.next_eligible().unwrap().request_id, "low");
    }

    #[test]
    fn test_in_progress_records_are_ineligible() {
        let mut queue = RequestQueue::new();
        queue.upsert(record("a", 5, 0, 10));
        queue.upsert(record("b", 1, 0, 20));
        queue.mark_in_progress("a");

        assert_eq!(queue.next_eligible().unwrap().request_id, "b");
        queue.mark_in_progress("b");
        assert!(queue.next_eligible().is_none());
    }

    #[test]
    fn test_upsert_resorts_lazily() {
        let mut queue = RequestQueue::new();
        queue.upsert(record("a", 1, 0, 10));
        assert_eq!(queue.next_eligible().unwrap().request_id, "a");

        // A later, higher-priority arrival must win the next pull.
        queue.upsert(record("b", 9, 0, 99));
        assert_eq!(queue.next_eligible().unwrap().request_id, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_stale_drops_silent_records() {
        let mut queue = RequestQueue::new();
        queue.upsert(record("old", 1, 0, 10));

        tokio::time::advance(Duration::from_secs(4)).await;
        queue.upsert(record("fresh", 1, 0, 20));
        queue.touch("fresh");

        let dropped = queue.sweep_stale(Duration::from_secs(3));
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].request_id, "old");
        assert!(queue.contains("fresh"));
    }

    #[test]
    fn test_totals_split_by_status() {
        let mut queue = RequestQueue::new();
        let mut a = record("a", 1, 0, 10);
        a.cost = 2;
        queue.upsert(a);
        queue.upsert(record("b", 1, 0, 20));
        queue.mark_in_progress("a");

        let queued = queue.in_queue_totals();
        assert_eq!(queued.count, 1);
        assert_eq!(queued.cost, 1);

        let in_progress = queue.in_progress_totals();
        assert_eq!(in_progress.count, 1);
        assert_eq!(in_progress.cost, 2);
        assert_eq!(queue.in_progress_cost(), 2);
    }
}
