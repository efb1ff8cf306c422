//! # Ready Bus
//!
//! The instance-local rendezvous between the request pipeline and the
//! pub/sub router: a map from request id to a one-shot completion handle.
//! The originator registers a waiter before publishing `requestAdded`; when
//! the router sees `requestReady` for that id it completes the handle and
//! the pipeline proceeds to execute.
//!
//! Completion is idempotent - a duplicate `requestReady` (possible during
//! controller transitions) finds no waiter and is dropped, which is exactly
//! why a transient dual-controller cannot double-admit an originator.

use crate::record::RequestRecord;
use std::collections::HashMap;
use tokio::sync::{oneshot, Mutex};

/// One-shot completion registry keyed by request id.
#[derive(Debug, Default)]
pub struct ReadyBus {
    waiters: Mutex<HashMap<String, oneshot::Sender<RequestRecord>>>,
}

impl ReadyBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter for a request id, returning the receiving half.
    /// A second registration for the same id replaces the first (its
    /// receiver resolves to an error, the same as a dropped wait).
    pub async fn register(&self, request_id: &str) -> oneshot::Receiver<RequestRecord> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.insert(request_id.to_string(), tx);
        rx
    }

    /// Completes the waiter for a record, if one is registered. Returns
    /// whether a waiter was found; duplicates return `false` and are
    /// harmless.
    pub async fn complete(&self, record: RequestRecord) -> bool {
        let sender = self.waiters.lock().await.remove(&record.request_id);
        match sender {
            Some(tx) => tx.send(record).is_ok(),
            None => false,
        }
    }

    /// Drops a waiter without completing it (abandoned or failed request).
    pub async fn forget(&self, request_id: &str) {
        self.waiters.lock().await.remove(request_id);
    }

    /// Number of outstanding waiters.
    pub async fn pending(&self) -> usize {
        self.waiters.lock().await.len()
    }
}
