//! # Per-Client Request Counters
//!
//! Lightweight counters maintained by the originator side of the pipeline.
//! They are instance-local (each process counts the requests it submitted)
//! and exposed alongside the queue snapshot for dashboards and tests.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Counters for one client on one instance.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMetrics {
    /// Requests handed to `handle_request`
    pub submitted: u64,
    /// Requests that returned a success response
    pub succeeded: u64,
    /// Requests that exhausted retries or failed terminally
    pub failed: u64,
    /// Individual retry attempts
    pub retried: u64,
    /// Retries caused by a 429
    pub rate_limited: u64,
}

/// Shared counter store, one per instance.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    per_client: Arc<RwLock<HashMap<String, ClientMetrics>>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_submitted(&self, client: &str) {
        let mut metrics = self.per_client.write().await;
        metrics.entry(client.to_string()).or_default().submitted += 1;
    }

    pub async fn record_success(&self, client: &str) {
        let mut metrics = self.per_client.write().await;
        metrics.entry(client.to_string()).or_default().succeeded += 1;
    }

    pub async fn record_failure(&self, client: &str) {
        let mut metrics = self.per_client.write().await;
        metrics.entry(client.to_string()).or_default().failed += 1;
    }

    pub async fn record_retry(&self, client: &str, rate_limited: bool) {
        let mut metrics = self.per_client.write().await;
        let entry = metrics.entry(client.to_string()).or_default();
        entry.retried += 1;
        if rate_limited {
            entry.rate_limited += 1;
        }
    }

    /// Counters for one client (zeroes when it never saw traffic).
    pub async fn snapshot(&self, client: &str) -> ClientMetrics {
        self.per_client
            .read()
            .await
            .get(client)
            .cloned()
            .unwrap_or_default()
    }

    /// Counters for every client this instance submitted to.
    pub async fn snapshot_all(&self) -> HashMap<String, ClientMetrics> {
        self.per_client.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counters_accumulate() {
        let collector = MetricsCollector::new();
        collector.record_submitted("api").await;
        collector.record_submitted("api").await;
        collector.record_retry("api", true).await;
        collector.record_retry("api", false).await;
        collector.record_success("api").await;
        collector.record_failure("api").await;

        let metrics = collector.snapshot("api").await;
        assert_eq!(metrics.submitted, 2);
        assert_eq!(metrics.retried, 2);
        assert_eq!(metrics.rate_limited, 1);
        assert_eq!(metrics.succeeded, 1);
        assert_eq!(metrics.failed, 1);
    }

    #[tokio::test]
    async fn test_unknown_client_snapshots_zeroes() {
        let collector = MetricsCollector::new();
        let metrics = collector.snapshot("quiet").await;
        assert_eq!(metrics.submitted, 0);
    }

    #[tokio::test]
    async fn test_clients_are_isolated() {
        let collector = MetricsCollector::new();
        collector.record_submitted("a").await;
        collector.record_submitted("b").await;
        collector.record_success("a").await;

        let all = collector.snapshot_all().await;
        assert_eq!(all["a"].succeeded, 1);
        assert_eq!(all["b"].succeeded, 0);
    }
}
