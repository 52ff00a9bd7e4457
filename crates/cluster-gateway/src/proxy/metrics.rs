//! Outcome recording of proxied requests.
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};


/// Status recorded when the caller went away before the request finished.
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

/// Labels of one finished proxied request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestRecord {
    pub resource: String,
    pub verb: String,
    pub cluster: String,
    pub code: u16,
    pub latency: Duration,
}

pub trait ProxyMetrics: Send + Sync {
    /// Records the per resource/verb count, the per cluster count and the
    /// latency of one request.
    fn record_request(&self, record: RequestRecord);
}

/// Emits one structured event per finished request.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingMetrics;

impl ProxyMetrics for TracingMetrics {
    fn record_request(&self, record: RequestRecord) {
        tracing::event!(
            target: "cluster_gateway::metrics",
            tracing::Level::INFO,
            k8s.resource.name = %record.resource,
            http.request.verb = %record.verb,
            cluster.name = %record.cluster,
            http.response.status_code = record.code,
            latency = ?record.latency,
            "proxied request finished"
        );
    }
}

/// Keeps every record in memory.
#[derive(Clone, Debug, Default)]
pub struct InMemoryMetrics {
    records: Arc<Mutex<Vec<RequestRecord>>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<RequestRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

impl ProxyMetrics for InMemoryMetrics {
    fn record_request(&self, record: RequestRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }
}
