use chrono::{DateTime, Utc};
use serde::Serialize;

use super::manager::BufferInfo;
use super::metrics::WorkerMetricsSnapshot;
use crate::bus::BusMetricsSnapshot;
use crate::health::HealthSummary;
use crate::resilience::BreakerStats;

/// Live view of one call buffer
#[derive(Debug, Clone, Serialize)]
pub struct BufferStatus {
    #[serde(flatten)]
    pub info: BufferInfo,
    /// Audio waiting for the next flush
    pub buffered_ms: u64,
    pub age_ms: u64,
    pub idle_ms: u64,
    pub flush_in_flight: bool,
    /// At least one chunk of this call has gone to the provider
    pub has_sent_initial_chunk: bool,
}

/// Operational report served on `/status`
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub service: String,
    pub running: bool,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub active_buffers: usize,
    pub buffers: Vec<BufferStatus>,
    pub circuit_breaker: BreakerStats,
    pub connection_health: HealthSummary,
    pub bus_backend: String,
    pub bus: BusMetricsSnapshot,
    pub worker: WorkerMetricsSnapshot,
}
