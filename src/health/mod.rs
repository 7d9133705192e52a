//! Liveness tracking for call-scoped provider connections

mod monitor;

pub use monitor::{ConnectionHealth, ConnectionHealthMonitor, HealthMonitorConfig, HealthSummary};
