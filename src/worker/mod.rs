//! Per-call audio buffering and flow control
//!
//! This module provides the [`AudioWorker`] that manages:
//! - One audio accumulator per call, fed from the bus
//! - Duration-triggered, single-flight flushes to the speech provider
//! - Call-end grace periods and stale-buffer sweeps
//! - The operational status report

mod buffer;
mod engine;
mod manager;
mod metrics;
mod status;

pub use buffer::{audio_duration, CallBuffer, BYTES_PER_SAMPLE};
pub use engine::{AudioWorker, FrameOutcome, SweepReport, WorkerConfig};
pub use manager::{BufferInfo, BufferManager, CallPhase, FrameOrder};
pub use metrics::{WorkerMetrics, WorkerMetricsSnapshot};
pub use status::{BufferStatus, StatusReport};
