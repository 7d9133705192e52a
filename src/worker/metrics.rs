use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Worker counters, shared by the handlers, flush tasks and the sweep
#[derive(Debug, Default)]
pub struct WorkerMetrics {
    pub frames_received: AtomicU64,
    pub frames_rejected: AtomicU64,
    pub frames_dropped_after_end: AtomicU64,
    pub out_of_order_frames: AtomicU64,
    pub calls_started: AtomicU64,
    pub calls_ended: AtomicU64,
    pub calls_purged_ended: AtomicU64,
    pub calls_purged_stale: AtomicU64,
    pub flushes: AtomicU64,
    pub flush_failures: AtomicU64,
    pub provider_timeouts: AtomicU64,
    pub breaker_rejections: AtomicU64,
    pub transcripts_emitted: AtomicU64,
    pub empty_transcripts: AtomicU64,
    pub sink_failures: AtomicU64,
    pub dropped_bytes: AtomicU64,
}

impl WorkerMetrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WorkerMetricsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        WorkerMetricsSnapshot {
            frames_received: get(&self.frames_received),
            frames_rejected: get(&self.frames_rejected),
            frames_dropped_after_end: get(&self.frames_dropped_after_end),
            out_of_order_frames: get(&self.out_of_order_frames),
            calls_started: get(&self.calls_started),
            calls_ended: get(&self.calls_ended),
            calls_purged_ended: get(&self.calls_purged_ended),
            calls_purged_stale: get(&self.calls_purged_stale),
            flushes: get(&self.flushes),
            flush_failures: get(&self.flush_failures),
            provider_timeouts: get(&self.provider_timeouts),
            breaker_rejections: get(&self.breaker_rejections),
            transcripts_emitted: get(&self.transcripts_emitted),
            empty_transcripts: get(&self.empty_transcripts),
            sink_failures: get(&self.sink_failures),
            dropped_bytes: get(&self.dropped_bytes),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerMetricsSnapshot {
    pub frames_received: u64,
    /// Undecodable or invalid frames
    pub frames_rejected: u64,
    /// Frames for calls whose grace period had elapsed
    pub frames_dropped_after_end: u64,
    pub out_of_order_frames: u64,
    pub calls_started: u64,
    pub calls_ended: u64,
    pub calls_purged_ended: u64,
    pub calls_purged_stale: u64,
    /// Provider calls attempted
    pub flushes: u64,
    pub flush_failures: u64,
    pub provider_timeouts: u64,
    pub breaker_rejections: u64,
    pub transcripts_emitted: u64,
    pub empty_transcripts: u64,
    pub sink_failures: u64,
    /// Audio lost to failed flushes or discarded on purge
    pub dropped_bytes: u64,
}
