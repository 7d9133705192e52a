use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Lifecycle of a call as seen by the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallPhase {
    Active,
    Ended,
}

/// Bookkeeping for one call buffer, independent of the audio bytes
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BufferInfo {
    pub interaction_id: String,
    pub tenant_id: String,
    pub sample_rate: u32,
    pub phase: CallPhase,
    pub created_at: DateTime<Utc>,
    pub last_frame_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub frames_received: u64,
    pub bytes_received: u64,
    pub flush_count: u64,
    pub flushed_bytes: u64,
    pub provider_failures: u64,
    pub transcripts_emitted: u64,
    pub first_seq: Option<u64>,
    pub last_seq: Option<u64>,
    pub out_of_order_frames: u64,
}

/// Result of recording a frame's sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOrder {
    First,
    InOrder,
    /// `seq` was not greater than the previous one
    OutOfOrder { previous: u64 },
}

#[derive(Debug, Default)]
pub struct BufferManager {
    buffers: Mutex<HashMap<String, BufferInfo>>,
}

impl BufferManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, BufferInfo>> {
        self.buffers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start tracking a call; returns false if it was already tracked
    pub fn create(&self, interaction_id: &str, tenant_id: &str, sample_rate: u32) -> bool {
        let mut buffers = self.lock();
        if buffers.contains_key(interaction_id) {
            return false;
        }
        let now = Utc::now();
        buffers.insert(
            interaction_id.to_string(),
            BufferInfo {
                interaction_id: interaction_id.to_string(),
                tenant_id: tenant_id.to_string(),
                sample_rate,
                phase: CallPhase::Active,
                created_at: now,
                last_frame_at: now,
                ended_at: None,
                frames_received: 0,
                bytes_received: 0,
                flush_count: 0,
                flushed_bytes: 0,
                provider_failures: 0,
                transcripts_emitted: 0,
                first_seq: None,
                last_seq: None,
                out_of_order_frames: 0,
            },
        );
        debug!("Buffer created for {} ({}Hz)", interaction_id, sample_rate);
        true
    }

    pub fn record_frame(&self, interaction_id: &str, seq: u64, bytes: usize) -> Option<FrameOrder> {
        let mut buffers = self.lock();
        let info = buffers.get_mut(interaction_id)?;

        info.frames_received += 1;
        info.bytes_received += bytes as u64;
        info.last_frame_at = Utc::now();

        let order = match info.last_seq {
            None => {
                info.first_seq = Some(seq);
                FrameOrder::First
            }
            Some(previous) if seq <= previous => {
                info.out_of_order_frames += 1;
                FrameOrder::OutOfOrder { previous }
            }
            Some(_) => FrameOrder::InOrder,
        };
        if !matches!(order, FrameOrder::OutOfOrder { .. }) {
            info.last_seq = Some(seq);
        }

        Some(order)
    }

    pub fn record_flush(&self, interaction_id: &str, bytes: usize) {
        if let Some(info) = self.lock().get_mut(interaction_id) {
            info.flush_count += 1;
            info.flushed_bytes += bytes as u64;
        }
    }

    pub fn record_failure(&self, interaction_id: &str) {
        if let Some(info) = self.lock().get_mut(interaction_id) {
            info.provider_failures += 1;
        }
    }

    pub fn record_transcript(&self, interaction_id: &str) {
        if let Some(info) = self.lock().get_mut(interaction_id) {
            info.transcripts_emitted += 1;
        }
    }

    pub fn mark_ended(&self, interaction_id: &str) -> bool {
        match self.lock().get_mut(interaction_id) {
            Some(info) => {
                if info.phase == CallPhase::Active {
                    info.phase = CallPhase::Ended;
                    info.ended_at = Some(Utc::now());
                }
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, interaction_id: &str) -> Option<BufferInfo> {
        self.lock().remove(interaction_id)
    }

    pub fn get(&self, interaction_id: &str) -> Option<BufferInfo> {
        self.lock().get(interaction_id).cloned()
    }

    /// All tracked buffers ordered by id
    pub fn list(&self) -> Vec<BufferInfo> {
        let mut infos: Vec<BufferInfo> = self.lock().values().cloned().collect();
        infos.sort_by(|a, b| a.interaction_id.cmp(&b.interaction_id));
        infos
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
