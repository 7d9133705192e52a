use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Bytes per PCM16 mono sample
pub const BYTES_PER_SAMPLE: usize = 2;

/// Duration of `bytes` of PCM16 mono audio at `sample_rate`
pub fn audio_duration(bytes: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    let samples = (bytes / BYTES_PER_SAMPLE) as u64;
    Duration::from_micros(samples * 1_000_000 / sample_rate as u64)
}

/// Smallest sample-aligned byte count lasting at least `duration`
fn bytes_at_least(duration: Duration, sample_rate: u32) -> usize {
    let micros = duration.as_micros() as u64 * sample_rate as u64;
    let samples = micros.div_ceil(1_000_000);
    (samples as usize).max(1) * BYTES_PER_SAMPLE
}

/// Largest sample-aligned byte count lasting at most `duration`
fn bytes_at_most(duration: Duration, sample_rate: u32) -> usize {
    let samples = duration.as_micros() as u64 * sample_rate as u64 / 1_000_000;
    (samples as usize).max(1) * BYTES_PER_SAMPLE
}

/// Accumulated audio for one call
#[derive(Debug)]
pub struct CallBuffer {
    pub interaction_id: String,
    pub tenant_id: String,
    pub sample_rate: u32,
    chunks: VecDeque<Vec<u8>>,
    bytes: usize,
    pub created_at: Instant,
    pub last_chunk_received_at: Instant,
    pub has_sent_initial_chunk: bool,
    /// Single-flight guard for provider calls
    pub flush_in_flight: bool,
    /// Next transcript sequence number
    pub next_seq: u64,
    /// Set when a call-end message arrives
    pub ended_at: Option<Instant>,
    /// Distinguishes a re-created buffer from an earlier one with the same id
    pub generation: u64,
}

impl CallBuffer {
    pub fn new(interaction_id: &str, tenant_id: &str, sample_rate: u32, now: Instant) -> Self {
        Self {
            interaction_id: interaction_id.to_string(),
            tenant_id: tenant_id.to_string(),
            sample_rate,
            chunks: VecDeque::new(),
            bytes: 0,
            created_at: now,
            last_chunk_received_at: now,
            has_sent_initial_chunk: false,
            flush_in_flight: false,
            next_seq: 0,
            ended_at: None,
            generation: 0,
        }
    }

    pub fn append(&mut self, pcm: Vec<u8>, now: Instant) {
        self.bytes += pcm.len();
        self.chunks.push_back(pcm);
        self.last_chunk_received_at = now;
    }

    pub fn len_bytes(&self) -> usize {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }

    pub fn duration(&self) -> Duration {
        audio_duration(self.bytes, self.sample_rate)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Drain the buffer into provider-sized pieces.
    ///
    /// Each piece lasts at least `min` and at most `max`. A trailing
    /// remainder shorter than `min` stays in the buffer. Nothing is taken
    /// while the buffer holds less than `min`.
    pub fn take_pieces(&mut self, min: Duration, max: Duration) -> Vec<Vec<u8>> {
        let min_bytes = bytes_at_least(min, self.sample_rate);
        let max_bytes = bytes_at_most(max, self.sample_rate).max(min_bytes);

        if self.bytes < min_bytes {
            return Vec::new();
        }

        let mut audio = Vec::with_capacity(self.bytes);
        for chunk in self.chunks.drain(..) {
            audio.extend_from_slice(&chunk);
        }
        self.bytes = 0;

        let mut pieces = Vec::new();
        let mut rest = audio.as_slice();
        while rest.len() >= max_bytes {
            let (piece, tail) = rest.split_at(max_bytes);
            pieces.push(piece.to_vec());
            rest = tail;
        }
        if rest.len() >= min_bytes {
            pieces.push(rest.to_vec());
        } else if !rest.is_empty() {
            self.bytes = rest.len();
            self.chunks.push_front(rest.to_vec());
        }

        pieces
    }
}
