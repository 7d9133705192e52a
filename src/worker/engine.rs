use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::buffer::CallBuffer;
use super::manager::{BufferManager, FrameOrder};
use super::metrics::{WorkerMetrics, WorkerMetricsSnapshot};
use super::status::{BufferStatus, StatusReport};
use crate::bus::{Delivery, MessageBus, MessageHandler, SubscriptionHandle};
use crate::config::{BusConfig, WorkerSettings};
use crate::health::ConnectionHealthMonitor;
use crate::messages::{
    AudioFrameMessage, CallEndMessage, InboundMessage, TranscriptKind, TranscriptMessage,
};
use crate::provider::{CallContext, SpeechProvider};
use crate::resilience::{CircuitBreaker, CircuitError};
use crate::sink::TranscriptSink;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub service_name: String,
    pub audio_topic: String,
    pub call_end_topic: String,
    pub min_flush: Duration,
    pub max_flush: Duration,
    /// Active calls silent for longer than this are purged
    pub stale_timeout: Duration,
    /// Late frames are still accepted this long after a call ends
    pub grace_period: Duration,
    pub sweep_interval: Duration,
    /// How long an ended call's id is remembered after its purge
    pub ended_retention: Duration,
    pub provider_timeout: Duration,
}

impl WorkerConfig {
    pub fn from_settings(service_name: &str, bus: &BusConfig, worker: &WorkerSettings) -> Self {
        Self {
            service_name: service_name.to_string(),
            audio_topic: bus.audio_topic.clone(),
            call_end_topic: bus.call_end_topic.clone(),
            min_flush: worker.min_flush(),
            max_flush: worker.max_flush(),
            stale_timeout: Duration::from_millis(worker.stale_timeout_ms),
            grace_period: Duration::from_millis(worker.grace_period_ms),
            sweep_interval: Duration::from_millis(worker.sweep_interval_ms),
            ended_retention: Duration::from_millis(worker.ended_retention_ms),
            provider_timeout: Duration::from_millis(worker.provider_timeout_ms),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from_settings(
            "loqa-callstream",
            &BusConfig::default(),
            &WorkerSettings::default(),
        )
    }
}

/// What happened to one inbound audio frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Buffered { flush_started: bool },
    /// The call ended and its grace period has elapsed
    DroppedAfterEnd,
    Rejected,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub purged_ended: Vec<String>,
    pub purged_stale: Vec<String>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.purged_ended.is_empty() && self.purged_stale.is_empty()
    }
}

/// One provider-sized piece of audio and the context it is sent with
struct FlushPiece {
    context: CallContext,
    audio: Vec<u8>,
}

enum PurgeReason {
    Ended,
    Stale,
}

struct Shared {
    config: WorkerConfig,
    provider: Arc<dyn SpeechProvider>,
    sink: Arc<dyn TranscriptSink>,
    breaker: Arc<CircuitBreaker>,
    health: Arc<ConnectionHealthMonitor>,
    buffers: Mutex<HashMap<String, CallBuffer>>,
    /// Purged ended calls, by the instant they ended
    tombstones: Mutex<HashMap<String, Instant>>,
    manager: BufferManager,
    metrics: WorkerMetrics,
    generations: AtomicU64,
    flushes_in_flight: AtomicUsize,
    flushes_idle: Notify,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn handle_audio_frame(self: &Arc<Self>, frame: AudioFrameMessage) -> FrameOutcome {
        let now = Instant::now();
        let id = frame.interaction_id.clone();
        WorkerMetrics::incr(&self.metrics.frames_received);

        let pcm = match frame.decode_audio() {
            Ok(pcm) => pcm,
            Err(e) => {
                WorkerMetrics::incr(&self.metrics.frames_rejected);
                warn!("Dropping frame {}#{}: {}", id, frame.seq, e);
                return FrameOutcome::Rejected;
            }
        };

        let mut buffers = lock(&self.buffers);

        if !buffers.contains_key(&id) {
            let ended_at = lock(&self.tombstones).get(&id).copied();
            if let Some(ended_at) = ended_at {
                if now.duration_since(ended_at) > self.config.grace_period {
                    WorkerMetrics::incr(&self.metrics.frames_dropped_after_end);
                    debug!("Dropping frame {}#{}: call already ended", id, frame.seq);
                    return FrameOutcome::DroppedAfterEnd;
                }
                lock(&self.tombstones).remove(&id);
            }

            let mut buffer = CallBuffer::new(&id, &frame.tenant_id, frame.sample_rate, now);
            buffer.ended_at = ended_at;
            self.open_call(&mut buffer);
            buffers.insert(id.clone(), buffer);
        }

        let Some(buffer) = buffers.get_mut(&id) else {
            return FrameOutcome::Rejected;
        };

        if let Some(ended_at) = buffer.ended_at {
            if now.duration_since(ended_at) > self.config.grace_period {
                WorkerMetrics::incr(&self.metrics.frames_dropped_after_end);
                debug!("Dropping frame {}#{}: grace period elapsed", id, frame.seq);
                return FrameOutcome::DroppedAfterEnd;
            }
        }

        if frame.sample_rate != buffer.sample_rate {
            WorkerMetrics::incr(&self.metrics.frames_rejected);
            warn!(
                "Dropping frame {}#{}: sample rate {} does not match call rate {}",
                id, frame.seq, frame.sample_rate, buffer.sample_rate
            );
            return FrameOutcome::Rejected;
        }

        if let Some(FrameOrder::OutOfOrder { previous }) =
            self.manager.record_frame(&id, frame.seq, pcm.len())
        {
            WorkerMetrics::incr(&self.metrics.out_of_order_frames);
            debug!("Out-of-order frame for {}: seq {} after {}", id, frame.seq, previous);
        }

        buffer.append(pcm, now);

        if buffer.flush_in_flight {
            return FrameOutcome::Buffered {
                flush_started: false,
            };
        }

        let pieces = self.take_pieces(buffer);
        if pieces.is_empty() {
            return FrameOutcome::Buffered {
                flush_started: false,
            };
        }

        buffer.flush_in_flight = true;
        let generation = buffer.generation;
        drop(buffers);

        self.flushes_in_flight.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(Arc::clone(self).flush_loop(id, generation, pieces));

        FrameOutcome::Buffered {
            flush_started: true,
        }
    }

    fn open_call(&self, buffer: &mut CallBuffer) {
        buffer.generation = self.generations.fetch_add(1, Ordering::Relaxed);
        self.manager.create(
            &buffer.interaction_id,
            &buffer.tenant_id,
            buffer.sample_rate,
        );
        if buffer.ended_at.is_some() {
            self.manager.mark_ended(&buffer.interaction_id);
        }
        self.health
            .register(&buffer.interaction_id, Some(Arc::clone(&self.provider)));
        WorkerMetrics::incr(&self.metrics.calls_started);
        info!(
            "Call {} started (tenant={}, {}Hz)",
            buffer.interaction_id, buffer.tenant_id, buffer.sample_rate
        );
    }

    fn take_pieces(&self, buffer: &mut CallBuffer) -> Vec<FlushPiece> {
        buffer
            .take_pieces(self.config.min_flush, self.config.max_flush)
            .into_iter()
            .map(|audio| {
                let seq = buffer.next_seq;
                buffer.next_seq += 1;
                buffer.has_sent_initial_chunk = true;
                FlushPiece {
                    context: CallContext {
                        interaction_id: buffer.interaction_id.clone(),
                        tenant_id: buffer.tenant_id.clone(),
                        seq,
                        sample_rate: buffer.sample_rate,
                    },
                    audio,
                }
            })
            .collect()
    }

    /// Send pieces until the call's buffer holds less than the minimum
    async fn flush_loop(self: Arc<Self>, id: String, generation: u64, mut pieces: Vec<FlushPiece>) {
        loop {
            for piece in pieces {
                self.send_piece(piece).await;
            }

            pieces = {
                let mut buffers = lock(&self.buffers);
                match buffers.get_mut(&id) {
                    Some(buffer) if buffer.generation == generation => {
                        let next = self.take_pieces(buffer);
                        if next.is_empty() {
                            buffer.flush_in_flight = false;
                        }
                        next
                    }
                    _ => Vec::new(),
                }
            };

            if pieces.is_empty() {
                break;
            }
        }

        if self.flushes_in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.flushes_idle.notify_waiters();
        }
    }

    async fn send_piece(&self, piece: FlushPiece) {
        let FlushPiece { context, audio } = piece;
        let bytes = audio.len();
        let timeout = self.config.provider_timeout;

        let (audio_ref, context_ref) = (&audio, &context);

        let result = self
            .breaker
            .call(|| async move {
                WorkerMetrics::incr(&self.metrics.flushes);
                let call = self.provider.send_audio_chunk(audio_ref, context_ref);
                match tokio::time::timeout(timeout, call).await {
                    Ok(result) => result,
                    Err(_) => {
                        WorkerMetrics::incr(&self.metrics.provider_timeouts);
                        Err(anyhow!("provider timed out after {:?}", timeout))
                    }
                }
            })
            .await;

        let id = &context.interaction_id;
        let transcript = match result {
            Ok(transcript) => transcript,
            Err(CircuitError::Open { retry_in, .. }) => {
                WorkerMetrics::incr(&self.metrics.breaker_rejections);
                WorkerMetrics::add(&self.metrics.dropped_bytes, bytes as u64);
                self.manager.record_failure(id);
                warn!(
                    "Skipped flush {}#{} ({} bytes): provider circuit open, retry in {:?}",
                    id, context.seq, bytes, retry_in
                );
                return;
            }
            Err(CircuitError::Inner(e)) => {
                WorkerMetrics::incr(&self.metrics.flush_failures);
                WorkerMetrics::add(&self.metrics.dropped_bytes, bytes as u64);
                self.manager.record_failure(id);
                error!("Flush {}#{} failed: {:#}", id, context.seq, e);
                return;
            }
        };

        self.manager.record_flush(id, bytes);

        if transcript.is_empty() {
            WorkerMetrics::incr(&self.metrics.empty_transcripts);
            debug!("No speech in flush {}#{}", id, context.seq);
            return;
        }

        let message = TranscriptMessage {
            interaction_id: id.clone(),
            tenant_id: context.tenant_id.clone(),
            seq: context.seq,
            kind: if transcript.is_final {
                TranscriptKind::Final
            } else {
                TranscriptKind::Partial
            },
            text: transcript.text,
            confidence: transcript.confidence,
            timestamp_ms: Utc::now().timestamp_millis(),
        };

        match self.sink.emit(&message).await {
            Ok(()) => {
                WorkerMetrics::incr(&self.metrics.transcripts_emitted);
                self.manager.record_transcript(id);
            }
            Err(e) => {
                WorkerMetrics::incr(&self.metrics.sink_failures);
                error!(
                    "Failed to emit transcript {}#{} via {}: {:#}",
                    id,
                    context.seq,
                    self.sink.name(),
                    e
                );
            }
        }
    }

    fn handle_call_end(&self, end: CallEndMessage) {
        let now = Instant::now();
        let id = &end.interaction_id;
        let mut buffers = lock(&self.buffers);

        match buffers.get_mut(id) {
            Some(buffer) if buffer.ended_at.is_none() => {
                buffer.ended_at = Some(now);
                self.manager.mark_ended(id);
                WorkerMetrics::incr(&self.metrics.calls_ended);
                info!(
                    "Call {} ended (reason={:?}), accepting late frames for {:?}",
                    id, end.reason, self.config.grace_period
                );
            }
            Some(_) => debug!("Duplicate call end for {}", id),
            None => {
                let mut tombstones = lock(&self.tombstones);
                if !tombstones.contains_key(id) {
                    tombstones.insert(id.clone(), now);
                    WorkerMetrics::incr(&self.metrics.calls_ended);
                    debug!("Call end for {} without a buffer", id);
                }
            }
        }
    }

    async fn sweep(&self) -> SweepReport {
        let now = Instant::now();
        let grace = self.config.grace_period;
        let stale = self.config.stale_timeout;

        // Bookkeeping leaves with the buffer, under the same lock, so a frame
        // arriving mid-sweep either sees the tombstone or starts a clean call.
        let mut purged: Vec<(CallBuffer, PurgeReason)> = {
            let mut buffers = lock(&self.buffers);
            let expired: Vec<(String, PurgeReason)> = buffers
                .values()
                .filter_map(|b| match b.ended_at {
                    Some(ended_at) if now.duration_since(ended_at) > grace => {
                        Some((b.interaction_id.clone(), PurgeReason::Ended))
                    }
                    Some(_) => None,
                    None if now.duration_since(b.last_chunk_received_at) > stale => {
                        Some((b.interaction_id.clone(), PurgeReason::Stale))
                    }
                    None => None,
                })
                .collect();

            let purged: Vec<(CallBuffer, PurgeReason)> = expired
                .into_iter()
                .filter_map(|(id, reason)| buffers.remove(&id).map(|b| (b, reason)))
                .collect();

            let mut tombstones = lock(&self.tombstones);
            for (buffer, reason) in &purged {
                if let (PurgeReason::Ended, Some(ended_at)) = (reason, buffer.ended_at) {
                    tombstones.insert(buffer.interaction_id.clone(), ended_at);
                }
                self.discard(buffer);
            }
            let keep_for = grace + self.config.ended_retention;
            tombstones.retain(|_, ended_at| now.duration_since(*ended_at) <= keep_for);

            purged
        };
        purged.sort_by(|a, b| a.0.interaction_id.cmp(&b.0.interaction_id));

        let mut report = SweepReport::default();
        for (buffer, reason) in purged {
            let id = buffer.interaction_id.clone();
            self.release_provider(&buffer).await;
            match reason {
                PurgeReason::Ended => {
                    WorkerMetrics::incr(&self.metrics.calls_purged_ended);
                    info!("Purged ended call {}", id);
                    report.purged_ended.push(id);
                }
                PurgeReason::Stale => {
                    WorkerMetrics::incr(&self.metrics.calls_purged_stale);
                    warn!("Purged stale call {}: no frames for over {:?}", id, stale);
                    report.purged_stale.push(id);
                }
            }
        }

        report
    }

    /// Drop the call's tracking state. Caller holds the buffers lock.
    fn discard(&self, buffer: &CallBuffer) {
        let id = &buffer.interaction_id;
        if !buffer.is_empty() {
            WorkerMetrics::add(&self.metrics.dropped_bytes, buffer.len_bytes() as u64);
            debug!(
                "Discarding {:?} of unflushed audio for {}",
                buffer.duration(),
                id
            );
        }

        self.manager.remove(id);
        self.health.untrack(id);
    }

    async fn release_provider(&self, buffer: &CallBuffer) {
        let id = &buffer.interaction_id;
        let reopened = lock(&self.buffers)
            .get(id)
            .map(|current| current.generation > buffer.generation)
            .unwrap_or(false);
        if reopened {
            debug!("Call {} restarted during the sweep, keeping its provider session", id);
            return;
        }

        if let Err(e) = self.provider.release(id).await {
            warn!("Failed to release provider state for {}: {:#}", id, e);
        }
    }

    fn buffer_status(&self, buffer: &CallBuffer, now: Instant) -> Option<BufferStatus> {
        let info = self.manager.get(&buffer.interaction_id)?;
        Some(BufferStatus {
            info,
            buffered_ms: buffer.duration().as_millis() as u64,
            age_ms: now.duration_since(buffer.created_at).as_millis() as u64,
            idle_ms: now.duration_since(buffer.last_chunk_received_at).as_millis() as u64,
            flush_in_flight: buffer.flush_in_flight,
            has_sent_initial_chunk: buffer.has_sent_initial_chunk,
        })
    }
}

/// Routes bus deliveries into the worker
struct InboundHandler {
    shared: Arc<Shared>,
}

#[async_trait]
impl MessageHandler for InboundHandler {
    async fn handle(&self, delivery: &Delivery) -> Result<()> {
        let config = &self.shared.config;
        let message = InboundMessage::parse(
            &delivery.topic,
            &delivery.envelope,
            &config.audio_topic,
            &config.call_end_topic,
        );

        match message {
            Ok(InboundMessage::AudioFrame(frame)) => {
                self.shared.handle_audio_frame(frame);
            }
            Ok(InboundMessage::CallEnd(end)) => self.shared.handle_call_end(end),
            Err(e) => {
                WorkerMetrics::incr(&self.shared.metrics.frames_rejected);
                warn!(
                    "Skipping message {} on {}: {}",
                    delivery.message_id, delivery.topic, e
                );
            }
        }

        Ok(())
    }
}

/// Per-call buffering and flow control in front of the speech provider
///
/// Subscribes to the audio and call-end topics, accumulates frames per call,
/// flushes through the circuit breaker once enough audio is buffered, and
/// purges calls after their grace period or when they go stale.
pub struct AudioWorker {
    shared: Arc<Shared>,
    bus: Arc<dyn MessageBus>,
    started_at: chrono::DateTime<Utc>,
    running: AtomicBool,
    subscriptions: tokio::sync::Mutex<Vec<SubscriptionHandle>>,
    sweeper: tokio::sync::Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl AudioWorker {
    pub fn new(
        config: WorkerConfig,
        bus: Arc<dyn MessageBus>,
        provider: Arc<dyn SpeechProvider>,
        sink: Arc<dyn TranscriptSink>,
        breaker: Arc<CircuitBreaker>,
        health: Arc<ConnectionHealthMonitor>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                provider,
                sink,
                breaker,
                health,
                buffers: Mutex::new(HashMap::new()),
                tombstones: Mutex::new(HashMap::new()),
                manager: BufferManager::new(),
                metrics: WorkerMetrics::default(),
                generations: AtomicU64::new(0),
                flushes_in_flight: AtomicUsize::new(0),
                flushes_idle: Notify::new(),
            }),
            bus,
            started_at: Utc::now(),
            running: AtomicBool::new(false),
            subscriptions: tokio::sync::Mutex::new(Vec::new()),
            sweeper: tokio::sync::Mutex::new(None),
        }
    }

    /// Subscribe to both topics and start the background sweeps
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Worker already started");
            return Ok(());
        }

        let config = &self.shared.config;
        info!(
            "Starting audio worker on {} / {} via {}",
            config.audio_topic,
            config.call_end_topic,
            self.bus.name()
        );

        let handler = Arc::new(InboundHandler {
            shared: Arc::clone(&self.shared),
        });

        let mut subscriptions = self.subscriptions.lock().await;
        for topic in [&config.audio_topic, &config.call_end_topic] {
            match self.bus.subscribe(topic, handler.clone()).await {
                Ok(handle) => subscriptions.push(handle),
                Err(e) => {
                    for handle in subscriptions.drain(..) {
                        handle.unsubscribe();
                    }
                    self.running.store(false, Ordering::SeqCst);
                    return Err(e).with_context(|| format!("Failed to subscribe to {}", topic));
                }
            }
        }
        drop(subscriptions);

        self.shared.health.start();
        self.start_sweeper().await;

        info!("Audio worker started");
        Ok(())
    }

    async fn start_sweeper(&self) {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let shared = Arc::clone(&self.shared);
        let period = shared.config.sweep_interval;

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = shared.sweep().await;
                        if !report.is_empty() {
                            debug!("Sweep purged {:?}", report);
                        }
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Buffer sweep stopped");
        });

        *self.sweeper.lock().await = Some((stop_tx, join));
    }

    /// Unsubscribe, stop the sweeps and wait briefly for in-flight flushes
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Stopping audio worker");

        for handle in self.subscriptions.lock().await.drain(..) {
            handle.unsubscribe();
        }

        if let Some((stop_tx, join)) = self.sweeper.lock().await.take() {
            let _ = stop_tx.send(true);
            if let Err(e) = join.await {
                error!("Sweep task panicked: {}", e);
            }
        }

        self.shared.health.stop().await;

        if !self.wait_for_flushes(self.shared.config.provider_timeout).await {
            warn!("Stopped with flushes still in flight");
        }

        info!("Audio worker stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Process one audio frame as if it arrived on the audio topic
    pub fn handle_audio_frame(&self, frame: AudioFrameMessage) -> FrameOutcome {
        self.shared.handle_audio_frame(frame)
    }

    /// Process one call-end message as if it arrived on the call-end topic
    pub fn handle_call_end(&self, end: CallEndMessage) {
        self.shared.handle_call_end(end)
    }

    /// Run one stale/ended sweep now
    pub async fn sweep(&self) -> SweepReport {
        self.shared.sweep().await
    }

    /// Wait until no flush is in flight; false on timeout
    pub async fn wait_for_flushes(&self, timeout: Duration) -> bool {
        let shared = &self.shared;
        let idle = async {
            loop {
                let notified = shared.flushes_idle.notified();
                if shared.flushes_in_flight.load(Ordering::SeqCst) == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, idle).await.is_ok()
    }

    pub fn has_buffer(&self, interaction_id: &str) -> bool {
        lock(&self.shared.buffers).contains_key(interaction_id)
    }

    pub fn buffered_bytes(&self, interaction_id: &str) -> Option<usize> {
        lock(&self.shared.buffers)
            .get(interaction_id)
            .map(|b| b.len_bytes())
    }

    pub fn active_buffers(&self) -> usize {
        lock(&self.shared.buffers).len()
    }

    pub fn metrics(&self) -> WorkerMetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    pub fn call_status(&self, interaction_id: &str) -> Option<BufferStatus> {
        let now = Instant::now();
        let buffers = lock(&self.shared.buffers);
        buffers
            .get(interaction_id)
            .and_then(|b| self.shared.buffer_status(b, now))
    }

    pub fn status(&self) -> StatusReport {
        let now = Instant::now();
        let mut buffers: Vec<BufferStatus> = {
            let guard = lock(&self.shared.buffers);
            guard
                .values()
                .filter_map(|b| self.shared.buffer_status(b, now))
                .collect()
        };
        buffers.sort_by(|a, b| a.info.interaction_id.cmp(&b.info.interaction_id));

        StatusReport {
            service: self.shared.config.service_name.clone(),
            running: self.is_running(),
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
            active_buffers: buffers.len(),
            buffers,
            circuit_breaker: self.shared.breaker.get_stats(),
            connection_health: self.shared.health.summary(),
            bus_backend: self.bus.name().to_string(),
            bus: self.bus.metrics(),
            worker: self.metrics(),
        }
    }
}
