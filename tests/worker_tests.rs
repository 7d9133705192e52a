mod support;

use loqa_callstream::bus::{Envelope, MessageBus};
use loqa_callstream::health::{ConnectionHealthMonitor, HealthMonitorConfig};
use loqa_callstream::messages::{AudioFrameMessage, CallEndMessage, TranscriptKind};
use loqa_callstream::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use loqa_callstream::worker::{AudioWorker, FrameOutcome, WorkerConfig};
use std::sync::Arc;
use std::time::Duration;
use support::{eventually, stream_bus, MemoryBroker, RecordingSink, ScriptedProvider};

const RATE: u32 = 16_000;
/// 20ms of PCM16 mono at 16kHz
const FRAME_BYTES: usize = 640;
const WAIT: Duration = Duration::from_secs(2);

struct Harness {
    worker: Arc<AudioWorker>,
    bus: Arc<dyn MessageBus>,
    provider: Arc<ScriptedProvider>,
    sink: Arc<RecordingSink>,
    breaker: Arc<CircuitBreaker>,
    health: Arc<ConnectionHealthMonitor>,
}

fn harness_with(config: WorkerConfig, breaker: CircuitBreakerConfig) -> Harness {
    let broker = MemoryBroker::new();
    let pool = broker.pool();
    let bus: Arc<dyn MessageBus> = Arc::new(stream_bus(&pool, "workers", "w1"));
    let provider = ScriptedProvider::new();
    let sink = RecordingSink::new();
    let breaker = Arc::new(CircuitBreaker::new("speech-provider", breaker));
    let health = Arc::new(ConnectionHealthMonitor::new(HealthMonitorConfig::default()));

    let worker = Arc::new(AudioWorker::new(
        config,
        Arc::clone(&bus),
        provider.clone(),
        sink.clone(),
        Arc::clone(&breaker),
        Arc::clone(&health),
    ));

    Harness {
        worker,
        bus,
        provider,
        sink,
        breaker,
        health,
    }
}

fn harness() -> Harness {
    harness_with(test_config(), CircuitBreakerConfig::default())
}

fn test_config() -> WorkerConfig {
    WorkerConfig {
        sweep_interval: Duration::from_millis(50),
        ..WorkerConfig::default()
    }
}

fn frame(call: &str, seq: u64) -> AudioFrameMessage {
    AudioFrameMessage::new("acme", call, seq, RATE, &vec![seq as u8; FRAME_BYTES])
}

fn call_end(call: &str) -> CallEndMessage {
    CallEndMessage {
        interaction_id: call.to_string(),
        reason: "hangup".to_string(),
        provider_call_id: None,
    }
}

fn feed(h: &Harness, call: &str, seqs: std::ops::Range<u64>) -> Vec<FrameOutcome> {
    seqs.map(|seq| h.worker.handle_audio_frame(frame(call, seq)))
        .collect()
}

#[tokio::test]
async fn test_first_flush_after_fifth_frame() {
    let h = harness();

    let outcomes = feed(&h, "call-1", 0..4);
    assert!(outcomes
        .iter()
        .all(|o| *o == FrameOutcome::Buffered { flush_started: false }));
    assert!(h.worker.wait_for_flushes(WAIT).await);
    assert_eq!(h.provider.call_count(), 0);
    assert!(!h.worker.call_status("call-1").unwrap().has_sent_initial_chunk);

    let fifth = h.worker.handle_audio_frame(frame("call-1", 4));
    assert_eq!(fifth, FrameOutcome::Buffered { flush_started: true });
    assert!(h.worker.wait_for_flushes(WAIT).await);

    assert_eq!(h.provider.chunk_sizes(), vec![5 * FRAME_BYTES]);
    assert_eq!(h.worker.buffered_bytes("call-1"), Some(0));
    assert!(h.worker.call_status("call-1").unwrap().has_sent_initial_chunk);

    // Later frames accumulate into a fresh buffer
    feed(&h, "call-1", 5..12);
    assert!(h.worker.wait_for_flushes(WAIT).await);
    assert_eq!(h.provider.chunk_sizes(), vec![5 * FRAME_BYTES, 5 * FRAME_BYTES]);
    assert_eq!(h.worker.buffered_bytes("call-1"), Some(2 * FRAME_BYTES));

    let calls = h.provider.calls.lock().unwrap().clone();
    assert_eq!(calls[0].0.seq, 0);
    assert_eq!(calls[1].0.seq, 1);
    assert_eq!(calls[0].0.sample_rate, RATE);
    assert_eq!(calls[0].0.tenant_id, "acme");

    let transcripts = h.sink.transcripts.lock().unwrap().clone();
    assert_eq!(transcripts.len(), 2);
    assert_eq!(transcripts[0].interaction_id, "call-1");
    assert_eq!(transcripts[0].kind, TranscriptKind::Partial);
    assert_eq!(transcripts[1].seq, 1);
}

#[tokio::test]
async fn test_frames_from_bus_are_flushed() {
    let h = harness();
    h.worker.start().await.unwrap();

    for seq in 0..12 {
        let envelope = Envelope::wrap("audio.frames", &frame("call-1", seq)).unwrap();
        h.bus.publish("audio.frames", &envelope).await.unwrap();
    }

    assert!(eventually(WAIT, || h.worker.metrics().frames_received == 12).await);
    assert!(h.worker.wait_for_flushes(WAIT).await);

    let sizes = h.provider.chunk_sizes();
    assert_eq!(sizes.len(), 2);
    assert_eq!(sizes[0], 5 * FRAME_BYTES);
    assert!(sizes.iter().all(|s| *s >= 5 * FRAME_BYTES));
    let buffered = h.worker.buffered_bytes("call-1").unwrap();
    assert_eq!(sizes.iter().sum::<usize>() + buffered, 12 * FRAME_BYTES);

    assert!(eventually(WAIT, || h.bus.metrics().messages_processed == 12).await);

    h.worker.stop().await;
    assert!(!h.worker.is_running());
    h.bus.close().await.unwrap();
}

#[tokio::test]
async fn test_call_end_from_bus_marks_call_ended() {
    let h = harness();
    h.worker.start().await.unwrap();

    h.worker.handle_audio_frame(frame("call-1", 0));
    let envelope = Envelope::wrap("call.end", &call_end("call-1")).unwrap();
    h.bus.publish("call.end", &envelope).await.unwrap();

    assert!(eventually(WAIT, || h.worker.metrics().calls_ended == 1).await);
    let status = h.worker.call_status("call-1").unwrap();
    assert!(status.info.ended_at.is_some());

    h.worker.stop().await;
    h.bus.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_late_frames_within_grace_period_are_kept() {
    let h = harness();
    feed(&h, "call-x", 0..1);

    h.worker.handle_call_end(call_end("call-x"));

    tokio::time::advance(Duration::from_secs(1)).await;
    for seq in 1..4 {
        assert_eq!(
            h.worker.handle_audio_frame(frame("call-x", seq)),
            FrameOutcome::Buffered { flush_started: false }
        );
        tokio::time::advance(Duration::from_millis(300)).await;
    }
    assert_eq!(h.worker.buffered_bytes("call-x"), Some(4 * FRAME_BYTES));

    // 11s after the call ended
    tokio::time::advance(Duration::from_millis(9_100)).await;
    assert_eq!(
        h.worker.handle_audio_frame(frame("call-x", 4)),
        FrameOutcome::DroppedAfterEnd
    );
    assert_eq!(h.worker.buffered_bytes("call-x"), Some(4 * FRAME_BYTES));

    let report = h.worker.sweep().await;
    assert_eq!(report.purged_ended, vec!["call-x".to_string()]);
    assert!(!h.worker.has_buffer("call-x"));
    assert_eq!(*h.provider.released.lock().unwrap(), vec!["call-x".to_string()]);
    assert!(!h.health.is_tracked("call-x"));

    // A purged call is not recreated by stragglers
    assert_eq!(
        h.worker.handle_audio_frame(frame("call-x", 5)),
        FrameOutcome::DroppedAfterEnd
    );
    assert!(!h.worker.has_buffer("call-x"));

    let metrics = h.worker.metrics();
    assert_eq!(metrics.frames_dropped_after_end, 2);
    assert_eq!(metrics.calls_purged_ended, 1);
    assert_eq!(metrics.dropped_bytes, 4 * FRAME_BYTES as u64);
}

#[tokio::test(start_paused = true)]
async fn test_call_end_before_first_frame() {
    let h = harness();
    h.worker.handle_call_end(call_end("call-y"));

    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(
        h.worker.handle_audio_frame(frame("call-y", 0)),
        FrameOutcome::Buffered { flush_started: false }
    );
    let status = h.worker.call_status("call-y").unwrap();
    assert!(status.info.ended_at.is_some());

    tokio::time::advance(Duration::from_secs(9)).await;
    assert_eq!(
        h.worker.handle_audio_frame(frame("call-y", 1)),
        FrameOutcome::DroppedAfterEnd
    );
}

#[tokio::test(start_paused = true)]
async fn test_stale_buffer_purged_without_call_end() {
    let h = harness();
    feed(&h, "call-s", 0..2);
    feed(&h, "call-e", 0..2);
    h.worker.handle_call_end(call_end("call-e"));

    tokio::time::advance(Duration::from_secs(4)).await;
    assert!(h.worker.sweep().await.is_empty());

    tokio::time::advance(Duration::from_secs(2)).await;
    let report = h.worker.sweep().await;
    assert_eq!(report.purged_stale, vec!["call-s".to_string()]);
    // Ended calls wait for their grace period, not the stale timeout
    assert!(report.purged_ended.is_empty());
    assert!(h.worker.has_buffer("call-e"));
    assert!(!h.worker.has_buffer("call-s"));

    tokio::time::advance(Duration::from_secs(5)).await;
    let report = h.worker.sweep().await;
    assert_eq!(report.purged_ended, vec!["call-e".to_string()]);
    assert_eq!(h.worker.active_buffers(), 0);

    let metrics = h.worker.metrics();
    assert_eq!(metrics.calls_purged_stale, 1);
    assert_eq!(metrics.calls_purged_ended, 1);
}

#[tokio::test(start_paused = true)]
async fn test_frames_during_sweep_keep_new_call_state() {
    let h = harness();
    feed(&h, "call-a", 0..2);
    feed(&h, "call-b", 0..2);
    feed(&h, "call-c", 0..2);
    h.worker.handle_call_end(call_end("call-c"));

    tokio::time::advance(Duration::from_secs(11)).await;
    h.provider.set_release_delay("call-a", Duration::from_secs(1));

    let sweeper = tokio::spawn({
        let worker = Arc::clone(&h.worker);
        async move { worker.sweep().await }
    });
    // Parked inside the provider release for call-a
    while h.worker.has_buffer("call-a") {
        tokio::task::yield_now().await;
    }

    // call-b comes back, call-c is past its grace period
    assert_eq!(
        h.worker.handle_audio_frame(frame("call-b", 2)),
        FrameOutcome::Buffered { flush_started: false }
    );
    assert_eq!(
        h.worker.handle_audio_frame(frame("call-c", 2)),
        FrameOutcome::DroppedAfterEnd
    );

    let report = sweeper.await.unwrap();
    assert_eq!(
        report.purged_stale,
        vec!["call-a".to_string(), "call-b".to_string()]
    );
    assert_eq!(report.purged_ended, vec!["call-c".to_string()]);

    assert!(h.worker.has_buffer("call-b"));
    assert_eq!(h.worker.buffered_bytes("call-b"), Some(FRAME_BYTES));
    let status = h.worker.call_status("call-b").unwrap();
    assert_eq!(status.info.frames_received, 1);
    assert!(h.health.is_tracked("call-b"));
    assert!(!h.worker.has_buffer("call-c"));

    // The restarted call keeps its provider session
    assert_eq!(
        h.provider.released(),
        vec!["call-a".to_string(), "call-c".to_string()]
    );
}

#[tokio::test]
async fn test_background_sweep_purges_stale_buffers() {
    let config = WorkerConfig {
        stale_timeout: Duration::from_millis(100),
        sweep_interval: Duration::from_millis(30),
        ..WorkerConfig::default()
    };
    let h = harness_with(config, CircuitBreakerConfig::default());
    h.worker.start().await.unwrap();

    feed(&h, "call-1", 0..2);
    assert!(eventually(WAIT, || !h.worker.has_buffer("call-1")).await);

    h.worker.stop().await;
    h.bus.close().await.unwrap();
}

#[tokio::test]
async fn test_oversized_buffer_is_split() {
    let config = WorkerConfig {
        max_flush: Duration::from_millis(250),
        ..test_config()
    };
    let h = harness_with(config, CircuitBreakerConfig::default());

    // 1.05s in a single frame
    let pcm = vec![0u8; 33_600];
    let big = AudioFrameMessage::new("acme", "call-1", 0, RATE, &pcm);
    assert_eq!(
        h.worker.handle_audio_frame(big),
        FrameOutcome::Buffered { flush_started: true }
    );
    assert!(h.worker.wait_for_flushes(WAIT).await);

    assert_eq!(h.provider.chunk_sizes(), vec![8_000; 4]);
    assert_eq!(h.worker.buffered_bytes("call-1"), Some(1_600));

    let seqs: Vec<u64> = h
        .provider
        .calls
        .lock()
        .unwrap()
        .iter()
        .map(|(ctx, _)| ctx.seq)
        .collect();
    assert_eq!(seqs, vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn test_single_flight_per_call() {
    let h = harness();
    h.provider.set_delay(Duration::from_millis(200));

    feed(&h, "call-1", 0..5);
    let during = feed(&h, "call-1", 5..15);
    assert!(during
        .iter()
        .all(|o| *o == FrameOutcome::Buffered { flush_started: false }));

    assert!(h.worker.wait_for_flushes(WAIT).await);
    assert_eq!(
        h.provider.chunk_sizes(),
        vec![5 * FRAME_BYTES, 10 * FRAME_BYTES]
    );
    assert_eq!(h.worker.buffered_bytes("call-1"), Some(0));
}

#[tokio::test]
async fn test_provider_failure_keeps_call_buffer() {
    let h = harness();
    h.provider.set_failing(true);

    feed(&h, "call-1", 0..5);
    assert!(h.worker.wait_for_flushes(WAIT).await);
    assert_eq!(h.worker.metrics().flush_failures, 1);
    assert!(h.worker.has_buffer("call-1"));
    assert!(h.sink.texts().is_empty());

    h.provider.set_failing(false);
    feed(&h, "call-1", 5..10);
    assert!(h.worker.wait_for_flushes(WAIT).await);

    assert_eq!(h.sink.texts(), vec!["hello".to_string()]);
    let status = h.worker.call_status("call-1").unwrap();
    assert_eq!(status.info.provider_failures, 1);
    assert_eq!(status.info.flush_count, 1);
    assert_eq!(status.info.transcripts_emitted, 1);
}

#[tokio::test]
async fn test_open_breaker_skips_provider() {
    let breaker = CircuitBreakerConfig {
        failure_threshold: 2,
        ..CircuitBreakerConfig::default()
    };
    let h = harness_with(test_config(), breaker);
    h.provider.set_failing(true);

    for round in 0..3 {
        feed(&h, "call-1", round * 5..round * 5 + 5);
        assert!(h.worker.wait_for_flushes(WAIT).await);
    }

    assert_eq!(h.provider.call_count(), 2);
    assert_eq!(h.breaker.state(), CircuitState::Open);
    let metrics = h.worker.metrics();
    assert_eq!(metrics.flush_failures, 2);
    assert_eq!(metrics.breaker_rejections, 1);
    assert_eq!(metrics.dropped_bytes, 15 * FRAME_BYTES as u64);
}

#[tokio::test(start_paused = true)]
async fn test_provider_timeout_counts_as_failure() {
    let config = WorkerConfig {
        provider_timeout: Duration::from_millis(100),
        ..test_config()
    };
    let h = harness_with(config, CircuitBreakerConfig::default());
    h.provider.set_delay(Duration::from_secs(10));

    feed(&h, "call-1", 0..5);
    assert!(h.worker.wait_for_flushes(Duration::from_secs(1)).await);

    let metrics = h.worker.metrics();
    assert_eq!(metrics.provider_timeouts, 1);
    assert_eq!(metrics.flush_failures, 1);
    assert_eq!(h.breaker.get_stats().failure_count, 1);
}

#[tokio::test]
async fn test_empty_transcripts_are_not_emitted() {
    let h = harness();
    h.provider.reply("   ", false);
    h.provider.reply("see you tomorrow", true);

    feed(&h, "call-1", 0..5);
    assert!(h.worker.wait_for_flushes(WAIT).await);
    feed(&h, "call-1", 5..10);
    assert!(h.worker.wait_for_flushes(WAIT).await);

    let transcripts = h.sink.transcripts.lock().unwrap().clone();
    assert_eq!(transcripts.len(), 1);
    assert_eq!(transcripts[0].text, "see you tomorrow");
    assert_eq!(transcripts[0].kind, TranscriptKind::Final);
    assert_eq!(transcripts[0].seq, 1);
    assert_eq!(transcripts[0].confidence, Some(0.9));
    assert_eq!(h.worker.metrics().empty_transcripts, 1);
}

#[tokio::test]
async fn test_invalid_frames_are_rejected() {
    let h = harness();

    let mut bad_base64 = frame("call-1", 0);
    bad_base64.audio = "!!not base64!!".to_string();
    assert_eq!(h.worker.handle_audio_frame(bad_base64), FrameOutcome::Rejected);

    let odd = AudioFrameMessage::new("acme", "call-1", 1, RATE, &[1, 2, 3]);
    assert_eq!(h.worker.handle_audio_frame(odd), FrameOutcome::Rejected);

    let mut wrong_encoding = frame("call-1", 2);
    wrong_encoding.encoding = "mulaw".to_string();
    assert_eq!(
        h.worker.handle_audio_frame(wrong_encoding),
        FrameOutcome::Rejected
    );
    assert!(!h.worker.has_buffer("call-1"));

    feed(&h, "call-1", 3..4);
    let other_rate = AudioFrameMessage::new("acme", "call-1", 4, 8_000, &[0u8; 320]);
    assert_eq!(h.worker.handle_audio_frame(other_rate), FrameOutcome::Rejected);
    assert_eq!(h.worker.buffered_bytes("call-1"), Some(FRAME_BYTES));
    assert_eq!(h.worker.metrics().frames_rejected, 4);
}

#[tokio::test]
async fn test_out_of_order_frames_are_counted() {
    let h = harness();
    h.worker.handle_audio_frame(frame("call-1", 2));
    h.worker.handle_audio_frame(frame("call-1", 1));
    h.worker.handle_audio_frame(frame("call-1", 3));

    let status = h.worker.call_status("call-1").unwrap();
    assert_eq!(status.info.out_of_order_frames, 1);
    assert_eq!(status.info.last_seq, Some(3));
    assert_eq!(h.worker.buffered_bytes("call-1"), Some(3 * FRAME_BYTES));
}

#[tokio::test]
async fn test_status_report() {
    let h = harness();
    feed(&h, "call-b", 0..2);
    feed(&h, "call-a", 0..1);

    let report = h.worker.status();
    assert_eq!(report.active_buffers, 2);
    assert_eq!(report.buffers[0].info.interaction_id, "call-a");
    assert_eq!(report.buffers[1].buffered_ms, 40);
    assert_eq!(report.circuit_breaker.state, CircuitState::Closed);
    assert_eq!(report.connection_health.total, 2);
    assert_eq!(report.bus_backend, "redis-streams");
    assert_eq!(report.worker.calls_started, 2);

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["active_buffers"], 2);
    assert_eq!(json["buffers"][0]["interaction_id"], "call-a");
    assert_eq!(json["circuit_breaker"]["state"], "closed");

    assert!(h.worker.call_status("missing").is_none());
}
