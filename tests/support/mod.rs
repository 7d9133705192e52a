#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use loqa_callstream::bus::redis::{RedisStreamBus, StreamBusConfig};
use loqa_callstream::bus::{
    ConnectionPool, Connector, GroupStatus, PendingEntry, PoolConfig, StreamBatch, StreamClient,
    StreamEntry, StreamError,
};
use loqa_callstream::messages::TranscriptMessage;
use loqa_callstream::provider::{CallContext, SpeechProvider, Transcript};
use loqa_callstream::sink::TranscriptSink;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

pub const BROKER_URL: &str = "redis://memory:6379";

// ============================================================================
// In-memory stream broker
// ============================================================================

struct Pending {
    consumer: String,
    delivered_at: Instant,
    deliveries: u64,
}

#[derive(Default)]
struct Group {
    last_delivered: u64,
    pending: BTreeMap<u64, Pending>,
}

#[derive(Default)]
struct Stream {
    next_id: u64,
    entries: VecDeque<(u64, Vec<(String, Vec<u8>)>)>,
    groups: HashMap<String, Group>,
}

#[derive(Default)]
struct BrokerState {
    streams: Mutex<HashMap<String, Stream>>,
    appended: Notify,
    connects: AtomicUsize,
    connect_failures: Mutex<VecDeque<StreamError>>,
    command_failures: Mutex<VecDeque<StreamError>>,
}

/// Consumer-group stream store with Redis Streams semantics
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

fn entry_id(id: u64) -> String {
    format!("{}-0", id)
}

fn parse_id(id: &str) -> Option<u64> {
    id.split('-').next()?.parse().ok()
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Make the next connection attempt fail
    pub fn fail_next_connect(&self, error: StreamError) {
        self.state.connect_failures.lock().unwrap().push_back(error);
    }

    /// Make the next broker command fail
    pub fn fail_next_command(&self, error: StreamError) {
        self.state.command_failures.lock().unwrap().push_back(error);
    }

    pub fn stream_len(&self, stream: &str) -> usize {
        self.state
            .streams
            .lock()
            .unwrap()
            .get(stream)
            .map(|s| s.entries.len())
            .unwrap_or(0)
    }

    pub fn pending_count(&self, stream: &str, group: &str) -> usize {
        self.state
            .streams
            .lock()
            .unwrap()
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len())
            .unwrap_or(0)
    }

    /// Id of the last entry handed to `group`
    pub fn group_cursor(&self, stream: &str, group: &str) -> Option<u64> {
        self.state
            .streams
            .lock()
            .unwrap()
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.last_delivered)
    }

    /// Append an entry with arbitrary fields, bypassing the adapter
    pub fn append_raw(&self, stream: &str, fields: &[(&str, &[u8])]) -> String {
        let mut streams = self.state.streams.lock().unwrap();
        let stream = streams.entry(stream.to_string()).or_default();
        stream.next_id += 1;
        let id = stream.next_id;
        stream.entries.push_back((
            id,
            fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_vec()))
                .collect(),
        ));
        drop(streams);
        self.state.appended.notify_waiters();
        entry_id(id)
    }

    pub fn pool(&self) -> Arc<ConnectionPool> {
        Arc::new(ConnectionPool::new(
            Arc::new(self.clone()),
            PoolConfig::default(),
        ))
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self, _url: &str) -> Result<Arc<dyn StreamClient>, StreamError> {
        if let Some(error) = self.state.connect_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryClient {
            state: Arc::clone(&self.state),
            line: tokio::sync::Mutex::new(()),
        }))
    }
}

/// One client connection. Commands on it run one at a time, the way a Redis
/// server answers a single connection in order.
struct MemoryClient {
    state: Arc<BrokerState>,
    line: tokio::sync::Mutex<()>,
}

impl MemoryClient {
    fn injected_failure(&self) -> Result<(), StreamError> {
        match self.state.command_failures.lock().unwrap().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn try_read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<StreamBatch, StreamError> {
        let mut streams = self.state.streams.lock().unwrap();
        let stream = streams
            .get_mut(stream)
            .ok_or_else(|| StreamError::Other("NOGROUP no such stream".to_string()))?;
        let group = stream
            .groups
            .get_mut(group)
            .ok_or_else(|| StreamError::Other("NOGROUP no such group".to_string()))?;

        let mut batch = StreamBatch::default();
        for (id, fields) in stream.entries.iter() {
            if batch.entries.len() >= count {
                break;
            }
            if *id <= group.last_delivered {
                continue;
            }
            group.last_delivered = *id;
            group.pending.insert(
                *id,
                Pending {
                    consumer: consumer.to_string(),
                    delivered_at: Instant::now(),
                    deliveries: 1,
                },
            );
            batch.entries.push(StreamEntry {
                id: entry_id(*id),
                fields: fields.clone(),
            });
        }
        Ok(batch)
    }
}

#[async_trait]
impl StreamClient for MemoryClient {
    async fn append(
        &self,
        stream: &str,
        fields: &[(&str, &[u8])],
        max_len: usize,
    ) -> Result<String, StreamError> {
        let _line = self.line.lock().await;
        self.injected_failure()?;
        let id = {
            let mut streams = self.state.streams.lock().unwrap();
            let stream = streams.entry(stream.to_string()).or_default();
            stream.next_id += 1;
            let id = stream.next_id;
            stream.entries.push_back((
                id,
                fields
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_vec()))
                    .collect(),
            ));
            while stream.entries.len() > max_len {
                stream.entries.pop_front();
            }
            id
        };
        self.state.appended.notify_waiters();
        Ok(entry_id(id))
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
    ) -> Result<GroupStatus, StreamError> {
        let _line = self.line.lock().await;
        self.injected_failure()?;
        let mut streams = self.state.streams.lock().unwrap();
        let stream = streams.entry(stream.to_string()).or_default();
        if stream.groups.contains_key(group) {
            return Ok(GroupStatus::AlreadyExists);
        }
        let last_delivered = if start_id == "$" {
            stream.next_id
        } else {
            parse_id(start_id).unwrap_or(0)
        };
        stream.groups.insert(
            group.to_string(),
            Group {
                last_delivered,
                pending: BTreeMap::new(),
            },
        );
        Ok(GroupStatus::Created)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Option<Duration>,
    ) -> Result<StreamBatch, StreamError> {
        let _line = self.line.lock().await;
        self.injected_failure()?;
        let appended = self.state.appended.notified();
        let batch = self.try_read(stream, group, consumer, count)?;
        match block {
            Some(block) if batch.is_empty() => {
                let _ = tokio::time::timeout(block, appended).await;
                self.try_read(stream, group, consumer, count)
            }
            _ => Ok(batch),
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, StreamError> {
        let _line = self.line.lock().await;
        self.injected_failure()?;
        let mut streams = self.state.streams.lock().unwrap();
        let Some(group) = streams.get_mut(stream).and_then(|s| s.groups.get_mut(group)) else {
            return Ok(0);
        };
        let acked = ids
            .iter()
            .filter_map(|id| parse_id(id))
            .filter(|id| group.pending.remove(id).is_some())
            .count();
        Ok(acked as u64)
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, StreamError> {
        let _line = self.line.lock().await;
        self.injected_failure()?;
        let streams = self.state.streams.lock().unwrap();
        let Some(group) = streams.get(stream).and_then(|s| s.groups.get(group)) else {
            return Ok(Vec::new());
        };
        let now = Instant::now();
        Ok(group
            .pending
            .iter()
            .take(count)
            .map(|(id, p)| PendingEntry {
                id: entry_id(*id),
                consumer: p.consumer.clone(),
                idle_ms: now.duration_since(p.delivered_at).as_millis() as u64,
                deliveries: p.deliveries,
            })
            .collect())
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[String],
    ) -> Result<StreamBatch, StreamError> {
        let _line = self.line.lock().await;
        self.injected_failure()?;
        let mut streams = self.state.streams.lock().unwrap();
        let Some(stream) = streams.get_mut(stream) else {
            return Ok(StreamBatch::default());
        };
        let Some(group) = stream.groups.get_mut(group) else {
            return Ok(StreamBatch::default());
        };

        let now = Instant::now();
        let mut batch = StreamBatch::default();
        for id in ids.iter().filter_map(|id| parse_id(id)) {
            let Some(pending) = group.pending.get_mut(&id) else {
                continue;
            };
            if now.duration_since(pending.delivered_at) < min_idle {
                continue;
            }
            match stream.entries.iter().find(|(entry, _)| *entry == id) {
                Some((_, fields)) => {
                    pending.consumer = consumer.to_string();
                    pending.delivered_at = now;
                    pending.deliveries += 1;
                    batch.entries.push(StreamEntry {
                        id: entry_id(id),
                        fields: fields.clone(),
                    });
                }
                None => {
                    // Trimmed away while pending
                    group.pending.remove(&id);
                    batch.skipped += 1;
                }
            }
        }
        Ok(batch)
    }
}

/// Bus settings tuned for fast tests
pub fn bus_config(group: &str, consumer: &str) -> StreamBusConfig {
    let mut config = StreamBusConfig::new(BROKER_URL, group);
    config.consumer = consumer.to_string();
    config.block = Duration::from_millis(20);
    config.transient_retry = Duration::from_millis(20);
    config.claim_min_idle = Duration::ZERO;
    config
}

pub fn stream_bus(pool: &Arc<ConnectionPool>, group: &str, consumer: &str) -> RedisStreamBus {
    RedisStreamBus::new(bus_config(group, consumer), Arc::clone(pool))
}

// ============================================================================
// Provider and sink doubles
// ============================================================================

/// Speech provider that records every chunk and replies from a script
#[derive(Default)]
pub struct ScriptedProvider {
    pub calls: Mutex<Vec<(CallContext, usize)>>,
    pub released: Mutex<Vec<String>>,
    replies: Mutex<VecDeque<Transcript>>,
    failing: AtomicBool,
    delay: Mutex<Option<Duration>>,
    release_delay: Mutex<Option<(String, Duration)>>,
}

impl ScriptedProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a reply; once the queue is empty the provider answers "hello"
    pub fn reply(&self, text: &str, is_final: bool) {
        self.replies.lock().unwrap().push_back(Transcript {
            text: text.to_string(),
            confidence: Some(0.9),
            is_final,
        });
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Make `release` for one call take `delay`
    pub fn set_release_delay(&self, interaction_id: &str, delay: Duration) {
        *self.release_delay.lock().unwrap() = Some((interaction_id.to_string(), delay));
    }

    pub fn released(&self) -> Vec<String> {
        self.released.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn chunk_sizes(&self) -> Vec<usize> {
        self.calls.lock().unwrap().iter().map(|(_, n)| *n).collect()
    }
}

#[async_trait]
impl SpeechProvider for ScriptedProvider {
    async fn send_audio_chunk(&self, audio: &[u8], context: &CallContext) -> Result<Transcript> {
        self.calls
            .lock()
            .unwrap()
            .push((context.clone(), audio.len()));

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("provider unavailable");
        }

        let reply = self.replies.lock().unwrap().pop_front();
        Ok(reply.unwrap_or(Transcript {
            text: "hello".to_string(),
            confidence: Some(0.9),
            is_final: false,
        }))
    }

    async fn release(&self, interaction_id: &str) -> Result<()> {
        let delay = match &*self.release_delay.lock().unwrap() {
            Some((id, delay)) if id == interaction_id => Some(*delay),
            _ => None,
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.released
            .lock()
            .unwrap()
            .push(interaction_id.to_string());
        Ok(())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub transcripts: Mutex<Vec<TranscriptMessage>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn texts(&self) -> Vec<String> {
        self.transcripts
            .lock()
            .unwrap()
            .iter()
            .map(|t| t.text.clone())
            .collect()
    }
}

#[async_trait]
impl TranscriptSink for RecordingSink {
    async fn emit(&self, transcript: &TranscriptMessage) -> Result<()> {
        self.transcripts.lock().unwrap().push(transcript.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}

/// Poll `check` until it holds or `timeout` passes. Follows the tokio clock,
/// so it also works in paused-time tests.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
