//! Client seam for log-structured stream brokers with consumer groups
//!
//! [`crate::bus::redis::RedisStreamBus`] only talks to the broker through
//! these traits, so the connection pool, recovery and read loop logic run
//! the same against Redis or an in-process store.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// A single stream entry as returned by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: Vec<(String, Vec<u8>)>,
}

impl StreamEntry {
    pub fn field(&self, name: &str) -> Option<&[u8]> {
        self.fields
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_slice())
    }
}

/// Entries from one read plus the number of entries rejected during parsing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamBatch {
    pub entries: Vec<StreamEntry>,
    pub skipped: usize,
}

impl StreamBatch {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A message delivered to the group but not yet acknowledged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: String,
    pub consumer: String,
    pub idle_ms: u64,
    pub deliveries: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    Created,
    AlreadyExists,
}

/// Broker failures, pre-classified for the adapter's recovery policy
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// Connection refused or dropped: the cached connection must be discarded
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// Broker connection quota exhausted: back off before reconnecting
    #[error("connection limit reached: {0}")]
    ResourceExhausted(String),

    /// Anything else: retried after a short delay
    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait StreamClient: Send + Sync {
    /// Append an entry, trimming the stream to roughly `max_len` entries
    async fn append(
        &self,
        stream: &str,
        fields: &[(&str, &[u8])],
        max_len: usize,
    ) -> Result<String, StreamError>;

    /// Create `group` on `stream` starting at `start_id`, creating the stream if needed
    ///
    /// Must leave an existing group's cursor untouched.
    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
    ) -> Result<GroupStatus, StreamError>;

    /// Read entries never delivered to the group. `block: None` returns immediately.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Option<Duration>,
    ) -> Result<StreamBatch, StreamError>;

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, StreamError>;

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, StreamError>;

    /// Transfer ownership of idle pending entries to `consumer`
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[String],
    ) -> Result<StreamBatch, StreamError>;
}

/// Opens broker connections for the pool
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Arc<dyn StreamClient>, StreamError>;
}
