//! Reference-counted broker connection pool
//!
//! Connections are keyed by broker URL and shared by every adapter built on
//! the same pool. Dedicated connections for blocking readers are keyed by
//! URL and owner. The physical connection is dropped only when the last
//! lease is released. A connection-limit error puts the URL into a cooldown
//! window during which no new connection is attempted.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::error::{BusError, BusResult};
use super::stream::{Connector, StreamClient, StreamError};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections held open at once, shared and dedicated
    pub max_entries: usize,
    /// Cooldown after the broker reports its connection limit
    pub backoff: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_entries: 16,
            backoff: Duration::from_secs(60),
        }
    }
}

/// A share of a pooled connection
#[derive(Clone)]
pub struct PoolLease {
    pub url: String,
    key: String,
    pub client: Arc<dyn StreamClient>,
    generation: u64,
}

impl std::fmt::Debug for PoolLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolLease")
            .field("url", &self.url)
            .field("generation", &self.generation)
            .finish()
    }
}

struct PoolEntry {
    client: Arc<dyn StreamClient>,
    refs: usize,
    generation: u64,
}

#[derive(Default)]
struct PoolState {
    entries: HashMap<String, PoolEntry>,
    cooldowns: HashMap<String, Instant>,
    next_generation: u64,
}

#[derive(Debug, Default)]
struct PoolCounters {
    open: AtomicU64,
    created: AtomicU64,
    reused: AtomicU64,
    closed: AtomicU64,
    invalidated: AtomicU64,
    backoff_rejections: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub open_connections: usize,
    pub created: u64,
    pub reused: u64,
    pub closed: u64,
    pub invalidated: u64,
    pub backoff_rejections: u64,
}

pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    counters: PoolCounters,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>, config: PoolConfig) -> Self {
        Self {
            connector,
            config,
            state: Mutex::new(PoolState::default()),
            counters: PoolCounters::default(),
        }
    }

    /// Take a share of the connection for `url`, opening one if needed
    pub async fn acquire(&self, url: &str) -> BusResult<PoolLease> {
        self.acquire_keyed(url, url.to_string()).await
    }

    /// Open a connection to `url` that only `owner` uses
    ///
    /// Blocking reads park the broker connection they run on, so each reader
    /// gets its own entry. It still counts against the pool limit and the
    /// cooldown window, and closes when the lease is released.
    pub async fn acquire_dedicated(&self, url: &str, owner: &str) -> BusResult<PoolLease> {
        self.acquire_keyed(url, format!("{}#{}", url, owner)).await
    }

    async fn acquire_keyed(&self, url: &str, key: String) -> BusResult<PoolLease> {
        {
            let mut state = self.state.lock().await;

            if let Some(lease) = self.share(&mut state, url, &key) {
                return Ok(lease);
            }

            if let Some(remaining) = Self::cooldown_remaining(&mut state, url) {
                self.counters
                    .backoff_rejections
                    .fetch_add(1, Ordering::Relaxed);
                return Err(BusError::BackoffActive {
                    url: url.to_string(),
                    retry_in_secs: remaining.as_secs_f64().ceil() as u64,
                });
            }

            if state.entries.len() >= self.config.max_entries {
                return Err(self.pool_full(url));
            }
        }

        // The state lock is not held while connecting
        info!("Opening broker connection to {}", url);
        let client = match self.connector.connect(url).await {
            Ok(client) => client,
            Err(StreamError::ResourceExhausted(reason)) => {
                self.record_exhaustion(url).await;
                return Err(BusError::ResourceExhausted {
                    url: url.to_string(),
                    reason,
                });
            }
            Err(StreamError::ConnectionRefused(reason)) => {
                return Err(BusError::ConnectionRefused {
                    url: url.to_string(),
                    reason,
                });
            }
            Err(StreamError::Other(reason)) => {
                return Err(BusError::Transient {
                    topic: String::new(),
                    reason: format!("failed to connect to {}: {}", url, reason),
                });
            }
        };

        let mut state = self.state.lock().await;

        if let Some(lease) = self.share(&mut state, url, &key) {
            debug!("Another task connected to {} first, dropping the extra connection", url);
            return Ok(lease);
        }
        if state.entries.len() >= self.config.max_entries {
            return Err(self.pool_full(url));
        }

        state.next_generation += 1;
        let generation = state.next_generation;
        state.entries.insert(
            key.clone(),
            PoolEntry {
                client: Arc::clone(&client),
                refs: 1,
                generation,
            },
        );
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        self.counters.open.fetch_add(1, Ordering::Relaxed);
        info!("Connected to broker at {}", url);

        Ok(PoolLease {
            url: url.to_string(),
            key,
            client,
            generation,
        })
    }

    fn share(&self, state: &mut PoolState, url: &str, key: &str) -> Option<PoolLease> {
        let entry = state.entries.get_mut(key)?;
        entry.refs += 1;
        self.counters.reused.fetch_add(1, Ordering::Relaxed);
        debug!("Reusing pooled connection to {} (refs={})", url, entry.refs);
        Some(PoolLease {
            url: url.to_string(),
            key: key.to_string(),
            client: Arc::clone(&entry.client),
            generation: entry.generation,
        })
    }

    fn pool_full(&self, url: &str) -> BusError {
        BusError::ResourceExhausted {
            url: url.to_string(),
            reason: format!(
                "connection pool is full ({} entries)",
                self.config.max_entries
            ),
        }
    }

    /// Give back a share. The connection closes when no share remains.
    pub async fn release(&self, lease: PoolLease) {
        let mut state = self.state.lock().await;

        let remove = match state.entries.get_mut(&lease.key) {
            Some(entry) if entry.generation == lease.generation => {
                entry.refs = entry.refs.saturating_sub(1);
                entry.refs == 0
            }
            // Already invalidated and possibly replaced; nothing to release.
            _ => false,
        };

        if remove {
            state.entries.remove(&lease.key);
            self.counters.open.fetch_sub(1, Ordering::Relaxed);
            self.counters.closed.fetch_add(1, Ordering::Relaxed);
            info!("Closed broker connection to {} (no remaining references)", lease.url);
        }
    }

    /// Drop a broken connection so the next acquire opens a fresh one
    pub async fn invalidate(&self, lease: &PoolLease) {
        let mut state = self.state.lock().await;

        let matches = state
            .entries
            .get(&lease.key)
            .map(|entry| entry.generation == lease.generation)
            .unwrap_or(false);

        if matches {
            state.entries.remove(&lease.key);
            self.counters.open.fetch_sub(1, Ordering::Relaxed);
            self.counters.invalidated.fetch_add(1, Ordering::Relaxed);
            warn!("Invalidated pooled connection to {}", lease.url);
        }
    }

    /// Enter the cooldown window for `url`. Open connections stay cached.
    pub async fn record_exhaustion(&self, url: &str) {
        let mut state = self.state.lock().await;
        self.start_cooldown(&mut state, url);
    }

    /// Time left in the cooldown window for `url`, if any
    pub async fn backoff_remaining(&self, url: &str) -> Option<Duration> {
        let mut state = self.state.lock().await;
        Self::cooldown_remaining(&mut state, url)
    }

    pub(crate) fn note_backoff_rejection(&self) {
        self.counters
            .backoff_rejections
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> PoolStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        PoolStats {
            open_connections: get(&self.counters.open) as usize,
            created: get(&self.counters.created),
            reused: get(&self.counters.reused),
            closed: get(&self.counters.closed),
            invalidated: get(&self.counters.invalidated),
            backoff_rejections: get(&self.counters.backoff_rejections),
        }
    }

    pub async fn ref_count(&self, url: &str) -> usize {
        let state = self.state.lock().await;
        state.entries.get(url).map(|e| e.refs).unwrap_or(0)
    }

    fn start_cooldown(&self, state: &mut PoolState, url: &str) {
        let until = Instant::now() + self.config.backoff;
        state.cooldowns.insert(url.to_string(), until);
        warn!(
            "Broker at {} reported its connection limit, suppressing new connections for {}s",
            url,
            self.config.backoff.as_secs()
        );
    }

    fn cooldown_remaining(state: &mut PoolState, url: &str) -> Option<Duration> {
        let until = *state.cooldowns.get(url)?;
        let now = Instant::now();
        if now >= until {
            state.cooldowns.remove(url);
            info!("Connection backoff for {} expired", url);
            None
        } else {
            Some(until - now)
        }
    }
}
