use async_trait::async_trait;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::bus::adapter::{
    BusMetrics, BusMetricsSnapshot, Delivery, MessageBus, MessageHandler, SubscriptionHandle,
};
use crate::bus::envelope::Envelope;
use crate::bus::error::{BusError, BusResult};
use crate::bus::pool::{ConnectionPool, PoolLease};
use crate::bus::stream::{GroupStatus, StreamEntry, StreamError};

/// Stream field holding the serialized envelope
pub const DATA_FIELD: &str = "data";

/// Settings for one [`RedisStreamBus`] instance
#[derive(Debug, Clone)]
pub struct StreamBusConfig {
    pub url: String,
    pub group: String,
    pub consumer: String,
    /// Approximate number of entries kept per stream
    pub max_len: usize,
    /// Long-poll interval for live reads
    pub block: Duration,
    pub read_count: usize,
    /// Minimum idle time before a pending entry is reclaimed and replayed
    pub claim_min_idle: Duration,
    /// Interval between reclaim passes in each read loop
    pub reclaim_interval: Duration,
    /// Delay before the read loop retries after a broker error
    pub transient_retry: Duration,
    /// Where a newly created group starts reading
    pub group_start_id: String,
}

impl StreamBusConfig {
    pub fn new(url: &str, group: &str) -> Self {
        Self {
            url: url.to_string(),
            group: group.to_string(),
            consumer: format!("consumer-{}", uuid::Uuid::new_v4()),
            max_len: 1000,
            block: Duration::from_millis(500),
            read_count: 50,
            claim_min_idle: Duration::from_secs(30),
            reclaim_interval: Duration::from_secs(10),
            transient_retry: Duration::from_secs(1),
            group_start_id: "0".to_string(),
        }
    }
}

struct SubscriptionTask {
    handle: SubscriptionHandle,
    join: JoinHandle<()>,
}

struct Inner {
    config: StreamBusConfig,
    pool: Arc<ConnectionPool>,
    lease: Mutex<Option<PoolLease>>,
    metrics: BusMetrics,
    subscriptions: Mutex<HashMap<String, SubscriptionTask>>,
    closed: AtomicBool,
}

/// Message bus over Redis Streams consumer groups
///
/// All subscriptions of one instance read as the same consumer within the
/// configured group. Publishes, acks and pending-entry reclaims share one
/// connection leased lazily from the [`ConnectionPool`]. Each subscription's
/// blocking reads run on a dedicated connection of their own, so a parked
/// `XREADGROUP` never holds up an ack. Every lease is returned on
/// [`MessageBus::close`].
pub struct RedisStreamBus {
    inner: Arc<Inner>,
}

impl RedisStreamBus {
    pub fn new(config: StreamBusConfig, pool: Arc<ConnectionPool>) -> Self {
        info!(
            "Redis stream bus configured: {} (group={}, consumer={})",
            config.url, config.group, config.consumer
        );

        Self {
            inner: Arc::new(Inner {
                config,
                pool,
                lease: Mutex::new(None),
                metrics: BusMetrics::default(),
                subscriptions: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn consumer_name(&self) -> &str {
        &self.inner.config.consumer
    }

    /// Create the consumer group for `topic` if it does not exist yet
    pub async fn ensure_group(&self, topic: &str) -> BusResult<GroupStatus> {
        self.inner.ensure_group(topic).await
    }
}

impl Inner {
    fn check_open(&self) -> BusResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BusError::Closed)
        } else {
            Ok(())
        }
    }

    /// Fail fast while the pool is backing off this broker
    async fn check_backoff(&self) -> BusResult<()> {
        match self.pool.backoff_remaining(&self.config.url).await {
            Some(remaining) => {
                self.pool.note_backoff_rejection();
                Err(BusError::BackoffActive {
                    url: self.config.url.clone(),
                    retry_in_secs: remaining.as_secs_f64().ceil() as u64,
                })
            }
            None => Ok(()),
        }
    }

    async fn lease(&self) -> BusResult<PoolLease> {
        let mut guard = self.lease.lock().await;
        if let Some(lease) = guard.as_ref() {
            return Ok(lease.clone());
        }

        let lease = self.pool.acquire(&self.config.url).await?;
        *guard = Some(lease.clone());
        Ok(lease)
    }

    /// Apply the recovery policy for a broker error and convert it
    async fn on_stream_error(&self, lease: &PoolLease, topic: &str, err: StreamError) -> BusError {
        match err {
            StreamError::ConnectionRefused(reason) => {
                self.pool.invalidate(lease).await;
                let mut guard = self.lease.lock().await;
                let same = guard
                    .as_ref()
                    .map(|held| Arc::ptr_eq(&held.client, &lease.client))
                    .unwrap_or(false);
                if same {
                    *guard = None;
                }
                BusError::ConnectionRefused {
                    url: self.config.url.clone(),
                    reason,
                }
            }
            StreamError::ResourceExhausted(reason) => {
                self.pool.record_exhaustion(&self.config.url).await;
                BusError::ResourceExhausted {
                    url: self.config.url.clone(),
                    reason,
                }
            }
            StreamError::Other(reason) => {
                BusMetrics::incr(&self.metrics.transient_errors);
                BusError::transient(topic, reason)
            }
        }
    }

    async fn ensure_group(&self, topic: &str) -> BusResult<GroupStatus> {
        let lease = self.lease().await?;
        match lease
            .client
            .create_group(topic, &self.config.group, &self.config.group_start_id)
            .await
        {
            Ok(status) => Ok(status),
            Err(e) => Err(self.on_stream_error(&lease, topic, e).await),
        }
    }

    async fn ack_ids(&self, topic: &str, ids: &[String]) -> BusResult<u64> {
        let lease = self.lease().await?;
        match lease.client.ack(topic, &self.config.group, ids).await {
            Ok(acked) => {
                self.metrics
                    .messages_acked
                    .fetch_add(acked, Ordering::Relaxed);
                if (acked as usize) < ids.len() {
                    debug!(
                        "{} of {} ids on {} were already acknowledged or unknown",
                        ids.len() - acked as usize,
                        ids.len(),
                        topic
                    );
                }
                Ok(acked)
            }
            Err(e) => Err(self.on_stream_error(&lease, topic, e).await),
        }
    }

    /// Hand one entry to the handler and acknowledge it on success
    async fn dispatch(
        &self,
        topic: &str,
        handler: &dyn MessageHandler,
        entry: StreamEntry,
        redelivered: bool,
    ) {
        let envelope = match entry.field(DATA_FIELD).map(Envelope::from_bytes) {
            Some(Ok(envelope)) => envelope,
            Some(Err(e)) => {
                self.drop_malformed(topic, &entry.id, &format!("invalid envelope: {}", e))
                    .await;
                return;
            }
            None => {
                self.drop_malformed(topic, &entry.id, "missing data field").await;
                return;
            }
        };

        let delivery = Delivery {
            message_id: entry.id.clone(),
            topic: topic.to_string(),
            envelope,
            redelivered,
        };

        let outcome = AssertUnwindSafe(handler.handle(&delivery))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {
                BusMetrics::incr(&self.metrics.messages_processed);
                if let Err(e) = self.ack_ids(topic, &[entry.id.clone()]).await {
                    warn!("Failed to acknowledge {} on {}: {}", entry.id, topic, e);
                }
            }
            Ok(Err(e)) => {
                BusMetrics::incr(&self.metrics.messages_failed);
                warn!(
                    "Handler failed for {} on {}, leaving it unacknowledged: {:#}",
                    entry.id, topic, e
                );
            }
            Err(_) => {
                BusMetrics::incr(&self.metrics.messages_failed);
                error!(
                    "Handler panicked on {} from {}, leaving it unacknowledged",
                    entry.id, topic
                );
            }
        }
    }

    /// Log and acknowledge an entry that can never be parsed
    async fn drop_malformed(&self, topic: &str, id: &str, reason: &str) {
        BusMetrics::incr(&self.metrics.malformed_messages);
        warn!("Skipping malformed message {} on {}: {}", id, topic, reason);
        if let Err(e) = self.ack_ids(topic, &[id.to_string()]).await {
            warn!("Failed to acknowledge malformed message {}: {}", id, e);
        }
    }

    /// Reclaim and replay entries left unacknowledged for at least
    /// `claim_min_idle`, whichever consumer they were delivered to
    async fn recover_pending(&self, topic: &str, handler: &dyn MessageHandler) -> BusResult<usize> {
        let lease = self.lease().await?;
        let client = &lease.client;
        let group = &self.config.group;

        let pending = match client.pending(topic, group, self.config.max_len).await {
            Ok(pending) => pending,
            Err(e) => return Err(self.on_stream_error(&lease, topic, e).await),
        };

        let min_idle_ms = self.config.claim_min_idle.as_millis() as u64;
        let waiting = pending.len();
        let ids: Vec<String> = pending
            .into_iter()
            .filter(|p| p.idle_ms >= min_idle_ms)
            .map(|p| p.id)
            .collect();

        if ids.is_empty() {
            if waiting > 0 {
                debug!(
                    "{} pending messages on {} are not idle long enough to reclaim",
                    waiting, topic
                );
            }
            return Ok(0);
        }

        info!(
            "Found {} idle pending messages on {} for group {}, reclaiming",
            ids.len(),
            topic,
            group
        );

        let claimed = match client
            .claim(
                topic,
                group,
                &self.config.consumer,
                self.config.claim_min_idle,
                &ids,
            )
            .await
        {
            Ok(batch) => batch,
            Err(e) => return Err(self.on_stream_error(&lease, topic, e).await),
        };

        if claimed.skipped > 0 {
            self.metrics
                .malformed_messages
                .fetch_add(claimed.skipped as u64, Ordering::Relaxed);
            warn!(
                "Skipped {} unreadable pending entries on {}",
                claimed.skipped, topic
            );
        }

        let recovered = claimed.entries.len();
        for entry in claimed.entries {
            BusMetrics::incr(&self.metrics.messages_reclaimed);
            self.dispatch(topic, handler, entry, true).await;
        }

        info!("Replayed {} reclaimed messages on {}", recovered, topic);
        Ok(recovered)
    }

    async fn read_loop(
        self: Arc<Self>,
        topic: String,
        owner: String,
        handler: Arc<dyn MessageHandler>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        info!(
            "Read loop started for {} (group={}, consumer={})",
            topic, self.config.group, self.config.consumer
        );

        if let Err(e) = self.recover_pending(&topic, handler.as_ref()).await {
            warn!("Pending message recovery failed on {}: {}", topic, e);
        }
        let mut last_reclaim = Instant::now();

        let mut reader: Option<PoolLease> = None;
        let mut catching_up = true;

        loop {
            if *stop_rx.borrow() || self.closed.load(Ordering::SeqCst) {
                break;
            }

            // Entries that failed here or were stranded by a dead consumer
            if last_reclaim.elapsed() >= self.config.reclaim_interval {
                last_reclaim = Instant::now();
                if let Err(e) = self.recover_pending(&topic, handler.as_ref()).await {
                    warn!("Pending message reclaim failed on {}: {}", topic, e);
                }
            }

            if reader.is_none() {
                match self.pool.acquire_dedicated(&self.config.url, &owner).await {
                    Ok(lease) => reader = Some(lease),
                    Err(e) => {
                        warn!("Read loop for {} cannot get a connection: {}", topic, e);
                        let wait = e.retry_after().unwrap_or(self.config.transient_retry);
                        if Self::pause(&mut stop_rx, wait).await {
                            break;
                        }
                        continue;
                    }
                }
            }
            let Some(lease) = reader.clone() else {
                continue;
            };

            // One non-blocking pass over the backlog, then live tail reads
            let block = if catching_up {
                None
            } else {
                Some(self.config.block)
            };

            let result = lease
                .client
                .read_group(
                    &topic,
                    &self.config.group,
                    &self.config.consumer,
                    self.config.read_count,
                    block,
                )
                .await;

            match result {
                Ok(batch) => {
                    if catching_up {
                        catching_up = false;
                        debug!(
                            "Catch-up read on {} returned {} messages, switching to live reads",
                            topic,
                            batch.entries.len()
                        );
                    }

                    if batch.skipped > 0 {
                        self.metrics
                            .malformed_messages
                            .fetch_add(batch.skipped as u64, Ordering::Relaxed);
                        warn!("Skipped {} malformed entries on {}", batch.skipped, topic);
                    }

                    for entry in batch.entries {
                        self.dispatch(&topic, handler.as_ref(), entry, false).await;
                    }
                }
                Err(e) => {
                    let err = self.on_stream_error(&lease, &topic, e).await;
                    if matches!(err, BusError::ConnectionRefused { .. }) {
                        reader = None;
                    }
                    warn!("Read on {} failed, retrying: {}", topic, err);
                    if Self::pause(&mut stop_rx, self.config.transient_retry).await {
                        break;
                    }
                }
            }
        }

        if let Some(lease) = reader.take() {
            self.pool.release(lease).await;
        }
        info!("Read loop stopped for {}", topic);
    }

    /// Sleep unless stopped first. Returns true when the loop should exit.
    async fn pause(stop_rx: &mut watch::Receiver<bool>, wait: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(wait) => false,
            changed = stop_rx.changed() => changed.is_err() || *stop_rx.borrow(),
        }
    }
}

#[async_trait]
impl MessageBus for RedisStreamBus {
    async fn publish(&self, topic: &str, message: &Envelope) -> BusResult<String> {
        let inner = &self.inner;
        inner.check_open()?;
        inner.check_backoff().await?;

        let payload = message.to_bytes(topic)?;
        let lease = inner.lease().await?;

        match lease
            .client
            .append(topic, &[(DATA_FIELD, payload.as_slice())], inner.config.max_len)
            .await
        {
            Ok(id) => {
                BusMetrics::incr(&inner.metrics.messages_published);
                debug!("Published {} to {} ({} bytes)", id, topic, payload.len());
                Ok(id)
            }
            Err(e) => {
                let err = inner.on_stream_error(&lease, topic, e).await;
                error!("Failed to publish to {}: {}", topic, err);
                Err(err)
            }
        }
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> BusResult<SubscriptionHandle> {
        let inner = &self.inner;
        inner.check_open()?;
        inner.check_backoff().await?;

        match inner.ensure_group(topic).await? {
            GroupStatus::Created => {}
            GroupStatus::AlreadyExists => {
                debug!("Joining existing group {} on {}", inner.config.group, topic)
            }
        }

        let (handle, stop_rx) = SubscriptionHandle::new(topic);
        let join = tokio::spawn(Arc::clone(inner).read_loop(
            topic.to_string(),
            handle.id().to_string(),
            handler,
            stop_rx,
        ));

        inner.subscriptions.lock().await.insert(
            handle.id().to_string(),
            SubscriptionTask {
                handle: handle.clone(),
                join,
            },
        );

        info!("Subscribed to {} as {}", topic, handle.id());
        Ok(handle)
    }

    async fn ack(&self, handle: &SubscriptionHandle, message_id: &str) -> BusResult<()> {
        let known = self
            .inner
            .subscriptions
            .lock()
            .await
            .contains_key(handle.id());
        if !known {
            return Err(BusError::UnknownSubscription {
                id: handle.id().to_string(),
            });
        }

        self.inner
            .ack_ids(handle.topic(), &[message_id.to_string()])
            .await
            .map(|_| ())
    }

    async fn close(&self) -> BusResult<()> {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let tasks: Vec<SubscriptionTask> = inner
            .subscriptions
            .lock()
            .await
            .drain()
            .map(|(_, task)| task)
            .collect();

        info!("Closing Redis stream bus ({} subscriptions)", tasks.len());

        for task in tasks {
            task.handle.unsubscribe();
            if let Err(e) = task.join.await {
                error!("Read loop for {} panicked: {}", task.handle.topic(), e);
            }
        }

        if let Some(lease) = inner.lease.lock().await.take() {
            inner.pool.release(lease).await;
        }

        Ok(())
    }

    fn metrics(&self) -> BusMetricsSnapshot {
        let mut snapshot = self.inner.metrics.snapshot();
        let pool = self.inner.pool.stats();
        snapshot.connections_created = pool.created;
        snapshot.connections_reused = pool.reused;
        snapshot.connections_closed = pool.closed;
        snapshot.connections_invalidated = pool.invalidated;
        snapshot.backoff_rejections = pool.backoff_rejections;
        snapshot
    }

    fn name(&self) -> &str {
        "redis-streams"
    }
}
