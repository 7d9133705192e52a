use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

use super::envelope::Envelope;
use super::error::BusResult;

/// A message handed to a subscriber
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Backend-specific message id (stream entry id, topic-partition-offset, ...)
    pub message_id: String,
    pub topic: String,
    pub envelope: Envelope,
    /// True when the message was reclaimed from a previous consumer
    pub redelivered: bool,
}

/// Per-message callback registered with [`MessageBus::subscribe`]
///
/// Returning `Ok` lets the adapter acknowledge the message. Returning `Err`
/// leaves it unacknowledged so the broker redelivers it.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> anyhow::Result<()>;
}

/// Adapts an async closure into a [`MessageHandler`]
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(Delivery) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync,
{
    async fn handle(&self, delivery: &Delivery) -> anyhow::Result<()> {
        (self.0)(delivery.clone()).await
    }
}

/// Handle returned by [`MessageBus::subscribe`]
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    id: String,
    topic: String,
    stop_tx: Arc<watch::Sender<bool>>,
    active: Arc<AtomicBool>,
}

impl SubscriptionHandle {
    pub fn new(topic: &str) -> (Self, watch::Receiver<bool>) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = Self {
            id: format!("sub-{}", uuid::Uuid::new_v4()),
            topic: topic.to_string(),
            stop_tx: Arc::new(stop_tx),
            active: Arc::new(AtomicBool::new(true)),
        };
        (handle, stop_rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Ask the read loop to stop after its in-flight read completes
    pub fn unsubscribe(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            let _ = self.stop_tx.send(true);
        }
    }
}

/// Broker-agnostic publish/subscribe contract
///
/// Delivery is at-least-once. Within one subscription, messages are handled
/// one at a time in delivery order.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Serialize and append a message to `topic`, returning its id
    async fn publish(&self, topic: &str, message: &Envelope) -> BusResult<String>;

    /// Join the configured consumer group on `topic`
    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> BusResult<SubscriptionHandle>;

    /// Mark a message as processed. Acking twice or acking an unknown id is a no-op.
    async fn ack(&self, handle: &SubscriptionHandle, message_id: &str) -> BusResult<()>;

    /// Stop every subscription and release connections
    async fn close(&self) -> BusResult<()>;

    fn metrics(&self) -> BusMetricsSnapshot;

    /// Backend name for logging
    fn name(&self) -> &str;
}

/// Counters shared by the adapter, its read loops and its connection pool
#[derive(Debug, Default)]
pub struct BusMetrics {
    pub connections_created: AtomicU64,
    pub connections_reused: AtomicU64,
    pub connections_closed: AtomicU64,
    pub connections_invalidated: AtomicU64,
    pub messages_published: AtomicU64,
    pub messages_processed: AtomicU64,
    pub messages_failed: AtomicU64,
    pub messages_acked: AtomicU64,
    pub messages_reclaimed: AtomicU64,
    pub malformed_messages: AtomicU64,
    pub backoff_rejections: AtomicU64,
    pub transient_errors: AtomicU64,
}

impl BusMetrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BusMetricsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        BusMetricsSnapshot {
            connections_created: get(&self.connections_created),
            connections_reused: get(&self.connections_reused),
            connections_closed: get(&self.connections_closed),
            connections_invalidated: get(&self.connections_invalidated),
            messages_published: get(&self.messages_published),
            messages_processed: get(&self.messages_processed),
            messages_failed: get(&self.messages_failed),
            messages_acked: get(&self.messages_acked),
            messages_reclaimed: get(&self.messages_reclaimed),
            malformed_messages: get(&self.malformed_messages),
            backoff_rejections: get(&self.backoff_rejections),
            transient_errors: get(&self.transient_errors),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BusMetricsSnapshot {
    pub connections_created: u64,
    pub connections_reused: u64,
    pub connections_closed: u64,
    pub connections_invalidated: u64,
    pub messages_published: u64,
    pub messages_processed: u64,
    pub messages_failed: u64,
    pub messages_acked: u64,
    pub messages_reclaimed: u64,
    pub malformed_messages: u64,
    pub backoff_rejections: u64,
    pub transient_errors: u64,
}
