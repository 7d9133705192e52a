//! Partitioned-log bus adapter over Kafka
//!
//! Offsets are committed by the client's auto-commit, so [`MessageBus::ack`]
//! is a no-op here. A record whose handler fails or panics is logged and not
//! redelivered unless the process dies before the next commit.

use async_trait::async_trait;
use futures::FutureExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::adapter::{
    BusMetrics, BusMetricsSnapshot, Delivery, MessageBus, MessageHandler, SubscriptionHandle,
};
use super::envelope::Envelope;
use super::error::{BusError, BusResult};

#[derive(Debug, Clone)]
pub struct KafkaBusConfig {
    pub brokers: String,
    pub group: String,
    pub send_timeout: Duration,
    pub transient_retry: Duration,
}

pub struct KafkaBus {
    config: KafkaBusConfig,
    producer: FutureProducer,
    metrics: Arc<BusMetrics>,
    subscriptions: Mutex<HashMap<String, (SubscriptionHandle, JoinHandle<()>)>>,
    closed: AtomicBool,
}

fn kafka_error(topic: &str, err: KafkaError) -> BusError {
    BusError::transient(topic, err)
}

impl KafkaBus {
    pub fn new(config: KafkaBusConfig) -> BusResult<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", config.send_timeout.as_millis().to_string())
            .create()
            .map_err(|e| BusError::ConnectionRefused {
                url: config.brokers.clone(),
                reason: e.to_string(),
            })?;

        let metrics = Arc::new(BusMetrics::default());
        BusMetrics::incr(&metrics.connections_created);
        info!("Kafka producer created for {}", config.brokers);

        Ok(Self {
            config,
            producer,
            metrics,
            subscriptions: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    fn consumer(&self, topic: &str) -> BusResult<StreamConsumer> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.config.brokers)
            .set("group.id", &self.config.group)
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(|e| BusError::ConnectionRefused {
                url: self.config.brokers.clone(),
                reason: e.to_string(),
            })?;

        consumer
            .subscribe(&[topic])
            .map_err(|e| kafka_error(topic, e))?;
        BusMetrics::incr(&self.metrics.connections_created);
        Ok(consumer)
    }
}

/// `topic-partition-offset`, unique within a cluster
fn record_id(topic: &str, partition: i32, offset: i64) -> String {
    format!("{}-{}-{}", topic, partition, offset)
}

/// Parse a record's payload, counting and skipping what cannot be read
fn decode_record(
    topic: &str,
    message_id: String,
    payload: Option<&[u8]>,
    metrics: &BusMetrics,
) -> Option<Delivery> {
    let envelope = match payload.map(Envelope::from_bytes) {
        Some(Ok(envelope)) => envelope,
        Some(Err(e)) => {
            BusMetrics::incr(&metrics.malformed_messages);
            warn!("Skipping malformed record {}: {}", message_id, e);
            return None;
        }
        None => {
            BusMetrics::incr(&metrics.malformed_messages);
            warn!("Skipping record {} without payload", message_id);
            return None;
        }
    };

    Some(Delivery {
        message_id,
        topic: topic.to_string(),
        envelope,
        redelivered: false,
    })
}

/// Run the handler on one record. Returns false when it failed or panicked.
async fn deliver(handler: &dyn MessageHandler, delivery: &Delivery, metrics: &BusMetrics) -> bool {
    match AssertUnwindSafe(handler.handle(delivery)).catch_unwind().await {
        Ok(Ok(())) => {
            BusMetrics::incr(&metrics.messages_processed);
            true
        }
        Ok(Err(e)) => {
            BusMetrics::incr(&metrics.messages_failed);
            warn!("Handler failed for {}: {:#}", delivery.message_id, e);
            false
        }
        Err(_) => {
            BusMetrics::incr(&metrics.messages_failed);
            error!("Handler panicked on {}", delivery.message_id);
            false
        }
    }
}

async fn consume(
    consumer: StreamConsumer,
    topic: String,
    handler: Arc<dyn MessageHandler>,
    metrics: Arc<BusMetrics>,
    retry: Duration,
    mut stop_rx: watch::Receiver<bool>,
) {
    info!("Kafka consumer started for {}", topic);

    loop {
        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
            received = consumer.recv() => {
                let message = match received {
                    Ok(message) => message,
                    Err(e) => {
                        BusMetrics::incr(&metrics.transient_errors);
                        warn!("Kafka receive error on {}: {}", topic, e);
                        tokio::time::sleep(retry).await;
                        continue;
                    }
                };

                let message_id =
                    record_id(message.topic(), message.partition(), message.offset());
                let delivery = decode_record(&topic, message_id, message.payload(), &metrics);
                drop(message);

                if let Some(delivery) = delivery {
                    deliver(handler.as_ref(), &delivery, &metrics).await;
                }
            }
        }
    }

    BusMetrics::incr(&metrics.connections_closed);
    info!("Kafka consumer stopped for {}", topic);
}

#[async_trait]
impl MessageBus for KafkaBus {
    async fn publish(&self, topic: &str, message: &Envelope) -> BusResult<String> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }

        let payload = message.to_bytes(topic)?;
        let record = FutureRecord::<(), [u8]>::to(topic).payload(payload.as_slice());

        match self
            .producer
            .send(record, Timeout::After(self.config.send_timeout))
            .await
        {
            Ok((partition, offset)) => {
                BusMetrics::incr(&self.metrics.messages_published);
                let id = record_id(topic, partition, offset);
                debug!("Published {}", id);
                Ok(id)
            }
            Err((e, _)) => {
                error!("Failed to publish to {}: {}", topic, e);
                Err(kafka_error(topic, e))
            }
        }
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> BusResult<SubscriptionHandle> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }

        let consumer = self.consumer(topic)?;
        let (handle, stop_rx) = SubscriptionHandle::new(topic);
        let join = tokio::spawn(consume(
            consumer,
            topic.to_string(),
            handler,
            Arc::clone(&self.metrics),
            self.config.transient_retry,
            stop_rx,
        ));

        self.subscriptions
            .lock()
            .await
            .insert(handle.id().to_string(), (handle.clone(), join));

        info!("Subscribed to Kafka topic {} as {}", topic, handle.id());
        Ok(handle)
    }

    /// Offsets are auto-committed; nothing to do
    async fn ack(&self, _handle: &SubscriptionHandle, _message_id: &str) -> BusResult<()> {
        Ok(())
    }

    async fn close(&self) -> BusResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let subscriptions: Vec<_> = self
            .subscriptions
            .lock()
            .await
            .drain()
            .map(|(_, sub)| sub)
            .collect();

        for (handle, join) in subscriptions {
            handle.unsubscribe();
            if let Err(e) = join.await {
                error!("Kafka consumer for {} panicked: {}", handle.topic(), e);
            }
        }

        BusMetrics::incr(&self.metrics.connections_closed);
        Ok(())
    }

    fn metrics(&self) -> BusMetricsSnapshot {
        self.metrics.snapshot()
    }

    fn name(&self) -> &str {
        "kafka"
    }
}
