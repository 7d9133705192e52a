use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use super::adapter::MessageBus;
use super::pool::ConnectionPool;
use super::redis::{RedisStreamBus, StreamBusConfig};
use crate::config::{BusBackend, BusConfig};

impl StreamBusConfig {
    pub fn from_settings(config: &BusConfig) -> Self {
        let mut settings = StreamBusConfig::new(&config.url, &config.consumer_group);
        if let Some(name) = &config.consumer_name {
            settings.consumer = name.clone();
        }
        settings.max_len = config.max_len;
        settings.block = Duration::from_millis(config.block_ms);
        settings.read_count = config.read_count;
        settings.claim_min_idle = Duration::from_millis(config.claim_min_idle_ms);
        settings.reclaim_interval = Duration::from_millis(config.reclaim_interval_ms);
        settings.transient_retry = Duration::from_millis(config.transient_retry_ms);
        settings
    }
}

/// Build the bus adapter selected by configuration
///
/// Only backends compiled into this binary can be selected; Kafka requires
/// the `kafka` cargo feature.
pub fn create_bus(config: &BusConfig, pool: Arc<ConnectionPool>) -> Result<Arc<dyn MessageBus>> {
    match config.backend {
        BusBackend::Redis => Ok(Arc::new(RedisStreamBus::new(
            StreamBusConfig::from_settings(config),
            pool,
        ))),

        BusBackend::Kafka => {
            #[cfg(feature = "kafka")]
            {
                use super::kafka::{KafkaBus, KafkaBusConfig};
                let bus = KafkaBus::new(KafkaBusConfig {
                    brokers: config.url.clone(),
                    group: config.consumer_group.clone(),
                    send_timeout: Duration::from_secs(5),
                    transient_retry: Duration::from_millis(config.transient_retry_ms),
                })?;
                Ok(Arc::new(bus))
            }

            #[cfg(not(feature = "kafka"))]
            {
                let _ = pool;
                Err(crate::config::ConfigError::BackendUnavailable {
                    backend: "kafka".to_string(),
                    feature: "kafka".to_string(),
                }
                .into())
            }
        }
    }
}
