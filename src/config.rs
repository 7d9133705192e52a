use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Environment variable prefix, e.g. `CALLSTREAM_BUS__URL`
pub const ENV_PREFIX: &str = "CALLSTREAM";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required setting: {key}")]
    Missing { key: String },

    #[error("Invalid value for {key}: {message}")]
    Invalid { key: String, message: String },

    #[error("Bus backend {backend} is not compiled into this build (enable the `{feature}` feature)")]
    BackendUnavailable { backend: String, feature: String },
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub bus: BusConfig,
    pub worker: WorkerSettings,
    pub breaker: BreakerSettings,
    pub health: HealthSettings,
    pub provider: ProviderSettings,
    pub sink: SinkSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub http: HttpConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "loqa-callstream".to_string(),
            http: HttpConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8090,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BusBackend {
    Redis,
    Kafka,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BusConfig {
    pub backend: BusBackend,
    /// Broker URL (`redis://host:6379`) or Kafka bootstrap servers
    pub url: String,
    pub consumer_group: String,
    /// Defaults to a random per-process name
    pub consumer_name: Option<String>,
    pub audio_topic: String,
    pub call_end_topic: String,
    pub transcript_topic: String,
    pub max_len: usize,
    pub block_ms: u64,
    pub read_count: usize,
    /// Pending entries idle this long are reclaimed by any consumer
    pub claim_min_idle_ms: u64,
    /// How often a read loop looks for reclaimable pending entries
    pub reclaim_interval_ms: u64,
    pub backoff_secs: u64,
    pub transient_retry_ms: u64,
    pub pool_max_entries: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backend: BusBackend::Redis,
            url: String::new(),
            consumer_group: "callstream-workers".to_string(),
            consumer_name: None,
            audio_topic: "audio.frames".to_string(),
            call_end_topic: "call.end".to_string(),
            transcript_topic: "transcripts".to_string(),
            max_len: 1000,
            block_ms: 500,
            read_count: 50,
            claim_min_idle_ms: 30_000,
            reclaim_interval_ms: 10_000,
            backoff_secs: 60,
            transient_retry_ms: 1000,
            pool_max_entries: 16,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub min_flush_ms: u64,
    pub max_flush_ms: u64,
    pub stale_timeout_ms: u64,
    pub grace_period_ms: u64,
    pub sweep_interval_ms: u64,
    pub ended_retention_ms: u64,
    pub provider_timeout_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            min_flush_ms: 100,
            max_flush_ms: 1000,
            stale_timeout_ms: 5000,
            grace_period_ms: 10_000,
            sweep_interval_ms: 2000,
            ended_retention_ms: 60_000,
            provider_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub open_timeout_ms: u64,
    pub reset_timeout_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout_ms: 60_000,
            reset_timeout_ms: 120_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthSettings {
    pub heartbeat_interval_secs: u64,
    pub sweep_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 15,
            sweep_interval_secs: 30,
            heartbeat_timeout_secs: 45,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub nats_url: String,
    /// Request subject of the speech-recognition service
    pub subject: String,
    pub timeout_ms: u64,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            nats_url: "nats://localhost:4222".to_string(),
            subject: "stt.request".to_string(),
            timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Nats,
    Bus,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SinkSettings {
    pub kind: SinkKind,
    pub nats_url: String,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            kind: SinkKind::Nats,
            nats_url: "nats://localhost:4222".to_string(),
            max_retries: 3,
            retry_delay_ms: 200,
        }
    }
}

impl Config {
    /// Load from an optional config file, then `CALLSTREAM_*` environment overrides
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(contents, config::FileFormat::Toml))
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Reject settings the service cannot start with
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        require("bus.url", &self.bus.url)?;
        require("bus.consumer_group", &self.bus.consumer_group)?;
        require("bus.audio_topic", &self.bus.audio_topic)?;
        require("bus.call_end_topic", &self.bus.call_end_topic)?;

        if self.bus.pool_max_entries == 0 {
            return Err(invalid("bus.pool_max_entries", "must be at least 1"));
        }
        if self.bus.read_count == 0 {
            return Err(invalid("bus.read_count", "must be at least 1"));
        }
        if self.bus.reclaim_interval_ms == 0 {
            return Err(invalid("bus.reclaim_interval_ms", "must be greater than 0"));
        }

        let w = &self.worker;
        if w.min_flush_ms == 0 {
            return Err(invalid("worker.min_flush_ms", "must be greater than 0"));
        }
        if w.min_flush_ms > w.max_flush_ms {
            return Err(invalid(
                "worker.max_flush_ms",
                &format!(
                    "must be at least min_flush_ms ({} > {})",
                    w.min_flush_ms, w.max_flush_ms
                ),
            ));
        }
        if w.sweep_interval_ms == 0 {
            return Err(invalid("worker.sweep_interval_ms", "must be greater than 0"));
        }

        if self.breaker.failure_threshold == 0 {
            return Err(invalid("breaker.failure_threshold", "must be at least 1"));
        }

        let h = &self.health;
        if h.heartbeat_interval_secs == 0 || h.sweep_interval_secs == 0 {
            return Err(invalid("health", "intervals must be greater than 0"));
        }
        if h.heartbeat_timeout_secs <= h.heartbeat_interval_secs {
            return Err(invalid(
                "health.heartbeat_timeout_secs",
                "must be longer than heartbeat_interval_secs",
            ));
        }

        if self.sink.kind == SinkKind::Bus {
            require("bus.transcript_topic", &self.bus.transcript_topic)?;
        }

        Ok(())
    }
}

impl WorkerSettings {
    pub fn min_flush(&self) -> Duration {
        Duration::from_millis(self.min_flush_ms)
    }

    pub fn max_flush(&self) -> Duration {
        Duration::from_millis(self.max_flush_ms)
    }
}

fn require(key: &str, value: &str) -> std::result::Result<(), ConfigError> {
    if value.trim().is_empty() {
        Err(ConfigError::Missing {
            key: key.to_string(),
        })
    } else {
        Ok(())
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        message: message.to_string(),
    }
}
