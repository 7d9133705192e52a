use anyhow::{Context, Result};
use clap::Parser;
use loqa_callstream::bus::redis::RedisConnector;
use loqa_callstream::bus::{create_bus, ConnectionPool, PoolConfig};
use loqa_callstream::config::{BusBackend, Config, SinkKind};
use loqa_callstream::health::{ConnectionHealthMonitor, HealthMonitorConfig};
use loqa_callstream::nats::{NatsClient, NatsSpeechProvider, NatsTranscriptSink};
use loqa_callstream::resilience::{CircuitBreaker, CircuitBreakerConfig, RetryPolicy};
use loqa_callstream::sink::{BusTranscriptSink, TranscriptSink};
use loqa_callstream::{create_router, AppState, AudioWorker, SpeechProvider, WorkerConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "loqa-callstream", version, about = "Call audio buffering worker")]
struct Args {
    /// Config file path (extension optional)
    #[arg(short, long, default_value = "config/loqa-callstream")]
    config: String,

    /// Override the configured bus backend
    #[arg(long, value_enum)]
    backend: Option<BusBackend>,

    /// Validate configuration and exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "loqa_callstream=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();

    let mut cfg = Config::load(&args.config)?;
    if let Some(backend) = args.backend {
        cfg.bus.backend = backend;
    }
    cfg.validate().context("Invalid configuration")?;

    info!("Loqa Callstream v{}", env!("CARGO_PKG_VERSION"));
    info!("Loaded config: {}", cfg.service.name);

    if args.check_config {
        println!("{}", serde_json::to_string_pretty(&cfg)?);
        info!("Configuration OK");
        return Ok(());
    }

    let pool = Arc::new(ConnectionPool::new(
        Arc::new(RedisConnector),
        PoolConfig {
            max_entries: cfg.bus.pool_max_entries,
            backoff: Duration::from_secs(cfg.bus.backoff_secs),
        },
    ));
    let bus = create_bus(&cfg.bus, pool)?;
    info!("Message bus backend: {}", bus.name());

    let provider_client = NatsClient::connect(&cfg.provider.nats_url).await?;
    let provider: Arc<dyn SpeechProvider> = Arc::new(NatsSpeechProvider::new(
        provider_client.clone(),
        &cfg.provider.subject,
        Duration::from_millis(cfg.provider.timeout_ms),
    ));

    let retry = RetryPolicy::new(
        cfg.sink.max_retries,
        Duration::from_millis(cfg.sink.retry_delay_ms),
    );
    let sink: Arc<dyn TranscriptSink> = match cfg.sink.kind {
        SinkKind::Nats => {
            let client = if cfg.sink.nats_url == cfg.provider.nats_url {
                provider_client.clone()
            } else {
                NatsClient::connect(&cfg.sink.nats_url).await?
            };
            Arc::new(NatsTranscriptSink::new(client, retry))
        }
        SinkKind::Bus => Arc::new(BusTranscriptSink::new(
            Arc::clone(&bus),
            &cfg.bus.transcript_topic,
            retry,
        )),
    };
    info!("Transcript sink: {}", sink.name());

    let breaker = Arc::new(CircuitBreaker::new(
        "speech-provider",
        CircuitBreakerConfig::from(&cfg.breaker),
    ));
    let health = Arc::new(ConnectionHealthMonitor::new(HealthMonitorConfig::from(
        &cfg.health,
    )));

    let worker = Arc::new(AudioWorker::new(
        WorkerConfig::from_settings(&cfg.service.name, &cfg.bus, &cfg.worker),
        Arc::clone(&bus),
        Arc::clone(&provider),
        sink,
        breaker,
        health,
    ));
    worker.start().await?;

    let addr = format!("{}:{}", cfg.service.http.bind, cfg.service.http.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind HTTP server to {}", addr))?;
    info!("HTTP status server listening on {}", addr);

    let app = create_router(AppState::new(Arc::clone(&worker)));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    info!("Shutting down");
    worker.stop().await;
    if let Err(e) = bus.close().await {
        error!("Failed to close message bus: {}", e);
    }
    if let Err(e) = provider.close().await {
        error!("Failed to close speech provider: {:#}", e);
    }

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
}
