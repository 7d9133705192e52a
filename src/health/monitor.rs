use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::HealthSettings;
use crate::provider::SpeechProvider;

#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    pub heartbeat_interval: Duration,
    pub sweep_interval: Duration,
    /// A heartbeat older than this marks the connection unhealthy
    pub heartbeat_timeout: Duration,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self::from(&HealthSettings::default())
    }
}

impl From<&HealthSettings> for HealthMonitorConfig {
    fn from(settings: &HealthSettings) -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(settings.heartbeat_interval_secs),
            sweep_interval: Duration::from_secs(settings.sweep_interval_secs),
            heartbeat_timeout: Duration::from_secs(settings.heartbeat_timeout_secs),
        }
    }
}

/// Public view of one tracked connection
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionHealth {
    pub interaction_id: String,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub reconnect_attempts: u32,
    pub is_healthy: bool,
    pub heartbeat_enabled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    /// Detail for unhealthy connections only
    pub unhealthy_connections: Vec<ConnectionHealth>,
}

struct Record {
    view: ConnectionHealth,
    last_seen: Instant,
    /// Kept so heartbeats can resume after a stop/start cycle
    provider: Option<Arc<dyn SpeechProvider>>,
    heartbeat: Option<JoinHandle<()>>,
}

type Records = Arc<Mutex<HashMap<String, Record>>>;

fn lock(records: &Records) -> MutexGuard<'_, HashMap<String, Record>> {
    records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Tracks liveness of call-scoped provider connections
pub struct ConnectionHealthMonitor {
    config: HealthMonitorConfig,
    records: Records,
    sweeper: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl ConnectionHealthMonitor {
    pub fn new(config: HealthMonitorConfig) -> Self {
        Self {
            config,
            records: Arc::new(Mutex::new(HashMap::new())),
            sweeper: Mutex::new(None),
        }
    }

    /// Start tracking a call. Re-registering an id keeps the existing record.
    pub fn register(&self, interaction_id: &str, provider: Option<Arc<dyn SpeechProvider>>) {
        let mut records = lock(&self.records);
        if records.contains_key(interaction_id) {
            return;
        }

        let provider = provider.filter(|p| p.supports_heartbeat());
        let heartbeat_enabled = provider.is_some();
        let heartbeat = provider
            .as_ref()
            .map(|provider| self.spawn_heartbeat(interaction_id, Arc::clone(provider)));

        records.insert(
            interaction_id.to_string(),
            Record {
                view: ConnectionHealth {
                    interaction_id: interaction_id.to_string(),
                    connected_at: Utc::now(),
                    last_heartbeat_at: None,
                    reconnect_attempts: 0,
                    is_healthy: true,
                    heartbeat_enabled,
                },
                last_seen: Instant::now(),
                provider,
                heartbeat,
            },
        );

        debug!(
            "Tracking connection health for {} (heartbeat={})",
            interaction_id, heartbeat_enabled
        );
    }

    fn spawn_heartbeat(
        &self,
        interaction_id: &str,
        provider: Arc<dyn SpeechProvider>,
    ) -> JoinHandle<()> {
        tokio::spawn(heartbeat_loop(
            Arc::clone(&self.records),
            provider,
            interaction_id.to_string(),
            self.config.heartbeat_interval,
        ))
    }

    pub fn record_heartbeat(&self, interaction_id: &str) {
        mark_alive(&self.records, interaction_id);
    }

    /// Count one more attempt to re-establish the call's provider link.
    /// Every heartbeat after a failed one counts.
    pub fn record_reconnect_attempt(&self, interaction_id: &str) {
        note_reconnect_attempt(&self.records, interaction_id);
    }

    /// Stop tracking a call and cancel its heartbeat
    pub fn untrack(&self, interaction_id: &str) {
        if let Some(record) = lock(&self.records).remove(interaction_id) {
            if let Some(heartbeat) = record.heartbeat {
                heartbeat.abort();
            }
            debug!("Stopped tracking connection health for {}", interaction_id);
        }
    }

    pub fn is_tracked(&self, interaction_id: &str) -> bool {
        lock(&self.records).contains_key(interaction_id)
    }

    pub fn get(&self, interaction_id: &str) -> Option<ConnectionHealth> {
        lock(&self.records)
            .get(interaction_id)
            .map(|record| record.view.clone())
    }

    /// Flag heartbeat-enabled connections whose last response is overdue.
    /// Returns how many connections became unhealthy in this pass.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut newly_unhealthy = 0;

        for record in lock(&self.records).values_mut() {
            if !record.view.heartbeat_enabled || !record.view.is_healthy {
                continue;
            }
            let silent_for = now.duration_since(record.last_seen);
            if silent_for > self.config.heartbeat_timeout {
                record.view.is_healthy = false;
                newly_unhealthy += 1;
                warn!(
                    "Connection for {} unhealthy: no heartbeat for {:?}",
                    record.view.interaction_id, silent_for
                );
            }
        }

        newly_unhealthy
    }

    pub fn summary(&self) -> HealthSummary {
        let records = lock(&self.records);
        let mut unhealthy_connections: Vec<ConnectionHealth> = records
            .values()
            .filter(|r| !r.view.is_healthy)
            .map(|r| r.view.clone())
            .collect();
        unhealthy_connections.sort_by(|a, b| a.interaction_id.cmp(&b.interaction_id));

        HealthSummary {
            total: records.len(),
            healthy: records.len() - unhealthy_connections.len(),
            unhealthy: unhealthy_connections.len(),
            unhealthy_connections,
        }
    }

    /// Start the periodic sweep and resume heartbeats stopped by
    /// [`stop`](Self::stop); a second call is a no-op
    pub fn start(self: &Arc<Self>) {
        let mut sweeper = self.sweeper.lock().unwrap_or_else(|p| p.into_inner());
        if sweeper.is_some() {
            return;
        }

        let mut resumed = 0;
        for (id, record) in lock(&self.records).iter_mut() {
            if record.heartbeat.is_some() {
                continue;
            }
            if let Some(provider) = &record.provider {
                record.last_seen = Instant::now();
                record.heartbeat = Some(self.spawn_heartbeat(id, Arc::clone(provider)));
                resumed += 1;
            }
        }
        if resumed > 0 {
            debug!("Resumed {} heartbeats", resumed);
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let monitor = Arc::clone(self);
        let period = self.config.sweep_interval;

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        monitor.sweep();
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Health sweep stopped");
        });

        *sweeper = Some((stop_tx, join));
        info!("Connection health monitor started (sweep every {:?})", period);
    }

    /// Stop the sweep and every heartbeat task
    pub async fn stop(&self) {
        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some((stop_tx, join)) = sweeper {
            let _ = stop_tx.send(true);
            let _ = join.await;
        }

        for record in lock(&self.records).values_mut() {
            if let Some(heartbeat) = record.heartbeat.take() {
                heartbeat.abort();
            }
        }
    }
}

fn mark_alive(records: &Records, interaction_id: &str) {
    if let Some(record) = lock(records).get_mut(interaction_id) {
        record.last_seen = Instant::now();
        record.view.last_heartbeat_at = Some(Utc::now());
        if !record.view.is_healthy {
            info!("Connection for {} healthy again", interaction_id);
        }
        record.view.is_healthy = true;
    }
}

fn note_reconnect_attempt(records: &Records, interaction_id: &str) {
    if let Some(record) = lock(records).get_mut(interaction_id) {
        record.view.reconnect_attempts += 1;
    }
}

async fn heartbeat_loop(
    records: Records,
    provider: Arc<dyn SpeechProvider>,
    interaction_id: String,
    period: Duration,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    loop {
        ticker.tick().await;
        if !lock(&records).contains_key(&interaction_id) {
            break;
        }
        match provider.heartbeat(&interaction_id).await {
            Ok(()) => mark_alive(&records, &interaction_id),
            Err(e) => {
                note_reconnect_attempt(&records, &interaction_id);
                warn!("Heartbeat for {} failed: {:#}", interaction_id, e);
            }
        }
    }
}
