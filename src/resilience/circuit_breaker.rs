use serde::Serialize;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::BreakerSettings;

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays open before one trial call is allowed
    pub open_timeout: Duration,
    /// Failures older than this no longer count towards the threshold
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(60),
            reset_timeout: Duration::from_secs(120),
        }
    }
}

impl From<&BreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &BreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold,
            open_timeout: Duration::from_millis(settings.open_timeout_ms),
            reset_timeout: Duration::from_millis(settings.reset_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Error, Debug)]
pub enum CircuitError<E> {
    #[error("Circuit breaker {name} is open, retry in {}ms", .retry_in.as_millis())]
    Open { name: String, retry_in: Duration },

    #[error("{0}")]
    Inner(E),
}

impl<E> CircuitError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitError::Open { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    /// Milliseconds since the last recorded failure
    pub since_last_failure_ms: Option<u64>,
    pub rejected_calls: u64,
    pub times_opened: u64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    rejected_calls: u64,
    times_opened: u64,
}

/// Guards calls to a flaky dependency
///
/// `closed` passes calls through; `open` rejects them without touching the
/// dependency; after `open_timeout` exactly one trial call runs in
/// `half_open` and its outcome closes or re-opens the circuit.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Permit {
    Normal,
    Trial,
}

/// Re-opens the circuit if a trial call is dropped before it finishes
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.breaker.lock();
            state.trial_in_flight = false;
            state.state = CircuitState::Open;
            state.opened_at = Some(Instant::now());
            warn!("Trial call through {} was cancelled, circuit re-opened", self.breaker.name);
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: &str, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_at: None,
                opened_at: None,
                trial_in_flight: false,
                rejected_calls: 0,
                times_opened: 0,
            }),
        }
    }

    /// Run `f` unless the circuit is open
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.acquire::<E>()?;
        let mut guard = TrialGuard {
            breaker: self,
            armed: permit == Permit::Trial,
        };

        let result = f().await;
        guard.armed = false;

        match &result {
            Ok(_) => self.on_success(),
            Err(_) => self.on_failure(),
        }

        result.map_err(CircuitError::Inner)
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn get_stats(&self) -> BreakerStats {
        let state = self.lock();
        BreakerStats {
            name: self.name.clone(),
            state: state.state,
            failure_count: state.failure_count,
            since_last_failure_ms: state
                .last_failure_at
                .map(|at| at.elapsed().as_millis() as u64),
            rejected_calls: state.rejected_calls,
            times_opened: state.times_opened,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn acquire<E>(&self) -> Result<Permit, CircuitError<E>> {
        let mut state = self.lock();
        let now = Instant::now();

        if state.state == CircuitState::Closed && state.failure_count > 0 {
            if let Some(last) = state.last_failure_at {
                if now.duration_since(last) >= self.config.reset_timeout {
                    state.failure_count = 0;
                }
            }
        }

        match state.state {
            CircuitState::Closed => Ok(Permit::Normal),
            CircuitState::Open => {
                let opened_at = state.opened_at.unwrap_or(now);
                let elapsed = now.duration_since(opened_at);
                if elapsed >= self.config.open_timeout {
                    state.state = CircuitState::HalfOpen;
                    state.trial_in_flight = true;
                    info!("Circuit breaker {} half-open, allowing one trial call", self.name);
                    Ok(Permit::Trial)
                } else {
                    state.rejected_calls += 1;
                    Err(CircuitError::Open {
                        name: self.name.clone(),
                        retry_in: self.config.open_timeout - elapsed,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if state.trial_in_flight {
                    state.rejected_calls += 1;
                    Err(CircuitError::Open {
                        name: self.name.clone(),
                        retry_in: Duration::ZERO,
                    })
                } else {
                    state.trial_in_flight = true;
                    Ok(Permit::Trial)
                }
            }
        }
    }

    fn on_success(&self) {
        let mut state = self.lock();
        if state.state == CircuitState::HalfOpen {
            info!("Circuit breaker {} closed after successful trial call", self.name);
        }
        state.state = CircuitState::Closed;
        state.failure_count = 0;
        state.trial_in_flight = false;
        state.opened_at = None;
    }

    fn on_failure(&self) {
        let mut state = self.lock();
        let now = Instant::now();
        state.failure_count += 1;
        state.last_failure_at = Some(now);

        match state.state {
            CircuitState::HalfOpen => {
                state.state = CircuitState::Open;
                state.opened_at = Some(now);
                state.trial_in_flight = false;
                state.times_opened += 1;
                warn!("Trial call through {} failed, circuit re-opened", self.name);
            }
            CircuitState::Closed if state.failure_count >= self.config.failure_threshold => {
                state.state = CircuitState::Open;
                state.opened_at = Some(now);
                state.times_opened += 1;
                error!(
                    "Circuit breaker {} opened after {} failures",
                    self.name, state.failure_count
                );
            }
            _ => {}
        }
    }
}
