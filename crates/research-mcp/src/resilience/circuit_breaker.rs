//! Per-dependency circuit breaker.
//!
//! Closed counts consecutive failures; at the threshold the circuit opens
//! and short-circuits callers for a cooldown. After the cooldown a single
//! probe is admitted: success closes the circuit, failure reopens it with a
//! fresh cooldown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Breaker tuning.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening.
    pub failure_threshold: u32,
    /// Open-state cooldown before a probe is admitted.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: crate::config::limits::BREAKER_FAILURE_THRESHOLD,
            cooldown: crate::config::limits::BREAKER_COOLDOWN,
        }
    }
}

/// Point-in-time view for stats endpoints.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    pub total_rejected: u64,
}

struct State {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    total_failures: u64,
    total_successes: u64,
    total_rejected: u64,
}

/// Thread-safe breaker for one named dependency.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<State>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(State {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
                total_failures: 0,
                total_successes: 0,
                total_rejected: 0,
            }),
        }
    }

    /// Dependency name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask to pass a request through. `Err` carries the remaining cooldown.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut state = self.state.lock().expect("breaker lock poisoned");

        if state.state == CircuitState::Open {
            let elapsed = state.opened_at.map_or(Duration::ZERO, |t| t.elapsed());
            if elapsed >= self.config.cooldown {
                state.state = CircuitState::HalfOpen;
                state.probe_in_flight = false;
                tracing::info!(dependency = %self.name, "Circuit breaker half-open");
            } else {
                state.total_rejected += 1;
                return Err(self.config.cooldown - elapsed);
            }
        }

        if state.state == CircuitState::HalfOpen {
            if state.probe_in_flight {
                state.total_rejected += 1;
                return Err(self.config.cooldown);
            }
            state.probe_in_flight = true;
        }

        Ok(())
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        state.total_successes += 1;
        state.consecutive_failures = 0;

        if state.state == CircuitState::HalfOpen {
            state.state = CircuitState::Closed;
            state.probe_in_flight = false;
            state.opened_at = None;
            tracing::info!(dependency = %self.name, "Circuit breaker closed after recovery");
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        state.total_failures += 1;
        state.consecutive_failures += 1;

        match state.state {
            CircuitState::HalfOpen => {
                state.state = CircuitState::Open;
                state.opened_at = Some(Instant::now());
                state.probe_in_flight = false;
                tracing::warn!(dependency = %self.name, "Circuit breaker reopened after failed probe");
            }
            CircuitState::Closed if state.consecutive_failures >= self.config.failure_threshold => {
                state.state = CircuitState::Open;
                state.opened_at = Some(Instant::now());
                tracing::warn!(
                    dependency = %self.name,
                    failures = state.consecutive_failures,
                    "Circuit breaker opened"
                );
            }
            _ => {}
        }
    }

    /// Current state, advancing Open to HalfOpen when the cooldown elapsed.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        if state.state == CircuitState::Open {
            let elapsed = state.opened_at.map_or(Duration::ZERO, |t| t.elapsed());
            if elapsed >= self.config.cooldown {
                state.state = CircuitState::HalfOpen;
                state.probe_in_flight = false;
            }
        }
        state.state
    }

    /// Counters for the stats surface.
    #[must_use]
    pub fn snapshot(&self) -> CircuitSnapshot {
        let state = self.state.lock().expect("breaker lock poisoned");
        CircuitSnapshot {
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            total_failures: state.total_failures,
            total_successes: state.total_successes,
            total_rejected: state.total_rejected,
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker").field("name", &self.name).finish()
    }
}

/// Lazily-created breakers keyed by dependency name.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self { config, breakers: Mutex::new(HashMap::new()) }
    }

    /// Get or create the breaker for a dependency.
    #[must_use]
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().expect("registry lock poisoned");
        breakers
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config.clone())))
            .clone()
    }

    /// Snapshot every known breaker.
    #[must_use]
    pub fn snapshots(&self) -> HashMap<String, CircuitSnapshot> {
        let breakers = self.breakers.lock().expect("registry lock poisoned");
        breakers.iter().map(|(name, b)| (name.clone(), b.snapshot())).collect()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry").finish()
    }
}
