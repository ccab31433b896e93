use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before letting probes through.
    pub open_for: Duration,
    /// Successful probes needed to close it again.
    pub half_open_probes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_for: Duration::from_secs(30),
            half_open_probes: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Counters {
    state: CircuitState,
    consecutive_failures: u32,
    probes_in_flight: u32,
    probe_successes: u32,
    opened_at: Option<Instant>,
}

/// Stops calling a peer that keeps failing, so callers degrade fast instead
/// of waiting out every timeout.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    counters: RwLock<Counters>,
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    #[error("circuit open")]
    CircuitOpen,

    #[error(transparent)]
    Failed(E),
}

impl CircuitBreaker {
    pub fn new(name: &str, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            counters: RwLock::new(Counters {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                probes_in_flight: 0,
                probe_successes: 0,
                opened_at: None,
            }),
        }
    }

    pub async fn call<F, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        if !self.admit().await {
            return Err(CircuitBreakerError::CircuitOpen);
        }

        let result = operation.await;
        match &result {
            Ok(_) => self.on_success().await,
            Err(_) => self.on_failure().await,
        }
        result.map_err(CircuitBreakerError::Failed)
    }

    pub async fn state(&self) -> CircuitState {
        self.counters.read().await.state
    }

    async fn admit(&self) -> bool {
        let mut counters = self.counters.write().await;
        match counters.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = counters.opened_at.map(|at| at.elapsed()).unwrap_or_default();
                if elapsed < self.config.open_for {
                    return false;
                }
                tracing::info!(peer = %self.name, "Circuit half-open, probing");
                counters.state = CircuitState::HalfOpen;
                counters.probes_in_flight = 1;
                counters.probe_successes = 0;
                true
            }
            CircuitState::HalfOpen => {
                if counters.probes_in_flight < self.config.half_open_probes {
                    counters.probes_in_flight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    async fn on_success(&self) {
        let mut counters = self.counters.write().await;
        counters.consecutive_failures = 0;

        if counters.state == CircuitState::HalfOpen {
            counters.probe_successes += 1;
            if counters.probe_successes >= self.config.half_open_probes {
                tracing::info!(peer = %self.name, "Circuit closed");
                counters.state = CircuitState::Closed;
                counters.probes_in_flight = 0;
                counters.opened_at = None;
            }
        }
    }

    async fn on_failure(&self) {
        let mut counters = self.counters.write().await;
        counters.consecutive_failures += 1;

        let trip = match counters.state {
            CircuitState::Closed => counters.consecutive_failures >= self.config.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };

        if trip {
            tracing::warn!(
                peer = %self.name,
                failures = counters.consecutive_failures,
                "Circuit opened"
            );
            counters.state = CircuitState::Open;
            counters.opened_at = Some(Instant::now());
            counters.probes_in_flight = 0;
        }
    }
}
