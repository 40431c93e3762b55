//! Circuit breaker around the fetch cycle.
//!
//! Consecutive failed cycles trip the breaker; while it is open the runner
//! pauses instead of hammering a screener that is blocking us.
//!
//! ```text
//!   Closed ──(failure_threshold consecutive failures)──▶ Open
//!     ▲                                                   │
//!     │ success_threshold successes          reset_timeout│
//!     │                                                   ▼
//!     └──────────────────────────────────────────────  HalfOpen
//!                       (any failure reopens)
//! ```

use serde::Serialize;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Cycles run normally
    Closed,
    /// Too many failures, cycles are paused
    Open,
    /// Trying one cycle to see whether the screener recovered
    HalfOpen,
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// How long to stay open before a trial cycle
    pub reset_timeout: Duration,
    /// Successes needed in half-open to close again
    pub success_threshold: u32,
    pub name: String,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(30),
            success_threshold: 1,
            name: "screener".to_string(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold.max(1);
        self
    }

    /// Build from the runner section of the service config.
    pub fn from_runner(runner: &orion_common::RunnerConfig) -> Self {
        Self::with_name("screener")
            .failure_threshold(runner.failure_threshold)
            .reset_timeout(Duration::from_secs(runner.breaker_cooldown_secs))
    }
}

// ============================================================================
// Circuit Breaker
// ============================================================================

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    trial_successes: u32,
    opened_at: Option<Instant>,
    trips: u32,
}

/// Shared between the cycle loop and the status heartbeat.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                trial_successes: 0,
                opened_at: None,
                trips: 0,
            }),
        }
    }

    pub fn with_name(name: impl Into<String>) -> Self {
        Self::new(CircuitBreakerConfig::with_name(name))
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn can_execute(&self) -> bool {
        self.state() != CircuitState::Open
    }

    /// Time left before an open breaker allows a trial cycle.
    pub fn remaining_cooldown(&self) -> Duration {
        let inner = self.lock();
        match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(at)) => self.config.reset_timeout.saturating_sub(at.elapsed()),
            _ => Duration::ZERO,
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                inner.trial_successes += 1;
                if inner.trial_successes >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.trial_successes = 0;
                    inner.opened_at = None;
                    tracing::info!(circuit = %self.config.name, "Circuit breaker closed");
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed cycle.
    ///
    /// Returns true when this failure opened the circuit.
    pub fn record_failure(&self) -> bool {
        let mut inner = self.lock();
        inner.consecutive_failures += 1;

        let trip = match inner.state {
            CircuitState::Closed => inner.consecutive_failures >= self.config.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };

        if trip {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.trial_successes = 0;
            inner.trips += 1;
            tracing::warn!(
                circuit = %self.config.name,
                consecutive_failures = inner.consecutive_failures,
                cooldown_secs = self.config.reset_timeout.as_secs(),
                "Circuit breaker opened"
            );
        }
        trip
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.lock();
        CircuitBreakerStats {
            name: self.config.name.clone(),
            state: inner.state,
            failure_count: inner.consecutive_failures,
            success_count: inner.trial_successes,
            failure_threshold: self.config.failure_threshold,
            trips: inner.trips,
        }
    }

    /// Lock the state, moving Open to HalfOpen once the cooldown elapsed.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        let mut inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let cooled = inner
            .opened_at
            .is_some_and(|at| at.elapsed() >= self.config.reset_timeout);
        if inner.state == CircuitState::Open && cooled {
            inner.state = CircuitState::HalfOpen;
            inner.trial_successes = 0;
            tracing::info!(circuit = %self.config.name, "Circuit breaker half-open, allowing a trial cycle");
        }
        inner
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Snapshot of the breaker, embedded in the status document.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub failure_threshold: u32,
    pub trips: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            CircuitBreakerConfig::with_name("test")
                .failure_threshold(threshold)
                .reset_timeout(cooldown),
        )
    }

    #[test]
    fn test_opens_after_consecutive_failures() {
        let breaker = breaker(3, Duration::from_secs(30));
        assert!(breaker.can_execute());

        assert!(!breaker.record_failure());
        assert!(!breaker.record_failure());
        assert_eq!(breaker.state(), CircuitState::Closed);

        assert!(breaker.record_failure());
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute());

        // Already open: no second trip
        assert!(!breaker.record_failure());
        assert_eq!(breaker.stats().trips, 1);
    }

    #[test]
    fn test_success_clears_failure_streak() {
        let breaker = breaker(3, Duration::from_secs(30));
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.stats().failure_count, 2);

        breaker.record_success();
        assert_eq!(breaker.stats().failure_count, 0);
        assert!(!breaker.record_failure());
    }

    #[test]
    fn test_trial_success_closes() {
        let breaker = breaker(1, Duration::ZERO);
        assert!(breaker.record_failure());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_trial_failure_reopens() {
        let breaker = breaker(1, Duration::from_millis(20));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        assert!(breaker.record_failure());
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.stats().trips, 2);
    }

    #[test]
    fn test_remaining_cooldown() {
        let open = breaker(1, Duration::from_secs(30));
        assert_eq!(open.remaining_cooldown(), Duration::ZERO);

        open.record_failure();
        let left = open.remaining_cooldown();
        assert!(left > Duration::from_secs(29) && left <= Duration::from_secs(30));
        assert!(!open.can_execute());

        let cooled = breaker(1, Duration::ZERO);
        cooled.record_failure();
        assert_eq!(cooled.remaining_cooldown(), Duration::ZERO);
        assert!(cooled.can_execute());
    }

    #[test]
    fn test_from_runner_config() {
        let config = CircuitBreakerConfig::from_runner(&orion_common::RunnerConfig::default());
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.reset_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_stats_serialize() {
        let json = serde_json::to_value(CircuitBreaker::with_name("screener").stats()).unwrap();
        assert_eq!(json["state"], "closed");
        assert_eq!(json["name"], "screener");
        assert_eq!(json["trips"], 0);
    }
}
