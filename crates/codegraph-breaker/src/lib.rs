//! Service circuit breakers.
//!
//! One breaker per external service (LLM, graph store, broker). Each is a
//! CLOSED / OPEN / HALF_OPEN state machine with consecutive-failure
//! tripping, exponentially-backed probe windows, and a sliding recovery
//! window that requires sustained success before closing again: a single
//! lucky probe never closes a circuit.
//!
//! Rate limits and other non-failure classes (auth, pool exhaustion,
//! deadlocks on the graph side) set a backoff deadline that blocks calls
//! but never counts toward the failure threshold.
//!
//! All transitions happen under a breaker-local mutex. The mutex is never
//! held across an await: the optional health probe runs between two short
//! critical sections, and a raced transition is re-checked after it.

mod llm;
mod persist;

pub use llm::{CacheFallback, LlmBreaker};
pub use persist::{load_state, persist_state, PersistedBreaker, ProbeRecord};

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;

use codegraph_types::FailureKind;

/// Breaker state, in wire spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BreakerState {
    #[serde(rename = "CLOSED")]
    Closed,
    #[serde(rename = "OPEN")]
    Open,
    #[serde(rename = "HALF_OPEN")]
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "CLOSED"),
            BreakerState::Open => write!(f, "OPEN"),
            BreakerState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Why a call was refused without reaching the service.
#[derive(Debug, Error)]
pub enum BreakerError {
    #[error("circuit open for '{service}', retry in {retry_in:?}")]
    Open { service: String, retry_in: Duration },

    #[error("'{service}' backing off after rate limit, retry in {retry_in:?}")]
    RateLimited { service: String, retry_in: Duration },
}

impl BreakerError {
    /// The failure kind this refusal maps to for retry decisions.
    #[must_use]
    pub fn as_failure(&self) -> FailureKind {
        match self {
            BreakerError::Open { service, .. } => FailureKind::CircuitOpen {
                service: service.clone(),
            },
            BreakerError::RateLimited { retry_in, .. } => FailureKind::RateLimited {
                retry_after_ms: Some(retry_in.as_millis() as u64),
            },
        }
    }
}

/// How one call outcome is counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallClass {
    Success,
    /// Counts toward the failure threshold.
    Failure,
    /// Backs the breaker off without counting.
    RateLimit,
    /// Neither counts nor backs off beyond the service's own signal
    /// (graph pool exhaustion, store deadlock).
    NonCounting,
}

/// Maps a handler failure to a [`CallClass`]. The default classifier
/// follows the shared taxonomy; the graph breaker installs one that tags
/// pool-exhausted and deadlock errors as non-counting.
pub type Classifier = fn(&FailureKind) -> CallClass;

fn default_classifier(kind: &FailureKind) -> CallClass {
    match kind {
        FailureKind::RateLimited { .. } => CallClass::RateLimit,
        kind if kind.counts_toward_breaker() => CallClass::Failure,
        _ => CallClass::NonCounting,
    }
}

/// Classifier for the graph-store breaker: connection-pool exhaustion and
/// store deadlocks back off but never open the circuit.
pub fn graph_classifier(kind: &FailureKind) -> CallClass {
    if let FailureKind::Infrastructure { message, .. } = kind {
        let lowered = message.to_ascii_lowercase();
        if lowered.contains("pool exhausted") || lowered.contains("deadlock") {
            return CallClass::NonCounting;
        }
    }
    default_classifier(kind)
}

/// Optional async health probe consulted before OPEN → HALF_OPEN.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self) -> bool;
}

/// Breaker tuning.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub name: String,
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub base_retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub retry_multiplier: f64,
    /// Required success ratio across the recovery window, in [0,1].
    pub partial_recovery_threshold: f64,
    pub partial_recovery_window: usize,
}

impl BreakerConfig {
    /// Reasonable defaults for a named service; tests override fields.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            failure_threshold: 10,
            reset_timeout: Duration::from_secs(30),
            base_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(60),
            retry_multiplier: 2.0,
            partial_recovery_threshold: 0.5,
            partial_recovery_window: 10,
        }
    }
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    next_attempt: Option<Instant>,
    current_delay: Duration,
    recovery_attempts: u32,
    /// Outcomes of half-open test calls, newest last, bounded by the
    /// configured window.
    recovery_window: VecDeque<bool>,
    rate_limit_until: Option<Instant>,
    last_recovery_attempt: Option<Instant>,
    /// Transition history, newest last. Bounded; kept for status
    /// reporting and tests.
    history: Vec<BreakerState>,
}

impl Inner {
    fn transition(&mut self, to: BreakerState) {
        if self.state != to {
            self.state = to;
            if self.history.len() >= 64 {
                self.history.remove(0);
            }
            self.history.push(to);
        }
    }
}

/// A circuit breaker for one service.
pub struct CircuitBreaker {
    config: BreakerConfig,
    classifier: Classifier,
    probe: Option<Box<dyn HealthProbe>>,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self::with_classifier(config, default_classifier)
    }

    #[must_use]
    pub fn with_classifier(config: BreakerConfig, classifier: Classifier) -> Self {
        let base = config.base_retry_delay;
        Self {
            config,
            classifier,
            probe: None,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                next_attempt: None,
                current_delay: base,
                recovery_attempts: 0,
                recovery_window: VecDeque::new(),
                rate_limit_until: None,
                last_recovery_attempt: None,
                history: vec![BreakerState::Closed],
            }),
        }
    }

    #[must_use]
    pub fn with_probe(mut self, probe: Box<dyn HealthProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Transition history since construction (bounded), oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<BreakerState> {
        self.lock().history.clone()
    }

    /// Gate a call: fail fast when the circuit is open or backing off,
    /// and perform the OPEN → HALF_OPEN transition when a probe window is
    /// due and the health probe (if any) passes.
    pub async fn preflight(&self) -> Result<(), BreakerError> {
        let gate = {
            let mut inner = self.lock();
            let now = Instant::now();
            if let Some(until) = inner.rate_limit_until {
                if now < until {
                    PreflightGate::Blocked(BreakerError::RateLimited {
                        service: self.config.name.clone(),
                        retry_in: until - now,
                    })
                } else {
                    inner.rate_limit_until = None;
                    self.gate_by_state(&inner, now)
                }
            } else {
                self.gate_by_state(&inner, now)
            }
        };

        match gate {
            PreflightGate::Allow => Ok(()),
            PreflightGate::Blocked(err) => Err(err),
            PreflightGate::Probe => {
                // Probe outside the lock; re-check the state afterwards in
                // case another task already transitioned.
                let healthy = match &self.probe {
                    Some(probe) => probe.check().await,
                    None => true,
                };
                let mut inner = self.lock();
                let now = Instant::now();
                if inner.state != BreakerState::Open {
                    return Ok(());
                }
                if healthy {
                    tracing::info!(service = %self.config.name, "probe passed, entering HALF_OPEN");
                    inner.transition(BreakerState::HalfOpen);
                    inner.recovery_window.clear();
                    inner.last_recovery_attempt = Some(now);
                    inner.next_attempt = Some(now + inner.current_delay);
                    inner.current_delay = escalate(
                        inner.current_delay,
                        self.config.retry_multiplier,
                        self.config.max_retry_delay,
                    );
                    Ok(())
                } else {
                    inner.next_attempt = Some(now + inner.current_delay);
                    inner.current_delay = escalate(
                        inner.current_delay,
                        self.config.retry_multiplier,
                        self.config.max_retry_delay,
                    );
                    Err(BreakerError::Open {
                        service: self.config.name.clone(),
                        retry_in: inner.current_delay,
                    })
                }
            }
        }
    }

    fn gate_by_state(&self, inner: &Inner, now: Instant) -> PreflightGate {
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => PreflightGate::Allow,
            BreakerState::Open => match inner.next_attempt {
                Some(due) if now >= due => PreflightGate::Probe,
                Some(due) => PreflightGate::Blocked(BreakerError::Open {
                    service: self.config.name.clone(),
                    retry_in: due - now,
                }),
                None => PreflightGate::Probe,
            },
        }
    }

    /// Record the outcome of a call that passed [`preflight`](Self::preflight).
    pub fn record(&self, class: CallClass) {
        let mut inner = self.lock();
        let now = Instant::now();
        match (inner.state, class) {
            (BreakerState::Closed, CallClass::Success) => {
                inner.consecutive_failures = 0;
            }
            (BreakerState::Closed, CallClass::Failure) => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    tracing::warn!(
                        service = %self.config.name,
                        failures = inner.consecutive_failures,
                        "failure threshold reached, opening circuit"
                    );
                    inner.transition(BreakerState::Open);
                    inner.next_attempt = Some(now + self.config.reset_timeout);
                    inner.current_delay = self.config.base_retry_delay;
                }
            }
            (_, CallClass::RateLimit) => {
                inner.rate_limit_until = Some(now + self.config.base_retry_delay);
            }
            (_, CallClass::NonCounting) => {
                // Backs off lightly without touching failure counters.
                inner.rate_limit_until = Some(now + self.config.base_retry_delay);
            }
            (BreakerState::HalfOpen, CallClass::Success) => {
                inner.recovery_attempts += 1;
                push_window(
                    &mut inner.recovery_window,
                    true,
                    self.config.partial_recovery_window,
                );
                let recorded = inner.recovery_window.len();
                let successes = inner.recovery_window.iter().filter(|s| **s).count();
                let rate = successes as f64 / recorded as f64;
                if recorded >= 3 && rate >= self.config.partial_recovery_threshold {
                    tracing::info!(
                        service = %self.config.name,
                        recorded,
                        rate,
                        "recovery window satisfied, closing circuit"
                    );
                    inner.transition(BreakerState::Closed);
                    inner.consecutive_failures = 0;
                    inner.recovery_window.clear();
                    inner.next_attempt = None;
                    inner.current_delay = self.config.base_retry_delay;
                }
            }
            (BreakerState::HalfOpen, CallClass::Failure) => {
                inner.recovery_attempts += 1;
                push_window(
                    &mut inner.recovery_window,
                    false,
                    self.config.partial_recovery_window,
                );
                tracing::warn!(service = %self.config.name, "half-open test call failed, reopening");
                inner.transition(BreakerState::Open);
                inner.next_attempt = Some(now + inner.current_delay);
            }
            (BreakerState::Open, CallClass::Success | CallClass::Failure) => {
                // A straggler from before the trip; the circuit decides
                // recovery from probes, not from stragglers.
            }
        }
    }

    /// Run `f` behind the breaker: preflight, call, record, propagate.
    pub async fn execute<T, F, Fut>(&self, f: F) -> Result<T, FailureKind>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, FailureKind>>,
    {
        self.preflight().await.map_err(|e| e.as_failure())?;
        match f().await {
            Ok(value) => {
                self.record(CallClass::Success);
                Ok(value)
            }
            Err(kind) => {
                self.record((self.classifier)(&kind));
                Err(kind)
            }
        }
    }

    /// Snapshot for persistence.
    #[must_use]
    pub fn snapshot(&self) -> PersistedBreaker {
        let inner = self.lock();
        let now = Instant::now();
        PersistedBreaker::from_runtime(
            inner.state,
            inner.consecutive_failures,
            inner.next_attempt.map(|at| remaining_ms(now, at)),
            inner.recovery_attempts,
            inner.current_delay,
            inner.last_recovery_attempt.map(|at| elapsed_ms(now, at)),
            inner.recovery_window.iter().copied().collect(),
        )
    }

    /// Restore runtime state from a persisted snapshot. Snapshots older
    /// than one hour are ignored by [`load_state`], so anything arriving
    /// here is considered fresh.
    pub fn restore(&self, persisted: &PersistedBreaker) {
        let mut inner = self.lock();
        let now = Instant::now();
        inner.state = persisted.state;
        inner.consecutive_failures = persisted.failures;
        inner.next_attempt = persisted
            .next_attempt_in_ms
            .map(|ms| now + Duration::from_millis(ms));
        inner.recovery_attempts = persisted.recovery_attempts;
        inner.current_delay = Duration::from_millis(persisted.current_retry_delay_ms);
        inner.recovery_window = persisted
            .recovery_test_requests
            .iter()
            .map(|r| r.success)
            .collect();
        inner.history.push(persisted.state);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("breaker mutex poisoned")
    }
}

enum PreflightGate {
    Allow,
    Probe,
    Blocked(BreakerError),
}

fn escalate(current: Duration, multiplier: f64, max: Duration) -> Duration {
    let next = current.mul_f64(multiplier);
    next.min(max)
}

fn push_window(window: &mut VecDeque<bool>, outcome: bool, cap: usize) {
    if window.len() >= cap.max(1) {
        window.pop_front();
    }
    window.push_back(outcome);
}

fn remaining_ms(now: Instant, at: Instant) -> u64 {
    at.saturating_duration_since(now).as_millis() as u64
}

fn elapsed_ms(now: Instant, at: Instant) -> u64 {
    now.saturating_duration_since(at).as_millis() as u64
}

/// The set of breakers for one pipeline process.
pub struct BreakerRegistry {
    breakers: Vec<std::sync::Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    #[must_use]
    pub fn new(breakers: Vec<std::sync::Arc<CircuitBreaker>>) -> Self {
        Self { breakers }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<std::sync::Arc<CircuitBreaker>> {
        self.breakers.iter().find(|b| b.name() == name).cloned()
    }

    /// Number of currently OPEN circuits. Two or more engages the
    /// governor's protective mode.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.breakers
            .iter()
            .filter(|b| b.state() == BreakerState::Open)
            .count()
    }

    /// Best-effort persistence of every breaker to `dir`.
    pub fn persist_all(&self, dir: &std::path::Path) {
        for breaker in &self.breakers {
            if let Err(e) = persist_state(dir, breaker.name(), &breaker.snapshot()) {
                tracing::warn!(service = %breaker.name(), error = %e, "breaker state persist failed");
            }
        }
    }

    /// Best-effort restore of every breaker from `dir`.
    pub fn load_all(&self, dir: &std::path::Path) {
        for breaker in &self.breakers {
            match load_state(dir, breaker.name()) {
                Ok(Some(persisted)) => breaker.restore(&persisted),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(service = %breaker.name(), error = %e, "breaker state load failed");
                }
            }
        }
    }

    #[must_use]
    pub fn states(&self) -> Vec<(String, BreakerState)> {
        self.breakers
            .iter()
            .map(|b| (b.name().to_string(), b.state()))
            .collect()
    }
}

#[cfg(test)]
mod tests;
