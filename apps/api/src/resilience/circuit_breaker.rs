//! Per-provider circuit breaker.
//!
//! # State machine
//!
//! ```text
//! Closed   --[failure_threshold failures within failure_window]--> Open
//! Open     --[recovery_timeout elapsed]-------------------------> HalfOpen
//! HalfOpen --[success_threshold consecutive successes]-----------> Closed
//! HalfOpen --[any failure]---------------------------------------> Open
//! ```
//!
//! The open → half-open transition is evaluated lazily whenever the breaker is
//! consulted. Every method has an `_at(Instant)` twin so tests can drive the
//! clock explicitly; the plain versions use `tokio::time::Instant::now()`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

/// How many transitions each breaker remembers for dashboards.
const TRANSITION_LOG_LEN: usize = 32;

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub failure_window: Duration,
    pub recovery_timeout: Duration,
    pub success_threshold: u32,
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(5 * 60),
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 3,
            half_open_max_calls: 3,
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

#[derive(Debug, Clone, Serialize)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
    pub at: DateTime<Utc>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OutcomeTotals {
    pub successes: u64,
    pub failures: u64,
    pub rejected: u64,
}

/// Point-in-time view of a breaker, serialized on the provider health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub provider_id: String,
    pub state: CircuitState,
    pub failures_in_window: usize,
    pub consecutive_successes: u32,
    pub probes_in_flight: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub retry_after_secs: Option<u64>,
    pub totals: OutcomeTotals,
    pub transitions: Vec<Transition>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    /// Failure timestamps inside the rolling window (closed state only).
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    probes_in_flight: u32,
    consecutive_successes: u32,
    last_failure: Option<(Instant, DateTime<Utc>)>,
    totals: OutcomeTotals,
    transitions: VecDeque<Transition>,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            opened_at: None,
            probes_in_flight: 0,
            consecutive_successes: 0,
            last_failure: None,
            totals: OutcomeTotals::default(),
            transitions: VecDeque::with_capacity(TRANSITION_LOG_LEN),
        }
    }
}

pub struct CircuitBreaker {
    provider_id: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("provider_id", &self.provider_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    pub fn new(provider_id: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            provider_id: provider_id.into(),
            config,
            inner: Mutex::new(BreakerInner::new()),
        }
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> CircuitState {
        self.state_at(Instant::now())
    }

    pub fn state_at(&self, now: Instant) -> CircuitState {
        let mut inner = self.lock();
        self.refresh(&mut inner, now);
        inner.state
    }

    pub fn should_allow_call(&self) -> bool {
        self.should_allow_call_at(Instant::now())
    }

    /// Closed: always. Open: never. HalfOpen: while fewer than
    /// `half_open_max_calls` probes are in flight.
    pub fn should_allow_call_at(&self, now: Instant) -> bool {
        let mut inner = self.lock();
        self.refresh(&mut inner, now);

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                inner.totals.rejected += 1;
                false
            }
            CircuitState::HalfOpen => {
                if inner.probes_in_flight < self.config.half_open_max_calls {
                    inner.probes_in_flight += 1;
                    true
                } else {
                    inner.totals.rejected += 1;
                    false
                }
            }
        }
    }

    /// Gives back a half-open slot for a call that produced no health
    /// signal (rejected request, deadline hit before the call went out).
    pub fn release_half_open_slot(&self) {
        self.release_half_open_slot_at(Instant::now())
    }

    pub fn release_half_open_slot_at(&self, now: Instant) {
        let mut inner = self.lock();
        self.refresh(&mut inner, now);
        if inner.state == CircuitState::HalfOpen {
            inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
        }
    }

    /// Whether a retry of a call that was already admitted may go ahead.
    /// Unlike [`should_allow_call_at`](Self::should_allow_call_at) this takes
    /// no half-open slot: the call keeps the one it was admitted with.
    pub fn permits_retry_at(&self, now: Instant) -> bool {
        let mut inner = self.lock();
        self.refresh(&mut inner, now);
        inner.state != CircuitState::Open
    }

    pub fn permits_retry(&self) -> bool {
        self.permits_retry_at(Instant::now())
    }

    pub fn record_success(&self) {
        self.record_success_at(Instant::now())
    }

    pub fn record_success_at(&self, now: Instant) {
        let mut inner = self.lock();
        self.refresh(&mut inner, now);
        inner.totals.successes += 1;

        match inner.state {
            CircuitState::Closed => {}
            CircuitState::HalfOpen => {
                inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    let reason = format!(
                        "{} consecutive successful probes",
                        inner.consecutive_successes
                    );
                    self.transition(&mut inner, CircuitState::Closed, reason);
                }
            }
            // A call admitted before the breaker opened finished late; it does not close it.
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now())
    }

    pub fn record_failure_at(&self, now: Instant) {
        let mut inner = self.lock();
        self.refresh(&mut inner, now);
        inner.totals.failures += 1;
        inner.last_failure = Some((now, Utc::now()));

        match inner.state {
            CircuitState::Closed => {
                inner.failures.push_back(now);
                self.prune_window(&mut inner, now);
                if inner.failures.len() as u32 >= self.config.failure_threshold {
                    let reason = format!(
                        "{} failures within {}s",
                        inner.failures.len(),
                        self.config.failure_window.as_secs()
                    );
                    inner.opened_at = Some(now);
                    self.transition(&mut inner, CircuitState::Open, reason);
                }
            }
            CircuitState::HalfOpen => {
                inner.opened_at = Some(now);
                self.transition(&mut inner, CircuitState::Open, "probe failed".to_string());
            }
            CircuitState::Open => {}
        }
    }

    /// When the last failure was recorded. Used to rank open providers for last-resort use.
    pub fn last_failure_instant(&self) -> Option<Instant> {
        self.lock().last_failure.map(|(instant, _)| instant)
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        self.snapshot_at(Instant::now())
    }

    pub fn snapshot_at(&self, now: Instant) -> CircuitSnapshot {
        let mut inner = self.lock();
        self.refresh(&mut inner, now);
        self.prune_window(&mut inner, now);

        let retry_after_secs = match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(opened)) => Some(
                (opened + self.config.recovery_timeout)
                    .saturating_duration_since(now)
                    .as_secs(),
            ),
            _ => None,
        };

        CircuitSnapshot {
            provider_id: self.provider_id.clone(),
            state: inner.state,
            failures_in_window: inner.failures.len(),
            consecutive_successes: inner.consecutive_successes,
            probes_in_flight: inner.probes_in_flight,
            last_failure_at: inner.last_failure.map(|(_, wall)| wall),
            retry_after_secs,
            totals: inner.totals.clone(),
            transitions: inner.transitions.iter().cloned().collect(),
        }
    }

    fn refresh(&self, inner: &mut BreakerInner, now: Instant) {
        if inner.state != CircuitState::Open {
            return;
        }
        let Some(opened_at) = inner.opened_at else {
            return;
        };
        if now.saturating_duration_since(opened_at) >= self.config.recovery_timeout {
            self.transition(
                inner,
                CircuitState::HalfOpen,
                format!("recovery timeout of {}s elapsed", self.config.recovery_timeout.as_secs()),
            );
        }
    }

    fn prune_window(&self, inner: &mut BreakerInner, now: Instant) {
        while let Some(&oldest) = inner.failures.front() {
            if now.saturating_duration_since(oldest) > self.config.failure_window {
                inner.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState, reason: String) {
        let from = inner.state;
        if from == to {
            return;
        }

        match to {
            CircuitState::Open => {
                warn!("Circuit for provider {} opened: {reason}", self.provider_id);
            }
            CircuitState::HalfOpen | CircuitState::Closed => {
                info!(
                    "Circuit for provider {} {:?} -> {:?}: {reason}",
                    self.provider_id, from, to
                );
            }
        }

        inner.state = to;
        inner.probes_in_flight = 0;
        inner.consecutive_successes = 0;
        if to == CircuitState::Closed {
            inner.failures.clear();
            inner.opened_at = None;
        }

        if inner.transitions.len() == TRANSITION_LOG_LEN {
            inner.transitions.pop_front();
        }
        inner.transitions.push_back(Transition {
            from,
            to,
            at: Utc::now(),
            reason,
        });
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Registry keyed by provider id
// ────────────────────────────────────────────────────────────────────────────

/// One breaker per provider id, created on first use with the shared config.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn breaker(&self, provider_id: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        breakers
            .entry(provider_id.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(provider_id, self.config.clone())))
            .clone()
    }

    pub fn should_allow_call(&self, provider_id: &str) -> bool {
        self.breaker(provider_id).should_allow_call()
    }

    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> = self
            .breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut snapshots: Vec<_> = breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        snapshots
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
