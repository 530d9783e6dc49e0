//! Per-provider bookkeeping: static attributes, the circuit breaker, and a
//! rolling window of call outcomes used for scoring.

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use super::{Capability, GenerationProvider, ProviderKind};
use crate::resilience::{CircuitBreaker, CircuitSnapshot};

/// Outcomes kept per provider.
const OUTCOME_WINDOW: usize = 50;
/// Failures newer than this count as "recent" for health scoring.
const RECENT_FAILURE_WINDOW: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Outcome {
    pub success: bool,
    pub latency: Duration,
    pub quality: Option<f64>,
}

impl Outcome {
    pub fn success(latency: Duration, quality: Option<f64>) -> Self {
        Self {
            success: true,
            latency,
            quality,
        }
    }

    pub fn failure(latency: Duration) -> Self {
        Self {
            success: false,
            latency,
            quality: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProviderMetrics {
    /// Outcomes currently in the rolling window.
    pub samples: usize,
    pub total_calls: u64,
    pub success_rate: Option<f64>,
    pub avg_latency_ms: Option<f64>,
    pub avg_quality: Option<f64>,
    pub recent_failures: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    pub id: String,
    pub kind: ProviderKind,
    pub priority: u32,
    pub cost_per_unit: f64,
    pub capabilities: BTreeSet<Capability>,
    pub metrics: ProviderMetrics,
    pub circuit: CircuitSnapshot,
}

#[derive(Default)]
struct OutcomeLog {
    entries: VecDeque<(Instant, Outcome)>,
    total_calls: u64,
}

pub struct ProviderRecord {
    provider: Arc<dyn GenerationProvider>,
    priority: u32,
    cost_per_unit: f64,
    breaker: Arc<CircuitBreaker>,
    outcomes: Mutex<OutcomeLog>,
}

impl ProviderRecord {
    /// `priority` 1 is the most preferred.
    pub fn new(
        provider: Arc<dyn GenerationProvider>,
        priority: u32,
        cost_per_unit: f64,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            provider,
            priority: priority.max(1),
            cost_per_unit: cost_per_unit.max(0.0),
            breaker,
            outcomes: Mutex::new(OutcomeLog::default()),
        }
    }

    pub fn id(&self) -> &str {
        self.provider.id()
    }

    pub fn kind(&self) -> ProviderKind {
        self.provider.kind()
    }

    pub fn provider(&self) -> &Arc<dyn GenerationProvider> {
        &self.provider
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn cost_per_unit(&self) -> f64 {
        self.cost_per_unit
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn supports(&self, required: &BTreeSet<Capability>) -> bool {
        required.is_subset(self.provider.capabilities())
    }

    /// The only mutation path: updates the rolling window and drives the breaker.
    pub fn record_outcome(&self, outcome: Outcome) {
        self.record_outcome_at(outcome, Instant::now());
    }

    pub fn record_outcome_at(&self, outcome: Outcome, now: Instant) {
        {
            let mut log = self.outcomes.lock().unwrap_or_else(PoisonError::into_inner);
            log.total_calls += 1;
            log.entries.push_back((now, outcome));
            while log.entries.len() > OUTCOME_WINDOW {
                log.entries.pop_front();
            }
        }

        if outcome.success {
            self.breaker.record_success_at(now);
        } else {
            self.breaker.record_failure_at(now);
        }
    }

    pub fn metrics(&self) -> ProviderMetrics {
        self.metrics_at(Instant::now())
    }

    pub fn metrics_at(&self, now: Instant) -> ProviderMetrics {
        let log = self.outcomes.lock().unwrap_or_else(PoisonError::into_inner);
        let samples = log.entries.len();
        if samples == 0 {
            return ProviderMetrics {
                total_calls: log.total_calls,
                ..ProviderMetrics::default()
            };
        }

        let successes = log.entries.iter().filter(|(_, o)| o.success).count();
        let latency_ms: f64 = log
            .entries
            .iter()
            .map(|(_, o)| o.latency.as_secs_f64() * 1000.0)
            .sum();
        let qualities: Vec<f64> = log.entries.iter().filter_map(|(_, o)| o.quality).collect();
        let recent_failures = log
            .entries
            .iter()
            .filter(|(at, o)| {
                !o.success && now.saturating_duration_since(*at) < RECENT_FAILURE_WINDOW
            })
            .count() as u32;

        ProviderMetrics {
            samples,
            total_calls: log.total_calls,
            success_rate: Some(successes as f64 / samples as f64),
            avg_latency_ms: Some(latency_ms / samples as f64),
            avg_quality: (!qualities.is_empty())
                .then(|| qualities.iter().sum::<f64>() / qualities.len() as f64),
            recent_failures,
        }
    }

    pub fn health(&self) -> ProviderHealth {
        ProviderHealth {
            id: self.id().to_string(),
            kind: self.kind(),
            priority: self.priority,
            cost_per_unit: self.cost_per_unit,
            capabilities: self.provider.capabilities().clone(),
            metrics: self.metrics(),
            circuit: self.breaker.snapshot(),
        }
    }
}

impl std::fmt::Debug for ProviderRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRecord")
            .field("id", &self.id())
            .field("priority", &self.priority)
            .field("cost_per_unit", &self.cost_per_unit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::scripted::ScriptedProvider;
    use crate::resilience::{CircuitBreakerConfig, CircuitState};

    fn record() -> ProviderRecord {
        let provider = Arc::new(ScriptedProvider::video("heygen"));
        ProviderRecord::new(
            provider,
            1,
            0.5,
            Arc::new(CircuitBreaker::new("heygen", CircuitBreakerConfig::default())),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_aggregate_rolling_window() {
        let record = record();
        assert_eq!(record.metrics().success_rate, None);

        record.record_outcome(Outcome::success(Duration::from_millis(100), Some(0.8)));
        record.record_outcome(Outcome::success(Duration::from_millis(300), None));
        record.record_outcome(Outcome::failure(Duration::from_millis(200)));

        let metrics = record.metrics();
        assert_eq!(metrics.samples, 3);
        assert!((metrics.success_rate.unwrap() - 2.0 / 3.0).abs() < 1e-9);
        assert!((metrics.avg_latency_ms.unwrap() - 200.0).abs() < 1e-6);
        assert_eq!(metrics.avg_quality, Some(0.8));
        assert_eq!(metrics.recent_failures, 1);

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(record.metrics().recent_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_is_bounded_but_total_keeps_counting() {
        let record = record();
        for _ in 0..(OUTCOME_WINDOW + 10) {
            record.record_outcome(Outcome::success(Duration::from_millis(10), None));
        }
        let metrics = record.metrics();
        assert_eq!(metrics.samples, OUTCOME_WINDOW);
        assert_eq!(metrics.total_calls, (OUTCOME_WINDOW + 10) as u64);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_drive_the_breaker() {
        let record = record();
        for _ in 0..5 {
            record.record_outcome(Outcome::failure(Duration::from_millis(10)));
        }
        assert_eq!(record.breaker().state(), CircuitState::Open);
    }
}
