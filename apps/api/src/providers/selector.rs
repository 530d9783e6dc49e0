//! Weighted provider selection with a fallback chain.
//!
//! Each capable provider is scored on five weighted dimensions. Providers whose
//! circuit is open are left out; when that leaves nobody, the open provider
//! that failed longest ago is offered as a last resort.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::metrics::{ProviderHealth, ProviderRecord};
use super::{Capability, CompletionMode};
use crate::resilience::{CircuitState, Classify, ErrorCategory};

const WEIGHT_BASE: f64 = 0.25;
const WEIGHT_HEALTH: f64 = 0.30;
const WEIGHT_PERFORMANCE: f64 = 0.25;
const WEIGHT_COST: f64 = 0.15;
const WEIGHT_CONTEXT: f64 = 0.05;

/// Neutral guesses for providers without history.
const UNKNOWN_SUCCESS_RATE: f64 = 0.8;
const UNKNOWN_LATENCY_SCORE: f64 = 0.5;
const UNKNOWN_QUALITY: f64 = 0.7;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    #[default]
    Normal,
    High,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserTier {
    #[default]
    Free,
    Premium,
    Enterprise,
}

#[derive(Debug, Clone, Default)]
pub struct SelectionCriteria {
    pub capabilities: BTreeSet<Capability>,
    pub quality_threshold: Option<f64>,
    pub urgency: Urgency,
    pub user_tier: UserTier,
    /// UTC hour of day, 0..=23.
    pub hour_utc: Option<u32>,
}

#[derive(Debug, Error)]
pub enum SelectionError {
    #[error("no registered provider supports {0:?}")]
    NoCapableProvider(Vec<Capability>),
}

impl Classify for SelectionError {
    fn category(&self) -> ErrorCategory {
        ErrorCategory::Validation
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoreBreakdown {
    pub provider_id: String,
    pub total: f64,
    pub base: f64,
    pub health: f64,
    pub performance: f64,
    pub cost: f64,
    pub context: f64,
}

#[derive(Debug, Clone)]
pub struct Selection {
    pub provider: Arc<ProviderRecord>,
    /// Providers to try, in order, after `provider` fails.
    pub fallback_chain: Vec<Arc<ProviderRecord>>,
    pub reasoning: Vec<String>,
    pub last_resort: bool,
    pub scores: Vec<ScoreBreakdown>,
}

impl Selection {
    /// `provider` followed by the fallback chain.
    pub fn chain(&self) -> impl Iterator<Item = &Arc<ProviderRecord>> {
        std::iter::once(&self.provider).chain(self.fallback_chain.iter())
    }
}

pub struct ProviderSelector {
    records: Vec<Arc<ProviderRecord>>,
}

impl ProviderSelector {
    pub fn new(records: Vec<Arc<ProviderRecord>>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[Arc<ProviderRecord>] {
        &self.records
    }

    pub fn get(&self, provider_id: &str) -> Option<&Arc<ProviderRecord>> {
        self.records.iter().find(|r| r.id() == provider_id)
    }

    pub fn health(&self) -> Vec<ProviderHealth> {
        let mut health: Vec<_> = self.records.iter().map(|r| r.health()).collect();
        health.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        health
    }

    pub fn select(&self, criteria: &SelectionCriteria) -> Result<Selection, SelectionError> {
        self.select_at(criteria, Instant::now())
    }

    pub fn select_at(
        &self,
        criteria: &SelectionCriteria,
        now: Instant,
    ) -> Result<Selection, SelectionError> {
        let capable: Vec<&Arc<ProviderRecord>> = self
            .records
            .iter()
            .filter(|r| r.supports(&criteria.capabilities))
            .collect();
        if capable.is_empty() {
            return Err(SelectionError::NoCapableProvider(
                criteria.capabilities.iter().copied().collect(),
            ));
        }

        let (open, available): (Vec<_>, Vec<_>) = capable
            .into_iter()
            .partition(|r| r.breaker().state_at(now) == CircuitState::Open);

        if available.is_empty() {
            return Ok(last_resort(open, now));
        }

        let cheapest = available
            .iter()
            .map(|r| r.cost_per_unit())
            .fold(f64::INFINITY, f64::min);

        let mut scored: Vec<(ScoreBreakdown, &Arc<ProviderRecord>)> = available
            .into_iter()
            .map(|record| (score(record, criteria, cheapest, now), record))
            .collect();
        scored.sort_by(|(sa, ra), (sb, rb)| {
            sb.total
                .total_cmp(&sa.total)
                .then_with(|| ra.priority().cmp(&rb.priority()))
                .then_with(|| ra.id().cmp(rb.id()))
        });

        let mut reasoning = Vec::new();
        let (best_score, best) = &scored[0];
        reasoning.push(format!(
            "selected {} with score {:.3} (base {:.2}, health {:.2}, performance {:.2}, cost {:.2}, context {:.2})",
            best.id(),
            best_score.total,
            best_score.base,
            best_score.health,
            best_score.performance,
            best_score.cost,
            best_score.context
        ));
        if !open.is_empty() {
            let skipped: Vec<&str> = open.iter().map(|r| r.id()).collect();
            reasoning.push(format!("skipped open circuits: {}", skipped.join(", ")));
        }
        debug!("{}", reasoning.join("; "));

        Ok(Selection {
            provider: Arc::clone(best),
            fallback_chain: scored[1..].iter().map(|(_, r)| Arc::clone(r)).collect(),
            reasoning,
            last_resort: false,
            scores: scored.into_iter().map(|(s, _)| s).collect(),
        })
    }
}

fn last_resort(mut open: Vec<&Arc<ProviderRecord>>, now: Instant) -> Selection {
    // Least recently failed first; a breaker with no recorded failure sorts earliest.
    open.sort_by(|a, b| {
        a.breaker()
            .last_failure_instant()
            .cmp(&b.breaker().last_failure_instant())
            .then_with(|| a.priority().cmp(&b.priority()))
            .then_with(|| a.id().cmp(b.id()))
    });

    let provider = Arc::clone(open[0]);
    let since = provider
        .breaker()
        .last_failure_instant()
        .map(|at| now.saturating_duration_since(at).as_secs())
        .unwrap_or_default();
    let reason = format!(
        "all capable providers have open circuits; trying {} as a last resort (last failure {since}s ago)",
        provider.id()
    );
    warn!("{reason}");

    Selection {
        fallback_chain: open[1..].iter().map(|r| Arc::clone(r)).collect(),
        provider,
        reasoning: vec![reason],
        last_resort: true,
        scores: Vec::new(),
    }
}

fn score(
    record: &ProviderRecord,
    criteria: &SelectionCriteria,
    cheapest: f64,
    now: Instant,
) -> ScoreBreakdown {
    let metrics = record.metrics_at(now);

    let base = 1.0 / record.priority() as f64;

    let state_health = match record.breaker().state_at(now) {
        CircuitState::Closed => 1.0,
        CircuitState::HalfOpen => 0.5,
        CircuitState::Open => 0.0,
    };
    let health = (state_health - 0.1 * metrics.recent_failures as f64).clamp(0.0, 1.0);

    let success = metrics.success_rate.unwrap_or(UNKNOWN_SUCCESS_RATE);
    let latency = metrics
        .avg_latency_ms
        .map(|ms| 1.0 / (1.0 + ms / 10_000.0))
        .unwrap_or(UNKNOWN_LATENCY_SCORE);
    let quality = metrics.avg_quality.unwrap_or(UNKNOWN_QUALITY);
    let mut performance = 0.5 * success + 0.3 * latency + 0.2 * quality;
    if let (Some(threshold), Some(known)) = (criteria.quality_threshold, metrics.avg_quality) {
        if known < threshold {
            performance *= 0.5;
        }
    }

    let cost = if record.cost_per_unit() <= 0.0 {
        1.0
    } else {
        (cheapest / record.cost_per_unit()).clamp(0.0, 1.0)
    };

    let mut context: f64 = 0.0;
    let immediate = record.provider().completion_mode() == CompletionMode::Immediate;
    match criteria.urgency {
        Urgency::High if immediate => context += 0.5,
        Urgency::Low if !immediate => context += 0.2,
        _ => {}
    }
    if matches!(criteria.user_tier, UserTier::Premium | UserTier::Enterprise) {
        context += 0.3 * quality;
    }
    if let Some(hour) = criteria.hour_utc {
        // Off-peak work favours the cheaper providers.
        if !(8..22).contains(&hour) {
            context += 0.2 * cost;
        }
    }
    let context = context.clamp(0.0, 1.0);

    let total = WEIGHT_BASE * base
        + WEIGHT_HEALTH * health
        + WEIGHT_PERFORMANCE * performance
        + WEIGHT_COST * cost
        + WEIGHT_CONTEXT * context;

    ScoreBreakdown {
        provider_id: record.id().to_string(),
        total,
        base,
        health,
        performance,
        cost,
        context,
    }
}
