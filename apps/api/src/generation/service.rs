//! Generation workflow: select a provider, walk its fallback chain, merge the
//! produced fragments into the job document and report every step as an event.
//!
//! Flow: validate body → rate check → select → for each provider in the chain:
//!       breaker gate → submit (retried) → wait for completion → apply fragments.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::jobs::{JobStore, StatusUpdate, StoreError};
use crate::merge::selector::Selector;
use crate::merge::InsertionStrategy;
use crate::models::{Job, JobStatus};
use crate::providers::selector::{Urgency, UserTier};
use crate::providers::{
    Capability, CompletionMode, GenerationOutput, GenerationProvider, GenerationRequest,
    Outcome, Placement, ProviderError, ProviderJobState, ProviderRecord, ProviderSelector,
    ProviderStatus, Selection, SelectionCriteria, SelectionError, WebhookHub,
};
use crate::resilience::{
    Classify, ErrorCategory, RateDecision, RateLimiter, RetryError, RetryPolicy,
};

/// Longest free-text instruction accepted from a caller.
const MAX_INSTRUCTION_CHARS: usize = 8_000;
/// Consecutive retryable status-poll failures tolerated before the attempt fails.
const MAX_POLL_ERRORS: u32 = 3;
const EVENT_BUFFER: usize = 32;

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GenerationConfig {
    /// Upper bound for a single `submit` or `status` call.
    pub call_timeout: Duration,
    /// Upper bound for the whole workflow, across every provider.
    pub deadline: Duration,
    pub rate_limit: u32,
    pub rate_window: Duration,
    pub retry: RetryPolicy,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(25),
            deadline: Duration::from_secs(600),
            rate_limit: 5,
            rate_window: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Request body
// ────────────────────────────────────────────────────────────────────────────

/// What a caller asks for. Everything the workflow needs travels in here;
/// nothing is read back from shared storage between steps.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerateBody {
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub placement: Placement,
    #[serde(default)]
    pub options: Value,
    #[serde(default)]
    pub urgency: Urgency,
    #[serde(default)]
    pub user_tier: UserTier,
    #[serde(default)]
    pub quality_threshold: Option<f64>,
}

/// A body that passed validation.
#[derive(Debug, Clone)]
pub struct GenerationPlan {
    pub criteria: SelectionCriteria,
    pub instructions: String,
    pub placement: Placement,
    pub options: Value,
}

impl GenerateBody {
    pub fn validate(self) -> Result<GenerationPlan, GenerationError> {
        if self.capabilities.is_empty() {
            return Err(invalid("at least one capability is required"));
        }
        if self.instructions.chars().count() > MAX_INSTRUCTION_CHARS {
            return Err(invalid(format!(
                "instructions exceed {MAX_INSTRUCTION_CHARS} characters"
            )));
        }
        if let Some(threshold) = self.quality_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(invalid("quality_threshold must be between 0 and 1"));
            }
        }

        let options = match self.options {
            Value::Null => Value::Object(Map::new()),
            Value::Object(map) => Value::Object(map),
            _ => return Err(invalid("options must be a JSON object")),
        };

        let placement = self.placement;
        match (&placement.strategy, placement.target_selector.as_deref()) {
            (InsertionStrategy::Append, None) => {}
            (strategy, None) => {
                return Err(invalid(format!(
                    "{strategy:?} placement needs a target_selector"
                )))
            }
            (_, Some(target)) => {
                Selector::parse(target)
                    .map_err(|e| invalid(format!("bad target_selector '{target}': {e}")))?;
            }
        }

        Ok(GenerationPlan {
            criteria: SelectionCriteria {
                capabilities: self.capabilities.into_iter().collect(),
                quality_threshold: self.quality_threshold,
                urgency: self.urgency,
                user_tier: self.user_tier,
                hour_utc: None,
            },
            instructions: self.instructions.trim().to_string(),
            placement,
            options,
        })
    }
}

fn invalid(message: impl Into<String>) -> GenerationError {
    GenerationError::InvalidRequest(message.into())
}

// ────────────────────────────────────────────────────────────────────────────
// Events and errors
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GenerationEvent {
    Selected {
        provider_id: String,
        fallback_chain: Vec<String>,
        reasoning: Vec<String>,
        last_resort: bool,
    },
    Attempt {
        provider_id: String,
        attempt: u32,
    },
    Skipped {
        provider_id: String,
        reason: String,
    },
    Progress {
        provider_id: String,
        state: ProviderJobState,
        progress: Option<u8>,
    },
    Failover {
        from: String,
        to: Option<String>,
        reason: String,
        #[serde(flatten)]
        category: ErrorCategory,
    },
    FragmentApplied {
        fragment_id: String,
        strategy: Option<InsertionStrategy>,
        fell_back: bool,
        duplicate: bool,
        revision: i64,
    },
    Completed {
        provider_id: String,
        fragments: usize,
        revision: i64,
    },
    Failed {
        reason: String,
        #[serde(flatten)]
        category: ErrorCategory,
        retryable: bool,
    },
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("invalid generation request: {0}")]
    InvalidRequest(String),

    #[error("too many generation requests for job {job_id}, retry in {}s", .retry_after.as_secs().max(1))]
    RateLimited { job_id: Uuid, retry_after: Duration },

    #[error("generation already running for job {0}")]
    AlreadyRunning(Uuid),

    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Classify for GenerationError {
    fn category(&self) -> ErrorCategory {
        match self {
            GenerationError::InvalidRequest(_) | GenerationError::AlreadyRunning(_) => {
                ErrorCategory::Validation
            }
            GenerationError::RateLimited { retry_after, .. } => ErrorCategory::RateLimited {
                retry_after_ms: Some(retry_after.as_millis() as u64),
            },
            GenerationError::Selection(e) => e.category(),
            GenerationError::Store(e) => e.category(),
        }
    }
}

/// Why one provider in the chain was given up on.
#[derive(Debug, Error)]
enum AttemptError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("generation deadline of {}s exceeded", .0.as_secs())]
    Deadline(Duration),

    #[error("circuit for {0} opened between retries")]
    CircuitOpen(String),
}

impl Classify for AttemptError {
    fn category(&self) -> ErrorCategory {
        match self {
            AttemptError::Provider(e) => e.category(),
            AttemptError::Deadline(_) | AttemptError::CircuitOpen(_) => {
                ErrorCategory::ProviderUnavailable
            }
        }
    }
}

/// Event sender that outlives its receiver: a client hanging up does not
/// stop the workflow.
#[derive(Clone)]
struct Events(mpsc::Sender<GenerationEvent>);

impl Events {
    async fn emit(&self, event: GenerationEvent) {
        let _ = self.0.send(event).await;
    }
}

/// Removes the job from the in-flight set when the workflow ends.
struct InFlight {
    jobs: Arc<Mutex<HashSet<Uuid>>>,
    job_id: Uuid,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.job_id);
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Service
// ────────────────────────────────────────────────────────────────────────────

pub struct GenerationService {
    jobs: Arc<dyn JobStore>,
    selector: Arc<ProviderSelector>,
    webhooks: Arc<WebhookHub>,
    config: GenerationConfig,
    limiter: RateLimiter,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
}

impl GenerationService {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        selector: Arc<ProviderSelector>,
        webhooks: Arc<WebhookHub>,
        config: GenerationConfig,
    ) -> Self {
        let limiter = RateLimiter::new(config.rate_limit, config.rate_window);
        Self {
            jobs,
            selector,
            webhooks,
            config,
            limiter,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Starts a workflow for `job_id` and returns its event stream. The stream
    /// ends after a `Completed` or `Failed` event.
    pub async fn request_generation(
        self: &Arc<Self>,
        job_id: Uuid,
        body: GenerateBody,
    ) -> Result<mpsc::Receiver<GenerationEvent>, GenerationError> {
        let mut plan = body.validate()?;
        plan.criteria.hour_utc = Some(Utc::now().hour());

        if let RateDecision::Limited { retry_after } = self.limiter.check(&job_id.to_string()) {
            return Err(GenerationError::RateLimited {
                job_id,
                retry_after,
            });
        }

        let job = self.jobs.fetch(job_id).await?;
        let selection = self.selector.select(&plan.criteria)?;

        let guard = {
            let mut running = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            if !running.insert(job_id) {
                return Err(GenerationError::AlreadyRunning(job_id));
            }
            InFlight {
                jobs: Arc::clone(&self.in_flight),
                job_id,
            }
        };

        info!(
            "Starting generation for job {job_id} via {} ({} fallbacks)",
            selection.provider.id(),
            selection.fallback_chain.len()
        );

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let events = Events(tx);
            service.run(job, plan, selection, &events).await;
            // Release the job before the stream ends so a follow-up request is accepted.
            drop(guard);
        });
        Ok(rx)
    }

    async fn run(&self, job: Job, plan: GenerationPlan, selection: Selection, events: &Events) {
        let job_id = job.id;
        let deadline = Instant::now() + self.config.deadline;

        events
            .emit(GenerationEvent::Selected {
                provider_id: selection.provider.id().to_string(),
                fallback_chain: selection
                    .fallback_chain
                    .iter()
                    .map(|r| r.id().to_string())
                    .collect(),
                reasoning: selection.reasoning.clone(),
                last_resort: selection.last_resort,
            })
            .await;
        self.update_status(job_id, StatusUpdate::new(JobStatus::Generating).progress(5))
            .await;

        let request = GenerationRequest {
            job_id,
            instructions: plan.instructions,
            document_html: job.document.html,
            placement: plan.placement,
            options: plan.options,
        };

        let chain: Vec<&Arc<ProviderRecord>> = selection.chain().collect();
        let mut last_failure: Option<(String, ErrorCategory)> = None;

        for (index, record) in chain.iter().enumerate() {
            let next = chain.get(index + 1).map(|r| r.id().to_string());

            if Instant::now() >= deadline {
                let err = AttemptError::Deadline(self.config.deadline);
                last_failure = Some((err.to_string(), err.category()));
                break;
            }

            if !selection.last_resort && !record.breaker().should_allow_call() {
                debug!("Skipping {} for job {job_id}: circuit open", record.id());
                events
                    .emit(GenerationEvent::Skipped {
                        provider_id: record.id().to_string(),
                        reason: "circuit open".to_string(),
                    })
                    .await;
                last_failure = Some((
                    format!("{} circuit open", record.id()),
                    ErrorCategory::ProviderUnavailable,
                ));
                continue;
            }

            let holds_slot = !selection.last_resort;
            match self.attempt(record, &request, deadline, holds_slot, events).await {
                Ok(output) => {
                    self.finish(record, &request, output, events).await;
                    return;
                }
                Err(err) => {
                    let source = match &err {
                        RetryError::NonRetryable { source, .. } => source,
                        RetryError::Exhausted { source, .. } => source,
                    };
                    let deadline_hit = matches!(source, AttemptError::Deadline(_));
                    let category = source.category();
                    let reason = format!("{}: {err}", record.id());
                    warn!("Generation for job {job_id} failed on {reason}");

                    events
                        .emit(GenerationEvent::Failover {
                            from: record.id().to_string(),
                            to: if deadline_hit { None } else { next },
                            reason: reason.clone(),
                            category,
                        })
                        .await;
                    last_failure = Some((reason, category));
                    if deadline_hit {
                        break;
                    }
                }
            }
        }

        let (reason, category) = last_failure.unwrap_or_else(|| {
            (
                "no provider attempted".to_string(),
                ErrorCategory::ProviderUnavailable,
            )
        });
        self.fail(
            job_id,
            format!("all providers failed; last error: {reason}"),
            category,
            events,
        )
        .await;
    }

    /// Submits to one provider (with retries) and waits for its result.
    /// `holds_slot` says whether the breaker gate admitted this call.
    async fn attempt(
        &self,
        record: &ProviderRecord,
        request: &GenerationRequest,
        deadline: Instant,
        holds_slot: bool,
        events: &Events,
    ) -> Result<GenerationOutput, RetryError<AttemptError>> {
        let operation = format!("generation for job {} via {}", request.job_id, record.id());

        // The chain walk took one breaker slot for this provider; retries reuse it.
        self.config
            .retry
            .run_until(&operation, Some(deadline), move |attempt| async move {
                if Instant::now() >= deadline {
                    if attempt == 1 && holds_slot {
                        record.breaker().release_half_open_slot();
                    }
                    return Err(AttemptError::Deadline(self.config.deadline));
                }
                if attempt > 1 && !record.breaker().permits_retry() {
                    return Err(AttemptError::CircuitOpen(record.id().to_string()));
                }

                events
                    .emit(GenerationEvent::Attempt {
                        provider_id: record.id().to_string(),
                        attempt,
                    })
                    .await;

                let started = Instant::now();
                let result = self
                    .invoke(record.provider().as_ref(), request, deadline, events)
                    .await;
                let latency = started.elapsed();

                match &result {
                    Ok(output) => record.record_outcome(Outcome::success(latency, output.quality)),
                    // A request the provider rejected says nothing about its health.
                    Err(e) if e.category() == ErrorCategory::Validation => {
                        if holds_slot {
                            record.breaker().release_half_open_slot();
                        }
                    }
                    Err(_) => record.record_outcome(Outcome::failure(latency)),
                }
                result.map_err(AttemptError::from)
            })
            .await
    }

    async fn invoke(
        &self,
        provider: &dyn GenerationProvider,
        request: &GenerationRequest,
        deadline: Instant,
        events: &Events,
    ) -> Result<GenerationOutput, ProviderError> {
        let submission = self.call(deadline, provider.submit(request)).await?;
        if let Some(output) = settle(submission.status)? {
            return Ok(output);
        }

        match provider.completion_mode() {
            CompletionMode::Immediate => Err(ProviderError::Parse(
                "immediate provider returned an unfinished job".to_string(),
            )),
            CompletionMode::Polling { interval } => {
                self.poll(
                    provider,
                    request.job_id,
                    &submission.provider_job_id,
                    interval,
                    deadline,
                    events,
                )
                .await
            }
            CompletionMode::Webhook => {
                self.await_webhook(provider, &submission.provider_job_id, deadline)
                    .await
            }
        }
    }

    async fn call<T, F>(&self, deadline: Instant, call: F) -> Result<T, ProviderError>
    where
        F: Future<Output = Result<T, ProviderError>>,
    {
        let limit = (Instant::now() + self.config.call_timeout).min(deadline);
        match tokio::time::timeout_at(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(self.config.call_timeout)),
        }
    }

    async fn poll(
        &self,
        provider: &dyn GenerationProvider,
        job_id: Uuid,
        provider_job_id: &str,
        interval: Duration,
        deadline: Instant,
        events: &Events,
    ) -> Result<GenerationOutput, ProviderError> {
        let mut poll_errors = 0;
        let mut last_seen: Option<(ProviderJobState, Option<u8>)> = None;

        loop {
            tokio::time::sleep_until((Instant::now() + interval).min(deadline)).await;
            if Instant::now() >= deadline {
                return Err(ProviderError::Timeout(self.config.deadline));
            }

            let status = match self.call(deadline, provider.status(provider_job_id)).await {
                Ok(status) => {
                    poll_errors = 0;
                    status
                }
                Err(err) if err.category().is_retryable() && poll_errors < MAX_POLL_ERRORS => {
                    poll_errors += 1;
                    debug!("Status poll {poll_errors} for {provider_job_id} failed: {err}");
                    continue;
                }
                Err(err) => return Err(err),
            };

            let seen = (status.state, status.progress);
            if let Some(output) = settle(status)? {
                return Ok(output);
            }
            if last_seen != Some(seen) {
                last_seen = Some(seen);
                events
                    .emit(GenerationEvent::Progress {
                        provider_id: provider.id().to_string(),
                        state: seen.0,
                        progress: seen.1,
                    })
                    .await;
                if let Some(progress) = seen.1 {
                    // Provider progress maps onto 10..=90 of the job.
                    let scaled = 10 + (u32::from(progress.min(100)) * 80 / 100) as u8;
                    self.update_status(
                        job_id,
                        StatusUpdate::new(JobStatus::Generating).progress(scaled),
                    )
                    .await;
                }
            }
        }
    }

    async fn await_webhook(
        &self,
        provider: &dyn GenerationProvider,
        provider_job_id: &str,
        deadline: Instant,
    ) -> Result<GenerationOutput, ProviderError> {
        let completion = self.webhooks.register(provider.id(), provider_job_id);
        match tokio::time::timeout_at(deadline, completion).await {
            Ok(Ok(status)) => settle(status)?.ok_or_else(|| {
                ProviderError::Parse("webhook reported an unfinished job".to_string())
            }),
            Ok(Err(_)) => Err(ProviderError::JobFailed(
                "webhook registration dropped".to_string(),
            )),
            Err(_) => {
                self.webhooks.cancel(provider.id(), provider_job_id);
                Err(ProviderError::Timeout(self.config.deadline))
            }
        }
    }

    async fn finish(
        &self,
        record: &ProviderRecord,
        request: &GenerationRequest,
        output: GenerationOutput,
        events: &Events,
    ) {
        let job_id = request.job_id;
        let fragments = output.into_fragments(request);
        let count = fragments.len();

        for fragment in &fragments {
            match self.jobs.apply_fragment(job_id, fragment).await {
                Ok((job, outcome)) => {
                    events
                        .emit(GenerationEvent::FragmentApplied {
                            fragment_id: fragment.id.clone(),
                            strategy: outcome.applied,
                            fell_back: outcome.fell_back,
                            duplicate: outcome.is_duplicate(),
                            revision: job.revision,
                        })
                        .await;
                }
                Err(e) => {
                    let category = e.category();
                    self.fail(
                        job_id,
                        format!("could not merge fragment {}: {e}", fragment.id),
                        category,
                        events,
                    )
                    .await;
                    return;
                }
            }
        }

        match self
            .jobs
            .set_status(job_id, StatusUpdate::new(JobStatus::Completed).progress(100))
            .await
        {
            Ok(job) => {
                info!(
                    "Generation for job {job_id} completed via {} ({count} fragments)",
                    record.id()
                );
                events
                    .emit(GenerationEvent::Completed {
                        provider_id: record.id().to_string(),
                        fragments: count,
                        revision: job.revision,
                    })
                    .await;
            }
            Err(e) => {
                let category = e.category();
                self.fail(job_id, format!("could not complete job: {e}"), category, events)
                    .await;
            }
        }
    }

    async fn fail(&self, job_id: Uuid, reason: String, category: ErrorCategory, events: &Events) {
        warn!("Generation for job {job_id} failed: {reason}");
        self.update_status(
            job_id,
            StatusUpdate::new(JobStatus::Failed).error(reason.clone()),
        )
        .await;
        events
            .emit(GenerationEvent::Failed {
                reason,
                category,
                // Credential failures need an operator, not another request.
                retryable: !matches!(
                    category,
                    ErrorCategory::Validation | ErrorCategory::Authentication
                ),
            })
            .await;
    }

    async fn update_status(&self, job_id: Uuid, update: StatusUpdate) {
        if let Err(e) = self.jobs.set_status(job_id, update).await {
            warn!("Failed to update status of job {job_id}: {e}");
        }
    }
}

/// `Some(output)` for a finished job, `None` while it is still running.
fn settle(status: ProviderStatus) -> Result<Option<GenerationOutput>, ProviderError> {
    match status.state {
        ProviderJobState::Completed => status.output.map(Some).ok_or(ProviderError::EmptyContent),
        ProviderJobState::Failed => Err(ProviderError::JobFailed(
            status.error.unwrap_or_else(|| "no reason given".to_string()),
        )),
        ProviderJobState::Pending | ProviderJobState::Processing => Ok(None),
    }
}
