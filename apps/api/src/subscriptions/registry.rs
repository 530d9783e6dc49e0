//! Shared upstream subscriptions keyed by resource id.
//!
//! Every resource has at most one upstream change stream no matter how many
//! consumers observe it. Consumers hold a [`Subscription`]; dropping the last
//! one schedules the upstream for teardown after a grace period, and an
//! `observe` inside that window picks the same upstream back up.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::delivery::{run_delivery, Notification, SubscriptionFailure};
use super::filter::ChangeFilter;
use super::source::{ChangeSource, ChangeStream, SourceError};
use crate::models::Job;
use crate::resilience::{Classify, ErrorCategory, RateDecision, RateLimiter, RetryPolicy};

#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    pub grace_period: Duration,
    pub default_debounce: Duration,
    pub connect_timeout: Duration,
    /// Observe calls allowed per resource within `rate_window`.
    pub rate_limit: u32,
    pub rate_window: Duration,
    /// Capacity of each consumer's delivery channel.
    pub delivery_buffer: usize,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(30),
            default_debounce: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(5),
            rate_limit: 10,
            rate_window: Duration::from_secs(60),
            delivery_buffer: 64,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ObserveOptions {
    pub filter: ChangeFilter,
    /// Falls back to `SubscriptionConfig::default_debounce`.
    pub debounce: Option<Duration>,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid resource id '{0}'")]
    InvalidResourceId(String),

    #[error("'{0}' is not being observed")]
    NotObserved(String),

    #[error("subscription registry is shut down")]
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamStatus {
    Connecting,
    Live,
    Reconnecting,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpstreamInfo {
    pub channel_id: u64,
    pub status: UpstreamStatus,
    pub handles: usize,
    pub teardown_pending: bool,
    pub revision: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryStats {
    pub upstreams: usize,
    pub live: usize,
    pub degraded: usize,
    pub handles: usize,
    pub pending_teardown: usize,
}

// ────────────────────────────────────────────────────────────────────────────
// Internal state
// ────────────────────────────────────────────────────────────────────────────

struct Sink {
    filter: ChangeFilter,
    tx: mpsc::UnboundedSender<Notification>,
}

struct Upstream {
    channel_id: u64,
    status: UpstreamStatus,
    snapshot: Option<Arc<Job>>,
    last_failure: Option<SubscriptionFailure>,
    sinks: HashMap<u64, Sink>,
    cancel: CancellationToken,
    teardown_pending: bool,
    teardown_epoch: u64,
}

impl Upstream {
    fn new(channel_id: u64, cancel: CancellationToken) -> Self {
        Self {
            channel_id,
            status: UpstreamStatus::Connecting,
            snapshot: None,
            last_failure: None,
            sinks: HashMap::new(),
            cancel,
            teardown_pending: false,
            teardown_epoch: 0,
        }
    }

    fn info(&self) -> UpstreamInfo {
        UpstreamInfo {
            channel_id: self.channel_id,
            status: self.status,
            handles: self.sinks.len(),
            teardown_pending: self.teardown_pending,
            revision: self.snapshot.as_ref().map(|job| job.revision),
        }
    }
}

#[derive(Default)]
struct RegistryState {
    upstreams: HashMap<String, Upstream>,
    next_handle_id: u64,
    next_channel_id: u64,
    closed: bool,
}

struct Shared {
    source: Arc<dyn ChangeSource>,
    config: SubscriptionConfig,
    retry: RetryPolicy,
    limiter: RateLimiter,
    state: Mutex<RegistryState>,
    shutdown: CancellationToken,
}

// ────────────────────────────────────────────────────────────────────────────
// Registry
// ────────────────────────────────────────────────────────────────────────────

pub struct SubscriptionRegistry {
    shared: Arc<Shared>,
}

impl SubscriptionRegistry {
    pub fn new(
        source: Arc<dyn ChangeSource>,
        config: SubscriptionConfig,
        retry: RetryPolicy,
    ) -> Self {
        let limiter = RateLimiter::new(config.rate_limit, config.rate_window);
        Self {
            shared: Arc::new(Shared {
                source,
                config,
                retry,
                limiter,
                state: Mutex::new(RegistryState::default()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Registers a consumer for `resource_id`. Must be called inside a Tokio
    /// runtime.
    ///
    /// The first notification on the returned subscription is always
    /// [`Notification::Initial`] carrying the cached snapshot. Calls beyond the
    /// per-resource rate limit are still registered but flagged via
    /// [`Subscription::rate_limited`].
    pub fn observe(
        &self,
        resource_id: &str,
        options: ObserveOptions,
    ) -> Result<Subscription, RegistryError> {
        let resource_id = resource_id.trim();
        if resource_id.is_empty() {
            return Err(RegistryError::InvalidResourceId(resource_id.to_string()));
        }
        let shared = &self.shared;

        let rate_limited = match shared.limiter.check(resource_id) {
            RateDecision::Allowed { .. } => false,
            RateDecision::Limited { retry_after } => {
                warn!(
                    "observe rate limit exceeded for {resource_id}, capacity returns in {}ms",
                    retry_after.as_millis()
                );
                true
            }
        };

        let debounce = options.debounce.unwrap_or(shared.config.default_debounce);
        let (sink_tx, sink_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::channel(shared.config.delivery_buffer.max(1));

        let mut spawn_upstream = None;
        let handle_id = {
            let mut state = shared.lock();
            if state.closed {
                return Err(RegistryError::ShuttingDown);
            }
            state.next_handle_id += 1;
            let handle_id = state.next_handle_id;

            let RegistryState {
                upstreams,
                next_channel_id,
                ..
            } = &mut *state;
            let upstream = upstreams.entry(resource_id.to_string()).or_insert_with(|| {
                *next_channel_id += 1;
                let cancel = shared.shutdown.child_token();
                spawn_upstream = Some((*next_channel_id, cancel.clone()));
                Upstream::new(*next_channel_id, cancel)
            });

            if upstream.teardown_pending {
                upstream.teardown_pending = false;
                upstream.teardown_epoch += 1;
                debug!(
                    "reusing upstream {} for {resource_id} within grace period",
                    upstream.channel_id
                );
            }

            // Queued under the lock so nothing from fan-out can overtake it.
            let _ = sink_tx.send(Notification::Initial(upstream.snapshot.clone()));
            if let Some(failure) = &upstream.last_failure {
                let _ = sink_tx.send(Notification::Error(failure.clone()));
            }
            upstream.sinks.insert(
                handle_id,
                Sink {
                    filter: options.filter,
                    tx: sink_tx,
                },
            );
            handle_id
        };

        tokio::spawn(run_delivery(sink_rx, out_tx, debounce));

        if let Some((channel_id, cancel)) = spawn_upstream {
            info!("opening upstream {channel_id} for {resource_id}");
            tokio::spawn(run_upstream(
                Arc::clone(shared),
                resource_id.to_string(),
                channel_id,
                cancel,
            ));
        }

        Ok(Subscription {
            id: handle_id,
            resource_id: resource_id.to_string(),
            rx: out_rx,
            registry: Arc::downgrade(shared),
            rate_limited,
            debounce,
            created_at: Utc::now(),
        })
    }

    /// Reopens the upstream for `resource_id` under a new channel id. Registered
    /// handles are kept. This is the only way out of `Degraded`.
    pub fn force_refresh(&self, resource_id: &str) -> Result<u64, RegistryError> {
        let resource_id = resource_id.trim();
        let shared = &self.shared;

        let (channel_id, cancel) = {
            let mut state = shared.lock();
            if state.closed {
                return Err(RegistryError::ShuttingDown);
            }
            let RegistryState {
                upstreams,
                next_channel_id,
                ..
            } = &mut *state;
            let upstream = upstreams
                .get_mut(resource_id)
                .ok_or_else(|| RegistryError::NotObserved(resource_id.to_string()))?;

            upstream.cancel.cancel();
            *next_channel_id += 1;
            upstream.channel_id = *next_channel_id;
            upstream.cancel = shared.shutdown.child_token();
            upstream.status = UpstreamStatus::Connecting;
            upstream.last_failure = None;
            (upstream.channel_id, upstream.cancel.clone())
        };

        info!("force refresh of {resource_id}, reopening as upstream {channel_id}");
        tokio::spawn(run_upstream(
            Arc::clone(shared),
            resource_id.to_string(),
            channel_id,
            cancel,
        ));
        Ok(channel_id)
    }

    pub fn snapshot(&self, resource_id: &str) -> Option<Arc<Job>> {
        let state = self.shared.lock();
        state
            .upstreams
            .get(resource_id.trim())
            .and_then(|upstream| upstream.snapshot.clone())
    }

    pub fn status(&self, resource_id: &str) -> Option<UpstreamStatus> {
        let state = self.shared.lock();
        state.upstreams.get(resource_id.trim()).map(|u| u.status)
    }

    pub fn upstream_info(&self, resource_id: &str) -> Option<UpstreamInfo> {
        let state = self.shared.lock();
        state.upstreams.get(resource_id.trim()).map(Upstream::info)
    }

    pub fn stats(&self) -> RegistryStats {
        let state = self.shared.lock();
        state
            .upstreams
            .values()
            .fold(RegistryStats::default(), |mut stats, upstream| {
                stats.upstreams += 1;
                stats.handles += upstream.sinks.len();
                match upstream.status {
                    UpstreamStatus::Live => stats.live += 1,
                    UpstreamStatus::Degraded => stats.degraded += 1,
                    _ => {}
                }
                if upstream.teardown_pending {
                    stats.pending_teardown += 1;
                }
                stats
            })
    }

    /// Closes every upstream and delivery channel. Later `observe` calls fail
    /// with [`RegistryError::ShuttingDown`].
    pub fn shutdown(&self) {
        let drained: Vec<(String, Upstream)> = {
            let mut state = self.shared.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.upstreams.drain().collect()
        };

        self.shared.shutdown.cancel();
        info!(
            "subscription registry shut down, closed {} upstreams",
            drained.len()
        );
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Subscription handle
// ────────────────────────────────────────────────────────────────────────────

/// A consumer's view of one resource. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    resource_id: String,
    rx: mpsc::Receiver<Notification>,
    registry: Weak<Shared>,
    rate_limited: bool,
    debounce: Duration,
    created_at: DateTime<Utc>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    pub fn rate_limited(&self) -> bool {
        self.rate_limited
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// `None` once the registry has shut down.
    pub async fn recv(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Notification> {
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.registry.upgrade() {
            Shared::release(&shared, &self.resource_id, self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("resource_id", &self.resource_id)
            .field("rate_limited", &self.rate_limited)
            .field("debounce", &self.debounce)
            .finish()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Shared state transitions
// ────────────────────────────────────────────────────────────────────────────

impl Shared {
    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns false when `channel_id` no longer owns the upstream.
    fn set_status(&self, resource_id: &str, channel_id: u64, status: UpstreamStatus) -> bool {
        let mut state = self.lock();
        match state.upstreams.get_mut(resource_id) {
            Some(upstream) if upstream.channel_id == channel_id => {
                upstream.status = status;
                if status == UpstreamStatus::Live {
                    upstream.last_failure = None;
                }
                true
            }
            _ => false,
        }
    }

    fn publish(&self, resource_id: &str, channel_id: u64, job: Job) -> bool {
        let mut state = self.lock();
        let Some(upstream) = state
            .upstreams
            .get_mut(resource_id)
            .filter(|u| u.channel_id == channel_id)
        else {
            return false;
        };

        if let Some(previous) = &upstream.snapshot {
            if job.revision <= previous.revision {
                debug!(
                    "dropping duplicate change for {resource_id} at revision {}",
                    job.revision
                );
                return true;
            }
        }

        let job = Arc::new(job);
        let previous = upstream.snapshot.replace(Arc::clone(&job));
        for sink in upstream.sinks.values() {
            if sink.filter.matches(previous.as_deref(), &job) {
                let _ = sink.tx.send(Notification::Change(Arc::clone(&job)));
            }
        }
        true
    }

    fn degrade(
        &self,
        resource_id: &str,
        channel_id: u64,
        err: &SourceError,
        category: ErrorCategory,
        attempts: u32,
    ) {
        let failure = SubscriptionFailure {
            resource_id: resource_id.to_string(),
            reason: err.to_string(),
            category,
            attempts,
            degraded: true,
        };

        {
            let mut state = self.lock();
            let Some(upstream) = state
                .upstreams
                .get_mut(resource_id)
                .filter(|u| u.channel_id == channel_id)
            else {
                return;
            };
            upstream.status = UpstreamStatus::Degraded;
            for sink in upstream.sinks.values() {
                let _ = sink.tx.send(Notification::Error(failure.clone()));
            }
            upstream.last_failure = Some(failure);
        }

        error!(
            "upstream {channel_id} for {resource_id} degraded after {attempts} attempts ({}): {err}",
            category.label()
        );
    }

    fn release(shared: &Arc<Shared>, resource_id: &str, handle_id: u64) {
        let epoch = {
            let mut state = shared.lock();
            let Some(upstream) = state.upstreams.get_mut(resource_id) else {
                return;
            };
            if upstream.sinks.remove(&handle_id).is_none() || !upstream.sinks.is_empty() {
                return;
            }
            upstream.teardown_pending = true;
            upstream.teardown_epoch += 1;
            upstream.teardown_epoch
        };

        let grace = shared.config.grace_period;
        debug!(
            "last handle for {resource_id} released, tearing down in {}s",
            grace.as_secs()
        );

        match Handle::try_current() {
            Ok(runtime) => {
                let weak = Arc::downgrade(shared);
                let shutdown = shared.shutdown.clone();
                let resource_id = resource_id.to_string();
                runtime.spawn(async move {
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(grace) => {}
                    }
                    if let Some(shared) = weak.upgrade() {
                        shared.teardown(&resource_id, epoch);
                    }
                });
            }
            Err(_) => shared.teardown(resource_id, epoch),
        }
    }

    fn teardown(&self, resource_id: &str, epoch: u64) {
        let removed = {
            let mut state = self.lock();
            let expired = state.upstreams.get(resource_id).is_some_and(|u| {
                u.teardown_pending && u.teardown_epoch == epoch && u.sinks.is_empty()
            });
            if expired {
                state.upstreams.remove(resource_id)
            } else {
                None
            }
        };

        if let Some(upstream) = removed {
            upstream.cancel.cancel();
            info!(
                "closed upstream {} for {resource_id} after grace period",
                upstream.channel_id
            );
            self.limiter.prune();
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Upstream task
// ────────────────────────────────────────────────────────────────────────────

enum PumpEnd {
    Stopped,
    Failed(SourceError),
}

async fn run_upstream(
    shared: Arc<Shared>,
    resource_id: String,
    channel_id: u64,
    cancel: CancellationToken,
) {
    let connect_timeout = shared.config.connect_timeout;
    let max_attempts = shared.retry.max_attempts.max(1);
    let mut failed_attempts = 0u32;

    loop {
        let opened = tokio::select! {
            _ = cancel.cancelled() => return,
            result = tokio::time::timeout(
                connect_timeout,
                shared.source.open_change_stream(&resource_id),
            ) => result.unwrap_or(Err(SourceError::Timeout(connect_timeout))),
        };

        let err = match opened {
            Ok(mut stream) => {
                if !shared.set_status(&resource_id, channel_id, UpstreamStatus::Live) {
                    return;
                }
                debug!("upstream {channel_id} for {resource_id} is live");
                failed_attempts = 0;
                match pump(&shared, &resource_id, channel_id, &cancel, &mut stream).await {
                    PumpEnd::Stopped => return,
                    PumpEnd::Failed(err) => err,
                }
            }
            Err(err) => err,
        };

        failed_attempts += 1;
        let category = err.category();
        if !category.is_retryable() || failed_attempts >= max_attempts {
            shared.degrade(&resource_id, channel_id, &err, category, failed_attempts);
            return;
        }

        let delay = shared.retry.delay_for(failed_attempts, category);
        warn!(
            "upstream {channel_id} for {resource_id} failed ({}), attempt {failed_attempts}/{max_attempts}, reconnecting in {}ms: {err}",
            category.label(),
            delay.as_millis()
        );
        if !shared.set_status(&resource_id, channel_id, UpstreamStatus::Reconnecting) {
            return;
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn pump(
    shared: &Shared,
    resource_id: &str,
    channel_id: u64,
    cancel: &CancellationToken,
    stream: &mut ChangeStream,
) -> PumpEnd {
    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => return PumpEnd::Stopped,
            item = stream.next() => item,
        };
        match item {
            Some(Ok(job)) => {
                if !shared.publish(resource_id, channel_id, job) {
                    return PumpEnd::Stopped;
                }
            }
            Some(Err(err)) => return PumpEnd::Failed(err),
            None => return PumpEnd::Failed(SourceError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobStatus;
    use crate::resilience::BackoffStrategy;
    use crate::subscriptions::memory::{test_job, MemorySource};
    use uuid::Uuid;

    fn retry() -> RetryPolicy {
        RetryPolicy {
            strategy: BackoffStrategy::Exponential,
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            jitter: 0.0,
        }
    }

    fn config() -> SubscriptionConfig {
        SubscriptionConfig {
            default_debounce: Duration::ZERO,
            ..SubscriptionConfig::default()
        }
    }

    fn setup() -> (Arc<MemorySource>, SubscriptionRegistry, Uuid) {
        let source = Arc::new(MemorySource::new());
        let registry = SubscriptionRegistry::new(source.clone(), config(), retry());
        (source, registry, Uuid::new_v4())
    }

    async fn next(sub: &mut Subscription) -> Notification {
        tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .expect("timed out waiting for notification")
            .expect("subscription closed")
    }

    async fn expect_initial(sub: &mut Subscription) -> Option<Arc<Job>> {
        match next(sub).await {
            Notification::Initial(snapshot) => snapshot,
            other => panic!("expected initial, got {other:?}"),
        }
    }

    async fn expect_change(sub: &mut Subscription) -> Arc<Job> {
        match next(sub).await {
            Notification::Change(job) => job,
            other => panic!("expected change, got {other:?}"),
        }
    }

    async fn expect_error(sub: &mut Subscription) -> SubscriptionFailure {
        match next(sub).await {
            Notification::Error(failure) => failure,
            other => panic!("expected error, got {other:?}"),
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_observe_opens_one_upstream() {
        let (source, registry, id) = setup();
        let registry = Arc::new(registry);
        let key = id.to_string();

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let key = key.clone();
                tokio::spawn(async move { registry.observe(&key, ObserveOptions::default()) })
            })
            .collect();

        let mut subs = Vec::new();
        for task in tasks {
            subs.push(task.await.unwrap().unwrap());
        }

        source.wait_for_feed(&key).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(source.opens(), 1);
        let stats = registry.stats();
        assert_eq!(stats.upstreams, 1);
        assert_eq!(stats.handles, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fan_out_delivers_every_change_in_order() {
        let (source, registry, id) = setup();
        let key = id.to_string();

        let mut subs: Vec<_> = (0..3)
            .map(|_| registry.observe(&key, ObserveOptions::default()).unwrap())
            .collect();
        source.wait_for_feed(&key).await;

        for revision in 1..=3 {
            source
                .emit(&key, test_job(id, revision, JobStatus::Processing))
                .await;
        }

        for sub in &mut subs {
            assert!(expect_initial(sub).await.is_none());
            for revision in 1..=3 {
                assert_eq!(expect_change(sub).await.revision, revision);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_observer_receives_cached_snapshot_first() {
        let (source, registry, id) = setup();
        let key = id.to_string();

        let mut first = registry.observe(&key, ObserveOptions::default()).unwrap();
        source.wait_for_feed(&key).await;
        source.emit(&key, test_job(id, 1, JobStatus::Created)).await;
        expect_initial(&mut first).await;
        expect_change(&mut first).await;

        let mut late = registry.observe(&key, ObserveOptions::default()).unwrap();
        let snapshot = expect_initial(&mut late).await.expect("cached snapshot");
        assert_eq!(snapshot.revision, 1);
        assert_eq!(registry.snapshot(&key).unwrap().revision, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_delivers_last_change_in_window() {
        let (source, registry, id) = setup();
        let key = id.to_string();

        let mut sub = registry
            .observe(
                &key,
                ObserveOptions {
                    debounce: Some(Duration::from_millis(100)),
                    ..ObserveOptions::default()
                },
            )
            .unwrap();
        source.wait_for_feed(&key).await;
        assert!(expect_initial(&mut sub).await.is_none());

        for revision in 1..=3 {
            source
                .emit(&key, test_job(id, revision, JobStatus::Processing))
                .await;
        }
        assert_eq!(expect_change(&mut sub).await.revision, 3);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_filter_skips_irrelevant_changes() {
        let (source, registry, id) = setup();
        let key = id.to_string();

        let mut status_only = registry
            .observe(
                &key,
                ObserveOptions {
                    filter: ChangeFilter::Status,
                    ..ObserveOptions::default()
                },
            )
            .unwrap();
        let mut everything = registry.observe(&key, ObserveOptions::default()).unwrap();
        source.wait_for_feed(&key).await;

        let mut progressed = test_job(id, 2, JobStatus::Processing);
        progressed.progress = 50;
        source.emit(&key, test_job(id, 1, JobStatus::Processing)).await;
        source.emit(&key, progressed).await;
        source.emit(&key, test_job(id, 3, JobStatus::Completed)).await;

        expect_initial(&mut status_only).await;
        assert_eq!(expect_change(&mut status_only).await.revision, 1);
        assert_eq!(expect_change(&mut status_only).await.revision, 3);

        expect_initial(&mut everything).await;
        for revision in 1..=3 {
            assert_eq!(expect_change(&mut everything).await.revision, revision);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_revisions_are_dropped() {
        let (source, registry, id) = setup();
        let key = id.to_string();

        let mut sub = registry.observe(&key, ObserveOptions::default()).unwrap();
        source.wait_for_feed(&key).await;
        expect_initial(&mut sub).await;

        source.emit(&key, test_job(id, 1, JobStatus::Created)).await;
        source.emit(&key, test_job(id, 1, JobStatus::Created)).await;
        source.emit(&key, test_job(id, 2, JobStatus::Processing)).await;

        assert_eq!(expect_change(&mut sub).await.revision, 1);
        assert_eq!(expect_change(&mut sub).await.revision, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_stops_delivery_immediately() {
        let (source, registry, id) = setup();
        let key = id.to_string();

        let leaving = registry.observe(&key, ObserveOptions::default()).unwrap();
        let mut staying = registry.observe(&key, ObserveOptions::default()).unwrap();
        source.wait_for_feed(&key).await;

        leaving.unsubscribe();
        assert_eq!(registry.stats().handles, 1);

        source.emit(&key, test_job(id, 1, JobStatus::Created)).await;
        expect_initial(&mut staying).await;
        assert_eq!(expect_change(&mut staying).await.revision, 1);
        assert_eq!(source.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_period_reuses_upstream_then_tears_down() {
        let (source, registry, id) = setup();
        let key = id.to_string();

        let sub = registry.observe(&key, ObserveOptions::default()).unwrap();
        source.wait_for_feed(&key).await;
        let channel_id = registry.upstream_info(&key).unwrap().channel_id;

        drop(sub);
        assert!(registry.upstream_info(&key).unwrap().teardown_pending);

        tokio::time::sleep(Duration::from_secs(10)).await;
        let mut again = registry.observe(&key, ObserveOptions::default()).unwrap();
        let info = registry.upstream_info(&key).unwrap();
        assert_eq!(info.channel_id, channel_id);
        assert!(!info.teardown_pending);
        assert_eq!(source.opens(), 1);

        source.emit(&key, test_job(id, 1, JobStatus::Created)).await;
        expect_initial(&mut again).await;
        assert_eq!(expect_change(&mut again).await.revision, 1);

        // The first release's timer fires at t=30s and must not tear down.
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(registry.upstream_info(&key).is_some());

        drop(again);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(registry.upstream_info(&key).is_none());
        assert_eq!(source.live_feeds(&key), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_observers_still_share_upstream() {
        let (source, registry, id) = setup();
        let key = id.to_string();

        let mut subs: Vec<_> = (0..15)
            .map(|_| registry.observe(&key, ObserveOptions::default()).unwrap())
            .collect();
        source.wait_for_feed(&key).await;

        let limited: Vec<bool> = subs.iter().map(Subscription::rate_limited).collect();
        assert!(limited[..10].iter().all(|l| !l));
        assert!(limited[10..].iter().all(|l| *l));
        assert_eq!(source.opens(), 1);

        source.emit(&key, test_job(id, 1, JobStatus::Created)).await;
        for sub in &mut subs {
            expect_initial(sub).await;
            assert_eq!(expect_change(sub).await.revision, 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_degrade_until_force_refresh() {
        let (source, registry, id) = setup();
        let key = id.to_string();
        source.fail_always(Some(|| SourceError::Closed));

        let mut sub = registry.observe(&key, ObserveOptions::default()).unwrap();
        expect_initial(&mut sub).await;
        let failure = expect_error(&mut sub).await;
        assert!(failure.degraded);
        assert_eq!(failure.attempts, 3);
        assert_eq!(source.opens(), 3);
        assert_eq!(registry.status(&key), Some(UpstreamStatus::Degraded));

        // Stays degraded without intervention.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(source.opens(), 3);

        source.fail_always(None);
        let old_channel = registry.upstream_info(&key).unwrap().channel_id;
        let new_channel = registry.force_refresh(&key).unwrap();
        assert_ne!(old_channel, new_channel);

        source.wait_for_feed(&key).await;
        settle().await;
        assert_eq!(registry.status(&key), Some(UpstreamStatus::Live));

        source.emit(&key, test_job(id, 1, JobStatus::Created)).await;
        assert_eq!(expect_change(&mut sub).await.revision, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_open_error_degrades_at_once() {
        let (source, registry, id) = setup();
        let key = id.to_string();
        source.fail_next([SourceError::InvalidResourceId(key.clone())]);

        let mut sub = registry.observe(&key, ObserveOptions::default()).unwrap();
        expect_initial(&mut sub).await;
        let failure = expect_error(&mut sub).await;
        assert_eq!(failure.attempts, 1);
        assert_eq!(failure.category, ErrorCategory::Validation);
        assert_eq!(source.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_stream_error_reconnects() {
        let (source, registry, id) = setup();
        let key = id.to_string();

        let mut sub = registry.observe(&key, ObserveOptions::default()).unwrap();
        source.wait_for_feed(&key).await;
        expect_initial(&mut sub).await;
        source.emit(&key, test_job(id, 1, JobStatus::Created)).await;
        assert_eq!(expect_change(&mut sub).await.revision, 1);

        source.break_streams(&key, || SourceError::Closed).await;
        while source.opens() < 2 {
            settle().await;
        }
        source.wait_for_feed(&key).await;
        settle().await;
        assert_eq!(registry.status(&key), Some(UpstreamStatus::Live));

        // A reopened source replays the current row first.
        source.emit(&key, test_job(id, 1, JobStatus::Created)).await;
        source.emit(&key, test_job(id, 2, JobStatus::Processing)).await;
        assert_eq!(expect_change(&mut sub).await.revision, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_subscriptions() {
        let (source, registry, id) = setup();
        let key = id.to_string();

        let mut sub = registry.observe(&key, ObserveOptions::default()).unwrap();
        source.wait_for_feed(&key).await;
        registry.shutdown();

        expect_initial(&mut sub).await;
        assert!(sub.recv().await.is_none());
        assert!(matches!(
            registry.observe(&key, ObserveOptions::default()),
            Err(RegistryError::ShuttingDown)
        ));
        assert_eq!(registry.stats().upstreams, 0);
    }

    #[tokio::test]
    async fn test_blank_resource_id_is_rejected() {
        let (_, registry, _) = setup();
        assert!(matches!(
            registry.observe("   ", ObserveOptions::default()),
            Err(RegistryError::InvalidResourceId(_))
        ));
        assert!(matches!(
            registry.force_refresh("missing"),
            Err(RegistryError::NotObserved(_))
        ));
    }
}
