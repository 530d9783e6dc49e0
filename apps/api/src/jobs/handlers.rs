//! Axum route handlers for the Jobs API.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, Stream};
use tracing::debug;
use uuid::Uuid;

use crate::errors::AppError;
use crate::jobs::NewJob;
use crate::models::Job;
use crate::state::AppState;
use crate::subscriptions::{ChangeFilter, Notification, ObserveOptions};

/// Longest debounce a client may ask for.
const MAX_DEBOUNCE_MS: u64 = 10_000;
const SSE_BUFFER: usize = 16;

// ────────────────────────────────────────────────────────────────────────────
// Request / Response types
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub debounce_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    pub resource_id: String,
    pub channel_id: u64,
}

// ────────────────────────────────────────────────────────────────────────────
// Handlers
// ────────────────────────────────────────────────────────────────────────────

/// POST /api/v1/jobs
///
/// Creates a job around a base CV document.
pub async fn handle_create_job(
    State(state): State<AppState>,
    Json(request): Json<NewJob>,
) -> Result<(StatusCode, Json<Job>), AppError> {
    if request.document_html.trim().is_empty() {
        return Err(AppError::Validation(
            "document_html cannot be empty".to_string(),
        ));
    }

    let job = state.jobs.create(request).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

/// GET /api/v1/jobs/:id
///
/// Served from the live snapshot when the job is being observed.
pub async fn handle_get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<Job>, AppError> {
    if let Some(job) = state.registry.snapshot(&job_id.to_string()) {
        return Ok(Json(job.as_ref().clone()));
    }
    Ok(Json(state.jobs.fetch(job_id).await?))
}

/// GET /api/v1/jobs/:id/events?filter=&debounce_ms=
///
/// Streams job changes as SSE. The first event (`subscribed`) says whether
/// the observe call was over the rate limit; then `snapshot`, `change` and
/// `error` events follow.
pub async fn handle_job_events(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    Query(query): Query<EventsQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let filter: ChangeFilter = query
        .filter
        .as_deref()
        .unwrap_or_default()
        .parse()
        .map_err(AppError::Validation)?;
    let debounce = match query.debounce_ms {
        Some(ms) if ms > MAX_DEBOUNCE_MS => {
            return Err(AppError::Validation(format!(
                "debounce_ms cannot exceed {MAX_DEBOUNCE_MS}"
            )))
        }
        Some(ms) => Some(Duration::from_millis(ms)),
        None => None,
    };

    let mut subscription = state
        .registry
        .observe(&job_id.to_string(), ObserveOptions { filter, debounce })?;

    let (tx, rx) = mpsc::channel(SSE_BUFFER);
    let subscribed = Event::default().event("subscribed").data(
        json!({
            "subscription_id": subscription.id(),
            "rate_limited": subscription.rate_limited(),
            "debounce_ms": subscription.debounce().as_millis() as u64,
        })
        .to_string(),
    );
    // The channel is fresh, so the first send cannot fail for lack of room.
    let _ = tx.try_send(Ok(subscribed));

    tokio::spawn(async move {
        loop {
            tokio::select! {
                notification = subscription.recv() => {
                    let Some(notification) = notification else { break };
                    if tx.send(Ok(sse_event(&notification))).await.is_err() {
                        break;
                    }
                }
                _ = tx.closed() => break,
            }
        }
        debug!("SSE client for job {} went away", subscription.resource_id());
        subscription.unsubscribe();
    });

    Ok(Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::default()))
}

/// POST /api/v1/jobs/:id/refresh
///
/// Tears down and reopens the job's upstream, clearing a degraded state.
pub async fn handle_refresh(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<RefreshResponse>, AppError> {
    let resource_id = job_id.to_string();
    let channel_id = state.registry.force_refresh(&resource_id)?;
    Ok(Json(RefreshResponse {
        resource_id,
        channel_id,
    }))
}

fn sse_event(notification: &Notification) -> Event {
    let (name, data) = payload(notification);
    match data {
        Ok(data) => Event::default().event(name).data(data),
        Err(e) => Event::default().event("error").data(e.to_string()),
    }
}

fn payload(notification: &Notification) -> (&'static str, serde_json::Result<String>) {
    match notification {
        Notification::Initial(job) => ("snapshot", serde_json::to_string(&job.as_deref())),
        Notification::Change(job) => ("change", serde_json::to_string(job.as_ref())),
        Notification::Error(failure) => ("error", serde_json::to_string(failure)),
    }
}
