//! Axum route handler for the Generation API.

use std::convert::Infallible;

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use tokio_stream::{wrappers::ReceiverStream, Stream, StreamExt};
use uuid::Uuid;

use crate::errors::AppError;
use crate::generation::service::{GenerateBody, GenerationEvent};
use crate::state::AppState;

/// POST /api/v1/jobs/:id/generate
///
/// Starts a generation workflow and streams its events as SSE. The stream
/// closes after a `completed` or `failed` event; the workflow keeps running
/// if the client disconnects early.
pub async fn handle_generate(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    Json(body): Json<GenerateBody>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let events = state.generation.request_generation(job_id, body).await?;
    let stream = ReceiverStream::new(events).map(|event| Ok(sse_event(&event)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn event_name(event: &GenerationEvent) -> &'static str {
    match event {
        GenerationEvent::Selected { .. } => "selected",
        GenerationEvent::Attempt { .. } => "attempt",
        GenerationEvent::Skipped { .. } => "skipped",
        GenerationEvent::Progress { .. } => "progress",
        GenerationEvent::Failover { .. } => "failover",
        GenerationEvent::FragmentApplied { .. } => "fragment_applied",
        GenerationEvent::Completed { .. } => "completed",
        GenerationEvent::Failed { .. } => "failed",
    }
}

fn sse_event(event: &GenerationEvent) -> Event {
    Event::default()
        .event(event_name(event))
        .json_data(event)
        .unwrap_or_else(|e| Event::default().event("error").data(e.to_string()))
}
