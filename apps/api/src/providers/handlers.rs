//! Axum route handlers for provider callbacks and the provider dashboard.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::errors::AppError;
use crate::providers::ProviderHealth;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub provider_job_id: String,
    /// False when no workflow was waiting yet; the completion is buffered.
    pub delivered: bool,
}

/// POST /api/v1/webhooks/:provider_id
///
/// Completion callback from an asynchronous provider.
pub async fn handle_webhook(
    State(state): State<AppState>,
    Path(provider_id): Path<String>,
    Json(payload): Json<Value>,
) -> Result<(StatusCode, Json<WebhookAck>), AppError> {
    let record = state
        .selector
        .get(&provider_id)
        .ok_or_else(|| AppError::NotFound(format!("Provider {provider_id} not found")))?;

    let completion = record.provider().parse_webhook(&payload).map_err(|e| {
        warn!("Rejected webhook from {provider_id}: {e}");
        AppError::Validation(e.to_string())
    })?;
    let provider_job_id = completion.provider_job_id.clone();
    let delivered = state.webhooks.complete(&provider_id, completion);
    info!("Webhook from {provider_id} for {provider_job_id} (delivered: {delivered})");

    Ok((
        StatusCode::ACCEPTED,
        Json(WebhookAck {
            provider_job_id,
            delivered,
        }),
    ))
}

/// GET /api/v1/providers/health
///
/// Breaker state, transition log and rolling metrics for every provider.
pub async fn handle_providers_health(State(state): State<AppState>) -> Json<Vec<ProviderHealth>> {
    Json(state.selector.health())
}
