use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::AppState;

/// GET /health
/// Returns service status, version and subscription registry stats.
pub async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    let stats = state.registry.stats();
    let status = if stats.degraded > 0 { "degraded" } else { "ok" };
    Json(json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "service": "cvplus-sync",
        "subscriptions": stats,
        "pending_webhooks": state.webhooks.pending()
    }))
}
