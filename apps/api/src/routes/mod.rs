pub mod health;

use std::future::Future;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::generation::handlers as generation;
use crate::jobs::handlers as jobs;
use crate::providers::handlers as providers;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        // Jobs API
        .route("/api/v1/jobs", post(jobs::handle_create_job))
        .route("/api/v1/jobs/:id", get(jobs::handle_get_job))
        .route("/api/v1/jobs/:id/events", get(jobs::handle_job_events))
        .route("/api/v1/jobs/:id/refresh", post(jobs::handle_refresh))
        // Generation API
        .route("/api/v1/jobs/:id/generate", post(generation::handle_generate))
        // Providers
        .route(
            "/api/v1/webhooks/:provider_id",
            post(providers::handle_webhook),
        )
        .route(
            "/api/v1/providers/health",
            get(providers::handle_providers_health),
        )
        .with_state(state)
}

/// Serves the API until `signal` resolves.
///
/// The subscription registry is closed as soon as the signal fires: open
/// `/events` streams only end when their subscription does, and the
/// connection drain waits for them.
pub async fn serve<F>(listener: TcpListener, state: AppState, signal: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let registry = state.registry.clone();
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            signal.await;
            info!("Shutdown signal received, closing subscriptions");
            registry.shutdown();
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::generation::{GenerationConfig, GenerationService};
    use crate::jobs::memory::MemoryJobStore;
    use crate::providers::scripted::ScriptedProvider;
    use crate::providers::{ProviderRecord, ProviderSelector, WebhookHub};
    use crate::resilience::{CircuitBreakerConfig, CircuitBreakerRegistry, RetryPolicy};
    use crate::subscriptions::memory::MemorySource;
    use crate::subscriptions::{SubscriptionConfig, SubscriptionRegistry};

    fn test_state() -> AppState {
        let jobs = Arc::new(MemoryJobStore::new());
        let breakers = CircuitBreakerRegistry::new(CircuitBreakerConfig::default());
        let selector = Arc::new(ProviderSelector::new(vec![Arc::new(ProviderRecord::new(
            Arc::new(ScriptedProvider::text("claude")),
            1,
            0.01,
            breakers.breaker("claude"),
        ))]));
        let webhooks = Arc::new(WebhookHub::new());
        let generation = Arc::new(GenerationService::new(
            jobs.clone(),
            selector.clone(),
            webhooks.clone(),
            GenerationConfig::default(),
        ));
        AppState {
            jobs,
            registry: Arc::new(SubscriptionRegistry::new(
                Arc::new(MemorySource::new()),
                SubscriptionConfig::default(),
                RetryPolicy::default(),
            )),
            generation,
            selector,
            webhooks,
        }
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_registry_stats() {
        let app = build_router(test_state());
        let (status, body) = send(app, Request::get("/health").body(Body::empty()).unwrap()).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["subscriptions"]["upstreams"], 0);
    }

    #[tokio::test]
    async fn test_create_then_fetch_job() {
        let app = build_router(test_state());
        let (status, created) = send(
            app.clone(),
            post_json(
                "/api/v1/jobs",
                json!({ "document_html": "<html><body></body></html>" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["status"], "created");

        let uri = format!("/api/v1/jobs/{}", created["id"].as_str().unwrap());
        let (status, fetched) = send(app, Request::get(uri).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["id"], created["id"]);
    }

    #[tokio::test]
    async fn test_empty_document_is_rejected() {
        let app = build_router(test_state());
        let (status, body) = send(
            app,
            post_json("/api/v1/jobs", json!({ "document_html": "  " })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_refresh_of_unobserved_job_is_not_found() {
        let app = build_router(test_state());
        let uri = format!("/api/v1/jobs/{}/refresh", uuid::Uuid::new_v4());
        let (status, _) = send(app, Request::post(uri).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_webhook_for_unknown_provider_is_not_found() {
        let app = build_router(test_state());
        let (status, _) = send(app, post_json("/api/v1/webhooks/nobody", json!({}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_webhook_is_buffered_until_a_workflow_waits() {
        let state = test_state();
        let webhooks = state.webhooks.clone();
        let app = build_router(state);

        let (status, body) = send(
            app,
            post_json("/api/v1/webhooks/claude", json!({ "job": "claude-job-7" })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["delivered"], false);
        assert_eq!(webhooks.pending(), 0);
    }

    #[tokio::test]
    async fn test_providers_health_lists_breakers() {
        let app = build_router(test_state());
        let (status, body) = send(
            app,
            Request::get("/api/v1/providers/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["id"], "claude");
        assert_eq!(body[0]["circuit"]["state"], "closed");
    }

    #[tokio::test]
    async fn test_shutdown_ends_open_event_streams() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(serve(listener, test_state(), async move {
            let _ = stop_rx.await;
        }));

        let url = format!(
            "http://{addr}/api/v1/jobs/{}/events",
            uuid::Uuid::new_v4()
        );
        let mut response = reqwest::get(url).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let first = response.chunk().await.unwrap().unwrap();
        assert!(String::from_utf8_lossy(&first).contains("subscribed"));

        stop_tx.send(()).unwrap();
        let stopped = tokio::time::timeout(std::time::Duration::from_secs(5), server).await;
        assert!(
            matches!(stopped, Ok(Ok(Ok(())))),
            "server kept running with an open event stream"
        );
        drop(response);
    }
}
