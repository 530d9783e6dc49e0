use std::sync::Arc;

use crate::generation::GenerationService;
use crate::jobs::JobStore;
use crate::providers::{ProviderSelector, WebhookHub};
use crate::subscriptions::SubscriptionRegistry;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<dyn JobStore>,
    /// One upstream per observed job, shared by every SSE client.
    pub registry: Arc<SubscriptionRegistry>,
    pub generation: Arc<GenerationService>,
    pub selector: Arc<ProviderSelector>,
    pub webhooks: Arc<WebhookHub>,
}
