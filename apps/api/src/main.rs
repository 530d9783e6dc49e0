mod config;
mod db;
mod errors;
mod generation;
mod jobs;
mod merge;
mod models;
mod providers;
mod resilience;
mod routes;
mod state;
mod subscriptions;

use anyhow::{Context, Result};
use std::net::SocketAddr;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use std::sync::Arc;

use crate::config::Config;
use crate::db::create_pool;
use crate::generation::GenerationService;
use crate::jobs::PgJobStore;
use crate::providers::claude::ClaudeProvider;
use crate::providers::heygen::HeyGenProvider;
use crate::providers::runway::RunwayProvider;
use crate::providers::{GenerationProvider, ProviderRecord, ProviderSelector, WebhookHub};
use crate::resilience::CircuitBreakerRegistry;
use crate::state::AppState;
use crate::subscriptions::{PgChangeSource, SubscriptionRegistry};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing or malformed env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_PKG_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting CVPlus sync service v{}", env!("CARGO_PKG_VERSION"));

    // Initialize PostgreSQL (runs migrations)
    let db = create_pool(&config.database_url).await?;

    // Subscription registry over Postgres LISTEN/NOTIFY
    let registry = Arc::new(SubscriptionRegistry::new(
        Arc::new(PgChangeSource::new(db.clone())),
        config.subscription_config(),
        config.retry_policy(),
    ));

    // Providers, each behind its own circuit breaker
    let breakers = CircuitBreakerRegistry::new(config.circuit_config());
    let selector = Arc::new(ProviderSelector::new(build_providers(&config, &breakers)?));
    if selector.records().is_empty() {
        warn!("No generation provider credentials configured; generation requests will fail");
    }

    let webhooks = Arc::new(WebhookHub::new());
    let jobs = Arc::new(PgJobStore::new(db));
    let generation = Arc::new(GenerationService::new(
        jobs.clone(),
        selector.clone(),
        webhooks.clone(),
        config.generation_config(),
    ));

    // Build app state
    let state = AppState {
        jobs,
        registry,
        generation,
        selector,
        webhooks,
    };

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    routes::serve(listener, state, shutdown_signal()).await?;

    info!("Server stopped");
    Ok(())
}

/// Registers every provider whose credentials are configured.
/// Priority follows registration order.
fn build_providers(
    config: &Config,
    breakers: &CircuitBreakerRegistry,
) -> Result<Vec<Arc<ProviderRecord>>> {
    let timeout = config.provider_call_timeout;
    let mut providers: Vec<(Arc<dyn GenerationProvider>, f64)> = Vec::new();

    if let Some(key) = &config.anthropic_api_key {
        let claude = ClaudeProvider::new(key.clone(), timeout)
            .context("Failed to build Claude client")?;
        providers.push((Arc::new(claude), 0.01));
    }
    if let Some(heygen) = &config.heygen {
        let provider = HeyGenProvider::new(heygen.clone(), timeout)
            .context("Failed to build HeyGen client")?;
        providers.push((Arc::new(provider), 1.0));
    }
    if let Some(key) = &config.runway_api_key {
        let runway = RunwayProvider::new(key.clone(), timeout)
            .context("Failed to build Runway client")?;
        providers.push((Arc::new(runway), 0.5));
    }

    Ok(providers
        .into_iter()
        .enumerate()
        .map(|(index, (provider, cost))| {
            info!(
                "Provider {} registered ({:?}, priority {})",
                provider.id(),
                provider.capabilities(),
                index + 1
            );
            let breaker = breakers.breaker(provider.id());
            Arc::new(ProviderRecord::new(provider, index as u32 + 1, cost, breaker))
        })
        .collect())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
}
