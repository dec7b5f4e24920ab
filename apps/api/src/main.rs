mod chat;
mod config;
mod context;
mod conversation;
mod dispatcher;
mod documents;
mod errors;
mod generation;
mod interpreter;
mod llm_client;
mod quick_actions;
mod routes;
mod state;

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;
use crate::dispatcher::{Dispatcher, DispatcherSettings};
use crate::documents::{BuiltinExtractor, DocumentNormalizer, NormalizerLimits};
use crate::llm_client::{LlmClient, ModelEndpoint};
use crate::routes::build_router;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_PKG_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting assistant API v{}", env!("CARGO_PKG_VERSION"));

    // Initialize LLM client
    let llm = LlmClient::new(&config)?;
    info!("LLM client initialized (model: {})", llm.model());
    let endpoint: Arc<dyn ModelEndpoint> = Arc::new(llm);

    let settings = DispatcherSettings::from(&config);
    info!(
        "Dispatcher: {} attempts, {} requests per {}s, batching {}",
        settings.retry.max_attempts,
        settings.rate_max_requests,
        settings.rate_window.as_secs(),
        if settings.batching_enabled() { "on" } else { "off" }
    );
    let dispatcher = Dispatcher::new(endpoint, settings);

    let normalizer =
        DocumentNormalizer::new(Arc::new(BuiltinExtractor), NormalizerLimits::from(&config));

    let state = AppState::new(config.clone(), dispatcher, normalizer);

    // Build router
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
