mod ai_queue;
mod config;
mod errors;
mod llm_client;
mod routes;
mod state;

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::ai_queue::{AiRequestQueue, ProviderClient, ProviderRoutes, TokioClock};
use crate::config::Config;
use crate::llm_client::{AnthropicProvider, OpenAiProvider};
use crate::routes::build_router;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing or malformed env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "{}={}",
                env!("CARGO_PKG_NAME").replace('-', "_"),
                &config.rust_log
            ))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting resume AI service v{}", env!("CARGO_PKG_VERSION"));

    // Primary provider, then the optional fallback
    let anthropic = AnthropicProvider::new(
        config.anthropic_api_key.clone(),
        config.anthropic_model.clone(),
    )
    .context("Failed to build Anthropic HTTP client")?
    .with_pricing(config.anthropic_pricing);
    info!("Anthropic provider initialized (model: {})", anthropic.model());
    let mut providers: Vec<Arc<dyn ProviderClient>> = vec![Arc::new(anthropic)];

    match &config.openai_api_key {
        Some(key) => {
            let openai = OpenAiProvider::new(key.clone(), config.openai_model.clone())
                .context("Failed to build OpenAI HTTP client")?
                .with_pricing(config.openai_pricing);
            info!("OpenAI fallback provider initialized (model: {})", openai.model());
            providers.push(Arc::new(openai));
        }
        None => warn!("OPENAI_API_KEY not set, running without a fallback provider"),
    }

    // Default chain is every configured provider in order; AI_ROUTE_<TYPE> overrides it
    let names: Vec<String> = providers.iter().map(|p| p.name().to_string()).collect();
    let mut routes = ProviderRoutes::new(names.clone());
    for (request_type, chain) in &config.routes {
        for provider in chain.iter().filter(|p| !names.contains(p)) {
            warn!("Route for {request_type} names unconfigured provider '{provider}'; it will be skipped");
        }
        info!("Routing {request_type} requests to {}", chain.join(" -> "));
        routes = routes.route(*request_type, chain.clone());
    }

    let queue = AiRequestQueue::new(
        config.queue.clone(),
        providers,
        routes,
        Arc::new(TokioClock::new()),
    );
    queue.start();

    let state = AppState {
        queue: queue.clone(),
        config: config.clone(),
    };

    // Build router
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive()); // TODO: tighten CORS to the web app origin in production

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let shutdown = install_signal_handler();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    // HTTP is closed; drain the queue before exiting
    queue.shutdown().await;
    info!("Shutdown complete");

    Ok(())
}

/// Cancels the returned token on SIGINT (Ctrl+C) or SIGTERM.
fn install_signal_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => info!("Received SIGINT (Ctrl+C), initiating shutdown"),
                        _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
                    }
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {e}");
                    let _ = ctrl_c.await;
                    info!("Received SIGINT (Ctrl+C), initiating shutdown");
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("Received Ctrl+C, initiating shutdown");
        }

        trigger.cancel();
    });

    token
}
