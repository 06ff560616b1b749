//! action-tokens-server - standalone HTTP controller for action tokens.
//!
//! Reads config from env vars:
//!   TOKENS_CONFIG     - optional YAML config file
//!   TOKENS_BIND_ADDR  - listen address (default: 0.0.0.0:4200)
//!   TOKENS_*          - overrides, see `TokenConfig::apply_env`

use std::sync::Arc;

use action_tokens_core::{BroadcastEventSink, EventSink, MemoryStore, TokenConfig, TokenOrchestrator};
use action_tokens_server::listener::EventLogger;
use action_tokens_server::router::build_router;
use action_tokens_server::AppState;
use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "info,action_tokens_core=debug,action_tokens_server=debug".into()
            }),
        )
        .init();

    let config = match std::env::var("TOKENS_CONFIG") {
        Ok(path) => TokenConfig::from_yaml_file(&path)
            .with_context(|| format!("failed to load token config from {path}"))?,
        Err(_) => TokenConfig::default(),
    }
    .apply_env()?;
    let bind_addr = std::env::var("TOKENS_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:4200".into());

    let store = MemoryStore::new();
    let events = Arc::new(BroadcastEventSink::new(config.event_capacity));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let listener_task = tokio::spawn(EventLogger::new(events.subscribe()).run(shutdown_rx));
    tracing::info!(capacity = events.capacity(), "token event listener spawned");

    let orchestrator = Arc::new(TokenOrchestrator::new(
        Arc::new(store),
        Arc::clone(&events) as Arc<dyn EventSink>,
        config,
    ));
    let app = build_router(AppState::new(orchestrator));

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind to {bind_addr}"))?;
    tracing::info!("action-tokens-server listening on {bind_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await
        .context("server error")?;

    shutdown_tx.send(true).ok();
    listener_task.await.ok();
    Ok(())
}
