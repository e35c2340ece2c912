use anyhow::Result;
use std::sync::Arc;
use tribunal_core::config::CoreConfig;
use tribunal_core::runner::CancelFlag;
use tribunal_server::auth::StaticAuthorizer;
use tribunal_server::{router, AppState};

use tracing_subscriber::{fmt, EnvFilter};

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .json()
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cfg = CoreConfig::from_env()?;
    let authorizer = Arc::new(StaticAuthorizer::from_env());
    let state = AppState::build(&cfg, authorizer)?;

    // in-process worker pool; the queue keeps each execution on exactly one
    // worker at a time
    let worker_count: usize = std::env::var("WORKER_COUNT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(2);
    let shutdown = CancelFlag::new();
    for i in 0..worker_count {
        let orchestrator = state.orchestrator.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tracing::info!(event = "worker_started", worker = i);
            orchestrator.worker_loop(shutdown).await;
        });
    }

    let bind = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(event = "server_start", bind = %bind, workers = worker_count);

    axum::serve(listener, router(state)).await?;
    Ok(())
}
