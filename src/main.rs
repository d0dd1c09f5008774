use std::sync::Arc;

use anyhow::Context;

use agrodesk::inference::config::load_or_default;
use agrodesk::{data_dir, init_tracing, server, spawn_eviction, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cwd = std::env::current_dir().context("failed to resolve working directory")?;
    let (config, config_path) = load_or_default(&cwd).context("failed to load configuration")?;

    // Tracing comes up before anything else logs.
    let log_path = init_tracing(&config.logging)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        data_dir = %data_dir().display(),
        config = %config_path.as_ref().map_or(String::from("<defaults>"), |p| p.display().to_string()),
        log_file = %log_path.as_ref().map_or(String::from("<stdout>"), |p| p.display().to_string()),
        "=== AgroDesk starting ==="
    );

    let bind = config.server.bind.clone();
    let state = Arc::new(AppState::from_config(config)?);
    let eviction = spawn_eviction(state.clone());

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    tracing::info!(addr = %bind, "listening");

    axum::serve(listener, server::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    eviction.abort();
    tracing::info!("AgroDesk stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
