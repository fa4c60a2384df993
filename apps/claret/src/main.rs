use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod admin;
mod cli;
mod routes;
mod state;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = cli::Cli::parse();
    let state = state::bootstrap(&cli).await?;

    let app = axum::Router::new()
        .merge(routes::public_router(state.clone()))
        .merge(admin::health_router(state.clone()))
        .nest("/api/admin", admin::admin_router(state.clone()));

    let bind = format!("{}:{}", cli.host, cli.port);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(event = "listening", bind = %bind);

    let shutdown_state = state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!(event = "shutdown_requested");
        })
        .await?;

    // Flush pool state so cooldowns and usage counters survive restarts.
    if let Err(err) = shutdown_state.services.store.persist().await {
        tracing::warn!(event = "final_persist_failed", error = %err);
    }
    state::persist_settings(&shutdown_state).await;
    Ok(())
}
