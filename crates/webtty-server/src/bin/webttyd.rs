use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use webtty_server::config::TerminalConfig;
use webtty_server::manager::TerminalManager;
use webtty_server::store::TermStore;
use webtty_server::{build_router, AppState};

#[derive(Parser, Debug)]
#[command(name = "webttyd", version, about = "Web terminal session server")]
struct Options {
    /// Address the HTTP server binds to
    #[arg(long, default_value = "0.0.0.0", env = "WEBTTY_HOST")]
    host: String,

    /// Port for the HTTP server
    #[arg(long, default_value_t = 8384, env = "WEBTTY_PORT")]
    port: u16,

    /// Path of the SQLite database
    #[arg(long, default_value = "data/webtty.db", env = "WEBTTY_DB")]
    db: PathBuf,

    /// Shell program for new sessions (defaults to $SHELL, then /bin/sh)
    #[arg(long, env = "WEBTTY_SHELL")]
    shell: Option<String>,

    /// Cap on concurrent WebSocket viewers; 0 = unlimited
    #[arg(long, default_value_t = 0, env = "WEBTTY_MAX_CONNECTIONS")]
    max_connections: i64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = Options::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let store = TermStore::open(&options.db)
        .await
        .context("failed to open terminal store")?;

    let mut cfg = TerminalConfig {
        max_connections: options.max_connections,
        ..TerminalConfig::default()
    };
    if let Some(shell) = options.shell {
        cfg.shell = shell;
    }

    let manager = TerminalManager::new(store, cfg);

    // No viewer may attach before stale rows from a previous server life
    // are reconciled.
    manager
        .cleanup_on_start()
        .await
        .context("startup reconciliation failed")?;
    if let Err(e) = manager.cleanup_expired_history().await {
        tracing::warn!(error = %e, "expired history cleanup failed");
    }

    let app = build_router(AppState::new(manager));

    let addr = format!("{}:{}", options.host, options.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "webttyd listening");

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
