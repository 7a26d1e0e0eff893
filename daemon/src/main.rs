//! AI Critic keep-alive daemon. Supervises the server binary forever; exits non-zero only
//! when it cannot acquire its own management port.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use common::config::{self, Config};
use common::process;

mod api;
mod binary;
mod client;
mod state;
mod supervisor;

use api::DaemonContext;
use client::ServerClient;
use state::DaemonState;
use supervisor::Supervisor;

#[derive(Parser)]
#[command(name = "ai-critic-daemon", about = "AI Critic keep-alive daemon")]
struct Args {
    /// Path to the server binary to supervise.
    binary: PathBuf,
    /// Management API port (defaults to settings.json, then 23713).
    #[arg(long)]
    port: Option<u16>,
    /// Port the supervised server listens on (defaults to settings.json, then 23712).
    #[arg(long)]
    server_port: Option<u16>,
    /// Start even if the management port already looks bound.
    #[arg(long)]
    forever: bool,
    /// Data directory (default ~/.ai-critic).
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let cfg = match &args.data_dir {
        Some(dir) => Config::load_from(dir),
        None => config::ensure_loaded().clone(),
    };
    let daemon_port = args.port.unwrap_or(cfg.daemon_port);
    let server_port = args.server_port.unwrap_or(cfg.server_port);

    // Another daemon already answering on the management port means we should not start.
    if !args.forever && process::tcp_port_reachable(daemon_port, Duration::from_millis(500)).await {
        bail!(
            "management port {} is already in use (pass --forever to override)",
            daemon_port
        );
    }

    // Resolve paths through the OS self-link so relative launches keep working after chdir.
    let daemon_binary = std::env::current_exe().context("resolving own executable")?;
    let server_binary = args
        .binary
        .canonicalize()
        .with_context(|| format!("resolving server binary {}", args.binary.display()))?;

    let (state, signals) = DaemonState::new(server_binary, daemon_binary, server_port);
    let server_client = ServerClient::new(&cfg, server_port);

    let ctx = Arc::new(DaemonContext {
        cfg: cfg.clone(),
        state: state.clone(),
        client: server_client.clone(),
        args: std::env::args().skip(1).collect(),
    });

    let addr = SocketAddr::from(([127, 0, 0, 1], daemon_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding management port {}", daemon_port))?;
    tracing::info!("management API on http://127.0.0.1:{}", daemon_port);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, api::app(ctx)).await {
            tracing::error!("management API failed: {}", e);
        }
    });

    let mut supervisor = Supervisor::new(cfg, state, server_client, signals);
    supervisor.run().await?;

    // The restart-daemon endpoint is about to exec a new daemon image in our place.
    tracing::info!("supervision ended, waiting for exec-replacement");
    std::future::pending::<()>().await;
    Ok(())
}
