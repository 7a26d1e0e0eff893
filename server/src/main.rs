//! Standalone AI Critic server binary. Exits 0 on clean shutdown, non-zero when it
//! cannot bind its port or otherwise fails to start.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use common::config::{self, Config};

#[derive(Parser)]
#[command(name = "ai-critic-server", about = "AI Critic server")]
struct Args {
    /// Port to listen on (defaults to settings.json, then 23712).
    #[arg(long)]
    port: Option<u16>,
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
    let port = args.port.unwrap_or(cfg.server_port);

    let (state, shutdown_rx) = server::build_state(&cfg);
    server::run_web_server(port, state, shutdown_rx).await
}
