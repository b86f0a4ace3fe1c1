use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use worker_fleet::config::{Credentials, NodeConfig};
use worker_fleet::{node, shutdown};

#[derive(Parser, Debug)]
#[command(name = "worker-fleet")]
#[command(about = "A node server hosting remote workers with streamed stdio and messaging")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:9400")]
    bind: SocketAddr,

    /// Node name reported to clients
    #[arg(long, default_value = "worker-fleet-node")]
    name: String,

    /// Basic-auth username clients must present
    #[arg(long)]
    username: String,

    /// Basic-auth password clients must present
    #[arg(long)]
    password: String,

    /// Directory for cached bundle artifacts (defaults to a temp dir)
    #[arg(long)]
    bundle_dir: Option<PathBuf>,

    /// Runtime command executing bundle artifacts, comma-separated
    /// (e.g. "node" or "node,--enable-source-maps")
    #[arg(long, default_value = "node")]
    runtime: String,

    /// Bundle count above which the cache is wiped at startup
    #[arg(long, default_value = "10")]
    cache_clear_threshold: usize,

    /// Grace window in milliseconds before an abandoned worker is
    /// terminated
    #[arg(long, default_value = "1000")]
    exit_grace_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = NodeConfig::new(
        args.bind,
        Credentials::new(args.username, args.password),
    )
    .with_runtime(args.runtime.split(',').map(str::to_string).collect())
    .with_exit_grace(Duration::from_millis(args.exit_grace_ms));
    config.name = args.name;
    config.cache_clear_threshold = args.cache_clear_threshold;
    if let Some(dir) = args.bundle_dir {
        config = config.with_bundle_dir(dir);
    }

    tracing::info!(
        name = %config.name,
        listen_addr = %config.listen_addr,
        bundle_dir = %config.bundle_dir.display(),
        runtime = ?config.runtime,
        "Starting worker-fleet node"
    );

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    let state = node::build_state(config).await?;
    let token = shutdown::install_shutdown_handler();
    node::serve(listener, state, token).await?;

    Ok(())
}
