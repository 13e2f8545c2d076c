use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use termite_master::{Master, MasterOptions};
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "termite-master")]
#[command(author, version, about = "Dispatches wrapped commands to termite workers", long_about = None)]
struct Args {
    /// Configuration file (TOML).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Writable root the jobs' results are replayed into.
    #[arg(long)]
    writable_root: Option<PathBuf>,

    /// Coordinator address for worker discovery.
    #[arg(long)]
    coordinator: Option<String>,

    /// Unix socket for the local RPC.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// File holding the shared secret.
    #[arg(long)]
    secret_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let args = Args::parse();
    let mut options = match &args.config {
        Some(path) => MasterOptions::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => MasterOptions::default(),
    };
    if let Some(root) = args.writable_root {
        options.writable_root = root;
    }
    if let Some(coordinator) = args.coordinator {
        options.coordinator = coordinator;
    }
    if let Some(socket) = args.socket {
        options.socket = socket;
    }
    if let Some(path) = args.secret_file {
        options.secret = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?
            .trim()
            .to_owned();
    }
    if options.socket.as_os_str().is_empty() {
        options.socket = options.writable_root.join(".termite-socket");
    }
    if options.store.dir.as_os_str().is_empty() {
        options.store.dir = options.writable_root.join(".termite-cache");
    }

    let master = Master::new(options).context("creating master")?;

    tokio::select! {
        result = master.start() => result.context("master server")?,
        () = shutdown_signal() => info!("shutdown signal received"),
    }

    master.shutdown().await;
    info!("termite master stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
