use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use termite_coordinator::{Coordinator, CoordinatorOptions};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "termite-coordinator")]
#[command(author, version, about = "Registry of live termite workers", long_about = None)]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:1234")]
    listen: String,

    /// Seconds after which unreported workers are dropped.
    #[arg(long, default_value_t = 60)]
    liveness_secs: u64,

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
    let secret = match &args.secret_file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?
            .trim()
            .as_bytes()
            .to_vec(),
        None => Vec::new(),
    };

    let coordinator = Coordinator::new(CoordinatorOptions {
        secret,
        liveness_window: Duration::from_secs(args.liveness_secs),
    });
    let listener = TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("binding {}", args.listen))?;

    tokio::select! {
        result = coordinator.serve(listener) => result.context("coordinator server")?,
        () = shutdown_signal() => info!("shutdown signal received"),
    }

    info!("termite coordinator stopped");
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
