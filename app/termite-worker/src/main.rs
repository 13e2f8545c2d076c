use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use termite_worker::{Worker, WorkerOptions};
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "termite-worker")]
#[command(author, version, about = "Executes termite jobs in sandboxed views", long_about = None)]
struct Args {
    /// Configuration file (TOML).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Coordinator address to register with.
    #[arg(long)]
    coordinator: Option<String>,

    /// Total job slots granted across all mirrors.
    #[arg(long)]
    jobs: Option<u32>,

    /// Directory holding per-mirror job views.
    #[arg(long)]
    temp_dir: Option<PathBuf>,

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
        Some(path) => WorkerOptions::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => WorkerOptions::default(),
    };
    if let Some(coordinator) = args.coordinator {
        options.coordinator = coordinator;
    }
    if let Some(jobs) = args.jobs {
        options.jobs = jobs;
    }
    if let Some(temp_dir) = args.temp_dir {
        options.temp_dir = temp_dir;
    }
    if let Some(path) = args.secret_file {
        options.secret = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?
            .trim()
            .to_owned();
    }
    if options.store.dir.as_os_str().is_empty() {
        options.store.dir = options.temp_dir.join("cache");
    }

    let worker = Worker::new(options).context("creating worker")?;

    tokio::select! {
        result = worker.start() => result.context("worker server")?,
        () = shutdown_signal() => info!("shutdown signal received"),
    }

    info!("termite worker stopped");
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
