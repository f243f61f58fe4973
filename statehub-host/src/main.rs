//! statehub host
//!
//! Runs every statehub service in one process until Ctrl-C.
//!
//! Usage:
//!   statehub-host --config statehub.toml --sqlite state.db --seed components.json

use anyhow::{Context, Result};
use clap::Parser;
use statehub_host::{load_seed, Host, HostConfig};
use statehub_sync::MemorySyncBackend;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "statehub-host")]
#[command(about = "Component state registry, event bus, cache and sync host")]
struct Args {
    /// TOML config file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// SQLite file for the durable cache and sync queue
    #[arg(long)]
    sqlite: Option<PathBuf>,

    /// JSON array of components to register at start-up
    #[arg(long)]
    seed: Option<PathBuf>,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let mut config = match &args.config {
        Some(path) => HostConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => HostConfig::default(),
    };
    if let Some(path) = args.sqlite {
        config.storage.sqlite_path = Some(path);
    }

    // No remote transport is configured; sync reconciles against a loopback store.
    let backend = Arc::new(MemorySyncBackend::new());
    let host = Host::start(config, backend).context("starting host")?;

    if let Some(path) = &args.seed {
        let components =
            load_seed(path).with_context(|| format!("reading seed {}", path.display()))?;
        host.seed(components).context("seeding registry")?;
    }

    info!(
        components = host.registry().len(),
        queued_sync = host.sync().queue_len(),
        "statehub running, Ctrl-C to stop"
    );
    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;

    info!("Shutting down...");
    host.shutdown().await;
    Ok(())
}
