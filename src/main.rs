//! kvreactor - A Redis-compatible key-value server on reactor threads
//!
//! This is the main entry point for the kvreactor server.
//! It wires the storage engine, worker pool and reactor threads together
//! and waits for Ctrl+C.

use anyhow::Context;
use kvreactor::commands::{CommandHandler, TrafficCop};
use kvreactor::config::{CliCommand, ServerConfig, HELP};
use kvreactor::metrics::NetworkMetricsStore;
use kvreactor::network::Server;
use kvreactor::storage::{ExpiryConfig, ExpirySweeper, StorageEngine};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn print_banner(config: &ServerConfig, server: &Server) {
    println!(
        r#"
  _                                 _
 | | ____   ___ __ ___  __ _  ___| |_ ___  _ __
 | |/ /\ \ / / '__/ _ \/ _` |/ __| __/ _ \| '__|
 |   <  \ V /| | |  __/ (_| | (__| || (_) | |
 |_|\_\  \_/ |_|  \___|\__,_|\___|\__\___/|_|

kvreactor v{} - Redis-compatible key-value server
──────────────────────────────────────────────────────────────
Server started on {}
Reactor threads: {}
Ready to accept connections.

Use Ctrl+C to shutdown gracefully.
"#,
        kvreactor::VERSION,
        server.local_addr(),
        config.reactors
    );
}

/// `RUST_LOG` wins; `--log-level` is the fallback filter.
fn init_tracing(fallback: &str) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(fallback)
            .with_context(|| format!("invalid log filter: {fallback}"))?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .init();
    Ok(())
}

fn export_metrics(metrics: &NetworkMetricsStore, path: &Path) -> anyhow::Result<usize> {
    let file = File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    let mut out = BufWriter::new(file);
    let rows = metrics.write_csv(&mut out)?;
    out.flush()?;
    Ok(rows)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match ServerConfig::parse(std::env::args().skip(1)) {
        Ok(CliCommand::Run(config)) => config,
        Ok(CliCommand::Help) => {
            println!("{HELP}");
            return Ok(());
        }
        Ok(CliCommand::Version) => {
            println!("kvreactor version {}", kvreactor::VERSION);
            return Ok(());
        }
        Err(e) => {
            eprintln!("Error: {e}");
            println!("{HELP}");
            std::process::exit(1);
        }
    };

    init_tracing(&config.log_level)?;

    // Create the storage engine (shared across all connections)
    let storage = Arc::new(StorageEngine::new());
    let sweeper = ExpirySweeper::start(Arc::clone(&storage), ExpiryConfig::default());

    let handler = Arc::new(CommandHandler::new(storage));
    let traffic_cop = if config.sync_only {
        TrafficCop::new(handler)
    } else {
        TrafficCop::with_runtime(handler, Handle::current())
    };

    let metrics = config
        .metrics
        .then(|| Arc::new(NetworkMetricsStore::new(true)));

    let server = Server::start(&config, Arc::new(traffic_cop), metrics.clone())
        .with_context(|| format!("failed to start server on {}", config.bind_address()))?;
    print_banner(&config, &server);

    signal::ctrl_c()
        .await
        .context("failed to install Ctrl+C handler")?;
    info!("Shutdown signal received, stopping server...");

    // Joining the reactor threads blocks.
    tokio::task::spawn_blocking(move || server.shutdown())
        .await
        .context("server shutdown panicked")?;
    sweeper.stop().await;

    if let Some(metrics) = &metrics {
        match &config.metrics_file {
            Some(path) => {
                let rows = export_metrics(metrics, path)?;
                info!(rows, path = %path.display(), "Network features exported");
            }
            None => info!(samples = metrics.len(), "Network features discarded, no --metrics-file"),
        }
    }

    info!("Server shutdown complete");
    Ok(())
}
