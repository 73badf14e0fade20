//! # Till Agent
//!
//! Runs the sync runtime for one terminal without a UI.
//!
//! ```text
//! till-agent                      run until Ctrl-C / SIGTERM
//! till-agent --once               reconcile, one sync cycle, exit
//! till-agent --config till.toml   use an explicit config file
//! ```
//!
//! `RUST_LOG` overrides the default log filter.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use till_sync::{CycleOutcome, SyncConfig, SyncRuntime};

#[derive(Debug, Parser)]
#[command(name = "till-agent", version, about = "Offline-first POS sync agent")]
struct Args {
    /// Config file (defaults to till.toml in the platform config dir).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Reconcile, run a single sync cycle, then exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let args = Args::parse();

    let config = SyncConfig::load(args.config).context("loading configuration")?;
    let mut runtime = SyncRuntime::new(config)
        .await
        .context("starting sync runtime")?;

    info!(terminal_id = %runtime.terminal_id(), "Till agent starting");

    if args.once {
        let outcome = runtime.run_once().await.context("running sync cycle")?;
        runtime.shutdown().await?;
        return match outcome {
            CycleOutcome::Completed(report) if report.is_clean() => Ok(()),
            CycleOutcome::Completed(_) => {
                warn!("Sync completed with items that could not be applied");
                Ok(())
            }
            CycleOutcome::Skipped => Ok(()),
            CycleOutcome::Offline => bail!("sync server unreachable"),
            CycleOutcome::Failed(e) => Err(e).context("sync cycle failed"),
        };
    }

    runtime.start().await.context("starting sync loops")?;
    shutdown_signal().await;
    runtime.shutdown().await?;

    info!("Till agent stopped");
    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
