//! lokiactor CLI entry point.
//!
//! Provides `run` for the streaming daemon and `check` for validating a
//! configuration file without connecting to anything.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use lokiactor::config::{load_config, DEFAULT_CONFIG_PATH};
use lokiactor::daemon::Daemon;
use lokiactor::logging;
use lokiactor::model::Extent;

/// lokiactor: turn Loki log lines into commands and chat notifications.
#[derive(Parser)]
#[command(name = "lokiactor", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Stream every configured flow until SIGINT or SIGTERM.
    Run {
        /// Configuration file.
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Also write JSON logs with daily rotation into this directory.
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },
    /// Load and validate the configuration, then exit.
    Check {
        /// Configuration file.
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Optional; webhook_url_env lookups may rely on it.
    let _ = dotenvy::dotenv();

    match cli.command {
        Command::Run { config, log_dir } => handle_run(&config, log_dir.as_deref()).await,
        Command::Check { config } => handle_check(&config),
    }
}

/// Run the daemon until a shutdown signal arrives.
async fn handle_run(config_path: &Path, log_dir: Option<&Path>) -> anyhow::Result<()> {
    let _logging_guard = match log_dir {
        Some(dir) => Some(logging::init_production(dir)?),
        None => {
            logging::init_cli();
            None
        }
    };

    let config = load_config(config_path)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let daemon = Daemon::build(&config, shutdown_rx).context("failed to start daemon")?;

    info!(
        config = %config_path.display(),
        loki_host = %config.loki.host,
        loki_port = config.loki.port,
        flows = daemon.flow_count(),
        actions = config.actions.len(),
        "lokiactor started"
    );

    let daemon_task = tokio::spawn(daemon.run());

    wait_for_signal().await;
    info!("received shutdown signal, initiating graceful shutdown");
    let _ = shutdown_tx.send(true);

    daemon_task.await.context("daemon task failed")?;
    Ok(())
}

/// Validate the configuration and log what would run.
fn handle_check(config_path: &Path) -> anyhow::Result<()> {
    logging::init_cli();

    let config = load_config(config_path)?;

    for flow in &config.flows {
        info!(flow = %flow.name, query = %flow.query, triggers = flow.triggers.len(), "flow");
        for trigger in &flow.triggers {
            let continuation = trigger.continuation.as_ref().map(|c| match c.extent {
                Extent::Lines(n) => format!("{n} lines -> {}", c.action),
                Extent::Duration(d) => format!("{}ms -> {}", d.as_millis(), c.action),
            });
            info!(
                flow = %flow.name,
                trigger = %trigger.name,
                regex = %trigger.pattern,
                actions = %trigger.actions.join(", "),
                continuation = continuation.as_deref().unwrap_or("none"),
                "trigger"
            );
        }
    }

    for (name, action) in &config.actions {
        info!(action = %name, kind = action.kind(), "action");
    }

    info!(
        config = %config_path.display(),
        flows = config.flows.len(),
        actions = config.actions.len(),
        "configuration is valid"
    );
    Ok(())
}

/// Resolve on SIGINT or, on unix, SIGTERM.
#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            warn!(error = %e, "failed to install SIGTERM handler, listening for ctrl-c only");
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
            }
            return;
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "failed to listen for ctrl-c");
            }
        }
        _ = terminate.recv() => {}
    }
}

/// Resolve on ctrl-c.
#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
    }
}
