//! Where lokiactor's `tracing` events go.
//!
//! `lokiactor run --log-dir DIR` keeps a JSON trail of every flow, trigger
//! and action event under `DIR` ([`init_production`]) and mirrors the same
//! events to stderr. Plain `run` and `check` only print to stderr
//! ([`init_cli`]). Both honour `RUST_LOG` and fall back to `info`.

use std::path::Path;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// File name stem of the JSON trail; the appender adds `.YYYY-MM-DD`.
pub const LOG_FILE_PREFIX: &str = "lokiactor.log";

/// Keeps the background file writer alive.
///
/// Events still queued for the JSON trail are written out when this drops,
/// so `run` holds it until every flow has stopped.
#[derive(Debug)]
pub struct LoggingGuard {
    _guard: WorkerGuard,
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Log to a daily JSON file in `logs_dir` and to stderr.
///
/// # Errors
///
/// Fails when `logs_dir` does not exist and cannot be created.
pub fn init_production(logs_dir: &Path) -> anyhow::Result<LoggingGuard> {
    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("failed to create logs directory {}", logs_dir.display()))?;

    let (trail, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(logs_dir, LOG_FILE_PREFIX));

    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer().json().with_writer(trail))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(LoggingGuard { _guard: guard })
}

/// Log to stderr only.
pub fn init_cli() {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .init();
}
