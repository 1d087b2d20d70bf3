//! Logging module for the secbox orchestrator
//!
//! Provides structured logging with tracing, supporting JSON output for production
//! and pretty printing for development.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, writer::MakeWriterExt},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

const LOG_FILE: &str = "orchestrator.log";
const FALLBACK_LOG_DIR: &str = "./logs";

fn parse_level(log_level: &str) -> Level {
    match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

fn open_in(dir: &Path) -> std::io::Result<File> {
    std::fs::create_dir_all(dir)?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(LOG_FILE))
}

/// Open the log file in `log_dir`, falling back to `./logs`
fn open_log_file(log_dir: &Path) -> Result<(File, PathBuf)> {
    match open_in(log_dir) {
        Ok(file) => Ok((file, log_dir.join(LOG_FILE))),
        Err(_) => {
            let fallback = Path::new(FALLBACK_LOG_DIR);
            let file = open_in(fallback).with_context(|| {
                format!(
                    "Failed to open log file in {} or {}",
                    log_dir.display(),
                    fallback.display()
                )
            })?;
            Ok((file, fallback.join(LOG_FILE)))
        }
    }
}

/// Initialize the logging/tracing system
///
/// Returns the path of the JSON log file.
pub fn init_logging(log_level: &str, log_dir: &Path) -> Result<PathBuf> {
    let level = parse_level(log_level);

    // Build filter from level or RUST_LOG env var
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("secbox_orchestrator={}", level)));

    let (log_file, log_path) = open_log_file(log_dir)?;

    if stdout_is_terminal() {
        // Development: pretty colored output to stdout + JSON to file
        let stdout_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(FmtSpan::CLOSE)
            .pretty()
            .with_writer(std::io::stdout);

        let file_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .json()
            .with_writer(log_file.and(std::io::stderr.with_max_level(Level::ERROR)));

        tracing_subscriber::registry()
            .with(filter)
            .with(stdout_layer)
            .with(file_layer)
            .try_init()
            .context("Failed to install tracing subscriber")?;
    } else {
        // Production: JSON output to both stdout and file
        let fmt_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .json()
            .with_writer(log_file.and(std::io::stdout));

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()
            .context("Failed to install tracing subscriber")?;
    }

    Ok(log_path)
}

/// Whether stdout is attached to a terminal
fn stdout_is_terminal() -> bool {
    #[cfg(unix)]
    {
        unsafe { libc::isatty(libc::STDOUT_FILENO) != 0 }
    }
    #[cfg(not(unix))]
    {
        false
    }
}
