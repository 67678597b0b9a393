//! Logging and observability
//!
//! Structured logging with:
//! - Console output on stderr, pretty or JSON
//! - Optional rolling JSON log file through a non-blocking writer
//! - Event macros carrying an `event` field for log processors

use anyhow::{Context, Result};
use std::io;
use tracing::{info, Level};
use tracing_appender::{non_blocking, non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::{config::LoggingConfig, error::ReconError};

const LOG_FILE_NAME: &str = "deep_recon.log";

/// Initialize logging with default configuration
pub fn init_logging() -> Result<Option<WorkerGuard>> {
    init_logging_with_config(&LoggingConfig::default())
}

/// Initialize logging from configuration.
///
/// The returned guard flushes the log file on drop and must be held for
/// the life of the program.
pub fn init_logging_with_config(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let env_filter = create_env_filter(&config.level)?;

    let (file_layer, guard) = match &config.file_dir {
        Some(dir) => {
            let appender = match config.file_rotation.to_lowercase().as_str() {
                "hourly" => rolling::hourly(dir, LOG_FILE_NAME),
                "never" => rolling::never(dir, LOG_FILE_NAME),
                _ => rolling::daily(dir, LOG_FILE_NAME),
            };
            let (writer, guard) = non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let registry = Registry::default().with(env_filter).with(file_layer);

    match config.format.as_str() {
        "json" => {
            let console_layer = fmt::layer()
                .json()
                .with_writer(io::stderr)
                .with_target(true)
                .with_thread_ids(true);

            registry
                .with(console_layer)
                .try_init()
                .context("Failed to install global subscriber")?;
        }
        _ => {
            let console_layer = fmt::layer()
                .pretty()
                .with_writer(io::stderr)
                .with_target(false);

            registry
                .with(console_layer)
                .try_init()
                .context("Failed to install global subscriber")?;
        }
    }

    info!("Logging system initialized with level: {}", config.level);
    Ok(guard)
}

/// Create environment filter from log level string; `RUST_LOG` still wins
fn create_env_filter(level: &str) -> Result<EnvFilter> {
    let base_level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => return Err(ReconError::config(format!("Invalid log level: {}", level)).into()),
    };

    let filter = EnvFilter::builder()
        .with_default_directive(base_level.into())
        .from_env()
        .context("Failed to create environment filter")?;

    Ok(filter)
}

#[macro_export]
macro_rules! log_probe_start {
    ($probe:expr, $targets:expr) => {
        tracing::info!(
            probe = $probe,
            targets = $targets,
            event = "probe_start",
            "Starting probe {} on {} targets",
            $probe,
            $targets
        );
    };
}

#[macro_export]
macro_rules! log_probe_complete {
    ($probe:expr, $duration:expr, $ok:expr, $partial:expr, $failed:expr) => {
        tracing::info!(
            probe = $probe,
            duration_ms = $duration.as_millis() as u64,
            ok = $ok,
            partial = $partial,
            failed = $failed,
            event = "probe_complete",
            "Completed probe {} in {}ms ({} ok, {} partial, {} failed)",
            $probe,
            $duration.as_millis(),
            $ok,
            $partial,
            $failed
        );
    };
}

#[macro_export]
macro_rules! log_pair_failure {
    ($probe:expr, $target:expr, $error:expr) => {
        tracing::warn!(
            probe = $probe,
            target = $target,
            error = %$error,
            event = "pair_failure",
            "Probe {} failed on {}: {}",
            $probe,
            $target,
            $error
        );
    };
}

#[macro_export]
macro_rules! log_identity_unified {
    ($survivor:expr, $retired:expr, $asserted_by:expr) => {
        tracing::info!(
            survivor = $survivor,
            retired = ?$retired,
            asserted_by = $asserted_by,
            event = "identity_unified",
            "Unified {:?} into {} (asserted by {})",
            $retired,
            $survivor,
            $asserted_by
        );
    };
}

#[macro_export]
macro_rules! log_error_with_context {
    ($error:expr, $context:expr) => {
        tracing::error!(
            error = %$error,
            context = $context,
            severity = %$error.severity(),
            transient = $error.is_transient(),
            event = "error",
            "Error in {}: {}",
            $context,
            $error
        );
    };
}

/// Logs the duration of an operation when dropped
pub struct TimingLogger {
    name: String,
    start_time: std::time::Instant,
}

impl TimingLogger {
    pub fn start<S: Into<String>>(name: S) -> Self {
        let name = name.into();
        tracing::trace!(
            operation = %name,
            event = "timing_start",
            "Starting timing for: {}",
            name
        );

        Self {
            name,
            start_time: std::time::Instant::now(),
        }
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    pub fn checkpoint(&self, checkpoint_name: &str) {
        let elapsed = self.start_time.elapsed();
        tracing::debug!(
            operation = %self.name,
            checkpoint = checkpoint_name,
            elapsed_ms = elapsed.as_millis() as u64,
            event = "timing_checkpoint",
            "Checkpoint '{}' in '{}': {}ms",
            checkpoint_name,
            self.name,
            elapsed.as_millis()
        );
    }
}

impl Drop for TimingLogger {
    fn drop(&mut self) {
        let elapsed = self.start_time.elapsed();
        tracing::debug!(
            operation = %self.name,
            duration_ms = elapsed.as_millis() as u64,
            event = "timing_complete",
            "Completed '{}' in {}ms",
            self.name,
            elapsed.as_millis()
        );
    }
}
