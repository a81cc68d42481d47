//! Tracing setup.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::constants::LOG_ENV_VAR;
use crate::errors::{GuestCtlError, GuestCtlResult};

/// Options for [`init_logging`]. Shared by the host service and the guest agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingOptions {
    /// `EnvFilter` directives. Falls back to `GUESTCTL_LOG`, then `info`.
    pub filter: Option<String>,
    /// Write to a daily-rotated file in this directory instead of stderr.
    pub log_dir: Option<PathBuf>,
    /// File name prefix for rotated files.
    pub file_prefix: Option<String>,
    pub ansi: bool,
}

/// Keeps the file writer alive. Dropping it flushes pending log lines.
#[must_use = "dropping the guard stops file logging"]
pub struct LoggingGuard {
    _worker: Option<WorkerGuard>,
}

fn build_filter(options: &LoggingOptions) -> GuestCtlResult<EnvFilter> {
    match &options.filter {
        Some(directives) => EnvFilter::try_new(directives)
            .map_err(|e| GuestCtlError::Config(format!("invalid log filter '{directives}': {e}"))),
        None => Ok(EnvFilter::builder()
            .with_default_directive(tracing::Level::INFO.into())
            .with_env_var(LOG_ENV_VAR)
            .from_env_lossy()),
    }
}

/// Install the global subscriber.
///
/// Fails if a global subscriber is already set.
pub fn init_logging(options: &LoggingOptions) -> GuestCtlResult<LoggingGuard> {
    let filter = build_filter(options)?;
    let registry = tracing_subscriber::registry().with(filter);

    let worker = match &options.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let prefix = options.file_prefix.as_deref().unwrap_or("guestctl.log");
            let appender = tracing_appender::rolling::daily(dir, prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false),
                )
                .try_init()
                .map_err(|e| GuestCtlError::Config(format!("logging already initialised: {e}")))?;
            Some(guard)
        }
        None => {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_ansi(options.ansi),
                )
                .try_init()
                .map_err(|e| GuestCtlError::Config(format!("logging already initialised: {e}")))?;
            None
        }
    };

    tracing::debug!(log_dir = ?options.log_dir, "Logging initialised");
    Ok(LoggingGuard { _worker: worker })
}
