//! Logger capability handed to [`crate::ConnectionManager`] and the
//! subscriber setup used by the binaries.
//!
//! The manager never calls `tracing` macros directly; it talks to a
//! [`Logger`] so that hosts can redirect or capture its output.

use std::{backtrace::Backtrace, fs::OpenOptions, path::Path, sync::Mutex};

use tracing::Level;
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

use crate::{config::LogProfile, error::LinkError};

pub const ERROR_LOG_FILE: &str = "error.log";
pub const ALL_LOG_FILE: &str = "all.log";

pub trait Logger: Send + Sync {
    fn log(&self, level: Level, message: &str);

    fn error(&self, message: &str) {
        self.log(Level::ERROR, message);
    }

    fn warn(&self, message: &str) {
        self.log(Level::WARN, message);
    }

    fn info(&self, message: &str) {
        self.log(Level::INFO, message);
    }

    fn debug(&self, message: &str) {
        self.log(Level::DEBUG, message);
    }

    /// Dumps the current call stack at trace level.
    fn trace_stack(&self) {
        self.log(Level::TRACE, &Backtrace::force_capture().to_string());
    }
}

/// Forwards to the global `tracing` dispatcher.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: Level, message: &str) {
        match level {
            Level::ERROR => tracing::error!(target: "homelink", "{message}"),
            Level::WARN => tracing::warn!(target: "homelink", "{message}"),
            Level::INFO => tracing::info!(target: "homelink", "{message}"),
            Level::DEBUG => tracing::debug!(target: "homelink", "{message}"),
            _ => tracing::trace!(target: "homelink", "{message}"),
        }
    }
}

/// Installs the global subscriber for `profile`.
///
/// Production writes plain single-line records to stdout at info. Development
/// writes colorized records at debug and mirrors them into `error.log`
/// (errors only) and `all.log` under `log_dir`. `RUST_LOG` overrides the
/// console filter in both profiles.
pub fn init(profile: LogProfile, log_dir: &Path) -> Result<(), LinkError> {
    let result = match profile {
        LogProfile::Production => {
            let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
            tracing_subscriber::registry()
                .with(
                    fmt::layer()
                        .with_ansi(false)
                        .with_target(false)
                        .with_filter(filter),
                )
                .try_init()
        }
        LogProfile::Development => {
            let filter =
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
            let error_sink = open_sink(log_dir, ERROR_LOG_FILE)?;
            let all_sink = open_sink(log_dir, ALL_LOG_FILE)?;
            tracing_subscriber::registry()
                .with(fmt::layer().with_ansi(true).with_filter(filter))
                .with(
                    fmt::layer()
                        .with_ansi(false)
                        .with_writer(Mutex::new(error_sink))
                        .with_filter(LevelFilter::ERROR),
                )
                .with(
                    fmt::layer()
                        .with_ansi(false)
                        .with_writer(Mutex::new(all_sink))
                        .with_filter(LevelFilter::DEBUG),
                )
                .try_init()
        }
    };

    result.map_err(|err| LinkError::LoggerInit(err.to_string()))
}

fn open_sink(dir: &Path, name: &str) -> Result<std::fs::File, LinkError> {
    let path = dir.join(name);
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|source| LinkError::LogSink {
            path: path.display().to_string(),
            source,
        })
}
