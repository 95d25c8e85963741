//! Diagnostic logging setup shared by every binary.
//!
//! This is the process's own tracing output. Game events go through the
//! `game-log` pipeline instead.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// Environment variable pointing at a directory for rolling diagnostic logs.
pub const LOG_DIR_ENV_VAR: &str = "TURNSTILE_LOG_DIR";

const DIAGNOSTICS_PREFIX: &str = "turnstile.log";

fn env_filter() -> filter::EnvFilter {
    filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy()
}

/// initiate the global tracing subscriber, writing to stderr
pub fn init() {
    let fmt_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter());

    registry().with(fmt_layer).init();
}

/// Like [`init`], but also mirrors diagnostics into a daily rolling file
/// under `dir`. Keep the returned guard alive until exit so buffered lines
/// get flushed.
pub fn init_with_dir(dir: &Path) -> Option<WorkerGuard> {
    let stderr_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter());

    match RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(DIAGNOSTICS_PREFIX)
        .max_log_files(3)
        .build(dir)
    {
        Ok(appender) => {
            let (file_writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_target(true)
                .with_filter(env_filter());
            registry().with(stderr_layer).with(file_layer).init();
            Some(guard)
        }
        Err(err) => {
            registry().with(stderr_layer).init();
            tracing::error!(
                "failed to create rolling diagnostics log at {}: {err}; logging to stderr only",
                dir.display()
            );
            None
        }
    }
}
