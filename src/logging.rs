//! Tracing subscriber setup.

use crate::config::LoggingConfig;
use anyhow::{Context, Result};
use std::io;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Install the global subscriber. Keep the returned guard alive until exit
/// so buffered file output is flushed.
pub fn init(cfg: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.level))
        .context("Invalid log level")?;

    let stderr_json = cfg.json.then(|| fmt::layer().json().with_writer(io::stderr));
    let stderr_text = (!cfg.json).then(|| fmt::layer().with_target(false).with_writer(io::stderr));

    let (file_layer, guard) = if cfg.file {
        std::fs::create_dir_all(&cfg.directory)
            .with_context(|| format!("Failed to create log directory {:?}", cfg.directory))?;
        let appender = tracing_appender::rolling::daily(&cfg.directory, "wabridge.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        (
            Some(fmt::layer().json().with_ansi(false).with_writer(writer)),
            Some(guard),
        )
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_json)
        .with(stderr_text)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}
