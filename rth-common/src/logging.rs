//! Logging initialization shared by the harness binaries.
//!
//! Built on `tracing-subscriber` with an `EnvFilter` sourced from the
//! `RTH_LOG` environment variable, plus an optional JSON file layer via
//! `tracing-appender` for fleet-side ingestion.

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Environment variable controlling log filtering.
pub const LOG_ENV_VAR: &str = "RTH_LOG";

/// Logging configuration for a binary entry point.
#[derive(Debug, Clone)]
pub struct LogConfig {
    level: String,
    stderr: bool,
    file: Option<PathBuf>,
}

impl LogConfig {
    /// Default level, overridable via `RTH_LOG`.
    pub fn from_env(default_level: &str) -> Self {
        Self {
            level: default_level.to_string(),
            stderr: false,
            file: None,
        }
    }

    pub fn with_level(mut self, level: &str) -> Self {
        self.level = level.to_string();
        self
    }

    pub fn with_stderr(mut self) -> Self {
        self.stderr = true;
        self
    }

    /// Also write JSON log lines to the given file.
    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file = Some(path);
        self
    }
}

/// Install the global subscriber. The returned guards must be kept alive
/// for the lifetime of the process or buffered file output is lost.
pub fn init_logging(config: &LogConfig) -> anyhow::Result<Vec<WorkerGuard>> {
    let filter = EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let mut guards = Vec::new();

    let file_layer = match &config.file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "rth.log".to_string());
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            guards.push(guard);
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_ansi(false),
            )
        }
        None => None,
    };

    let stderr_layer = config.stderr.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow::anyhow!("failed to install subscriber: {err}"))?;

    Ok(guards)
}
