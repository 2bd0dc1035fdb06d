//! Logging configuration

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::errors::DeployError;

/// Verbosity of the `cutover` log output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    #[serde(alias = "warning")]
    Warn,
    Error,
}

impl LogLevel {
    fn directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Logging options
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Log level
    pub log_level: LogLevel,

    /// Write logs to stdout
    pub stdout: bool,

    /// Also write logs to a daily rolling file under `log_dir`
    pub file: bool,

    /// Log directory for file output
    pub log_dir: PathBuf,

    /// Enable JSON format on stdout
    pub json_format: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            stdout: true,
            file: false,
            log_dir: PathBuf::from("/var/log/cutover"),
            json_format: false,
        }
    }
}

/// Initialize logging.
///
/// `RUST_LOG` overrides the configured level. The returned guard flushes the
/// file writer on drop and must be held for the lifetime of the process.
pub fn init_logging(options: LogOptions) -> Result<Option<WorkerGuard>, DeployError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(options.log_level.directive()));

    let (file_layer, guard) = if options.file {
        let appender = tracing_appender::rolling::daily(&options.log_dir, "cutover.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        (
            Some(fmt::layer().with_ansi(false).with_writer(writer)),
            Some(guard),
        )
    } else {
        (None, None)
    };

    let plain_layer = (options.stdout && !options.json_format).then(|| fmt::layer());
    let json_layer = (options.stdout && options.json_format).then(|| fmt::layer().json());

    tracing_subscriber::registry()
        .with(filter)
        .with(plain_layer)
        .with(json_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| DeployError::Configuration(e.to_string()))?;

    Ok(guard)
}
