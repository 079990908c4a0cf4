//! Logging configuration and initialization
//!
//! Centralized tracing bootstrap for all tablift components. Supports
//! console and daily-rotated file output, text or JSON format, and
//! environment-based configuration. Components log through the structured
//! `tracing` macros with field syntax, never `println!`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::{
    fmt, layer::Layer, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

/// Log level for filtering messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(anyhow::anyhow!("Invalid log level: {}", s)),
        }
    }
}

/// Output target for logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Console,
    File,
    Both,
}

impl std::str::FromStr for LogOutput {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "console" | "stdout" => Ok(LogOutput::Console),
            "file" => Ok(LogOutput::File),
            "both" | "all" => Ok(LogOutput::Both),
            _ => Err(anyhow::anyhow!("Invalid log output: {}", s)),
        }
    }
}

/// Log format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(anyhow::anyhow!("Invalid log format: {}", s)),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: LogLevel,
    pub output: LogOutput,
    pub format: LogFormat,
    /// Directory for log files (only used when output includes file)
    pub log_dir: PathBuf,
    /// Log file name prefix ("tablift" -> "tablift.2026-08-01.log")
    pub log_file_prefix: String,
    /// Additional filter directives (e.g., "sqlx=warn")
    pub filter_directives: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            output: LogOutput::Console,
            format: LogFormat::Text,
            log_dir: PathBuf::from("./logs"),
            log_file_prefix: "tablift".to_string(),
            filter_directives: None,
        }
    }
}

impl LogConfig {
    /// Load configuration from environment variables
    ///
    /// Recognized: `LOG_LEVEL`, `LOG_OUTPUT`, `LOG_FORMAT`, `LOG_DIR`,
    /// `LOG_FILE_PREFIX`, `LOG_FILTER`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.level = level.parse()?;
        }
        if let Ok(output) = std::env::var("LOG_OUTPUT") {
            config.output = output.parse()?;
        }
        if let Ok(format) = std::env::var("LOG_FORMAT") {
            config.format = format.parse()?;
        }
        if let Ok(dir) = std::env::var("LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }
        if let Ok(prefix) = std::env::var("LOG_FILE_PREFIX") {
            config.log_file_prefix = prefix;
        }
        if let Ok(filter) = std::env::var("LOG_FILTER") {
            config.filter_directives = Some(filter);
        }

        Ok(config)
    }
}

/// Initialize the global tracing subscriber. Call once at startup.
///
/// Returns the file-appender guard when file output is enabled; keep it
/// alive for the lifetime of the process or buffered log lines are lost.
pub fn init_logging(config: &LogConfig) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let mut filter =
        EnvFilter::from_default_env().add_directive(config.level.to_tracing_level().into());

    if let Some(ref directives) = config.filter_directives {
        for directive in directives.split(',') {
            filter = filter.add_directive(
                directive
                    .trim()
                    .parse()
                    .context("Failed to parse filter directive")?,
            );
        }
    }

    match config.output {
        LogOutput::Console => {
            let console = fmt::layer().with_target(true);
            match config.format {
                LogFormat::Text => tracing_subscriber::registry()
                    .with(filter)
                    .with(console)
                    .init(),
                LogFormat::Json => tracing_subscriber::registry()
                    .with(filter)
                    .with(console.json())
                    .init(),
            }
            Ok(None)
        }
        LogOutput::File => {
            let (writer, guard) = file_writer(config)?;
            let file = fmt::layer().with_target(true).with_ansi(false).with_writer(writer);
            match config.format {
                LogFormat::Text => tracing_subscriber::registry()
                    .with(filter)
                    .with(file.boxed())
                    .init(),
                LogFormat::Json => tracing_subscriber::registry()
                    .with(filter)
                    .with(file.json().boxed())
                    .init(),
            }
            Ok(Some(guard))
        }
        LogOutput::Both => {
            let (writer, guard) = file_writer(config)?;
            let console = fmt::layer().with_target(true);
            let file = fmt::layer().with_target(true).with_ansi(false).with_writer(writer);
            match config.format {
                LogFormat::Text => tracing_subscriber::registry()
                    .with(filter)
                    .with(console.boxed())
                    .with(file.boxed())
                    .init(),
                LogFormat::Json => tracing_subscriber::registry()
                    .with(filter)
                    .with(console.json().boxed())
                    .with(file.json().boxed())
                    .init(),
            }
            Ok(Some(guard))
        }
    }
}

fn file_writer(
    config: &LogConfig,
) -> Result<(
    tracing_appender::non_blocking::NonBlocking,
    tracing_appender::non_blocking::WorkerGuard,
)> {
    std::fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("Failed to create log directory {:?}", config.log_dir))?;
    let appender = tracing_appender::rolling::daily(&config.log_dir, &config.log_file_prefix);
    Ok(tracing_appender::non_blocking(appender))
}
