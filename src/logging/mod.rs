//! Logging subsystem
//!
//! Structured logging via tracing with support for JSON (production) and
//! plaintext (development) output formats.
//!
//! # Log Targets
//!
//! Use these consistent target names across the codebase:
//! - `ingest` - ingestion pipeline
//! - `store` - metadata persistence and pruning
//! - `fetch` - outbound media fetches
//! - `security` - rejected paths, spoofed content, blocked fetch targets
//! - `http` - HTTP server
//! - `config` - configuration loading
//!
//! # Environment Variables
//!
//! - `LINKWALL_LOG` - Primary log level/filter (takes precedence)
//! - `RUST_LOG` - Fallback log level/filter

use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Mutex, OnceLock};

use tracing::Level;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Guard to track if logging has been initialized
static INIT_GUARD: OnceLock<()> = OnceLock::new();

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// JSON format for production (structured logs)
    Json,
    /// Human-readable plaintext for development
    #[default]
    Plaintext,
}

impl FromStr for LogFormat {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "plaintext" | "text" | "plain" => Ok(LogFormat::Plaintext),
            other => Err(LoggingError::UnknownFormat(other.to_string())),
        }
    }
}

/// Log output destination
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogOutput {
    #[default]
    Stdout,
    Stderr,
    File(PathBuf),
}

/// Configuration for the logging subsystem
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub format: LogFormat,
    pub output: LogOutput,
    /// Default log level when no env filter is set
    pub default_level: Level,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Plaintext,
            output: LogOutput::Stdout,
            default_level: Level::INFO,
        }
    }
}

impl LogConfig {
    /// JSON to stdout, info level
    pub fn production() -> Self {
        Self {
            format: LogFormat::Json,
            output: LogOutput::Stdout,
            default_level: Level::INFO,
        }
    }

    /// Build from the `logging` config section.
    pub fn from_settings(settings: &crate::config::LoggingSettings) -> Result<Self, LoggingError> {
        let default_level = Level::from_str(&settings.level)
            .map_err(|_| LoggingError::UnknownLevel(settings.level.clone()))?;
        let output = match &settings.file {
            Some(path) => LogOutput::File(path.clone()),
            None => LogOutput::Stdout,
        };
        Ok(Self {
            format: settings.format.parse()?,
            output,
            default_level,
        })
    }
}

/// Error type for logging initialization
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to create log file: {0}")]
    FileCreation(#[from] io::Error),
    #[error("failed to parse log filter: {0}")]
    FilterParse(#[from] tracing_subscriber::filter::ParseError),
    #[error("unknown log format: {0}")]
    UnknownFormat(String),
    #[error("unknown log level: {0}")]
    UnknownLevel(String),
    #[error("logging already initialized")]
    AlreadyInitialized,
    #[error("failed to initialize subscriber: {0}")]
    TryInit(#[from] tracing_subscriber::util::TryInitError),
}

/// Build an EnvFilter from environment variables or default level.
///
/// Checks LINKWALL_LOG first, then RUST_LOG, falling back to the default level.
fn build_env_filter(default_level: Level) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = std::env::var("LINKWALL_LOG") {
        return Ok(EnvFilter::try_new(filter)?);
    }
    if let Ok(filter) = std::env::var("RUST_LOG") {
        return Ok(EnvFilter::try_new(filter)?);
    }

    let default_filter = format!(
        "{level},hyper=warn,reqwest=warn,security=warn",
        level = default_level.as_str().to_lowercase()
    );
    Ok(EnvFilter::try_new(default_filter)?)
}

fn make_writer(output: &LogOutput) -> Result<BoxMakeWriter, LoggingError> {
    Ok(match output {
        LogOutput::Stdout => BoxMakeWriter::new(io::stdout),
        LogOutput::Stderr => BoxMakeWriter::new(io::stderr),
        LogOutput::File(path) => BoxMakeWriter::new(Mutex::new(File::create(path)?)),
    })
}

fn build_layer(
    config: &LogConfig,
) -> Result<Box<dyn Layer<Registry> + Send + Sync + 'static>, LoggingError> {
    let filter = build_env_filter(config.default_level)?;
    let writer = make_writer(&config.output)?;
    // RFC 3339 timestamp format
    let timer = UtcTime::rfc_3339();

    let layer = match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_timer(timer)
            .with_target(true)
            .with_current_span(true)
            .with_span_list(true)
            .with_writer(writer)
            .with_filter(filter)
            .boxed(),
        LogFormat::Plaintext => tracing_subscriber::fmt::layer()
            .with_timer(timer)
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_file(false)
            .with_line_number(false)
            .with_writer(writer)
            .with_filter(filter)
            .boxed(),
    };
    Ok(layer)
}

/// Initialize the logging subsystem with the given configuration.
///
/// Call once at startup; later calls return [`LoggingError::AlreadyInitialized`].
pub fn init_logging(config: LogConfig) -> Result<(), LoggingError> {
    if INIT_GUARD.set(()).is_err() {
        return Err(LoggingError::AlreadyInitialized);
    }

    let layer = build_layer(&config)?;
    tracing_subscriber::registry().with(layer).try_init()?;
    Ok(())
}

/// Initialize logging for tests. Safe to call from every test.
pub fn init_test_logging() {
    let config = LogConfig {
        format: LogFormat::Plaintext,
        output: LogOutput::Stdout,
        default_level: Level::DEBUG,
    };
    if let Ok(layer) = build_layer(&config) {
        let _ = tracing_subscriber::registry().with(layer).try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// Serializes tests that modify env vars.
    static TEST_LOCK: StdMutex<()> = StdMutex::new(());

    #[test]
    fn test_log_config_defaults() {
        let config = LogConfig::default();
        assert_eq!(config.format, LogFormat::Plaintext);
        assert_eq!(config.output, LogOutput::Stdout);
        assert_eq!(config.default_level, Level::INFO);
    }

    #[test]
    fn test_log_config_production() {
        let config = LogConfig::production();
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.default_level, Level::INFO);
    }

    #[test]
    fn test_log_config_from_settings() {
        let settings = crate::config::LoggingSettings {
            level: "debug".to_string(),
            format: "json".to_string(),
            file: Some(PathBuf::from("/var/log/linkwall.log")),
        };
        let config = LogConfig::from_settings(&settings).unwrap();
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.default_level, Level::DEBUG);
        assert_eq!(
            config.output,
            LogOutput::File(PathBuf::from("/var/log/linkwall.log"))
        );

        let bad = crate::config::LoggingSettings {
            level: "loud".to_string(),
            format: "json".to_string(),
            file: None,
        };
        assert!(matches!(
            LogConfig::from_settings(&bad),
            Err(LoggingError::UnknownLevel(_))
        ));
    }

    #[test]
    fn test_log_format_parse() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Plaintext);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_env_filter_prefers_linkwall_log() {
        let _lock = TEST_LOCK.lock().unwrap();
        std::env::set_var("LINKWALL_LOG", "warn,ingest=trace");
        let filter = build_env_filter(Level::INFO).unwrap();
        assert!(filter.to_string().contains("ingest=trace"));
        std::env::remove_var("LINKWALL_LOG");
    }

    #[test]
    fn test_env_filter_rejects_garbage() {
        let _lock = TEST_LOCK.lock().unwrap();
        std::env::set_var("LINKWALL_LOG", "ingest=[[[");
        assert!(matches!(
            build_env_filter(Level::INFO),
            Err(LoggingError::FilterParse(_))
        ));
        std::env::remove_var("LINKWALL_LOG");
    }

    #[test]
    fn test_init_test_logging_is_idempotent() {
        init_test_logging();
        init_test_logging();
    }
}
