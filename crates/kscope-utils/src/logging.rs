//! # Logging
//!
//! Subscriber setup for the `tracing` events `kscope-core` emits.
//!
//! The core library logs session attachment, debug-info loading and symbol
//! resolution at `debug`, and every node a walk visits at `trace`. Nothing
//! is printed until a binary or test harness installs a subscriber from
//! this module.
//!
//! ```rust,no_run
//! use kscope_utils::{init_logging, LogConfig};
//!
//! let config = LogConfig::from_env().expect("bad logging environment");
//! let _guard = init_logging(&config).expect("subscriber already installed");
//! tracing::info!("session starting");
//! ```
//!
//! ## Environment
//!
//! - `RUST_LOG`: filter directives, e.g. `kscope_core::walk=trace`
//! - `KSCOPE_LOG_FORMAT`: `pretty` (default), `compact` or `json`
//! - `KSCOPE_LOG_FILE`: also write to a daily-rotated file at this path
//! - `NO_COLOR`: disable ANSI colours on stderr

use std::env;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::level_filters::LevelFilter;
use tracing::{Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// How events are rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat
{
    /// Multi-field output with source locations
    #[default]
    Pretty,
    /// One line per event
    Compact,
    /// One JSON object per event, for archiving a session's log
    Json,
}

impl FromStr for LogFormat
{
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(LoggingError::InvalidFormat(s.to_string())),
        }
    }
}

/// Fallback verbosity when `RUST_LOG` is unset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel
{
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    /// Includes one event per visited list or tree node
    Trace,
}

impl From<LogLevel> for Level
{
    fn from(level: LogLevel) -> Self
    {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

impl FromStr for LogLevel
{
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warn" | "warning" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            _ => Err(LoggingError::InvalidLevel(s.to_string())),
        }
    }
}

/// Subscriber settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig
{
    pub level: LogLevel,
    pub format: LogFormat,
    /// Extra daily-rotated log file; the date is appended to the name
    pub file: Option<PathBuf>,
    pub ansi: bool,
}

impl Default for LogConfig
{
    fn default() -> Self
    {
        Self {
            level: LogLevel::default(),
            format: LogFormat::default(),
            file: None,
            ansi: true,
        }
    }
}

impl LogConfig
{
    /// Read `KSCOPE_LOG_FORMAT`, `KSCOPE_LOG_FILE` and `NO_COLOR`.
    ///
    /// ## Errors
    ///
    /// [`LoggingError::InvalidFormat`] for an unknown format name.
    pub fn from_env() -> Result<Self, LoggingError>
    {
        let mut config = Self::default();
        if let Ok(format) = env::var("KSCOPE_LOG_FORMAT") {
            config.format = format.parse()?;
        }
        config.file = env::var_os("KSCOPE_LOG_FILE").map(PathBuf::from);
        config.ansi = env::var_os("NO_COLOR").is_none();
        Ok(config)
    }

    #[must_use]
    pub fn with_level(mut self, level: LogLevel) -> Self
    {
        self.level = level;
        self
    }

    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self
    {
        self.format = format;
        self
    }

    #[must_use]
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self
    {
        self.file = Some(path.into());
        self
    }

    fn filter(&self) -> EnvFilter
    {
        EnvFilter::builder()
            .with_default_directive(LevelFilter::from_level(self.level.into()).into())
            .from_env_lossy()
    }
}

/// Keeps the file writer's background thread alive
///
/// Dropping it flushes whatever is still buffered.
#[must_use = "dropping the guard stops file logging"]
#[derive(Debug)]
pub struct LogGuard
{
    _file: Option<WorkerGuard>,
}

fn fmt_layer<S, W>(format: LogFormat, writer: W, ansi: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a> + 'static,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_timer(ChronoUtc::rfc_3339())
        .with_ansi(ansi);
    match format {
        LogFormat::Pretty => layer.with_file(true).with_line_number(true).boxed(),
        LogFormat::Compact => layer.compact().boxed(),
        LogFormat::Json => layer.json().with_current_span(true).with_span_list(true).boxed(),
    }
}

fn file_appender(path: &Path) -> Result<RollingFileAppender, LoggingError>
{
    let name = path
        .file_name()
        .ok_or_else(|| LoggingError::FileError(format!("{} does not name a file", path.display())))?;
    let directory = path.parent().filter(|dir| !dir.as_os_str().is_empty()).unwrap_or(Path::new("."));
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(name.to_string_lossy().into_owned())
        .build(directory)
        .map_err(|err| LoggingError::FileError(format!("{}: {err}", path.display())))
}

/// Install the global subscriber described by `config`.
///
/// ## Errors
///
/// [`LoggingError::FileError`] when the log file cannot be created and
/// [`LoggingError::InitializationFailed`] when a subscriber is already
/// installed.
pub fn init_logging(config: &LogConfig) -> Result<LogGuard, LoggingError>
{
    let console = fmt_layer(config.format, io::stderr, config.ansi);

    let mut guard = None;
    let file = match &config.file {
        Some(path) => {
            let (writer, worker) = tracing_appender::non_blocking(file_appender(path)?);
            guard = Some(worker);
            Some(fmt_layer(config.format, writer, false))
        }
        None => None,
    };

    Registry::default()
        .with(config.filter())
        .with(console)
        .with(file)
        .try_init()
        .map_err(|err| LoggingError::InitializationFailed(err.to_string()))?;
    Ok(LogGuard { _file: guard })
}

/// Install a subscriber for a test binary, at most once per process.
///
/// Output goes through libtest's capture, so it only shows for failing
/// tests. Defaults to `debug` when `RUST_LOG` is unset.
pub fn init_test_logging()
{
    let filter = LogConfig::default().with_level(LogLevel::Debug).filter();
    // Every test after the first finds a subscriber already installed.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_test_writer()
        .try_init();
}

/// Logging setup failure
#[derive(Debug, thiserror::Error)]
pub enum LoggingError
{
    #[error("Unknown log format '{0}', expected pretty, compact or json")]
    InvalidFormat(String),

    #[error("Unknown log level '{0}', expected error, warn, info, debug or trace")]
    InvalidLevel(String),

    #[error("Failed to install subscriber: {0}")]
    InitializationFailed(String),

    #[error("Cannot open log file {0}")]
    FileError(String),
}
