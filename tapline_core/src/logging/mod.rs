//! Logging for tapline.
//!
//! Two layers live here. [`init_logging`] installs the process-wide `tracing`
//! subscriber (stdout and/or a daily rolling file, plain or JSON). The tunnel
//! components themselves never touch that global state: they report through
//! an [`EventLog`] built from an injected [`LogSink`].

mod sink;

pub use sink::{EventLog, LogSink, MemorySink};

use tracing::Level;
use tracing_appender::{
    non_blocking::{NonBlocking, WorkerGuard},
    rolling::{RollingFileAppender, Rotation},
};
use tracing_log::LogTracer;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer, Registry};

/// Log initialization options.
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Log level (default: INFO)
    pub level: Level,

    /// Whether to log to stdout (default: true)
    pub log_to_stdout: bool,

    /// Whether to log to a file (default: false)
    pub log_to_file: bool,

    /// Directory to store log files (default: "./logs")
    pub log_dir: String,

    /// Base filename for log files (default: "tapline")
    pub log_file_name: String,

    /// Whether to use JSON format for logs (default: false)
    pub json_format: bool,

    /// Whether to include file and line information (default: false)
    pub include_file_line: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        LogOptions {
            level: Level::INFO,
            log_to_stdout: true,
            log_to_file: false,
            log_dir: "./logs".to_string(),
            log_file_name: "tapline".to_string(),
            json_format: false,
            include_file_line: false,
        }
    }
}

/// Parse a textual level, falling back to INFO for anything unknown.
pub fn parse_level(level: &str) -> Level {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Initialize logging with the given options.
///
/// File output is written by a background worker; keep the returned guard
/// alive until exit or the tail of the log is lost. Only the first call in a
/// process installs a subscriber.
///
/// # Examples
///
/// ```
/// use tapline_core::logging::{init_logging, LogOptions};
/// use tracing::Level;
///
/// let options = LogOptions {
///     level: Level::DEBUG,
///     ..Default::default()
/// };
///
/// let _guard = init_logging(options);
/// ```
pub fn init_logging(options: LogOptions) -> Option<WorkerGuard> {
    let _ = LogTracer::init();

    let mut outputs: Vec<BoxedLayer> = Vec::with_capacity(2);
    if options.log_to_stdout {
        outputs.push(output_layer(std::io::stdout, &options, true));
    }

    let guard = options.log_to_file.then(|| {
        let appender = RollingFileAppender::new(Rotation::DAILY, &options.log_dir, &options.log_file_name);
        let (writer, guard) = NonBlocking::new(appender);
        outputs.push(output_layer(writer, &options, false));
        guard
    });

    let filter = EnvFilter::from_default_env().add_directive(options.level.into());
    let _ = tracing_subscriber::registry()
        .with(outputs)
        .with(filter)
        .try_init();

    guard
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// One formatted output; ANSI colours only make sense on a terminal.
fn output_layer<W>(writer: W, options: &LogOptions, ansi: bool) -> BoxedLayer
where
    W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(true)
        .with_file(options.include_file_line)
        .with_line_number(options.include_file_line);
    if options.json_format {
        layer.json().boxed()
    } else {
        layer.boxed()
    }
}

/// Initialize logging with default options.
pub fn init_default_logging() -> Option<WorkerGuard> {
    init_logging(LogOptions::default())
}

/// Initialize logging from the `[logging]` section of a configuration.
///
/// # Examples
///
/// ```
/// use tapline_core::config::Config;
/// use tapline_core::logging::init_logging_from_config;
///
/// let config = Config::default();
/// let _guard = init_logging_from_config(&config);
/// ```
pub fn init_logging_from_config(config: &crate::config::Config) -> Option<WorkerGuard> {
    init_logging(options_from_config(config))
}

/// Translate the `[logging]` configuration section into [`LogOptions`].
pub fn options_from_config(config: &crate::config::Config) -> LogOptions {
    let logging = &config.logging;
    LogOptions {
        level: parse_level(&logging.level),
        log_to_stdout: logging.log_to_stdout,
        log_to_file: logging.log_to_file,
        log_dir: logging.log_dir.clone(),
        json_format: logging.json_format,
        ..Default::default()
    }
}
