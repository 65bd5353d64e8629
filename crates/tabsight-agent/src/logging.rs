//! Structured logging for the analyst
//!
//! Read from `RUST_LOG`, `LOG_FORMAT`, `LOG_OUTPUT` and `LOG_DIR`.
//! [`crate::config::Config::apply_logging_env`] fills these from
//! `config.yaml` when they are not already set. Console lines go to stderr
//! so stdout carries only analysis results.

use std::str::FromStr;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const LOG_FILE_PREFIX: &str = "tabsight.log";
const DEFAULT_LOG_DIR: &str = "./logs";

/// Dependencies that log at `warn` and above only
const QUIET_CRATES: &[&str] = &["hyper", "reqwest", "h2", "rustls", "tokio", "runtime"];

/// Line style of console output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
    Compact,
}

impl FromStr for LogFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            "compact" => Ok(Self::Compact),
            _ => Err(()),
        }
    }
}

/// Where log lines are written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogOutput {
    #[default]
    Stdout,
    File,
    Both,
}

impl LogOutput {
    fn console(self) -> bool {
        matches!(self, Self::Stdout | Self::Both)
    }

    fn file(self) -> bool {
        matches!(self, Self::File | Self::Both)
    }
}

impl FromStr for LogOutput {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stdout" | "stderr" | "console" => Ok(Self::Stdout),
            "file" => Ok(Self::File),
            "both" => Ok(Self::Both),
            _ => Err(()),
        }
    }
}

/// Resolved logging settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub format: LogFormat,
    pub output: LogOutput,
    pub directory: String,
}

impl LogSettings {
    /// Unknown values fall back to the defaults
    pub fn from_env() -> Self {
        fn parsed<T: FromStr + Default>(key: &str) -> T {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_default()
        }

        Self {
            format: parsed("LOG_FORMAT"),
            output: parsed("LOG_OUTPUT"),
            directory: std::env::var("LOG_DIR").unwrap_or_else(|_| DEFAULT_LOG_DIR.to_string()),
        }
    }
}

fn env_filter() -> EnvFilter {
    QUIET_CRATES.iter().fold(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        |filter, name| match format!("{name}=warn").parse() {
            Ok(directive) => filter.add_directive(directive),
            Err(_) => filter,
        },
    )
}

type BoxedLayer = Box<dyn Layer<tracing_subscriber::Registry> + Send + Sync>;

fn console_layer(format: LogFormat) -> BoxedLayer {
    let base = fmt::layer().with_writer(std::io::stderr);
    match format {
        LogFormat::Pretty => base.pretty().boxed(),
        LogFormat::Json => base.json().with_current_span(true).boxed(),
        LogFormat::Compact => base.compact().with_target(false).boxed(),
    }
}

fn file_layer(directory: &str) -> BoxedLayer {
    if let Err(err) = std::fs::create_dir_all(directory) {
        eprintln!("cannot create log directory {directory}: {err}");
    }
    let appender = RollingFileAppender::new(Rotation::DAILY, directory, LOG_FILE_PREFIX);
    fmt::layer().with_writer(appender).with_ansi(false).boxed()
}

/// Install the global subscriber.
///
/// Calling this twice is harmless; the second call leaves the first
/// subscriber in place.
pub fn init() {
    let settings = LogSettings::from_env();

    let mut layers: Vec<BoxedLayer> = Vec::with_capacity(2);
    if settings.output.console() {
        layers.push(console_layer(settings.format));
    }
    if settings.output.file() {
        layers.push(file_layer(&settings.directory));
    }

    let installed = tracing_subscriber::registry()
        .with(layers)
        .with(env_filter())
        .try_init();
    if installed.is_err() {
        return;
    }

    tracing::info!(
        format = ?settings.format,
        output = ?settings.output,
        directory = %settings.directory,
        "Logging ready"
    );
}

/// Emit an event carrying a stable `event` name plus debug-formatted fields.
///
/// ```ignore
/// log_event!(
///     level: tracing::Level::INFO,
///     event: "analysis_completed",
///     session_id: "abc123",
///     attempts: 2
/// );
/// ```
#[macro_export]
macro_rules! log_event {
    (level: $level:expr, event: $event:expr $(, $key:ident: $value:expr)* $(,)?) => {
        tracing::event!($level, event = $event $(, $key = ?$value)*)
    };
}
