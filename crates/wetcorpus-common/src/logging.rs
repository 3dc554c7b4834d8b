//! Logging setup
//!
//! Everything in the workspace logs through `tracing`; this module installs
//! the global subscriber described by a [`LogConfig`]. Logs go to stderr so a
//! corpus written to stdout is never interleaved with diagnostics.
//!
//! Library code emits structured events and never prints:
//!
//! ```rust
//! use tracing::info;
//!
//! let segment = "CC-MAIN-20230527223515-20230528013515-00000";
//! info!(segment = %segment, records = 42, "Segment cleaned");
//! ```
//!
//! ```no_run
//! use wetcorpus_common::logging::{init_logging, LogConfig, LogLevel};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = LogConfig::builder()
//!         .level(LogLevel::Debug)
//!         .log_file_prefix("wetcorpus-ingest")
//!         .build()
//!         .merge_env()?;
//!     let _guard = init_logging(&config)?;
//!     Ok(())
//! }
//! ```

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, MakeWriter},
    layer::SubscriberExt,
    registry::Registry,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Declares a lowercase-named option enum with `FromStr` aliases and `Display`
macro_rules! named_choice {
    (
        $(#[$meta:meta])*
        $name:ident, $what:literal {
            $( $(#[$vmeta:meta])* $variant:ident => $canonical:literal $(| $alias:literal)* ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
        #[serde(rename_all = "lowercase")]
        pub enum $name {
            $( $(#[$vmeta])* $variant, )+
        }

        impl std::str::FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s.trim().to_lowercase().as_str() {
                    $( $canonical $(| $alias)* => Ok($name::$variant), )+
                    other => Err(anyhow!("Invalid {}: {}", $what, other)),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(match self {
                    $( $name::$variant => $canonical, )+
                })
            }
        }
    };
}

named_choice! {
    /// Minimum severity that is emitted
    LogLevel, "log level" {
        Trace => "trace",
        Debug => "debug",
        #[default]
        Info => "info",
        Warn => "warn" | "warning",
        Error => "error",
    }
}

named_choice! {
    /// Where events are written
    LogOutput, "log output" {
        #[default]
        Console => "console" | "stderr",
        File => "file",
        Both => "both" | "all",
    }
}

named_choice! {
    LogFormat, "log format" {
        #[default]
        Text => "text" | "pretty",
        /// One JSON object per event
        Json => "json",
    }
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl LogOutput {
    fn to_stderr(self) -> bool {
        self != LogOutput::File
    }

    fn to_file(self) -> bool {
        self != LogOutput::Console
    }
}

/// Subscriber settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: LogLevel,
    pub output: LogOutput,
    pub format: LogFormat,
    /// Directory of the daily rolling file
    pub log_dir: PathBuf,
    /// Rolled files are named `{prefix}.{date}`
    pub log_file_prefix: String,
    /// Extra `EnvFilter` directives such as `reqwest=warn,wetcorpus_ingest=debug`
    pub filter_directives: Option<String>,
    pub include_location: bool,
    pub include_thread_ids: bool,
    pub include_targets: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::default(),
            output: LogOutput::default(),
            format: LogFormat::default(),
            log_dir: PathBuf::from("./logs"),
            log_file_prefix: "wetcorpus".into(),
            filter_directives: None,
            include_location: false,
            include_thread_ids: false,
            include_targets: true,
        }
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_flag(key: &str, current: bool) -> bool {
    env_value(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(current)
}

impl LogConfig {
    pub fn builder() -> LogConfigBuilder {
        LogConfigBuilder::default()
    }

    /// Defaults overridden by the `LOG_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::default().merge_env()
    }

    /// Apply `LOG_LEVEL`, `LOG_OUTPUT`, `LOG_FORMAT`, `LOG_DIR`,
    /// `LOG_FILE_PREFIX`, `LOG_FILTER` and the `LOG_INCLUDE_*` flags on top of
    /// `self`. Unset or blank variables leave the field untouched.
    pub fn merge_env(mut self) -> Result<Self> {
        if let Some(v) = env_value("LOG_LEVEL") {
            self.level = v.parse()?;
        }
        if let Some(v) = env_value("LOG_OUTPUT") {
            self.output = v.parse()?;
        }
        if let Some(v) = env_value("LOG_FORMAT") {
            self.format = v.parse()?;
        }
        if let Some(v) = env_value("LOG_DIR") {
            self.log_dir = v.into();
        }
        if let Some(v) = env_value("LOG_FILE_PREFIX") {
            self.log_file_prefix = v;
        }
        if let Some(v) = env_value("LOG_FILTER") {
            self.filter_directives = Some(v);
        }
        self.include_location = env_flag("LOG_INCLUDE_LOCATION", self.include_location);
        self.include_thread_ids = env_flag("LOG_INCLUDE_THREAD_IDS", self.include_thread_ids);
        self.include_targets = env_flag("LOG_INCLUDE_TARGETS", self.include_targets);
        Ok(self)
    }

    fn env_filter(&self) -> Result<EnvFilter> {
        let base = Level::from(self.level);
        self.filter_directives
            .iter()
            .flat_map(|d| d.split(','))
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .try_fold(EnvFilter::from_default_env().add_directive(base.into()), |filter, d| {
                let directive = d
                    .parse()
                    .with_context(|| format!("Bad log filter directive '{}'", d))?;
                Ok(filter.add_directive(directive))
            })
    }

    fn layer<W>(&self, writer: W, ansi: bool) -> BoxedLayer
    where
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(ansi)
            .with_target(self.include_targets)
            .with_thread_ids(self.include_thread_ids)
            .with_file(self.include_location)
            .with_line_number(self.include_location)
            .with_span_events(FmtSpan::CLOSE);

        if self.format == LogFormat::Json {
            layer.json().boxed()
        } else {
            layer.boxed()
        }
    }
}

#[derive(Default)]
pub struct LogConfigBuilder {
    inner: LogConfig,
}

impl LogConfigBuilder {
    pub fn level(mut self, level: LogLevel) -> Self {
        self.inner.level = level;
        self
    }

    pub fn output(mut self, output: LogOutput) -> Self {
        self.inner.output = output;
        self
    }

    pub fn format(mut self, format: LogFormat) -> Self {
        self.inner.format = format;
        self
    }

    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.inner.log_dir = dir.into();
        self
    }

    pub fn log_file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.inner.log_file_prefix = prefix.into();
        self
    }

    pub fn filter_directives(mut self, directives: impl Into<String>) -> Self {
        self.inner.filter_directives = Some(directives.into());
        self
    }

    pub fn include_location(mut self, on: bool) -> Self {
        self.inner.include_location = on;
        self
    }

    pub fn build(self) -> LogConfig {
        self.inner
    }
}

/// Flushes the file writer on drop
#[must_use = "file logging stops when the guard is dropped"]
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the global subscriber. Call once, keep the guard until exit.
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuard> {
    let mut layers: Vec<BoxedLayer> = Vec::with_capacity(2);
    let mut guard = None;

    if config.output.to_stderr() {
        layers.push(config.layer(std::io::stderr, true));
    }
    if config.output.to_file() {
        std::fs::create_dir_all(&config.log_dir)
            .with_context(|| format!("Cannot create log directory {}", config.log_dir.display()))?;
        let rolling = tracing_appender::rolling::daily(&config.log_dir, &config.log_file_prefix);
        let (writer, file_guard) = tracing_appender::non_blocking(rolling);
        layers.push(config.layer(writer, false));
        guard = Some(file_guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(config.env_filter()?)
        .try_init()
        .context("A global tracing subscriber is already installed")?;

    Ok(LoggingGuard { _file: guard })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_choice_aliases() {
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!(" stderr ".parse::<LogOutput>().unwrap(), LogOutput::Console);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert_eq!(LogLevel::Warn.to_string(), "warn");
        assert!("loud".parse::<LogLevel>().is_err());
        assert!("syslog".parse::<LogOutput>().is_err());
    }

    #[test]
    fn test_output_sinks() {
        assert!(LogOutput::Console.to_stderr() && !LogOutput::Console.to_file());
        assert!(LogOutput::Both.to_stderr() && LogOutput::Both.to_file());
        assert!(!LogOutput::File.to_stderr());
    }

    #[test]
    fn test_level_maps_to_tracing() {
        assert_eq!(Level::from(LogLevel::Trace), Level::TRACE);
        assert_eq!(Level::from(LogLevel::default()), Level::INFO);
    }

    #[test]
    fn test_builder_and_filter() {
        let config = LogConfig::builder()
            .level(LogLevel::Debug)
            .output(LogOutput::File)
            .format(LogFormat::Json)
            .log_dir("/tmp/wetcorpus-logs")
            .log_file_prefix("ingest")
            .filter_directives("reqwest=warn, ,wetcorpus_ingest=trace")
            .build();

        assert_eq!(config.level, LogLevel::Debug);
        assert_eq!(config.output, LogOutput::File);
        assert_eq!(config.log_file_prefix, "ingest");
        assert!(config.env_filter().is_ok());
    }

    #[test]
    fn test_bad_directive_rejected() {
        let config = LogConfig::builder().filter_directives("wetcorpus=loud").build();
        assert!(config.env_filter().is_err());
    }
}
