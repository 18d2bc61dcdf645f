//! Tracing subscriber setup.
//!
//! The sequencer logs through `tracing` with structured fields
//! (`sequence_id`, `step`, `resource`, `visit_id`, `exposure_id`). This module
//! installs a `tracing-subscriber` registry with an [`EnvFilter`] and one of
//! three output formats. `RUST_LOG` always wins over the configured level.
//!
//! ```no_run
//! use iic_core::config::SequencerConfig;
//! use iic_core::observability;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = SequencerConfig::load(None)?;
//! observability::init_from_config(&config.logging)?;
//! tracing::info!(sequence_id = 1, "sequencer started");
//! # Ok(())
//! # }
//! ```

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::config::LoggingConfig;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// Multi-line, colored output for development.
    #[default]
    Pretty,
    /// Single-line output without colors.
    Compact,
    /// Newline-delimited JSON for log aggregation.
    Json,
}

/// Subscriber options.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Filter directive used when `RUST_LOG` is unset, e.g. `info` or
    /// `iic_sequencer=debug,info`.
    pub directive: String,
    /// Output format.
    pub format: OutputFormat,
    /// Emit span open/close events.
    pub with_span_events: bool,
    /// Include source file and line.
    pub with_file_and_line: bool,
    /// Colored output (pretty format only).
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            directive: "info".to_string(),
            format: OutputFormat::Pretty,
            with_span_events: false,
            with_file_and_line: true,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    /// Config with the given default directive.
    pub fn new(directive: impl Into<String>) -> Self {
        Self {
            directive: directive.into(),
            ..Default::default()
        }
    }

    /// Derives subscriber options from the `[logging]` section.
    pub fn from_logging(logging: &LoggingConfig) -> Result<Self> {
        EnvFilter::try_new(&logging.level)
            .map_err(|e| anyhow!("Invalid log level '{}': {}", logging.level, e))?;
        Ok(Self {
            directive: logging.level.clone(),
            format: logging.format,
            ..Default::default()
        })
    }

    /// Sets the output format.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Enables or disables span events.
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    /// Enables or disables ANSI colors.
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }

    fn layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let span_events = if self.with_span_events {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };
        let base = fmt::layer()
            .with_span_events(span_events)
            .with_file(self.with_file_and_line)
            .with_line_number(self.with_file_and_line)
            .with_thread_names(true);

        match self.format {
            OutputFormat::Pretty => base.pretty().with_ansi(self.with_ansi).boxed(),
            OutputFormat::Compact => base.compact().with_ansi(false).boxed(),
            OutputFormat::Json => base.json().with_ansi(false).boxed(),
        }
    }
}

/// Installs the global subscriber described by the `[logging]` section.
pub fn init_from_config(logging: &LoggingConfig) -> Result<()> {
    init(TracingConfig::from_logging(logging)?)
}

/// Installs the global subscriber.
///
/// Calling this more than once is not an error; later calls keep the
/// subscriber that is already installed.
pub fn init(config: TracingConfig) -> Result<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.directive))
        .map_err(|e| anyhow!("Invalid log directive '{}': {}", config.directive, e))?;

    match tracing_subscriber::registry()
        .with(config.layer())
        .with(filter)
        .try_init()
    {
        Ok(()) => Ok(()),
        Err(e) if e.to_string().contains("already") => Ok(()),
        Err(e) => Err(anyhow!("Failed to initialize tracing: {}", e)),
    }
}
