//! Sequencer configuration.
//!
//! Configuration is layered with figment:
//!
//! 1. Built-in defaults ([`SequencerConfig::default`])
//! 2. An optional TOML file
//! 3. Environment variables prefixed with `IIC_`, nested with `__`
//!    (e.g. `IIC_ENGINE__ACQUIRE_TIMEOUT=30s`)
//!
//! Durations are written in humantime notation (`500ms`, `2m`, `7days`).
//!
//! # Example
//!
//! ```toml
//! [engine]
//! acquire_timeout = "2m"
//! visit_policy = "per_exposure"
//!
//! [engine.overrides.makeMotorMap]
//! device_timeout = "15m"
//!
//! [logging]
//! level = "debug"
//! format = "json"
//!
//! [[resources]]
//! name = "arm:b1"
//!
//! [[resources]]
//! name = "lamp:halogen"
//! class = "shared"
//! ```

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{ConfigError, SeqResult};
use crate::observability::OutputFormat;
use crate::resource::{ResourceRegistry, SharingClass};

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SequencerConfig {
    /// Executor and resource-manager tuning.
    pub engine: EngineConfig,
    /// Tracing subscriber settings.
    pub logging: LoggingConfig,
    /// Resource topology.
    pub resources: Vec<ResourceConfig>,
}

/// How visits map onto sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VisitPolicy {
    /// One visit spans every exposure of a sequence.
    #[default]
    PerSequence,
    /// Every expose step opens and closes its own visit.
    PerExposure,
}

/// Executor and resource-manager tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum time a lock request may stay queued.
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,
    /// Device silence timeout for steps that do not compute their own.
    #[serde(with = "humantime_serde")]
    pub device_timeout: Duration,
    /// Time allowed for in-flight commands to settle after `stop()`.
    #[serde(with = "humantime_serde")]
    pub abort_grace: Duration,
    /// Upper bound for each teardown step.
    #[serde(with = "humantime_serde")]
    pub teardown_timeout: Duration,
    /// Interval between device polls.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// How long terminated sequences stay in the registry.
    #[serde(with = "humantime_serde")]
    pub archive_retention: Duration,
    /// Visit-to-sequence cardinality.
    pub visit_policy: VisitPolicy,
    /// First visit identifier handed out by the tracker.
    pub first_visit_id: u64,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
    /// Per-operation timeout overrides, keyed by operation name.
    pub overrides: HashMap<String, OperationOverrides>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(300),
            device_timeout: Duration::from_secs(60),
            abort_grace: Duration::from_secs(10),
            teardown_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(100),
            archive_retention: Duration::from_secs(7 * 24 * 3600),
            visit_policy: VisitPolicy::PerSequence,
            first_visit_id: 1,
            event_capacity: 1024,
            overrides: HashMap::new(),
        }
    }
}

impl EngineConfig {
    /// Queue timeout for `operation`.
    pub fn acquire_timeout_for(&self, operation: &str) -> Duration {
        self.overrides
            .get(operation)
            .and_then(|o| o.acquire_timeout)
            .unwrap_or(self.acquire_timeout)
    }

    /// Device silence timeout for `operation` when a step carries none.
    pub fn device_timeout_for(&self, operation: &str) -> Duration {
        self.overrides
            .get(operation)
            .and_then(|o| o.device_timeout)
            .unwrap_or(self.device_timeout)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Validation(
                "engine.poll_interval must be non-zero".into(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Validation(
                "engine.event_capacity must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Timeout overrides for one operation kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OperationOverrides {
    /// Queue timeout.
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Option<Duration>,
    /// Device silence timeout.
    #[serde(with = "humantime_serde")]
    pub device_timeout: Option<Duration>,
}

/// Tracing subscriber settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`.
    pub level: String,
    /// Output format.
    pub format: OutputFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: OutputFormat::Pretty,
        }
    }
}

/// One resource of the topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Resource name, e.g. `arm:b1`.
    pub name: String,
    /// Sharing class; exclusive when omitted.
    #[serde(default)]
    pub class: SharingClass,
}

impl ResourceConfig {
    /// Exclusive resource.
    pub fn exclusive(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            class: SharingClass::Exclusive,
        }
    }

    /// Resource admitting shared readers.
    pub fn shared(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            class: SharingClass::Shared,
        }
    }

    /// Four spectrograph modules with four cameras each, their slits and
    /// shutters, the calibration lamps, the back illuminator, the fiber
    /// positioner and the metrology camera.
    pub fn pfs_topology() -> Vec<Self> {
        let mut resources = Vec::new();
        for spec in 1..=4 {
            for arm in ["b", "r", "n", "m"] {
                resources.push(Self::exclusive(format!("arm:{arm}{spec}")));
            }
            resources.push(Self::exclusive(format!("hexapod:sm{spec}")));
            resources.push(Self::exclusive(format!("shutter:sm{spec}")));
        }
        for lamp in ["halogen", "argon", "neon", "krypton", "xenon", "hgar", "hgcd"] {
            resources.push(Self::shared(format!("lamp:{lamp}")));
        }
        resources.push(Self::shared("illuminator:bia"));
        resources.push(Self::exclusive("fps"));
        resources.push(Self::exclusive("mcs"));
        resources
    }
}

impl SequencerConfig {
    /// Loads configuration from defaults, an optional TOML file, and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(SequencerConfig::default()));

        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::NotFound(path.display().to_string()).into());
            }
            debug!("Loading sequencer config from: {}", path.display());
            figment = figment.merge(Toml::file(path));
        }

        let config: SequencerConfig = figment
            .merge(Env::prefixed("IIC_").split("__"))
            .extract()
            .map_err(|e| ConfigError::Parse(e.to_string()))
            .context("Failed to extract sequencer configuration")?;

        config.engine.validate()?;
        info!(
            resources = config.resources.len(),
            visit_policy = ?config.engine.visit_policy,
            "Loaded sequencer config"
        );
        Ok(config)
    }

    /// Parses configuration from a TOML string layered over the defaults.
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let config: SequencerConfig = Figment::from(Serialized::defaults(SequencerConfig::default()))
            .merge(Toml::string(toml))
            .extract()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.engine.validate()?;
        Ok(config)
    }

    /// Builds the resource registry described by `resources`, or the
    /// standard PFS topology when none is configured.
    pub fn registry(&self) -> SeqResult<ResourceRegistry> {
        if self.resources.is_empty() {
            return ResourceRegistry::from_config(&ResourceConfig::pfs_topology());
        }
        ResourceRegistry::from_config(&self.resources)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_are_sane() {
        let config = SequencerConfig::default();
        assert_eq!(config.engine.poll_interval, Duration::from_millis(100));
        assert_eq!(
            config.engine.archive_retention,
            Duration::from_secs(604_800)
        );
        assert_eq!(config.engine.visit_policy, VisitPolicy::PerSequence);
        assert!(config.resources.is_empty());

        let registry = config.registry().unwrap();
        assert_eq!(registry.len(), 4 * 6 + 7 + 3);
        assert!(registry.contains(&"lamp:hgcd".into()));
    }

    #[test]
    fn toml_layers_over_defaults() {
        let config = SequencerConfig::from_toml_str(
            r#"
            [engine]
            acquire_timeout = "2m"
            visit_policy = "per_exposure"

            [engine.overrides.makeMotorMap]
            device_timeout = "15m"

            [[resources]]
            name = "arm:b1"

            [[resources]]
            name = "lamp:halogen"
            class = "shared"
            "#,
        )
        .unwrap();

        assert_eq!(config.engine.acquire_timeout, Duration::from_secs(120));
        assert_eq!(config.engine.device_timeout, Duration::from_secs(60));
        assert_eq!(config.engine.visit_policy, VisitPolicy::PerExposure);
        assert_eq!(
            config.engine.device_timeout_for("makeMotorMap"),
            Duration::from_secs(900)
        );
        assert_eq!(
            config.engine.device_timeout_for("doFlat"),
            Duration::from_secs(60)
        );
        assert_eq!(
            config.engine.acquire_timeout_for("makeMotorMap"),
            Duration::from_secs(120)
        );

        let registry = config.registry().unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(config.resources[0].class, SharingClass::Exclusive);
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let err = SequencerConfig::from_toml_str("[engine]\npoll_interval = \"0s\"\n").unwrap_err();
        assert!(err.to_string().contains("poll_interval"));
    }

    #[test]
    fn load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[logging]\nlevel = \"debug\"\nformat = \"json\"").unwrap();

        let config = SequencerConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, OutputFormat::Json);
    }

    #[test]
    fn missing_file_is_not_found() {
        let err = SequencerConfig::load(Some(Path::new("/nonexistent/iic.toml"))).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
