//! Startup wiring: configuration, logging and the sequencer.
//!
//! Configuration is layered defaults → TOML file → `IIC_*` environment
//! variables. The tracing subscriber is installed from its `[logging]`
//! section before anything else logs.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use iic_core::config::SequencerConfig;
use iic_core::device::DeviceInterface;
use iic_core::observability;
use iic_core::persistence::{NullSink, PersistenceSink};
use iic_driver_mock::{MockInstrument, TimingConfig};
use iic_sequencer::Sequencer;

/// Loads configuration from `path`, installs tracing and builds a sequencer
/// driving `devices`.
pub fn start(
    path: Option<&Path>,
    devices: Arc<dyn DeviceInterface>,
    sink: Arc<dyn PersistenceSink>,
) -> Result<Sequencer> {
    let config = SequencerConfig::load(path)?;
    observability::init_from_config(&config.logging)?;
    build(&config, devices, sink)
}

/// Builds a sequencer from already loaded configuration.
pub fn build(
    config: &SequencerConfig,
    devices: Arc<dyn DeviceInterface>,
    sink: Arc<dyn PersistenceSink>,
) -> Result<Sequencer> {
    let sequencer = Sequencer::from_config(config, devices, sink)
        .context("Failed to build the resource registry")?;
    info!(
        resources = sequencer.locks().registry().len(),
        operations = sequencer.operations().list().len(),
        "Sequencer ready"
    );
    Ok(sequencer)
}

/// Sequencer driving a simulated instrument with PFS-like timing, for dry
/// runs of operation plans.
pub fn simulator(config: &SequencerConfig) -> Result<(Sequencer, Arc<MockInstrument>)> {
    let mock = Arc::new(MockInstrument::realistic(TimingConfig::pfs()));
    let devices: Arc<dyn DeviceInterface> = mock.clone();
    let sequencer = build(config, devices, Arc::new(NullSink))?;
    Ok((sequencer, mock))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulator_knows_the_standard_operations() {
        let (sequencer, mock) = simulator(&SequencerConfig::default()).unwrap();
        assert!(sequencer.operations().list().len() >= 15);
        assert_eq!(mock.in_flight(), 0);
    }

    #[test]
    fn bad_resource_topology_is_reported() {
        let config = SequencerConfig::from_toml_str(
            r#"
            [[resources]]
            name = "arm:b1"
            class = "exclusive"

            [[resources]]
            name = "arm:b1"
            class = "shared"
            "#,
        )
        .unwrap();
        let err = build(&config, Arc::new(MockInstrument::instant()), Arc::new(NullSink))
            .unwrap_err();
        assert!(err.to_string().contains("resource registry"));
    }
}
