//! Timing configuration for realistic mode.
//!
//! Integration time comes from the command itself (`exptime`, `warmingTime`);
//! this only covers the fixed costs around it.

use std::time::Duration;

/// Fixed delays applied in [`MockMode::Realistic`](super::MockMode) and
/// [`MockMode::Chaos`](super::MockMode).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingConfig {
    /// Detector readout after an exposure.
    pub readout: Duration,
    /// Time a mechanism (hexapod, focus stage, positioners) needs to settle.
    pub settle: Duration,
    /// Command latency added to every command.
    pub latency: Duration,
}

impl TimingConfig {
    /// Timing close to the real spectrograph cameras and slit mechanisms.
    pub fn pfs() -> Self {
        Self {
            readout: Duration::from_secs(57),
            settle: Duration::from_secs(5),
            latency: Duration::from_millis(20),
        }
    }

    /// Timing where only integration time counts.
    pub fn integration_only() -> Self {
        Self::default()
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            readout: Duration::ZERO,
            settle: Duration::ZERO,
            latency: Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pfs_readout_dominates() {
        let t = TimingConfig::pfs();
        assert!(t.readout > t.settle);
        assert_eq!(TimingConfig::integration_only().readout, Duration::ZERO);
    }
}
