//! Operational modes of the simulated instrument.
//!
//! - **Instant**: every command completes on its first poll
//! - **Realistic**: integrations, lamp warm-up and readout take simulated time
//! - **Chaos**: realistic timing plus random failures

/// Operational mode of a [`MockInstrument`](crate::MockInstrument).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MockMode {
    /// Zero delays, deterministic - for unit tests
    #[default]
    Instant,
    /// Instrument-like timing - for scenario tests
    Realistic,
    /// Realistic timing with random failures - for resilience testing
    Chaos,
}

impl MockMode {
    /// Whether commands take simulated time.
    pub fn is_timed(self) -> bool {
        !matches!(self, MockMode::Instant)
    }
}
