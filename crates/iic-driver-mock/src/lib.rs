//! Simulated instrument for the IIC sequencer.
//!
//! This crate provides a [`DeviceInterface`](iic_core::device::DeviceInterface)
//! implementation for testing the sequencer without hardware. All delays use
//! `tokio::time`, so tests running with a paused clock finish instantly.
//!
//! # Modes
//!
//! - [`MockMode::Instant`]: every command completes on its first poll
//! - [`MockMode::Realistic`]: exposures integrate for `exptime`, lamps warm
//!   up, detectors read out
//! - [`MockMode::Chaos`]: realistic timing plus seeded random failures
//!
//! # Example
//!
//! ```rust,ignore
//! use iic_driver_mock::{ErrorConfig, ErrorScenario, MockInstrument, TimingConfig};
//!
//! let mock = MockInstrument::realistic(TimingConfig::pfs())
//!     .with_errors(ErrorConfig::scenario(ErrorScenario::fail_times("expose", 1)));
//! ```

pub mod common;
mod mock_instrument;

pub use common::{ErrorConfig, ErrorScenario, MockMode, MockRng, TimingConfig};
pub use mock_instrument::{CallKind, CallRecord, LockGuard, MockInstrument};
