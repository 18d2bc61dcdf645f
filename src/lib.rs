//! # IIC Sequencer
//!
//! Sequence execution engine and resource manager for the instrument
//! control actor of the Prime Focus Spectrograph. Front ends submit named
//! operations (`doFlat`, `arcs`, `makeMotorMap`, ...); the sequencer turns
//! them into ordered steps, arbitrates the shared hardware between
//! concurrent sequences and tracks the visits and exposures they produce.
//!
//! ## Recommended Usage
//!
//! **Use [`prelude`] for convenient imports:**
//!
//! ```rust,ignore
//! use iic::prelude::*;
//!
//! let sequencer = iic::bootstrap::start(Some(Path::new("iic.toml")), devices, sink)?;
//! let id = sequencer.submit("doFlat", &"cams=b1 exptime=30 nExposures=3".parse()?)?;
//! let status = sequencer.wait(id).await?;
//! ```
//!
//! ## Crate Structure
//!
//! - **`iic-core`**: resources, the device interface, errors, configuration
//!   and tracing setup
//! - **`iic-sequencer`**: builder, resource manager, executor, tracker and
//!   the control surface
//! - **`iic-driver-mock`**: simulated instrument for tests and dry runs
//! - **[`bootstrap`]**: wiring of configuration, logging and the sequencer

pub mod bootstrap;
pub mod prelude;

pub use iic_core as core;
pub use iic_driver_mock as mock;
pub use iic_sequencer as sequencer;
