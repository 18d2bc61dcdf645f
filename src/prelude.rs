//! Prelude module for convenient imports
//!
//! ```rust,ignore
//! use iic::prelude::*;
//! ```
//!
//! Re-exports are grouped by the crate they come from.

// =============================================================================
// Core Types & Errors
// =============================================================================

pub use iic_core::config::{EngineConfig, SequencerConfig, VisitPolicy};
pub use iic_core::device::{DeviceCommand, DeviceInterface, DeviceOutcome, DeviceReply};
pub use iic_core::error::{DeviceError, DeviceErrorKind, SeqResult, SequenceError};
pub use iic_core::ids::{ExposureId, SequenceId, VisitId};
pub use iic_core::persistence::{MemorySink, NullSink, PersistenceSink};
pub use iic_core::resource::{LockMode, ResourceClaim, ResourceName, ResourceRegistry};

// =============================================================================
// Sequencer
// =============================================================================

pub use iic_sequencer::{
    OperationParams, SequenceEvent, SequencePlan, SequenceState, SequenceStatus, Sequencer,
};

// =============================================================================
// Simulation
// =============================================================================

pub use iic_driver_mock::{MockInstrument, MockMode, TimingConfig};
