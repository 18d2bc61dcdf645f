//! Core types and traits for the IIC sequencer.
//!
//! This crate holds everything the sequencer shares with its collaborators:
//!
//! - **Resources**: [`ResourceName`], [`ResourceRegistry`], lock modes and claims
//! - **Device interface**: the [`DeviceInterface`] trait the executor drives
//! - **Persistence hook**: the [`PersistenceSink`] trait and visit/exposure records
//! - **Errors**: the [`SequenceError`] taxonomy and [`DeviceError`]
//! - **Configuration**: figment-layered [`SequencerConfig`]
//! - **Observability**: tracing subscriber setup
//!
//! # Example
//!
//! ```rust
//! use iic_core::resource::{ResourceClaim, ResourceName, ResourceRegistry};
//!
//! let registry = ResourceRegistry::new()
//!     .with_exclusive("arm:b1")
//!     .with_shared("lamp:halogen");
//!
//! let claims = registry
//!     .validate(&[
//!         ResourceClaim::shared(ResourceName::lamp("halogen")),
//!         ResourceClaim::exclusive(ResourceName::arm("b1")),
//!     ])
//!     .unwrap();
//! assert_eq!(claims[0].name.as_str(), "arm:b1");
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod ids;
pub mod observability;
pub mod persistence;
pub mod resource;

pub use config::{EngineConfig, SequencerConfig, VisitPolicy};
pub use device::{
    CompletionToken, DeviceCommand, DeviceInterface, DeviceOutcome, DeviceReply, ParamValue, Phase,
};
pub use error::{DeviceError, DeviceErrorKind, SeqResult, SequenceError};
pub use ids::{ExposureId, SequenceId, VisitId};
pub use persistence::{
    ExposureRecord, ExposureStatus, MemorySink, NullSink, PersistenceSink, VisitRecord,
    VisitStatus,
};
pub use resource::{LockMode, ResourceClaim, ResourceName, ResourceRegistry, SharingClass};
