//! Sequence execution engine and resource manager.
//!
//! This crate turns named instrument operations into ordered steps and runs
//! them against shared hardware:
//!
//! - **Builder** ([`plans`], [`plans_sps`], [`plans_fps`]): operation name +
//!   parameters → validated [`SequencePlan`]
//! - **Resource manager** ([`lock_manager`]): shared/exclusive locks with FIFO
//!   queuing and timeouts
//! - **Executor** ([`run_engine`]): per-sequence state machine with retries,
//!   convergence loops, teardown and cooperative cancellation
//! - **Tracker** ([`tracker`]): visit and exposure identity
//! - **Control surface** ([`sequencer`]): submit, abort, pause, resume, finish,
//!   status, wait and identify
//!
//! # Example
//!
//! ```rust,ignore
//! use iic_sequencer::Sequencer;
//!
//! let sequencer = Sequencer::from_config(&config, devices, Arc::new(NullSink))?;
//! let id = sequencer.submit("biases", &"cams=b1,r1 nExposures=5".parse()?)?;
//! let status = sequencer.wait(id).await?;
//! println!("{} exposures, code {}", status.exposures.len(), status.status_code());
//! ```

pub mod events;
pub mod lock_manager;
pub mod params;
pub mod plans;
pub mod plans_fps;
pub mod plans_sps;
pub mod run_engine;
pub mod sequence;
pub mod sequencer;
pub mod step;
pub mod tracker;

pub use events::{EventBus, SequenceEvent};
pub use lock_manager::{LockManager, LockSet, LockState, LockView};
pub use params::OperationParams;
pub use plans::{build, OperationKind, OperationRegistry, SequencePlan};
pub use run_engine::{EngineContext, RunEngine};
pub use sequence::{ControlSignal, SequenceState, SequenceStatus};
pub use sequencer::Sequencer;
pub use step::{Completion, RetryPolicy, Step, StepKind};
pub use tracker::{ExposureOutcome, VisitTracker};
