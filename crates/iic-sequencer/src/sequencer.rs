//! Sequencer - the request and control surface.
//!
//! The `Sequencer` accepts named operations, builds and validates their
//! plans, and spawns one [`RunEngine`] task per accepted sequence. It keeps
//! every sequence in a registry so front ends can query status, send control
//! requests, wait for completion and identify "the" running sequence.
//!
//! # Usage
//!
//! ```rust,ignore
//! let sequencer = Sequencer::from_config(&config, devices, sink)?;
//! let mut events = sequencer.subscribe();
//!
//! let id = sequencer.submit("doFlat", &"cams=b1 exptime=30".parse()?)?;
//! let status = sequencer.wait(id).await?;
//! assert_eq!(status.status_code(), 0);
//! ```

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{info, instrument, Instrument};

use iic_core::config::{EngineConfig, SequencerConfig};
use iic_core::device::DeviceInterface;
use iic_core::error::{SeqResult, SequenceError};
use iic_core::ids::{IdAllocator, SequenceId};
use iic_core::persistence::PersistenceSink;
use iic_core::resource::ResourceRegistry;

use crate::events::{EventBus, SequenceEvent};
use crate::lock_manager::LockManager;
use crate::params::OperationParams;
use crate::plans::{OperationRegistry, SequencePlan};
use crate::run_engine::{EngineContext, RunEngine, SequenceRun};
use crate::sequence::{ControlFlags, ControlSignal, SequenceState, SequenceStatus};
use crate::tracker::VisitTracker;

struct SequenceEntry {
    status: Arc<RwLock<SequenceStatus>>,
    control: watch::Sender<ControlFlags>,
    state: watch::Receiver<SequenceState>,
}

/// Control surface over every sequence of one instrument.
pub struct Sequencer {
    ctx: Arc<EngineContext>,
    operations: OperationRegistry,
    ids: IdAllocator,
    sequences: RwLock<BTreeMap<SequenceId, SequenceEntry>>,
}

impl std::fmt::Debug for Sequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sequencer")
            .field("ctx", &self.ctx)
            .field("sequences", &self.sequences.read().len())
            .finish_non_exhaustive()
    }
}

impl Sequencer {
    /// Sequencer over `registry`, driving `devices` and recording to `sink`.
    pub fn new(
        config: EngineConfig,
        registry: Arc<ResourceRegistry>,
        devices: Arc<dyn DeviceInterface>,
        sink: Arc<dyn PersistenceSink>,
    ) -> Self {
        let ctx = EngineContext {
            locks: Arc::new(LockManager::new(registry)),
            devices,
            tracker: Arc::new(VisitTracker::new(sink, config.first_visit_id)),
            events: EventBus::new(config.event_capacity),
            config,
        };
        Self {
            ctx: Arc::new(ctx),
            operations: OperationRegistry::standard(),
            ids: IdAllocator::default(),
            sequences: RwLock::new(BTreeMap::new()),
        }
    }

    /// Sequencer from loaded configuration; the resource topology comes from
    /// `config.resources`, or the standard topology when that is empty.
    pub fn from_config(
        config: &SequencerConfig,
        devices: Arc<dyn DeviceInterface>,
        sink: Arc<dyn PersistenceSink>,
    ) -> SeqResult<Self> {
        let registry = config.registry()?;
        Ok(Self::new(
            config.engine.clone(),
            Arc::new(registry),
            devices,
            sink,
        ))
    }

    /// Replaces the operation registry.
    pub fn with_operations(mut self, operations: OperationRegistry) -> Self {
        self.operations = operations;
        self
    }

    /// Resource manager shared by all sequences.
    pub fn locks(&self) -> &Arc<LockManager> {
        &self.ctx.locks
    }

    /// Visit and exposure records.
    pub fn tracker(&self) -> &Arc<VisitTracker> {
        &self.ctx.tracker
    }

    /// Registered operations.
    pub fn operations(&self) -> &OperationRegistry {
        &self.operations
    }

    /// Builds `operation` with `params` and submits it.
    ///
    /// Parameter and resource validation happen before anything is queued,
    /// so a rejected request leaves no trace.
    pub fn submit(&self, operation: &str, params: &OperationParams) -> SeqResult<SequenceId> {
        let plan = self.operations.build(operation, params)?;
        self.submit_plan(plan)
    }

    /// Submits an already built plan.
    #[instrument(skip_all, fields(operation = %plan.operation))]
    pub fn submit_plan(&self, plan: SequencePlan) -> SeqResult<SequenceId> {
        let registry = self.ctx.locks.registry();
        for step in plan.steps.iter().chain(plan.teardown.iter()) {
            registry.validate(&step.claims)?;
        }

        let id: SequenceId = self.ids.next();
        let mut status = SequenceStatus::new(id, &plan);
        status.state = SequenceState::Queued;
        let status = Arc::new(RwLock::new(status));
        let (control_tx, control_rx) = watch::channel(ControlFlags::default());
        let (state_tx, state_rx) = watch::channel(SequenceState::Queued);

        self.sequences.write().insert(
            id,
            SequenceEntry {
                status: Arc::clone(&status),
                control: control_tx,
                state: state_rx,
            },
        );
        info!(
            sequence_id = %id,
            steps = plan.len(),
            resources = ?plan.resources,
            "Sequence queued"
        );
        self.ctx.events.publish(SequenceEvent::StateChanged {
            sequence: id,
            state: SequenceState::Queued,
            at: chrono::Utc::now(),
        });

        let engine = RunEngine::new(
            Arc::clone(&self.ctx),
            SequenceRun {
                id,
                plan,
                status,
                control: control_rx,
                state_tx,
            },
        );
        tokio::spawn(engine.run().in_current_span());
        Ok(id)
    }

    fn signal(&self, id: SequenceId, signal: ControlSignal, action: &str) -> SeqResult<()> {
        let sequences = self.sequences.read();
        let entry = sequences
            .get(&id)
            .ok_or(SequenceError::UnknownSequence(id))?;
        let state = entry.status.read().state;
        if state.is_terminal() {
            return Err(SequenceError::InvalidState {
                id,
                action: action.to_string(),
                state: state.to_string(),
            });
        }
        if signal == ControlSignal::Finish {
            entry.status.write().finish_requested = true;
        }
        entry.control.send_modify(|flags| flags.apply(signal));
        info!(sequence_id = %id, signal = ?signal, "Control request");
        self.ctx.events.publish(SequenceEvent::Control {
            sequence: id,
            signal,
        });
        Ok(())
    }

    /// Aborts `id`: in-flight commands are stopped, teardown runs, locks are
    /// released and the sequence ends `Aborted`.
    pub fn abort(&self, id: SequenceId) -> SeqResult<()> {
        self.signal(id, ControlSignal::Abort, "abort")
    }

    /// Pauses `id` at the next step boundary.
    pub fn pause(&self, id: SequenceId) -> SeqResult<()> {
        self.signal(id, ControlSignal::Pause, "pause")
    }

    /// Lifts a pause.
    pub fn resume(&self, id: SequenceId) -> SeqResult<()> {
        self.signal(id, ControlSignal::Resume, "resume")
    }

    /// Lets the in-flight step finish, then completes without running the
    /// remaining steps.
    pub fn finish(&self, id: SequenceId) -> SeqResult<()> {
        self.signal(id, ControlSignal::Finish, "finish")
    }

    /// Status snapshot of `id`.
    pub fn status(&self, id: SequenceId) -> SeqResult<SequenceStatus> {
        self.sequences
            .read()
            .get(&id)
            .map(|entry| entry.status.read().clone())
            .ok_or(SequenceError::UnknownSequence(id))
    }

    /// Status of every known sequence, oldest first.
    pub fn list(&self) -> Vec<SequenceStatus> {
        self.sequences
            .read()
            .values()
            .map(|entry| entry.status.read().clone())
            .collect()
    }

    /// Waits until `id` terminates and returns its final status.
    pub async fn wait(&self, id: SequenceId) -> SeqResult<SequenceStatus> {
        let mut state = self
            .sequences
            .read()
            .get(&id)
            .map(|entry| entry.state.clone())
            .ok_or(SequenceError::UnknownSequence(id))?;
        // An error means the engine task is gone; report what it left behind.
        let _ = state.wait_for(|s| s.is_terminal()).await;
        self.status(id)
    }

    /// Sequences that have been accepted and not terminated.
    pub fn active(&self) -> Vec<SequenceId> {
        self.sequences
            .read()
            .iter()
            .filter(|(_, entry)| entry.status.read().state.is_active())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Resolves the sequence a front-end command refers to.
    ///
    /// With an explicit id, checks that it exists. Without one, returns the
    /// single active sequence and fails if there are none or several.
    pub fn identify(&self, id: Option<SequenceId>) -> SeqResult<SequenceId> {
        if let Some(id) = id {
            return if self.sequences.read().contains_key(&id) {
                Ok(id)
            } else {
                Err(SequenceError::UnknownSequence(id))
            };
        }
        match self.active().as_slice() {
            [only] => Ok(*only),
            [] => Err(SequenceError::Identification(
                "no active sequence".to_string(),
            )),
            many => Err(SequenceError::Identification(format!(
                "{} active sequences, specify one of {}",
                many.len(),
                many.iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }

    /// Subscribes to sequence events.
    pub fn subscribe(&self) -> broadcast::Receiver<SequenceEvent> {
        self.ctx.events.subscribe()
    }

    /// Drops terminated sequences, and their visits, that ended more than
    /// the archive retention ago. Returns the number of sequences dropped.
    pub fn cleanup(&self) -> usize {
        let retention = chrono::Duration::from_std(self.ctx.config.archive_retention)
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = chrono::Utc::now()
            .checked_sub_signed(retention)
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);
        self.cleanup_before(cutoff)
    }

    /// Drops terminated sequences that ended before `cutoff`.
    pub fn cleanup_before(&self, cutoff: chrono::DateTime<chrono::Utc>) -> usize {
        let mut sequences = self.sequences.write();
        let before = sequences.len();
        sequences.retain(|_, entry| {
            let status = entry.status.read();
            !(status.is_terminal() && status.ended_at.is_some_and(|end| end < cutoff))
        });
        let removed = before - sequences.len();
        drop(sequences);
        let visits = self.ctx.tracker.prune_before(cutoff);
        if removed > 0 || visits > 0 {
            info!(sequences = removed, visits, "Archived records cleaned up");
        }
        removed
    }
}
