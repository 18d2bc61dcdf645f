//! RunEngine - executes one accepted sequence.
//!
//! Every accepted sequence gets its own `RunEngine`, spawned as its own tokio
//! task by the [`Sequencer`](crate::sequencer::Sequencer). The engine walks the
//! plan step by step:
//!
//! 1. acquire the step's claims that are not already held
//! 2. dispatch the step's commands (fanned out concurrently)
//! 3. poll until the completion predicate holds, retrying on device errors
//! 4. release the locks the next step does not need
//!
//! # Cancellation
//!
//! Operator requests arrive through a `watch` channel of [`ControlFlags`]. An
//! abort is observed while queued for locks, while commands are in flight,
//! during waits and backoffs, and between convergence iterations. Pause and
//! finish are honored at step boundaries only.
//!
//! # Exit paths
//!
//! Whatever the outcome, teardown steps run best-effort and every lock is
//! released in reverse acquisition order before the terminal state is
//! published.

use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use iic_core::config::{EngineConfig, VisitPolicy};
use iic_core::device::{DeviceCommand, DeviceInterface, DeviceOutcome, DeviceReply, Phase};
use iic_core::error::{DeviceError, DeviceErrorKind, SeqResult, SequenceError};
use iic_core::ids::{ExposureId, SequenceId, VisitId};
use iic_core::persistence::{ExposureStatus, VisitStatus};
use iic_core::resource::{normalize_claims, LockMode, ResourceClaim, ResourceName};

use crate::events::{EventBus, SequenceEvent};
use crate::lock_manager::{LockManager, LockSet};
use crate::plans::SequencePlan;
use crate::sequence::{
    ControlFlags, ConvergenceProgress, FailureReason, SequenceState, SequenceStatus,
};
use crate::step::{Completion, ConvergenceSpec, IterationState, Step, StepKind};
use crate::tracker::{ExposureOutcome, VisitTracker};

/// Collaborators shared by every engine of a sequencer.
pub struct EngineContext {
    /// Resource manager.
    pub locks: Arc<LockManager>,
    /// Device access.
    pub devices: Arc<dyn DeviceInterface>,
    /// Visit and exposure records.
    pub tracker: Arc<VisitTracker>,
    /// Event fan-out.
    pub events: EventBus,
    /// Timeouts and policies.
    pub config: EngineConfig,
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("locks", &self.locks)
            .field("tracker", &self.tracker)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Everything the control surface hands to a new engine.
#[derive(Debug)]
pub struct SequenceRun {
    /// Sequence identifier.
    pub id: SequenceId,
    /// Validated plan.
    pub plan: SequencePlan,
    /// Status shared with the control surface.
    pub status: Arc<RwLock<SequenceStatus>>,
    /// Operator requests.
    pub control: watch::Receiver<ControlFlags>,
    /// Lifecycle notifications, for `wait()`.
    pub state_tx: watch::Sender<SequenceState>,
}

/// How the main steps ended.
#[derive(Debug)]
enum Exit {
    Completed,
    Finished,
    Aborted,
    Failed(FailureReason),
}

/// Why a step did not complete.
#[derive(Debug)]
enum StepError {
    Aborted,
    Failed(SequenceError),
}

impl From<SequenceError> for StepError {
    fn from(e: SequenceError) -> Self {
        StepError::Failed(e)
    }
}

impl From<DeviceError> for StepError {
    fn from(e: DeviceError) -> Self {
        StepError::Failed(e.into())
    }
}

// =============================================================================
// Held locks
// =============================================================================

#[derive(Debug)]
struct HeldSet {
    set: LockSet,
    live: BTreeMap<ResourceName, LockMode>,
}

/// Lock sets held by one sequence, in acquisition order.
#[derive(Debug, Default)]
struct HeldLocks {
    sets: Vec<HeldSet>,
}

impl HeldLocks {
    fn mode_of(&self, name: &ResourceName) -> Option<LockMode> {
        self.sets.iter().find_map(|h| h.live.get(name).copied())
    }

    fn holds(&self, name: &ResourceName) -> bool {
        self.mode_of(name).is_some()
    }

    /// Claims still to acquire, and held resources that need an upgrade
    /// from shared to exclusive first.
    fn missing(&self, claims: &[ResourceClaim]) -> (Vec<ResourceClaim>, Vec<ResourceName>) {
        let mut wanted = Vec::new();
        let mut upgrades = Vec::new();
        for claim in claims {
            match self.mode_of(&claim.name) {
                Some(held) if held.covers(claim.mode) => {}
                Some(_) => {
                    upgrades.push(claim.name.clone());
                    wanted.push(claim.clone());
                }
                None => wanted.push(claim.clone()),
            }
        }
        (wanted, upgrades)
    }

    fn push(&mut self, set: LockSet) {
        let live = set
            .claims()
            .iter()
            .map(|c| (c.name.clone(), c.mode))
            .collect();
        self.sets.push(HeldSet { set, live });
    }

    fn names(&self) -> Vec<ResourceName> {
        self.sets
            .iter()
            .flat_map(|h| h.live.keys().cloned())
            .collect()
    }

    /// Releases `names` from whichever sets hold them, newest set first.
    fn release_names(&mut self, locks: &LockManager, names: &[ResourceName]) {
        if names.is_empty() {
            return;
        }
        for held in self.sets.iter_mut().rev() {
            let here: Vec<ResourceName> = names
                .iter()
                .filter(|n| held.live.contains_key(*n))
                .cloned()
                .collect();
            if here.is_empty() {
                continue;
            }
            locks.release_resources(&held.set, &here);
            for name in &here {
                held.live.remove(name);
            }
        }
        self.sets.retain(|h| !h.live.is_empty());
    }

    /// Releases every set in reverse acquisition order.
    fn release_all(&mut self, locks: &LockManager) {
        while let Some(held) = self.sets.pop() {
            locks.release(&held.set);
        }
    }

    fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

/// Resolves once an abort has been requested. Never resolves if the control
/// surface went away.
async fn abort_signal(mut control: watch::Receiver<ControlFlags>) {
    loop {
        if control.borrow_and_update().abort {
            return;
        }
        if control.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

// =============================================================================
// RunEngine
// =============================================================================

/// Executor of a single sequence.
pub struct RunEngine {
    ctx: Arc<EngineContext>,
    id: SequenceId,
    plan: SequencePlan,
    status: Arc<RwLock<SequenceStatus>>,
    control: watch::Receiver<ControlFlags>,
    state_tx: watch::Sender<SequenceState>,
    held: HeldLocks,
    visit: Option<VisitId>,
    started: bool,
}

impl RunEngine {
    /// Engine for `run`, driving hardware through `ctx`.
    pub fn new(ctx: Arc<EngineContext>, run: SequenceRun) -> Self {
        Self {
            ctx,
            id: run.id,
            plan: run.plan,
            status: run.status,
            control: run.control,
            state_tx: run.state_tx,
            held: HeldLocks::default(),
            visit: None,
            started: false,
        }
    }

    /// Runs the sequence to a terminal state and returns its final status.
    #[instrument(skip_all, fields(sequence_id = %self.id, operation = %self.plan.operation))]
    pub async fn run(mut self) -> SequenceStatus {
        info!(steps = self.plan.len(), "Sequence starting");
        let exit = self.run_steps().await;

        let interim = match exit {
            Exit::Completed | Exit::Finished => SequenceState::Finishing,
            Exit::Aborted | Exit::Failed(_) => SequenceState::Aborting,
        };
        self.set_state(interim);
        self.update(|s| s.convergence = None);

        self.run_teardown().await;
        self.held.release_all(&self.ctx.locks);

        let exit = self.close_visit(exit);
        let terminal = match exit {
            Exit::Completed | Exit::Finished => SequenceState::Completed,
            Exit::Aborted => {
                let step = self.status.read().current_step;
                self.update(|s| {
                    s.last_error = Some(FailureReason {
                        step,
                        error: SequenceError::AbortRequested,
                    })
                });
                SequenceState::Aborted
            }
            Exit::Failed(reason) => {
                error!(step = ?reason.step, error = %reason.error, "Sequence failed");
                self.update(|s| s.last_error = Some(reason));
                SequenceState::Failed
            }
        };
        self.update(|s| {
            s.paused = false;
            s.ended_at = Some(chrono::Utc::now());
        });
        self.set_state(terminal);

        let status = self.status.read().clone();
        info!(
            state = %status.state,
            code = status.status_code(),
            exposures = status.exposures.len(),
            "Sequence complete"
        );
        status
    }

    async fn run_steps(&mut self) -> Exit {
        let steps = self.plan.steps.clone();
        // The first teardown step follows the last plan step.
        let after_last = self.plan.teardown.first().cloned();
        for (index, step) in steps.iter().enumerate() {
            let flags = *self.control.borrow();
            if flags.abort {
                return Exit::Aborted;
            }
            if let Err(StepError::Aborted) = self.hold_while_paused().await {
                return Exit::Aborted;
            }
            if self.control.borrow().finish {
                info!(step = index, "Finish requested; skipping remaining steps");
                return Exit::Finished;
            }

            self.update(|s| s.current_step = Some(index));
            match self.acquire_for(step).await {
                Ok(()) => {}
                Err(StepError::Aborted) => return Exit::Aborted,
                Err(StepError::Failed(error)) => {
                    return Exit::Failed(FailureReason {
                        step: Some(index),
                        error,
                    })
                }
            }
            if !self.started {
                self.started = true;
                self.update(|s| s.started_at = Some(chrono::Utc::now()));
                self.set_state(SequenceState::Running);
            }

            self.publish(SequenceEvent::StepStarted {
                sequence: self.id,
                index,
                kind: step.kind,
                label: step.label.clone(),
            });
            match self.execute_step(index, step).await {
                Ok(()) => {
                    self.publish(SequenceEvent::StepCompleted {
                        sequence: self.id,
                        index,
                    });
                }
                Err(StepError::Aborted) => return Exit::Aborted,
                Err(StepError::Failed(error)) => {
                    return Exit::Failed(FailureReason {
                        step: Some(index),
                        error,
                    })
                }
            }
            self.release_unneeded(steps.get(index + 1).or(after_last.as_ref()));
        }
        Exit::Completed
    }

    /// Blocks at a step boundary while a pause is in effect. Locks stay held.
    async fn hold_while_paused(&mut self) -> Result<(), StepError> {
        if !self.control.borrow().pause {
            return Ok(());
        }
        info!("Sequence paused");
        self.update(|s| s.paused = true);
        self.publish(SequenceEvent::Paused {
            sequence: self.id,
            paused: true,
        });

        let mut control = self.control.clone();
        loop {
            let flags = *control.borrow_and_update();
            if flags.abort {
                return Err(StepError::Aborted);
            }
            if !flags.pause || flags.finish {
                break;
            }
            if control.changed().await.is_err() {
                break;
            }
        }

        info!("Sequence resumed");
        self.update(|s| s.paused = false);
        self.publish(SequenceEvent::Paused {
            sequence: self.id,
            paused: false,
        });
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Locks
    // -------------------------------------------------------------------------

    #[instrument(skip_all, fields(step = %step.label))]
    async fn acquire_for(&mut self, step: &Step) -> Result<(), StepError> {
        let claims = normalize_claims(&step.claims)?;
        let (wanted, upgrades) = self.held.missing(&claims);
        if wanted.is_empty() {
            return Ok(());
        }
        if !upgrades.is_empty() {
            debug!(resources = ?upgrades, "Upgrading shared locks to exclusive");
            self.held.release_names(&self.ctx.locks, &upgrades);
        }

        let timeout = self
            .ctx
            .config
            .acquire_timeout_for(self.plan.operation.name());
        let locks = Arc::clone(&self.ctx.locks);
        let set = tokio::select! {
            result = locks.acquire(self.id, &wanted, timeout) => result?,
            _ = abort_signal(self.control.clone()) => {
                info!("Abort while queued for locks");
                return Err(StepError::Aborted);
            }
        };
        debug!(set = set.id(), "Locks granted");
        self.held.push(set);
        Ok(())
    }

    /// Releases held resources the next step (or the first teardown step)
    /// does not claim.
    fn release_unneeded(&mut self, next: Option<&Step>) {
        let keep: Vec<&ResourceName> = next.map(|s| s.resources().collect()).unwrap_or_default();
        let drop: Vec<ResourceName> = self
            .held
            .names()
            .into_iter()
            .filter(|n| !keep.contains(&n))
            .collect();
        if !drop.is_empty() {
            debug!(resources = ?drop, "Releasing locks not needed by the next step");
            self.held.release_names(&self.ctx.locks, &drop);
        }
    }

    // -------------------------------------------------------------------------
    // Steps
    // -------------------------------------------------------------------------

    #[instrument(skip(self, step), fields(kind = %step.kind))]
    async fn execute_step(&mut self, index: usize, step: &Step) -> Result<(), StepError> {
        let exposures = if step.kind == StepKind::Expose {
            self.open_exposures(index, step)?
        } else {
            HashMap::new()
        };

        let mut attempt = 1;
        loop {
            let result = match &step.completion {
                Completion::Immediate => {
                    info!(note = %step.label, "Annotation");
                    self.publish(SequenceEvent::Annotation {
                        sequence: self.id,
                        text: step.label.clone(),
                    });
                    Ok(())
                }
                Completion::Elapsed { duration } => self.sleep_or_abort(*duration).await,
                Completion::AllDone => self
                    .dispatch(&step.commands, self.device_timeout(step), &exposures)
                    .await
                    .map(|_| ()),
                Completion::Converge(spec) => self.converge(index, step, spec).await,
            };

            match result {
                Err(StepError::Failed(e)) if e.is_retryable() && attempt < step.retry.max_attempts => {
                    let delay = step.retry.delay_after(attempt);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Step failed; retrying");
                    self.publish(SequenceEvent::StepRetry {
                        sequence: self.id,
                        index,
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                        error: e,
                    });
                    self.sleep_or_abort(delay).await?;
                    attempt += 1;
                }
                Ok(()) => {
                    if step.kind == StepKind::Expose
                        && self.ctx.config.visit_policy == VisitPolicy::PerExposure
                    {
                        if let Some(visit) = self.visit.take() {
                            self.finish_visit(visit, VisitStatus::Finished)?;
                        }
                    }
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn device_timeout(&self, step: &Step) -> Duration {
        let config = &self.ctx.config;
        config
            .overrides
            .get(self.plan.operation.name())
            .and_then(|o| o.device_timeout)
            .or(step.timeout)
            .unwrap_or(config.device_timeout)
    }

    async fn sleep_or_abort(&self, duration: Duration) -> Result<(), StepError> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = abort_signal(self.control.clone()) => Err(StepError::Aborted),
        }
    }

    /// Runs `commands` concurrently. On abort, stops the commanded resources
    /// and gives the in-flight commands the abort grace period to settle.
    async fn dispatch(
        &self,
        commands: &[DeviceCommand],
        timeout: Duration,
        exposures: &HashMap<ResourceName, ExposureId>,
    ) -> Result<Vec<DeviceReply>, StepError> {
        let run = self.run_commands(commands, timeout, exposures);
        tokio::pin!(run);
        tokio::select! {
            results = &mut run => results.map_err(StepError::Failed),
            _ = abort_signal(self.control.clone()) => {
                warn!("Abort requested; stopping in-flight commands");
                self.stop_resources(commands).await;
                let grace = self.ctx.config.abort_grace;
                if tokio::time::timeout(grace, &mut run).await.is_err() {
                    warn!(grace_ms = grace.as_millis() as u64, "In-flight commands did not settle within abort grace");
                }
                Err(StepError::Aborted)
            }
        }
    }

    async fn run_commands(
        &self,
        commands: &[DeviceCommand],
        timeout: Duration,
        exposures: &HashMap<ResourceName, ExposureId>,
    ) -> SeqResult<Vec<DeviceReply>> {
        let results = join_all(commands.iter().map(|command| {
            self.run_command(command, timeout, exposures.get(&command.resource).copied())
        }))
        .await;
        results.into_iter().collect()
    }

    #[instrument(skip(self, command, exposure), fields(resource = %command.resource, verb = %command.verb))]
    async fn run_command(
        &self,
        command: &DeviceCommand,
        timeout: Duration,
        exposure: Option<ExposureId>,
    ) -> SeqResult<DeviceReply> {
        if !self.held.holds(&command.resource) {
            return Err(SequenceError::invalid(format!(
                "refusing to command '{}' without holding its lock",
                command.resource
            )));
        }
        if let Some(id) = exposure {
            self.ctx.tracker.mark_exposing(id)?;
            self.exposure_event(id, ExposureStatus::Exposing);
        }

        let result = self.await_command(command, timeout, exposure).await;

        if let Some(id) = exposure {
            let (outcome, status) = match &result {
                Ok(_) => (ExposureOutcome::Done, ExposureStatus::Done),
                Err(e) => (ExposureOutcome::Failed(e.to_string()), ExposureStatus::Failed),
            };
            self.ctx.tracker.complete_exposure(id, outcome)?;
            self.exposure_event(id, status);
        }
        result
    }

    async fn await_command(
        &self,
        command: &DeviceCommand,
        timeout: Duration,
        exposure: Option<ExposureId>,
    ) -> SeqResult<DeviceReply> {
        debug!(command = %command, "Dispatching");
        let deadline = Instant::now() + timeout;
        let silent = || {
            SequenceError::from(DeviceError::new(
                command.resource.as_str(),
                DeviceErrorKind::Timeout,
                format!("no completion within {}s", timeout.as_secs_f64()),
            ))
        };
        let token = tokio::time::timeout_at(deadline, self.ctx.devices.dispatch(command))
            .await
            .map_err(|_| silent())??;

        let mut reading = false;
        loop {
            let outcome = tokio::time::timeout_at(deadline, self.ctx.devices.poll(&token))
                .await
                .map_err(|_| silent())?;
            match outcome {
                DeviceOutcome::Done(reply) => {
                    debug!(measurement = ?reply.measurement, "Command done");
                    return Ok(reply);
                }
                DeviceOutcome::Error(e) => {
                    warn!(error = %e, "Command failed");
                    return Err(e.into());
                }
                DeviceOutcome::InProgress(Phase::Readout) if !reading => {
                    reading = true;
                    if let Some(id) = exposure {
                        self.ctx.tracker.mark_reading(id)?;
                        self.exposure_event(id, ExposureStatus::Reading);
                    }
                }
                DeviceOutcome::InProgress(_) => {}
            }
            if Instant::now() >= deadline {
                return Err(silent());
            }
            tokio::time::sleep(self.ctx.config.poll_interval).await;
        }
    }

    async fn stop_resources(&self, commands: &[DeviceCommand]) {
        let mut resources: Vec<&ResourceName> = commands.iter().map(|c| &c.resource).collect();
        resources.sort();
        resources.dedup();
        let results = join_all(resources.iter().map(|r| self.ctx.devices.stop(r))).await;
        for (resource, result) in resources.iter().zip(results) {
            if let Err(e) = result {
                warn!(resource = %resource, error = %e, "stop() failed");
            }
        }
    }

    /// Move/measure/evaluate loop. A failed iteration command fails the
    /// step; running out of iterations fails it with `ConvergenceFailure`.
    async fn converge(
        &self,
        index: usize,
        step: &Step,
        spec: &ConvergenceSpec,
    ) -> Result<(), StepError> {
        let timeout = self.device_timeout(step);
        let no_exposures = HashMap::new();
        let mut state = IterationState::new(spec.max_iterations);
        loop {
            if self.control.borrow().abort {
                return Err(StepError::Aborted);
            }
            let mut measurement = None;
            for command in &spec.cycle {
                let replies = self
                    .dispatch(std::slice::from_ref(command), timeout, &no_exposures)
                    .await?;
                if let Some(m) = replies.first().and_then(|r| r.measurement) {
                    measurement = Some(m);
                }
            }
            state.record(measurement);

            info!(
                iteration = state.iteration,
                cap = state.cap,
                measurement = ?state.last_measurement,
                tolerance = spec.tolerance,
                "Convergence iteration"
            );
            self.update(|s| {
                s.convergence = Some(ConvergenceProgress {
                    step: index,
                    iteration: state.iteration,
                    cap: state.cap,
                    last_measurement: state.last_measurement,
                })
            });
            self.publish(SequenceEvent::Convergence {
                sequence: self.id,
                index,
                iteration: state.iteration,
                cap: state.cap,
                measurement: state.last_measurement,
            });

            if state.converged(spec.tolerance) {
                return Ok(());
            }
            if state.exhausted() {
                return Err(StepError::Failed(SequenceError::ConvergenceFailure {
                    iterations: state.iteration,
                    last_measurement: state.last_measurement,
                }));
            }
        }
    }

    // -------------------------------------------------------------------------
    // Teardown
    // -------------------------------------------------------------------------

    async fn run_teardown(&mut self) {
        if !self.started || self.plan.teardown.is_empty() {
            return;
        }
        let limit = self.ctx.config.teardown_timeout;
        let teardown = self.plan.teardown.clone();
        for step in &teardown {
            let result = match tokio::time::timeout(limit, self.teardown_step(step)).await {
                Ok(result) => result,
                Err(_) => Err(SequenceError::invalid(format!(
                    "teardown exceeded {}s",
                    limit.as_secs_f64()
                ))),
            };
            match result {
                Ok(()) => debug!(step = %step.label, "Teardown step done"),
                Err(e) => {
                    warn!(step = %step.label, error = %e, "Teardown step failed");
                    let message = format!("teardown '{}': {e}", step.label);
                    self.update(|s| s.warnings.push(message));
                    self.publish(SequenceEvent::TeardownWarning {
                        sequence: self.id,
                        label: step.label.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
    }

    /// Teardown steps ignore abort requests; they run after one.
    async fn teardown_step(&mut self, step: &Step) -> SeqResult<()> {
        let claims = normalize_claims(&step.claims)?;
        let (wanted, upgrades) = self.held.missing(&claims);
        if !wanted.is_empty() {
            self.held.release_names(&self.ctx.locks, &upgrades);
            let set = self
                .ctx
                .locks
                .acquire(self.id, &wanted, self.ctx.config.teardown_timeout)
                .await?;
            self.held.push(set);
        }
        match &step.completion {
            Completion::Elapsed { duration } => {
                tokio::time::sleep(*duration).await;
                Ok(())
            }
            Completion::Immediate | Completion::Converge(_) => Ok(()),
            Completion::AllDone => self
                .run_commands(&step.commands, self.device_timeout(step), &HashMap::new())
                .await
                .map(|_| ()),
        }
    }

    // -------------------------------------------------------------------------
    // Visits and exposures
    // -------------------------------------------------------------------------

    fn open_exposures(
        &mut self,
        index: usize,
        step: &Step,
    ) -> SeqResult<HashMap<ResourceName, ExposureId>> {
        let visit = match self.visit {
            Some(visit) => visit,
            None => {
                let visit = self.ctx.tracker.begin_visit(self.id)?;
                info!(visit_id = %visit, "Visit opened");
                self.visit = Some(visit);
                self.update(|s| {
                    s.visit = Some(visit);
                    s.visits.push(visit);
                });
                self.publish(SequenceEvent::Visit {
                    sequence: self.id,
                    visit,
                    open: true,
                });
                visit
            }
        };
        let mut exposures = HashMap::new();
        for command in &step.commands {
            let id = self
                .ctx
                .tracker
                .begin_exposure(visit, &command.resource, index)?;
            debug!(visit_id = %visit, exposure_id = %id, resource = %command.resource, "Exposure assigned");
            exposures.insert(command.resource.clone(), id);
            self.update(|s| {
                if !s.exposures.contains(&id) {
                    s.exposures.push(id);
                }
            });
        }
        Ok(exposures)
    }

    fn finish_visit(&mut self, visit: VisitId, status: VisitStatus) -> SeqResult<()> {
        if status != VisitStatus::Finished {
            let failed = self.ctx.tracker.fail_unfinished(visit, "sequence did not complete");
            if failed > 0 {
                warn!(visit_id = %visit, failed, "Unfinished exposures marked failed");
            }
        }
        let result = self.ctx.tracker.finish_visit(visit, status);
        self.update(|s| s.visit = None);
        self.publish(SequenceEvent::Visit {
            sequence: self.id,
            visit,
            open: false,
        });
        result
    }

    /// Closes the open visit according to `exit`. A completed sequence whose
    /// exposures are not all terminal becomes a failure.
    fn close_visit(&mut self, exit: Exit) -> Exit {
        let Some(visit) = self.visit.take() else {
            return exit;
        };
        match exit {
            Exit::Completed | Exit::Finished => {
                match self.finish_visit(visit, VisitStatus::Finished) {
                    Ok(()) => exit,
                    Err(error) => {
                        // Leave no visit open behind.
                        let _ = self.finish_visit(visit, VisitStatus::Aborted);
                        Exit::Failed(FailureReason { step: None, error })
                    }
                }
            }
            Exit::Aborted | Exit::Failed(_) => {
                if let Err(e) = self.finish_visit(visit, VisitStatus::Aborted) {
                    warn!(visit_id = %visit, error = %e, "Could not close visit");
                }
                exit
            }
        }
    }

    fn exposure_event(&self, exposure: ExposureId, status: ExposureStatus) {
        self.publish(SequenceEvent::Exposure {
            sequence: self.id,
            exposure,
            status,
        });
    }

    // -------------------------------------------------------------------------
    // Status
    // -------------------------------------------------------------------------

    fn update(&self, change: impl FnOnce(&mut SequenceStatus)) {
        change(&mut self.status.write());
    }

    fn set_state(&self, state: SequenceState) {
        let previous = {
            let mut status = self.status.write();
            std::mem::replace(&mut status.state, state)
        };
        if previous == state {
            return;
        }
        info!(from = %previous, to = %state, "Sequence state changed");
        self.state_tx.send_replace(state);
        self.publish(SequenceEvent::StateChanged {
            sequence: self.id,
            state,
            at: chrono::Utc::now(),
        });
    }

    fn publish(&self, event: SequenceEvent) {
        self.ctx.events.publish(event);
    }
}

impl Drop for RunEngine {
    fn drop(&mut self) {
        // A cancelled task must not leak locks.
        if !self.held.is_empty() {
            warn!(sequence_id = %self.id, "Engine dropped while holding locks; releasing");
            self.held.release_all(&self.ctx.locks);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iic_core::resource::ResourceRegistry;

    fn manager() -> LockManager {
        LockManager::new(Arc::new(
            ResourceRegistry::new()
                .with_exclusive("arm:b1")
                .with_exclusive("arm:r1")
                .with_shared("lamp:halogen"),
        ))
    }

    fn claim(name: &str, mode: LockMode) -> ResourceClaim {
        ResourceClaim {
            name: ResourceName::new(name),
            mode,
        }
    }

    #[test]
    fn held_locks_report_missing_and_upgrades() {
        let locks = manager();
        let mut held = HeldLocks::default();
        let set = locks
            .try_acquire(
                SequenceId(1),
                &[
                    claim("arm:b1", LockMode::Exclusive),
                    claim("lamp:halogen", LockMode::Shared),
                ],
            )
            .unwrap();
        held.push(set);

        let (wanted, upgrades) = held.missing(&[
            claim("arm:b1", LockMode::Exclusive),
            claim("arm:r1", LockMode::Exclusive),
            claim("lamp:halogen", LockMode::Exclusive),
        ]);
        let wanted: Vec<&str> = wanted.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(wanted, vec!["arm:r1", "lamp:halogen"]);
        assert_eq!(upgrades, vec![ResourceName::new("lamp:halogen")]);

        // Exclusive covers a shared request.
        let (wanted, _) = held.missing(&[claim("arm:b1", LockMode::Shared)]);
        assert!(wanted.is_empty());
    }

    #[test]
    fn partial_release_keeps_the_rest() {
        let locks = manager();
        let mut held = HeldLocks::default();
        held.push(
            locks
                .try_acquire(
                    SequenceId(1),
                    &[
                        claim("arm:b1", LockMode::Exclusive),
                        claim("arm:r1", LockMode::Exclusive),
                    ],
                )
                .unwrap(),
        );
        held.release_names(&locks, &[ResourceName::new("arm:r1")]);
        assert!(held.holds(&ResourceName::new("arm:b1")));
        assert!(!locks.is_held(&ResourceName::new("arm:r1")));

        held.release_all(&locks);
        assert!(held.is_empty());
        assert!(locks.held_by(SequenceId(1)).is_empty());
    }
}
