//! Simulated PFS instrument.
//!
//! `MockInstrument` implements [`DeviceInterface`] for every resource the
//! sequencer knows about: camera arms, lamps, hexapods, shutters, the
//! fiber positioner system and the metrology camera. Commands are accepted
//! on dispatch and report their outcome on poll.
//!
//! # Timing (realistic and chaos modes)
//!
//! | verb               | busy for                         | then           |
//! |--------------------|----------------------------------|----------------|
//! | `expose`, `erase`  | `exptime` seconds                | readout phase  |
//! | `on`               | `warmingTime` seconds            | -              |
//! | anything else      | settle time                      | -              |
//!
//! Chaos mode jitters the busy time by up to 10%.
//!
//! All deadlines use `tokio::time::Instant`, so paused-clock tests advance
//! through exposures without real waiting.
//!
//! # Test hooks
//!
//! - measurement scripts feed convergence loops;
//! - the call log records dispatch, completion and stop times;
//! - an optional lock guard rejects commands to resources nobody holds.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use iic_core::device::{
    CompletionToken, DeviceCommand, DeviceInterface, DeviceOutcome, DeviceReply, Phase,
};
use iic_core::error::{DeviceError, DeviceErrorKind};
use iic_core::resource::ResourceName;

use crate::common::{ErrorConfig, MockMode, MockRng, TimingConfig};

const CHAOS_JITTER: f64 = 0.1;
/// Longest simulated busy period.
const MAX_BUSY: Duration = Duration::from_secs(365 * 86_400);

/// Predicate consulted before a command is accepted.
pub type LockGuard = Box<dyn Fn(&ResourceName) -> bool + Send + Sync>;

/// What happened to a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// Command accepted.
    Dispatch,
    /// Command reported success.
    Completed,
    /// Command reported a failure.
    Failed,
    /// `stop()` was called on the resource.
    Stop,
}

/// One entry of the call log.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    /// Simulated time of the call.
    pub at: Instant,
    /// Resource addressed.
    pub resource: ResourceName,
    /// Device verb; empty for `stop()`.
    pub verb: String,
    /// Entry kind.
    pub kind: CallKind,
}

#[derive(Debug)]
struct InFlight {
    command: DeviceCommand,
    busy_until: Instant,
    readout_until: Instant,
    failure: Option<DeviceError>,
    silent: bool,
    stopped: bool,
}

#[derive(Debug, Default)]
struct InstrumentState {
    in_flight: HashMap<u64, InFlight>,
    scripts: HashMap<(ResourceName, String), VecDeque<f64>>,
    calls: Vec<CallRecord>,
    violations: Vec<DeviceCommand>,
}

/// Simulated instrument implementing [`DeviceInterface`].
pub struct MockInstrument {
    mode: MockMode,
    timing: TimingConfig,
    errors: ErrorConfig,
    rng: MockRng,
    next_token: AtomicU64,
    state: Mutex<InstrumentState>,
    guard: Option<LockGuard>,
}

impl MockInstrument {
    /// Instrument in `mode` with default timing and no injected errors.
    pub fn new(mode: MockMode) -> Self {
        Self {
            mode,
            timing: TimingConfig::default(),
            errors: ErrorConfig::none(),
            rng: MockRng::default(),
            next_token: AtomicU64::new(1),
            state: Mutex::new(InstrumentState::default()),
            guard: None,
        }
    }

    /// Instrument where every command completes on its first poll.
    pub fn instant() -> Self {
        Self::new(MockMode::Instant)
    }

    /// Instrument with simulated integration, warm-up and readout time.
    pub fn realistic(timing: TimingConfig) -> Self {
        Self::new(MockMode::Realistic).with_timing(timing)
    }

    /// Realistic instrument failing commands at random with `rate` and
    /// jittering command durations by up to 10%.
    pub fn chaos(rate: f64, seed: Option<u64>) -> Self {
        Self::new(MockMode::Chaos)
            .with_timing(TimingConfig::pfs())
            .with_errors(ErrorConfig::random_failures_seeded(rate, seed))
            .with_seed(seed)
    }

    /// Reseeds the timing-jitter generator.
    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.rng = MockRng::new(seed);
        self
    }

    /// Replaces the timing configuration.
    pub fn with_timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    /// Replaces the error injection configuration.
    pub fn with_errors(mut self, errors: ErrorConfig) -> Self {
        self.errors = errors;
        self
    }

    /// Installs a guard that must approve every dispatched resource.
    ///
    /// Rejected commands fail with [`DeviceErrorKind::Rejected`] and are
    /// kept in [`MockInstrument::violations`].
    pub fn with_lock_guard(
        mut self,
        guard: impl Fn(&ResourceName) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.guard = Some(Box::new(guard));
        self
    }

    /// Operational mode.
    pub fn mode(&self) -> MockMode {
        self.mode
    }

    /// Queues measurements returned by successive `verb` commands on
    /// `resource`. The last value repeats once the queue runs dry.
    pub fn script_measurements(
        &self,
        resource: ResourceName,
        verb: impl Into<String>,
        values: impl IntoIterator<Item = f64>,
    ) {
        self.state
            .lock()
            .scripts
            .insert((resource, verb.into()), values.into_iter().collect());
    }

    /// Copy of the call log.
    pub fn calls(&self) -> Vec<CallRecord> {
        self.state.lock().calls.clone()
    }

    /// Dispatch times of `verb` on `resource`.
    pub fn dispatches(&self, resource: &ResourceName, verb: &str) -> Vec<Instant> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.kind == CallKind::Dispatch && &c.resource == resource && c.verb == verb)
            .map(|c| c.at)
            .collect()
    }

    /// Number of `stop()` calls on `resource`.
    pub fn stops(&self, resource: &ResourceName) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.kind == CallKind::Stop && &c.resource == resource)
            .count()
    }

    /// Commands the lock guard refused.
    pub fn violations(&self) -> Vec<DeviceCommand> {
        self.state.lock().violations.clone()
    }

    /// Commands dispatched and not yet reported.
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    fn busy_time(&self, command: &DeviceCommand) -> Duration {
        if !self.mode.is_timed() {
            return Duration::ZERO;
        }
        let seconds = |key| {
            command
                .param_f64(key)
                .filter(|v| *v > 0.0)
                .map(|v| Duration::try_from_secs_f64(v).unwrap_or(MAX_BUSY).min(MAX_BUSY))
                .unwrap_or(Duration::ZERO)
        };
        let work = match command.verb.as_str() {
            "expose" | "erase" => seconds("exptime"),
            "on" => seconds("warmingTime"),
            _ => self.timing.settle,
        };
        let work = if self.mode == MockMode::Chaos {
            self.rng.jitter(work, CHAOS_JITTER)
        } else {
            work
        };
        work.saturating_add(self.timing.latency).min(MAX_BUSY)
    }

    fn readout_time(&self, command: &DeviceCommand) -> Duration {
        match command.verb.as_str() {
            "expose" | "erase" if self.mode.is_timed() => self.timing.readout,
            _ => Duration::ZERO,
        }
    }

    fn log(state: &mut InstrumentState, resource: &ResourceName, verb: &str, kind: CallKind) {
        state.calls.push(CallRecord {
            at: Instant::now(),
            resource: resource.clone(),
            verb: verb.to_string(),
            kind,
        });
    }

    fn reply_for(state: &mut InstrumentState, command: &DeviceCommand) -> DeviceReply {
        let key = (command.resource.clone(), command.verb.clone());
        let measurement = state.scripts.get_mut(&key).and_then(|queue| {
            if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().copied()
            }
        });
        DeviceReply {
            measurement,
            text: None,
        }
    }
}

impl fmt::Debug for MockInstrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockInstrument")
            .field("mode", &self.mode)
            .field("timing", &self.timing)
            .field("guarded", &self.guard.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for MockInstrument {
    fn default() -> Self {
        Self::instant()
    }
}

#[async_trait]
impl DeviceInterface for MockInstrument {
    async fn dispatch(&self, command: &DeviceCommand) -> Result<CompletionToken, DeviceError> {
        if let Some(guard) = &self.guard {
            if !guard(&command.resource) {
                warn!(command = %command, "Command to a resource nobody holds");
                self.state.lock().violations.push(command.clone());
                return Err(DeviceError::new(
                    command.resource.as_str(),
                    DeviceErrorKind::Rejected,
                    "resource is not locked",
                ));
            }
        }

        let now = Instant::now();
        let busy_until = now + self.busy_time(command);
        let in_flight = InFlight {
            command: command.clone(),
            busy_until,
            readout_until: busy_until + self.readout_time(command),
            failure: self.errors.check(&command.resource, &command.verb).err(),
            silent: self.errors.is_silent(&command.resource),
            stopped: false,
        };

        let id = self.next_token.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        Self::log(&mut state, &command.resource, &command.verb, CallKind::Dispatch);
        state.in_flight.insert(id, in_flight);
        debug!(token = id, command = %command, "Mock command accepted");
        Ok(CompletionToken {
            id,
            resource: command.resource.clone(),
        })
    }

    async fn poll(&self, token: &CompletionToken) -> DeviceOutcome {
        let now = Instant::now();
        let mut state = self.state.lock();
        let Some(entry) = state.in_flight.get(&token.id) else {
            return DeviceOutcome::Error(DeviceError::new(
                token.resource.as_str(),
                DeviceErrorKind::Rejected,
                format!("unknown completion token {}", token.id),
            ));
        };

        if !entry.stopped {
            if entry.silent || now < entry.busy_until {
                return DeviceOutcome::InProgress(Phase::Busy);
            }
            if now < entry.readout_until {
                return DeviceOutcome::InProgress(Phase::Readout);
            }
        }

        let Some(entry) = state.in_flight.remove(&token.id) else {
            return DeviceOutcome::InProgress(Phase::Busy);
        };
        let command = entry.command;
        let outcome = if entry.stopped {
            DeviceOutcome::Error(DeviceError::new(
                command.resource.as_str(),
                DeviceErrorKind::Stopped,
                format!("'{}' interrupted by stop", command.verb),
            ))
        } else if let Some(failure) = entry.failure {
            DeviceOutcome::Error(failure)
        } else {
            DeviceOutcome::Done(Self::reply_for(&mut state, &command))
        };
        let kind = match outcome {
            DeviceOutcome::Done(_) => CallKind::Completed,
            _ => CallKind::Failed,
        };
        Self::log(&mut state, &command.resource, &command.verb, kind);
        outcome
    }

    async fn stop(&self, resource: &ResourceName) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        let mut interrupted = 0;
        for entry in state
            .in_flight
            .values_mut()
            .filter(|e| &e.command.resource == resource)
        {
            entry.stopped = true;
            interrupted += 1;
        }
        Self::log(&mut state, resource, "", CallKind::Stop);
        info!(resource = %resource, interrupted, "Mock resource stopped");
        Ok(())
    }
}
