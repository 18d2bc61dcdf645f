//! Sequence lifecycle and status reporting.
//!
//! # State Machine
//!
//! ```text
//! ┌───────┐ submit ┌────────┐ first grant ┌─────────┐ last step ┌───────────┐
//! │ Built │───────▶│ Queued │────────────▶│ Running │──────────▶│ Finishing │──▶ Completed
//! └───────┘        └───┬────┘             └────┬────┘           └───────────┘
//!                      │ timeout               │ abort / step failure
//!                      ▼                       ▼
//!                   Failed                ┌──────────┐
//!                                         │ Aborting │──▶ Aborted | Failed
//!                                         └──────────┘
//! ```
//!
//! Pause does not have a state of its own: a paused sequence stays
//! `Running` with [`SequenceStatus::paused`] set and keeps its locks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use iic_core::error::SequenceError;
use iic_core::ids::{ExposureId, SequenceId, VisitId};

use crate::plans::{OperationKind, SequencePlan};

/// Lifecycle state of a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceState {
    /// Plan built, not yet accepted.
    Built,
    /// Accepted, waiting for the first step's locks.
    Queued,
    /// Executing steps.
    Running,
    /// Main steps done (or finish requested); teardown running.
    Finishing,
    /// Abort or failure in progress; teardown running.
    Aborting,
    /// Terminal: every step done.
    Completed,
    /// Terminal: aborted by request.
    Aborted,
    /// Terminal: a step failed or locks could not be obtained.
    Failed,
}

impl SequenceState {
    /// Whether the state is final.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SequenceState::Completed | SequenceState::Aborted | SequenceState::Failed
        )
    }

    /// Whether the sequence was accepted and has not terminated.
    pub fn is_active(self) -> bool {
        !self.is_terminal() && self != SequenceState::Built
    }
}

impl fmt::Display for SequenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SequenceState::Built => "built",
            SequenceState::Queued => "queued",
            SequenceState::Running => "running",
            SequenceState::Finishing => "finishing",
            SequenceState::Aborting => "aborting",
            SequenceState::Completed => "completed",
            SequenceState::Aborted => "aborted",
            SequenceState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Operator request forwarded to a running sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlSignal {
    /// Resume after a pause.
    Resume,
    /// Pause at the next step boundary.
    Pause,
    /// Finish the in-flight step, skip the rest, complete normally.
    Finish,
    /// Stop everything.
    Abort,
}

/// Accumulated control requests, observed by the executor through a
/// `tokio::sync::watch` channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlFlags {
    /// Pause requested and not yet resumed.
    pub pause: bool,
    /// Finish requested.
    pub finish: bool,
    /// Abort requested.
    pub abort: bool,
}

impl ControlFlags {
    /// Applies `signal`.
    pub fn apply(&mut self, signal: ControlSignal) {
        match signal {
            ControlSignal::Resume => self.pause = false,
            ControlSignal::Pause => self.pause = true,
            ControlSignal::Finish => self.finish = true,
            ControlSignal::Abort => self.abort = true,
        }
    }
}

/// Why a sequence failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReason {
    /// Failing step, if the failure belongs to one.
    pub step: Option<usize>,
    /// Deepest error.
    pub error: SequenceError,
}

/// Progress of the convergence loop currently running.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceProgress {
    /// Step index.
    pub step: usize,
    /// Iterations done.
    pub iteration: u32,
    /// Iteration cap.
    pub cap: u32,
    /// Latest measurement.
    pub last_measurement: Option<f64>,
}

/// Status snapshot reported to front ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceStatus {
    /// Sequence identifier.
    pub id: SequenceId,
    /// Unique run identifier, stable across processes.
    pub run_uid: Uuid,
    /// Operation kind.
    pub operation: OperationKind,
    /// Operator-given name.
    pub name: Option<String>,
    /// Operator comments.
    pub comments: Option<String>,
    /// Lifecycle state.
    pub state: SequenceState,
    /// Step being executed (or last executed).
    pub current_step: Option<usize>,
    /// Number of main steps.
    pub total_steps: usize,
    /// Currently open visit.
    pub visit: Option<VisitId>,
    /// Every visit opened by this sequence.
    pub visits: Vec<VisitId>,
    /// Every exposure taken by this sequence.
    pub exposures: Vec<ExposureId>,
    /// Terminal error, for `Failed` sequences.
    pub last_error: Option<FailureReason>,
    /// Pause in effect.
    pub paused: bool,
    /// Finish requested.
    pub finish_requested: bool,
    /// Non-fatal problems (teardown failures).
    pub warnings: Vec<String>,
    /// Convergence progress, while a loop runs.
    pub convergence: Option<ConvergenceProgress>,
    /// Submission time.
    pub submitted_at: DateTime<Utc>,
    /// Time the first step's locks were granted.
    pub started_at: Option<DateTime<Utc>>,
    /// Time the sequence terminated.
    pub ended_at: Option<DateTime<Utc>>,
}

impl SequenceStatus {
    /// Fresh status for a plan accepted as `id`.
    pub fn new(id: SequenceId, plan: &SequencePlan) -> Self {
        Self {
            id,
            run_uid: Uuid::new_v4(),
            operation: plan.operation,
            name: plan.name.clone(),
            comments: plan.comments.clone(),
            state: SequenceState::Built,
            current_step: None,
            total_steps: plan.len(),
            visit: None,
            visits: Vec::new(),
            exposures: Vec::new(),
            last_error: None,
            paused: false,
            finish_requested: false,
            warnings: Vec::new(),
            convergence: None,
            submitted_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }

    /// Numeric status code: `-1` active, `0` completed, `1` failed,
    /// `2` aborted, `3` completed after a finish request.
    pub fn status_code(&self) -> i32 {
        match self.state {
            SequenceState::Completed if self.finish_requested => 3,
            SequenceState::Completed => 0,
            SequenceState::Failed => 1,
            SequenceState::Aborted => 2,
            _ => -1,
        }
    }

    /// Whether the sequence has terminated.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::OperationParams;
    use crate::plans::build;

    fn status() -> SequenceStatus {
        let params: OperationParams = "cams=b1".parse().unwrap();
        SequenceStatus::new(SequenceId(1), &build("biases", &params).unwrap())
    }

    #[test]
    fn status_codes() {
        let mut s = status();
        assert_eq!(s.status_code(), -1);
        s.state = SequenceState::Completed;
        assert_eq!(s.status_code(), 0);
        s.finish_requested = true;
        assert_eq!(s.status_code(), 3);
        s.state = SequenceState::Failed;
        assert_eq!(s.status_code(), 1);
        s.state = SequenceState::Aborted;
        assert_eq!(s.status_code(), 2);
    }

    #[test]
    fn flags_accumulate() {
        let mut flags = ControlFlags::default();
        flags.apply(ControlSignal::Pause);
        flags.apply(ControlSignal::Finish);
        flags.apply(ControlSignal::Resume);
        assert_eq!(
            flags,
            ControlFlags {
                pause: false,
                finish: true,
                abort: false
            }
        );
    }

    #[test]
    fn activity() {
        assert!(!SequenceState::Built.is_active());
        assert!(SequenceState::Aborting.is_active());
        assert!(SequenceState::Failed.is_terminal());
    }
}
