//! Steps: the atomic units of a sequence.
//!
//! A [`Step`] is one device directive (or an identical directive fanned out to
//! several cameras) plus the condition that marks it complete and the policy
//! for retrying it. Steps are immutable once built.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use iic_core::device::DeviceCommand;
use iic_core::resource::{ResourceClaim, ResourceName};

/// Kind of work a step performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Moves a mechanism (slit, FPA focus, positioner).
    Move,
    /// Camera integration; creates exposures in the tracker.
    Expose,
    /// Switches or prepares calibration lamps and illuminators.
    LampControl,
    /// Waits without touching hardware.
    Wait,
    /// Records a note in the event stream.
    Annotate,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StepKind::Move => "move",
            StepKind::Expose => "expose",
            StepKind::LampControl => "lamp_control",
            StepKind::Wait => "wait",
            StepKind::Annotate => "annotate",
        };
        f.write_str(label)
    }
}

/// Retry behavior for device failures.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Always at least 1.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub backoff: Duration,
    /// Factor applied to the delay for each further attempt.
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub const fn once() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// `max_attempts` attempts with exponential backoff starting at `backoff`.
    pub fn attempts(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            multiplier: 2.0,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16) as i32;
        self.backoff.mul_f64(self.multiplier.max(1.0).powi(exp))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::once()
    }
}

/// Parameters of an iterative move/measure/evaluate step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceSpec {
    /// Commands run in order on every iteration. The last one's reply
    /// carries the measurement.
    pub cycle: Vec<DeviceCommand>,
    /// Converged once `|measurement| <= tolerance`.
    pub tolerance: f64,
    /// Iteration cap.
    pub max_iterations: u32,
}

/// Explicit state of a running convergence loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IterationState {
    /// Iterations completed so far.
    pub iteration: u32,
    /// Measurement of the latest iteration.
    pub last_measurement: Option<f64>,
    /// Iteration cap.
    pub cap: u32,
}

impl IterationState {
    /// Fresh state for a loop capped at `cap` iterations.
    pub fn new(cap: u32) -> Self {
        Self {
            iteration: 0,
            last_measurement: None,
            cap,
        }
    }

    /// Records one finished iteration. An iteration without a measurement
    /// keeps the previous one.
    pub fn record(&mut self, measurement: Option<f64>) {
        self.iteration += 1;
        if measurement.is_some() {
            self.last_measurement = measurement;
        }
    }

    /// Whether the latest measurement is within `tolerance`.
    pub fn converged(&self, tolerance: f64) -> bool {
        self.last_measurement
            .is_some_and(|m| m.is_finite() && m.abs() <= tolerance)
    }

    /// Whether the cap has been reached.
    pub fn exhausted(&self) -> bool {
        self.iteration >= self.cap
    }
}

/// What marks a step complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Completion {
    /// Every dispatched command reports `Done`.
    AllDone,
    /// A fixed delay has elapsed.
    Elapsed {
        /// Delay.
        duration: Duration,
    },
    /// Iterate until converged or capped.
    Converge(ConvergenceSpec),
    /// Nothing to await.
    Immediate,
}

/// One step of a sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Step kind.
    pub kind: StepKind,
    /// Short human-readable description.
    pub label: String,
    /// Commands dispatched concurrently; empty for waits and annotations.
    pub commands: Vec<DeviceCommand>,
    /// Resources the step must hold while it runs.
    pub claims: Vec<ResourceClaim>,
    /// Completion predicate.
    pub completion: Completion,
    /// Retry policy for device failures.
    pub retry: RetryPolicy,
    /// Device silence timeout; the engine default applies when `None`.
    pub timeout: Option<Duration>,
}

impl Step {
    fn base(kind: StepKind, label: impl Into<String>) -> Self {
        Self {
            kind,
            label: label.into(),
            commands: Vec::new(),
            claims: Vec::new(),
            completion: Completion::AllDone,
            retry: RetryPolicy::once(),
            timeout: None,
        }
    }

    /// Device step completing when every command reports done.
    pub fn device(
        kind: StepKind,
        label: impl Into<String>,
        commands: Vec<DeviceCommand>,
        claims: Vec<ResourceClaim>,
    ) -> Self {
        Self {
            commands,
            claims,
            ..Self::base(kind, label)
        }
    }

    /// Fixed delay.
    pub fn wait(duration: Duration) -> Self {
        Self {
            completion: Completion::Elapsed { duration },
            ..Self::base(StepKind::Wait, format!("wait {}s", duration.as_secs_f64()))
        }
    }

    /// Note recorded in the event stream.
    pub fn annotate(text: impl Into<String>) -> Self {
        Self {
            completion: Completion::Immediate,
            ..Self::base(StepKind::Annotate, text)
        }
    }

    /// Iterative step over `claims`.
    pub fn converge(
        label: impl Into<String>,
        spec: ConvergenceSpec,
        claims: Vec<ResourceClaim>,
    ) -> Self {
        Self {
            completion: Completion::Converge(spec),
            claims,
            ..Self::base(StepKind::Move, label)
        }
    }

    /// Replaces the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the device silence timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Names of the resources claimed by this step.
    pub fn resources(&self) -> impl Iterator<Item = &ResourceName> {
        self.claims.iter().map(|c| &c.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_backoff_grows() {
        let policy = RetryPolicy::attempts(4, Duration::from_millis(100));
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(400));
        assert_eq!(RetryPolicy::attempts(0, Duration::ZERO).max_attempts, 1);
    }

    #[test]
    fn iteration_state_tracks_cap() {
        let mut state = IterationState::new(3);
        assert!(!state.converged(0.1));
        state.record(Some(0.5));
        assert!(!state.converged(0.1));
        state.record(Some(0.05));
        assert!(state.converged(0.1));
        state.record(Some(f64::NAN));
        assert!(!state.converged(0.1));
        assert!(state.exhausted());
        assert_eq!(state.iteration, 3);
    }

    #[test]
    fn wait_and_annotate_claim_nothing() {
        assert!(Step::wait(Duration::from_secs(5)).claims.is_empty());
        let note = Step::annotate("slit homed");
        assert_eq!(note.kind, StepKind::Annotate);
        assert_eq!(note.completion, Completion::Immediate);
    }
}
