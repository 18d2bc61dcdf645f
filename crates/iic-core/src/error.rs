//! Error types for the sequencer.
//!
//! Two layers of errors exist:
//!
//! - **`DeviceError`**: produced by a [`DeviceInterface`](crate::device::DeviceInterface)
//!   implementation when a dispatched command fails, is stopped, or goes silent.
//! - **`SequenceError`**: the taxonomy surfaced to callers of the builder, the
//!   resource manager and the control surface. Device errors are wrapped into it.
//!
//! ## Recovery classes
//!
//! 1. **Rejected before hardware** - `InvalidParams`, `Invalid`, `UnknownOperation`.
//!    No state changes; the request can be fixed and resubmitted.
//! 2. **Contention** - `Busy`, `Timeout`. The sequence never reached the
//!    hardware for that step; resubmission is safe.
//! 3. **Hardware** - `Device`, `ConvergenceFailure`. Retried per step policy,
//!    otherwise the sequence ends `Failed`.
//! 4. **Operator** - `AbortRequested`. Not a failure for reporting purposes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::SequenceId;

// =============================================================================
// Device Errors
// =============================================================================

/// Category of a device failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceErrorKind {
    /// The device could not be reached or dropped the connection.
    Communication,
    /// The device reported a fault while executing the command.
    Hardware,
    /// The device stayed silent past the step's device timeout.
    Timeout,
    /// The command was interrupted by `stop()`.
    Stopped,
    /// The device refused the command or its parameters.
    Rejected,
}

impl std::fmt::Display for DeviceErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DeviceErrorKind::Communication => "communication",
            DeviceErrorKind::Hardware => "hardware",
            DeviceErrorKind::Timeout => "timeout",
            DeviceErrorKind::Stopped => "stopped",
            DeviceErrorKind::Rejected => "rejected",
        };
        write!(f, "{}", label)
    }
}

/// A failed device command.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("Device '{resource}' {kind} error: {message}")]
pub struct DeviceError {
    /// Resource the command was addressed to.
    pub resource: String,
    /// Failure category.
    pub kind: DeviceErrorKind,
    /// Device-provided reason.
    pub message: String,
}

impl DeviceError {
    /// Creates a device error for `resource`.
    pub fn new(
        resource: impl Into<String>,
        kind: DeviceErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            resource: resource.into(),
            kind,
            message: message.into(),
        }
    }
}

// =============================================================================
// Sequence Errors
// =============================================================================

/// Convenience alias for results using the sequencer error type.
pub type SeqResult<T> = std::result::Result<T, SequenceError>;

/// Error taxonomy of the sequencer.
///
/// The type is `Clone` and serializable so that it can be stored as the
/// `last_error` of a sequence status and handed to front ends unchanged.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SequenceError {
    /// A request parameter is missing, malformed or out of range.
    ///
    /// `param` always names the offending parameter.
    #[error("Invalid parameter '{param}': {reason}")]
    InvalidParams {
        /// Name of the offending parameter.
        param: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The requested operation name is not registered.
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    /// A resource request can never be granted: unknown resource, a
    /// self-conflicting claim set, a mode the resource does not allow, or a
    /// request that would wait on a lock the requester already holds.
    #[error("Invalid resource request: {reason}")]
    Invalid {
        /// Human-readable explanation.
        reason: String,
    },

    /// The resources cannot be granted right now and the caller asked not to queue.
    #[error("Resources busy: {resources:?}")]
    Busy {
        /// Resources currently held by other sequences.
        resources: Vec<String>,
    },

    /// Queued for longer than the configured acquisition timeout.
    #[error("Timed out after {waited_ms}ms waiting for {resources:?}")]
    Timeout {
        /// Resources that were requested.
        resources: Vec<String>,
        /// Time spent in the queue.
        waited_ms: u64,
    },

    /// A dispatched command failed and retries were exhausted.
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// An iterative step did not converge within its iteration cap.
    #[error("Convergence failure after {iterations} iterations (last measurement: {last_measurement:?})")]
    ConvergenceFailure {
        /// Number of iterations that ran.
        iterations: u32,
        /// Last measured value, if any was produced.
        last_measurement: Option<f64>,
    },

    /// The operator aborted the sequence.
    #[error("Abort requested")]
    AbortRequested,

    /// No sequence with this identifier is known.
    #[error("Unknown sequence {0}")]
    UnknownSequence(SequenceId),

    /// The requested control action does not apply to the sequence's state.
    #[error("Sequence {id} cannot {action}: state is {state}")]
    InvalidState {
        /// Sequence addressed.
        id: SequenceId,
        /// Requested action.
        action: String,
        /// Current state label.
        state: String,
    },

    /// No unique active sequence could be identified.
    #[error("Could not identify sequence: {0}")]
    Identification(String),

    /// Persistence sink failure. Only ever logged by the tracker.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Visit or exposure bookkeeping was used out of order.
    #[error("Tracker error: {0}")]
    Tracker(String),
}

impl SequenceError {
    /// Shorthand for [`SequenceError::InvalidParams`].
    pub fn invalid_param(param: impl Into<String>, reason: impl Into<String>) -> Self {
        SequenceError::InvalidParams {
            param: param.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for [`SequenceError::Invalid`].
    pub fn invalid(reason: impl Into<String>) -> Self {
        SequenceError::Invalid {
            reason: reason.into(),
        }
    }

    /// Whether a step should be re-dispatched after this error.
    ///
    /// Only device failures are retried; a convergence failure already ran
    /// its full iteration budget.
    pub fn is_retryable(&self) -> bool {
        match self {
            SequenceError::Device(err) => err.kind != DeviceErrorKind::Stopped,
            _ => false,
        }
    }

    /// Short snake_case label used in logs and events.
    pub fn label(&self) -> &'static str {
        match self {
            SequenceError::InvalidParams { .. } => "invalid_params",
            SequenceError::UnknownOperation(_) => "unknown_operation",
            SequenceError::Invalid { .. } => "invalid",
            SequenceError::Busy { .. } => "busy",
            SequenceError::Timeout { .. } => "timeout",
            SequenceError::Device(_) => "device_error",
            SequenceError::ConvergenceFailure { .. } => "convergence_failure",
            SequenceError::AbortRequested => "abort_requested",
            SequenceError::UnknownSequence(_) => "unknown_sequence",
            SequenceError::InvalidState { .. } => "invalid_state",
            SequenceError::Identification(_) => "identification",
            SequenceError::Persistence(_) => "persistence",
            SequenceError::Tracker(_) => "tracker",
        }
    }
}

// =============================================================================
// Configuration Errors
// =============================================================================

/// Errors raised while loading [`SequencerConfig`](crate::config::SequencerConfig).
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file does not exist.
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    /// The configuration could not be parsed or extracted.
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// The configuration parsed but is semantically invalid.
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_error_display() {
        let err = DeviceError::new("arm:b1", DeviceErrorKind::Hardware, "shutter jammed");
        assert_eq!(
            err.to_string(),
            "Device 'arm:b1' hardware error: shutter jammed"
        );
    }

    #[test]
    fn invalid_params_names_parameter() {
        let err = SequenceError::invalid_param("dither_x", "missing");
        assert!(err.to_string().contains("dither_x"));
        assert_eq!(err.label(), "invalid_params");
    }

    #[test]
    fn only_device_errors_are_retryable() {
        let hw: SequenceError =
            DeviceError::new("fps", DeviceErrorKind::Communication, "lost").into();
        assert!(hw.is_retryable());

        let stopped: SequenceError =
            DeviceError::new("fps", DeviceErrorKind::Stopped, "stop()").into();
        assert!(!stopped.is_retryable());

        let conv = SequenceError::ConvergenceFailure {
            iterations: 5,
            last_measurement: Some(1.0),
        };
        assert!(!conv.is_retryable());
        assert!(!SequenceError::AbortRequested.is_retryable());
    }

    #[test]
    fn sequence_error_serializes_with_kind_tag() {
        let err = SequenceError::ConvergenceFailure {
            iterations: 5,
            last_measurement: Some(0.25),
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "convergence_failure");
        assert_eq!(json["detail"]["iterations"], 5);
    }
}
