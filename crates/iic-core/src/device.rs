//! Abstract device-command interface consumed by the executor.
//!
//! The engine never talks to hardware directly. It dispatches a
//! [`DeviceCommand`] to a resource, receives a [`CompletionToken`], and polls
//! the token until the device reports an outcome. Implementations must make
//! [`DeviceInterface::stop`] safe to call at any time; after it returns the
//! resource is in a defined idle state.
//!
//! The executor only dispatches to resources the issuing sequence holds a lock
//! on, so implementations never arbitrate between sequences themselves.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::DeviceError;
use crate::resource::ResourceName;

/// Scalar parameter attached to a device command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// Boolean flag.
    Flag(bool),
    /// Integer value.
    Int(i64),
    /// Floating-point value.
    Float(f64),
    /// Free text.
    Text(String),
}

impl ParamValue {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(v) => Some(*v as f64),
            ParamValue::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Flag(v) => write!(f, "{v}"),
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Float(v) => write!(f, "{v}"),
            ParamValue::Text(v) => f.write_str(v),
        }
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Float(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Int(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Flag(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Text(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::Text(value)
    }
}

/// A directive addressed to one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCommand {
    /// Resource the command drives.
    pub resource: ResourceName,
    /// Device verb, e.g. `expose`, `moveFocus`, `on`.
    pub verb: String,
    /// Named parameters, ordered for stable rendering.
    pub params: BTreeMap<String, ParamValue>,
}

impl DeviceCommand {
    /// Command without parameters.
    pub fn new(resource: ResourceName, verb: impl Into<String>) -> Self {
        Self {
            resource,
            verb: verb.into(),
            params: BTreeMap::new(),
        }
    }

    /// Adds a parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Looks up a numeric parameter.
    pub fn param_f64(&self, key: &str) -> Option<f64> {
        self.params.get(key).and_then(ParamValue::as_f64)
    }
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.resource, self.verb)?;
        for (key, value) in &self.params {
            write!(f, " {key}={value}")?;
        }
        Ok(())
    }
}

/// Handle for an in-flight command, returned by [`DeviceInterface::dispatch`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompletionToken {
    /// Implementation-assigned identifier.
    pub id: u64,
    /// Resource the command was dispatched to.
    pub resource: ResourceName,
}

/// Progress phase reported while a command is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Command executing (moving, integrating, warming up).
    #[default]
    Busy,
    /// Detector readout in progress.
    Readout,
}

/// Payload of a successful completion.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeviceReply {
    /// Scalar measurement produced by the command, used by convergence steps.
    pub measurement: Option<f64>,
    /// Free-form device text.
    pub text: Option<String>,
}

impl DeviceReply {
    /// Reply carrying a measurement.
    pub fn measured(value: f64) -> Self {
        Self {
            measurement: Some(value),
            text: None,
        }
    }
}

/// Result of polling a token.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceOutcome {
    /// Command finished successfully.
    Done(DeviceReply),
    /// Command finished with a device-reported failure.
    Error(DeviceError),
    /// Command still running.
    InProgress(Phase),
}

impl DeviceOutcome {
    /// Whether the command reached a final outcome.
    pub fn is_final(&self) -> bool {
        !matches!(self, DeviceOutcome::InProgress(_))
    }
}

/// Capability to drive physical devices.
#[async_trait]
pub trait DeviceInterface: Send + Sync {
    /// Starts `command` and returns a token to poll.
    ///
    /// Errors here mean the command never started.
    async fn dispatch(&self, command: &DeviceCommand) -> Result<CompletionToken, DeviceError>;

    /// Reports the current outcome of a dispatched command.
    ///
    /// Implementations may either return immediately or await a state change;
    /// the caller polls again on [`DeviceOutcome::InProgress`].
    async fn poll(&self, token: &CompletionToken) -> DeviceOutcome;

    /// Stops whatever `resource` is doing and leaves it idle.
    async fn stop(&self, resource: &ResourceName) -> Result<(), DeviceError>;
}
