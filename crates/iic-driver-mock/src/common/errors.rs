//! Error injection for the simulated instrument.
//!
//! Scenarios are checked once per dispatched command; the resulting failure
//! is reported when the command is polled, the way a real actor answers a
//! command with a failure reply.

use super::rng::MockRng;
use iic_core::error::{DeviceError, DeviceErrorKind};
use iic_core::resource::ResourceName;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Error injection configuration.
#[derive(Clone, Debug)]
pub struct ErrorConfig {
    /// Per-verb failure rate (0.0 to 1.0); `"*"` applies to every verb.
    failure_rates: Arc<HashMap<String, f64>>,
    scenarios: Arc<Vec<ErrorScenario>>,
    rng: Arc<MockRng>,
    state: Arc<Mutex<ErrorState>>,
}

/// A scripted failure.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorScenario {
    /// `verb` succeeds `count` times, then fails on every call.
    FailAfterN {
        /// Device verb.
        verb: String,
        /// Successful calls before failures start.
        count: u32,
    },
    /// The first `times` calls of `verb` fail, later calls succeed.
    FailTimes {
        /// Device verb.
        verb: String,
        /// Failing calls.
        times: u32,
    },
    /// Commands to `resource` never complete.
    Silence {
        /// Silent resource.
        resource: ResourceName,
    },
    /// The first command fails with a communication error, and so does
    /// every later one.
    CommunicationLoss,
    /// The first command trips a hardware fault that persists.
    HardwareFault {
        /// Fault code.
        code: u32,
    },
}

impl ErrorScenario {
    /// [`ErrorScenario::FailTimes`] for `verb`.
    pub fn fail_times(verb: impl Into<String>, times: u32) -> Self {
        ErrorScenario::FailTimes {
            verb: verb.into(),
            times,
        }
    }

    /// [`ErrorScenario::FailAfterN`] for `verb`.
    pub fn fail_after(verb: impl Into<String>, count: u32) -> Self {
        ErrorScenario::FailAfterN {
            verb: verb.into(),
            count,
        }
    }
}

#[derive(Default, Debug)]
struct ErrorState {
    verb_counts: HashMap<String, u32>,
    communication_lost: bool,
    hardware_fault_code: u32,
}

impl ErrorConfig {
    /// No injected errors.
    pub fn none() -> Self {
        Self::scenarios(Vec::new())
    }

    /// Uniform random failures on every verb, reproducible with `seed`.
    pub fn random_failures_seeded(rate: f64, seed: Option<u64>) -> Self {
        let mut rates = HashMap::new();
        rates.insert("*".to_string(), rate);
        Self {
            failure_rates: Arc::new(rates),
            scenarios: Arc::new(Vec::new()),
            rng: Arc::new(MockRng::new(seed)),
            state: Arc::new(Mutex::new(ErrorState::default())),
        }
    }

    /// A single scenario.
    pub fn scenario(scenario: ErrorScenario) -> Self {
        Self::scenarios(vec![scenario])
    }

    /// Several scenarios, checked in order.
    pub fn scenarios(scenarios: Vec<ErrorScenario>) -> Self {
        Self {
            failure_rates: Arc::new(HashMap::new()),
            scenarios: Arc::new(scenarios),
            rng: Arc::new(MockRng::new(None)),
            state: Arc::new(Mutex::new(ErrorState::default())),
        }
    }

    /// Custom failure rates per verb.
    pub fn with_rates(rates: HashMap<String, f64>, seed: Option<u64>) -> Self {
        Self {
            failure_rates: Arc::new(rates),
            scenarios: Arc::new(Vec::new()),
            rng: Arc::new(MockRng::new(seed)),
            state: Arc::new(Mutex::new(ErrorState::default())),
        }
    }

    /// Whether commands to `resource` should never complete.
    pub fn is_silent(&self, resource: &ResourceName) -> bool {
        self.scenarios
            .iter()
            .any(|s| matches!(s, ErrorScenario::Silence { resource: r } if r == resource))
    }

    /// Decides whether `verb` on `resource` fails, advancing scenario state.
    pub fn check(&self, resource: &ResourceName, verb: &str) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        let fail = |kind, message: String| Err(DeviceError::new(resource.as_str(), kind, message));

        if state.communication_lost {
            return fail(DeviceErrorKind::Communication, "communication lost".into());
        }
        if state.hardware_fault_code != 0 {
            return fail(
                DeviceErrorKind::Hardware,
                format!("hardware fault: {}", state.hardware_fault_code),
            );
        }

        let calls = {
            let count = state.verb_counts.entry(verb.to_string()).or_insert(0);
            *count += 1;
            *count
        };

        for scenario in self.scenarios.iter() {
            match scenario {
                ErrorScenario::FailAfterN { verb: v, count } if v == verb && calls > *count => {
                    return fail(
                        DeviceErrorKind::Hardware,
                        format!("injected failure after {count} '{verb}' commands"),
                    );
                }
                ErrorScenario::FailTimes { verb: v, times } if v == verb && calls <= *times => {
                    return fail(
                        DeviceErrorKind::Hardware,
                        format!("injected failure {calls}/{times} on '{verb}'"),
                    );
                }
                ErrorScenario::CommunicationLoss => {
                    state.communication_lost = true;
                    return fail(DeviceErrorKind::Communication, "communication lost".into());
                }
                ErrorScenario::HardwareFault { code } => {
                    state.hardware_fault_code = *code;
                    return fail(DeviceErrorKind::Hardware, format!("hardware fault: {code}"));
                }
                _ => {}
            }
        }

        let rate = self
            .failure_rates
            .get(verb)
            .or_else(|| self.failure_rates.get("*"))
            .copied()
            .unwrap_or(0.0);
        if self.rng.should_fail(rate) {
            return fail(
                DeviceErrorKind::Hardware,
                format!("random failure on '{verb}'"),
            );
        }
        Ok(())
    }

    /// Clears counters, lost communication and latched faults.
    pub fn reset(&self) {
        *self.state.lock() = ErrorState::default();
    }
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self::none()
    }
}
