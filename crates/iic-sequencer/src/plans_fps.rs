//! Fiber positioner operation builders.
//!
//! The closed loops all share one shape: back-illuminate the fibers, then
//! iterate a positioner command and a metrology exposure until the measured
//! residual is within tolerance or the iteration cap is hit.

use std::time::Duration;

use iic_core::device::DeviceCommand;
use iic_core::error::{SeqResult, SequenceError};
use iic_core::resource::{ResourceClaim, ResourceName};

use crate::params::{seconds_after, OperationParams};
use crate::plans::PlanDraft;
use crate::step::{ConvergenceSpec, RetryPolicy, Step, StepKind};

const BACK_ILLUMINATOR: &str = "bia";
const DEFAULT_MCS_EXPTIME: f64 = 2.0;
const DEFAULT_MAX_ITERATIONS: u32 = 5;
/// Full positioner travel can take several minutes.
const POSITIONER_TIMEOUT: Duration = Duration::from_secs(600);

fn illuminator_step(verb: &str) -> Step {
    let name = ResourceName::illuminator(BACK_ILLUMINATOR);
    Step::device(
        StepKind::LampControl,
        format!("{BACK_ILLUMINATOR} {verb}"),
        vec![DeviceCommand::new(name.clone(), verb)],
        vec![ResourceClaim::exclusive(name)],
    )
    .with_retry(RetryPolicy::attempts(2, Duration::from_secs(1)))
}

fn mcs_expose(exptime: f64) -> DeviceCommand {
    DeviceCommand::new(ResourceName::mcs(), "expose")
        .with_param("exptype", "object")
        .with_param("exptime", exptime)
}

fn loop_claims() -> Vec<ResourceClaim> {
    vec![
        ResourceClaim::exclusive(ResourceName::fps()),
        ResourceClaim::exclusive(ResourceName::mcs()),
        ResourceClaim::shared(ResourceName::illuminator(BACK_ILLUMINATOR)),
    ]
}

/// Metrology exposure time, `exptime` or 2s.
fn mcs_exptime(params: &OperationParams) -> SeqResult<f64> {
    let exptime = params.seconds_or("exptime", DEFAULT_MCS_EXPTIME)?;
    if exptime <= 0.0 {
        return Err(SequenceError::invalid_param("exptime", "must be > 0"));
    }
    Ok(exptime)
}

fn tolerance(params: &OperationParams, default: f64) -> SeqResult<f64> {
    let tolerance = params.f64_or("tolerance", default)?;
    if tolerance <= 0.0 {
        return Err(SequenceError::invalid_param("tolerance", "must be > 0"));
    }
    Ok(tolerance)
}

/// Illuminated convergence loop with the illuminator switched off on teardown.
fn illuminated_loop(label: &str, spec: ConvergenceSpec, exptime: f64) -> PlanDraft {
    let cycle_timeout = seconds_after(POSITIONER_TIMEOUT, exptime);
    let mut draft = PlanDraft::new();
    draft.step(illuminator_step("on"));
    draft.step(Step::converge(label, spec, loop_claims()).with_timeout(cycle_timeout));
    draft.teardown(illuminator_step("off"));
    draft
}

/// `boresightLoop`: measures the rotator boresight until it is stable.
pub fn boresight_loop(params: &OperationParams) -> SeqResult<PlanDraft> {
    let exptime = mcs_exptime(params)?;
    let spec = ConvergenceSpec {
        cycle: vec![
            mcs_expose(exptime),
            DeviceCommand::new(ResourceName::fps(), "measureBoresight"),
        ],
        tolerance: tolerance(params, 0.01)?,
        max_iterations: params.count_or("maxIterations", DEFAULT_MAX_ITERATIONS, 1)?,
    };
    Ok(illuminated_loop("boresight loop", spec, exptime))
}

/// `makeMotorMap`: steps one cobra arm and re-measures until the map settles.
pub fn make_motor_map(params: &OperationParams) -> SeqResult<PlanDraft> {
    let arm = cobra_arm(params)?;
    let step_size = params.f64_or("stepSize", 50.0)?;
    if step_size <= 0.0 {
        return Err(SequenceError::invalid_param("stepSize", "must be > 0"));
    }
    let exptime = mcs_exptime(params)?;
    let spec = ConvergenceSpec {
        cycle: vec![
            DeviceCommand::new(ResourceName::fps(), "makeMotorMap")
                .with_param("arm", arm)
                .with_param("stepSize", step_size),
            mcs_expose(exptime),
        ],
        tolerance: tolerance(params, 0.05)?,
        max_iterations: params.count_or("maxIterations", DEFAULT_MAX_ITERATIONS, 1)?,
    };
    Ok(illuminated_loop(&format!("{arm} motor map"), spec, exptime))
}

/// `targetConvergenceTest`: drives cobras to their targets and measures.
pub fn target_convergence_test(params: &OperationParams) -> SeqResult<PlanDraft> {
    let exptime = mcs_exptime(params)?;
    let mut move_cmd = DeviceCommand::new(ResourceName::fps(), "moveToTarget");
    if let Some(targets) = params.get("targets") {
        move_cmd = move_cmd.with_param("targets", targets);
    }
    let spec = ConvergenceSpec {
        cycle: vec![move_cmd, mcs_expose(exptime)],
        tolerance: tolerance(params, 0.01)?,
        max_iterations: params.count_or("maxIterations", 10, 1)?,
    };
    Ok(illuminated_loop("target convergence", spec, exptime))
}

/// `angleConvergenceTest`: drives one cobra arm to `angleTargets` random
/// angles in turn and measures after each move.
pub fn angle_convergence_test(params: &OperationParams) -> SeqResult<PlanDraft> {
    let arm = cobra_arm(params)?;
    params.require("angleTargets")?;
    let targets = params.count_or("angleTargets", 1, 1)?;
    let exptime = mcs_exptime(params)?;
    let spec = ConvergenceSpec {
        cycle: vec![
            DeviceCommand::new(ResourceName::fps(), "angleConvergenceTest")
                .with_param("arm", arm)
                .with_param("angleTargets", i64::from(targets)),
            mcs_expose(exptime),
        ],
        tolerance: tolerance(params, 0.01)?,
        max_iterations: params.count_or("maxIterations", 10, 1)?,
    };
    Ok(illuminated_loop(&format!("{arm} angle convergence"), spec, exptime))
}

fn cobra_arm(params: &OperationParams) -> SeqResult<&str> {
    let arm = params.get("arm").unwrap_or("phi");
    if !matches!(arm, "phi" | "theta") {
        return Err(SequenceError::invalid_param(
            "arm",
            format!("'{arm}' is neither phi nor theta"),
        ));
    }
    Ok(arm)
}

fn positioner_move(verb: &str) -> PlanDraft {
    let mut draft = PlanDraft::new();
    draft.step(
        Step::device(
            StepKind::Move,
            format!("fps {verb}"),
            vec![DeviceCommand::new(ResourceName::fps(), verb)],
            vec![ResourceClaim::exclusive(ResourceName::fps())],
        )
        .with_timeout(POSITIONER_TIMEOUT),
    );
    draft
}

/// `moveToHome`.
pub fn move_to_home(_params: &OperationParams) -> SeqResult<PlanDraft> {
    Ok(positioner_move("home"))
}

/// `moveToSafePosition`.
pub fn move_to_safe_position(_params: &OperationParams) -> SeqResult<PlanDraft> {
    Ok(positioner_move("safe"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plans::build;
    use crate::step::Completion;
    use iic_core::resource::LockMode;

    fn params(s: &str) -> OperationParams {
        s.parse().unwrap()
    }

    #[test]
    fn boresight_defaults() {
        let plan = build("boresightLoop", &OperationParams::new()).unwrap();
        assert_eq!(plan.steps.len(), 2);
        let Completion::Converge(spec) = &plan.steps[1].completion else {
            panic!("expected convergence step");
        };
        assert_eq!(spec.max_iterations, 5);
        assert_eq!(spec.cycle[0].param_f64("exptime"), Some(2.0));
        assert_eq!(spec.cycle[1].verb, "measureBoresight");
        assert_eq!(plan.teardown[0].label, "bia off");
    }

    #[test]
    fn loop_reads_illuminator_shared() {
        let plan = build("makeMotorMap", &params("maxIterations=7 arm=theta")).unwrap();
        let converge = &plan.steps[1];
        let bia = converge
            .claims
            .iter()
            .find(|c| c.name.kind() == "illuminator")
            .unwrap();
        assert_eq!(bia.mode, LockMode::Shared);
        let Completion::Converge(spec) = &converge.completion else {
            panic!("expected convergence step");
        };
        assert_eq!(spec.max_iterations, 7);
        assert_eq!(spec.tolerance, 0.05);
        assert_eq!(converge.label, "theta motor map");
    }

    #[test]
    fn loop_parameters_are_validated() {
        assert!(build("makeMotorMap", &params("arm=elbow")).is_err());
        assert!(build("makeMotorMap", &params("maxIterations=0")).is_err());
        assert!(build("boresightLoop", &params("tolerance=0")).is_err());
        assert!(build("targetConvergenceTest", &params("exptime=x")).is_err());
    }

    #[test]
    fn angle_convergence_needs_targets_and_an_arm() {
        let plan = build("angleConvergenceTest", &params("arm=theta angleTargets=4")).unwrap();
        let Completion::Converge(spec) = &plan.steps[1].completion else {
            panic!("expected convergence step");
        };
        assert_eq!(spec.cycle[0].verb, "angleConvergenceTest");
        assert_eq!(spec.cycle[0].param_f64("angleTargets"), Some(4.0));
        assert_eq!(spec.max_iterations, 10);
        assert_eq!(plan.teardown[0].label, "bia off");

        assert!(build("angleConvergenceTest", &params("angleTargets=0")).is_err());
        let err = build("angleConvergenceTest", &params("arm=phi")).unwrap_err();
        assert!(matches!(err, SequenceError::InvalidParams { ref param, .. } if param == "angleTargets"));
        assert!(build("angleConvergenceTest", &params("arm=wrist")).is_err());
    }

    #[test]
    fn huge_metrology_exposure_is_rejected() {
        for op in ["boresightLoop", "makeMotorMap", "targetConvergenceTest"] {
            let err = build(op, &params("exptime=1e300")).unwrap_err();
            assert!(
                matches!(err, SequenceError::InvalidParams { ref param, .. } if param == "exptime"),
                "{op}: {err}"
            );
        }
    }

    #[test]
    fn moves_claim_only_the_positioner() {
        for (op, verb) in [("moveToHome", "home"), ("moveToSafePosition", "safe")] {
            let plan = build(op, &OperationParams::new()).unwrap();
            assert_eq!(plan.steps[0].commands[0].verb, verb);
            assert_eq!(plan.resources.len(), 1);
            assert!(plan.teardown.is_empty());
        }
    }
}
