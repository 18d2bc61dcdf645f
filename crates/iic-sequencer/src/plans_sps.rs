//! Spectrograph operation builders.
//!
//! Cameras are addressed through `arm:<cam>` resources, the slit through
//! `hexapod:sm<N>` and the shutters through `shutter:sm<N>`. Continuous lamps
//! (halogen for flats) are switched on by an exclusive lamp step and read by
//! exposures under a shared claim; timed lamps (arcs) are prepared and fired
//! by the exposure itself, so both steps claim them exclusively.

use std::time::Duration;

use iic_core::device::DeviceCommand;
use iic_core::error::SeqResult;
use iic_core::resource::{ResourceClaim, ResourceName};

use crate::params::{linspace, round2, seconds_after, spec_modules, Camera, OperationParams, Window};
use crate::plans::{ensure_plan_size, PlanDraft};
use crate::step::{RetryPolicy, Step, StepKind};

/// Readout overhead added to every exposure's device timeout.
const EXPOSE_OVERHEAD: Duration = Duration::from_secs(120);
/// Detector-level retries: one re-dispatch after a short pause.
const EXPOSE_RETRY: RetryPolicy = RetryPolicy {
    max_attempts: 2,
    backoff: Duration::from_secs(5),
    multiplier: 2.0,
};
const MOVE_RETRY: RetryPolicy = RetryPolicy {
    max_attempts: 3,
    backoff: Duration::from_secs(2),
    multiplier: 2.0,
};
const LAMP_RETRY: RetryPolicy = RetryPolicy {
    max_attempts: 2,
    backoff: Duration::from_secs(1),
    multiplier: 2.0,
};
/// Minimum frame count for master calibrations.
const MASTER_MIN_EXPOSURES: u32 = 15;
const DEFAULT_DITHER_POSITIONS: u32 = 3;
const DEFAULT_ARC_GRID: u32 = 2;
/// Slit defocus, in mm, at which arc exposure time doubles.
const DEFOCUS_DOUBLING: f64 = 2.0;

/// Exposure request shared by every expose step of an operation.
#[derive(Debug, Clone)]
struct ExposeSpec<'a> {
    cams: &'a [Camera],
    exptype: &'static str,
    exptime: f64,
    window: Option<Window>,
    extra_claims: Vec<ResourceClaim>,
    science_check: bool,
}

impl ExposeSpec<'_> {
    fn step(&self) -> Step {
        let commands = self
            .cams
            .iter()
            .map(|cam| {
                let mut cmd = DeviceCommand::new(cam.resource(), "expose")
                    .with_param("exptype", self.exptype)
                    .with_param("exptime", self.exptime);
                if self.science_check {
                    cmd = cmd.with_param("doScienceCheck", true);
                }
                match self.window {
                    Some(w) => cmd
                        .with_param("row0", i64::from(w.row0))
                        .with_param("nrows", i64::from(w.nrows)),
                    None => cmd,
                }
            })
            .collect();
        let mut claims: Vec<ResourceClaim> = self
            .cams
            .iter()
            .map(|cam| ResourceClaim::exclusive(cam.resource()))
            .collect();
        claims.extend(self.extra_claims.iter().cloned());

        let cams = self
            .cams
            .iter()
            .map(Camera::to_string)
            .collect::<Vec<_>>()
            .join(",");
        Step::device(
            StepKind::Expose,
            format!("{} {}s on {}", self.exptype, self.exptime, cams),
            commands,
            claims,
        )
        .with_retry(EXPOSE_RETRY)
        .with_timeout(seconds_after(EXPOSE_OVERHEAD, self.exptime))
    }
}

fn lamp_step(label: &str, lamps: &[(&str, DeviceCommand)]) -> Step {
    let commands: Vec<DeviceCommand> = lamps.iter().map(|(_, cmd)| cmd.clone()).collect();
    let claims = lamps
        .iter()
        .map(|(lamp, _)| ResourceClaim::exclusive(ResourceName::lamp(lamp)))
        .collect();
    Step::device(StepKind::LampControl, label, commands, claims).with_retry(LAMP_RETRY)
}

fn halogen_on(warming_time: f64) -> Step {
    let cmd = DeviceCommand::new(ResourceName::lamp("halogen"), "on")
        .with_param("warmingTime", warming_time);
    lamp_step("halogen on", &[("halogen", cmd)])
        .with_timeout(seconds_after(Duration::from_secs(60), warming_time))
}

fn halogen_off() -> Step {
    let cmd = DeviceCommand::new(ResourceName::lamp("halogen"), "off");
    lamp_step("halogen off", &[("halogen", cmd)])
}

/// Prepares timed lamps; the following arc exposure fires them.
fn prepare_lamps(lamps: &[(&'static str, f64)]) -> Step {
    let commands: Vec<(&str, DeviceCommand)> = lamps
        .iter()
        .map(|(lamp, secs)| {
            (
                *lamp,
                DeviceCommand::new(ResourceName::lamp(lamp), "prepare").with_param("time", *secs),
            )
        })
        .collect();
    let names = lamps.iter().map(|(l, _)| *l).collect::<Vec<_>>().join(",");
    lamp_step(&format!("prepare {names}"), &commands)
}

fn lamp_claims(lamps: &[(&'static str, f64)]) -> Vec<ResourceClaim> {
    lamps
        .iter()
        .map(|(lamp, _)| ResourceClaim::exclusive(ResourceName::lamp(lamp)))
        .collect()
}

fn halogen_shared() -> Vec<ResourceClaim> {
    vec![ResourceClaim::shared(ResourceName::lamp("halogen"))]
}

fn required_lamps(params: &OperationParams) -> SeqResult<Vec<(&'static str, f64)>> {
    let lamps = params.lamp_times()?;
    if lamps.is_empty() {
        return Err(iic_core::SequenceError::invalid_param(
            "lamps",
            "at least one lamp time (e.g. argon=5) is required",
        ));
    }
    Ok(lamps)
}

/// Arc exposure time: the longest lamp time.
fn arc_exptime(lamps: &[(&'static str, f64)]) -> f64 {
    lamps.iter().map(|(_, secs)| *secs).fold(0.0, f64::max)
}

fn slit_move(specs: &[u8], verb: &str, offsets: Option<(f64, f64)>) -> Step {
    let commands = specs
        .iter()
        .map(|spec| {
            let cmd = DeviceCommand::new(ResourceName::hexapod(*spec), verb);
            match offsets {
                Some((x, y)) => cmd.with_param("x", x).with_param("y", y),
                None => cmd,
            }
        })
        .collect();
    let claims = specs
        .iter()
        .map(|spec| ResourceClaim::exclusive(ResourceName::hexapod(*spec)))
        .collect();
    let label = match offsets {
        Some((x, y)) => format!("slit {verb} x={x} y={y}"),
        None => format!("slit {verb}"),
    };
    Step::device(StepKind::Move, label, commands, claims).with_retry(MOVE_RETRY)
}

fn repeat(step: Step, n: u32) -> impl Iterator<Item = Step> {
    std::iter::repeat(step).take(n as usize)
}

fn slit_focus(specs: &[u8], focus: f64) -> Step {
    let commands = specs
        .iter()
        .map(|spec| DeviceCommand::new(ResourceName::hexapod(*spec), "focus").with_param("focus", focus))
        .collect();
    let claims = specs
        .iter()
        .map(|spec| ResourceClaim::exclusive(ResourceName::hexapod(*spec)))
        .collect();
    Step::device(StepKind::Move, format!("slit focus={focus}"), commands, claims).with_retry(MOVE_RETRY)
}

/// Move on every camera, claiming the cameras.
fn camera_move(cams: &[Camera], label: String, command: impl Fn(&Camera) -> DeviceCommand) -> Step {
    let claims = cams
        .iter()
        .map(|cam| ResourceClaim::exclusive(cam.resource()))
        .collect();
    Step::device(StepKind::Move, label, cams.iter().map(command).collect(), claims)
        .with_retry(MOVE_RETRY)
}

fn dither_offsets(params: &OperationParams) -> SeqResult<(f64, f64)> {
    let dither_x = params.require_f64("dither_x")?;
    let dither_y = params.require_f64("dither_y")?;
    if dither_x == 0.0 && dither_y == 0.0 {
        return Err(iic_core::SequenceError::invalid_param(
            "dither_x",
            "dither_x and dither_y cannot both be 0",
        ));
    }
    Ok((dither_x, dither_y))
}

/// Timed-lamp arc: prepare then expose, `n` times.
fn arc_pair(cams: &[Camera], lamps: &[(&'static str, f64)], n: u32) -> Vec<Step> {
    arc_frames(cams, lamps, n, false)
}

fn arc_frames(cams: &[Camera], lamps: &[(&'static str, f64)], n: u32, science_check: bool) -> Vec<Step> {
    let expose = ExposeSpec {
        cams,
        exptype: "arc",
        exptime: arc_exptime(lamps),
        window: None,
        extra_claims: lamp_claims(lamps),
        science_check,
    }
    .step();
    let prepare = prepare_lamps(lamps);
    (0..n)
        .flat_map(|_| [prepare.clone(), expose.clone()])
        .collect()
}

// =============================================================================
// Biases / darks
// =============================================================================

/// `biases`: `cams`, `nExposures`.
pub fn biases(params: &OperationParams) -> SeqResult<PlanDraft> {
    bias_frames(params, 1)
}

/// `masterBiases`: at least 15 biases.
pub fn master_biases(params: &OperationParams) -> SeqResult<PlanDraft> {
    bias_frames(params, MASTER_MIN_EXPOSURES)
}

fn bias_frames(params: &OperationParams, min: u32) -> SeqResult<PlanDraft> {
    let cams = params.cameras()?;
    let n = params.count_or("nExposures", min, min)?;
    let expose = ExposeSpec {
        cams: &cams,
        exptype: "bias",
        exptime: 0.0,
        window: None,
        extra_claims: vec![],
        science_check: false,
    }
    .step();
    let mut draft = PlanDraft::new();
    draft.steps(repeat(expose, n));
    Ok(draft)
}

/// `darks`: `cams`, `exptime`, `nExposures`.
pub fn darks(params: &OperationParams) -> SeqResult<PlanDraft> {
    dark_frames(params, 1)
}

/// `masterDarks`: at least 15 darks.
pub fn master_darks(params: &OperationParams) -> SeqResult<PlanDraft> {
    dark_frames(params, MASTER_MIN_EXPOSURES)
}

fn dark_frames(params: &OperationParams, min: u32) -> SeqResult<PlanDraft> {
    let cams = params.cameras()?;
    let exptime = params.require_seconds("exptime")?;
    let n = params.count_or("nExposures", min, min)?;
    let expose = ExposeSpec {
        cams: &cams,
        exptype: "dark",
        exptime,
        window: None,
        extra_claims: vec![],
        science_check: false,
    }
    .step();
    let mut draft = PlanDraft::new();
    draft.steps(repeat(expose, n));
    Ok(draft)
}

// =============================================================================
// Flats
// =============================================================================

/// `doFlat`: halogen on, `nExposures` flats, halogen off on teardown.
pub fn do_flat(params: &OperationParams) -> SeqResult<PlanDraft> {
    flats(params, None, false)
}

/// `doFlatWindow`: `doFlat` with a windowed readout.
pub fn do_flat_window(params: &OperationParams) -> SeqResult<PlanDraft> {
    let window = params.window()?;
    flats(params, Some(window), false)
}

/// `scienceTrace`: `doFlat` with the science check on every exposure.
pub fn science_trace(params: &OperationParams) -> SeqResult<PlanDraft> {
    flats(params, None, true)
}

fn flats(params: &OperationParams, window: Option<Window>, science_check: bool) -> SeqResult<PlanDraft> {
    let cams = params.cameras()?;
    let exptime = params.require_seconds("exptime")?;
    let n = params.count_or("nExposures", 1, 1)?;
    let warming_time = params.seconds_or("warmingTime", 0.0)?;

    let expose = ExposeSpec {
        cams: &cams,
        exptype: "flat",
        exptime,
        window,
        extra_claims: halogen_shared(),
        science_check,
    }
    .step();

    let mut draft = PlanDraft::new();
    draft.step(halogen_on(warming_time));
    draft.steps(repeat(expose, n));
    draft.teardown(halogen_off());
    Ok(draft)
}

/// `ditheredFlats`: flats over a line of slit offsets.
///
/// The pattern is bracketed by flats at the home position. Offsets are
/// `k * (dither_x, dither_y)` for `nPositions` values of `k` centered on 0.
pub fn dithered_flats(params: &OperationParams) -> SeqResult<PlanDraft> {
    let cams = params.cameras()?;
    let exptime = params.require_seconds("exptime")?;
    let (dither_x, dither_y) = dither_offsets(params)?;
    let n_positions = params.count_or("nPositions", DEFAULT_DITHER_POSITIONS, 1)?;
    let n = params.count_or("nExposures", 1, 1)?;
    let warming_time = params.seconds_or("warmingTime", 0.0)?;
    ensure_plan_size("nPositions", (u64::from(n_positions) + 2) * (u64::from(n) + 1))?;
    let specs = spec_modules(&cams);

    let flat = ExposeSpec {
        cams: &cams,
        exptype: "flat",
        exptime,
        window: None,
        extra_claims: halogen_shared(),
        science_check: false,
    }
    .step();

    let center = f64::from(n_positions - 1) / 2.0;
    let mut draft = PlanDraft::new();
    draft.step(halogen_on(warming_time));
    draft.step(slit_move(&specs, "home", None));
    draft.steps(repeat(flat.clone(), n));
    for i in 0..n_positions {
        let k = f64::from(i) - center;
        let offsets = (round2(k * dither_x), round2(k * dither_y));
        draft.step(slit_move(&specs, "dither", Some(offsets)));
        draft.steps(repeat(flat.clone(), n));
    }
    draft.step(slit_move(&specs, "home", None));
    draft.steps(repeat(flat, n));
    draft.teardown(slit_move(&specs, "home", None));
    draft.teardown(halogen_off());
    Ok(draft)
}

// =============================================================================
// Arcs
// =============================================================================

/// `arcs`: timed-lamp arcs, `nExposures` times.
pub fn arcs(params: &OperationParams) -> SeqResult<PlanDraft> {
    timed_arcs(params, false)
}

/// `scienceArc`: `arcs` with the science check on every exposure.
pub fn science_arc(params: &OperationParams) -> SeqResult<PlanDraft> {
    timed_arcs(params, true)
}

fn timed_arcs(params: &OperationParams, science_check: bool) -> SeqResult<PlanDraft> {
    let cams = params.cameras()?;
    let lamps = required_lamps(params)?;
    let n = params.count_or("nExposures", 1, 1)?;
    let mut draft = PlanDraft::new();
    draft.steps(arc_frames(&cams, &lamps, n, science_check));
    Ok(draft)
}

/// `ditheredArcs`: arcs over an `nPositions x nPositions` slit grid.
pub fn dithered_arcs(params: &OperationParams) -> SeqResult<PlanDraft> {
    let cams = params.cameras()?;
    let lamps = required_lamps(params)?;
    let (dither_x, dither_y) = dither_offsets(params)?;
    let grid = params.count_or("nPositions", DEFAULT_ARC_GRID, 1)?;
    let n = params.count_or("nExposures", 1, 1)?;
    ensure_plan_size("nPositions", u64::from(grid).pow(2) * (2 * u64::from(n) + 1))?;
    let specs = spec_modules(&cams);

    let mut draft = PlanDraft::new();
    draft.step(slit_move(&specs, "home", None));
    for ix in 0..grid {
        for iy in 0..grid {
            let offsets = (
                round2(f64::from(ix) * dither_x),
                round2(f64::from(iy) * dither_y),
            );
            draft.step(slit_move(&specs, "dither", Some(offsets)));
            draft.steps(arc_pair(&cams, &lamps, n));
        }
    }
    draft.teardown(slit_move(&specs, "home", None));
    Ok(draft)
}

/// `defocusedArcs`: arcs at each slit focus in `position=start,stop,num`.
///
/// Lamp times grow with the defocus so each frame collects a comparable
/// signal: `t * (1 + (focus / DEFOCUS_DOUBLING)^2)`.
pub fn defocused_arcs(params: &OperationParams) -> SeqResult<PlanDraft> {
    let cams = params.cameras()?;
    let lamps = required_lamps(params)?;
    let positions = params.linspace("position")?;
    let n = params.count_or("nExposures", 1, 1)?;
    ensure_plan_size("position", positions.len() as u64 * (2 * u64::from(n) + 1))?;
    let specs = spec_modules(&cams);

    let mut draft = PlanDraft::new();
    draft.step(slit_move(&specs, "home", None));
    for focus in positions {
        let factor = 1.0 + (focus / DEFOCUS_DOUBLING).powi(2);
        let scaled = lamps
            .iter()
            .map(|(lamp, secs)| {
                let scaled = round2(secs * factor);
                if scaled > crate::params::MAX_SECONDS {
                    return Err(iic_core::SequenceError::invalid_param(
                        "position",
                        format!("defocus {focus} stretches {lamp} to {scaled}s"),
                    ));
                }
                Ok((*lamp, scaled))
            })
            .collect::<SeqResult<Vec<_>>>()?;
        draft.step(slit_focus(&specs, focus));
        draft.steps(arc_pair(&cams, &scaled, n));
    }
    draft.teardown(slit_move(&specs, "home", None));
    Ok(draft)
}

/// `fpaThroughFocus`: arcs at each FPA focus in `focusRange=start,stop,num`.
pub fn fpa_through_focus(params: &OperationParams) -> SeqResult<PlanDraft> {
    let cams = params.cameras()?;
    let lamps = required_lamps(params)?;
    let positions = params.linspace("focusRange")?;
    let n = params.count_or("nExposures", 1, 1)?;
    ensure_plan_size("focusRange", positions.len() as u64 * (2 * u64::from(n) + 1))?;

    let mut draft = PlanDraft::new();
    for microns in positions {
        draft.step(camera_move(&cams, format!("fpa moveFocus microns={microns}"), |cam| {
            DeviceCommand::new(cam.resource(), "moveFocus").with_param("microns", microns)
        }));
        draft.steps(arc_pair(&cams, &lamps, n));
    }
    draft.teardown(fpa_to_focus(&cams));
    Ok(draft)
}

fn fpa_to_focus(cams: &[Camera]) -> Step {
    camera_move(cams, "fpa toFocus".to_string(), |cam| {
        DeviceCommand::new(cam.resource(), "toFocus")
    })
}

/// `slitThroughFocus`: arcs at each absolute slit focus in
/// `position=start,stop,num`; the slit goes back to focus 0 on teardown.
pub fn slit_through_focus(params: &OperationParams) -> SeqResult<PlanDraft> {
    let cams = params.cameras()?;
    let lamps = required_lamps(params)?;
    let positions = params.linspace("position")?;
    let n = params.count_or("nExposures", 1, 1)?;
    ensure_plan_size("position", positions.len() as u64 * (2 * u64::from(n) + 1))?;
    let specs = spec_modules(&cams);

    let mut draft = PlanDraft::new();
    for focus in positions {
        draft.step(slit_focus(&specs, focus));
        draft.steps(arc_pair(&cams, &lamps, n));
    }
    draft.teardown(slit_focus(&specs, 0.0));
    Ok(draft)
}

/// `detThroughFocus`: arcs at each detector motor position.
///
/// The three motors `a,b,c` sweep `position=start,stop,num` together,
/// offset by the optional `tilt=a,b,c`. The sweep stops short by the largest
/// tilt so no motor overshoots `stop`.
pub fn det_through_focus(params: &OperationParams) -> SeqResult<PlanDraft> {
    let cams = params.cameras()?;
    let lamps = required_lamps(params)?;
    let (start, stop, num) = params.range("position")?;
    let tilt = params.floats::<3>("tilt")?.unwrap_or([0.0; 3]);
    let n = params.count_or("nExposures", 1, 1)?;
    ensure_plan_size("position", u64::from(num) * (2 * u64::from(n) + 1))?;
    let max_tilt = tilt.iter().copied().fold(f64::MIN, f64::max);

    let mut draft = PlanDraft::new();
    for base in linspace(start, stop - max_tilt, num) {
        let [a, b, c] = tilt.map(|t| round2(base + t));
        draft.step(camera_move(&cams, format!("ccd motors a={a} b={b} c={c}"), |cam| {
            DeviceCommand::new(cam.resource(), "moveMotors")
                .with_param("a", a)
                .with_param("b", b)
                .with_param("c", c)
        }));
        draft.steps(arc_pair(&cams, &lamps, n));
    }
    draft.teardown(fpa_to_focus(&cams));
    Ok(draft)
}

// =============================================================================
// Science
// =============================================================================

/// `scienceObject`: shuttered object exposures.
pub fn science_object(params: &OperationParams) -> SeqResult<PlanDraft> {
    shuttered_frames(params, "object", None)
}

/// `scienceObjectWindow`: windowed object exposures.
pub fn science_object_window(params: &OperationParams) -> SeqResult<PlanDraft> {
    let window = params.window()?;
    shuttered_frames(params, "object", Some(window))
}

/// `domeFlat`: shuttered dome flats, windowed when `window` is given.
pub fn dome_flat(params: &OperationParams) -> SeqResult<PlanDraft> {
    let window = if params.contains("window") {
        Some(params.window()?)
    } else {
        None
    };
    shuttered_frames(params, "domeflat", window)
}

/// Exposures through the spectrograph shutters, under the science check.
fn shuttered_frames(
    params: &OperationParams,
    exptype: &'static str,
    window: Option<Window>,
) -> SeqResult<PlanDraft> {
    let cams = params.cameras()?;
    let exptime = params.require_seconds("exptime")?;
    let n = params.count_or("nExposures", 1, 1)?;
    let shutters = spec_modules(&cams)
        .into_iter()
        .map(|spec| ResourceClaim::exclusive(ResourceName::shutter(spec)))
        .collect();
    let expose = ExposeSpec {
        cams: &cams,
        exptype,
        exptime,
        window,
        extra_claims: shutters,
        science_check: true,
    }
    .step();
    let mut draft = PlanDraft::new();
    draft.steps(repeat(expose, n));
    Ok(draft)
}

/// `erase`: flushes the detectors without reading them out.
pub fn erase(params: &OperationParams) -> SeqResult<PlanDraft> {
    let cams = params.cameras()?;
    let expose = ExposeSpec {
        cams: &cams,
        exptype: "erase",
        exptime: 0.0,
        window: None,
        extra_claims: vec![],
        science_check: false,
    }
    .step();
    let mut draft = PlanDraft::new();
    draft.step(expose);
    Ok(draft)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plans::build;
    use crate::step::Completion;
    use iic_core::resource::LockMode;
    use iic_core::SequenceError;

    fn params(s: &str) -> OperationParams {
        s.parse().unwrap()
    }

    fn kinds(steps: &[Step]) -> Vec<StepKind> {
        steps.iter().map(|s| s.kind).collect()
    }

    #[test]
    fn do_flat_expands_exposures() {
        let plan = build("doFlat", &params("cams=b1 exptime=30 nExposures=3")).unwrap();
        assert_eq!(
            kinds(&plan.steps),
            vec![
                StepKind::LampControl,
                StepKind::Expose,
                StepKind::Expose,
                StepKind::Expose
            ]
        );
        let lamp_on = &plan.steps[0];
        assert_eq!(lamp_on.claims, vec![ResourceClaim::exclusive(ResourceName::lamp("halogen"))]);

        let flat = &plan.steps[1];
        assert_eq!(flat.commands[0].param_f64("exptime"), Some(30.0));
        assert_eq!(flat.timeout, Some(Duration::from_secs(150)));
        assert!(flat
            .claims
            .iter()
            .any(|c| c.name.as_str() == "lamp:halogen" && c.mode == LockMode::Shared));
        assert_eq!(plan.teardown[0].label, "halogen off");
    }

    #[test]
    fn flat_requires_exptime() {
        let err = build("doFlat", &params("cams=b1")).unwrap_err();
        assert!(matches!(err, SequenceError::InvalidParams { ref param, .. } if param == "exptime"));
    }

    #[test]
    fn window_operations_require_window() {
        let err = build("doFlatWindow", &params("cams=b1 exptime=5")).unwrap_err();
        assert!(matches!(err, SequenceError::InvalidParams { ref param, .. } if param == "window"));

        let plan = build("doFlatWindow", &params("cams=b1 exptime=5 window=100,50")).unwrap();
        assert_eq!(plan.steps[1].commands[0].param_f64("nrows"), Some(50.0));

        let err = build("scienceObjectWindow", &params("cams=r2 exptime=5")).unwrap_err();
        assert!(matches!(err, SequenceError::InvalidParams { ref param, .. } if param == "window"));
    }

    #[test]
    fn dithered_requires_both_offsets() {
        let err = build("ditheredFlats", &params("cams=b1 exptime=5 dither_y=0.5")).unwrap_err();
        assert!(matches!(err, SequenceError::InvalidParams { ref param, .. } if param == "dither_x"));

        let err = build("ditheredFlats", &params("cams=b1 exptime=5 dither_x=0.5")).unwrap_err();
        assert!(matches!(err, SequenceError::InvalidParams { ref param, .. } if param == "dither_y"));

        let err = build("ditheredArcs", &params("cams=b1 argon=5 dither_x=0.5")).unwrap_err();
        assert!(matches!(err, SequenceError::InvalidParams { ref param, .. } if param == "dither_y"));
    }

    #[test]
    fn dithered_flats_positions_are_centered() {
        let plan = build(
            "ditheredFlats",
            &params("cams=b1,r1 exptime=5 dither_x=0.5 dither_y=0 nPositions=3 nExposures=2"),
        )
        .unwrap();
        let dithers: Vec<f64> = plan
            .steps
            .iter()
            .filter(|s| s.label.starts_with("slit dither"))
            .map(|s| s.commands[0].param_f64("x").unwrap())
            .collect();
        assert_eq!(dithers, vec![-0.5, 0.0, 0.5]);

        // One hexapod for both cameras of sm1.
        let dither = plan.steps.iter().find(|s| s.label.starts_with("slit dither")).unwrap();
        assert_eq!(dither.commands.len(), 1);
        assert_eq!(dither.claims[0].name.as_str(), "hexapod:sm1");

        // lamp + home + 2 flats + 3 x (dither + 2 flats) + home + 2 flats
        assert_eq!(plan.steps.len(), 1 + 1 + 2 + 3 * 3 + 1 + 2);
        assert_eq!(plan.teardown.len(), 2);
    }

    #[test]
    fn arcs_use_longest_lamp_time() {
        let plan = build("arcs", &params("cams=b1 argon=5 neon=12 nExposures=2")).unwrap();
        assert_eq!(
            kinds(&plan.steps),
            vec![
                StepKind::LampControl,
                StepKind::Expose,
                StepKind::LampControl,
                StepKind::Expose
            ]
        );
        assert_eq!(plan.steps[1].commands[0].param_f64("exptime"), Some(12.0));
        assert_eq!(plan.steps[0].commands.len(), 2);
        assert!(plan.steps[1]
            .claims
            .iter()
            .filter(|c| c.name.kind() == "lamp")
            .all(|c| c.mode == LockMode::Exclusive));
    }

    #[test]
    fn arcs_require_a_lamp() {
        let err = build("arcs", &params("cams=b1")).unwrap_err();
        assert!(matches!(err, SequenceError::InvalidParams { ref param, .. } if param == "lamps"));
    }

    #[test]
    fn fpa_through_focus_sweeps_and_refocuses() {
        let plan = build(
            "fpaThroughFocus",
            &params("cams=b1 hgcd=4 focusRange=0,100,3"),
        )
        .unwrap();
        let focus: Vec<f64> = plan
            .steps
            .iter()
            .filter(|s| s.kind == StepKind::Move)
            .map(|s| s.commands[0].param_f64("microns").unwrap())
            .collect();
        assert_eq!(focus, vec![0.0, 50.0, 100.0]);
        assert_eq!(plan.teardown[0].commands[0].verb, "toFocus");
    }

    #[test]
    fn master_frames_enforce_minimum() {
        let err = build("masterBiases", &params("cams=b1 nExposures=10")).unwrap_err();
        assert!(matches!(err, SequenceError::InvalidParams { ref param, .. } if param == "nExposures"));
        let plan = build("masterDarks", &params("cams=b1 exptime=300")).unwrap();
        assert_eq!(plan.steps.len(), 15);
    }

    #[test]
    fn science_object_claims_shutters() {
        let plan = build("scienceObject", &params("cams=b1,r1,b2 exptime=900")).unwrap();
        let step = &plan.steps[0];
        let shutters: Vec<&str> = step
            .claims
            .iter()
            .filter(|c| c.name.kind() == "shutter")
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(shutters, vec!["shutter:sm1", "shutter:sm2"]);
        assert_eq!(step.commands.len(), 3);
        assert_eq!(step.completion, Completion::AllDone);
    }

    fn invalid_param(result: SeqResult<crate::plans::SequencePlan>) -> String {
        match result {
            Err(SequenceError::InvalidParams { param, .. }) => param,
            other => panic!("expected InvalidParams, got {other:?}"),
        }
    }

    #[test]
    fn oversized_times_are_invalid_params() {
        assert_eq!(invalid_param(build("doFlat", &params("cams=b1 exptime=1e300"))), "exptime");
        assert_eq!(invalid_param(build("darks", &params("cams=b1 exptime=1.9e19"))), "exptime");
        assert_eq!(
            invalid_param(build("doFlat", &params("cams=b1 exptime=5 warmingTime=1e300"))),
            "warmingTime"
        );
        assert_eq!(invalid_param(build("arcs", &params("cams=b1 argon=1e300"))), "argon");
        assert_eq!(invalid_param(build("domeFlat", &params("cams=b1 exptime=1e20"))), "exptime");
    }

    #[test]
    fn oversized_expansions_are_invalid_params() {
        assert_eq!(
            invalid_param(build("biases", &params("cams=b1 nExposures=4000000000"))),
            "nExposures"
        );
        assert_eq!(
            invalid_param(build(
                "ditheredArcs",
                &params("cams=b1 argon=5 dither_x=1 dither_y=1 nPositions=1000 nExposures=1000")
            )),
            "nPositions"
        );
        assert_eq!(
            invalid_param(build("fpaThroughFocus", &params("cams=b1 argon=5 focusRange=0,1,1000 nExposures=100"))),
            "focusRange"
        );
    }

    #[test]
    fn dithered_arcs_need_a_nonzero_offset() {
        assert_eq!(
            invalid_param(build("ditheredArcs", &params("cams=b1 argon=5 dither_x=0 dither_y=0"))),
            "dither_x"
        );
        assert!(build("ditheredArcs", &params("cams=b1 argon=5 dither_x=0 dither_y=0.5")).is_ok());
    }

    #[test]
    fn defocused_arcs_stretch_lamp_times() {
        let plan = build("defocusedArcs", &params("cams=r1 neon=10 position=-4,4,3")).unwrap();
        let focus: Vec<f64> = plan
            .steps
            .iter()
            .filter(|s| s.label.starts_with("slit focus"))
            .map(|s| s.commands[0].param_f64("focus").unwrap())
            .collect();
        assert_eq!(focus, vec![-4.0, 0.0, 4.0]);

        let exptimes: Vec<f64> = plan
            .steps
            .iter()
            .filter(|s| s.kind == StepKind::Expose)
            .map(|s| s.commands[0].param_f64("exptime").unwrap())
            .collect();
        assert_eq!(exptimes, vec![50.0, 10.0, 50.0]);
        assert_eq!(plan.steps[0].label, "slit home");
        assert_eq!(plan.teardown[0].label, "slit home");

        assert_eq!(
            invalid_param(build("defocusedArcs", &params("cams=r1 neon=10 position=-1e6,0,2"))),
            "position"
        );
    }

    #[test]
    fn slit_through_focus_returns_to_zero() {
        let plan = build("slitThroughFocus", &params("cams=b1,r1 argon=5 position=-1,1,5")).unwrap();
        let moves: Vec<&Step> = plan.steps.iter().filter(|s| s.kind == StepKind::Move).collect();
        assert_eq!(moves.len(), 5);
        assert_eq!(moves[1].commands[0].param_f64("focus"), Some(-0.5));
        // One hexapod for both cameras.
        assert_eq!(moves[0].claims, vec![ResourceClaim::exclusive(ResourceName::hexapod(1))]);
        assert_eq!(plan.teardown[0].commands[0].param_f64("focus"), Some(0.0));
    }

    #[test]
    fn det_through_focus_applies_tilt() {
        let plan = build(
            "detThroughFocus",
            &params("cams=b1 argon=5 position=0,100,3 tilt=0,10,0"),
        )
        .unwrap();
        let motors: Vec<(f64, f64, f64)> = plan
            .steps
            .iter()
            .filter(|s| s.kind == StepKind::Move)
            .map(|s| {
                let c = &s.commands[0];
                (
                    c.param_f64("a").unwrap(),
                    c.param_f64("b").unwrap(),
                    c.param_f64("c").unwrap(),
                )
            })
            .collect();
        assert_eq!(motors, vec![(0.0, 10.0, 0.0), (45.0, 55.0, 45.0), (90.0, 100.0, 90.0)]);
        assert_eq!(plan.teardown[0].commands[0].verb, "toFocus");
        assert_eq!(invalid_param(build("detThroughFocus", &params("cams=b1 argon=5 position=0,1,2 tilt=1"))), "tilt");
    }

    #[test]
    fn science_variants_request_the_science_check() {
        let checked = |op: &str, p: &str| {
            let plan = build(op, &params(p)).unwrap();
            plan.steps
                .iter()
                .filter(|s| s.kind == StepKind::Expose)
                .all(|s| s.commands[0].params.get("doScienceCheck").is_some())
        };
        assert!(checked("scienceArc", "cams=b1 argon=5"));
        assert!(checked("scienceTrace", "cams=b1 exptime=5"));
        assert!(checked("domeFlat", "cams=b1 exptime=5"));
        assert!(!checked("arcs", "cams=b1 argon=5"));
        assert!(!checked("doFlat", "cams=b1 exptime=5"));

        let plan = build("domeFlat", &params("cams=b1 exptime=5 window=0,100")).unwrap();
        let expose = &plan.steps[0];
        assert_eq!(expose.commands[0].param_f64("nrows"), Some(100.0));
        assert!(expose.claims.iter().any(|c| c.name.as_str() == "shutter:sm1"));
    }
}
