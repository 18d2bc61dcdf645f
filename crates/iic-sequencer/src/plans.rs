//! Sequence builder: named operations expanded into ordered steps.
//!
//! Every operation the sequencer accepts is a variant of [`OperationKind`].
//! An [`OperationRegistry`] maps each kind to a pure builder function; adding
//! an operation means adding a variant *and* registering its builder.
//!
//! Building is deterministic and side-effect free: the same
//! `(operation, params)` always yields the same [`SequencePlan`], and nothing
//! touches hardware until the plan is submitted.
//!
//! # Example
//!
//! ```rust
//! use iic_sequencer::plans::build;
//! use iic_sequencer::params::OperationParams;
//!
//! let params: OperationParams = "cams=b1 exptime=30 nExposures=3".parse().unwrap();
//! let plan = build("doFlat", &params).unwrap();
//! assert_eq!(plan.steps.len(), 4); // lamp on + 3 flats
//! assert_eq!(plan.teardown.len(), 1); // lamp off
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use iic_core::error::{SeqResult, SequenceError};
use iic_core::resource::{normalize_claims, ResourceName};

use crate::params::OperationParams;
use crate::plans_fps;
use crate::plans_sps;
use crate::step::Step;

/// Subsystem an operation drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    /// Spectrograph cameras, lamps and slit.
    Spectrograph,
    /// Fiber positioner and metrology camera.
    FiberPositioner,
}

macro_rules! operation_kinds {
    ($($variant:ident => $name:literal),+ $(,)?) => {
        /// Closed set of operations the sequencer can build.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum OperationKind {
            $(
                #[doc = concat!("`", $name, "`")]
                #[serde(rename = $name)]
                $variant,
            )+
        }

        impl OperationKind {
            /// Every operation kind.
            pub const ALL: &'static [OperationKind] = &[$(OperationKind::$variant),+];

            /// Operator-facing name.
            pub fn name(self) -> &'static str {
                match self {
                    $(OperationKind::$variant => $name,)+
                }
            }
        }

        impl FromStr for OperationKind {
            type Err = SequenceError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok(OperationKind::$variant),)+
                    other => Err(SequenceError::UnknownOperation(other.to_string())),
                }
            }
        }
    };
}

operation_kinds! {
    Biases => "biases",
    Darks => "darks",
    MasterBiases => "masterBiases",
    MasterDarks => "masterDarks",
    DoFlat => "doFlat",
    DoFlatWindow => "doFlatWindow",
    Arcs => "arcs",
    DitheredFlats => "ditheredFlats",
    DitheredArcs => "ditheredArcs",
    DefocusedArcs => "defocusedArcs",
    FpaThroughFocus => "fpaThroughFocus",
    SlitThroughFocus => "slitThroughFocus",
    DetThroughFocus => "detThroughFocus",
    ScienceArc => "scienceArc",
    ScienceTrace => "scienceTrace",
    DomeFlat => "domeFlat",
    ScienceObject => "scienceObject",
    ScienceObjectWindow => "scienceObjectWindow",
    Erase => "erase",
    BoresightLoop => "boresightLoop",
    MakeMotorMap => "makeMotorMap",
    TargetConvergenceTest => "targetConvergenceTest",
    AngleConvergenceTest => "angleConvergenceTest",
    MoveToHome => "moveToHome",
    MoveToSafePosition => "moveToSafePosition",
}

impl OperationKind {
    /// Subsystem family.
    pub fn family(self) -> Family {
        match self {
            OperationKind::BoresightLoop
            | OperationKind::MakeMotorMap
            | OperationKind::TargetConvergenceTest
            | OperationKind::AngleConvergenceTest
            | OperationKind::MoveToHome
            | OperationKind::MoveToSafePosition => Family::FiberPositioner,
            _ => Family::Spectrograph,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Most main steps a single plan may expand to.
pub const MAX_PLAN_STEPS: u64 = 10_000;

/// Rejects a request whose expansion would exceed [`MAX_PLAN_STEPS`],
/// naming `param` as the culprit.
pub(crate) fn ensure_plan_size(param: &str, steps: u64) -> SeqResult<()> {
    if steps > MAX_PLAN_STEPS {
        return Err(SequenceError::invalid_param(
            param,
            format!("expands to {steps} steps, more than {MAX_PLAN_STEPS}"),
        ));
    }
    Ok(())
}

/// Steps produced by a builder function, before validation.
#[derive(Debug, Default)]
pub struct PlanDraft {
    steps: Vec<Step>,
    teardown: Vec<Step>,
}

impl PlanDraft {
    /// Empty draft.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a main step.
    pub fn step(&mut self, step: Step) -> &mut Self {
        self.steps.push(step);
        self
    }

    /// Appends several main steps.
    pub fn steps(&mut self, steps: impl IntoIterator<Item = Step>) -> &mut Self {
        self.steps.extend(steps);
        self
    }

    /// Appends a teardown step, run on every exit path.
    pub fn teardown(&mut self, step: Step) -> &mut Self {
        self.teardown.push(step);
        self
    }
}

/// A built, validated, not yet submitted sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencePlan {
    /// Operation kind.
    pub operation: OperationKind,
    /// Request parameters the plan was built from.
    pub params: OperationParams,
    /// Optional sequence name given by the operator.
    pub name: Option<String>,
    /// Optional operator comments.
    pub comments: Option<String>,
    /// Main steps, executed in order.
    pub steps: Vec<Step>,
    /// Cleanup steps, executed best-effort on every exit path.
    pub teardown: Vec<Step>,
    /// Every resource referenced by any step.
    pub resources: BTreeSet<ResourceName>,
}

impl SequencePlan {
    /// Validates a draft into a plan.
    ///
    /// Rejects plans without steps and any step whose claims are
    /// self-conflicting, so such plans never reach execution.
    pub fn from_draft(
        operation: OperationKind,
        params: &OperationParams,
        draft: PlanDraft,
    ) -> SeqResult<Self> {
        if draft.steps.is_empty() {
            return Err(SequenceError::invalid(format!(
                "operation '{operation}' produced no steps"
            )));
        }
        let mut resources = BTreeSet::new();
        for (index, step) in draft.steps.iter().chain(draft.teardown.iter()).enumerate() {
            let claims = normalize_claims(&step.claims).map_err(|e| {
                SequenceError::invalid(format!("step {index} ({}): {e}", step.label))
            })?;
            for command in &step.commands {
                if !claims.iter().any(|c| c.name == command.resource) {
                    return Err(SequenceError::invalid(format!(
                        "step {index} ({}) commands '{}' without claiming it",
                        step.label, command.resource
                    )));
                }
            }
            resources.extend(claims.into_iter().map(|c| c.name));
        }
        Ok(Self {
            operation,
            params: params.clone(),
            name: params.get("name").map(str::to_string),
            comments: params.get("comments").map(str::to_string),
            steps: draft.steps,
            teardown: draft.teardown,
            resources,
        })
    }

    /// Number of main steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the plan has no main steps. Never true for a validated plan.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Pure builder function for one operation kind.
pub type BuildFn = fn(&OperationParams) -> SeqResult<PlanDraft>;

struct OperationEntry {
    build: BuildFn,
    description: &'static str,
}

/// Explicit map from operation kind to builder.
pub struct OperationRegistry {
    entries: BTreeMap<OperationKind, OperationEntry>,
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl OperationRegistry {
    /// Registry with nothing registered.
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Registry with every built-in operation.
    pub fn standard() -> Self {
        use OperationKind::*;
        let mut registry = Self::empty();
        registry.register(Biases, "n bias frames", plans_sps::biases);
        registry.register(Darks, "n dark frames of exptime seconds", plans_sps::darks);
        registry.register(MasterBiases, "at least 15 bias frames", plans_sps::master_biases);
        registry.register(MasterDarks, "at least 15 dark frames", plans_sps::master_darks);
        registry.register(DoFlat, "halogen flats", plans_sps::do_flat);
        registry.register(DoFlatWindow, "windowed halogen flats", plans_sps::do_flat_window);
        registry.register(Arcs, "timed-lamp arcs", plans_sps::arcs);
        registry.register(DitheredFlats, "flats over a slit dither pattern", plans_sps::dithered_flats);
        registry.register(DitheredArcs, "arcs over a slit dither grid", plans_sps::dithered_arcs);
        registry.register(DefocusedArcs, "arcs at defocused slit positions", plans_sps::defocused_arcs);
        registry.register(FpaThroughFocus, "arc-through-focus sweep of the FPA", plans_sps::fpa_through_focus);
        registry.register(SlitThroughFocus, "arc-through-focus sweep of the slit", plans_sps::slit_through_focus);
        registry.register(DetThroughFocus, "arc-through-focus sweep of the detector motors", plans_sps::det_through_focus);
        registry.register(ScienceArc, "arcs under the science check", plans_sps::science_arc);
        registry.register(ScienceTrace, "flats under the science check", plans_sps::science_trace);
        registry.register(DomeFlat, "shuttered dome flats", plans_sps::dome_flat);
        registry.register(ScienceObject, "shuttered object exposures", plans_sps::science_object);
        registry.register(ScienceObjectWindow, "windowed object exposures", plans_sps::science_object_window);
        registry.register(Erase, "detector erase", plans_sps::erase);
        registry.register(BoresightLoop, "boresight-convergence loop", plans_fps::boresight_loop);
        registry.register(MakeMotorMap, "iterative cobra motor map", plans_fps::make_motor_map);
        registry.register(TargetConvergenceTest, "cobra convergence to targets", plans_fps::target_convergence_test);
        registry.register(AngleConvergenceTest, "cobra convergence to angle targets", plans_fps::angle_convergence_test);
        registry.register(MoveToHome, "send cobras home", plans_fps::move_to_home);
        registry.register(MoveToSafePosition, "send cobras to safe position", plans_fps::move_to_safe_position);
        registry
    }

    /// Registers (or replaces) the builder for `kind`.
    pub fn register(&mut self, kind: OperationKind, description: &'static str, build: BuildFn) {
        self.entries
            .insert(kind, OperationEntry { build, description });
    }

    /// Whether `kind` has a builder.
    pub fn has(&self, kind: OperationKind) -> bool {
        self.entries.contains_key(&kind)
    }

    /// Registered operations with their descriptions.
    pub fn list(&self) -> Vec<(OperationKind, &'static str)> {
        self.entries
            .iter()
            .map(|(kind, entry)| (*kind, entry.description))
            .collect()
    }

    /// Builds `kind` with `params`.
    pub fn build_kind(
        &self,
        kind: OperationKind,
        params: &OperationParams,
    ) -> SeqResult<SequencePlan> {
        let entry = self
            .entries
            .get(&kind)
            .ok_or_else(|| SequenceError::UnknownOperation(kind.name().to_string()))?;
        let draft = (entry.build)(params)?;
        SequencePlan::from_draft(kind, params, draft)
    }

    /// Builds the operation named `operation` with `params`.
    pub fn build(&self, operation: &str, params: &OperationParams) -> SeqResult<SequencePlan> {
        self.build_kind(operation.parse()?, params)
    }
}

/// Builds with the standard registry.
pub fn build(operation: &str, params: &OperationParams) -> SeqResult<SequencePlan> {
    OperationRegistry::standard().build(operation, params)
}
