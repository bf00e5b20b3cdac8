//! Core types for the continuation engine.

use serde::{Deserialize, Serialize};

use crate::continuation::stepsize::StepControl;
use crate::error::{ContinuationError, ContinuationWarning};
use crate::jacobian::FiniteDifferenceOptions;

/// When the corrector re-evaluates the Jacobian during its iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JacobianRefresh {
    /// Re-evaluate before every Newton step.
    EveryStep,
    /// Evaluate at the first step and once more at the iteration cap.
    Bounds,
    /// Evaluate at the first step; re-evaluate only after a failed step.
    OnFailure,
}

/// Settings controlling the continuation run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContinuationSettings {
    /// Absolute part of the combined convergence tolerance.
    pub abs_tol: f64,
    /// Relative part of the combined convergence tolerance.
    pub rel_tol: f64,
    /// Predictor step used before any curvature information exists.
    pub start_step: f64,
    pub min_step: f64,
    pub max_step: f64,
    /// Cap on step growth and shrinkage per accepted point.
    pub growth_factor: f64,
    /// Initial tracing direction, +1 or -1, applied to the first tangent's
    /// held component.
    pub direction: f64,
    pub max_corrector_steps: usize,
    /// Iteration cap for the limit point root finder.
    pub max_limit_steps: usize,
    pub refresh: JacobianRefresh,
    /// Fix the local parameter instead of reselecting it each step. An
    /// out-of-range index falls back to the last coordinate.
    pub pinned_parameter: Option<usize>,
    pub finite_difference: FiniteDifferenceOptions,
}

impl Default for ContinuationSettings {
    fn default() -> Self {
        Self {
            abs_tol: 1e-8,
            rel_tol: 1e-8,
            start_step: 0.3,
            min_step: 1e-7,
            max_step: 1.0,
            growth_factor: 3.0,
            direction: 1.0,
            max_corrector_steps: 10,
            max_limit_steps: 30,
            refresh: JacobianRefresh::EveryStep,
            pinned_parameter: None,
            finite_difference: FiniteDifferenceOptions::default(),
        }
    }
}

impl ContinuationSettings {
    pub fn validate(&self) -> Result<(), ContinuationError> {
        if !(self.abs_tol >= 0.0 && self.rel_tol >= 0.0 && self.abs_tol + self.rel_tol > 0.0) {
            return Err(ContinuationError::InvalidInput(
                "tolerances must be non-negative and not both zero".into(),
            ));
        }
        if !(self.min_step > 0.0 && self.min_step <= self.max_step) {
            return Err(ContinuationError::InvalidInput(
                "step bounds must satisfy 0 < min_step <= max_step".into(),
            ));
        }
        if !(self.growth_factor > 1.0) {
            return Err(ContinuationError::InvalidInput(
                "growth_factor must exceed 1".into(),
            ));
        }
        if self.direction.abs() != 1.0 {
            return Err(ContinuationError::InvalidInput(
                "direction must be +1 or -1".into(),
            ));
        }
        if self.max_corrector_steps == 0 || self.max_limit_steps == 0 {
            return Err(ContinuationError::InvalidInput(
                "iteration caps must be at least 1".into(),
            ));
        }
        if !(self.finite_difference.perturbation > 0.0) {
            return Err(ContinuationError::InvalidInput(
                "finite-difference perturbation must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// A request to intercept the curve where coordinate `index` equals `value`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetRequest {
    pub index: usize,
    pub value: f64,
}

/// Event interception requests, set once by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EventRequest {
    pub target: Option<TargetRequest>,
    /// Coordinate watched for local extrema along the curve.
    pub limit_index: Option<usize>,
}

/// What a returned point represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PointKind {
    CorrectedStart,
    Continuation,
    Target,
    Limit,
}

/// One point produced by a call to [`crate::Continuation::step`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurvePoint {
    pub x: Vec<f64>,
    pub kind: PointKind,
    /// Pseudo-arclength coordinate. Target and limit points carry an
    /// estimate strictly between their bracketing continuation points.
    pub arclength: f64,
    pub warnings: Vec<ContinuationWarning>,
}

/// Progress of the continuation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepState {
    /// No corrected starting point exists yet.
    Unchecked,
    /// The starting point has been Newton-corrected.
    StartCorrected,
    /// Two accepted points exist; the held tangent belongs to the older one.
    TwoPointsOldTangent,
    /// Two accepted points exist; the held tangent belongs to the newer one.
    TwoPointsNewTangent,
}

/// Monotone work counters for the lifetime of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub calls: u64,
    pub function_evals: u64,
    pub jacobian_evals: u64,
    pub factorizations: u64,
    pub solves: u64,
    pub corrector_steps: u64,
    pub step_reductions: u64,
}

/// Serializable tangent record for snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedTangent {
    pub v: Vec<f64>,
    pub det_sign: i8,
}

/// Complete run state, sufficient to resume a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub state: StepState,
    pub x: Vec<f64>,
    pub prev_x: Option<Vec<f64>>,
    pub tangent: Option<SavedTangent>,
    pub prev_tangent: Option<SavedTangent>,
    pub parameter: usize,
    pub fallback: usize,
    pub arclength: f64,
    pub prev_arclength: f64,
    pub step: StepControl,
    pub last_iterations: usize,
    pub last_quality: f64,
    pub last_target_found: Option<(usize, f64)>,
    pub counters: Counters,
}
