//! Target and limit point refinement between two accepted curve points.

use nalgebra::DVector;
use tracing::{debug, warn};

use crate::continuation::corrector::correct;
use crate::continuation::tangent::{compute_tangent, TangentVector};
use crate::continuation::types::{ContinuationSettings, Counters, TargetRequest};
use crate::error::{ContinuationError, ContinuationWarning};
use crate::linear::BorderedSolver;
use crate::problem::CurveFunction;

/// Result of an event search. Search breakdowns are warnings, not errors;
/// tracing continues past them.
pub(crate) enum EventOutcome {
    Found { x: DVector<f64>, arclength: f64 },
    Failed(ContinuationWarning),
}

fn interpolant(prev: &DVector<f64>, curr: &DVector<f64>, s: f64) -> DVector<f64> {
    prev + (curr - prev) * s
}

/// Keep target and limit arclength estimates strictly inside the bracketing
/// interval so ordering by arclength stays unambiguous.
fn interior_arclength(prev: f64, curr: f64, s: f64) -> f64 {
    prev + (curr - prev) * s.clamp(0.01, 0.99)
}

/// Whether a user-function failure must abort the run rather than degrade to
/// a search warning.
fn is_fatal(error: &ContinuationError) -> bool {
    matches!(error, ContinuationError::UserFunction(_))
}

/// Refine a target point on the interval `[prev_x, curr_x]`.
///
/// The seed interpolates linearly to where the watched coordinate crosses the
/// requested value, then that coordinate is clamped to the exact value and
/// held fixed during correction.
#[allow(clippy::too_many_arguments)]
pub(crate) fn refine_target<F: CurveFunction, S: BorderedSolver>(
    problem: &mut F,
    solver: &mut S,
    settings: &ContinuationSettings,
    counters: &mut Counters,
    prev_x: &DVector<f64>,
    curr_x: &DVector<f64>,
    prev_arclength: f64,
    curr_arclength: f64,
    request: TargetRequest,
) -> Result<EventOutcome, ContinuationError> {
    let span = curr_x[request.index] - prev_x[request.index];
    let s = if span == 0.0 {
        0.5
    } else {
        ((request.value - prev_x[request.index]) / span).clamp(0.0, 1.0)
    };
    let mut seed = interpolant(prev_x, curr_x, s);
    seed[request.index] = request.value;

    match correct(
        problem,
        solver,
        settings,
        counters,
        seed,
        request.index,
        false,
    ) {
        Ok(out) => {
            debug!(
                index = request.index,
                value = request.value,
                iterations = out.iterations,
                "target point refined"
            );
            Ok(EventOutcome::Found {
                x: out.x,
                arclength: interior_arclength(prev_arclength, curr_arclength, s),
            })
        }
        Err(e) if is_fatal(&e) => Err(e),
        Err(e) => {
            warn!(index = request.index, value = request.value, error = %e, "target search failed");
            Ok(EventOutcome::Failed(ContinuationWarning::TargetSearchFailed))
        }
    }
}

/// Refine a limit point bracketed by a tangent-component sign change.
///
/// Runs a safeguarded secant search on the interpolation fraction: each
/// candidate is corrected onto the curve and the watched tangent component
/// evaluated there; candidates that leave the bracket or crowd its ends are
/// replaced by bisection.
#[allow(clippy::too_many_arguments)]
pub(crate) fn refine_limit<F: CurveFunction, S: BorderedSolver>(
    problem: &mut F,
    solver: &mut S,
    settings: &ContinuationSettings,
    counters: &mut Counters,
    prev_x: &DVector<f64>,
    curr_x: &DVector<f64>,
    prev_tangent: &TangentVector,
    held: usize,
    limit_index: usize,
    prev_arclength: f64,
    curr_arclength: f64,
) -> Result<EventOutcome, ContinuationError> {
    let tol = settings.abs_tol + settings.rel_tol;
    let mut evaluate = |s: f64,
                        counters: &mut Counters|
     -> Result<(DVector<f64>, f64), ContinuationError> {
        let seed = interpolant(prev_x, curr_x, s);
        let out = correct(problem, solver, settings, counters, seed, held, false)?;
        let t = compute_tangent(
            problem,
            solver,
            settings,
            counters,
            &out.x,
            held,
            Some(prev_tangent),
        )?;
        Ok((out.x, t.v[limit_index]))
    };

    let mut a = 0.0;
    let mut b = 1.0;
    let mut ga = prev_tangent.v[limit_index];
    let mut gb = {
        // re-derive the right-end value at the corrected endpoint so both
        // bracket values come from the same map
        match evaluate(b, counters) {
            Ok((_, g)) => g,
            Err(e) if is_fatal(&e) => return Err(e),
            Err(e) => {
                warn!(limit_index, error = %e, "limit search failed at bracket end");
                return Ok(EventOutcome::Failed(ContinuationWarning::LimitSearchFailed));
            }
        }
    };
    if ga.signum() == gb.signum() {
        warn!(limit_index, ga, gb, "limit bracket lost after correction");
        return Ok(EventOutcome::Failed(ContinuationWarning::LimitSearchFailed));
    }

    let mut best: Option<(DVector<f64>, f64, f64)> = None;
    for iteration in 0..settings.max_limit_steps {
        // secant estimate, safeguarded to the interior of the bracket
        let width = b - a;
        let mut s = a - ga * width / (gb - ga);
        let margin = 0.01 * width;
        if !s.is_finite() || s <= a + margin || s >= b - margin {
            s = 0.5 * (a + b);
        }

        let (x, g) = match evaluate(s, counters) {
            Ok(v) => v,
            Err(e) if is_fatal(&e) => return Err(e),
            Err(e) => {
                warn!(limit_index, s, error = %e, "limit search failed");
                return Ok(EventOutcome::Failed(ContinuationWarning::LimitSearchFailed));
            }
        };
        if best.as_ref().map_or(true, |(_, gb, _)| g.abs() < gb.abs()) {
            best = Some((x.clone(), g, s));
        }
        debug!(iteration, s, g, "limit search step");

        if g.abs() <= tol || width < 1e-12 {
            let (x, _, s) = best.take().unwrap_or((x, g, s));
            return Ok(EventOutcome::Found {
                x,
                arclength: interior_arclength(prev_arclength, curr_arclength, s),
            });
        }

        if g.signum() == ga.signum() {
            a = s;
            ga = g;
        } else {
            b = s;
            gb = g;
        }
    }

    warn!(limit_index, "limit search hit its iteration cap");
    Ok(EventOutcome::Failed(
        ContinuationWarning::LimitSearchStepLimit,
    ))
}
