//! Unit tangent computation and local parameter selection.

use nalgebra::DVector;

use crate::continuation::types::{ContinuationSettings, Counters};
use crate::error::ContinuationError;
use crate::jacobian::obtain_jacobian;
use crate::linear::BorderedSolver;
use crate::problem::CurveFunction;

/// Unit tangent to the solution curve, with the determinant sign of the
/// bordered Jacobian at the point where it was computed.
#[derive(Debug, Clone)]
pub struct TangentVector {
    pub v: DVector<f64>,
    pub det_sign: i8,
}

/// Solve the bordered system for the curve tangent at `x`.
///
/// The border row forces the held component's rate of change to one; the
/// result is renormalized to unit Euclidean length. Orientation follows the
/// previous tangent when one exists, otherwise the configured direction on
/// the held component.
pub(crate) fn compute_tangent<F: CurveFunction, S: BorderedSolver>(
    problem: &mut F,
    solver: &mut S,
    settings: &ContinuationSettings,
    counters: &mut Counters,
    x: &DVector<f64>,
    held: usize,
    previous: Option<&TangentVector>,
) -> Result<TangentVector, ContinuationError> {
    let n = x.len();
    let jacobian = obtain_jacobian(problem, &settings.finite_difference, x, counters)?;
    let mut rhs = DVector::zeros(n);
    rhs[n - 1] = 1.0;
    let solved = solver
        .solve_bordered(&jacobian, held, &rhs)
        .map_err(|_| ContinuationError::SingularJacobian)?;
    counters.factorizations += 1;
    counters.solves += 1;

    let norm = solved.solution.norm();
    if norm == 0.0 || !norm.is_finite() {
        return Err(ContinuationError::NullTangent);
    }
    let mut v = solved.solution / norm;
    let flip = match previous {
        Some(prev) => v.dot(&prev.v) < 0.0,
        None => v[held] * settings.direction < 0.0,
    };
    if flip {
        v = -v;
    }
    Ok(TangentVector {
        v,
        det_sign: solved.det_sign,
    })
}

/// Chosen local parameter with the runner-up kept as a fallback.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ParameterChoice {
    pub index: usize,
    pub fallback: usize,
}

/// Pick the coordinate whose tangent component is largest in magnitude.
///
/// A pinned parameter short-circuits selection, except that an out-of-range
/// pin is replaced by the last coordinate.
pub(crate) fn select_parameter(
    tangent: &TangentVector,
    pinned: Option<usize>,
    n: usize,
) -> ParameterChoice {
    if let Some(p) = pinned {
        let index = if p < n { p } else { n - 1 };
        return ParameterChoice {
            index,
            fallback: index,
        };
    }
    let mut best = 0;
    let mut second = 0;
    for i in 1..n {
        if tangent.v[i].abs() > tangent.v[best].abs() {
            second = best;
            best = i;
        } else if second == best || tangent.v[i].abs() > tangent.v[second].abs() {
            second = i;
        }
    }
    ParameterChoice {
        index: best,
        fallback: second,
    }
}

/// Parameter used before any tangent exists: the pin when valid, otherwise
/// the last coordinate.
pub(crate) fn default_parameter(pinned: Option<usize>, n: usize) -> usize {
    match pinned {
        Some(p) if p < n => p,
        _ => n - 1,
    }
}
