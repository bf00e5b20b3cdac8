//! Finite-difference Jacobian synthesis and the analytic-vs-difference check.

use anyhow::anyhow;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::continuation::types::Counters;
use crate::error::ContinuationError;
use crate::problem::{CurveFunction, JacobianMatrix};

/// Default relative perturbation for difference quotients.
///
/// The fourth root of machine epsilon is a serviceable compromise between
/// truncation and rounding error for both schemes; override it through
/// [`FiniteDifferenceOptions`] when the problem scaling warrants.
pub fn default_perturbation() -> f64 {
    f64::EPSILON.powf(0.25)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DifferenceScheme {
    Forward,
    Central,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FiniteDifferenceOptions {
    pub scheme: DifferenceScheme,
    /// Relative perturbation scale applied as `perturbation * (1 + |x_j|)`.
    pub perturbation: f64,
}

impl Default for FiniteDifferenceOptions {
    fn default() -> Self {
        Self {
            scheme: DifferenceScheme::Forward,
            perturbation: default_perturbation(),
        }
    }
}

/// Report produced by [`check_jacobian`].
#[derive(Debug, Clone)]
pub struct JacobianCheck {
    /// Largest absolute discrepancy between the two matrices.
    pub max_discrepancy: f64,
    /// Location of the largest discrepancy.
    pub row: usize,
    pub col: usize,
    /// Full discrepancy matrix (supplied minus approximated).
    pub difference: DMatrix<f64>,
}

pub(crate) fn eval_residual<F: CurveFunction>(
    problem: &mut F,
    x: &DVector<f64>,
    out: &mut DVector<f64>,
    counters: &mut Counters,
) -> Result<(), ContinuationError> {
    problem
        .eval(x, out)
        .map_err(ContinuationError::UserFunction)?;
    counters.function_evals += 1;
    if out.iter().any(|v| !v.is_finite()) {
        return Err(ContinuationError::UserFunction(anyhow!(
            "residual contains a non-finite value"
        )));
    }
    Ok(())
}

/// Build a dense (N - 1) x N difference approximation of the Jacobian.
pub fn approximate_jacobian<F: CurveFunction>(
    problem: &mut F,
    options: &FiniteDifferenceOptions,
    x: &DVector<f64>,
    counters: &mut Counters,
) -> Result<DMatrix<f64>, ContinuationError> {
    let n = x.len();
    let mut jacobian = DMatrix::zeros(n - 1, n);
    let mut plus = DVector::zeros(n - 1);
    match options.scheme {
        DifferenceScheme::Forward => {
            let mut base = DVector::zeros(n - 1);
            eval_residual(problem, x, &mut base, counters)?;
            for j in 0..n {
                let h = options.perturbation * (1.0 + x[j].abs());
                let mut perturbed = x.clone();
                perturbed[j] += h;
                eval_residual(problem, &perturbed, &mut plus, counters)?;
                for i in 0..n - 1 {
                    jacobian[(i, j)] = (plus[i] - base[i]) / h;
                }
            }
        }
        DifferenceScheme::Central => {
            let mut minus = DVector::zeros(n - 1);
            for j in 0..n {
                let h = options.perturbation * (1.0 + x[j].abs());
                let mut perturbed = x.clone();
                perturbed[j] += h;
                eval_residual(problem, &perturbed, &mut plus, counters)?;
                perturbed[j] -= 2.0 * h;
                eval_residual(problem, &perturbed, &mut minus, counters)?;
                for i in 0..n - 1 {
                    jacobian[(i, j)] = (plus[i] - minus[i]) / (2.0 * h);
                }
            }
        }
    }
    Ok(jacobian)
}

/// Fetch the provider's Jacobian or synthesize one by finite differences.
pub(crate) fn obtain_jacobian<F: CurveFunction>(
    problem: &mut F,
    options: &FiniteDifferenceOptions,
    x: &DVector<f64>,
    counters: &mut Counters,
) -> Result<JacobianMatrix, ContinuationError> {
    let n = problem.dimension();
    counters.jacobian_evals += 1;
    if let Some(jacobian) = problem
        .jacobian(x)
        .map_err(ContinuationError::UserFunction)?
    {
        jacobian.validate(n)?;
        Ok(jacobian)
    } else {
        let approximated = approximate_jacobian(problem, options, x, counters)?;
        Ok(JacobianMatrix::Dense(approximated))
    }
}

/// Compare a supplied Jacobian against its finite-difference approximation.
///
/// Returns `Ok(None)` when the provider has no analytic Jacobian to check.
/// Purely diagnostic: no run bookkeeping is touched.
pub fn check_jacobian<F: CurveFunction>(
    problem: &mut F,
    options: &FiniteDifferenceOptions,
    x: &DVector<f64>,
) -> Result<Option<JacobianCheck>, ContinuationError> {
    let n = problem.dimension();
    let Some(supplied) = problem
        .jacobian(x)
        .map_err(ContinuationError::UserFunction)?
    else {
        return Ok(None);
    };
    supplied.validate(n)?;
    let mut scratch = Counters::default();
    let approximated = approximate_jacobian(problem, options, x, &mut scratch)?;
    let difference = supplied.to_dense() - approximated;
    let mut max_discrepancy = 0.0;
    let mut row = 0;
    let mut col = 0;
    for j in 0..difference.ncols() {
        for i in 0..difference.nrows() {
            if difference[(i, j)].abs() > max_discrepancy {
                max_discrepancy = difference[(i, j)].abs();
                row = i;
                col = j;
            }
        }
    }
    Ok(Some(JacobianCheck {
        max_discrepancy,
        row,
        col,
        difference,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    struct Quadratic;

    impl CurveFunction for Quadratic {
        fn dimension(&self) -> usize {
            3
        }

        fn eval(&mut self, x: &DVector<f64>, out: &mut DVector<f64>) -> anyhow::Result<()> {
            out[0] = x[0] * x[0] + x[1] - 1.0;
            out[1] = x[1] * x[2] - 2.0;
            Ok(())
        }
    }

    struct QuadraticWithBadJacobian;

    impl CurveFunction for QuadraticWithBadJacobian {
        fn dimension(&self) -> usize {
            3
        }

        fn eval(&mut self, x: &DVector<f64>, out: &mut DVector<f64>) -> anyhow::Result<()> {
            out[0] = x[0] * x[0] + x[1] - 1.0;
            out[1] = x[1] * x[2] - 2.0;
            Ok(())
        }

        fn jacobian(&mut self, x: &DVector<f64>) -> anyhow::Result<Option<JacobianMatrix>> {
            let mut jac = DMatrix::zeros(2, 3);
            jac[(0, 0)] = 2.0 * x[0];
            jac[(0, 1)] = 1.0;
            jac[(1, 1)] = x[2];
            jac[(1, 2)] = x[1] + 0.5; // deliberately off by 0.5
            Ok(Some(JacobianMatrix::Dense(jac)))
        }
    }

    #[test]
    fn central_differences_recover_analytic_jacobian() {
        let mut problem = Quadratic;
        let mut counters = Counters::default();
        let options = FiniteDifferenceOptions {
            scheme: DifferenceScheme::Central,
            perturbation: default_perturbation(),
        };
        let x = DVector::from_vec(vec![0.7, -1.3, 2.1]);
        let jac = approximate_jacobian(&mut problem, &options, &x, &mut counters)
            .expect("approximation should succeed");
        assert_relative_eq!(jac[(0, 0)], 1.4, max_relative = 1e-6);
        assert_relative_eq!(jac[(0, 1)], 1.0, max_relative = 1e-6);
        assert_relative_eq!(jac[(1, 1)], 2.1, max_relative = 1e-6);
        assert_relative_eq!(jac[(1, 2)], -1.3, max_relative = 1e-6);
        assert!(jac[(1, 0)].abs() < 1e-6);
        assert_eq!(counters.function_evals, 6);
    }

    #[test]
    fn forward_differences_are_coarser_but_close() {
        let mut problem = Quadratic;
        let mut counters = Counters::default();
        let options = FiniteDifferenceOptions::default();
        let x = DVector::from_vec(vec![0.7, -1.3, 2.1]);
        let jac = approximate_jacobian(&mut problem, &options, &x, &mut counters)
            .expect("approximation should succeed");
        assert_relative_eq!(jac[(0, 0)], 1.4, max_relative = 1e-3);
        assert_relative_eq!(jac[(1, 1)], 2.1, max_relative = 1e-3);
    }

    #[test]
    fn obtain_jacobian_falls_back_to_differences() {
        let mut problem = Quadratic;
        let mut counters = Counters::default();
        let options = FiniteDifferenceOptions::default();
        let x = DVector::from_vec(vec![1.0, 0.0, 2.0]);
        let jac = obtain_jacobian(&mut problem, &options, &x, &mut counters)
            .expect("fallback should succeed");
        assert!(matches!(jac, JacobianMatrix::Dense(_)));
        assert_eq!(counters.jacobian_evals, 1);
        assert!(counters.function_evals > 0);
    }

    #[test]
    fn check_jacobian_locates_the_bad_entry() {
        let mut problem = QuadraticWithBadJacobian;
        let options = FiniteDifferenceOptions {
            scheme: DifferenceScheme::Central,
            perturbation: default_perturbation(),
        };
        let x = DVector::from_vec(vec![0.7, -1.3, 2.1]);
        let report = check_jacobian(&mut problem, &options, &x)
            .expect("check should run")
            .expect("analytic Jacobian is supplied");
        assert_eq!((report.row, report.col), (1, 2));
        assert_relative_eq!(report.max_discrepancy, 0.5, max_relative = 1e-4);
    }

    #[test]
    fn check_jacobian_reports_nothing_without_analytic_jacobian() {
        let mut problem = Quadratic;
        let options = FiniteDifferenceOptions::default();
        let x = DVector::from_vec(vec![1.0, 1.0, 1.0]);
        let report = check_jacobian(&mut problem, &options, &x).expect("check should run");
        assert!(report.is_none());
    }
}
