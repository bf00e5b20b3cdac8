//! Newton correction of predicted points back onto the curve.

use nalgebra::DVector;
use tracing::trace;

use crate::continuation::types::{ContinuationSettings, Counters, JacobianRefresh};
use crate::error::ContinuationError;
use crate::jacobian::{eval_residual, obtain_jacobian};
use crate::linear::BorderedSolver;
use crate::problem::{CurveFunction, JacobianMatrix};

#[derive(Debug)]
pub(crate) struct CorrectorOutcome {
    pub x: DVector<f64>,
    pub iterations: usize,
    pub residual_norm: f64,
    /// Contraction ratio of the final two step norms; near zero means fast
    /// convergence, near one means the iteration barely converged.
    pub quality: f64,
}

fn tolerance(settings: &ContinuationSettings, x: &DVector<f64>) -> f64 {
    settings.abs_tol + settings.rel_tol * x.norm()
}

fn newton_step<S: BorderedSolver>(
    solver: &mut S,
    jacobian: &JacobianMatrix,
    held: usize,
    residual: &DVector<f64>,
    counters: &mut Counters,
) -> Result<DVector<f64>, ContinuationError> {
    let n = residual.len() + 1;
    let mut rhs = DVector::zeros(n);
    for i in 0..n - 1 {
        rhs[i] = -residual[i];
    }
    // border entry stays zero: the held coordinate is not moved
    let solved = solver
        .solve_bordered(jacobian, held, &rhs)
        .map_err(|_| ContinuationError::SingularJacobian)?;
    counters.factorizations += 1;
    counters.solves += 1;
    counters.corrector_steps += 1;
    Ok(solved.solution)
}

/// Correct `x` onto the curve while holding coordinate `held` fixed.
///
/// Convergence requires the residual norm and, except in startup mode, the
/// Newton step norm to pass the combined absolute/relative tolerance.
/// Startup mode exists for the very first call, where no prior point is
/// available to give the step norm meaning.
pub(crate) fn correct<F: CurveFunction, S: BorderedSolver>(
    problem: &mut F,
    solver: &mut S,
    settings: &ContinuationSettings,
    counters: &mut Counters,
    mut x: DVector<f64>,
    held: usize,
    startup: bool,
) -> Result<CorrectorOutcome, ContinuationError> {
    let n = x.len();
    let mut residual = DVector::zeros(n - 1);
    eval_residual(problem, &x, &mut residual, counters)?;
    let mut rnorm = residual.norm();
    if rnorm <= tolerance(settings, &x) {
        return Ok(CorrectorOutcome {
            x,
            iterations: 0,
            residual_norm: rnorm,
            quality: 0.0,
        });
    }

    let mut jacobian = obtain_jacobian(problem, &settings.finite_difference, &x, counters)?;
    let mut prev_step_norm = f64::INFINITY;
    let cap = settings.max_corrector_steps;

    for iteration in 1..=cap {
        let stale_refresh = match settings.refresh {
            JacobianRefresh::EveryStep => iteration > 1,
            JacobianRefresh::Bounds => iteration > 1 && iteration == cap,
            JacobianRefresh::OnFailure => false,
        };
        if stale_refresh {
            jacobian = obtain_jacobian(problem, &settings.finite_difference, &x, counters)?;
        }

        let step = newton_step(solver, &jacobian, held, &residual, counters)?;
        let step_norm = step.norm();
        let candidate = &x + &step;
        eval_residual(problem, &candidate, &mut residual, counters)?;
        let new_rnorm = residual.norm();
        let tol = tolerance(settings, &candidate);
        trace!(iteration, residual = new_rnorm, step = step_norm, "corrector step");

        if new_rnorm <= tol && (startup || step_norm <= tol) {
            let quality = if prev_step_norm.is_finite() && prev_step_norm > 0.0 {
                (step_norm / prev_step_norm).min(1.0)
            } else {
                0.0
            };
            return Ok(CorrectorOutcome {
                x: candidate,
                iterations: iteration,
                residual_norm: new_rnorm,
                quality,
            });
        }

        if new_rnorm >= rnorm {
            if settings.refresh == JacobianRefresh::OnFailure {
                // one fresh-Jacobian retry from the pre-step iterate
                jacobian = obtain_jacobian(problem, &settings.finite_difference, &x, counters)?;
                eval_residual(problem, &x, &mut residual, counters)?;
                let retry_step = newton_step(solver, &jacobian, held, &residual, counters)?;
                let retried = &x + &retry_step;
                eval_residual(problem, &retried, &mut residual, counters)?;
                let retry_rnorm = residual.norm();
                let retry_tol = tolerance(settings, &retried);
                if retry_rnorm <= retry_tol && (startup || retry_step.norm() <= retry_tol) {
                    return Ok(CorrectorOutcome {
                        x: retried,
                        iterations: iteration,
                        residual_norm: retry_rnorm,
                        quality: 0.0,
                    });
                }
                if retry_rnorm < rnorm {
                    prev_step_norm = retry_step.norm();
                    x = retried;
                    rnorm = retry_rnorm;
                    continue;
                }
                return Err(ContinuationError::CorrectorDiverged {
                    previous: rnorm,
                    current: retry_rnorm,
                });
            }
            return Err(ContinuationError::CorrectorDiverged {
                previous: rnorm,
                current: new_rnorm,
            });
        }

        prev_step_norm = step_norm;
        x = candidate;
        rnorm = new_rnorm;
    }

    Err(ContinuationError::TooManyCorrectorSteps(cap))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linear::DenseSolver;
    use approx::assert_relative_eq;
    use nalgebra::DMatrix;

    struct Circle;

    impl CurveFunction for Circle {
        fn dimension(&self) -> usize {
            2
        }

        fn eval(&mut self, x: &DVector<f64>, out: &mut DVector<f64>) -> anyhow::Result<()> {
            out[0] = x[0] * x[0] + x[1] * x[1] - 2.0;
            Ok(())
        }

        fn jacobian(
            &mut self,
            x: &DVector<f64>,
        ) -> anyhow::Result<Option<crate::problem::JacobianMatrix>> {
            Ok(Some(crate::problem::JacobianMatrix::Dense(
                DMatrix::from_row_slice(1, 2, &[2.0 * x[0], 2.0 * x[1]]),
            )))
        }
    }

    /// One equation whose Newton iteration famously diverges far from the
    /// root: arctan with an offset.
    struct Arctan;

    impl CurveFunction for Arctan {
        fn dimension(&self) -> usize {
            2
        }

        fn eval(&mut self, x: &DVector<f64>, out: &mut DVector<f64>) -> anyhow::Result<()> {
            out[0] = (x[0] - 5.0).atan();
            Ok(())
        }

        fn jacobian(
            &mut self,
            x: &DVector<f64>,
        ) -> anyhow::Result<Option<crate::problem::JacobianMatrix>> {
            let d = x[0] - 5.0;
            Ok(Some(crate::problem::JacobianMatrix::Dense(
                DMatrix::from_row_slice(1, 2, &[1.0 / (1.0 + d * d), 0.0]),
            )))
        }
    }

    #[test]
    fn corrects_a_predicted_point_back_onto_the_circle() {
        let mut problem = Circle;
        let mut solver = DenseSolver;
        let settings = ContinuationSettings::default();
        let mut counters = Counters::default();
        // hold x1 = 0.8 and solve for x0 near 1.2
        let seed = DVector::from_vec(vec![1.3, 0.8]);
        let out = correct(
            &mut problem,
            &mut solver,
            &settings,
            &mut counters,
            seed,
            1,
            false,
        )
        .expect("corrector should converge");
        assert_relative_eq!(out.x[1], 0.8, epsilon = 1e-14);
        assert_relative_eq!(out.x[0] * out.x[0] + out.x[1] * out.x[1], 2.0, epsilon = 1e-8);
        assert!(out.iterations >= 1);
        assert!(out.residual_norm <= 1e-8 + 1e-8 * out.x.norm());
    }

    #[test]
    fn already_converged_point_returns_immediately() {
        let mut problem = Circle;
        let mut solver = DenseSolver;
        let settings = ContinuationSettings::default();
        let mut counters = Counters::default();
        let seed = DVector::from_vec(vec![1.0, 1.0]);
        let out = correct(
            &mut problem,
            &mut solver,
            &settings,
            &mut counters,
            seed,
            1,
            true,
        )
        .expect("point is already on the curve");
        assert_eq!(out.iterations, 0);
        assert_eq!(counters.jacobian_evals, 0);
    }

    #[test]
    fn divergence_is_detected() {
        let mut problem = Arctan;
        let mut solver = DenseSolver;
        let settings = ContinuationSettings::default();
        let mut counters = Counters::default();
        // |x0 - 5| > ~1.39 puts plain Newton on arctan in its divergent regime
        let seed = DVector::from_vec(vec![8.0, 0.0]);
        let err = correct(
            &mut problem,
            &mut solver,
            &settings,
            &mut counters,
            seed,
            1,
            true,
        )
        .expect_err("Newton should diverge from this seed");
        assert!(matches!(err, ContinuationError::CorrectorDiverged { .. }));
    }

    #[test]
    fn iteration_cap_is_enforced() {
        let mut problem = Circle;
        let mut solver = DenseSolver;
        let settings = ContinuationSettings {
            max_corrector_steps: 1,
            ..ContinuationSettings::default()
        };
        let mut counters = Counters::default();
        let seed = DVector::from_vec(vec![3.5, 0.5]);
        let err = correct(
            &mut problem,
            &mut solver,
            &settings,
            &mut counters,
            seed,
            1,
            false,
        )
        .expect_err("one iteration cannot converge from this far out");
        assert!(matches!(err, ContinuationError::TooManyCorrectorSteps(1)));
    }

    #[test]
    fn lazy_refresh_policies_still_converge() {
        for refresh in [JacobianRefresh::Bounds, JacobianRefresh::OnFailure] {
            let mut problem = Circle;
            let mut solver = DenseSolver;
            let settings = ContinuationSettings {
                refresh,
                max_corrector_steps: 25,
                ..ContinuationSettings::default()
            };
            let mut counters = Counters::default();
            let seed = DVector::from_vec(vec![1.25, 0.8]);
            let out = correct(
                &mut problem,
                &mut solver,
                &settings,
                &mut counters,
                seed,
                1,
                false,
            )
            .unwrap_or_else(|e| panic!("policy {refresh:?} failed: {e}"));
            assert_relative_eq!(
                out.x[0] * out.x[0] + out.x[1] * out.x[1],
                2.0,
                epsilon = 1e-7
            );
        }
    }
}
