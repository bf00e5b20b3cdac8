//! Predictor-corrector continuation for underdetermined nonlinear systems.
//!
//! Given `F: R^n -> R^(n-1)` and one solution, [`Continuation`] traces the
//! implicitly defined solution curve point by point: predict along the unit
//! tangent, then Newton-correct back onto the curve while holding the locally
//! dominant coordinate fixed. Step length adapts to corrector cost and curve
//! curvature, and the engine can intercept target points (a coordinate
//! reaching a requested value) and limit points (a coordinate reaching a
//! local extremum) between ordinary steps.
//!
//! ```
//! use nalgebra::{DMatrix, DVector};
//! use strand_core::{
//!     Continuation, ContinuationSettings, CurveFunction, DenseSolver, EventRequest,
//!     JacobianMatrix,
//! };
//!
//! struct Circle;
//!
//! impl CurveFunction for Circle {
//!     fn dimension(&self) -> usize {
//!         2
//!     }
//!
//!     fn eval(&mut self, x: &DVector<f64>, out: &mut DVector<f64>) -> anyhow::Result<()> {
//!         out[0] = x[0] * x[0] + x[1] * x[1] - 2.0;
//!         Ok(())
//!     }
//!
//!     fn jacobian(&mut self, x: &DVector<f64>) -> anyhow::Result<Option<JacobianMatrix>> {
//!         Ok(Some(JacobianMatrix::Dense(DMatrix::from_row_slice(
//!             1,
//!             2,
//!             &[2.0 * x[0], 2.0 * x[1]],
//!         ))))
//!     }
//! }
//!
//! let mut run = Continuation::new(
//!     Circle,
//!     DenseSolver,
//!     ContinuationSettings::default(),
//!     EventRequest::default(),
//!     &[1.0, 1.0],
//! )?;
//! for _ in 0..10 {
//!     let point = run.step()?;
//!     assert!((point.x[0] * point.x[0] + point.x[1] * point.x[1] - 2.0).abs() < 1e-6);
//! }
//! # Ok::<(), strand_core::ContinuationError>(())
//! ```

pub mod continuation;
pub mod error;
pub mod jacobian;
pub mod linear;
pub mod problem;

pub use continuation::{
    Continuation, ContinuationSettings, Counters, CurvePoint, EventRequest, JacobianRefresh,
    PointKind, RunSnapshot, StepControl, StepState, TangentVector, TargetRequest,
};
pub use error::{ContinuationError, ContinuationWarning};
pub use jacobian::{
    check_jacobian, default_perturbation, DifferenceScheme, FiniteDifferenceOptions, JacobianCheck,
};
pub use linear::{BandedSolver, BorderedSolution, BorderedSolver, DenseSolver, SolveError};
pub use problem::{BandedJacobian, CurveFunction, JacobianMatrix};
