use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fatal conditions that terminate a continuation run.
///
/// The engine performs no recovery of its own beyond predictor step halving;
/// every variant here aborts the current call and leaves the run state at the
/// last accepted point.
#[derive(Debug, Error)]
pub enum ContinuationError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("user function evaluation failed")]
    UserFunction(#[source] anyhow::Error),
    #[error("augmented Jacobian is numerically singular")]
    SingularJacobian,
    #[error("tangent vector has zero magnitude")]
    NullTangent,
    #[error("Newton corrector diverged: residual grew from {previous:.6e} to {current:.6e}")]
    CorrectorDiverged { previous: f64, current: f64 },
    #[error("Newton corrector exceeded {0} iterations without converging")]
    TooManyCorrectorSteps(usize),
    #[error("predictor step {step:.6e} fell below the minimum step {min:.6e}")]
    StepTooSmall { step: f64, min: f64 },
    #[error("unclassified continuation failure: {0}")]
    Unclassified(String),
}

/// Non-fatal conditions reported alongside a successful call.
///
/// The run remains valid and continuable after any of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContinuationWarning {
    /// A bracketed target crossing was detected but the search did not converge.
    TargetSearchFailed,
    /// The limit point root finder failed to converge.
    LimitSearchFailed,
    /// The limit point root finder hit its iteration cap.
    LimitSearchStepLimit,
}

impl std::fmt::Display for ContinuationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TargetSearchFailed => write!(f, "target point search failed"),
            Self::LimitSearchFailed => write!(f, "limit point search failed"),
            Self::LimitSearchStepLimit => write!(f, "limit point search hit its step limit"),
        }
    }
}
