//! The continuation engine: state machine, Newton corrector, tangent and
//! local-parameter machinery, step-size control, and target/limit point
//! detection.

pub mod engine;
pub mod stepsize;
pub mod tangent;
pub mod types;

pub(crate) mod corrector;
pub(crate) mod events;

pub use engine::Continuation;
pub use stepsize::StepControl;
pub use tangent::TangentVector;
pub use types::{
    ContinuationSettings, Counters, CurvePoint, EventRequest, JacobianRefresh, PointKind,
    RunSnapshot, StepState, TargetRequest,
};
