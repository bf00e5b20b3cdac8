//! The continuation driver.
//!
//! [`Continuation`] owns the problem, a bordered solver, and the run state.
//! Each call to [`Continuation::step`] advances the run by one event: the
//! corrected start point, an ordinary continuation point, or an intercepted
//! target or limit point.

use nalgebra::DVector;
use tracing::debug;

use crate::continuation::corrector::correct;
use crate::continuation::events::{refine_limit, refine_target, EventOutcome};
use crate::continuation::stepsize::StepControl;
use crate::continuation::tangent::{
    compute_tangent, default_parameter, select_parameter, TangentVector,
};
use crate::continuation::types::{
    ContinuationSettings, Counters, CurvePoint, EventRequest, PointKind, RunSnapshot, SavedTangent,
    StepState, TargetRequest,
};
use crate::error::{ContinuationError, ContinuationWarning};
use crate::jacobian::{self, JacobianCheck};
use crate::linear::BorderedSolver;
use crate::problem::CurveFunction;

/// Predictor-corrector tracer for the solution curve of an underdetermined
/// system of `n - 1` equations in `n` unknowns.
pub struct Continuation<F: CurveFunction, S: BorderedSolver> {
    problem: F,
    solver: S,
    settings: ContinuationSettings,
    events: EventRequest,
    state: StepState,
    x: DVector<f64>,
    prev_x: Option<DVector<f64>>,
    /// Tangent at the point it was last computed: the older accepted point in
    /// `TwoPointsOldTangent`, the newer one in `TwoPointsNewTangent`.
    tangent: Option<TangentVector>,
    prev_tangent: Option<TangentVector>,
    parameter: usize,
    fallback: usize,
    step: StepControl,
    arclength: f64,
    prev_arclength: f64,
    last_iterations: usize,
    /// Contraction ratio of the last accepted correction, tempering growth.
    last_quality: f64,
    /// Guard against re-returning a target the caller has not changed.
    last_target_found: Option<(usize, f64)>,
    counters: Counters,
}

impl<F: CurveFunction, S: BorderedSolver> Continuation<F, S> {
    pub fn new(
        problem: F,
        solver: S,
        settings: ContinuationSettings,
        events: EventRequest,
        start: &[f64],
    ) -> Result<Self, ContinuationError> {
        let n = problem.dimension();
        if n < 2 {
            return Err(ContinuationError::InvalidInput(
                "the problem needs at least two unknowns".into(),
            ));
        }
        if start.len() != n {
            return Err(ContinuationError::InvalidInput(format!(
                "starting point has {} components, the problem has {} unknowns",
                start.len(),
                n
            )));
        }
        settings.validate()?;
        Self::validate_events(&events, n)?;
        let parameter = default_parameter(settings.pinned_parameter, n);
        Ok(Self {
            problem,
            solver,
            step: StepControl::from_settings(&settings),
            settings,
            events,
            state: StepState::Unchecked,
            x: DVector::from_column_slice(start),
            prev_x: None,
            tangent: None,
            prev_tangent: None,
            parameter,
            fallback: parameter,
            arclength: 0.0,
            prev_arclength: 0.0,
            last_iterations: 1,
            last_quality: 0.0,
            last_target_found: None,
            counters: Counters::default(),
        })
    }

    fn validate_events(events: &EventRequest, n: usize) -> Result<(), ContinuationError> {
        if let Some(t) = events.target {
            if t.index >= n {
                return Err(ContinuationError::InvalidInput(format!(
                    "target coordinate {} is out of range for {} unknowns",
                    t.index, n
                )));
            }
        }
        if let Some(i) = events.limit_index {
            if i >= n {
                return Err(ContinuationError::InvalidInput(format!(
                    "limit coordinate {i} is out of range for {n} unknowns"
                )));
            }
        }
        Ok(())
    }

    /// Advance the run by one point.
    ///
    /// Fatal errors leave the run at its last accepted point; the same call
    /// can be retried after adjusting settings or events.
    pub fn step(&mut self) -> Result<CurvePoint, ContinuationError> {
        self.counters.calls += 1;
        match self.state {
            StepState::Unchecked => self.correct_start(),
            StepState::StartCorrected => self.first_step(),
            StepState::TwoPointsOldTangent => self.resume_interval(),
            StepState::TwoPointsNewTangent => self.take_step(Vec::new()),
        }
    }

    fn correct_start(&mut self) -> Result<CurvePoint, ContinuationError> {
        let held = default_parameter(self.settings.pinned_parameter, self.x.len());
        let out = correct(
            &mut self.problem,
            &mut self.solver,
            &self.settings,
            &mut self.counters,
            self.x.clone(),
            held,
            true,
        )?;
        self.x = out.x;
        self.state = StepState::StartCorrected;
        self.arclength = 0.0;
        debug!(iterations = out.iterations, "starting point corrected");
        Ok(self.emit(PointKind::CorrectedStart, 0.0, Vec::new()))
    }

    fn first_step(&mut self) -> Result<CurvePoint, ContinuationError> {
        let held = self.parameter;
        let t = compute_tangent(
            &mut self.problem,
            &mut self.solver,
            &self.settings,
            &mut self.counters,
            &self.x.clone(),
            held,
            None,
        )?;
        let choice = select_parameter(&t, self.settings.pinned_parameter, self.x.len());
        self.parameter = choice.index;
        self.fallback = choice.fallback;
        self.tangent = Some(t);
        self.take_step(Vec::new())
    }

    /// Handle the interval between the two newest accepted points: return a
    /// bracketed target if one is pending, refresh the tangent, return a
    /// bracketed limit point, or fall through to an ordinary step.
    fn resume_interval(&mut self) -> Result<CurvePoint, ContinuationError> {
        let mut warnings = Vec::new();

        if let Some(req) = self.events.target {
            if self.last_target_found != Some((req.index, req.value)) {
                if let Some(found) = self.try_target(req, &mut warnings)? {
                    return Ok(found);
                }
            }
        }

        let prev_t = self.tangent.clone().ok_or_else(|| {
            ContinuationError::Unclassified("tangent missing at interval resume".into())
        })?;
        let held = self.parameter;
        let curr_x = self.x.clone();
        let new_t = compute_tangent(
            &mut self.problem,
            &mut self.solver,
            &self.settings,
            &mut self.counters,
            &curr_x,
            held,
            Some(&prev_t),
        )?;
        if new_t.det_sign != 0 && prev_t.det_sign != 0 && new_t.det_sign != prev_t.det_sign {
            debug!("bordered determinant changed sign over the last interval");
        }
        let choice = select_parameter(&new_t, self.settings.pinned_parameter, curr_x.len());
        self.parameter = choice.index;
        self.fallback = choice.fallback;
        self.prev_tangent = Some(prev_t.clone());
        self.tangent = Some(new_t.clone());
        self.state = StepState::TwoPointsNewTangent;

        if let Some(li) = self.events.limit_index {
            if prev_t.v[li] * new_t.v[li] < 0.0 {
                let prev_x = self.prev_x.clone().ok_or_else(|| {
                    ContinuationError::Unclassified("previous point missing at limit check".into())
                })?;
                match refine_limit(
                    &mut self.problem,
                    &mut self.solver,
                    &self.settings,
                    &mut self.counters,
                    &prev_x,
                    &curr_x,
                    &prev_t,
                    held,
                    li,
                    self.prev_arclength,
                    self.arclength,
                )? {
                    EventOutcome::Found { x, arclength } => {
                        return Ok(CurvePoint {
                            x: x.as_slice().to_vec(),
                            kind: PointKind::Limit,
                            arclength,
                            warnings,
                        });
                    }
                    EventOutcome::Failed(w) => warnings.push(w),
                }
            }
        }

        self.take_step(warnings)
    }

    fn try_target(
        &mut self,
        req: TargetRequest,
        warnings: &mut Vec<ContinuationWarning>,
    ) -> Result<Option<CurvePoint>, ContinuationError> {
        let Some(prev_x) = self.prev_x.clone() else {
            return Ok(None);
        };
        let lo = prev_x[req.index].min(self.x[req.index]);
        let hi = prev_x[req.index].max(self.x[req.index]);
        if req.value < lo || req.value > hi {
            return Ok(None);
        }
        let curr_x = self.x.clone();
        match refine_target(
            &mut self.problem,
            &mut self.solver,
            &self.settings,
            &mut self.counters,
            &prev_x,
            &curr_x,
            self.prev_arclength,
            self.arclength,
            req,
        )? {
            EventOutcome::Found { x, arclength } => {
                self.last_target_found = Some((req.index, req.value));
                Ok(Some(CurvePoint {
                    x: x.as_slice().to_vec(),
                    kind: PointKind::Target,
                    arclength,
                    warnings: std::mem::take(warnings),
                }))
            }
            EventOutcome::Failed(w) => {
                warnings.push(w);
                Ok(None)
            }
        }
    }

    /// Predict along the tangent and correct back onto the curve, halving the
    /// step on corrector failure after one retry with the fallback parameter.
    fn take_step(
        &mut self,
        warnings: Vec<ContinuationWarning>,
    ) -> Result<CurvePoint, ContinuationError> {
        let tangent = self.tangent.clone().ok_or_else(|| {
            ContinuationError::Unclassified("tangent missing before predictor step".into())
        })?;
        let angle = match &self.prev_tangent {
            Some(prev) => tangent.v.dot(&prev.v).clamp(-1.0, 1.0).acos(),
            None => 0.0,
        };
        self.step.plan(angle, self.last_iterations, self.last_quality);

        let mut held = self.parameter;
        let mut fallback_tried = false;
        loop {
            let predicted = &self.x + &tangent.v * self.step.current_step;
            match correct(
                &mut self.problem,
                &mut self.solver,
                &self.settings,
                &mut self.counters,
                predicted,
                held,
                false,
            ) {
                Ok(out) => {
                    self.parameter = held;
                    let secant = (&out.x - &self.x).norm();
                    self.prev_x = Some(std::mem::replace(&mut self.x, out.x));
                    self.prev_arclength = self.arclength;
                    self.arclength += secant;
                    self.step.record_secant(secant);
                    self.last_iterations = out.iterations.max(1);
                    self.last_quality = out.quality;
                    self.state = StepState::TwoPointsOldTangent;
                    debug!(
                        arclength = self.arclength,
                        secant,
                        iterations = out.iterations,
                        residual = out.residual_norm,
                        quality = out.quality,
                        parameter = held,
                        "accepted continuation point"
                    );
                    return Ok(self.emit(PointKind::Continuation, self.arclength, warnings));
                }
                Err(
                    e @ (ContinuationError::CorrectorDiverged { .. }
                    | ContinuationError::TooManyCorrectorSteps(_)),
                ) => {
                    if !fallback_tried && self.fallback != held {
                        fallback_tried = true;
                        held = self.fallback;
                        debug!(error = %e, parameter = held, "retrying with the fallback parameter");
                        continue;
                    }
                    self.counters.step_reductions += 1;
                    self.step.halve()?;
                    held = self.parameter;
                    fallback_tried = false;
                    debug!(step = self.step.current_step, "halved predictor step");
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn emit(
        &self,
        kind: PointKind,
        arclength: f64,
        warnings: Vec<ContinuationWarning>,
    ) -> CurvePoint {
        CurvePoint {
            x: self.x.as_slice().to_vec(),
            kind,
            arclength,
            warnings,
        }
    }

    /// Replace the pending target request. Clearing and re-requesting the
    /// same target re-arms it.
    pub fn request_target(
        &mut self,
        target: Option<TargetRequest>,
    ) -> Result<(), ContinuationError> {
        let events = EventRequest {
            target,
            ..self.events
        };
        Self::validate_events(&events, self.x.len())?;
        self.events = events;
        self.last_target_found = None;
        Ok(())
    }

    /// Replace the watched limit coordinate.
    pub fn request_limit(&mut self, limit_index: Option<usize>) -> Result<(), ContinuationError> {
        let events = EventRequest {
            limit_index,
            ..self.events
        };
        Self::validate_events(&events, self.x.len())?;
        self.events = events;
        Ok(())
    }

    /// Compare the supplied Jacobian against a finite-difference one at the
    /// current point. Diagnostic only; the run state is untouched.
    pub fn check_jacobian(&mut self) -> Result<Option<JacobianCheck>, ContinuationError> {
        jacobian::check_jacobian(&mut self.problem, &self.settings.finite_difference, &self.x)
    }

    pub fn x(&self) -> &DVector<f64> {
        &self.x
    }

    pub fn arclength(&self) -> f64 {
        self.arclength
    }

    pub fn state(&self) -> StepState {
        self.state
    }

    pub fn parameter_index(&self) -> usize {
        self.parameter
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn step_control(&self) -> &StepControl {
        &self.step
    }

    pub fn tangent(&self) -> Option<&TangentVector> {
        self.tangent.as_ref()
    }

    pub fn settings(&self) -> &ContinuationSettings {
        &self.settings
    }

    pub fn problem(&self) -> &F {
        &self.problem
    }

    /// Capture the complete run state for later [`Continuation::resume`].
    pub fn snapshot(&self) -> RunSnapshot {
        fn saved(t: &TangentVector) -> SavedTangent {
            SavedTangent {
                v: t.v.as_slice().to_vec(),
                det_sign: t.det_sign,
            }
        }
        RunSnapshot {
            state: self.state,
            x: self.x.as_slice().to_vec(),
            prev_x: self.prev_x.as_ref().map(|v| v.as_slice().to_vec()),
            tangent: self.tangent.as_ref().map(saved),
            prev_tangent: self.prev_tangent.as_ref().map(saved),
            parameter: self.parameter,
            fallback: self.fallback,
            arclength: self.arclength,
            prev_arclength: self.prev_arclength,
            step: self.step,
            last_iterations: self.last_iterations,
            last_quality: self.last_quality,
            last_target_found: self.last_target_found,
            counters: self.counters,
        }
    }

    /// Rebuild a run from a snapshot, typically in a fresh process.
    pub fn resume(
        problem: F,
        solver: S,
        settings: ContinuationSettings,
        events: EventRequest,
        snapshot: RunSnapshot,
    ) -> Result<Self, ContinuationError> {
        let n = problem.dimension();
        if snapshot.x.len() != n {
            return Err(ContinuationError::InvalidInput(format!(
                "snapshot has {} components, the problem has {} unknowns",
                snapshot.x.len(),
                n
            )));
        }
        settings.validate()?;
        Self::validate_events(&events, n)?;
        fn restored(t: SavedTangent) -> TangentVector {
            TangentVector {
                v: DVector::from_vec(t.v),
                det_sign: t.det_sign,
            }
        }
        Ok(Self {
            problem,
            solver,
            settings,
            events,
            state: snapshot.state,
            x: DVector::from_vec(snapshot.x),
            prev_x: snapshot.prev_x.map(DVector::from_vec),
            tangent: snapshot.tangent.map(restored),
            prev_tangent: snapshot.prev_tangent.map(restored),
            parameter: snapshot.parameter,
            fallback: snapshot.fallback,
            step: snapshot.step,
            arclength: snapshot.arclength,
            prev_arclength: snapshot.prev_arclength,
            last_iterations: snapshot.last_iterations,
            last_quality: snapshot.last_quality,
            last_target_found: snapshot.last_target_found,
            counters: snapshot.counters,
        })
    }
}
