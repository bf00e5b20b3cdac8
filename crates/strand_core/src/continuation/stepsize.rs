//! Adaptive step-size control for the predictor.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::continuation::types::ContinuationSettings;
use crate::error::ContinuationError;

/// Corrector iteration count the controller steers toward.
const TARGET_ITERATIONS: f64 = 4.0;

/// Predictor step-length state.
///
/// The planned step grows when the corrector converged quickly over a nearly
/// straight stretch of curve and shrinks when iterations ran long or the
/// tangent turned sharply. Failed corrections halve the step directly.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepControl {
    pub min_step: f64,
    pub max_step: f64,
    /// Step length the next predictor will use.
    pub current_step: f64,
    /// Per-point growth/shrink cap, greater than one.
    pub growth_factor: f64,
    /// Distance between the last two accepted points.
    pub secant_distance: f64,
    pub previous_secant_distance: f64,
}

impl StepControl {
    pub(crate) fn from_settings(settings: &ContinuationSettings) -> Self {
        let mut control = Self {
            min_step: settings.min_step,
            max_step: settings.max_step,
            current_step: settings.start_step,
            growth_factor: settings.growth_factor,
            secant_distance: 0.0,
            previous_secant_distance: 0.0,
        };
        control.clamp_current();
        control
    }

    fn clamp_current(&mut self) {
        self.current_step = self.current_step.clamp(self.min_step, self.max_step);
    }

    /// Halve the step after a failed correction.
    pub(crate) fn halve(&mut self) -> Result<(), ContinuationError> {
        let halved = self.current_step / 2.0;
        if halved < self.min_step {
            return Err(ContinuationError::StepTooSmall {
                step: halved,
                min: self.min_step,
            });
        }
        self.current_step = halved;
        Ok(())
    }

    /// Plan the next predictor step from the last accepted point's cost.
    ///
    /// `angle` is the angle in radians between the two most recent tangents,
    /// `iterations` the corrector count of the last accepted point, and
    /// `quality` its contraction ratio in `[0, 1]` — near one means the
    /// corrector barely converged and the step should not grow on the back
    /// of a low iteration count alone. Does nothing until a secant distance
    /// has been recorded.
    pub(crate) fn plan(&mut self, angle: f64, iterations: usize, quality: f64) {
        if self.secant_distance <= 0.0 {
            return;
        }
        let iters = iterations.max(1) as f64;
        let contraction = 1.0 - 0.5 * quality.clamp(0.0, 1.0);
        let factor = (TARGET_ITERATIONS / iters * contraction / (1.0 + angle))
            .clamp(1.0 / self.growth_factor, self.growth_factor);
        self.current_step = self.secant_distance * factor;
        self.clamp_current();
        debug!(
            step = self.current_step,
            factor, angle, iterations, quality, "planned predictor step"
        );
    }

    pub(crate) fn record_secant(&mut self, distance: f64) {
        self.previous_secant_distance = self.secant_distance;
        self.secant_distance = distance;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn settings() -> ContinuationSettings {
        ContinuationSettings {
            start_step: 0.3,
            min_step: 0.01,
            max_step: 1.0,
            growth_factor: 3.0,
            ..ContinuationSettings::default()
        }
    }

    #[test]
    fn start_step_is_clamped_into_bounds() {
        let mut cfg = settings();
        cfg.start_step = 5.0;
        let control = StepControl::from_settings(&cfg);
        assert_relative_eq!(control.current_step, 1.0);
        cfg.start_step = 1e-9;
        let control = StepControl::from_settings(&cfg);
        assert_relative_eq!(control.current_step, 0.01);
    }

    #[test]
    fn fast_convergence_on_straight_curve_grows_the_step() {
        let mut control = StepControl::from_settings(&settings());
        control.record_secant(0.3);
        control.plan(0.0, 1, 0.0);
        // factor 4/1 capped at the growth factor 3
        assert_relative_eq!(control.current_step, 0.9, epsilon = 1e-12);
    }

    #[test]
    fn slow_convergence_and_sharp_turns_shrink_the_step() {
        let mut control = StepControl::from_settings(&settings());
        control.record_secant(0.3);
        control.plan(1.0, 8, 0.0);
        // factor (4/8) * 1/2 = 1/4, floored at 1/3
        assert_relative_eq!(control.current_step, 0.1, epsilon = 1e-12);
    }

    #[test]
    fn marginal_convergence_tempers_step_growth() {
        let mut control = StepControl::from_settings(&settings());
        control.record_secant(0.3);
        // target-count iterations but a contraction ratio of one: the last
        // two Newton steps were the same size, so halve instead of holding
        control.plan(0.0, 4, 1.0);
        assert_relative_eq!(control.current_step, 0.15, epsilon = 1e-12);
    }

    #[test]
    fn planning_without_a_secant_keeps_the_start_step() {
        let mut control = StepControl::from_settings(&settings());
        control.plan(0.0, 1, 0.0);
        assert_relative_eq!(control.current_step, 0.3);
    }

    #[test]
    fn halving_fails_below_the_floor() {
        let mut control = StepControl::from_settings(&settings());
        control.current_step = 0.03;
        control.halve().expect("one halving stays above the floor");
        assert_relative_eq!(control.current_step, 0.015);
        let err = control.halve().expect_err("second halving crosses the floor");
        assert!(matches!(err, ContinuationError::StepTooSmall { .. }));
        // the step is left untouched on failure
        assert_relative_eq!(control.current_step, 0.015);
    }
}
