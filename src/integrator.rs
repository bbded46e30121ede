//! Explicit Runge-Kutta steppers for `ẏ = f(t, y)`.

use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{ForwardError, Result};

/// Why an integrator stopped.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IntegratorFailure {
    #[error("step size collapsed to {step:e} s at t = {time}")]
    StepSizeCollapse { time: f64, step: f64 },

    #[error("non-finite derivative at t = {time}")]
    NonFiniteDerivative { time: f64 },

    #[error("non-finite state at t = {time}")]
    NonFiniteState { time: f64 },

    #[error("{reason} (t = {time})")]
    Custom { time: f64, reason: String },

    #[error("stop requested at t = {time}")]
    Cancelled { time: f64 },
}

impl IntegratorFailure {
    /// Time at which the failure was detected.
    pub fn time(&self) -> f64 {
        match self {
            Self::StepSizeCollapse { time, .. }
            | Self::NonFiniteDerivative { time }
            | Self::NonFiniteState { time }
            | Self::Custom { time, .. }
            | Self::Cancelled { time } => *time,
        }
    }
}

pub type StepResult<T> = std::result::Result<T, IntegratorFailure>;

/// Right-hand side of a first-order system.
pub trait OdeSystem {
    fn dimension(&self) -> usize;

    fn derivatives(&self, t: f64, y: &DVector<f64>) -> StepResult<DVector<f64>>;
}

/// Advances a system state from `time` to `t_target`.
pub trait Integrator: Send {
    fn name(&self) -> &'static str;

    /// `time` and `y` move together: after every accepted internal step they
    /// hold that step's time and state, so on failure they describe the last
    /// accepted step. `stop` is polled after each accepted step short of
    /// `t_target`; returning `true` ends the call with
    /// [`IntegratorFailure::Cancelled`].
    fn advance(
        &mut self,
        system: &dyn OdeSystem,
        time: &mut f64,
        t_target: f64,
        y: &mut DVector<f64>,
        stop: &dyn Fn() -> bool,
    ) -> StepResult<()>;
}

/// A `stop` callback that never fires.
pub fn never_stop() -> bool {
    false
}

fn check_finite(t: f64, y: &DVector<f64>) -> StepResult<()> {
    if y.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(IntegratorFailure::NonFiniteState { time: t })
    }
}

/// Classical fixed-step fourth-order Runge-Kutta.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rk4 {
    pub step: f64,
}

impl Rk4 {
    pub fn new(step: f64) -> Self {
        Self { step }
    }

    fn single_step(
        system: &dyn OdeSystem,
        t: f64,
        h: f64,
        y: &DVector<f64>,
    ) -> StepResult<DVector<f64>> {
        let k1 = system.derivatives(t, y)?;
        let k2 = system.derivatives(t + 0.5 * h, &(y + &k1 * (0.5 * h)))?;
        let k3 = system.derivatives(t + 0.5 * h, &(y + &k2 * (0.5 * h)))?;
        let k4 = system.derivatives(t + h, &(y + &k3 * h))?;
        Ok(y + (k1 + k2 * 2.0 + k3 * 2.0 + k4) * (h / 6.0))
    }
}

impl Integrator for Rk4 {
    fn name(&self) -> &'static str {
        "rk4"
    }

    fn advance(
        &mut self,
        system: &dyn OdeSystem,
        time: &mut f64,
        t_target: f64,
        y: &mut DVector<f64>,
        stop: &dyn Fn() -> bool,
    ) -> StepResult<()> {
        debug_assert_eq!(y.len(), system.dimension());
        let span = t_target - *time;
        if span <= 0.0 {
            return Ok(());
        }
        let substeps = (span / self.step).ceil().max(1.0) as usize;
        let h = span / substeps as f64;
        for i in 0..substeps {
            let next = Self::single_step(system, *time, h, y)?;
            let next_time = if i + 1 == substeps { t_target } else { *time + h };
            check_finite(next_time, &next)?;
            *y = next;
            *time = next_time;
            if i + 1 < substeps && stop() {
                return Err(IntegratorFailure::Cancelled { time: *time });
            }
        }
        Ok(())
    }
}

/// Adaptive Runge-Kutta-Fehlberg 4(5) with local extrapolation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rkf45 {
    pub min_step: f64,
    pub max_step: f64,
    pub abs_tol: f64,
    pub rel_tol: f64,
    // Step size carried between calls.
    h: f64,
}

// Fehlberg tableau.
const C: [f64; 6] = [0.0, 0.25, 3.0 / 8.0, 12.0 / 13.0, 1.0, 0.5];
const A: [[f64; 5]; 6] = [
    [0.0, 0.0, 0.0, 0.0, 0.0],
    [0.25, 0.0, 0.0, 0.0, 0.0],
    [3.0 / 32.0, 9.0 / 32.0, 0.0, 0.0, 0.0],
    [1932.0 / 2197.0, -7200.0 / 2197.0, 7296.0 / 2197.0, 0.0, 0.0],
    [439.0 / 216.0, -8.0, 3680.0 / 513.0, -845.0 / 4104.0, 0.0],
    [-8.0 / 27.0, 2.0, -3544.0 / 2565.0, 1859.0 / 4104.0, -11.0 / 40.0],
];
const B5: [f64; 6] = [16.0 / 135.0, 0.0, 6656.0 / 12825.0, 28561.0 / 56430.0, -9.0 / 50.0, 2.0 / 55.0];
const B4: [f64; 6] = [25.0 / 216.0, 0.0, 1408.0 / 2565.0, 2197.0 / 4104.0, -0.2, 0.0];

const SAFETY: f64 = 0.9;
const MIN_FACTOR: f64 = 0.2;
const MAX_FACTOR: f64 = 5.0;

impl Rkf45 {
    pub fn new(min_step: f64, max_step: f64, abs_tol: f64, rel_tol: f64) -> Self {
        Self {
            min_step,
            max_step,
            abs_tol,
            rel_tol,
            h: max_step,
        }
    }

    /// One trial step; returns the fifth-order solution and the scaled
    /// error norm.
    fn trial(
        &self,
        system: &dyn OdeSystem,
        t: f64,
        h: f64,
        y: &DVector<f64>,
    ) -> StepResult<(DVector<f64>, f64)> {
        let mut k: Vec<DVector<f64>> = Vec::with_capacity(6);
        for stage in 0..6 {
            let mut yi = y.clone();
            for (j, kj) in k.iter().enumerate() {
                yi.axpy(h * A[stage][j], kj, 1.0);
            }
            k.push(system.derivatives(t + C[stage] * h, &yi)?);
        }

        let mut y5 = y.clone();
        let mut err = DVector::zeros(y.len());
        for (stage, ks) in k.iter().enumerate() {
            y5.axpy(h * B5[stage], ks, 1.0);
            err.axpy(h * (B5[stage] - B4[stage]), ks, 1.0);
        }

        let norm = err
            .iter()
            .zip(y.iter().zip(y5.iter()))
            .map(|(e, (a, b))| {
                let scale = self.abs_tol + self.rel_tol * a.abs().max(b.abs());
                (e / scale).powi(2)
            })
            .sum::<f64>();
        let norm = if y.is_empty() {
            0.0
        } else {
            (norm / y.len() as f64).sqrt()
        };
        Ok((y5, norm))
    }
}

impl Integrator for Rkf45 {
    fn name(&self) -> &'static str {
        "rkf45"
    }

    fn advance(
        &mut self,
        system: &dyn OdeSystem,
        time: &mut f64,
        t_target: f64,
        y: &mut DVector<f64>,
        stop: &dyn Fn() -> bool,
    ) -> StepResult<()> {
        debug_assert_eq!(y.len(), system.dimension());
        while *time < t_target {
            let remaining = t_target - *time;
            let h = self.h.min(self.max_step);
            let last = h >= remaining;
            let h = if last { remaining } else { h };

            let (candidate, err) = self.trial(system, *time, h, y)?;
            if !err.is_finite() {
                return Err(IntegratorFailure::NonFiniteState { time: *time });
            }

            let factor = if err == 0.0 {
                MAX_FACTOR
            } else {
                (SAFETY * err.powf(-0.2)).clamp(MIN_FACTOR, MAX_FACTOR)
            };

            if err <= 1.0 {
                let next_time = if last { t_target } else { *time + h };
                check_finite(next_time, &candidate)?;
                *y = candidate;
                *time = next_time;
                // A shortened final step says nothing about the next one.
                if !last {
                    self.h = (h * factor).min(self.max_step);
                    if stop() {
                        return Err(IntegratorFailure::Cancelled { time: *time });
                    }
                }
            } else {
                let shrunk = h * factor;
                if shrunk < self.min_step {
                    return Err(IntegratorFailure::StepSizeCollapse {
                        time: *time,
                        step: shrunk,
                    });
                }
                self.h = shrunk;
            }
        }
        Ok(())
    }
}

/// Integrator selection as it appears in a run file.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum IntegratorConfig {
    Rk4 {
        step: f64,
    },
    Rkf45 {
        min_step: f64,
        max_step: f64,
        #[serde(default = "default_tolerance")]
        abs_tol: f64,
        #[serde(default = "default_tolerance")]
        rel_tol: f64,
    },
}

fn default_tolerance() -> f64 {
    1.0e-6
}

impl Default for IntegratorConfig {
    fn default() -> Self {
        Self::Rkf45 {
            min_step: 1.0e-8,
            max_step: 1.0e-2,
            abs_tol: default_tolerance(),
            rel_tol: default_tolerance(),
        }
    }
}

impl IntegratorConfig {
    pub fn validate(&self) -> Result<()> {
        match *self {
            Self::Rk4 { step } => {
                if !(step.is_finite() && step > 0.0) {
                    return Err(ForwardError::configuration(format!(
                        "rk4 step must be positive, got {step}"
                    )));
                }
            }
            Self::Rkf45 {
                min_step,
                max_step,
                abs_tol,
                rel_tol,
            } => {
                if !(min_step > 0.0 && max_step.is_finite() && min_step <= max_step) {
                    return Err(ForwardError::configuration(format!(
                        "rkf45 needs 0 < min_step <= max_step, got {min_step} and {max_step}"
                    )));
                }
                if !(abs_tol > 0.0 && rel_tol >= 0.0 && abs_tol.is_finite() && rel_tol.is_finite()) {
                    return Err(ForwardError::configuration(format!(
                        "rkf45 tolerances must be positive, got abs {abs_tol} rel {rel_tol}"
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn build(&self) -> Result<Box<dyn Integrator>> {
        self.validate()?;
        Ok(match *self {
            Self::Rk4 { step } => Box::new(Rk4::new(step)),
            Self::Rkf45 {
                min_step,
                max_step,
                abs_tol,
                rel_tol,
            } => Box::new(Rkf45::new(min_step, max_step, abs_tol, rel_tol)),
        })
    }
}
