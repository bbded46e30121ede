//! Error types for forward runs.

use thiserror::Error;

use crate::integrator::IntegratorFailure;
use crate::model::SimulationState;

/// Errors raised while configuring or running a forward simulation.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// Invalid or inconsistent input detected before any integration step.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The integrator could not continue.
    #[error("integration failed at t = {time}: {reason}")]
    Integration {
        /// Time at which the integrator reported the failure.
        time: f64,
        /// Time of the last state that was accepted and recorded.
        last_good_time: f64,
        /// Last accepted state.
        last_state: Box<SimulationState>,
        /// Failure reported by the integrator.
        #[source]
        reason: IntegratorFailure,
    },

    /// The run was stopped through its abort handle.
    #[error("run cancelled at t = {time}")]
    Cancelled {
        /// Time of the last accepted state.
        time: f64,
        /// Last accepted state.
        last_state: Box<SimulationState>,
    },

    /// A driver operation was called in the wrong phase.
    #[error("driver is {actual}, expected {expected}")]
    InvalidPhase {
        /// Phase the operation requires.
        expected: &'static str,
        /// Phase the driver is in.
        actual: &'static str,
    },

    /// Writing results failed.
    #[error("output error: {0}")]
    Output(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ForwardError {
    /// Creates a configuration error.
    #[must_use]
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration(reason.into())
    }

    /// Creates an output error.
    #[must_use]
    pub fn output(reason: impl Into<String>) -> Self {
        Self::Output(reason.into())
    }

    /// True for errors raised before integration started.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    /// True when the run stopped on request rather than because it broke.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Result type for forward runs.
pub type Result<T> = std::result::Result<T, ForwardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_error_message() {
        let err = ForwardError::configuration("foot-flat precedes heel-strike");
        assert!(err.to_string().contains("configuration error"));
        assert!(err.is_configuration());
        assert!(!err.is_cancelled());
    }

    #[test]
    fn integration_error_reports_failure_time() {
        let err = ForwardError::Integration {
            time: 0.37,
            last_good_time: 0.36,
            last_state: Box::new(SimulationState::zeros(0.36, 1, 1)),
            reason: IntegratorFailure::StepSizeCollapse {
                time: 0.37,
                step: 1.0e-12,
            },
        };
        let msg = err.to_string();
        assert!(msg.contains("0.37"));
        assert!(msg.contains("step size"));
    }
}
