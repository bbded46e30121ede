use nalgebra::Vector3;

use crate::model::{AppliedLoads, Model, SimulationState};

/// One recorded evaluation of a contributor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeSample {
    /// Blend weight in `[0, 1]`.
    pub weight: f64,
    /// Force or torque before weighting.
    pub raw: Vector3<f64>,
    /// Force or torque actually applied.
    pub applied: Vector3<f64>,
}

impl ProbeSample {
    pub fn as_row(&self) -> [f64; 7] {
        [
            self.weight,
            self.raw.x,
            self.raw.y,
            self.raw.z,
            self.applied.x,
            self.applied.y,
            self.applied.z,
        ]
    }

    pub const COLUMNS: [&'static str; 7] = [
        "weight", "raw_x", "raw_y", "raw_z", "applied_x", "applied_y", "applied_z",
    ];
}

/// Additive source of body loads, queried at every derivative evaluation.
///
/// Implementations are pure functions of `(t, state)`: they never mutate
/// themselves during a run, so repeated evaluation at the same point gives the
/// same loads.
pub trait ForceContributor: Send + Sync {
    fn label(&self) -> &str;

    /// Adds this contributor's loads at `(t, state)` to `loads`.
    fn contribute(
        &self,
        t: f64,
        model: &dyn Model,
        state: &SimulationState,
        loads: &mut AppliedLoads,
    );

    /// Diagnostic sample for detailed results. Contributors that have
    /// nothing to report return `None`.
    fn probe(&self, _t: f64, _model: &dyn Model, _state: &SimulationState) -> Option<ProbeSample> {
        None
    }
}
