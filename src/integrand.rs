use std::sync::Arc;

use nalgebra::DVector;

use crate::contributor::{ForceContributor, ProbeSample};
use crate::integrator::{IntegratorFailure, OdeSystem, StepResult};
use crate::model::{AppliedLoads, Model, SimulationState};
use crate::storage::TimeSeries;

/// First-order form `y = [q; u]` of a model driven by controls and a list
/// of force contributors.
///
/// Contributors are summed in registration order, so a run is
/// reproducible bit for bit.
pub struct ModelIntegrand {
    model: Arc<dyn Model>,
    controls: Option<TimeSeries>,
    contributors: Vec<Box<dyn ForceContributor>>,
}

impl ModelIntegrand {
    pub fn new(model: Arc<dyn Model>, controls: Option<TimeSeries>) -> Self {
        Self {
            model,
            controls,
            contributors: Vec::new(),
        }
    }

    pub fn register(&mut self, contributor: Box<dyn ForceContributor>) {
        self.contributors.push(contributor);
    }

    pub fn model(&self) -> &dyn Model {
        self.model.as_ref()
    }

    pub fn contributor_labels(&self) -> impl Iterator<Item = &str> {
        self.contributors.iter().map(|c| c.label())
    }

    pub fn num_contributors(&self) -> usize {
        self.contributors.len()
    }

    /// Control values at `t`; zeros when no control source was given.
    pub fn controls_at(&self, t: f64) -> Vec<f64> {
        match &self.controls {
            Some(series) => series.sample_at(t).as_slice().to_vec(),
            None => vec![0.0; self.model.num_controls()],
        }
    }

    /// Diagnostic samples of every contributor at `state`, in registration
    /// order.
    pub fn probe(&self, state: &SimulationState) -> Vec<(&str, Option<ProbeSample>)> {
        self.contributors
            .iter()
            .map(|c| (c.label(), c.probe(state.time, self.model(), state)))
            .collect()
    }

    /// Sum of all contributor loads at `state`.
    pub fn applied_loads(&self, state: &SimulationState) -> AppliedLoads {
        let mut loads = AppliedLoads::new(self.model.num_bodies());
        for contributor in &self.contributors {
            contributor.contribute(state.time, self.model(), state, &mut loads);
        }
        loads
    }
}

impl OdeSystem for ModelIntegrand {
    fn dimension(&self) -> usize {
        self.model.num_coordinates() + self.model.num_speeds()
    }

    fn derivatives(&self, t: f64, y: &DVector<f64>) -> StepResult<DVector<f64>> {
        let nq = self.model.num_coordinates();
        let state = SimulationState::from_stacked(t, y, nq);
        let controls = self.controls_at(t);
        let loads = self.applied_loads(&state);

        let qdot = self.model.coordinate_rates(&state.q, &state.u);
        let udot = self
            .model
            .accelerations(t, &state.q, &state.u, &controls, &loads);

        let mut ydot = DVector::zeros(y.len());
        ydot.rows_mut(0, nq).copy_from(&qdot);
        ydot.rows_mut(nq, udot.len()).copy_from(&udot);
        if ydot.iter().any(|v| !v.is_finite()) {
            return Err(IntegratorFailure::NonFiniteDerivative { time: t });
        }
        Ok(ydot)
    }
}
