//! Windowed corrective springs that pull a body toward recorded kinematics.
//!
//! A linear spring acts on the translation of the body's contact point; a
//! torsional spring acts on the body's orientation. Both compute a raw
//! restoring load from the tracking error and scale it by the blend weight of
//! their contact window, so the load fades in and out smoothly.

use nalgebra::{DVector, Quaternion, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::contributor::{ForceContributor, ProbeSample};
use crate::error::{ForwardError, Result};
use crate::model::{AppliedLoads, BodyId, Model, SimulationState};
use crate::ramp::smoothstep;
use crate::schedule::{ContactWindow, SpringKind};
use crate::storage::TimeSeries;

/// Extra weighting of a linear spring by the recorded load on its body.
///
/// The gate is 0 below `start_force`, 1 above `end_force` and smooth between.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoadTransition {
    /// Load magnitude at which the spring starts to engage [N]
    pub start_force: f64,
    /// Load magnitude at which the spring is fully engaged [N]
    pub end_force: f64,
}

impl LoadTransition {
    pub fn weight(&self, magnitude: f64) -> f64 {
        smoothstep((magnitude - self.start_force) / (self.end_force - self.start_force))
    }

    fn validate(&self) -> Result<()> {
        if !(self.start_force.is_finite() && self.end_force.is_finite()) {
            return Err(ForwardError::configuration(
                "load transition forces must be finite",
            ));
        }
        if self.end_force <= self.start_force {
            return Err(ForwardError::configuration(format!(
                "load transition end force {} must exceed start force {}",
                self.end_force, self.start_force
            )));
        }
        Ok(())
    }
}

/// Immutable description of one corrective spring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectiveSpringSpec {
    pub id: String,
    pub kind: SpringKind,
    /// Name of the body the spring acts on.
    pub body: String,
    /// Per-axis stiffness [N/m or N m/rad]
    pub stiffness: Vector3<f64>,
    /// Per-axis damping [N s/m or N m s/rad]
    pub damping: Vector3<f64>,
    pub window: ContactWindow,
    #[serde(default)]
    pub transition: Option<LoadTransition>,
}

// Columns of the precomputed reference trajectory.
const POS: usize = 0;
const VEL: usize = 3;
const QUAT: usize = 6;
const OMEGA: usize = 10;
const TRAJECTORY_WIDTH: usize = 13;

/// A corrective spring bound to a model and a reference trajectory.
#[derive(Debug, Clone)]
pub struct CorrectiveSpring {
    spec: CorrectiveSpringSpec,
    body: BodyId,
    contact_point: Vector3<f64>,
    // Contact-point position and velocity, orientation (w, i, j, k) and
    // angular velocity of the body along the reference motion.
    trajectory: TimeSeries,
    // Recorded external-load magnitude on the body, present with a transition.
    load_magnitude: Option<TimeSeries>,
}

impl CorrectiveSpring {
    /// Binds `spec` to `model`.
    ///
    /// `reference` holds one `[q, u]` row per sample. `load_magnitude` must be
    /// given when the spring has a load transition.
    pub fn new(
        spec: CorrectiveSpringSpec,
        model: &dyn Model,
        reference: &TimeSeries,
        load_magnitude: Option<TimeSeries>,
    ) -> Result<Self> {
        if spec.id.trim().is_empty() {
            return Err(ForwardError::configuration("corrective spring id is empty"));
        }
        if reference.is_empty() {
            return Err(ForwardError::configuration(format!(
                "spring '{}' has an empty reference trajectory",
                spec.id
            )));
        }
        let (nq, nu) = (model.num_coordinates(), model.num_speeds());
        if reference.width() != nq + nu {
            return Err(ForwardError::configuration(format!(
                "spring '{}' reference has {} columns, model needs {} coordinates and {} speeds",
                spec.id,
                reference.width(),
                nq,
                nu
            )));
        }
        let body = model.body_id(&spec.body).ok_or_else(|| {
            ForwardError::configuration(format!(
                "spring '{}' targets unknown body '{}'",
                spec.id, spec.body
            ))
        })?;
        let gains = spec.stiffness.iter().chain(spec.damping.iter());
        if gains.copied().any(|g| !(g.is_finite() && g >= 0.0)) {
            return Err(ForwardError::configuration(format!(
                "spring '{}' needs finite, non-negative stiffness and damping",
                spec.id
            )));
        }

        let load_magnitude = match (&spec.transition, load_magnitude) {
            (None, _) => None,
            (Some(_), None) => {
                return Err(ForwardError::configuration(format!(
                    "spring '{}' has a load transition but no external load on body '{}'",
                    spec.id, spec.body
                )))
            }
            (Some(transition), Some(series)) => {
                if spec.kind != SpringKind::Linear {
                    return Err(ForwardError::configuration(format!(
                        "spring '{}': load transitions apply to linear springs only",
                        spec.id
                    )));
                }
                transition.validate()?;
                Some(series)
            }
        };

        let contact_point = model.contact_point(body);
        let trajectory = body_trajectory(model, body, &contact_point, reference)?;

        Ok(Self {
            spec,
            body,
            contact_point,
            trajectory,
            load_magnitude,
        })
    }

    pub fn spec(&self) -> &CorrectiveSpringSpec {
        &self.spec
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    /// Blend weight at `t`, including the load gate.
    pub fn active_weight(&self, t: f64) -> f64 {
        let w = self.spec.window.active_weight(t);
        if w == 0.0 {
            return 0.0;
        }
        match (&self.spec.transition, &self.load_magnitude) {
            (Some(transition), Some(series)) => w * transition.weight(series.sample_at(t)[0]),
            _ => w,
        }
    }

    /// Raw and weighted load at `(t, state)`.
    ///
    /// The applied load is exactly zero whenever the weight is zero.
    pub fn force_at(&self, t: f64, model: &dyn Model, state: &SimulationState) -> ProbeSample {
        let weight = self.active_weight(t);
        let raw = self.raw_load(t, model, state);
        let applied = if weight == 0.0 {
            Vector3::zeros()
        } else {
            raw * weight
        };
        ProbeSample {
            weight,
            raw,
            applied,
        }
    }

    fn raw_load(&self, t: f64, model: &dyn Model, state: &SimulationState) -> Vector3<f64> {
        let reference = self.trajectory.sample_at(t);
        let body = model.body_state(self.body, &state.q, &state.u);

        let (error, rate_error) = match self.spec.kind {
            SpringKind::Linear => {
                let p = body.point_position(&self.contact_point);
                let v = body.point_velocity(&self.contact_point);
                (p - slice3(&reference, POS), v - slice3(&reference, VEL))
            }
            SpringKind::Torsional => {
                let q_ref = UnitQuaternion::from_quaternion(Quaternion::new(
                    reference[QUAT],
                    reference[QUAT + 1],
                    reference[QUAT + 2],
                    reference[QUAT + 3],
                ));
                let delta = body.orientation * q_ref.inverse();
                (
                    delta.scaled_axis(),
                    body.angular_velocity - slice3(&reference, OMEGA),
                )
            }
        };

        -self.spec.stiffness.component_mul(&error) - self.spec.damping.component_mul(&rate_error)
    }
}

impl ForceContributor for CorrectiveSpring {
    fn label(&self) -> &str {
        &self.spec.id
    }

    fn contribute(
        &self,
        t: f64,
        model: &dyn Model,
        state: &SimulationState,
        loads: &mut AppliedLoads,
    ) {
        let weight = self.active_weight(t);
        if weight == 0.0 {
            return;
        }
        let load = self.raw_load(t, model, state) * weight;
        match self.spec.kind {
            SpringKind::Linear => {
                let body = model.body_state(self.body, &state.q, &state.u);
                let point = body.point_position(&self.contact_point);
                loads.apply_force_at_point(self.body, &body, &point, &load);
            }
            SpringKind::Torsional => loads.apply_torque(self.body, &load),
        }
    }

    fn probe(&self, t: f64, model: &dyn Model, state: &SimulationState) -> Option<ProbeSample> {
        Some(self.force_at(t, model, state))
    }
}

fn slice3(v: &DVector<f64>, start: usize) -> Vector3<f64> {
    Vector3::new(v[start], v[start + 1], v[start + 2])
}

/// Evaluates the body's reference kinematics at every reference sample.
///
/// Quaternions are kept on one hemisphere so that component-wise
/// interpolation followed by normalization stays on the short arc.
fn body_trajectory(
    model: &dyn Model,
    body: BodyId,
    contact_point: &Vector3<f64>,
    reference: &TimeSeries,
) -> Result<TimeSeries> {
    let labels = [
        "px", "py", "pz", "vx", "vy", "vz", "qw", "qx", "qy", "qz", "wx", "wy", "wz",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    let mut trajectory = TimeSeries::new(labels);

    let nq = model.num_coordinates();
    let mut previous: Option<UnitQuaternion<f64>> = None;
    let mut row = [0.0; TRAJECTORY_WIDTH];
    for (t, values) in reference.rows() {
        let q = DVector::from_column_slice(&values[..nq]);
        let u = DVector::from_column_slice(&values[nq..]);
        let state = model.body_state(body, &q, &u);

        let mut orientation = state.orientation;
        if let Some(prev) = previous {
            if prev.coords.dot(&orientation.coords) < 0.0 {
                orientation = UnitQuaternion::new_unchecked(-orientation.into_inner());
            }
        }
        previous = Some(orientation);

        let p = state.point_position(contact_point);
        let v = state.point_velocity(contact_point);
        row[POS..POS + 3].copy_from_slice(p.as_slice());
        row[VEL..VEL + 3].copy_from_slice(v.as_slice());
        row[QUAT] = orientation.w;
        row[QUAT + 1] = orientation.i;
        row[QUAT + 2] = orientation.j;
        row[QUAT + 3] = orientation.k;
        row[OMEGA..OMEGA + 3].copy_from_slice(state.angular_velocity.as_slice());
        trajectory.append(t, &row)?;
    }
    Ok(trajectory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelConfig, RigidBodyConfig, RigidBodySystem};
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    fn block() -> RigidBodySystem {
        RigidBodySystem::from_config(&ModelConfig {
            name: "block".into(),
            gravity: [0.0; 3],
            bodies: vec![RigidBodyConfig {
                name: "foot".into(),
                mass: 1.0,
                inertia: [0.1, 0.1, 0.1],
                contact_point: [0.0, -0.05, 0.0],
            }],
            actuators: Vec::new(),
        })
        .unwrap()
    }

    fn still_reference(model: &RigidBodySystem) -> TimeSeries {
        let mut labels = model.coordinate_labels();
        labels.extend(model.speed_labels());
        let zeros = vec![0.0; labels.len()];
        TimeSeries::from_rows(labels, vec![(0.0, zeros.clone()), (1.0, zeros)]).unwrap()
    }

    fn spec(kind: SpringKind) -> CorrectiveSpringSpec {
        CorrectiveSpringSpec {
            id: "foot_lin".into(),
            kind,
            body: "foot".into(),
            stiffness: Vector3::new(100.0, 200.0, 300.0),
            damping: Vector3::new(1.0, 2.0, 3.0),
            window: ContactWindow::new(0.1, 0.1, 0.6, 0.1).unwrap(),
            transition: None,
        }
    }

    fn displaced(dx: f64, rz: f64) -> SimulationState {
        let mut s = SimulationState::zeros(0.0, 6, 6);
        s.q[0] = dx;
        s.q[5] = rz;
        s
    }

    #[test]
    fn zero_error_gives_zero_force() {
        let model = block();
        let spring = CorrectiveSpring::new(spec(SpringKind::Linear), &model, &still_reference(&model), None)
            .unwrap();
        let sample = spring.force_at(0.4, &model, &displaced(0.0, 0.0));
        assert_eq!(sample.weight, 1.0);
        assert_eq!(sample.applied, Vector3::zeros());
    }

    #[test]
    fn linear_spring_restores_contact_point() {
        let model = block();
        let spring = CorrectiveSpring::new(spec(SpringKind::Linear), &model, &still_reference(&model), None)
            .unwrap();
        let sample = spring.force_at(0.4, &model, &displaced(0.01, 0.0));
        assert_relative_eq!(sample.applied, Vector3::new(-1.0, 0.0, 0.0), epsilon = 1e-12);

        let mut loads = AppliedLoads::new(1);
        spring.contribute(0.4, &model, &displaced(0.01, 0.0), &mut loads);
        assert_relative_eq!(loads.force(BodyId(0)), Vector3::new(-1.0, 0.0, 0.0), epsilon = 1e-12);
        // Applied below the mass center: r = (0, -0.05, 0), F = (-1, 0, 0).
        assert_relative_eq!(loads.torque(BodyId(0)).z, -0.05, epsilon = 1e-12);
    }

    #[test]
    fn torsional_spring_restores_orientation() {
        let model = block();
        let spring = CorrectiveSpring::new(
            spec(SpringKind::Torsional),
            &model,
            &still_reference(&model),
            None,
        )
        .unwrap();
        let sample = spring.force_at(0.4, &model, &displaced(0.0, 0.02));
        assert_relative_eq!(sample.applied, Vector3::new(0.0, 0.0, -6.0), epsilon = 1e-9);

        let mut loads = AppliedLoads::new(1);
        spring.contribute(0.4, &model, &displaced(0.0, 0.02), &mut loads);
        assert_eq!(loads.force(BodyId(0)), Vector3::zeros());
        assert_relative_eq!(loads.torque(BodyId(0)).z, -6.0, epsilon = 1e-9);
    }

    #[test]
    fn outside_window_contributes_nothing() {
        let model = block();
        let spring = CorrectiveSpring::new(spec(SpringKind::Linear), &model, &still_reference(&model), None)
            .unwrap();
        let mut loads = AppliedLoads::new(1);
        spring.contribute(0.05, &model, &displaced(0.3, 0.1), &mut loads);
        spring.contribute(0.9, &model, &displaced(0.3, 0.1), &mut loads);
        assert_eq!(loads, AppliedLoads::new(1));
        let sample = spring.force_at(0.05, &model, &displaced(0.3, 0.1));
        assert_eq!(sample.weight, 0.0);
        assert_eq!(sample.applied, Vector3::zeros());
        assert!(sample.raw.x < 0.0);
    }

    #[test]
    fn empty_reference_is_rejected() {
        let model = block();
        let mut labels = model.coordinate_labels();
        labels.extend(model.speed_labels());
        let empty = TimeSeries::new(labels);
        let err = CorrectiveSpring::new(spec(SpringKind::Linear), &model, &empty, None).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn unknown_body_and_bad_gains_are_rejected() {
        let model = block();
        let reference = still_reference(&model);
        let mut s = spec(SpringKind::Linear);
        s.body = "hand".into();
        assert!(CorrectiveSpring::new(s, &model, &reference, None).is_err());

        let mut s = spec(SpringKind::Linear);
        s.damping.y = -1.0;
        assert!(CorrectiveSpring::new(s, &model, &reference, None).is_err());
    }

    #[test]
    fn load_transition_gates_the_weight() {
        let model = block();
        let reference = still_reference(&model);
        let magnitude =
            TimeSeries::from_rows(vec!["f".into()], vec![(0.0, vec![0.0]), (1.0, vec![100.0])])
                .unwrap();
        let mut s = spec(SpringKind::Linear);
        s.transition = Some(LoadTransition {
            start_force: 20.0,
            end_force: 60.0,
        });
        assert!(CorrectiveSpring::new(s.clone(), &model, &reference, None).is_err());

        let spring = CorrectiveSpring::new(s, &model, &reference, Some(magnitude)).unwrap();
        // 15 N at t = 0.15 is below the start force.
        assert_eq!(spring.active_weight(0.15), 0.0);
        // 40 N is half way through the transition, window fully open.
        assert_relative_eq!(spring.active_weight(0.4), 0.5, epsilon = 1e-12);
        assert_eq!(spring.active_weight(0.65), spec(SpringKind::Linear).window.active_weight(0.65));
    }

    proptest! {
        #[test]
        fn applied_force_never_exceeds_raw(
            dx in -0.1f64..0.1,
            rz in -0.5f64..0.5,
            t in -0.5f64..1.5,
        ) {
            let model = block();
            let reference = still_reference(&model);
            for kind in [SpringKind::Linear, SpringKind::Torsional] {
                let spring = CorrectiveSpring::new(spec(kind), &model, &reference, None).unwrap();
                let sample = spring.force_at(t, &model, &displaced(dx, rz));
                prop_assert!(sample.applied.norm() <= sample.raw.norm() + 1e-12);
                if sample.weight == 0.0 {
                    prop_assert_eq!(sample.applied, Vector3::zeros());
                }
            }
        }
    }
}
