//! Model interface and a small rigid-body plant.
//!
//! The driver only talks to [`Model`]; [`RigidBodySystem`] is a stand-in
//! plant made of free, decoupled rigid bodies that is good enough to exercise
//! the contact-shaping machinery end to end.

use nalgebra::{DVector, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::{ForwardError, Result};

/// Index of a body inside a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BodyId(pub usize);

/// Generalized state `(t, q, u)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulationState {
    pub time: f64,
    pub q: DVector<f64>,
    pub u: DVector<f64>,
}

impl SimulationState {
    pub fn new(time: f64, q: DVector<f64>, u: DVector<f64>) -> Self {
        Self { time, q, u }
    }

    pub fn zeros(time: f64, nq: usize, nu: usize) -> Self {
        Self::new(time, DVector::zeros(nq), DVector::zeros(nu))
    }

    /// Splits a stacked `[q; u]` vector.
    pub fn from_stacked(time: f64, y: &DVector<f64>, nq: usize) -> Self {
        let q = y.rows(0, nq).into_owned();
        let u = y.rows(nq, y.len() - nq).into_owned();
        Self { time, q, u }
    }

    /// Stacks `q` and `u` into one vector.
    pub fn stacked(&self) -> DVector<f64> {
        let mut y = DVector::zeros(self.q.len() + self.u.len());
        y.rows_mut(0, self.q.len()).copy_from(&self.q);
        y.rows_mut(self.q.len(), self.u.len()).copy_from(&self.u);
        y
    }

    pub fn is_finite(&self) -> bool {
        self.time.is_finite()
            && self.q.iter().all(|v| v.is_finite())
            && self.u.iter().all(|v| v.is_finite())
    }
}

/// Kinematics of one body, expressed in the ground frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BodyState {
    /// Position of the body's mass center.
    pub position: Vector3<f64>,
    pub orientation: UnitQuaternion<f64>,
    pub linear_velocity: Vector3<f64>,
    pub angular_velocity: Vector3<f64>,
}

impl BodyState {
    /// Ground position of a point fixed in the body.
    pub fn point_position(&self, local: &Vector3<f64>) -> Vector3<f64> {
        self.position + self.orientation.transform_vector(local)
    }

    /// Ground velocity of a point fixed in the body.
    pub fn point_velocity(&self, local: &Vector3<f64>) -> Vector3<f64> {
        self.linear_velocity + self.angular_velocity.cross(&self.orientation.transform_vector(local))
    }

    /// Expresses a ground point in body coordinates.
    pub fn to_local(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.orientation.inverse_transform_vector(&(point - self.position))
    }
}

/// Per-body force and torque accumulated during one derivative evaluation.
///
/// Forces act through the body's mass center; off-center forces are reduced
/// to a force plus a torque when applied.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedLoads {
    forces: Vec<Vector3<f64>>,
    torques: Vec<Vector3<f64>>,
}

impl AppliedLoads {
    pub fn new(num_bodies: usize) -> Self {
        Self {
            forces: vec![Vector3::zeros(); num_bodies],
            torques: vec![Vector3::zeros(); num_bodies],
        }
    }

    /// Applies `force` through the mass center of `body`.
    pub fn apply_force(&mut self, body: BodyId, force: &Vector3<f64>) {
        self.forces[body.0] += force;
    }

    /// Applies `force` at the ground point `point` of `body`.
    pub fn apply_force_at_point(
        &mut self,
        body: BodyId,
        body_state: &BodyState,
        point: &Vector3<f64>,
        force: &Vector3<f64>,
    ) {
        self.forces[body.0] += force;
        self.torques[body.0] += (point - body_state.position).cross(force);
    }

    pub fn apply_torque(&mut self, body: BodyId, torque: &Vector3<f64>) {
        self.torques[body.0] += torque;
    }

    pub fn force(&self, body: BodyId) -> Vector3<f64> {
        self.forces[body.0]
    }

    pub fn torque(&self, body: BodyId) -> Vector3<f64> {
        self.torques[body.0]
    }
}

/// What the driver needs from a dynamic model.
pub trait Model: Send + Sync {
    fn name(&self) -> &str;

    fn num_coordinates(&self) -> usize;

    fn num_speeds(&self) -> usize;

    fn num_controls(&self) -> usize;

    fn num_bodies(&self) -> usize;

    fn coordinate_labels(&self) -> Vec<String>;

    fn speed_labels(&self) -> Vec<String>;

    fn control_labels(&self) -> Vec<String>;

    fn body_id(&self, name: &str) -> Option<BodyId>;

    fn body_name(&self, body: BodyId) -> &str;

    /// Body-fixed point where contact forces act.
    fn contact_point(&self, _body: BodyId) -> Vector3<f64> {
        Vector3::zeros()
    }

    fn body_state(&self, body: BodyId, q: &DVector<f64>, u: &DVector<f64>) -> BodyState;

    /// `q̇` as a function of `(q, u)`.
    fn coordinate_rates(&self, q: &DVector<f64>, u: &DVector<f64>) -> DVector<f64>;

    /// `u̇` given the state, the control signals and the applied body loads.
    fn accelerations(
        &self,
        t: f64,
        q: &DVector<f64>,
        u: &DVector<f64>,
        controls: &[f64],
        loads: &AppliedLoads,
    ) -> DVector<f64>;
}

const DOFS_PER_BODY: usize = 6;
const AXES: [&str; 6] = ["tx", "ty", "tz", "rx", "ry", "rz"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RigidBodyConfig {
    pub name: String,
    /// Mass [kg]
    pub mass: f64,
    /// Principal moments of inertia [kg m^2]
    pub inertia: [f64; 3],
    /// Body-fixed contact point [m]
    #[serde(default)]
    pub contact_point: [f64; 3],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuatorConfig {
    pub name: String,
    /// Coordinate label, e.g. `foot_r_ty`
    pub coordinate: String,
    /// Generalized force produced at full control [N or N m]
    pub optimal_force: f64,
}

/// Description of a [`RigidBodySystem`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub name: String,
    /// Gravity [m/s^2]
    pub gravity: [f64; 3],
    pub bodies: Vec<RigidBodyConfig>,
    pub actuators: Vec<ActuatorConfig>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: "feet".to_string(),
            gravity: [0.0, -9.80665, 0.0],
            bodies: vec![
                RigidBodyConfig {
                    name: "foot_r".to_string(),
                    mass: 1.25,
                    inertia: [0.0014, 0.0039, 0.0041],
                    contact_point: [0.05, -0.03, 0.0],
                },
                RigidBodyConfig {
                    name: "foot_l".to_string(),
                    mass: 1.25,
                    inertia: [0.0014, 0.0039, 0.0041],
                    contact_point: [0.05, -0.03, 0.0],
                },
            ],
            actuators: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct RigidBody {
    name: String,
    mass: f64,
    inertia: Vector3<f64>,
    contact_point: Vector3<f64>,
}

#[derive(Debug, Clone)]
struct Actuator {
    name: String,
    coordinate: usize,
    optimal_force: f64,
}

/// Free rigid bodies with six coordinates each.
///
/// Per body, `q = [x, y, z, rx, ry, rz]` where the last three form a rotation
/// vector and `u = q̇`. Rotational dynamics are linearized about small
/// rotations: `I ω̇ = τ` with principal inertia taken in the ground frame and
/// gyroscopic coupling ignored.
#[derive(Debug, Clone)]
pub struct RigidBodySystem {
    name: String,
    gravity: Vector3<f64>,
    bodies: Vec<RigidBody>,
    actuators: Vec<Actuator>,
}

impl RigidBodySystem {
    pub fn from_config(cfg: &ModelConfig) -> Result<Self> {
        if cfg.bodies.is_empty() {
            return Err(ForwardError::configuration("model needs at least one body"));
        }
        if cfg.gravity.iter().any(|g| !g.is_finite()) {
            return Err(ForwardError::configuration("gravity must be finite"));
        }

        let mut bodies: Vec<RigidBody> = Vec::with_capacity(cfg.bodies.len());
        for b in &cfg.bodies {
            if bodies.iter().any(|existing| existing.name == b.name) {
                return Err(ForwardError::configuration(format!(
                    "duplicate body name '{}'",
                    b.name
                )));
            }
            if !(b.mass.is_finite() && b.mass > 0.0) {
                return Err(ForwardError::configuration(format!(
                    "body '{}' must have positive mass",
                    b.name
                )));
            }
            if b.inertia.iter().any(|i| !(i.is_finite() && *i > 0.0)) {
                return Err(ForwardError::configuration(format!(
                    "body '{}' must have positive principal inertia",
                    b.name
                )));
            }
            bodies.push(RigidBody {
                name: b.name.clone(),
                mass: b.mass,
                inertia: Vector3::from(b.inertia),
                contact_point: Vector3::from(b.contact_point),
            });
        }

        let mut system = Self {
            name: cfg.name.clone(),
            gravity: Vector3::from(cfg.gravity),
            bodies,
            actuators: Vec::new(),
        };

        let labels = system.coordinate_labels();
        for a in &cfg.actuators {
            let coordinate = labels.iter().position(|l| *l == a.coordinate).ok_or_else(|| {
                ForwardError::configuration(format!(
                    "actuator '{}' drives unknown coordinate '{}'",
                    a.name, a.coordinate
                ))
            })?;
            if !a.optimal_force.is_finite() {
                return Err(ForwardError::configuration(format!(
                    "actuator '{}' has a non-finite optimal force",
                    a.name
                )));
            }
            system.actuators.push(Actuator {
                name: a.name.clone(),
                coordinate,
                optimal_force: a.optimal_force,
            });
        }

        Ok(system)
    }

    fn body(&self, id: BodyId) -> &RigidBody {
        &self.bodies[id.0]
    }
}

impl Model for RigidBodySystem {
    fn name(&self) -> &str {
        &self.name
    }

    fn num_coordinates(&self) -> usize {
        self.bodies.len() * DOFS_PER_BODY
    }

    fn num_speeds(&self) -> usize {
        self.num_coordinates()
    }

    fn num_controls(&self) -> usize {
        self.actuators.len()
    }

    fn num_bodies(&self) -> usize {
        self.bodies.len()
    }

    fn coordinate_labels(&self) -> Vec<String> {
        self.bodies
            .iter()
            .flat_map(|b| AXES.iter().map(move |axis| format!("{}_{axis}", b.name)))
            .collect()
    }

    fn speed_labels(&self) -> Vec<String> {
        self.coordinate_labels()
            .into_iter()
            .map(|l| format!("{l}_u"))
            .collect()
    }

    fn control_labels(&self) -> Vec<String> {
        self.actuators.iter().map(|a| a.name.clone()).collect()
    }

    fn body_id(&self, name: &str) -> Option<BodyId> {
        self.bodies.iter().position(|b| b.name == name).map(BodyId)
    }

    fn body_name(&self, body: BodyId) -> &str {
        &self.body(body).name
    }

    fn contact_point(&self, body: BodyId) -> Vector3<f64> {
        self.body(body).contact_point
    }

    fn body_state(&self, body: BodyId, q: &DVector<f64>, u: &DVector<f64>) -> BodyState {
        let i = body.0 * DOFS_PER_BODY;
        let rotation = Vector3::new(q[i + 3], q[i + 4], q[i + 5]);
        BodyState {
            position: Vector3::new(q[i], q[i + 1], q[i + 2]),
            orientation: UnitQuaternion::from_scaled_axis(rotation),
            linear_velocity: Vector3::new(u[i], u[i + 1], u[i + 2]),
            angular_velocity: Vector3::new(u[i + 3], u[i + 4], u[i + 5]),
        }
    }

    fn coordinate_rates(&self, _q: &DVector<f64>, u: &DVector<f64>) -> DVector<f64> {
        u.clone()
    }

    fn accelerations(
        &self,
        _t: f64,
        _q: &DVector<f64>,
        _u: &DVector<f64>,
        controls: &[f64],
        loads: &AppliedLoads,
    ) -> DVector<f64> {
        let mut generalized = DVector::zeros(self.num_speeds());
        for (b, body) in self.bodies.iter().enumerate() {
            let i = b * DOFS_PER_BODY;
            let force = loads.force(BodyId(b)) + self.gravity * body.mass;
            let torque = loads.torque(BodyId(b));
            generalized.rows_mut(i, 3).copy_from(&force);
            generalized.rows_mut(i + 3, 3).copy_from(&torque);
        }
        for (actuator, &control) in self.actuators.iter().zip(controls) {
            generalized[actuator.coordinate] += control * actuator.optimal_force;
        }

        let mut udot = DVector::zeros(self.num_speeds());
        for (b, body) in self.bodies.iter().enumerate() {
            let i = b * DOFS_PER_BODY;
            for k in 0..3 {
                udot[i + k] = generalized[i + k] / body.mass;
                udot[i + 3 + k] = generalized[i + 3 + k] / body.inertia[k];
            }
        }
        udot
    }
}

impl std::fmt::Display for RigidBodySystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({} bodies, {} actuators: {})",
            self.name,
            self.bodies.len(),
            self.actuators.len(),
            self.actuators
                .iter()
                .map(|a| a.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        )
    }
}
