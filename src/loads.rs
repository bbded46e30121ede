//! Recorded external loads (e.g. ground reactions) applied to named bodies.

use std::path::Path;

use nalgebra::{DVector, Vector3};

use crate::contributor::ForceContributor;
use crate::error::{ForwardError, Result};
use crate::filter::lowpass_series;
use crate::model::{AppliedLoads, BodyId, Model, SimulationState};
use crate::storage::TimeSeries;

/// Columns per loaded body: force, point of application, torque.
pub const COLUMNS_PER_BODY: usize = 9;

/// Inputs of an [`ExternalLoadApplier`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalLoadSpec {
    /// `fx fy fz px py pz tx ty tz` per body, `body1` first.
    pub forces: TimeSeries,
    /// Recorded coordinates used to carry the points of application into
    /// the body frames.
    pub kinematics: Option<TimeSeries>,
    pub body1: String,
    pub body2: Option<String>,
    /// Low-pass cutoff for the kinematics [Hz]; negative disables filtering.
    pub cutoff_frequency: f64,
}

impl ExternalLoadSpec {
    pub fn from_files(
        forces: &Path,
        kinematics: Option<&Path>,
        body1: impl Into<String>,
        body2: Option<String>,
        cutoff_frequency: f64,
    ) -> Result<Self> {
        let forces = TimeSeries::read_csv(forces)?;
        let kinematics = kinematics.map(TimeSeries::read_csv).transpose()?;
        Ok(Self {
            forces,
            kinematics,
            body1: body1.into(),
            body2,
            cutoff_frequency,
        })
    }

    pub fn body_names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.body1.as_str()).chain(self.body2.as_deref())
    }
}

#[derive(Debug, Clone)]
enum ApplicationPoint {
    /// Ground-frame point, as recorded.
    Ground(TimeSeries),
    /// Body-frame point, moves with the simulated body.
    Body(TimeSeries),
}

#[derive(Debug, Clone)]
struct BodyLoad {
    name: String,
    body: BodyId,
    force: TimeSeries,
    point: ApplicationPoint,
    torque: TimeSeries,
}

/// Applies recorded forces and torques to up to two bodies.
#[derive(Debug, Clone)]
pub struct ExternalLoadApplier {
    loads: Vec<BodyLoad>,
}

impl ExternalLoadApplier {
    pub fn new(spec: ExternalLoadSpec, model: &dyn Model) -> Result<Self> {
        if spec.forces.is_empty() {
            return Err(ForwardError::configuration("external load data is empty"));
        }
        let names: Vec<String> = spec.body_names().map(str::to_string).collect();
        if names.len() == 2 && names[0] == names[1] {
            return Err(ForwardError::configuration(format!(
                "external loads name body '{}' twice",
                names[0]
            )));
        }
        let needed = COLUMNS_PER_BODY * names.len();
        if spec.forces.width() < needed {
            return Err(ForwardError::configuration(format!(
                "external load data has {} columns, {} bodies need {needed}",
                spec.forces.width(),
                names.len()
            )));
        }

        let kinematics = match spec.kinematics {
            Some(mut series) => {
                let nq = model.num_coordinates();
                if series.width() < nq {
                    return Err(ForwardError::configuration(format!(
                        "kinematics have {} columns, model has {nq} coordinates",
                        series.width()
                    )));
                }
                lowpass_series(&mut series, spec.cutoff_frequency)?;
                Some(series)
            }
            None => None,
        };

        let mut loads = Vec::with_capacity(names.len());
        for (k, name) in names.iter().enumerate() {
            let body = model.body_id(name).ok_or_else(|| {
                ForwardError::configuration(format!(
                    "external load body '{name}' is not in model '{}'",
                    model.name()
                ))
            })?;
            let base = k * COLUMNS_PER_BODY;
            let force = spec.forces.select_columns(base, 3)?;
            let ground_point = spec.forces.select_columns(base + 3, 3)?;
            let torque = spec.forces.select_columns(base + 6, 3)?;
            let point = match &kinematics {
                Some(kin) => ApplicationPoint::Body(to_body_frame(model, body, kin, &ground_point)?),
                None => ApplicationPoint::Ground(ground_point),
            };
            loads.push(BodyLoad {
                name: name.clone(),
                body,
                force,
                point,
                torque,
            });
        }

        tracing::debug!(
            bodies = ?names,
            samples = spec.forces.len(),
            moving_points = kinematics.is_some(),
            "external loads ready"
        );
        Ok(Self { loads })
    }

    /// Recorded force on `body_name` at `t`; zero for bodies without loads.
    pub fn load_at(&self, t: f64, body_name: &str) -> Vector3<f64> {
        self.loads
            .iter()
            .find(|l| l.name == body_name)
            .map_or_else(Vector3::zeros, |l| vec3(&l.force.sample_at(t)))
    }

    /// Magnitude of the recorded force on `body_name`, one sample per
    /// recorded time.
    pub fn force_magnitude_series(&self, body_name: &str) -> Result<TimeSeries> {
        let load = self
            .loads
            .iter()
            .find(|l| l.name == body_name)
            .ok_or_else(|| {
                ForwardError::configuration(format!("no external load is applied to '{body_name}'"))
            })?;
        let rows = load.force.rows().map(|(t, row)| {
            (t, vec![Vector3::new(row[0], row[1], row[2]).norm()])
        });
        TimeSeries::from_rows(vec![format!("{body_name}_force_magnitude")], rows)
    }
}

impl ForceContributor for ExternalLoadApplier {
    fn label(&self) -> &str {
        "external_loads"
    }

    fn contribute(
        &self,
        t: f64,
        model: &dyn Model,
        state: &SimulationState,
        loads: &mut AppliedLoads,
    ) {
        for load in &self.loads {
            let body = model.body_state(load.body, &state.q, &state.u);
            let force = vec3(&load.force.sample_at(t));
            let point = match &load.point {
                ApplicationPoint::Ground(series) => vec3(&series.sample_at(t)),
                ApplicationPoint::Body(series) => body.point_position(&vec3(&series.sample_at(t))),
            };
            loads.apply_force_at_point(load.body, &body, &point, &force);
            loads.apply_torque(load.body, &vec3(&load.torque.sample_at(t)));
        }
    }
}

fn vec3(v: &DVector<f64>) -> Vector3<f64> {
    Vector3::new(v[0], v[1], v[2])
}

/// Re-expresses recorded ground points in the frame of `body`, using the
/// recorded kinematics at each load sample.
fn to_body_frame(
    model: &dyn Model,
    body: BodyId,
    kinematics: &TimeSeries,
    ground_point: &TimeSeries,
) -> Result<TimeSeries> {
    let nq = model.num_coordinates();
    let zero_speeds = DVector::zeros(model.num_speeds());
    let mut out = TimeSeries::new(ground_point.labels().to_vec());
    for (t, row) in ground_point.rows() {
        let sample = kinematics.sample_at(t);
        let q = sample.rows(0, nq).into_owned();
        let state = model.body_state(body, &q, &zero_speeds);
        let local = state.to_local(&Vector3::new(row[0], row[1], row[2]));
        out.append(t, local.as_slice())?;
    }
    Ok(out)
}
