//! Orchestration of one forward run.
//!
//! A [`ForwardDriver`] moves through `Uninitialized -> Configured ->
//! Integrating -> Completed | Failed`. Everything that can be checked before
//! integration is checked in [`ForwardDriver::configure`]; a failed configure
//! leaves the driver untouched.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::contributor::ForceContributor;
use crate::error::{ForwardError, Result};
use crate::integrand::ModelIntegrand;
use crate::integrator::{Integrator, IntegratorConfig, IntegratorFailure};
use crate::loads::{ExternalLoadApplier, ExternalLoadSpec};
use crate::model::{Model, SimulationState};
use crate::output::{write_result_set, OutputFiles};
use crate::spring::{CorrectiveSpring, CorrectiveSpringSpec};
use crate::storage::TimeSeries;

// Report times closer than this to the final time are merged into it.
const TIME_EPSILON: f64 = 1.0e-10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DriverPhase {
    Uninitialized,
    Configured,
    Integrating,
    Completed,
    Failed,
}

impl DriverPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            DriverPhase::Uninitialized => "uninitialized",
            DriverPhase::Configured => "configured",
            DriverPhase::Integrating => "integrating",
            DriverPhase::Completed => "completed",
            DriverPhase::Failed => "failed",
        }
    }
}

/// Run-time options of a driver.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriverSettings {
    pub initial_time: f64,
    pub final_time: f64,
    /// Spacing of reported states [s]
    pub report_interval: f64,
    /// Report at the time stamps of the states file instead of a uniform grid.
    pub use_specified_dt: bool,
    /// Record per-spring weight and force histories.
    pub detailed_results: bool,
    /// Where to write results; `None` keeps them in memory only.
    pub output_dir: Option<PathBuf>,
    pub integrator: IntegratorConfig,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            initial_time: 0.0,
            final_time: 1.0,
            report_interval: 0.01,
            use_specified_dt: false,
            detailed_results: false,
            output_dir: None,
            integrator: IntegratorConfig::default(),
        }
    }
}

impl DriverSettings {
    pub fn validate(&self) -> Result<()> {
        if !(self.initial_time.is_finite() && self.final_time.is_finite()) {
            return Err(ForwardError::configuration("initial and final time must be finite"));
        }
        if self.final_time <= self.initial_time {
            return Err(ForwardError::configuration(format!(
                "final time {} must be after initial time {}",
                self.final_time, self.initial_time
            )));
        }
        if !(self.report_interval.is_finite() && self.report_interval > 0.0) {
            return Err(ForwardError::configuration(format!(
                "report interval must be positive, got {}",
                self.report_interval
            )));
        }
        self.integrator.validate()
    }
}

/// Data consumed by [`ForwardDriver::configure`].
#[derive(Debug, Clone, Default)]
pub struct RunInputs {
    /// Reference motion and initial state, columns `[q, u]`.
    pub states: Option<TimeSeries>,
    /// One column per model control.
    pub controls: Option<TimeSeries>,
    pub external_loads: Option<ExternalLoadSpec>,
    pub springs: Vec<CorrectiveSpringSpec>,
    /// Starts integration here instead of at the states sampled at the
    /// initial time. Its time must equal the initial time.
    pub initial_state: Option<SimulationState>,
}

/// Shared flag used to stop a run between integrator steps.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Weight and force history of one spring.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpringHistory {
    pub id: String,
    /// Columns: weight, raw force, applied force.
    pub samples: TimeSeries,
}

/// Recorded outcome of a run, complete or partial.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultSet {
    pub states: TimeSeries,
    pub springs: Vec<SpringHistory>,
}

impl ResultSet {
    fn new(model: &dyn Model, spring_ids: &[String]) -> Self {
        let mut labels = model.coordinate_labels();
        labels.extend(model.speed_labels());
        let columns: Vec<String> = crate::contributor::ProbeSample::COLUMNS
            .iter()
            .map(|c| c.to_string())
            .collect();
        Self {
            states: TimeSeries::new(labels),
            springs: spring_ids
                .iter()
                .map(|id| SpringHistory {
                    id: id.clone(),
                    samples: TimeSeries::new(columns.clone()),
                })
                .collect(),
        }
    }

    pub fn last_time(&self) -> Option<f64> {
        self.states.last_time()
    }

    pub fn spring(&self, id: &str) -> Option<&SpringHistory> {
        self.springs.iter().find(|s| s.id == id)
    }
}

/// A run that stopped early, with everything recorded up to that point.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct RunFailure {
    pub error: ForwardError,
    pub partial: Box<ResultSet>,
}

// Everything a configured driver needs to integrate.
struct Prepared {
    contributors: Vec<Box<dyn ForceContributor>>,
    controls: Option<TimeSeries>,
    initial_state: SimulationState,
    report_times: Vec<f64>,
    spring_ids: Vec<String>,
    integrator: Box<dyn Integrator>,
}

/// Runs one forward simulation with corrective contact springs.
pub struct ForwardDriver {
    model: Arc<dyn Model>,
    settings: DriverSettings,
    custom_integrator: Option<Box<dyn Integrator>>,
    phase: DriverPhase,
    prepared: Option<Prepared>,
    output: Option<OutputFiles>,
}

impl ForwardDriver {
    pub fn new(model: Arc<dyn Model>, settings: DriverSettings) -> Self {
        Self {
            model,
            settings,
            custom_integrator: None,
            phase: DriverPhase::Uninitialized,
            prepared: None,
            output: None,
        }
    }

    /// Uses `integrator` instead of the one named in the settings.
    pub fn with_integrator(mut self, integrator: Box<dyn Integrator>) -> Self {
        self.custom_integrator = Some(integrator);
        self
    }

    pub fn phase(&self) -> DriverPhase {
        self.phase
    }

    /// Files written by the last run, if any.
    pub fn output_files(&self) -> Option<&OutputFiles> {
        self.output.as_ref()
    }

    /// Validates `inputs` and binds springs and loads to the model.
    pub fn configure(&mut self, inputs: RunInputs) -> Result<()> {
        if self.phase != DriverPhase::Uninitialized {
            return Err(ForwardError::InvalidPhase {
                expected: DriverPhase::Uninitialized.as_str(),
                actual: self.phase.as_str(),
            });
        }
        let prepared = self.prepare(inputs)?;
        info!(
            model = self.model.name(),
            contributors = prepared.contributors.len(),
            reports = prepared.report_times.len(),
            integrator = prepared.integrator.name(),
            "forward run configured"
        );
        self.prepared = Some(prepared);
        self.phase = DriverPhase::Configured;
        Ok(())
    }

    fn prepare(&mut self, inputs: RunInputs) -> Result<Prepared> {
        self.settings.validate()?;
        let model = self.model.as_ref();
        let (nq, nu) = (model.num_coordinates(), model.num_speeds());
        let t0 = self.settings.initial_time;
        let tf = self.settings.final_time;

        let states = inputs
            .states
            .ok_or_else(|| ForwardError::configuration("a states series is required"))?;
        if states.width() != nq + nu {
            return Err(ForwardError::configuration(format!(
                "states have {} columns, model '{}' needs {} coordinates and {} speeds",
                states.width(),
                model.name(),
                nq,
                nu
            )));
        }
        let (first, last) = match (states.first_time(), states.last_time()) {
            (Some(first), Some(last)) => (first, last),
            _ => return Err(ForwardError::configuration("states series is empty")),
        };
        if t0 < first - TIME_EPSILON || t0 > last + TIME_EPSILON {
            return Err(ForwardError::configuration(format!(
                "initial time {t0} is outside the states span [{first}, {last}]"
            )));
        }

        let controls = match inputs.controls {
            Some(series) => {
                if series.is_empty() {
                    return Err(ForwardError::configuration("controls series is empty"));
                }
                Some(series.reorder(&model.control_labels())?)
            }
            None => None,
        };

        let mut contributors: Vec<Box<dyn ForceContributor>> = Vec::new();
        let applier = inputs
            .external_loads
            .map(|spec| ExternalLoadApplier::new(spec, model))
            .transpose()?;

        let mut seen = HashSet::new();
        let mut springs = Vec::with_capacity(inputs.springs.len());
        for spec in inputs.springs {
            if !seen.insert(spec.id.clone()) {
                return Err(ForwardError::configuration(format!(
                    "duplicate spring id '{}'",
                    spec.id
                )));
            }
            let magnitude = match (&spec.transition, &applier) {
                (None, _) => None,
                (Some(_), Some(applier)) => Some(applier.force_magnitude_series(&spec.body)?),
                (Some(_), None) => {
                    return Err(ForwardError::configuration(format!(
                        "spring '{}' is gated by external load but no loads are configured",
                        spec.id
                    )))
                }
            };
            springs.push(CorrectiveSpring::new(spec, model, &states, magnitude)?);
        }
        let spring_ids: Vec<String> = springs.iter().map(|s| s.id().to_string()).collect();

        if let Some(applier) = applier {
            contributors.push(Box::new(applier));
        }
        for spring in springs {
            debug!(
                id = spring.id(),
                kind = spring.spec().kind.as_str(),
                body = spring.spec().body.as_str(),
                onset = spring.spec().window.onset_time,
                offset = spring.spec().window.offset_time,
                "corrective spring bound"
            );
            if spring.spec().window.has_step() {
                warn!(
                    id = spring.id(),
                    "spring window switches instantaneously; the load will be discontinuous"
                );
            }
            contributors.push(Box::new(spring));
        }

        let initial_state = match inputs.initial_state {
            Some(state) => {
                if state.q.len() != nq || state.u.len() != nu {
                    return Err(ForwardError::configuration(format!(
                        "initial state has {} coordinates and {} speeds, model needs {nq} and {nu}",
                        state.q.len(),
                        state.u.len()
                    )));
                }
                if (state.time - t0).abs() > TIME_EPSILON {
                    return Err(ForwardError::configuration(format!(
                        "initial state is at t = {}, run starts at {t0}",
                        state.time
                    )));
                }
                SimulationState { time: t0, ..state }
            }
            None => SimulationState::from_stacked(t0, &states.sample_at(t0), nq),
        };
        if !initial_state.is_finite() {
            return Err(ForwardError::configuration(format!(
                "initial state at t = {t0} is not finite"
            )));
        }

        let report_times = if self.settings.use_specified_dt {
            specified_times(states.times(), t0, tf)
        } else {
            uniform_times(t0, tf, self.settings.report_interval)
        };

        let integrator = match self.custom_integrator.take() {
            Some(integrator) => integrator,
            None => self.settings.integrator.build()?,
        };

        Ok(Prepared {
            contributors,
            controls,
            initial_state,
            report_times,
            spring_ids,
            integrator,
        })
    }

    /// Integrates from the initial to the final time.
    ///
    /// `abort` is checked before every step. On failure the error carries the
    /// last accepted state and the partial results recorded so far. Springs
    /// and loads are released when this returns, whatever the outcome.
    pub fn run(&mut self, abort: &AbortHandle) -> std::result::Result<ResultSet, RunFailure> {
        let Some(prepared) = self.prepared.take().filter(|_| self.phase == DriverPhase::Configured)
        else {
            return Err(RunFailure {
                error: ForwardError::InvalidPhase {
                    expected: DriverPhase::Configured.as_str(),
                    actual: self.phase.as_str(),
                },
                partial: Box::new(ResultSet::new(self.model.as_ref(), &[])),
            });
        };
        self.phase = DriverPhase::Integrating;

        let detailed_ids: &[String] = if self.settings.detailed_results {
            &prepared.spring_ids
        } else {
            &[]
        };
        let mut results = ResultSet::new(self.model.as_ref(), detailed_ids);

        let outcome = integrate(self.model.clone(), prepared, &mut results, abort);

        match outcome {
            Ok(()) => {
                self.phase = DriverPhase::Completed;
                info!(
                    samples = results.states.len(),
                    final_time = results.last_time(),
                    "forward run completed"
                );
                if let Err(error) = self.write_results(&results) {
                    return Err(RunFailure {
                        error,
                        partial: Box::new(results),
                    });
                }
                Ok(results)
            }
            Err(error) => {
                self.phase = DriverPhase::Failed;
                warn!(%error, recorded = results.states.len(), "forward run stopped early");
                if let Err(write_error) = self.write_results(&results) {
                    warn!(%write_error, "partial results could not be written");
                }
                Err(RunFailure {
                    error,
                    partial: Box::new(results),
                })
            }
        }
    }

    fn write_results(&mut self, results: &ResultSet) -> Result<()> {
        let Some(dir) = &self.settings.output_dir else {
            return Ok(());
        };
        let files = write_result_set(dir, results)?;
        info!(dir = %files.output_dir.display(), "results written");
        self.output = Some(files);
        Ok(())
    }
}

/// Integration loop, separate from `run` so every exit path records into
/// `results` and drops `prepared`.
fn integrate(
    model: Arc<dyn Model>,
    prepared: Prepared,
    results: &mut ResultSet,
    abort: &AbortHandle,
) -> Result<()> {
    let Prepared {
        contributors,
        controls,
        initial_state,
        report_times,
        mut integrator,
        ..
    } = prepared;

    let nq = model.num_coordinates();
    let mut integrand = ModelIntegrand::new(model, controls);
    for contributor in contributors {
        integrand.register(contributor);
    }
    debug!(
        count = integrand.num_contributors(),
        labels = ?integrand.contributor_labels().collect::<Vec<_>>(),
        "force contributors registered"
    );

    let mut state = initial_state;
    record(results, &integrand, &state)?;
    let mut y = state.stacked();

    let stop = || abort.is_aborted();
    for &target in &report_times {
        if abort.is_aborted() {
            return Err(cancelled(state));
        }
        let mut time = state.time;
        if let Err(reason) = integrator.advance(&integrand, &mut time, target, &mut y, &stop) {
            // Keep whatever the integrator accepted past the last report.
            let reached = SimulationState::from_stacked(time, &y, nq);
            let last = if time > state.time && reached.is_finite() {
                record(results, &integrand, &reached)?;
                reached
            } else {
                state
            };
            return Err(match reason {
                IntegratorFailure::Cancelled { .. } => cancelled(last),
                reason => integration_error(reason, last),
            });
        }
        let next = SimulationState::from_stacked(target, &y, nq);
        if !next.is_finite() {
            return Err(integration_error(
                IntegratorFailure::NonFiniteState { time: target },
                state,
            ));
        }
        state = next;
        record(results, &integrand, &state)?;
    }
    Ok(())
}

fn cancelled(last: SimulationState) -> ForwardError {
    ForwardError::Cancelled {
        time: last.time,
        last_state: Box::new(last),
    }
}

fn integration_error(reason: IntegratorFailure, last: SimulationState) -> ForwardError {
    ForwardError::Integration {
        time: reason.time(),
        last_good_time: last.time,
        last_state: Box::new(last),
        reason,
    }
}

fn record(results: &mut ResultSet, integrand: &ModelIntegrand, state: &SimulationState) -> Result<()> {
    results.states.append(state.time, state.stacked().as_slice())?;
    if results.springs.is_empty() {
        return Ok(());
    }
    for (label, sample) in integrand.probe(state) {
        let (Some(sample), Some(history)) =
            (sample, results.springs.iter_mut().find(|h| h.id == label))
        else {
            continue;
        };
        history.samples.append(state.time, &sample.as_row())?;
    }
    Ok(())
}

/// `t0 + k * interval` for `k >= 1`, ending exactly at `tf`.
fn uniform_times(t0: f64, tf: f64, interval: f64) -> Vec<f64> {
    let mut times = Vec::new();
    let mut k = 1u64;
    loop {
        let t = t0 + k as f64 * interval;
        if t >= tf - TIME_EPSILON {
            break;
        }
        times.push(t);
        k += 1;
    }
    times.push(tf);
    times
}

/// Recorded time stamps inside `(t0, tf)`, followed by `tf`.
fn specified_times(recorded: &[f64], t0: f64, tf: f64) -> Vec<f64> {
    let mut times: Vec<f64> = recorded
        .iter()
        .copied()
        .filter(|&t| t > t0 + TIME_EPSILON && t < tf - TIME_EPSILON)
        .collect();
    times.push(tf);
    times
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrator::Rk4;
    use crate::model::{ModelConfig, RigidBodyConfig, RigidBodySystem};
    use crate::schedule::{ContactWindow, SpringKind};
    use approx::assert_relative_eq;
    use nalgebra::{DVector, Vector3};

    fn block() -> Arc<dyn Model> {
        Arc::new(
            RigidBodySystem::from_config(&ModelConfig {
                name: "block".into(),
                gravity: [0.0; 3],
                bodies: vec![RigidBodyConfig {
                    name: "foot".into(),
                    mass: 1.0,
                    inertia: [0.1, 0.1, 0.1],
                    contact_point: [0.0; 3],
                }],
                actuators: Vec::new(),
            })
            .unwrap(),
        )
    }

    fn still_states(model: &dyn Model) -> TimeSeries {
        let mut labels = model.coordinate_labels();
        labels.extend(model.speed_labels());
        let rows = (0..=10).map(|i| (i as f64 * 0.1, vec![0.0; 12]));
        TimeSeries::from_rows(labels, rows).unwrap()
    }

    fn settings() -> DriverSettings {
        DriverSettings {
            initial_time: 0.0,
            final_time: 1.0,
            report_interval: 0.1,
            integrator: IntegratorConfig::Rk4 { step: 0.01 },
            ..DriverSettings::default()
        }
    }

    fn spring(id: &str) -> CorrectiveSpringSpec {
        CorrectiveSpringSpec {
            id: id.into(),
            kind: SpringKind::Linear,
            body: "foot".into(),
            stiffness: Vector3::repeat(100.0),
            damping: Vector3::repeat(20.0),
            window: ContactWindow::new(0.2, 0.1, 0.7, 0.1).unwrap(),
            transition: None,
        }
    }

    #[test]
    fn report_grids() {
        let uniform = uniform_times(0.0, 0.35, 0.1);
        assert_eq!(uniform.len(), 4);
        assert_eq!(*uniform.last().unwrap(), 0.35);

        let specified = specified_times(&[0.0, 0.1, 0.25, 0.3, 0.6], 0.1, 0.5);
        assert_eq!(specified, vec![0.25, 0.3, 0.5]);
    }

    #[test]
    fn completes_and_records_every_report_time() {
        let model = block();
        let mut driver = ForwardDriver::new(model.clone(), settings());
        driver
            .configure(RunInputs {
                states: Some(still_states(model.as_ref())),
                ..RunInputs::default()
            })
            .unwrap();
        assert_eq!(driver.phase(), DriverPhase::Configured);

        let results = driver.run(&AbortHandle::new()).unwrap();
        assert_eq!(driver.phase(), DriverPhase::Completed);
        assert_eq!(results.states.len(), 11);
        assert_eq!(results.last_time(), Some(1.0));
        assert!(results.springs.is_empty());
    }

    #[test]
    fn failed_configure_keeps_driver_uninitialized() {
        let model = block();
        let mut driver = ForwardDriver::new(model.clone(), settings());
        let err = driver
            .configure(RunInputs {
                states: Some(still_states(model.as_ref())),
                springs: vec![spring("a"), spring("a")],
                ..RunInputs::default()
            })
            .unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(driver.phase(), DriverPhase::Uninitialized);
        assert!(driver.run(&AbortHandle::new()).is_err());

        // A later valid configuration still succeeds.
        driver
            .configure(RunInputs {
                states: Some(still_states(model.as_ref())),
                springs: vec![spring("a")],
                ..RunInputs::default()
            })
            .unwrap();
    }

    #[test]
    fn initial_time_outside_states_is_rejected() {
        let model = block();
        let mut s = settings();
        s.initial_time = -0.5;
        let mut driver = ForwardDriver::new(model.clone(), s);
        let err = driver
            .configure(RunInputs {
                states: Some(still_states(model.as_ref())),
                ..RunInputs::default()
            })
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn gated_spring_without_loads_is_rejected() {
        let model = block();
        let mut gated = spring("gated");
        gated.transition = Some(crate::spring::LoadTransition {
            start_force: 10.0,
            end_force: 50.0,
        });
        let mut driver = ForwardDriver::new(model.clone(), settings());
        let err = driver
            .configure(RunInputs {
                states: Some(still_states(model.as_ref())),
                springs: vec![gated],
                ..RunInputs::default()
            })
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn explicit_initial_state_replaces_sampled_one() {
        let model = block();
        let mut q = DVector::zeros(6);
        q[0] = 0.05;
        let start = SimulationState::new(0.0, q, DVector::zeros(6));

        let mut driver = ForwardDriver::new(model.clone(), settings());
        driver
            .configure(RunInputs {
                states: Some(still_states(model.as_ref())),
                initial_state: Some(start.clone()),
                ..RunInputs::default()
            })
            .unwrap();
        let results = driver.run(&AbortHandle::new()).unwrap();
        assert_eq!(results.states.row(0)[0], 0.05);

        let late = SimulationState { time: 0.2, ..start.clone() };
        let mut driver = ForwardDriver::new(model.clone(), settings());
        let err = driver
            .configure(RunInputs {
                states: Some(still_states(model.as_ref())),
                initial_state: Some(late),
                ..RunInputs::default()
            })
            .unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(driver.phase(), DriverPhase::Uninitialized);

        let short = SimulationState::new(0.0, DVector::zeros(3), DVector::zeros(6));
        let err = driver
            .configure(RunInputs {
                states: Some(still_states(model.as_ref())),
                initial_state: Some(short),
                ..RunInputs::default()
            })
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn detailed_results_track_spring_weight() {
        let model = block();
        let mut s = settings();
        s.detailed_results = true;
        let mut driver = ForwardDriver::new(model.clone(), s);
        driver
            .configure(RunInputs {
                states: Some(still_states(model.as_ref())),
                springs: vec![spring("foot_lin")],
                ..RunInputs::default()
            })
            .unwrap();
        let results = driver.run(&AbortHandle::new()).unwrap();
        let history = results.spring("foot_lin").unwrap();
        assert_eq!(history.samples.len(), results.states.len());
        let weights = history.samples.column(0);
        assert_eq!(weights[0], 0.0);
        assert_relative_eq!(weights[5], 1.0);
        assert_eq!(weights[10], 0.0);
    }

    #[test]
    fn pre_set_abort_cancels_with_initial_sample() {
        let model = block();
        let mut driver = ForwardDriver::new(model.clone(), settings());
        driver
            .configure(RunInputs {
                states: Some(still_states(model.as_ref())),
                ..RunInputs::default()
            })
            .unwrap();
        let abort = AbortHandle::new();
        abort.abort();
        let failure = driver.run(&abort).unwrap_err();
        assert!(failure.error.is_cancelled());
        assert_eq!(failure.partial.states.len(), 1);
        assert_eq!(driver.phase(), DriverPhase::Failed);
    }

    #[test]
    fn custom_integrator_overrides_settings() {
        let model = block();
        let mut driver =
            ForwardDriver::new(model.clone(), settings()).with_integrator(Box::new(Rk4::new(0.05)));
        driver
            .configure(RunInputs {
                states: Some(still_states(model.as_ref())),
                ..RunInputs::default()
            })
            .unwrap();
        assert!(driver.run(&AbortHandle::new()).is_ok());
        // A completed driver cannot run twice.
        let again = driver.run(&AbortHandle::new()).unwrap_err();
        assert!(matches!(again.error, ForwardError::InvalidPhase { .. }));
    }
}
