//! Forward-dynamics driver with time-windowed corrective contact springs.
//!
//! The model has no ground contact of its own. During each foot's stance the
//! driver adds linear and torsional springs that pull the foot toward its
//! recorded motion, fading them in and out with smooth ramps so the
//! integrator never sees a jump in load.

pub mod config;
pub mod contributor;
pub mod driver;
pub mod error;
pub mod filter;
pub mod integrand;
pub mod integrator;
pub mod loads;
pub mod model;
pub mod output;
pub mod ramp;
pub mod schedule;
pub mod spring;
pub mod storage;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

pub use config::ForwardConfig;
pub use contributor::{ForceContributor, ProbeSample};
pub use driver::{AbortHandle, DriverPhase, DriverSettings, ForwardDriver, ResultSet, RunFailure, RunInputs};
pub use error::{ForwardError, Result};
pub use loads::{ExternalLoadApplier, ExternalLoadSpec};
pub use model::{Model, RigidBodySystem, SimulationState};
pub use schedule::{ContactEventSchedule, ContactWindow, FootEvents, Side, SpringKind};
pub use spring::{CorrectiveSpring, CorrectiveSpringSpec, LoadTransition};
pub use storage::TimeSeries;

use crate::output::{write_summary, OutputFiles};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpringSummary {
    pub id: String,
    pub kind: SpringKind,
    pub body: String,
    pub window: ContactWindow,
    /// Largest recorded weight, with detailed results only.
    pub peak_weight: Option<f64>,
    /// Largest recorded applied load magnitude, with detailed results only.
    pub peak_applied: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub config: ForwardConfig,
    pub status: RunStatus,
    pub error: Option<String>,
    pub samples: usize,
    pub reached_time: Option<f64>,
    pub springs: Vec<SpringSummary>,
    pub outputs: Option<OutputFiles>,
    pub summary_path: Option<PathBuf>,
}

/// Loads every input named in `cfg`, runs the driver and, when
/// `cfg.write_results` is set, writes results and a JSON summary into a
/// timestamped directory under `output_base`.
pub fn run_forward(cfg: &ForwardConfig, output_base: &Path, abort: &AbortHandle) -> anyhow::Result<RunSummary> {
    cfg.validate()?;

    let model = Arc::new(
        RigidBodySystem::from_config(&cfg.model).context("failed to build model")?,
    );
    info!(model = %model, "model ready");

    let states = TimeSeries::read_csv(&cfg.states_file)
        .with_context(|| format!("failed to load states from {}", cfg.states_file.display()))?;
    let controls = cfg
        .controls_file
        .as_deref()
        .map(TimeSeries::read_csv)
        .transpose()
        .context("failed to load controls")?;
    let external_loads = cfg
        .external_loads
        .as_ref()
        .map(|loads| {
            ExternalLoadSpec::from_files(
                &loads.file,
                loads.kinematics_file.as_deref(),
                loads.body1.clone(),
                loads.body2.clone(),
                loads.lowpass_cutoff_hz,
            )
        })
        .transpose()
        .context("failed to load external loads")?;
    let springs = cfg.spring_specs()?;

    // The directory is only created once the run is known to be valid.
    let run_dir = cfg.write_results.then(|| unused_run_dir(output_base));

    let mut driver = ForwardDriver::new(model, cfg.driver_settings(run_dir.clone()));
    driver
        .configure(RunInputs {
            states: Some(states),
            controls,
            external_loads,
            springs: springs.clone(),
            initial_state: None,
        })
        .context("invalid forward run")?;
    if let Some(dir) = &run_dir {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create run directory {}", dir.display()))?;
    }

    let outcome = driver.run(abort);
    let (status, error, results) = match outcome {
        Ok(results) => (RunStatus::Completed, None, results),
        Err(RunFailure { error, partial }) => {
            let status = if error.is_cancelled() {
                RunStatus::Cancelled
            } else {
                RunStatus::Failed
            };
            (status, Some(error), *partial)
        }
    };

    let mut summary = RunSummary {
        config: cfg.clone(),
        status,
        error: error.as_ref().map(ToString::to_string),
        samples: results.states.len(),
        reached_time: results.last_time(),
        springs: summarize_springs(&springs, &results),
        outputs: driver.output_files().cloned(),
        summary_path: None,
    };

    if let Some(dir) = &run_dir {
        let path = dir.join("summary.json");
        write_summary(&path, &summary).context("failed to write run summary")?;
        summary.summary_path = Some(path);
    }

    match error {
        None => Ok(summary),
        Some(error) => {
            if let Some(path) = &summary.summary_path {
                warn!(path = %path.display(), "partial results written");
            }
            Err(anyhow::Error::new(error).context(format!("forward run '{}' did not complete", cfg.name)))
        }
    }
}

fn summarize_springs(specs: &[CorrectiveSpringSpec], results: &ResultSet) -> Vec<SpringSummary> {
    specs
        .iter()
        .map(|spec| {
            let history = results.spring(&spec.id);
            let peak = |col: fn(&[f64]) -> f64| {
                history.map(|h| h.samples.rows().map(|(_, row)| col(row)).fold(0.0_f64, f64::max))
            };
            SpringSummary {
                id: spec.id.clone(),
                kind: spec.kind,
                body: spec.body.clone(),
                window: spec.window,
                peak_weight: peak(|row| row[0]),
                peak_applied: peak(|row| (row[4] * row[4] + row[5] * row[5] + row[6] * row[6]).sqrt()),
            }
        })
        .collect()
}

/// First free `<base>/<YYYYMMDD-HHMMSS>[-NN]` path. Nothing is created.
fn unused_run_dir(base_dir: &Path) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%d-%H%M%S").to_string();
    let mut dir = base_dir.join(&stamp);
    let mut suffix = 0usize;
    while dir.exists() {
        suffix += 1;
        dir = base_dir.join(format!("{stamp}-{suffix:02}"));
    }
    dir
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_dir_is_chosen_but_not_created() {
        let base = tempfile::tempdir().unwrap();
        let first = unused_run_dir(base.path());
        assert!(!first.exists());
        assert_eq!(first.parent(), Some(base.path()));

        fs::create_dir_all(&first).unwrap();
        let second = unused_run_dir(base.path());
        assert_ne!(second, first);
        assert!(!second.exists());
    }
}
