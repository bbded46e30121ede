use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::driver::DriverSettings;
use crate::integrator::IntegratorConfig;
use crate::model::ModelConfig;
use crate::schedule::{ContactEventSchedule, FootEvents, RiseTimes, Side, SpringKind};
use crate::spring::{CorrectiveSpringSpec, LoadTransition};

/// Recorded ground reactions and the kinematics that carry their points of
/// application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalLoadsConfig {
    /// CSV with 9 columns per body
    pub file: PathBuf,
    pub kinematics_file: Option<PathBuf>,
    pub body1: String,
    pub body2: Option<String>,
    /// Low-pass cutoff for the kinematics [Hz], -1 disables filtering
    #[serde(default = "no_filter")]
    pub lowpass_cutoff_hz: f64,
}

fn no_filter() -> f64 {
    -1.0
}

/// Gait events and corrective spring gains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactConfig {
    pub right: FootEvents,
    pub left: FootEvents,
    /// Default rise time of torsional windows [s]
    #[serde(default = "default_tau")]
    pub tau: f64,
    pub tau_right_start: Option<f64>,
    pub tau_right_end: Option<f64>,
    pub tau_left_start: Option<f64>,
    pub tau_left_end: Option<f64>,

    #[serde(default)]
    pub right_linear: bool,
    #[serde(default)]
    pub left_linear: bool,
    #[serde(default)]
    pub right_torsional: bool,
    #[serde(default)]
    pub left_torsional: bool,

    #[serde(default = "default_right_body")]
    pub right_body: String,
    #[serde(default = "default_left_body")]
    pub left_body: String,

    /// Linear stiffness per axis [N/m]
    #[serde(default = "default_k_lin")]
    pub k_lin: [f64; 3],
    /// Linear damping per axis [N s/m]
    #[serde(default = "default_b_lin")]
    pub b_lin: [f64; 3],
    /// Torsional stiffness per axis [N m/rad]
    #[serde(default = "default_k_tor")]
    pub k_tor: [f64; 3],
    /// Torsional damping per axis [N m s/rad]
    #[serde(default = "default_b_tor")]
    pub b_tor: [f64; 3],

    /// Load magnitude where linear springs start to engage [N]
    pub transition_start_force: Option<f64>,
    /// Load magnitude where linear springs are fully engaged [N]
    pub transition_end_force: Option<f64>,
}

fn default_tau() -> f64 {
    RiseTimes::default().tau
}

fn default_right_body() -> String {
    "foot_r".to_string()
}

fn default_left_body() -> String {
    "foot_l".to_string()
}

fn default_k_lin() -> [f64; 3] {
    [50_000.0; 3]
}

fn default_b_lin() -> [f64; 3] {
    [500.0; 3]
}

fn default_k_tor() -> [f64; 3] {
    [500.0; 3]
}

fn default_b_tor() -> [f64; 3] {
    [5.0; 3]
}

impl ContactConfig {
    pub fn schedule(&self) -> crate::Result<ContactEventSchedule> {
        ContactEventSchedule::new(
            self.right,
            self.left,
            RiseTimes {
                tau: self.tau,
                right_start: self.tau_right_start,
                right_end: self.tau_right_end,
                left_start: self.tau_left_start,
                left_end: self.tau_left_end,
            },
        )
    }

    fn enabled(&self, side: Side, kind: SpringKind) -> bool {
        match (side, kind) {
            (Side::Right, SpringKind::Linear) => self.right_linear,
            (Side::Left, SpringKind::Linear) => self.left_linear,
            (Side::Right, SpringKind::Torsional) => self.right_torsional,
            (Side::Left, SpringKind::Torsional) => self.left_torsional,
        }
    }

    fn body(&self, side: Side) -> &str {
        match side {
            Side::Right => &self.right_body,
            Side::Left => &self.left_body,
        }
    }

    fn transition(&self) -> Option<LoadTransition> {
        match (self.transition_start_force, self.transition_end_force) {
            (Some(start_force), Some(end_force)) => Some(LoadTransition {
                start_force,
                end_force,
            }),
            _ => None,
        }
    }

    /// One spec per enabled side and kind, ids `<side>_<kind>`.
    pub fn spring_specs(&self) -> crate::Result<Vec<CorrectiveSpringSpec>> {
        let schedule = self.schedule()?;
        let mut specs = Vec::new();
        for kind in [SpringKind::Linear, SpringKind::Torsional] {
            for side in Side::BOTH {
                if !self.enabled(side, kind) {
                    continue;
                }
                let (stiffness, damping, transition) = match kind {
                    SpringKind::Linear => (self.k_lin, self.b_lin, self.transition()),
                    SpringKind::Torsional => (self.k_tor, self.b_tor, None),
                };
                specs.push(CorrectiveSpringSpec {
                    id: format!("{}_{}", side.as_str(), kind.as_str()),
                    kind,
                    body: self.body(side).to_string(),
                    stiffness: Vector3::from(stiffness),
                    damping: Vector3::from(damping),
                    window: schedule.window(side, kind)?,
                    transition,
                });
            }
        }
        Ok(specs)
    }
}

/// A forward run as described in a TOML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardConfig {
    pub name: String,
    /// Initial time [s]
    pub initial_time: f64,
    /// Final time [s]
    pub final_time: f64,
    /// Spacing of reported states [s]
    pub report_interval: f64,
    /// Report at the states file's own time stamps
    pub use_specified_dt: bool,
    /// Reference motion and initial state, columns `[q, u]`
    pub states_file: PathBuf,
    pub controls_file: Option<PathBuf>,
    /// Record per-spring weights and forces
    pub detailed_results: bool,
    /// Write CSV, plots and summary into a run directory
    pub write_results: bool,
    pub integrator: IntegratorConfig,
    pub external_loads: Option<ExternalLoadsConfig>,
    pub contact: Option<ContactConfig>,
    pub model: ModelConfig,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            name: "forward".to_string(),
            initial_time: 0.0,
            final_time: 1.0,
            report_interval: 0.01,
            use_specified_dt: false,
            states_file: PathBuf::from("states.csv"),
            controls_file: None,
            detailed_results: false,
            write_results: true,
            integrator: IntegratorConfig::default(),
            external_loads: None,
            contact: None,
            model: ModelConfig::default(),
        }
    }
}

impl ForwardConfig {
    pub fn from_toml_file(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let mut cfg: ForwardConfig = toml::from_str(&raw)
            .with_context(|| format!("failed to parse TOML config: {}", path.display()))?;
        if let Some(dir) = path.parent() {
            cfg.resolve_paths(dir);
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Makes relative file paths relative to `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        resolve(&mut self.states_file);
        if let Some(p) = self.controls_file.as_mut() {
            resolve(p);
        }
        if let Some(loads) = self.external_loads.as_mut() {
            resolve(&mut loads.file);
            if let Some(p) = loads.kinematics_file.as_mut() {
                resolve(p);
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.name.trim().is_empty(), "name must not be empty");
        anyhow::ensure!(
            self.initial_time.is_finite() && self.final_time.is_finite(),
            "initial_time and final_time must be finite"
        );
        anyhow::ensure!(
            self.final_time > self.initial_time,
            "final_time must be > initial_time"
        );
        anyhow::ensure!(self.report_interval > 0.0, "report_interval must be > 0");
        self.integrator.validate()?;

        if let Some(loads) = &self.external_loads {
            anyhow::ensure!(!loads.body1.is_empty(), "external_loads.body1 must not be empty");
            anyhow::ensure!(
                loads.lowpass_cutoff_hz < 0.0 || loads.lowpass_cutoff_hz > 0.0,
                "external_loads.lowpass_cutoff_hz must be positive, or negative to disable filtering"
            );
        }

        if let Some(contact) = &self.contact {
            if contact.transition_start_force.is_some() != contact.transition_end_force.is_some() {
                bail!("contact.transition_start_force and transition_end_force must be set together");
            }
            if contact.transition().is_some() {
                anyhow::ensure!(
                    self.external_loads.is_some(),
                    "contact load transitions need [external_loads]"
                );
            }
            contact.schedule()?;
        }
        Ok(())
    }

    pub fn spring_specs(&self) -> crate::Result<Vec<CorrectiveSpringSpec>> {
        match &self.contact {
            Some(contact) => contact.spring_specs(),
            None => Ok(Vec::new()),
        }
    }

    pub fn driver_settings(&self, output_dir: Option<PathBuf>) -> DriverSettings {
        DriverSettings {
            initial_time: self.initial_time,
            final_time: self.final_time,
            report_interval: self.report_interval,
            use_specified_dt: self.use_specified_dt,
            detailed_results: self.detailed_results,
            output_dir,
            integrator: self.integrator,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RUN: &str = r#"
name = "walk"
final_time = 1.2
report_interval = 0.005
states_file = "data/states.csv"
detailed_results = true

[integrator]
method = "rk4"
step = 0.001

[external_loads]
file = "data/grf.csv"
kinematics_file = "/abs/kinematics.csv"
body1 = "foot_r"
body2 = "foot_l"
lowpass_cutoff_hz = 6.0

[contact]
right = { heel_strike = 0.10, foot_flat = 0.16, heel_off = 0.50, toe_off = 0.62 }
left = { heel_strike = 0.60, foot_flat = 0.66, heel_off = 1.00, toe_off = 1.12 }
tau = 0.01
tau_left_end = 0.03
right_linear = true
left_torsional = true
transition_start_force = 20.0
transition_end_force = 100.0
"#;

    #[test]
    fn parses_and_resolves_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.toml");
        fs::write(&path, RUN).unwrap();

        let cfg = ForwardConfig::from_toml_file(&path).unwrap();
        assert_eq!(cfg.name, "walk");
        assert_eq!(cfg.initial_time, 0.0);
        assert_eq!(cfg.states_file, dir.path().join("data/states.csv"));
        let loads = cfg.external_loads.as_ref().unwrap();
        assert_eq!(loads.file, dir.path().join("data/grf.csv"));
        assert_eq!(loads.kinematics_file.as_deref(), Some(Path::new("/abs/kinematics.csv")));
        assert_eq!(cfg.integrator, IntegratorConfig::Rk4 { step: 0.001 });
        assert_eq!(cfg.model.bodies.len(), 2);
    }

    #[test]
    fn derives_enabled_springs() {
        let cfg: ForwardConfig = toml::from_str(RUN).unwrap();
        let specs = cfg.spring_specs().unwrap();
        let ids: Vec<&str> = specs.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["right_linear", "left_torsional"]);

        let lin = &specs[0];
        assert_eq!(lin.body, "foot_r");
        assert_eq!(lin.window.onset_time, 0.10);
        assert!(lin.transition.is_some());
        assert_eq!(lin.stiffness, Vector3::repeat(50_000.0));

        let tor = &specs[1];
        assert_eq!(tor.window.onset_time, 0.66);
        assert_eq!(tor.window.onset_tau, 0.01);
        assert_eq!(tor.window.offset_tau, 0.03);
        assert!(tor.transition.is_none());
    }

    #[test]
    fn rejects_bad_event_order() {
        let text = RUN.replace("heel_strike = 0.10, foot_flat = 0.16", "heel_strike = 1.0, foot_flat = 0.5");
        let cfg: ForwardConfig = toml::from_str(&text).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_half_specified_transition() {
        let text = RUN.replace("transition_end_force = 100.0\n", "");
        let cfg: ForwardConfig = toml::from_str(&text).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn defaults_validate() {
        ForwardConfig::default().validate().unwrap();
        assert!(ForwardConfig::default().spring_specs().unwrap().is_empty());
    }

    #[test]
    fn settings_carry_run_options() {
        let cfg: ForwardConfig = toml::from_str(RUN).unwrap();
        let settings = cfg.driver_settings(Some(PathBuf::from("out")));
        assert_eq!(settings.final_time, 1.2);
        assert!(settings.detailed_results);
        assert_eq!(settings.output_dir, Some(PathBuf::from("out")));
    }
}
