use std::fs;
use std::path::{Path, PathBuf};

use plotters::prelude::*;
use serde::Serialize;

use crate::driver::{ResultSet, SpringHistory};
use crate::error::{ForwardError, Result};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputFiles {
    pub output_dir: PathBuf,
    pub states_path: PathBuf,
    pub spring_paths: Vec<PathBuf>,
    pub plot_weight_path: Option<PathBuf>,
    pub plot_force_path: Option<PathBuf>,
}

/// Writes `results` into `dir`: the state history, one CSV per spring and,
/// when spring histories exist, weight and force plots.
pub fn write_result_set(dir: &Path, results: &ResultSet) -> Result<OutputFiles> {
    fs::create_dir_all(dir)?;

    let states_path = dir.join("states.csv");
    results.states.write_csv(&states_path)?;

    let mut spring_paths = Vec::with_capacity(results.springs.len());
    for history in &results.springs {
        let path = dir.join(format!("spring_{}.csv", history.id));
        history.samples.write_csv(&path)?;
        spring_paths.push(path);
    }

    let (plot_weight_path, plot_force_path) = if results.springs.iter().any(|h| !h.samples.is_empty()) {
        (
            try_plot(plot_weights, &results.springs, dir.join("spring_weights.png")),
            try_plot(plot_forces, &results.springs, dir.join("spring_forces.png")),
        )
    } else {
        (None, None)
    };

    Ok(OutputFiles {
        output_dir: dir.to_path_buf(),
        states_path,
        spring_paths,
        plot_weight_path,
        plot_force_path,
    })
}

pub fn write_summary<T: Serialize>(path: &Path, summary: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let data = serde_json::to_string_pretty(summary)?;
    fs::write(path, data)?;
    Ok(())
}

/// Plots are a convenience; a failure to render one is logged and skipped.
fn try_plot(
    draw: fn(&[SpringHistory], &Path) -> Result<()>,
    springs: &[SpringHistory],
    path: PathBuf,
) -> Option<PathBuf> {
    match draw(springs, &path) {
        Ok(()) => Some(path),
        Err(err) => {
            tracing::warn!(%err, path = %path.display(), "skipping plot");
            None
        }
    }
}

fn plot_error<E: std::fmt::Display>(err: E) -> ForwardError {
    ForwardError::output(format!("plot failed: {err}"))
}

fn time_range(springs: &[SpringHistory]) -> (f64, f64) {
    let first = springs
        .iter()
        .filter_map(|h| h.samples.first_time())
        .fold(f64::INFINITY, f64::min);
    let last = springs
        .iter()
        .filter_map(|h| h.samples.last_time())
        .fold(f64::NEG_INFINITY, f64::max);
    if first.is_finite() && last > first {
        (first, last)
    } else {
        (0.0, 1.0)
    }
}

fn plot_weights(springs: &[SpringHistory], path: &Path) -> Result<()> {
    let root = BitMapBackend::new(path, (1280, 720)).into_drawing_area();
    root.fill(&WHITE).map_err(plot_error)?;

    let (t0, t1) = time_range(springs);
    let mut chart = ChartBuilder::on(&root)
        .caption("Corrective Spring Weights", ("sans-serif", 34).into_font())
        .margin(20)
        .x_label_area_size(50)
        .y_label_area_size(60)
        .build_cartesian_2d(t0..t1, 0.0..1.05)
        .map_err(plot_error)?;

    chart
        .configure_mesh()
        .x_desc("Time [s]")
        .y_desc("Weight")
        .draw()
        .map_err(plot_error)?;

    for (i, history) in springs.iter().enumerate() {
        let color = Palette99::pick(i).to_rgba();
        chart
            .draw_series(LineSeries::new(
                history.samples.rows().map(|(t, row)| (t, row[0])),
                color.stroke_width(2),
            ))
            .map_err(plot_error)?
            .label(history.id.as_str())
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 25, y)], color.stroke_width(3)));
    }

    chart
        .configure_series_labels()
        .position(SeriesLabelPosition::UpperRight)
        .border_style(BLACK)
        .background_style(WHITE.mix(0.7))
        .draw()
        .map_err(plot_error)?;

    root.present().map_err(plot_error)?;
    Ok(())
}

fn applied_magnitude(row: &[f64]) -> f64 {
    (row[4] * row[4] + row[5] * row[5] + row[6] * row[6]).sqrt()
}

fn plot_forces(springs: &[SpringHistory], path: &Path) -> Result<()> {
    let root = BitMapBackend::new(path, (1280, 720)).into_drawing_area();
    root.fill(&WHITE).map_err(plot_error)?;

    let (t0, t1) = time_range(springs);
    let max_load = springs
        .iter()
        .flat_map(|h| h.samples.rows().map(|(_, row)| applied_magnitude(row)))
        .fold(0.0_f64, f64::max)
        .max(1.0e-6);

    let mut chart = ChartBuilder::on(&root)
        .caption("Applied Corrective Load", ("sans-serif", 34).into_font())
        .margin(20)
        .x_label_area_size(50)
        .y_label_area_size(80)
        .build_cartesian_2d(t0..t1, 0.0..max_load * 1.05)
        .map_err(plot_error)?;

    chart
        .configure_mesh()
        .x_desc("Time [s]")
        .y_desc("|F| [N] or |T| [N m]")
        .draw()
        .map_err(plot_error)?;

    for (i, history) in springs.iter().enumerate() {
        let color = Palette99::pick(i).to_rgba();
        chart
            .draw_series(LineSeries::new(
                history.samples.rows().map(|(t, row)| (t, applied_magnitude(row))),
                color.stroke_width(2),
            ))
            .map_err(plot_error)?
            .label(history.id.as_str())
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 25, y)], color.stroke_width(3)));
    }

    chart
        .configure_series_labels()
        .position(SeriesLabelPosition::UpperRight)
        .border_style(BLACK)
        .background_style(WHITE.mix(0.7))
        .draw()
        .map_err(plot_error)?;

    root.present().map_err(plot_error)?;
    Ok(())
}
