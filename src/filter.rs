//! Zero-phase low-pass filtering of recorded kinematics.

use crate::error::{ForwardError, Result};
use crate::storage::TimeSeries;

// Relative spread of sample spacing tolerated before the series is
// treated as non-uniform.
const UNIFORM_SPACING_TOLERANCE: f64 = 1.0e-3;

/// Second-order Butterworth low-pass section (bilinear transform).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Butterworth2 {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
}

impl Butterworth2 {
    /// Designs the section for `cutoff_hz` at `sample_rate_hz`.
    pub fn new(cutoff_hz: f64, sample_rate_hz: f64) -> Result<Self> {
        if !(cutoff_hz.is_finite() && cutoff_hz > 0.0) {
            return Err(ForwardError::configuration(format!(
                "low-pass cutoff must be positive, got {cutoff_hz} Hz"
            )));
        }
        let nyquist = 0.5 * sample_rate_hz;
        if cutoff_hz >= nyquist {
            return Err(ForwardError::configuration(format!(
                "low-pass cutoff {cutoff_hz} Hz is not below the Nyquist frequency {nyquist} Hz"
            )));
        }

        let k = (std::f64::consts::PI * cutoff_hz / sample_rate_hz).tan();
        let k2 = k * k;
        let sqrt2 = std::f64::consts::SQRT_2;
        let norm = 1.0 / (1.0 + sqrt2 * k + k2);

        let b0 = k2 * norm;
        Ok(Self {
            b0,
            b1: 2.0 * b0,
            b2: b0,
            a1: 2.0 * (k2 - 1.0) * norm,
            a2: (1.0 - sqrt2 * k + k2) * norm,
        })
    }

    /// Runs the section once over `data`, starting from the steady state of
    /// its first sample.
    fn run(&self, data: &mut [f64]) {
        let Some(&x0) = data.first() else {
            return;
        };
        let (mut x1, mut x2, mut y1, mut y2) = (x0, x0, x0, x0);
        for v in data.iter_mut() {
            let x = *v;
            let y = self.b0 * x + self.b1 * x1 + self.b2 * x2 - self.a1 * y1 - self.a2 * y2;
            x2 = x1;
            x1 = x;
            y2 = y1;
            y1 = y;
            *v = y;
        }
    }

    /// Forward-backward pass; the result has no phase lag.
    pub fn filtfilt(&self, data: &mut [f64]) {
        self.run(data);
        data.reverse();
        self.run(data);
        data.reverse();
    }
}

/// Low-pass filters every column of `series` in place.
///
/// A negative cutoff means "no filtering" and leaves the series untouched.
/// Series with fewer than three samples are left as they are.
pub fn lowpass_series(series: &mut TimeSeries, cutoff_hz: f64) -> Result<()> {
    if cutoff_hz < 0.0 {
        return Ok(());
    }
    if series.len() < 3 {
        tracing::debug!(samples = series.len(), "series too short to filter");
        return Ok(());
    }

    let dt = uniform_spacing(series.times())?;
    let section = Butterworth2::new(cutoff_hz, 1.0 / dt)?;

    for col in 0..series.width() {
        let mut data = series.column(col);
        section.filtfilt(&mut data);
        series.set_column(col, &data)?;
    }
    tracing::debug!(cutoff_hz, sample_rate_hz = 1.0 / dt, "low-pass filtered kinematics");
    Ok(())
}

fn uniform_spacing(times: &[f64]) -> Result<f64> {
    let n = times.len();
    let dt = (times[n - 1] - times[0]) / (n - 1) as f64;
    let worst = times
        .windows(2)
        .map(|w| ((w[1] - w[0]) - dt).abs())
        .fold(0.0_f64, f64::max);
    if worst > UNIFORM_SPACING_TOLERANCE * dt {
        return Err(ForwardError::configuration(format!(
            "filtering needs uniformly sampled data (mean dt {dt}, worst deviation {worst})"
        )));
    }
    Ok(dt)
}
