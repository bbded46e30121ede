//! In-memory time series with clamped linear interpolation.
//!
//! Columns are labelled; the first CSV column is always `time`.

use std::fs;
use std::path::Path;

use csv::{ReaderBuilder, Writer};
use nalgebra::DVector;
use serde::Serialize;

use crate::error::{ForwardError, Result};

/// Ordered `(time, row)` samples sharing one set of column labels.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeSeries {
    labels: Vec<String>,
    times: Vec<f64>,
    // Row-major, `labels.len()` values per sample.
    values: Vec<f64>,
}

impl TimeSeries {
    /// Creates an empty series with the given column labels.
    pub fn new(labels: Vec<String>) -> Self {
        Self {
            labels,
            times: Vec::new(),
            values: Vec::new(),
        }
    }

    /// Builds a series from `(time, row)` pairs.
    pub fn from_rows<I>(labels: Vec<String>, rows: I) -> Result<Self>
    where
        I: IntoIterator<Item = (f64, Vec<f64>)>,
    {
        let mut series = Self::new(labels);
        for (t, row) in rows {
            series.append(t, &row)?;
        }
        Ok(series)
    }

    /// Appends a sample. Times must be finite and strictly increasing.
    pub fn append(&mut self, t: f64, row: &[f64]) -> Result<()> {
        if row.len() != self.width() {
            return Err(ForwardError::configuration(format!(
                "time series row has {} values, expected {}",
                row.len(),
                self.width()
            )));
        }
        if !t.is_finite() {
            return Err(ForwardError::configuration(format!(
                "time series sample has non-finite time {t}"
            )));
        }
        if let Some(&last) = self.times.last() {
            if t <= last {
                return Err(ForwardError::configuration(format!(
                    "time series times must increase strictly: {t} follows {last}"
                )));
            }
        }
        self.times.push(t);
        self.values.extend_from_slice(row);
        Ok(())
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn width(&self) -> usize {
        self.labels.len()
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn first_time(&self) -> Option<f64> {
        self.times.first().copied()
    }

    pub fn last_time(&self) -> Option<f64> {
        self.times.last().copied()
    }

    /// Values of sample `idx`.
    pub fn row(&self, idx: usize) -> &[f64] {
        let w = self.width();
        &self.values[idx * w..(idx + 1) * w]
    }

    pub fn rows(&self) -> impl Iterator<Item = (f64, &[f64])> + '_ {
        (0..self.len()).map(move |idx| (self.times[idx], self.row(idx)))
    }

    /// Copies column `col` out of the series.
    pub fn column(&self, col: usize) -> Vec<f64> {
        (0..self.len()).map(|idx| self.row(idx)[col]).collect()
    }

    pub fn column_index(&self, label: &str) -> Option<usize> {
        self.labels.iter().position(|l| l == label)
    }

    /// Replaces column `col` in place. `data` must have one value per sample.
    pub fn set_column(&mut self, col: usize, data: &[f64]) -> Result<()> {
        if data.len() != self.len() || col >= self.width() {
            return Err(ForwardError::configuration(format!(
                "cannot replace column {col} with {} values in a {}x{} series",
                data.len(),
                self.len(),
                self.width()
            )));
        }
        let w = self.width();
        for (idx, &v) in data.iter().enumerate() {
            self.values[idx * w + col] = v;
        }
        Ok(())
    }

    /// New series with the columns named in `labels`, in that order.
    pub fn reorder(&self, labels: &[String]) -> Result<Self> {
        let indices = labels
            .iter()
            .map(|label| {
                self.column_index(label).ok_or_else(|| {
                    ForwardError::configuration(format!("time series has no column '{label}'"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let mut out = Self::new(labels.to_vec());
        let mut row = vec![0.0; indices.len()];
        for (t, values) in self.rows() {
            for (dst, &src) in row.iter_mut().zip(&indices) {
                *dst = values[src];
            }
            out.append(t, &row)?;
        }
        Ok(out)
    }

    /// New series holding the columns `start..start + count`.
    pub fn select_columns(&self, start: usize, count: usize) -> Result<Self> {
        if start + count > self.width() {
            return Err(ForwardError::configuration(format!(
                "column range {start}..{} exceeds series width {}",
                start + count,
                self.width()
            )));
        }
        let labels = self.labels[start..start + count].to_vec();
        let mut out = Self::new(labels);
        for (t, row) in self.rows() {
            out.append(t, &row[start..start + count])?;
        }
        Ok(out)
    }

    /// Linearly interpolated sample at `t`, written into `out`.
    ///
    /// Times before the first or after the last sample clamp to that
    /// endpoint. An empty series yields zeros.
    pub fn sample_into(&self, t: f64, out: &mut [f64]) {
        debug_assert_eq!(out.len(), self.width());
        if self.is_empty() {
            out.iter_mut().for_each(|v| *v = 0.0);
            return;
        }
        let (lo, hi, frac) = self.bracket(t);
        if lo == hi || frac == 0.0 {
            out.copy_from_slice(self.row(lo));
            return;
        }
        let a = self.row(lo);
        let b = self.row(hi);
        for ((o, &va), &vb) in out.iter_mut().zip(a).zip(b) {
            *o = frac.mul_add(vb - va, va);
        }
    }

    /// Linearly interpolated sample at `t`, clamped to the recorded span.
    pub fn sample_at(&self, t: f64) -> DVector<f64> {
        let mut out = DVector::zeros(self.width());
        self.sample_into(t, out.as_mut_slice());
        out
    }

    /// Indices of the samples bracketing `t` and the fraction between them.
    pub(crate) fn bracket(&self, t: f64) -> (usize, usize, f64) {
        let n = self.times.len();
        if n == 1 || t <= self.times[0] {
            return (0, 0, 0.0);
        }
        if t >= self.times[n - 1] {
            return (n - 1, n - 1, 0.0);
        }
        let hi = self.times.partition_point(|&ts| ts <= t);
        let lo = hi - 1;
        let span = self.times[hi] - self.times[lo];
        (lo, hi, (t - self.times[lo]) / span)
    }

    /// Reads a CSV file whose first column is time.
    pub fn read_csv(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(ForwardError::configuration(format!(
                "time series file not found: {}",
                path.display()
            )));
        }
        let mut reader = ReaderBuilder::new()
            .trim(csv::Trim::All)
            .comment(Some(b'#'))
            .from_path(path)?;

        let headers = reader.headers()?.clone();
        if headers.len() < 2 {
            return Err(ForwardError::configuration(format!(
                "{} needs a time column and at least one data column",
                path.display()
            )));
        }
        let labels = headers.iter().skip(1).map(str::to_string).collect();
        let mut series = Self::new(labels);

        let mut row = Vec::with_capacity(series.width());
        for (line, record) in reader.records().enumerate() {
            let record = record?;
            row.clear();
            let mut fields = record.iter().map(|field| {
                field.parse::<f64>().map_err(|e| {
                    ForwardError::configuration(format!(
                        "{} row {}: cannot parse '{field}': {e}",
                        path.display(),
                        line + 2
                    ))
                })
            });
            let t = match fields.next() {
                Some(t) => t?,
                None => continue,
            };
            for v in fields {
                row.push(v?);
            }
            series.append(t, &row)?;
        }
        Ok(series)
    }

    /// Writes the series as CSV with a leading `time` column.
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut writer = Writer::from_path(path)?;
        let mut header = Vec::with_capacity(self.width() + 1);
        header.push("time".to_string());
        header.extend(self.labels.iter().cloned());
        writer.write_record(&header)?;

        for (t, row) in self.rows() {
            let mut record = Vec::with_capacity(row.len() + 1);
            record.push(fmt_f64(t));
            record.extend(row.iter().map(|&v| fmt_f64(v)));
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

fn fmt_f64(value: f64) -> String {
    format!("{value:.10}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn labels(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn ramp_series() -> TimeSeries {
        TimeSeries::from_rows(
            labels(&["a", "b"]),
            vec![(0.0, vec![0.0, 10.0]), (1.0, vec![1.0, 20.0]), (2.0, vec![4.0, 20.0])],
        )
        .unwrap()
    }

    #[test]
    fn interpolates_between_samples() {
        let s = ramp_series();
        let v = s.sample_at(0.5);
        assert_relative_eq!(v[0], 0.5);
        assert_relative_eq!(v[1], 15.0);
        let v = s.sample_at(1.5);
        assert_relative_eq!(v[0], 2.5);
    }

    #[test]
    fn clamps_outside_recorded_span() {
        let s = ramp_series();
        assert_eq!(s.sample_at(-3.0).as_slice(), &[0.0, 10.0]);
        assert_eq!(s.sample_at(9.0).as_slice(), &[4.0, 20.0]);
    }

    #[test]
    fn exact_sample_times_return_rows() {
        let s = ramp_series();
        assert_eq!(s.sample_at(1.0).as_slice(), s.row(1));
    }

    #[test]
    fn rejects_non_increasing_times() {
        let mut s = TimeSeries::new(labels(&["x"]));
        s.append(0.0, &[1.0]).unwrap();
        assert!(s.append(0.0, &[2.0]).is_err());
        assert!(s.append(-1.0, &[2.0]).is_err());
        assert!(s.append(f64::NAN, &[2.0]).is_err());
    }

    #[test]
    fn rejects_wrong_width() {
        let mut s = TimeSeries::new(labels(&["x", "y"]));
        assert!(s.append(0.0, &[1.0]).is_err());
    }

    #[test]
    fn empty_series_samples_zeros() {
        let s = TimeSeries::new(labels(&["x", "y"]));
        assert_eq!(s.sample_at(0.3).as_slice(), &[0.0, 0.0]);
    }

    #[test]
    fn select_and_replace_columns() {
        let mut s = ramp_series();
        let b = s.select_columns(1, 1).unwrap();
        assert_eq!(b.labels(), &["b".to_string()]);
        assert_eq!(b.column(0), vec![10.0, 20.0, 20.0]);

        s.set_column(0, &[7.0, 7.0, 7.0]).unwrap();
        assert_eq!(s.column(0), vec![7.0, 7.0, 7.0]);
        assert!(s.set_column(0, &[1.0]).is_err());
        assert!(s.select_columns(1, 2).is_err());
    }

    #[test]
    fn reorder_by_label() {
        let s = ramp_series();
        let r = s.reorder(&labels(&["b", "a"])).unwrap();
        assert_eq!(r.row(2), &[20.0, 4.0]);
        assert!(s.reorder(&labels(&["c"])).unwrap_err().is_configuration());
    }

    #[test]
    fn csv_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("series.csv");
        let s = ramp_series();
        s.write_csv(&path).unwrap();

        let back = TimeSeries::read_csv(&path).unwrap();
        assert_eq!(back.labels(), s.labels());
        assert_eq!(back.times(), s.times());
        assert_eq!(back.row(2), s.row(2));
    }

    #[test]
    fn missing_file_is_a_configuration_error() {
        let err = TimeSeries::read_csv(Path::new("/nonexistent/forces.csv")).unwrap_err();
        assert!(err.is_configuration());
    }
}
