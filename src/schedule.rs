//! Gait events and the contact windows derived from them.

use serde::{Deserialize, Serialize};

use crate::error::{ForwardError, Result};
use crate::ramp::Ramp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Right,
    Left,
}

impl Side {
    pub const BOTH: [Side; 2] = [Side::Right, Side::Left];

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Right => "right",
            Side::Left => "left",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpringKind {
    Linear,
    Torsional,
}

impl SpringKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SpringKind::Linear => "linear",
            SpringKind::Torsional => "torsional",
        }
    }
}

/// Time interval during which a spring acts, with smooth edges.
///
/// The weight rises from 0 to 1 over `[onset_time, onset_time + onset_tau]`
/// and falls back to 0 over `[offset_time, offset_time + offset_tau]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContactWindow {
    pub onset_time: f64,
    pub onset_tau: f64,
    pub offset_time: f64,
    pub offset_tau: f64,
}

impl ContactWindow {
    pub fn new(onset_time: f64, onset_tau: f64, offset_time: f64, offset_tau: f64) -> Result<Self> {
        if !(onset_time.is_finite() && offset_time.is_finite()) {
            return Err(ForwardError::configuration(format!(
                "contact window times must be finite (onset {onset_time}, offset {offset_time})"
            )));
        }
        for (name, tau) in [("onset", onset_tau), ("offset", offset_tau)] {
            if !(tau.is_finite() && tau >= 0.0) {
                return Err(ForwardError::configuration(format!(
                    "{name} rise time must be finite and non-negative, got {tau}"
                )));
            }
        }
        if onset_time > offset_time {
            return Err(ForwardError::configuration(format!(
                "contact window onset {onset_time} is after its offset {offset_time}"
            )));
        }
        Ok(Self {
            onset_time,
            onset_tau,
            offset_time,
            offset_tau,
        })
    }

    /// True when onset and offset coincide; such a window is inactive.
    pub fn is_empty(&self) -> bool {
        self.onset_time == self.offset_time
    }

    pub fn onset_ramp(&self) -> Ramp {
        Ramp::rising(self.onset_time, self.onset_tau)
    }

    pub fn offset_ramp(&self) -> Ramp {
        Ramp::falling(self.offset_time, self.offset_tau)
    }

    /// True when an edge of a non-empty window switches instantaneously.
    pub fn has_step(&self) -> bool {
        !self.is_empty() && (self.onset_ramp().is_step() || self.offset_ramp().is_step())
    }

    /// Blend weight at `t`: `onset(t) * (1 - offset(t))`.
    pub fn active_weight(&self, t: f64) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        self.onset_ramp().weight(t) * self.offset_ramp().weight(t)
    }

    /// Time after which the weight is zero for good.
    pub fn end_time(&self) -> f64 {
        self.offset_ramp().end()
    }
}

/// The four stance events of one foot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FootEvents {
    pub heel_strike: f64,
    pub foot_flat: f64,
    pub heel_off: f64,
    pub toe_off: f64,
}

impl FootEvents {
    fn validate(&self, side: Side) -> Result<()> {
        let named = [
            ("heel-strike", self.heel_strike),
            ("foot-flat", self.foot_flat),
            ("heel-off", self.heel_off),
            ("toe-off", self.toe_off),
        ];
        if let Some((name, v)) = named.iter().find(|(_, v)| !v.is_finite()) {
            return Err(ForwardError::configuration(format!(
                "{} {name} time is not finite ({v})",
                side.as_str()
            )));
        }
        for pair in named.windows(2) {
            let (early, te) = pair[0];
            let (late, tl) = pair[1];
            if tl < te {
                return Err(ForwardError::configuration(format!(
                    "{} {late} ({tl}) precedes {early} ({te})",
                    side.as_str()
                )));
            }
        }
        Ok(())
    }
}

/// Rise times of the torsional windows. `tau` is used where a side-specific
/// value is missing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiseTimes {
    pub tau: f64,
    pub right_start: Option<f64>,
    pub right_end: Option<f64>,
    pub left_start: Option<f64>,
    pub left_end: Option<f64>,
}

impl Default for RiseTimes {
    fn default() -> Self {
        Self {
            tau: 0.001,
            right_start: None,
            right_end: None,
            left_start: None,
            left_end: None,
        }
    }
}

impl RiseTimes {
    pub fn start(&self, side: Side) -> f64 {
        match side {
            Side::Right => self.right_start,
            Side::Left => self.left_start,
        }
        .unwrap_or(self.tau)
    }

    pub fn end(&self, side: Side) -> f64 {
        match side {
            Side::Right => self.right_end,
            Side::Left => self.left_end,
        }
        .unwrap_or(self.tau)
    }
}

/// Per-foot gait events for one run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ContactEventSchedule {
    right: FootEvents,
    left: FootEvents,
    rise: RiseTimes,
}

impl ContactEventSchedule {
    pub fn new(right: FootEvents, left: FootEvents, rise: RiseTimes) -> Result<Self> {
        right.validate(Side::Right)?;
        left.validate(Side::Left)?;
        let taus = [
            Some(rise.tau),
            rise.right_start,
            rise.right_end,
            rise.left_start,
            rise.left_end,
        ];
        if let Some(bad) = taus.into_iter().flatten().find(|t| !(t.is_finite() && *t >= 0.0)) {
            return Err(ForwardError::configuration(format!(
                "rise times must be finite and non-negative, got {bad}"
            )));
        }
        Ok(Self { right, left, rise })
    }

    pub fn events(&self, side: Side) -> &FootEvents {
        match side {
            Side::Right => &self.right,
            Side::Left => &self.left,
        }
    }

    /// Window for the spring of `kind` on `side`.
    ///
    /// Linear springs ramp in over heel-strike..foot-flat and out over
    /// heel-off..toe-off. Torsional springs engage once the foot is flat and
    /// release at heel-off, with the configured rise times.
    pub fn window(&self, side: Side, kind: SpringKind) -> Result<ContactWindow> {
        let ev = self.events(side);
        match kind {
            SpringKind::Linear => ContactWindow::new(
                ev.heel_strike,
                ev.foot_flat - ev.heel_strike,
                ev.heel_off,
                ev.toe_off - ev.heel_off,
            ),
            SpringKind::Torsional => ContactWindow::new(
                ev.foot_flat,
                self.rise.start(side),
                ev.heel_off,
                self.rise.end(side),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn events(hs: f64, ff: f64, ho: f64, to: f64) -> FootEvents {
        FootEvents {
            heel_strike: hs,
            foot_flat: ff,
            heel_off: ho,
            toe_off: to,
        }
    }

    fn schedule() -> ContactEventSchedule {
        ContactEventSchedule::new(
            events(0.1, 0.2, 0.6, 0.7),
            events(0.5, 0.6, 1.0, 1.1),
            RiseTimes {
                tau: 0.02,
                left_end: Some(0.05),
                ..RiseTimes::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn foot_flat_before_heel_strike_is_rejected() {
        let err = ContactEventSchedule::new(
            events(1.0, 0.5, 1.2, 1.3),
            events(0.0, 0.1, 0.2, 0.3),
            RiseTimes::default(),
        )
        .unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("foot-flat"));
    }

    #[test]
    fn toe_off_before_heel_off_is_rejected() {
        let err = ContactEventSchedule::new(
            events(0.0, 0.1, 0.2, 0.3),
            events(0.0, 0.1, 0.5, 0.4),
            RiseTimes::default(),
        )
        .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn negative_rise_time_is_rejected() {
        let rise = RiseTimes {
            right_start: Some(-0.01),
            ..RiseTimes::default()
        };
        let ev = events(0.0, 0.1, 0.2, 0.3);
        assert!(ContactEventSchedule::new(ev, ev, rise).is_err());
        assert!(ContactWindow::new(0.0, f64::NAN, 1.0, 0.1).is_err());
        assert!(ContactWindow::new(1.0, 0.1, 0.5, 0.1).is_err());
    }

    #[test]
    fn linear_window_spans_stance() {
        let w = schedule().window(Side::Right, SpringKind::Linear).unwrap();
        assert_eq!(w.onset_time, 0.1);
        assert_eq!(w.offset_time, 0.6);
        assert_eq!(w.active_weight(0.05), 0.0);
        assert_eq!(w.active_weight(0.4), 1.0);
        assert_eq!(w.active_weight(0.75), 0.0);
        let mid = w.active_weight(0.15);
        assert!(mid > 0.0 && mid < 1.0);
    }

    #[test]
    fn torsional_window_uses_side_taus_with_fallback() {
        let s = schedule();
        let right = s.window(Side::Right, SpringKind::Torsional).unwrap();
        assert_eq!(right.onset_time, 0.2);
        assert_eq!(right.onset_tau, 0.02);
        assert_eq!(right.offset_tau, 0.02);
        let left = s.window(Side::Left, SpringKind::Torsional).unwrap();
        assert_eq!(left.offset_tau, 0.05);
        assert!((left.end_time() - 1.05).abs() < 1e-12);
    }

    #[test]
    fn empty_window_is_inactive() {
        let w = ContactWindow::new(0.3, 0.0, 0.3, 0.0).unwrap();
        assert!(w.is_empty());
        for t in [0.0, 0.3, 0.300_001, 1.0] {
            assert_eq!(w.active_weight(t), 0.0);
        }
    }

    #[test]
    fn zero_tau_window_switches_instantly() {
        let w = ContactWindow::new(0.2, 0.0, 0.5, 0.0).unwrap();
        assert_eq!(w.active_weight(0.2), 0.0);
        assert_eq!(w.active_weight(0.21), 1.0);
        assert_eq!(w.active_weight(0.5), 1.0);
        assert_eq!(w.active_weight(0.51), 0.0);
        assert!(w.has_step());
        assert!(!ContactWindow::new(0.3, 0.0, 0.3, 0.0).unwrap().has_step());
    }

    proptest! {
        #[test]
        fn weight_stays_in_unit_interval(
            onset in 0.0f64..1.0,
            len in 0.0f64..1.0,
            on_tau in 0.0f64..0.3,
            off_tau in 0.0f64..0.3,
            t in -1.0f64..3.0,
        ) {
            let w = ContactWindow::new(onset, on_tau, onset + len, off_tau).unwrap();
            let v = w.active_weight(t);
            prop_assert!((0.0..=1.0).contains(&v));
            if t <= onset || t > w.end_time() {
                prop_assert_eq!(v, 0.0);
            }
        }
    }
}
