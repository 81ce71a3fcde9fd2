//! Target programs: per-signal trajectories, interpolation, resampling and
//! RMS telemetry for executed programs.

use std::fmt;

use hashbrown::HashSet;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::command::SignalTarget;
use crate::error::EngineError;

/// Tolerance given to signals the caller did not name. Large enough that
/// their error term is negligible next to any constrained signal.
// TODO: replace with an explicit per-signal "unconstrained" flag once the
// decision scoring has a test that pins the behaviour at other magnitudes.
pub const UNCONSTRAINED_TOLERANCE: f32 = 100_000.0;

/// Target value of unnamed signals and of series with no set value at all.
pub const UNSET_TARGET: f32 = 0.5;

/// Fill unset steps: hold the first set value backwards, interpolate linearly
/// between set values, hold the last set value forwards.
pub fn interpolate(values: &[Option<f32>]) -> Vec<f32> {
    let known: Vec<(usize, f32)> = values
        .iter()
        .enumerate()
        .filter_map(|(i, v)| v.map(|v| (i, v)))
        .collect();
    let (Some(&(first_i, first_v)), Some(&(last_i, last_v))) = (known.first(), known.last()) else {
        return vec![UNSET_TARGET; values.len()];
    };

    let mut out = vec![0.0f32; values.len()];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = if i <= first_i {
            first_v
        } else if i >= last_i {
            last_v
        } else {
            // `known` is sorted; find the surrounding pair.
            let right = known.partition_point(|(k, _)| *k < i);
            let (i1, v1) = known[right];
            if i1 == i {
                v1
            } else {
                let (i0, v0) = known[right - 1];
                let t = (i - i0) as f32 / (i1 - i0) as f32;
                v0 + t * (v1 - v0)
            }
        };
    }
    out
}

/// Check named targets against the device's signals; returns the program length.
pub fn validate_targets(signal_names: &[String], targets: &[SignalTarget]) -> Result<usize, EngineError> {
    let first = targets
        .first()
        .ok_or_else(|| EngineError::config("execute needs at least one target signal"))?;
    let length = first.values.len();
    if length == 0 {
        return Err(EngineError::config("target program is empty"));
    }
    let mut seen = HashSet::new();
    for t in targets {
        if !signal_names.contains(&t.signal) {
            return Err(EngineError::config(format!("unknown signal `{}`", t.signal)));
        }
        if !seen.insert(t.signal.as_str()) {
            return Err(EngineError::config(format!("signal `{}` targeted twice", t.signal)));
        }
        if t.values.len() != length {
            return Err(EngineError::config(format!(
                "target for `{}` has {} steps, expected {length}",
                t.signal,
                t.values.len()
            )));
        }
        if let Some(bad) = t.values.iter().flatten().find(|v| !(0.0..=1.0).contains(*v)) {
            return Err(EngineError::config(format!(
                "target value {bad} for `{}` is outside [0, 1]",
                t.signal
            )));
        }
        if !(t.tolerance.is_finite() && t.tolerance > 0.0) {
            return Err(EngineError::config(format!(
                "tolerance for `{}` must be positive",
                t.signal
            )));
        }
    }
    Ok(length)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgramStep {
    pub target: Vec<f32>,
    pub tolerance: Vec<f32>,
}

/// Full per-signal target/tolerance arrays, one step per program second.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionProgram {
    steps: Vec<ProgramStep>,
}

impl ExecutionProgram {
    pub fn build(signal_names: &[String], targets: &[SignalTarget]) -> Result<Self, EngineError> {
        let length = validate_targets(signal_names, targets)?;
        let columns: Vec<(Vec<f32>, f32)> = signal_names
            .iter()
            .map(|name| match targets.iter().find(|t| &t.signal == name) {
                Some(t) => (interpolate(&t.values), t.tolerance),
                None => (vec![UNSET_TARGET; length], UNCONSTRAINED_TOLERANCE),
            })
            .collect();
        let steps = (0..length)
            .map(|i| ProgramStep {
                target: columns.iter().map(|(values, _)| values[i]).collect(),
                tolerance: columns.iter().map(|(_, tol)| *tol).collect(),
            })
            .collect();
        Ok(Self { steps })
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, i: usize) -> Option<&ProgramStep> {
        self.steps.get(i)
    }
}

/// Average raw readings (time × signal) into `length` bins per signal.
/// Empty bins are interpolated. Returns signal-major series.
pub fn resample(raw: &[Vec<f32>], signals: usize, length: usize) -> Vec<Vec<f32>> {
    let mut sums = vec![vec![0.0f32; length]; signals];
    let mut counts = vec![0usize; length];
    let total = raw.len();
    for (t, reading) in raw.iter().enumerate() {
        let bin = (t * length / total.max(1)).min(length.saturating_sub(1));
        counts[bin] += 1;
        for (s, v) in reading.iter().enumerate().take(signals) {
            sums[s][bin] += v;
        }
    }
    sums.into_iter()
        .map(|row| {
            let binned: Vec<Option<f32>> = row
                .into_iter()
                .zip(&counts)
                .map(|(sum, &c)| (c > 0).then(|| sum / c as f32))
                .collect();
            interpolate(&binned)
        })
        .collect()
}

/// Running RMS distance to target over constrained signals.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ProgramStats {
    pub rms_sum: f64,
    pub ticks: u64,
    pub last_rms: f32,
}

impl ProgramStats {
    /// Record one tick; returns its RMS or `None` when nothing is constrained.
    pub fn record(&mut self, current: &[f32], step: &ProgramStep) -> Option<f32> {
        let mut acc = 0.0f32;
        let mut n = 0usize;
        for ((c, t), tol) in current.iter().zip(&step.target).zip(&step.tolerance) {
            if *tol < UNCONSTRAINED_TOLERANCE {
                acc += (c - t) * (c - t);
                n += 1;
            }
        }
        if n == 0 {
            return None;
        }
        let rms = (acc / n as f32).sqrt();
        self.rms_sum += f64::from(rms);
        self.ticks += 1;
        self.last_rms = rms;
        Some(rms)
    }

    pub fn average(&self) -> Option<f64> {
        (self.ticks > 0).then(|| self.rms_sum / self.ticks as f64)
    }
}

impl fmt::Display for ProgramStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.average() {
            Some(avg) => write!(
                f,
                "executed program RMS error: {avg:.4} (last {:.4}, {} ticks)",
                self.last_rms, self.ticks
            ),
            None => f.write_str("no executed program statistics"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> Vec<String> {
        ["alpha", "beta", "theta"].iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn interpolation_holds_ends_and_blends_middle() {
        let out = interpolate(&[None, Some(0.2), None, None, Some(0.8), None]);
        let expected = [0.2, 0.2, 0.4, 0.6, 0.8, 0.8];
        for (a, b) in out.iter().zip(expected) {
            assert!((a - b).abs() < 1e-6, "{out:?}");
        }
        assert_eq!(interpolate(&[None, None]), vec![UNSET_TARGET; 2]);
    }

    #[test]
    fn unnamed_signals_are_unconstrained() {
        let program = ExecutionProgram::build(
            &names(),
            &[SignalTarget::new("beta", vec![Some(0.9), None, Some(0.1)]).with_tolerance(0.5)],
        )
        .unwrap();
        assert_eq!(program.len(), 3);
        let step = program.step(1).unwrap();
        assert_eq!(step.tolerance, vec![UNCONSTRAINED_TOLERANCE, 0.5, UNCONSTRAINED_TOLERANCE]);
        assert!((step.target[1] - 0.5).abs() < 1e-6);
        assert_eq!(step.target[0], UNSET_TARGET);
    }

    #[test]
    fn mismatched_target_lengths_are_configuration_errors() {
        let targets = [
            SignalTarget::constant("alpha", 0.5, 4),
            SignalTarget::constant("beta", 0.5, 3),
        ];
        assert!(matches!(
            ExecutionProgram::build(&names(), &targets),
            Err(EngineError::Configuration(_))
        ));
        let out_of_range = [SignalTarget::constant("alpha", 1.5, 4)];
        assert!(ExecutionProgram::build(&names(), &out_of_range).is_err());
        assert!(ExecutionProgram::build(&names(), &[]).is_err());
    }

    #[test]
    fn resample_averages_bins_and_fills_gaps() {
        let raw: Vec<Vec<f32>> = (0..10).map(|t| vec![t as f32 / 10.0, 1.0]).collect();
        let out = resample(&raw, 2, 5);
        assert_eq!(out.len(), 2);
        assert!((out[0][0] - 0.05).abs() < 1e-6);
        assert!((out[0][4] - 0.85).abs() < 1e-6);
        assert!(out[1].iter().all(|v| (*v - 1.0).abs() < 1e-6));

        // More bins than readings: gaps get interpolated.
        let sparse = resample(&[vec![0.0], vec![1.0]], 1, 4);
        assert_eq!(sparse[0].len(), 4);
        assert!(sparse[0].windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn stats_ignore_unconstrained_signals() {
        let step = ProgramStep {
            target: vec![0.5, 0.2],
            tolerance: vec![1.0, UNCONSTRAINED_TOLERANCE],
        };
        let mut stats = ProgramStats::default();
        let rms = stats.record(&[0.8, 0.9], &step).unwrap();
        assert!((rms - 0.3).abs() < 1e-6);
        assert!((stats.average().unwrap() - 0.3).abs() < 1e-6);
    }
}
