//! Calibration and operating metrics.
//!
//! Per-split scoring for the CPCV engine (Brier, flip coverage, false alarms
//! per day) and the mean/dispersion aggregation of those metrics across
//! splits. Every metric is reported with its sample size; an undefined
//! metric is `None`, never a silently substituted default.
//!
//! Window conventions (shared with gate evaluation): a flip is covered when a
//! threshold-exceeding minute lies in `[flip - H, flip]`, closed at the flip
//! so that a probability spike at the flip minute itself counts. A
//! threshold-exceeding minute is attributable when a flip lies in
//! `[t, t + H)`.

use chrono::Duration;
use serde::Serialize;

use crate::errors::{Error, Result};
use crate::timeline::Timeline;

/// Batch Brier score accumulator.
///
/// `mean((p - outcome)^2)`: 0.0 is perfect, 0.25 is the uninformed ceiling
/// at a 50% base rate, 1.0 is maximally wrong.
#[derive(Debug, Clone, Default)]
pub struct BrierAccumulator {
    sum_sq: f64,
    n: usize,
}

impl BrierAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, predicted: f64, outcome: bool) {
        let target = if outcome { 1.0 } else { 0.0 };
        let err = predicted.clamp(0.0, 1.0) - target;
        self.sum_sq += err * err;
        self.n += 1;
    }

    /// Mean squared error so far; `None` with no samples.
    pub fn score(&self) -> Option<f64> {
        if self.n == 0 {
            None
        } else {
            Some(self.sum_sq / self.n as f64)
        }
    }

    pub fn n_samples(&self) -> usize {
        self.n
    }

    /// Brier score of always predicting the base rate. A useful model must
    /// beat this.
    pub fn baseline_score(base_rate: f64) -> f64 {
        let r = base_rate.clamp(0.0, 1.0);
        r * (1.0 - r)
    }

    /// Skill relative to the base-rate baseline: 1 is perfect, 0 matches the
    /// baseline, negative is worse than it.
    pub fn skill_score(&self, base_rate: f64) -> Option<f64> {
        let baseline = Self::baseline_score(base_rate);
        if baseline < 1e-10 {
            return None;
        }
        self.score().map(|s| 1.0 - s / baseline)
    }
}

/// Mean and dispersion of a metric across splits, with its sample count.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricSummary {
    pub mean: Option<f64>,
    pub std_dev: Option<f64>,
    pub n: usize,
}

/// Summarize a sample of per-split metric values.
pub fn summarize(values: &[f64]) -> MetricSummary {
    MetricSummary {
        mean: crate::stats::mean(values),
        std_dev: crate::stats::sample_std(values),
        n: values.len(),
    }
}

/// Out-of-fold metrics for one CPCV split.
#[derive(Debug, Clone, Serialize)]
pub struct SplitMetrics {
    pub split_index: usize,
    pub n_test_rows: usize,
    /// Brier score over test rows; `None` when the split has no test rows.
    pub brier: Option<f64>,
    /// Flips whose coverage window intersects the test rows. Flips entirely
    /// swallowed by purge/embargo never enter this denominator.
    pub n_eligible_flips: usize,
    pub n_covered_flips: usize,
    /// `None` when no flip is eligible (degenerate split).
    pub coverage: Option<f64>,
    pub n_false_alarms: usize,
    /// Span of the test rows, in days.
    pub elapsed_days: f64,
    pub false_alarms_per_day: f64,
}

/// Score one split's out-of-fold predictions against the timeline.
///
/// `predictions[i]` corresponds to `test_rows[i]`. Predictions must be
/// finite probabilities; anything else is an estimator contract violation.
pub fn evaluate_split(
    timeline: &Timeline,
    labels: &[bool],
    split_index: usize,
    test_rows: &[usize],
    predictions: &[f64],
    eval_threshold: f64,
) -> Result<SplitMetrics> {
    if predictions.len() != test_rows.len() {
        return Err(Error::DimensionMismatch {
            context: "split predictions",
            expected: test_rows.len(),
            actual: predictions.len(),
        });
    }
    if let Some(pos) = predictions
        .iter()
        .position(|p| !p.is_finite() || !(0.0..=1.0).contains(p))
    {
        return Err(Error::Estimator(format!(
            "prediction {} for row {} is not a probability",
            predictions[pos], test_rows[pos]
        )));
    }

    let timestamps = timeline.features().timestamps();
    let horizon = Duration::minutes(timeline.horizon_minutes());

    let mut brier = BrierAccumulator::new();
    for (&row, &p) in test_rows.iter().zip(predictions) {
        brier.update(p, labels[row]);
    }

    let test_ts: Vec<_> = test_rows.iter().map(|&r| timestamps[r]).collect();

    // Coverage over eligible flips.
    let mut n_eligible = 0usize;
    let mut n_covered = 0usize;
    for flip in timeline.flips() {
        let lo = flip.timestamp - horizon;
        let hi = flip.timestamp; // closed upper endpoint
        let start = test_ts.partition_point(|&ts| ts < lo);
        let end = test_ts.partition_point(|&ts| ts <= hi);
        if start == end {
            continue; // window entirely outside the test rows
        }
        n_eligible += 1;
        if predictions[start..end]
            .iter()
            .any(|&p| p >= eval_threshold)
        {
            n_covered += 1;
        }
    }

    // False alarms: threshold exceedances with no flip in [t, t + H).
    let flips = timeline.flips();
    let mut n_false_alarms = 0usize;
    for (&ts, &p) in test_ts.iter().zip(predictions) {
        if p < eval_threshold {
            continue;
        }
        let idx = flips.partition_point(|f| f.timestamp < ts);
        let attributable = flips
            .get(idx)
            .is_some_and(|f| f.timestamp - ts < horizon);
        if !attributable {
            n_false_alarms += 1;
        }
    }

    let elapsed_days = match (test_ts.first(), test_ts.last()) {
        (Some(&first), Some(&last)) => {
            (last - first + Duration::minutes(1)).num_minutes() as f64 / (24.0 * 60.0)
        }
        _ => 0.0,
    };
    let false_alarms_per_day = if elapsed_days > 0.0 {
        n_false_alarms as f64 / elapsed_days
    } else {
        0.0
    };

    Ok(SplitMetrics {
        split_index,
        n_test_rows: test_rows.len(),
        brier: brier.score(),
        n_eligible_flips: n_eligible,
        n_covered_flips: n_covered,
        coverage: if n_eligible > 0 {
            Some(n_covered as f64 / n_eligible as f64)
        } else {
            None
        },
        n_false_alarms,
        elapsed_days,
        false_alarms_per_day,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FeatureId;
    use crate::timeline::FeatureMatrix;
    use crate::types::{FlipEvent, TrendState};
    use chrono::{DateTime, TimeZone, Utc};

    fn minute(i: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap() + Duration::minutes(i)
    }

    fn timeline_with_flips(n: i64, flip_minutes: &[i64], horizon: i64) -> Timeline {
        let index: Vec<_> = (0..n).map(minute).collect();
        let rows: Vec<Vec<f64>> = (0..n).map(|i| vec![(i % 10) as f64]).collect();
        let matrix = FeatureMatrix::new(index, vec![FeatureId::Ret1m], rows).unwrap();
        let flips = flip_minutes
            .iter()
            .map(|&m| FlipEvent {
                timestamp: minute(m),
                direction: TrendState::Bull,
            })
            .collect();
        Timeline::new(matrix, flips, horizon).unwrap()
    }

    #[test]
    fn test_brier_accumulator_basics() {
        let mut acc = BrierAccumulator::new();
        assert!(acc.score().is_none());
        acc.update(1.0, true);
        acc.update(0.0, false);
        assert_eq!(acc.score(), Some(0.0));
        acc.update(1.0, false);
        assert!((acc.score().unwrap() - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(acc.n_samples(), 3);
    }

    #[test]
    fn test_brier_skill_score() {
        let mut acc = BrierAccumulator::new();
        acc.update(1.0, true);
        acc.update(0.0, false);
        assert!((acc.skill_score(0.5).unwrap() - 1.0).abs() < 1e-12);
        assert!((BrierAccumulator::baseline_score(0.2) - 0.16).abs() < 1e-12);
        assert!(acc.skill_score(0.0).is_none());
    }

    #[test]
    fn test_perfect_probability_series_full_coverage_zero_false_alarms() {
        // probability 1 exactly at flip minutes, 0 elsewhere
        let tl = timeline_with_flips(600, &[200, 400], 60);
        let labels = tl.labels();
        let test_rows: Vec<usize> = (0..600).collect();
        let preds: Vec<f64> = (0..600)
            .map(|i| if i == 200 || i == 400 { 1.0 } else { 0.0 })
            .collect();
        let m = evaluate_split(&tl, &labels, 0, &test_rows, &preds, 0.5).unwrap();
        assert_eq!(m.coverage, Some(1.0));
        assert_eq!(m.n_eligible_flips, 2);
        assert_eq!(m.n_false_alarms, 0);
        assert_eq!(m.false_alarms_per_day, 0.0);
    }

    #[test]
    fn test_false_alarm_counted_outside_horizon() {
        let tl = timeline_with_flips(600, &[400], 60);
        let labels = tl.labels();
        let test_rows: Vec<usize> = (0..600).collect();
        let mut preds = vec![0.0; 600];
        preds[100] = 0.9; // no flip within [t, t+60)
        preds[350] = 0.9; // flip at 400 is within [350, 410)
        let m = evaluate_split(&tl, &labels, 0, &test_rows, &preds, 0.5).unwrap();
        assert_eq!(m.n_false_alarms, 1);
        assert_eq!(m.coverage, Some(1.0)); // covered via the minute at 350
    }

    #[test]
    fn test_degenerate_split_reports_undefined_coverage() {
        // no flip near the test rows
        let tl = timeline_with_flips(600, &[500], 30);
        let labels = tl.labels();
        let test_rows: Vec<usize> = (0..100).collect();
        let preds = vec![0.1; 100];
        let m = evaluate_split(&tl, &labels, 3, &test_rows, &preds, 0.5).unwrap();
        assert_eq!(m.n_eligible_flips, 0);
        assert!(m.coverage.is_none());
        assert!(m.brier.is_some()); // still contributes calibration
        assert_eq!(m.split_index, 3);
    }

    #[test]
    fn test_out_of_range_prediction_rejected() {
        let tl = timeline_with_flips(100, &[50], 30);
        let labels = tl.labels();
        let err = evaluate_split(&tl, &labels, 0, &[0, 1], &[0.5, 1.5], 0.5).unwrap_err();
        assert!(matches!(err, Error::Estimator(_)));
    }

    #[test]
    fn test_summarize_sample_counts() {
        let s = summarize(&[0.2, 0.4]);
        assert_eq!(s.n, 2);
        assert!((s.mean.unwrap() - 0.3).abs() < 1e-12);
        assert!(s.std_dev.is_some());

        let empty = summarize(&[]);
        assert_eq!(empty.n, 0);
        assert!(empty.mean.is_none());
        assert!(empty.std_dev.is_none());
    }

    #[test]
    fn test_coverage_bounds() {
        let tl = timeline_with_flips(600, &[100, 300, 500], 60);
        let labels = tl.labels();
        let test_rows: Vec<usize> = (0..600).collect();
        let preds = vec![0.0; 600];
        let m = evaluate_split(&tl, &labels, 0, &test_rows, &preds, 0.5).unwrap();
        let c = m.coverage.unwrap();
        assert!((0.0..=1.0).contains(&c));
        assert_eq!(c, 0.0);
        assert!(m.false_alarms_per_day >= 0.0);
    }
}
