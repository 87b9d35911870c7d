//! Combinatorial purged cross-validation (CPCV).
//!
//! Partitions the timeline into `k` contiguous blocks and enumerates every
//! C(k, g) choice of test blocks, yielding more out-of-sample paths than a
//! single k-fold pass. Around each test block, training rows are removed in
//! two layers:
//!
//! - **purge**: rows whose flip-within-horizon label window `(t, t + H]`
//!   reaches into the test block, i.e. the `H` minutes immediately before it;
//! - **embargo**: a fixed buffer (validated `>= H`) appended after the test
//!   block, absorbing feature-lookback and serial-correlation leakage.
//!
//! The embargo/horizon check runs before any split is computed; a violation
//! is a configuration error, not a warning.

use chrono::Duration;
use serde::Serialize;
use tracing::{debug, info};

use crate::errors::{Error, Result};
use crate::evaluation::{evaluate_split, summarize, MetricSummary, SplitMetrics};
use crate::hazard::ProbabilityEstimator;
use crate::timeline::{TimeRange, Timeline};
use crate::types::ProbabilitySeries;

/// CPCV parameters.
#[derive(Debug, Clone)]
pub struct CpcvConfig {
    /// Contiguous timeline blocks.
    pub n_blocks: usize,
    /// Blocks per test combination (`g` in C(k, g)).
    pub test_block_count: usize,
    /// Embargo after each test block, minutes. Must cover the flip horizon.
    pub embargo_minutes: i64,
    /// Keep only the last N combinations when set.
    pub max_combinations: Option<usize>,
    /// Threshold used for coverage / false-alarm scoring.
    pub eval_threshold: f64,
}

impl Default for CpcvConfig {
    fn default() -> Self {
        Self {
            n_blocks: 6,
            test_block_count: 2,
            embargo_minutes: 240,
            max_combinations: None,
            eval_threshold: 0.35,
        }
    }
}

/// One train/test assignment with its leakage buffers.
#[derive(Debug, Clone, Serialize)]
pub struct Split {
    /// Indices of the blocks serving as the test set.
    pub test_blocks: Vec<usize>,
    /// Time span of each test block.
    pub test_ranges: Vec<TimeRange>,
    /// Label-horizon buffers immediately before each test block.
    pub purge_ranges: Vec<TimeRange>,
    /// Embargo buffers immediately after each test block.
    pub embargo_ranges: Vec<TimeRange>,
    /// Training row indices (everything not test/purged/embargoed).
    pub train_rows: Vec<usize>,
    /// Test row indices, ascending.
    pub test_rows: Vec<usize>,
}

/// Lexicographic k-choose-g combinations.
fn combinations(k: usize, g: usize) -> Vec<Vec<usize>> {
    let mut out = Vec::new();
    let mut combo: Vec<usize> = (0..g).collect();
    loop {
        out.push(combo.clone());
        // advance
        let mut i = g;
        loop {
            if i == 0 {
                return out;
            }
            i -= 1;
            if combo[i] != i + k - g {
                break;
            }
            if i == 0 {
                return out;
            }
        }
        combo[i] += 1;
        for j in i + 1..g {
            combo[j] = combo[j - 1] + 1;
        }
    }
}

/// Build all CPCV splits for a timeline.
pub fn build_splits(timeline: &Timeline, config: &CpcvConfig) -> Result<Vec<Split>> {
    let horizon = timeline.horizon_minutes();
    if config.embargo_minutes < horizon {
        return Err(Error::EmbargoShorterThanHorizon {
            embargo_minutes: config.embargo_minutes,
            horizon_minutes: horizon,
        });
    }
    if config.n_blocks < 2 {
        return Err(Error::invalid_parameter("n_blocks", "need at least 2"));
    }
    if config.test_block_count == 0 || config.test_block_count >= config.n_blocks {
        return Err(Error::invalid_parameter(
            "test_block_count",
            format!(
                "must be in [1, {}), got {}",
                config.n_blocks, config.test_block_count
            ),
        ));
    }
    let n = timeline.n_rows();
    if n < config.n_blocks {
        return Err(Error::invalid_parameter(
            "n_blocks",
            format!("timeline has only {n} rows for {} blocks", config.n_blocks),
        ));
    }

    let timestamps = timeline.features().timestamps();

    // Contiguous, near-equal row blocks.
    let block_bounds: Vec<(usize, usize)> = (0..config.n_blocks)
        .map(|b| {
            let start = b * n / config.n_blocks;
            let end = (b + 1) * n / config.n_blocks;
            (start, end)
        })
        .collect();

    let mut combos = combinations(config.n_blocks, config.test_block_count);
    if let Some(cap) = config.max_combinations {
        if combos.len() > cap {
            combos.drain(..combos.len() - cap);
        }
    }

    let horizon_d = Duration::minutes(horizon);
    let embargo_d = Duration::minutes(config.embargo_minutes);
    let minute = Duration::minutes(1);

    let mut splits = Vec::with_capacity(combos.len());
    for combo in combos {
        let mut test_ranges = Vec::new();
        let mut purge_ranges = Vec::new();
        let mut embargo_ranges = Vec::new();
        let mut test_rows = Vec::new();
        for &b in &combo {
            let (start, end) = block_bounds[b];
            let range = TimeRange {
                start: timestamps[start],
                end: timestamps[end - 1],
            };
            // label windows of the H minutes before the block reach into it
            purge_ranges.push(TimeRange {
                start: range.start - horizon_d,
                end: range.start - minute,
            });
            embargo_ranges.push(TimeRange {
                start: range.end + minute,
                end: range.end + embargo_d,
            });
            test_ranges.push(range);
            test_rows.extend(start..end);
        }

        let in_test = |row: usize| {
            combo
                .iter()
                .any(|&b| row >= block_bounds[b].0 && row < block_bounds[b].1)
        };
        let train_rows: Vec<usize> = (0..n)
            .filter(|&row| {
                if in_test(row) {
                    return false;
                }
                let ts = timestamps[row];
                !purge_ranges.iter().any(|r| r.contains(ts))
                    && !embargo_ranges.iter().any(|r| r.contains(ts))
            })
            .collect();

        splits.push(Split {
            test_blocks: combo,
            test_ranges,
            purge_ranges,
            embargo_ranges,
            train_rows,
            test_rows,
        });
    }
    debug!(
        n_splits = splits.len(),
        n_blocks = config.n_blocks,
        g = config.test_block_count,
        "CPCV splits built"
    );
    Ok(splits)
}

/// Aggregated CPCV report.
#[derive(Debug, Clone, Serialize)]
pub struct CpcvReport {
    pub n_blocks: usize,
    pub test_block_count: usize,
    pub embargo_minutes: i64,
    pub horizon_minutes: i64,
    pub eval_threshold: f64,
    pub n_splits: usize,
    pub splits: Vec<SplitMetrics>,
    pub brier: MetricSummary,
    /// Aggregated over non-degenerate splits only; `n` tells how many.
    pub coverage: MetricSummary,
    pub false_alarms_per_day: MetricSummary,
    /// Mean out-of-fold probability per minute, over every row that appeared
    /// in at least one test set.
    #[serde(skip)]
    pub oof: ProbabilitySeries,
}

/// Fit and score an estimator across every CPCV split.
///
/// Split evaluations are mutually independent; they run sequentially here
/// and are aggregated in deterministic split order.
pub fn run_cpcv<E: ProbabilityEstimator>(
    timeline: &Timeline,
    estimator: &E,
    config: &CpcvConfig,
) -> Result<CpcvReport> {
    let splits = build_splits(timeline, config)?;
    let matrix = timeline.features();
    let labels = timeline.labels();
    let n = timeline.n_rows();

    let mut oof_sum = vec![0.0; n];
    let mut oof_count = vec![0usize; n];
    let mut split_metrics = Vec::with_capacity(splits.len());

    for (split_index, split) in splits.iter().enumerate() {
        if split.train_rows.is_empty() {
            return Err(Error::invalid_parameter(
                "n_blocks",
                format!("split {split_index} has an empty training set"),
            ));
        }
        let x_train: Vec<&[f64]> = split.train_rows.iter().map(|&r| matrix.row(r)).collect();
        let y_train: Vec<bool> = split.train_rows.iter().map(|&r| labels[r]).collect();
        let x_test: Vec<&[f64]> = split.test_rows.iter().map(|&r| matrix.row(r)).collect();

        let model = estimator.fit(&x_train, &y_train)?;
        let predictions = estimator.predict(&model, &x_test);

        let metrics = evaluate_split(
            timeline,
            &labels,
            split_index,
            &split.test_rows,
            &predictions,
            config.eval_threshold,
        )?;
        debug!(
            split = split_index,
            brier = ?metrics.brier,
            coverage = ?metrics.coverage,
            fa_per_day = metrics.false_alarms_per_day,
            "split evaluated"
        );

        for (&row, &p) in split.test_rows.iter().zip(&predictions) {
            oof_sum[row] += p;
            oof_count[row] += 1;
        }
        split_metrics.push(metrics);
    }

    let oof_points: Vec<_> = (0..n)
        .filter(|&row| oof_count[row] > 0)
        .map(|row| {
            (
                matrix.timestamps()[row],
                oof_sum[row] / oof_count[row] as f64,
            )
        })
        .collect();
    let oof = ProbabilitySeries::new(oof_points)?;

    let brier_vals: Vec<f64> = split_metrics.iter().filter_map(|m| m.brier).collect();
    let coverage_vals: Vec<f64> = split_metrics.iter().filter_map(|m| m.coverage).collect();
    let fa_vals: Vec<f64> = split_metrics
        .iter()
        .map(|m| m.false_alarms_per_day)
        .collect();

    let report = CpcvReport {
        n_blocks: config.n_blocks,
        test_block_count: config.test_block_count,
        embargo_minutes: config.embargo_minutes,
        horizon_minutes: timeline.horizon_minutes(),
        eval_threshold: config.eval_threshold,
        n_splits: split_metrics.len(),
        brier: summarize(&brier_vals),
        coverage: summarize(&coverage_vals),
        false_alarms_per_day: summarize(&fa_vals),
        splits: split_metrics,
        oof,
    };
    info!(
        n_splits = report.n_splits,
        brier_mean = ?report.brier.mean,
        coverage_mean = ?report.coverage.mean,
        fa_mean = ?report.false_alarms_per_day.mean,
        "CPCV complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FeatureId;
    use crate::timeline::FeatureMatrix;
    use crate::types::{FlipEvent, TrendState};
    use chrono::{DateTime, TimeZone, Utc};

    fn minute(i: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 1, 0, 0, 0).unwrap() + Duration::minutes(i)
    }

    fn timeline(n: i64, flip_minutes: &[i64], horizon: i64) -> Timeline {
        let index: Vec<_> = (0..n).map(minute).collect();
        let rows: Vec<Vec<f64>> = (0..n).map(|i| vec![((i * 7) % 13) as f64]).collect();
        let matrix = FeatureMatrix::new(index, vec![FeatureId::Ret1m], rows).unwrap();
        let flips = flip_minutes
            .iter()
            .map(|&m| FlipEvent {
                timestamp: minute(m),
                direction: TrendState::Bear,
            })
            .collect();
        Timeline::new(matrix, flips, horizon).unwrap()
    }

    /// Constant-probability estimator for exercising the split machinery.
    struct MockEstimator(f64);

    impl ProbabilityEstimator for MockEstimator {
        type Model = f64;

        fn fit(&self, _features: &[&[f64]], _labels: &[bool]) -> crate::errors::Result<f64> {
            Ok(self.0)
        }

        fn predict(&self, model: &f64, features: &[&[f64]]) -> Vec<f64> {
            vec![*model; features.len()]
        }
    }

    #[test]
    fn test_combinations_counts() {
        assert_eq!(combinations(6, 2).len(), 15);
        assert_eq!(combinations(5, 3).len(), 10);
        assert_eq!(combinations(4, 1), vec![vec![0], vec![1], vec![2], vec![3]]);
        // lexicographic order
        let c = combinations(4, 2);
        assert_eq!(c.first(), Some(&vec![0, 1]));
        assert_eq!(c.last(), Some(&vec![2, 3]));
    }

    #[test]
    fn test_embargo_shorter_than_horizon_rejected_up_front() {
        let tl = timeline(2000, &[1000], 120);
        let cfg = CpcvConfig {
            embargo_minutes: 60,
            ..CpcvConfig::default()
        };
        assert!(matches!(
            build_splits(&tl, &cfg).unwrap_err(),
            Error::EmbargoShorterThanHorizon {
                embargo_minutes: 60,
                horizon_minutes: 120,
            }
        ));
    }

    #[test]
    fn test_split_count_and_cap() {
        let tl = timeline(3000, &[1500], 60);
        let cfg = CpcvConfig {
            embargo_minutes: 120,
            ..CpcvConfig::default()
        };
        assert_eq!(build_splits(&tl, &cfg).unwrap().len(), 15);

        let capped = CpcvConfig {
            embargo_minutes: 120,
            max_combinations: Some(10),
            ..CpcvConfig::default()
        };
        let splits = build_splits(&tl, &capped).unwrap();
        assert_eq!(splits.len(), 10);
        // the last combination survives the cap
        assert_eq!(splits.last().unwrap().test_blocks, vec![4, 5]);
    }

    #[test]
    fn test_no_training_row_inside_leakage_buffers() {
        // exhaustive interval-overlap check over every split
        let tl = timeline(3000, &[700, 1900], 90);
        let cfg = CpcvConfig {
            embargo_minutes: 150,
            ..CpcvConfig::default()
        };
        let horizon = Duration::minutes(90);
        let embargo = Duration::minutes(150);
        let timestamps = tl.features().timestamps();
        for split in build_splits(&tl, &cfg).unwrap() {
            for &row in &split.train_rows {
                let ts = timestamps[row];
                for range in &split.test_ranges {
                    // the training row's label window (t, t+H] must not reach
                    // the test block, and the row must clear the embargo
                    assert!(
                        ts + horizon < range.start || ts > range.end + embargo,
                        "train row {ts} leaks into test range {range:?}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_train_and_test_rows_disjoint_and_sorted() {
        let tl = timeline(3000, &[1500], 60);
        let cfg = CpcvConfig {
            embargo_minutes: 120,
            ..CpcvConfig::default()
        };
        for split in build_splits(&tl, &cfg).unwrap() {
            assert!(split.test_rows.windows(2).all(|w| w[0] < w[1]));
            assert!(split.train_rows.windows(2).all(|w| w[0] < w[1]));
            for row in &split.train_rows {
                assert!(!split.test_rows.contains(row));
            }
        }
    }

    #[test]
    fn test_flip_far_from_test_rows_not_in_denominator() {
        // single flip deep inside block 5: splits testing early blocks must
        // report an undefined coverage, not a miss
        let tl = timeline(3000, &[2700], 60);
        let cfg = CpcvConfig {
            embargo_minutes: 120,
            ..CpcvConfig::default()
        };
        let report = run_cpcv(&tl, &MockEstimator(0.0), &cfg).unwrap();
        // split 0 tests blocks {0, 1}
        let early = &report.splits[0];
        assert_eq!(early.n_eligible_flips, 0);
        assert!(early.coverage.is_none());
        // coverage aggregation only counts splits with eligible flips
        assert!(report.coverage.n < report.n_splits);
    }

    #[test]
    fn test_oof_series_covers_all_rows_with_mean_prediction() {
        let tl = timeline(1200, &[600], 60);
        let cfg = CpcvConfig {
            embargo_minutes: 120,
            ..CpcvConfig::default()
        };
        let report = run_cpcv(&tl, &MockEstimator(0.25), &cfg).unwrap();
        // every block appears in some test combination, so the OOF series
        // spans the whole grid, and a constant estimator stays constant
        assert_eq!(report.oof.len(), 1200);
        assert!(report.oof.iter().all(|(_, p)| (p - 0.25).abs() < 1e-12));
        assert_eq!(report.n_splits, 15);
    }

    #[test]
    fn test_run_is_deterministic() {
        let tl = timeline(1500, &[400, 1100], 60);
        let cfg = CpcvConfig {
            embargo_minutes: 90,
            ..CpcvConfig::default()
        };
        let a = run_cpcv(&tl, &MockEstimator(0.4), &cfg).unwrap();
        let b = run_cpcv(&tl, &MockEstimator(0.4), &cfg).unwrap();
        assert_eq!(a.n_splits, b.n_splits);
        assert_eq!(a.brier, b.brier);
        assert_eq!(a.oof, b.oof);
    }
}
