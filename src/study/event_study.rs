//! Event-aligned hypothesis testing around regime flips.
//!
//! For each (feature, lag) hypothesis, collects the feature value `lag`
//! minutes before every flip (the pre-flip "signature" sample), compares it
//! against a matched non-event baseline, and scores significance with a
//! seeded permutation test. Benjamini–Hochberg q-values are computed over the
//! full hypothesis set and, independently, over the pre-registered subset;
//! the subset-scope q-value is the gating criterion.

use chrono::Duration;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::{Error, Result};
use crate::schema::FeatureId;
use crate::stats;
use crate::study::fdr::bh_qvalues;
use crate::study::permutation::{mix_seed, permutation_test, Tail, TestStatistic};
use crate::timeline::Timeline;

/// Newey–West truncation lag for the signature t-stat diagnostic.
const NW_LAG: usize = 5;

/// One (feature, lag) hypothesis. `lag_minutes` is negative: minutes before
/// the flip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hypothesis {
    pub feature: FeatureId,
    pub lag_minutes: i64,
}

/// Event-study configuration.
///
/// The pre-registered subset must be declared before results are seen; it is
/// validated against the full hypothesis set, never inferred from
/// significance.
#[derive(Debug, Clone)]
pub struct StudyConfig {
    /// Pre-flip lags in minutes, all negative.
    pub lags: Vec<i64>,
    /// Permutation draws per hypothesis.
    pub permutations: usize,
    /// Master seed; per-hypothesis seeds are derived from it.
    pub seed: u64,
    /// Minimum aligned events for a conclusive test.
    pub min_events: usize,
    /// Signature statistic.
    pub statistic: TestStatistic,
    /// Test sidedness.
    pub tail: Tail,
    /// Baseline anchors drawn per event.
    pub baseline_per_event: usize,
    /// Minimum distance (minutes) between a baseline anchor and any flip.
    pub baseline_exclusion_minutes: i64,
    /// FDR threshold for declaring a validated signal (subset scope).
    pub fdr_threshold: f64,
    /// Pre-registered hypotheses (subset correction scope).
    pub preregistered: Vec<Hypothesis>,
}

impl Default for StudyConfig {
    fn default() -> Self {
        Self {
            lags: vec![-720, -480, -360, -240, -180, -120, -60, -30, -15, -5],
            permutations: 500,
            seed: 123,
            min_events: 20,
            statistic: TestStatistic::MeanShift,
            tail: Tail::TwoSided,
            baseline_per_event: 4,
            baseline_exclusion_minutes: 360,
            fdr_threshold: 0.10,
            preregistered: Vec::new(),
        }
    }
}

impl StudyConfig {
    fn validate(&self, timeline: &Timeline) -> Result<Vec<i64>> {
        if self.lags.is_empty() {
            return Err(Error::EmptyInput { context: "lags" });
        }
        let mut lags = self.lags.clone();
        lags.sort_unstable();
        lags.dedup();
        if lags.iter().any(|&l| l >= 0) {
            return Err(Error::invalid_parameter(
                "lags",
                "all lags must be negative (minutes before the flip)",
            ));
        }
        if self.permutations == 0 {
            return Err(Error::invalid_parameter("permutations", "must be positive"));
        }
        if self.min_events == 0 {
            return Err(Error::invalid_parameter("min_events", "must be positive"));
        }
        if self.baseline_per_event == 0 {
            return Err(Error::invalid_parameter(
                "baseline_per_event",
                "must be positive",
            ));
        }
        if !(0.0 < self.fdr_threshold && self.fdr_threshold < 1.0) {
            return Err(Error::invalid_parameter(
                "fdr_threshold",
                "must be in (0, 1)",
            ));
        }
        for h in &self.preregistered {
            timeline.features().column_index(h.feature)?;
            if !lags.contains(&h.lag_minutes) {
                return Err(Error::invalid_parameter(
                    "preregistered",
                    format!(
                        "hypothesis ({}, {}) is not part of the studied lag set",
                        h.feature, h.lag_minutes
                    ),
                ));
            }
        }
        Ok(lags)
    }
}

/// Why a hypothesis could not be tested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InconclusiveReason {
    /// Fewer aligned events than `min_events`.
    TooFewEvents { required: usize, actual: usize },
    /// No timeline minutes far enough from every flip to serve as baseline.
    NoBaselineAnchors,
}

/// Outcome of one hypothesis test.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TestOutcome {
    Conclusive {
        /// Observed signature statistic (event vs baseline).
        statistic: f64,
        /// Newey–West standardized t diagnostic, when defined.
        nw_t_stat: Option<f64>,
        /// Permutation p-value, in (0, 1].
        p_value: f64,
        /// BH q-value over the full hypothesis set.
        q_value_global: f64,
        /// BH q-value over the pre-registered subset; `None` outside it.
        q_value_subset: Option<f64>,
    },
    Inconclusive { reason: InconclusiveReason },
}

/// Immutable per-hypothesis result for a given run seed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TestResult {
    pub hypothesis: Hypothesis,
    /// Aligned event sample size behind the test.
    pub n_events: usize,
    pub outcome: TestOutcome,
}

impl TestResult {
    /// Validated signal: conclusive and subset-scope q at or below threshold.
    pub fn is_validated(&self, threshold: f64) -> bool {
        matches!(
            self.outcome,
            TestOutcome::Conclusive {
                q_value_subset: Some(q),
                ..
            } if q <= threshold
        )
    }
}

/// Full event-study report.
#[derive(Debug, Clone, Serialize)]
pub struct StudyReport {
    pub results: Vec<TestResult>,
    /// Flip events on the timeline.
    pub n_flips: usize,
    /// Hypotheses in the full correction scope.
    pub n_hypotheses: usize,
    pub n_conclusive: usize,
    pub fdr_threshold: f64,
    pub seed: u64,
}

impl StudyReport {
    /// Results whose pre-registered-scope q-value clears the threshold.
    pub fn validated_signals(&self) -> Vec<&TestResult> {
        self.results
            .iter()
            .filter(|r| r.is_validated(self.fdr_threshold))
            .collect()
    }

    /// Look up the result for a specific hypothesis.
    pub fn result_for(&self, hypothesis: &Hypothesis) -> Option<&TestResult> {
        self.results.iter().find(|r| r.hypothesis == *hypothesis)
    }
}

/// Stable identity hash of a hypothesis (FNV-1a over name and lag).
fn hypothesis_salt(h: &Hypothesis) -> u64 {
    let mut hash: u64 = 0xCBF2_9CE4_8422_2325;
    for byte in h
        .feature
        .as_str()
        .as_bytes()
        .iter()
        .chain(&h.lag_minutes.to_le_bytes())
    {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01B3);
    }
    hash
}

/// Run the event study over the full feature × lag cross product.
///
/// Deterministic for a fixed seed and identical inputs: each hypothesis gets
/// its own derived seed, so results do not depend on execution order.
pub fn run_event_study(timeline: &Timeline, config: &StudyConfig) -> Result<StudyReport> {
    let lags = config.validate(timeline)?;
    let matrix = timeline.features();
    if matrix.is_empty() {
        return Err(Error::EmptyInput {
            context: "feature matrix",
        });
    }

    // Baseline-eligible rows: far from every flip.
    let exclusion = Duration::minutes(config.baseline_exclusion_minutes);
    let flips = timeline.flips();
    let eligible: Vec<usize> = matrix
        .timestamps()
        .iter()
        .enumerate()
        .filter(|&(_, &ts)| {
            let idx = flips.partition_point(|f| f.timestamp < ts);
            let near_next = flips.get(idx).is_some_and(|f| f.timestamp - ts < exclusion);
            let near_prev = idx > 0 && ts - flips[idx - 1].timestamp < exclusion;
            !(near_next || near_prev)
        })
        .map(|(i, _)| i)
        .collect();

    // (hypothesis, n_events, observed statistic, NW t diagnostic, p-value)
    let mut raw: Vec<(Hypothesis, usize, f64, Option<f64>, f64)> = Vec::new();
    let mut inconclusive: Vec<(Hypothesis, usize, InconclusiveReason)> = Vec::new();

    for &feature in matrix.columns() {
        let col = matrix.column_index(feature)?;
        for &lag in &lags {
            let hypothesis = Hypothesis {
                feature,
                lag_minutes: lag,
            };

            // Signature sample: one scalar per flip with that minute present.
            let events: Vec<f64> = flips
                .iter()
                .filter_map(|f| matrix.value_at(f.timestamp + Duration::minutes(lag), col))
                .collect();

            if events.len() < config.min_events {
                inconclusive.push((
                    hypothesis,
                    events.len(),
                    InconclusiveReason::TooFewEvents {
                        required: config.min_events,
                        actual: events.len(),
                    },
                ));
                continue;
            }
            if eligible.is_empty() {
                inconclusive.push((
                    hypothesis,
                    events.len(),
                    InconclusiveReason::NoBaselineAnchors,
                ));
                continue;
            }

            let salt = hypothesis_salt(&hypothesis);
            let baseline = draw_baseline(
                matrix,
                col,
                &eligible,
                config.baseline_per_event * events.len(),
                mix_seed(config.seed, salt ^ 0xBA5E),
            );

            let outcome = permutation_test(
                &events,
                &baseline,
                config.statistic,
                config.tail,
                config.permutations,
                mix_seed(config.seed, salt),
            )?;

            // Serial-correlation-robust t diagnostic for the mean deviation
            // of the signature sample from the baseline level.
            let base_mean = stats::mean(&baseline).unwrap_or(0.0);
            let deviations: Vec<f64> = events.iter().map(|e| e - base_mean).collect();
            let nw_t = stats::newey_west_variance(&deviations, NW_LAG).and_then(|var| {
                if var > 0.0 {
                    let se = (var / deviations.len() as f64).sqrt();
                    stats::mean(&deviations).map(|m| m / se)
                } else {
                    None
                }
            });

            raw.push((hypothesis, events.len(), outcome.observed, nw_t, outcome.p_value));
        }
    }

    // FDR over the full scope, then independently over the subset scope.
    let p_global: Vec<f64> = raw.iter().map(|&(_, _, _, _, p)| p).collect();
    let q_global = bh_qvalues(&p_global);

    let subset_positions: Vec<usize> = raw
        .iter()
        .enumerate()
        .filter(|(_, (h, _, _, _, _))| config.preregistered.contains(h))
        .map(|(i, _)| i)
        .collect();
    let p_subset: Vec<f64> = subset_positions.iter().map(|&i| raw[i].4).collect();
    let q_subset = bh_qvalues(&p_subset);

    let mut results = Vec::with_capacity(raw.len() + inconclusive.len());
    for (rank, &(hypothesis, n_events, statistic, nw_t_stat, p_value)) in raw.iter().enumerate() {
        let q_s = subset_positions
            .iter()
            .position(|&i| i == rank)
            .map(|pos| q_subset[pos]);
        results.push(TestResult {
            hypothesis,
            n_events,
            outcome: TestOutcome::Conclusive {
                statistic,
                nw_t_stat,
                p_value,
                q_value_global: q_global[rank],
                q_value_subset: q_s,
            },
        });
    }
    for (hypothesis, n_events, reason) in inconclusive {
        results.push(TestResult {
            hypothesis,
            n_events,
            outcome: TestOutcome::Inconclusive { reason },
        });
    }
    // Deterministic ordering: feature-major, then lag.
    results.sort_by(|a, b| {
        (a.hypothesis.feature, a.hypothesis.lag_minutes)
            .cmp(&(b.hypothesis.feature, b.hypothesis.lag_minutes))
    });

    let n_conclusive = p_global.len();
    let report = StudyReport {
        n_flips: flips.len(),
        n_hypotheses: results.len(),
        n_conclusive,
        fdr_threshold: config.fdr_threshold,
        seed: config.seed,
        results,
    };
    info!(
        hypotheses = report.n_hypotheses,
        conclusive = report.n_conclusive,
        validated = report.validated_signals().len(),
        flips = report.n_flips,
        "event study complete"
    );
    Ok(report)
}

/// Draw baseline anchors deterministically from the eligible rows.
///
/// Without replacement when enough anchors exist, with replacement otherwise.
fn draw_baseline(
    matrix: &crate::timeline::FeatureMatrix,
    col: usize,
    eligible: &[usize],
    target: usize,
    seed: u64,
) -> Vec<f64> {
    let mut rng = SmallRng::seed_from_u64(seed);
    if eligible.len() >= target {
        // partial Fisher–Yates: the first `target` positions of a shuffle
        let mut pool: Vec<usize> = eligible.to_vec();
        for i in 0..target {
            let j = rng.gen_range(i..pool.len());
            pool.swap(i, j);
        }
        pool[..target]
            .iter()
            .map(|&row| matrix.value(row, col))
            .collect()
    } else {
        (0..target)
            .map(|_| {
                let row = eligible[rng.gen_range(0..eligible.len())];
                matrix.value(row, col)
            })
            .collect()
    }
}
