//! Gate parameter sweep and operating-point selection.
//!
//! Replays one out-of-fold probability series through every point of a
//! [`GateParams`] grid, scores each alert stream against the ground-truth
//! flips, and picks the best point under a false-alarm budget: highest
//! coverage first, then fewest false alarms per day, then the lowest
//! threshold. The chosen [`OperatingPoint`] is a flat key-value record, the
//! sole persisted-state contract with the environment.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::{Error, Result};
use crate::gate::{evaluate_alerts, AlertGate, GateParams};
use crate::types::{FlipEvent, ProbabilitySeries};

/// Sweep grid (research defaults from the tuning study).
#[derive(Debug, Clone)]
pub struct SweepGrid {
    pub thresholds: Vec<f64>,
    pub ema_windows: Vec<u32>,
    pub consecutive_ks: Vec<u32>,
    pub separations_minutes: Vec<i64>,
}

impl Default for SweepGrid {
    fn default() -> Self {
        Self {
            // 0.540 to 0.588 in steps of 0.002
            thresholds: (0..25).map(|i| 0.540 + 0.002 * i as f64).collect(),
            ema_windows: vec![1, 3],
            consecutive_ks: vec![1, 2],
            separations_minutes: vec![30, 60],
        }
    }
}

/// One evaluated grid point.
#[derive(Debug, Clone, Serialize)]
pub struct SweepRow {
    pub params: GateParams,
    pub n_alerts: usize,
    pub n_true_positives: usize,
    /// `None` when there are no flips to cover.
    pub coverage: Option<f64>,
    pub false_alarms_per_day: f64,
}

/// The selected operating point, flattened for persistence.
///
/// Round-trips through a flat key-value record (JSON object of scalars) so
/// offline tuning and online deployment share one artifact.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OperatingPoint {
    pub ema_window: u32,
    pub threshold: f64,
    pub consecutive_k: u32,
    pub min_separation_minutes: i64,
    pub coverage: f64,
    pub false_alarms_per_day: f64,
    pub n_alerts: usize,
}

impl OperatingPoint {
    /// Gate parameters of this operating point.
    pub fn params(&self) -> GateParams {
        GateParams {
            ema_window: self.ema_window,
            threshold: self.threshold,
            consecutive_k: self.consecutive_k,
            min_separation_minutes: self.min_separation_minutes,
        }
    }
}

/// Replay the series through every grid point.
///
/// Rows come back in deterministic grid order (threshold-major).
pub fn sweep_gate(
    series: &ProbabilitySeries,
    flips: &[FlipEvent],
    horizon_minutes: i64,
    grid: &SweepGrid,
) -> Result<Vec<SweepRow>> {
    if series.is_empty() {
        return Err(Error::EmptyInput {
            context: "sweep probability series",
        });
    }
    if grid.thresholds.is_empty()
        || grid.ema_windows.is_empty()
        || grid.consecutive_ks.is_empty()
        || grid.separations_minutes.is_empty()
    {
        return Err(Error::EmptyInput {
            context: "sweep grid",
        });
    }

    let mut rows = Vec::new();
    for &threshold in &grid.thresholds {
        for &consecutive_k in &grid.consecutive_ks {
            for &ema_window in &grid.ema_windows {
                for &min_separation_minutes in &grid.separations_minutes {
                    let params = GateParams {
                        ema_window,
                        threshold,
                        consecutive_k,
                        min_separation_minutes,
                    };
                    let alerts = AlertGate::replay(params, series)?;
                    let eval = evaluate_alerts(&alerts, flips, horizon_minutes, series)?;
                    rows.push(SweepRow {
                        params,
                        n_alerts: eval.n_alerts,
                        n_true_positives: eval.n_alerts - eval.n_false_alarms,
                        coverage: eval.coverage,
                        false_alarms_per_day: eval.false_alarms_per_day,
                    });
                }
            }
        }
    }
    info!(points = rows.len(), "gate sweep complete");
    Ok(rows)
}

/// Pick the best operating point under a false-alarm budget.
///
/// Candidates must cover at least one flip and stay within
/// `fa_budget_per_day`; among them, highest coverage wins, ties broken by
/// fewer false alarms, then by the lower threshold. Returns `None` when no
/// point qualifies.
pub fn select_operating_point(rows: &[SweepRow], fa_budget_per_day: f64) -> Option<OperatingPoint> {
    rows.iter()
        .filter(|r| {
            r.false_alarms_per_day <= fa_budget_per_day
                && r.coverage.is_some_and(|c| c > 0.0)
        })
        .min_by(|a, b| {
            let ca = a.coverage.unwrap_or(0.0);
            let cb = b.coverage.unwrap_or(0.0);
            cb.total_cmp(&ca) // coverage descending
                .then(a.false_alarms_per_day.total_cmp(&b.false_alarms_per_day))
                .then(a.params.threshold.total_cmp(&b.params.threshold))
        })
        .map(|r| OperatingPoint {
            ema_window: r.params.ema_window,
            threshold: r.params.threshold,
            consecutive_k: r.params.consecutive_k,
            min_separation_minutes: r.params.min_separation_minutes,
            coverage: r.coverage.unwrap_or(0.0),
            false_alarms_per_day: r.false_alarms_per_day,
            n_alerts: r.n_alerts,
        })
}
