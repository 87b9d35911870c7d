//! Alert gating state machine.
//!
//! Converts a noisy per-minute probability stream into discrete, rate-limited
//! alerts. One [`AlertGate::step`] operation drives both execution modes: the
//! batch replay iterates it over a finite series, the live path calls it once
//! per incoming sample. Replaying a series therefore reproduces the live
//! alert stream byte for byte, which is the offline/online parity guarantee.
//!
//! Transition rule per `(timestamp, probability)` sample, in time order:
//! 1. EMA update with `alpha = 2 / (ema_window + 1)`, seeded with the first
//!    observation; a window of 1 disables smoothing.
//! 2. `ema > threshold` increments the consecutive counter, else resets it.
//! 3. In `Cooldown`, re-arm once `now - last_alert >= min_separation`.
//! 4. Fire iff `Armed` and the counter reaches `consecutive_k`; firing emits
//!    the smoothed probability, starts the cooldown, and resets the counter.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{Error, Result};
use crate::stats;
use crate::types::{Alert, FlipEvent, ProbabilitySeries};

/// One gate operating point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GateParams {
    /// EMA window in minutes; 1 disables smoothing.
    pub ema_window: u32,
    /// Smoothed-probability threshold.
    pub threshold: f64,
    /// Consecutive above-threshold minutes required to fire.
    pub consecutive_k: u32,
    /// Cooldown between alerts, minutes.
    pub min_separation_minutes: i64,
}

impl Default for GateParams {
    fn default() -> Self {
        // the research operating point
        Self {
            ema_window: 3,
            threshold: 0.558,
            consecutive_k: 2,
            min_separation_minutes: 60,
        }
    }
}

impl GateParams {
    pub fn validate(&self) -> Result<()> {
        if self.ema_window == 0 {
            return Err(Error::invalid_parameter("ema_window", "must be >= 1"));
        }
        if !self.threshold.is_finite() || !(0.0..=1.0).contains(&self.threshold) {
            return Err(Error::invalid_parameter(
                "threshold",
                format!("must be a probability, got {}", self.threshold),
            ));
        }
        if self.consecutive_k == 0 {
            return Err(Error::invalid_parameter("consecutive_k", "must be >= 1"));
        }
        if self.min_separation_minutes < 0 {
            return Err(Error::invalid_parameter(
                "min_separation_minutes",
                "must be >= 0",
            ));
        }
        Ok(())
    }
}

/// Gate FSM state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    /// Eligible to fire.
    Armed,
    /// Recently fired; waiting out the minimum separation.
    Cooldown,
}

/// Deterministic, order-sensitive alert gate.
#[derive(Debug, Clone)]
pub struct AlertGate {
    params: GateParams,
    state: GateState,
    ema: Option<f64>,
    consecutive: u32,
    last_alert: Option<DateTime<Utc>>,
    last_ts: Option<DateTime<Utc>>,
}

impl AlertGate {
    pub fn new(params: GateParams) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            params,
            state: GateState::Armed,
            ema: None,
            consecutive: 0,
            last_alert: None,
            last_ts: None,
        })
    }

    pub fn params(&self) -> &GateParams {
        &self.params
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    /// Smoothed probability after the last step, if any sample was seen.
    pub fn ema(&self) -> Option<f64> {
        self.ema
    }

    /// Forget all history, keeping the parameters.
    pub fn reset(&mut self) {
        self.state = GateState::Armed;
        self.ema = None;
        self.consecutive = 0;
        self.last_alert = None;
        self.last_ts = None;
    }

    /// Advance the gate by one sample.
    ///
    /// This is the single transition function behind both batch and live
    /// execution. Samples must arrive in strictly increasing time order and
    /// carry a valid probability; violations abort.
    pub fn step(&mut self, timestamp: DateTime<Utc>, probability: f64) -> Result<Option<Alert>> {
        if let Some(prev) = self.last_ts {
            if timestamp <= prev {
                return Err(Error::NonMonotonicTimestamps {
                    context: "alert gate",
                    prev,
                    at: timestamp,
                });
            }
        }
        if !probability.is_finite() || !(0.0..=1.0).contains(&probability) {
            return Err(Error::InvalidProbability {
                at: timestamp,
                value: probability,
            });
        }
        self.last_ts = Some(timestamp);

        // 1. exponential smoothing
        let alpha = 2.0 / (self.params.ema_window as f64 + 1.0);
        let ema = match self.ema {
            Some(prev) => prev + alpha * (probability - prev),
            None => probability,
        };
        self.ema = Some(ema);

        // 2. sustained-confidence counter
        if ema > self.params.threshold {
            self.consecutive += 1;
        } else {
            self.consecutive = 0;
        }

        // 3. re-arm after the separation has elapsed
        if self.state == GateState::Cooldown {
            let since_alert = self
                .last_alert
                .map(|t| timestamp - t)
                .unwrap_or_else(Duration::zero);
            if since_alert >= Duration::minutes(self.params.min_separation_minutes) {
                self.state = GateState::Armed;
            }
        }

        // 4. fire
        if self.state == GateState::Armed && self.consecutive >= self.params.consecutive_k {
            self.last_alert = Some(timestamp);
            self.state = GateState::Cooldown;
            self.consecutive = 0;
            debug!(at = %timestamp, ema, "alert fired");
            return Ok(Some(Alert {
                fire_timestamp: timestamp,
                triggering_probability: ema,
            }));
        }
        Ok(None)
    }

    /// Batch replay: run a fresh gate over a full series.
    ///
    /// Iterates the same [`step`](Self::step) the live path uses, so the
    /// result is identical to feeding the samples in one at a time.
    pub fn replay(params: GateParams, series: &ProbabilitySeries) -> Result<Vec<Alert>> {
        let mut gate = AlertGate::new(params)?;
        let mut alerts = Vec::new();
        for (ts, p) in series.iter() {
            if let Some(alert) = gate.step(ts, p)? {
                alerts.push(alert);
            }
        }
        Ok(alerts)
    }
}

/// Lead-time distribution over covered flips, minutes.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct LeadTimeStats {
    pub n: usize,
    pub mean: Option<f64>,
    pub p25: Option<f64>,
    pub p50: Option<f64>,
    pub p75: Option<f64>,
    pub p90: Option<f64>,
    pub max: Option<f64>,
}

impl LeadTimeStats {
    fn from_samples(lead_minutes: &[f64]) -> Self {
        Self {
            n: lead_minutes.len(),
            mean: stats::mean(lead_minutes),
            p25: stats::percentile(lead_minutes, 0.25),
            p50: stats::percentile(lead_minutes, 0.50),
            p75: stats::percentile(lead_minutes, 0.75),
            p90: stats::percentile(lead_minutes, 0.90),
            max: stats::percentile(lead_minutes, 1.0),
        }
    }
}

/// Coverage / false-alarm / lead-time scorecard for an alert stream.
#[derive(Debug, Clone, Serialize)]
pub struct GateEvaluation {
    pub n_flips: usize,
    pub n_covered: usize,
    /// `None` when there are no flips to cover.
    pub coverage: Option<f64>,
    pub n_alerts: usize,
    pub n_false_alarms: usize,
    pub elapsed_days: f64,
    pub false_alarms_per_day: f64,
    pub lead_time_minutes: LeadTimeStats,
}

/// Score alerts against ground-truth flips.
///
/// A flip is covered by an alert in `[flip - H, flip]`; its lead time is
/// measured to the earliest such alert. An alert is a false alarm when no
/// flip lies in `[alert, alert + H)`. The elapsed span comes from the
/// probability series the alerts were produced from.
pub fn evaluate_alerts(
    alerts: &[Alert],
    flips: &[FlipEvent],
    horizon_minutes: i64,
    series: &ProbabilitySeries,
) -> Result<GateEvaluation> {
    if horizon_minutes <= 0 {
        return Err(Error::invalid_parameter(
            "horizon_minutes",
            "must be positive",
        ));
    }
    let horizon = Duration::minutes(horizon_minutes);

    let mut n_covered = 0usize;
    let mut leads = Vec::new();
    for flip in flips {
        let earliest = alerts
            .iter()
            .map(|a| a.fire_timestamp)
            .find(|&ts| flip.timestamp - horizon <= ts && ts <= flip.timestamp);
        if let Some(first_alert) = earliest {
            n_covered += 1;
            leads.push((flip.timestamp - first_alert).num_minutes() as f64);
        }
    }

    let mut n_false_alarms = 0usize;
    for alert in alerts {
        let attributable = flips.iter().any(|f| {
            f.timestamp >= alert.fire_timestamp && f.timestamp - alert.fire_timestamp < horizon
        });
        if !attributable {
            n_false_alarms += 1;
        }
    }

    let elapsed_days = series.span_days();
    Ok(GateEvaluation {
        n_flips: flips.len(),
        n_covered,
        coverage: if flips.is_empty() {
            None
        } else {
            Some(n_covered as f64 / flips.len() as f64)
        },
        n_alerts: alerts.len(),
        n_false_alarms,
        elapsed_days,
        false_alarms_per_day: if elapsed_days > 0.0 {
            n_false_alarms as f64 / elapsed_days
        } else {
            0.0
        },
        lead_time_minutes: LeadTimeStats::from_samples(&leads),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TrendState;
    use chrono::TimeZone;

    fn minute(i: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap() + Duration::minutes(i)
    }

    fn series(probs: &[f64]) -> ProbabilitySeries {
        ProbabilitySeries::new(
            probs
                .iter()
                .enumerate()
                .map(|(i, &p)| (minute(i as i64), p))
                .collect(),
        )
        .unwrap()
    }

    fn reference_params() -> GateParams {
        GateParams {
            ema_window: 3,
            threshold: 0.558,
            consecutive_k: 2,
            min_separation_minutes: 2,
        }
    }

    #[test]
    fn test_reference_sequence_fires_exactly_once() {
        // EMA (alpha = 0.5): 0.2, 0.4, 0.55, 0.6, 0.45, 0.675, 0.8125;
        // the counter reaches 2 only at the final sample.
        let s = series(&[0.2, 0.6, 0.7, 0.65, 0.3, 0.9, 0.95]);
        let alerts = AlertGate::replay(reference_params(), &s).unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].fire_timestamp, minute(6));
        assert!((alerts[0].triggering_probability - 0.8125).abs() < 1e-12);
    }

    #[test]
    fn test_batch_and_incremental_parity() {
        let probs: Vec<f64> = (0..500)
            .map(|i| (((i * 7919) % 1000) as f64 / 999.0).clamp(0.0, 1.0))
            .collect();
        let s = series(&probs);

        let batch = AlertGate::replay(reference_params(), &s).unwrap();

        let mut gate = AlertGate::new(reference_params()).unwrap();
        let mut incremental = Vec::new();
        for (ts, p) in s.iter() {
            if let Some(a) = gate.step(ts, p).unwrap() {
                incremental.push(a);
            }
        }
        assert_eq!(batch, incremental);
        assert!(!batch.is_empty());
    }

    #[test]
    fn test_min_separation_enforced() {
        // constant high probability: without separation it would fire at
        // every k-th minute
        let s = series(&[0.9; 30]);
        let params = GateParams {
            ema_window: 1,
            threshold: 0.5,
            consecutive_k: 2,
            min_separation_minutes: 10,
        };
        let alerts = AlertGate::replay(params, &s).unwrap();
        for pair in alerts.windows(2) {
            let gap = pair[1].fire_timestamp - pair[0].fire_timestamp;
            assert!(gap >= Duration::minutes(10));
        }
        assert!(alerts.len() >= 2);
    }

    #[test]
    fn test_requires_sustained_confidence() {
        // single-minute spikes never satisfy k = 3
        let mut probs = vec![0.1; 40];
        probs[10] = 0.99;
        probs[20] = 0.99;
        let s = series(&probs);
        let params = GateParams {
            ema_window: 1,
            threshold: 0.5,
            consecutive_k: 3,
            min_separation_minutes: 0,
        };
        assert!(AlertGate::replay(params, &s).unwrap().is_empty());
    }

    #[test]
    fn test_ema_window_one_disables_smoothing() {
        let mut gate = AlertGate::new(GateParams {
            ema_window: 1,
            threshold: 0.5,
            consecutive_k: 1,
            min_separation_minutes: 0,
        })
        .unwrap();
        gate.step(minute(0), 0.3).unwrap();
        assert_eq!(gate.ema(), Some(0.3));
        gate.step(minute(1), 0.8).unwrap();
        assert_eq!(gate.ema(), Some(0.8));
    }

    #[test]
    fn test_non_monotonic_timestamp_aborts() {
        let mut gate = AlertGate::new(reference_params()).unwrap();
        gate.step(minute(5), 0.4).unwrap();
        let err = gate.step(minute(5), 0.4).unwrap_err();
        assert!(matches!(err, Error::NonMonotonicTimestamps { .. }));
    }

    #[test]
    fn test_invalid_probability_aborts() {
        let mut gate = AlertGate::new(reference_params()).unwrap();
        assert!(matches!(
            gate.step(minute(0), 1.5).unwrap_err(),
            Error::InvalidProbability { .. }
        ));
        assert!(gate.step(minute(1), f64::NAN).is_err());
    }

    #[test]
    fn test_invalid_params_rejected() {
        assert!(AlertGate::new(GateParams {
            ema_window: 0,
            ..GateParams::default()
        })
        .is_err());
        assert!(AlertGate::new(GateParams {
            threshold: 1.5,
            ..GateParams::default()
        })
        .is_err());
        assert!(AlertGate::new(GateParams {
            consecutive_k: 0,
            ..GateParams::default()
        })
        .is_err());
        assert!(AlertGate::new(GateParams {
            min_separation_minutes: -1,
            ..GateParams::default()
        })
        .is_err());
    }

    #[test]
    fn test_reset_restores_initial_state() {
        let mut gate = AlertGate::new(reference_params()).unwrap();
        gate.step(minute(0), 0.9).unwrap();
        gate.reset();
        assert_eq!(gate.state(), GateState::Armed);
        assert!(gate.ema().is_none());
        // after reset, earlier timestamps are legal again
        assert!(gate.step(minute(0), 0.5).is_ok());
    }

    #[test]
    fn test_evaluate_alerts_coverage_and_lead_time() {
        let flips = vec![
            FlipEvent {
                timestamp: minute(100),
                direction: TrendState::Bull,
            },
            FlipEvent {
                timestamp: minute(300),
                direction: TrendState::Bear,
            },
        ];
        let alerts = vec![
            Alert {
                fire_timestamp: minute(80), // 20 min lead on flip @100
                triggering_probability: 0.7,
            },
            Alert {
                fire_timestamp: minute(150), // false alarm
                triggering_probability: 0.6,
            },
        ];
        let s = series(&vec![0.1; 400]);
        let eval = evaluate_alerts(&alerts, &flips, 30, &s).unwrap();
        assert_eq!(eval.n_covered, 1);
        assert_eq!(eval.coverage, Some(0.5));
        assert_eq!(eval.n_false_alarms, 1);
        assert_eq!(eval.lead_time_minutes.n, 1);
        assert_eq!(eval.lead_time_minutes.mean, Some(20.0));
        assert!(eval.false_alarms_per_day > 0.0);
    }

    #[test]
    fn test_evaluate_alerts_no_flips_undefined_coverage() {
        let s = series(&vec![0.1; 100]);
        let eval = evaluate_alerts(&[], &[], 30, &s).unwrap();
        assert!(eval.coverage.is_none());
        assert_eq!(eval.n_false_alarms, 0);
    }
}
