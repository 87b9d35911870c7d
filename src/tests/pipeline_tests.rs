//! Integration tests for the full signal pipeline.
//!
//! These exercise the components together the way the research flow uses
//! them: ticks → bars → causal features → regime flips → timeline → CPCV →
//! out-of-fold probabilities → gate sweep → alert replay, asserting the
//! pieces agree on determinism, leakage discipline, and parity.

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    use crate::{
        bars_from_ticks, build_macro_regime, build_micro_features, find_flips, run_cpcv,
        run_event_study, select_operating_point, sweep_gate, AlertGate, CpcvConfig, GateParams,
        Hypothesis, LogisticHazard, MicroFeatureConfig, RegimeConfig, StudyConfig, SweepGrid,
        TestStatistic, Tick, Timeline,
    };

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap()
    }

    /// Four days of ticks whose drift flips sign every 18 hours.
    fn synthetic_ticks(seed: u64) -> Vec<Tick> {
        let mut rng = SmallRng::seed_from_u64(seed);
        let n_minutes = 4 * 24 * 60;
        let mut price = 30_000.0f64;
        let mut ticks = Vec::with_capacity(n_minutes as usize * 2);
        for m in 0..n_minutes {
            let regime = (m / (18 * 60)) % 2;
            let drift = if regime == 0 { 6e-4 } else { -6e-4 };
            for s in [13i64, 47] {
                let noise: f64 = rng.gen_range(-1.5e-4..1.5e-4);
                price *= 1.0 + drift / 2.0 + noise;
                ticks.push(Tick {
                    timestamp: start() + Duration::minutes(m) + Duration::seconds(s),
                    price,
                    quantity: 0.1 + rng.gen_range(0.0..2.0),
                    is_buyer_maker: Some(rng.gen_bool(0.5)),
                });
            }
        }
        ticks
    }

    fn feature_config() -> MicroFeatureConfig {
        MicroFeatureConfig {
            vol_z_window: 64,
            bb_window: 20,
            don_window: 30,
            liq_vol_window: 32,
            vov_window: 16,
            vov_of_window: 8,
            acf_window: 32,
        }
    }

    fn regime_config() -> RegimeConfig {
        RegimeConfig {
            macro_bar_minutes: 60,
            lookback_bars: 6,
            r2_min: 0.4,
            hysteresis_bars: 2,
            rv_lookback_bars: 6,
        }
    }

    fn build_timeline(seed: u64) -> Timeline {
        let ticks = synthetic_ticks(seed);
        let bars = bars_from_ticks(&ticks).unwrap();
        let matrix = build_micro_features(&bars, &ticks, &feature_config()).unwrap();
        let macro_bars = build_macro_regime(&bars, &regime_config()).unwrap();
        let flips = find_flips(&macro_bars);
        assert!(
            flips.len() >= 2,
            "synthetic drift schedule must produce regime flips, got {}",
            flips.len()
        );
        Timeline::new(matrix, flips, 120).unwrap()
    }

    #[test]
    fn test_full_pipeline_runs_and_is_deterministic() {
        let timeline = build_timeline(7);
        let estimator = LogisticHazard {
            max_iter: 30,
            ..LogisticHazard::default()
        };
        let cfg = CpcvConfig {
            n_blocks: 4,
            test_block_count: 1,
            embargo_minutes: 180,
            max_combinations: None,
            eval_threshold: 0.35,
        };

        let a = run_cpcv(&timeline, &estimator, &cfg).unwrap();
        let b = run_cpcv(&timeline, &estimator, &cfg).unwrap();

        assert_eq!(a.n_splits, 4);
        assert_eq!(a.oof, b.oof, "CPCV must be bit-for-bit reproducible");
        assert_eq!(a.brier, b.brier);

        // every split carries its sample sizes
        for m in &a.splits {
            assert!(m.n_test_rows > 0);
            assert!(m.brier.is_some());
            if let Some(c) = m.coverage {
                assert!((0.0..=1.0).contains(&c));
                assert!(m.n_eligible_flips > 0);
            } else {
                assert_eq!(m.n_eligible_flips, 0);
            }
            assert!(m.false_alarms_per_day >= 0.0);
        }

        // the aggregated coverage sample count never exceeds the split count
        assert!(a.coverage.n <= a.n_splits);
    }

    #[test]
    fn test_event_study_on_detected_flips_reports_sample_sizes() {
        let timeline = build_timeline(11);
        let cfg = StudyConfig {
            lags: vec![-60, -30, -10],
            permutations: 99,
            min_events: 5,
            statistic: TestStatistic::RankSum,
            baseline_exclusion_minutes: 120,
            preregistered: vec![Hypothesis {
                feature: crate::FeatureId::BbWidthPct,
                lag_minutes: -30,
            }],
            ..StudyConfig::default()
        };
        let report = run_event_study(&timeline, &cfg).unwrap();
        assert_eq!(
            report.n_hypotheses,
            timeline.features().n_columns() * 3,
            "one result per (feature, lag), none silently dropped"
        );
        for r in &report.results {
            // every result exposes the sample size behind it
            assert!(r.n_events <= report.n_flips);
        }
        // identical rerun, identical results
        let again = run_event_study(&timeline, &cfg).unwrap();
        assert_eq!(report.results, again.results);
    }

    #[test]
    fn test_oof_series_sweep_and_gate_parity() {
        let timeline = build_timeline(23);
        let estimator = LogisticHazard {
            max_iter: 30,
            ..LogisticHazard::default()
        };
        let cfg = CpcvConfig {
            n_blocks: 4,
            test_block_count: 1,
            embargo_minutes: 180,
            max_combinations: None,
            eval_threshold: 0.35,
        };
        let report = run_cpcv(&timeline, &estimator, &cfg).unwrap();
        assert!(!report.oof.is_empty());

        // sweep the out-of-fold series against the detected flips
        let grid = SweepGrid {
            thresholds: vec![0.3, 0.4, 0.5, 0.6],
            ema_windows: vec![1, 3],
            consecutive_ks: vec![1, 2],
            separations_minutes: vec![30],
        };
        let rows = sweep_gate(
            &report.oof,
            timeline.flips(),
            timeline.horizon_minutes(),
            &grid,
        )
        .unwrap();
        assert_eq!(rows.len(), 4 * 2 * 2);
        for row in &rows {
            if let Some(c) = row.coverage {
                assert!((0.0..=1.0).contains(&c));
            }
            assert!(row.false_alarms_per_day >= 0.0);
            assert!(row.n_true_positives <= row.n_alerts);
        }

        // when a point qualifies, replaying it reproduces the swept counts
        if let Some(op) = select_operating_point(&rows, 10.0) {
            let alerts = AlertGate::replay(op.params(), &report.oof).unwrap();
            assert_eq!(alerts.len(), op.n_alerts);
        }

        // offline/online parity on the real out-of-fold stream
        let params = GateParams::default();
        let batch = AlertGate::replay(params, &report.oof).unwrap();
        let mut gate = AlertGate::new(params).unwrap();
        let mut live = Vec::new();
        for (ts, p) in report.oof.iter() {
            if let Some(alert) = gate.step(ts, p).unwrap() {
                live.push(alert);
            }
        }
        assert_eq!(batch, live);
    }

    #[test]
    fn test_embargo_violation_is_rejected_before_fitting() {
        let timeline = build_timeline(31);
        let cfg = CpcvConfig {
            n_blocks: 4,
            test_block_count: 1,
            embargo_minutes: 60, // shorter than the 120-minute horizon
            max_combinations: None,
            eval_threshold: 0.35,
        };
        let err = run_cpcv(&timeline, &LogisticHazard::default(), &cfg).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::EmbargoShorterThanHorizon {
                embargo_minutes: 60,
                horizon_minutes: 120,
            }
        ));
    }
}
