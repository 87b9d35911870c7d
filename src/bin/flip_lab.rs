//! Flip-signal laboratory.
//!
//! A diagnostic binary that exercises the full research pipeline on a
//! synthetic tick stream with injected regime shifts:
//!
//! 1. ticks → 1-minute bars → causal micro features
//! 2. macro regime detection → flip events
//! 3. event study (permutation + FDR) over a small lag grid
//! 4. CPCV fit/evaluation of the logistic hazard estimator
//! 5. gate parameter sweep on the out-of-fold probabilities
//! 6. alert replay at the selected operating point
//!
//! Usage:
//! ```bash
//! cargo run --bin flip_lab -- --minutes 5760 --seed 7 --output report.json
//! ```

use std::fs::File;
use std::io::Write as IoWrite;
use std::path::PathBuf;

use chrono::{DateTime, Duration, TimeZone, Utc};
use clap::Parser;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use flipsig::{
    bars_from_ticks, build_macro_regime, build_micro_features, evaluate_alerts, find_flips,
    run_cpcv, run_event_study, select_operating_point, sweep_gate, Alert, AlertGate, CpcvConfig,
    CpcvReport, FeatureId, GateEvaluation, Hypothesis, LogisticHazard, MicroFeatureConfig,
    OperatingPoint, RegimeConfig, StudyConfig, StudyReport, SweepGrid, TestOutcome, Tick,
    Timeline,
};

#[derive(Parser)]
#[command(name = "flip_lab")]
#[command(version, about = "Synthetic end-to-end run of the flip-signal pipeline", long_about = None)]
struct Cli {
    /// Minutes of synthetic data to generate
    #[arg(long, default_value = "5760")]
    minutes: i64,

    /// Master seed for data generation and permutation draws
    #[arg(long, default_value = "7")]
    seed: u64,

    /// Flip horizon in minutes (label and coverage window)
    #[arg(long, default_value = "180")]
    horizon_minutes: i64,

    /// CPCV embargo in minutes (must be >= horizon)
    #[arg(long, default_value = "240")]
    embargo_minutes: i64,

    /// Permutation draws per hypothesis
    #[arg(long, default_value = "200")]
    permutations: usize,

    /// False-alarm budget per day for operating-point selection
    #[arg(long, default_value = "2.0")]
    fa_budget: f64,

    /// Output file path for the JSON report (stdout when omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Log level: trace, debug, info, warn, error
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Final report of one laboratory run.
#[derive(Serialize)]
struct LabReport {
    minutes: i64,
    seed: u64,
    n_flips: usize,
    study: StudyReport,
    cpcv: CpcvReport,
    operating_point: Option<OperatingPoint>,
    gate_evaluation: Option<GateEvaluation>,
    n_alerts: usize,
    alerts: Vec<Alert>,
}

fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
}

/// Synthesize a tick stream whose drift flips sign every ~18 hours, so the
/// regime detector has genuine transitions to find.
fn synthesize_ticks(minutes: i64, seed: u64) -> Vec<Tick> {
    let mut rng = SmallRng::seed_from_u64(seed);
    let noise = Normal::new(0.0, 1.2e-4).expect("valid normal");
    let mut price = 30_000.0f64;
    let mut ticks = Vec::with_capacity(minutes as usize * 3);
    for m in 0..minutes {
        let regime = (m / (18 * 60)) % 2;
        let drift = if regime == 0 { 5e-4 } else { -5e-4 };
        for s in [7i64, 29, 51] {
            price *= 1.0 + drift / 3.0 + noise.sample(&mut rng);
            ticks.push(Tick {
                timestamp: start_time() + Duration::minutes(m) + Duration::seconds(s),
                price,
                quantity: 0.05 + rng.gen_range(0.0..1.5),
                is_buyer_maker: Some(rng.gen_bool(0.5)),
            });
        }
    }
    ticks
}

fn log_top_results(study: &StudyReport) {
    let mut conclusive: Vec<_> = study
        .results
        .iter()
        .filter_map(|r| match r.outcome {
            TestOutcome::Conclusive {
                statistic,
                p_value,
                q_value_global,
                ..
            } => Some((r.hypothesis, statistic, p_value, q_value_global)),
            TestOutcome::Inconclusive { .. } => None,
        })
        .collect();
    conclusive.sort_by(|a, b| a.2.total_cmp(&b.2));
    for &(hypothesis, statistic, p, q) in conclusive.iter().take(5) {
        info!(
            feature = %hypothesis.feature,
            lag = hypothesis.lag_minutes,
            statistic,
            p_value = p,
            q_global = q,
            "top signature"
        );
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log_level)?)
        .init();

    info!(minutes = cli.minutes, seed = cli.seed, "generating synthetic ticks");
    let ticks = synthesize_ticks(cli.minutes, cli.seed);
    let bars = bars_from_ticks(&ticks)?;
    info!(bars = bars.len(), "aggregated 1-minute bars");

    let matrix = build_micro_features(&bars, &ticks, &MicroFeatureConfig::default())?;
    info!(
        rows = matrix.n_rows(),
        columns = matrix.n_columns(),
        "causal feature matrix built"
    );

    let regime_cfg = RegimeConfig {
        macro_bar_minutes: 60,
        lookback_bars: 8,
        ..RegimeConfig::default()
    };
    let macro_bars = build_macro_regime(&bars, &regime_cfg)?;
    let flips = find_flips(&macro_bars);
    info!(flips = flips.len(), "regime flips detected");

    let timeline = Timeline::new(matrix, flips, cli.horizon_minutes)?;

    // --- signal validation ------------------------------------------------
    let study_cfg = StudyConfig {
        lags: vec![-240, -120, -60, -30, -10],
        permutations: cli.permutations,
        seed: cli.seed,
        min_events: 5,
        preregistered: vec![
            Hypothesis {
                feature: FeatureId::BbWidthPct,
                lag_minutes: -30,
            },
            Hypothesis {
                feature: FeatureId::ZVol1m,
                lag_minutes: -60,
            },
            Hypothesis {
                feature: FeatureId::LiqStress,
                lag_minutes: -10,
            },
        ],
        ..StudyConfig::default()
    };
    let study = run_event_study(&timeline, &study_cfg)?;
    log_top_results(&study);
    let validated = study.validated_signals();
    if validated.is_empty() {
        warn!("no pre-registered hypothesis was validated on this stream");
    }

    // --- leakage-safe model evaluation ------------------------------------
    let cpcv_cfg = CpcvConfig {
        embargo_minutes: cli.embargo_minutes,
        ..CpcvConfig::default()
    };
    let estimator = LogisticHazard::default();
    let cpcv = run_cpcv(&timeline, &estimator, &cpcv_cfg)?;

    // --- operating point --------------------------------------------------
    let sweep_rows = sweep_gate(
        &cpcv.oof,
        timeline.flips(),
        timeline.horizon_minutes(),
        &SweepGrid::default(),
    )?;
    let operating_point = select_operating_point(&sweep_rows, cli.fa_budget);
    match &operating_point {
        Some(op) => info!(
            threshold = op.threshold,
            ema = op.ema_window,
            k = op.consecutive_k,
            separation = op.min_separation_minutes,
            coverage = op.coverage,
            fa_per_day = op.false_alarms_per_day,
            "operating point selected"
        ),
        None => warn!(
            budget = cli.fa_budget,
            "no operating point satisfied the false-alarm budget"
        ),
    }

    // --- deterministic alert replay ---------------------------------------
    let (alerts, gate_evaluation) = match &operating_point {
        Some(op) => {
            let alerts = AlertGate::replay(op.params(), &cpcv.oof)?;
            let eval = evaluate_alerts(
                &alerts,
                timeline.flips(),
                timeline.horizon_minutes(),
                &cpcv.oof,
            )?;
            info!(
                alerts = alerts.len(),
                covered = eval.n_covered,
                false_alarms = eval.n_false_alarms,
                "alert replay at operating point"
            );
            (alerts, Some(eval))
        }
        None => (Vec::new(), None),
    };

    let report = LabReport {
        minutes: cli.minutes,
        seed: cli.seed,
        n_flips: timeline.flips().len(),
        study,
        cpcv,
        operating_point,
        n_alerts: alerts.len(),
        alerts,
        gate_evaluation,
    };
    let json = serde_json::to_string_pretty(&report)?;
    match &cli.output {
        Some(path) => {
            let mut file = File::create(path)?;
            file.write_all(json.as_bytes())?;
            info!(path = %path.display(), "report written");
        }
        None => println!("{json}"),
    }
    Ok(())
}
