#![deny(unreachable_pub)]

//! # flipsig
//!
//! Discovery and validation of causal statistical precursors ("micro
//! signals") to rare macro regime flips, and their conversion into a
//! rate-limited real-time alert stream.
//!
//! The crate is organized around three core engines sharing one timeline
//! abstraction and one anti-lookahead discipline:
//!
//! - **Event study** ([`run_event_study`]): permutation-based significance of
//!   lagged feature signatures around flips, with Benjamini–Hochberg FDR
//!   control over the full hypothesis set and a pre-registered subset.
//! - **CPCV** ([`run_cpcv`]): combinatorial purged cross-validation with a
//!   time embargo, fitting an external [`ProbabilityEstimator`] and
//!   aggregating Brier/coverage/false-alarm metrics out of fold.
//! - **Alert gate** ([`AlertGate`]): a deterministic state machine turning a
//!   per-minute probability stream into debounced, rate-limited alerts, with
//!   identical batch and live execution paths.
//!
//! Supporting modules build the causal feature matrix from ticks
//! ([`build_micro_features`]), detect macro regime flips
//! ([`build_macro_regime`]), and tune the gate operating point
//! ([`sweep_gate`]).
//!
//! The core performs no I/O: ingestion, configuration files, plotting, and
//! the economic backtest are external collaborators exchanging plain records.

mod cpcv;
mod errors;
mod evaluation;
mod features;
mod gate;
mod hazard;
mod regime;
mod schema;
mod stats;
mod study;
mod sweep;
mod timeline;
mod types;

pub use cpcv::{build_splits, run_cpcv, CpcvConfig, CpcvReport, Split};
pub use errors::{Error, Result};
pub use evaluation::{evaluate_split, summarize, BrierAccumulator, MetricSummary, SplitMetrics};
pub use features::{bars_from_ticks, build_micro_features, MicroFeatureConfig, RollingRobustZ};
pub use gate::{
    evaluate_alerts, AlertGate, GateEvaluation, GateParams, GateState, LeadTimeStats,
};
pub use hazard::{LogisticHazard, LogisticModel, ProbabilityEstimator};
pub use regime::{build_macro_regime, find_flips, MacroBar, RegimeConfig};
pub use schema::FeatureId;
pub use stats::{
    mean, median, newey_west_variance, percentile, sample_covariance, sample_std, sample_variance,
};
pub use study::{
    bh_qvalues, permutation_test, run_event_study, Hypothesis, InconclusiveReason,
    PermutationOutcome, StudyConfig, StudyReport, Tail, TestOutcome, TestResult, TestStatistic,
};
pub use sweep::{select_operating_point, sweep_gate, OperatingPoint, SweepGrid, SweepRow};
pub use timeline::{FeatureMatrix, TimeRange, Timeline};
pub use types::{Alert, Bar, FlipEvent, ProbabilitySeries, Tick, TrendState};

#[cfg(test)]
mod tests;
