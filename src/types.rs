//! Core record types shared across the pipeline.
//!
//! All public records carry UTC timestamps and derive `serde` so downstream
//! reporting can persist them without any formatting logic in the core.

use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// A single trade tick. Immutable once ingested.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    /// Exchange timestamp (UTC), non-decreasing within a symbol.
    pub timestamp: DateTime<Utc>,
    /// Trade price, strictly positive.
    pub price: f64,
    /// Trade quantity, strictly positive.
    pub quantity: f64,
    /// Whether the buyer was the maker, when the venue reports it.
    pub is_buyer_maker: Option<bool>,
}

/// One-minute OHLCV bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// Minute-aligned bar open time (UTC).
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Macro trend state of the regime detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendState {
    Bull,
    Bear,
    Range,
}

impl TrendState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrendState::Bull => "bull",
            TrendState::Bear => "bear",
            TrendState::Range => "range",
        }
    }
}

impl std::fmt::Display for TrendState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A macro regime transition, treated as ground truth by the core.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlipEvent {
    /// Minute-aligned transition time (UTC).
    pub timestamp: DateTime<Utc>,
    /// The trend state entered at the flip.
    pub direction: TrendState,
}

/// A discrete alert emitted by the gating state machine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Minute at which the alert fired.
    pub fire_timestamp: DateTime<Utc>,
    /// Smoothed probability at fire time.
    pub triggering_probability: f64,
}

/// Whether a timestamp sits exactly on a minute boundary.
pub(crate) fn is_minute_aligned(ts: DateTime<Utc>) -> bool {
    ts.second() == 0 && ts.nanosecond() == 0
}

/// Strictly time-ordered per-minute probability stream.
///
/// Construction validates ordering, minute alignment, and the [0, 1] range;
/// a violation is a fatal input error, never silently resorted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbabilitySeries {
    points: Vec<(DateTime<Utc>, f64)>,
}

impl ProbabilitySeries {
    /// Build a validated series from `(timestamp, probability)` pairs.
    pub fn new(points: Vec<(DateTime<Utc>, f64)>) -> Result<Self> {
        let mut prev: Option<DateTime<Utc>> = None;
        for &(ts, p) in &points {
            if !is_minute_aligned(ts) {
                return Err(Error::UnalignedTimestamp {
                    context: "probability series",
                    at: ts,
                });
            }
            if let Some(prev_ts) = prev {
                if ts <= prev_ts {
                    return Err(Error::NonMonotonicTimestamps {
                        context: "probability series",
                        prev: prev_ts,
                        at: ts,
                    });
                }
            }
            if !p.is_finite() || !(0.0..=1.0).contains(&p) {
                return Err(Error::InvalidProbability { at: ts, value: p });
            }
            prev = Some(ts);
        }
        Ok(Self { points })
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Iterate `(timestamp, probability)` pairs in time order.
    pub fn iter(&self) -> impl Iterator<Item = (DateTime<Utc>, f64)> + '_ {
        self.points.iter().copied()
    }

    pub fn first_timestamp(&self) -> Option<DateTime<Utc>> {
        self.points.first().map(|(ts, _)| *ts)
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.points.last().map(|(ts, _)| *ts)
    }

    /// Elapsed span in days, counting each minute stamp as one closed minute.
    ///
    /// Returns 0.0 for an empty series.
    pub fn span_days(&self) -> f64 {
        match (self.first_timestamp(), self.last_timestamp()) {
            (Some(first), Some(last)) => {
                let minutes = (last - first + Duration::minutes(1)).num_minutes();
                minutes as f64 / (24.0 * 60.0)
            }
            _ => 0.0,
        }
    }
}
