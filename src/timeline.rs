//! Timeline and event index.
//!
//! [`FeatureMatrix`] is the canonical minute-indexed feature table;
//! [`Timeline`] binds a matrix to the ground-truth flip events and the label
//! horizon. Every downstream engine (event study, CPCV, gate evaluation)
//! reads from this shared, immutable representation.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::errors::{Error, Result};
use crate::schema::FeatureId;
use crate::types::{is_minute_aligned, FlipEvent};

/// Minute-indexed feature table with a validated closed-schema column set.
///
/// Invariants enforced at construction:
/// - timestamps strictly increase and sit on whole minutes (gaps allowed);
/// - every value is finite;
/// - each row has exactly one value per column;
/// - no duplicate columns.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    index: Vec<DateTime<Utc>>,
    columns: Vec<FeatureId>,
    rows: Vec<Vec<f64>>,
}

impl FeatureMatrix {
    /// Build a validated matrix. Column positions are resolved here, once.
    pub fn new(
        index: Vec<DateTime<Utc>>,
        columns: Vec<FeatureId>,
        rows: Vec<Vec<f64>>,
    ) -> Result<Self> {
        if columns.is_empty() {
            return Err(Error::EmptyInput {
                context: "feature matrix columns",
            });
        }
        for (i, col) in columns.iter().enumerate() {
            if columns[..i].contains(col) {
                return Err(Error::invalid_parameter(
                    "columns",
                    format!("duplicate column {col}"),
                ));
            }
        }
        if index.len() != rows.len() {
            return Err(Error::DimensionMismatch {
                context: "feature matrix rows",
                expected: index.len(),
                actual: rows.len(),
            });
        }
        let mut prev: Option<DateTime<Utc>> = None;
        for (row_idx, &ts) in index.iter().enumerate() {
            if !is_minute_aligned(ts) {
                return Err(Error::UnalignedTimestamp {
                    context: "feature matrix",
                    at: ts,
                });
            }
            if let Some(prev_ts) = prev {
                if ts <= prev_ts {
                    return Err(Error::NonMonotonicTimestamps {
                        context: "feature matrix",
                        prev: prev_ts,
                        at: ts,
                    });
                }
            }
            prev = Some(ts);
            let row = &rows[row_idx];
            if row.len() != columns.len() {
                return Err(Error::DimensionMismatch {
                    context: "feature matrix row width",
                    expected: columns.len(),
                    actual: row.len(),
                });
            }
            if row.iter().any(|v| !v.is_finite()) {
                return Err(Error::NonFiniteValue {
                    context: "feature matrix",
                    row: row_idx,
                });
            }
        }
        Ok(Self {
            index,
            columns,
            rows,
        })
    }

    pub fn n_rows(&self) -> usize {
        self.index.len()
    }

    pub fn n_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn timestamps(&self) -> &[DateTime<Utc>] {
        &self.index
    }

    pub fn columns(&self) -> &[FeatureId] {
        &self.columns
    }

    /// Position of a schema feature, failing fast when absent.
    pub fn column_index(&self, feature: FeatureId) -> Result<usize> {
        self.columns
            .iter()
            .position(|&c| c == feature)
            .ok_or(Error::MissingFeature(feature))
    }

    pub fn row(&self, row: usize) -> &[f64] {
        &self.rows[row]
    }

    pub fn value(&self, row: usize, column: usize) -> f64 {
        self.rows[row][column]
    }

    /// Row position of an exact timestamp, if present.
    pub fn position_of(&self, ts: DateTime<Utc>) -> Option<usize> {
        self.index.binary_search(&ts).ok()
    }

    /// Value of a column at an exact timestamp, if that minute exists.
    pub fn value_at(&self, ts: DateTime<Utc>, column: usize) -> Option<f64> {
        self.position_of(ts).map(|row| self.rows[row][column])
    }
}

/// Immutable timeline: feature matrix + flip events + label horizon.
///
/// Owns its inputs for a run; downstream stages receive derived data by
/// value and never mutate the timeline.
#[derive(Debug, Clone)]
pub struct Timeline {
    features: FeatureMatrix,
    flips: Vec<FlipEvent>,
    horizon_minutes: i64,
}

impl Timeline {
    /// Bind features to flips. Flips must strictly increase in time and be
    /// minute-aligned; the horizon must be positive.
    pub fn new(features: FeatureMatrix, flips: Vec<FlipEvent>, horizon_minutes: i64) -> Result<Self> {
        if horizon_minutes <= 0 {
            return Err(Error::invalid_parameter(
                "horizon_minutes",
                format!("must be positive, got {horizon_minutes}"),
            ));
        }
        let mut prev: Option<DateTime<Utc>> = None;
        for flip in &flips {
            if !is_minute_aligned(flip.timestamp) {
                return Err(Error::UnalignedTimestamp {
                    context: "flip events",
                    at: flip.timestamp,
                });
            }
            if let Some(prev_ts) = prev {
                if flip.timestamp <= prev_ts {
                    return Err(Error::NonMonotonicTimestamps {
                        context: "flip events",
                        prev: prev_ts,
                        at: flip.timestamp,
                    });
                }
            }
            prev = Some(flip.timestamp);
        }
        Ok(Self {
            features,
            flips,
            horizon_minutes,
        })
    }

    pub fn features(&self) -> &FeatureMatrix {
        &self.features
    }

    pub fn flips(&self) -> &[FlipEvent] {
        &self.flips
    }

    pub fn horizon_minutes(&self) -> i64 {
        self.horizon_minutes
    }

    pub fn n_rows(&self) -> usize {
        self.features.n_rows()
    }

    /// Binary label per row: does a flip occur within `(t, t + horizon]`?
    pub fn labels(&self) -> Vec<bool> {
        let horizon = Duration::minutes(self.horizon_minutes);
        self.features
            .timestamps()
            .iter()
            .map(|&t| {
                let lo = t;
                let hi = t + horizon;
                // flips sorted: find the first flip strictly after t
                let idx = self
                    .flips
                    .partition_point(|f| f.timestamp <= lo);
                self.flips.get(idx).is_some_and(|f| f.timestamp <= hi)
            })
            .collect()
    }

}

/// Half-open-free inclusive time interval `[start, end]` on the minute grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts <= self.end
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}
