use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::schema::FeatureId;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the signal pipeline.
///
/// Input-validation failures are fatal by design: a non-monotonic timestamp
/// or an embargo shorter than the label horizon signals an upstream leakage
/// or ordering bug, and the engines abort rather than silently repair it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Timestamps must strictly increase within a sequence.
    #[error("non-monotonic timestamps in {context}: {at} does not advance past {prev}")]
    NonMonotonicTimestamps {
        context: &'static str,
        prev: DateTime<Utc>,
        at: DateTime<Utc>,
    },

    /// Minute-grid inputs must be aligned to whole minutes.
    #[error("timestamp {at} in {context} is not aligned to a whole minute")]
    UnalignedTimestamp {
        context: &'static str,
        at: DateTime<Utc>,
    },

    /// Feature name not in the closed schema.
    #[error("unknown feature name: {0:?}")]
    UnknownFeature(String),

    /// A schema feature was requested but is absent from the matrix.
    #[error("feature {0} is not present in the feature matrix")]
    MissingFeature(FeatureId),

    /// Probabilities must be finite and within [0, 1].
    #[error("probability {value} at {at} is outside [0, 1]")]
    InvalidProbability { at: DateTime<Utc>, value: f64 },

    /// Non-finite value where a finite one is required.
    #[error("non-finite value in {context} at row {row}")]
    NonFiniteValue { context: &'static str, row: usize },

    /// An operation received an empty input it cannot work with.
    #[error("{context}: input is empty")]
    EmptyInput { context: &'static str },

    /// The leakage-prevention invariant: embargo must cover the flip horizon.
    #[error(
        "embargo of {embargo_minutes} min is shorter than the flip horizon of \
         {horizon_minutes} min"
    )]
    EmbargoShorterThanHorizon {
        embargo_minutes: i64,
        horizon_minutes: i64,
    },

    /// A configuration parameter failed validation.
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    /// Rows/columns disagree with the expected shape.
    #[error("dimension mismatch in {context}: expected {expected}, got {actual}")]
    DimensionMismatch {
        context: &'static str,
        expected: usize,
        actual: usize,
    },

    /// The external estimator failed to fit or returned unusable output.
    #[error("estimator error: {0}")]
    Estimator(String),
}

impl Error {
    /// Shorthand for an invalid-parameter error.
    pub fn invalid_parameter(name: &'static str, reason: impl Into<String>) -> Self {
        Error::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }
}
