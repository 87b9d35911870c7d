//! Signal validation engine.
//!
//! Computes event-aligned pre-flip signature statistics per
//! (feature, lag) hypothesis, permutation-derived p-values, and
//! Benjamini–Hochberg q-values under two correction scopes (full hypothesis
//! set and a pre-registered subset). A hypothesis is a validated signal iff
//! its pre-registered-scope q-value clears the configured threshold.

mod event_study;
mod fdr;
mod permutation;

pub use event_study::*;
pub use fdr::*;
pub use permutation::*;
