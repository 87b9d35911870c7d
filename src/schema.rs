//! Closed feature schema.
//!
//! Feature columns are identified by an enumerated, closed set of identifiers
//! resolved once when a matrix is constructed. Unknown or missing names fail
//! fast instead of being coerced through loosely-typed string lookup.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::Error;

/// Identifier of a causal micro feature.
///
/// Every variant corresponds to one column produced by
/// [`build_micro_features`](crate::build_micro_features); the lookback window
/// of each column is documented there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FeatureId {
    /// One-minute log return.
    #[serde(rename = "ret_1m")]
    Ret1m,
    /// Realized variance from intraminute log returns.
    #[serde(rename = "rv_1m")]
    Rv1m,
    /// Rolling z-score of minute volume.
    #[serde(rename = "z_vol_1m")]
    ZVol1m,
    /// Average trades per second over the minute.
    #[serde(rename = "trade_rate_1s")]
    TradeRate1s,
    /// Mean per-second signed-volume imbalance.
    #[serde(rename = "imbalance_1s")]
    Imbalance1s,
    /// Absolute return scaled by recent volatility.
    #[serde(rename = "liq_stress")]
    LiqStress,
    /// Bollinger band width as a fraction of price.
    #[serde(rename = "bb_width_pct")]
    BbWidthPct,
    /// Donchian channel width as a fraction of price.
    #[serde(rename = "don_width_pct")]
    DonWidthPct,
    /// Volatility of rolling volatility.
    #[serde(rename = "vov")]
    Vov,
    /// Lag-1 autocorrelation of minute returns.
    #[serde(rename = "acf1")]
    Acf1,
    /// Hour-of-day seasonality, sine component.
    #[serde(rename = "season_sin")]
    SeasonSin,
    /// Hour-of-day seasonality, cosine component.
    #[serde(rename = "season_cos")]
    SeasonCos,
}

impl FeatureId {
    /// Every feature in the schema, in canonical column order.
    pub const ALL: [FeatureId; 12] = [
        FeatureId::Ret1m,
        FeatureId::Rv1m,
        FeatureId::ZVol1m,
        FeatureId::TradeRate1s,
        FeatureId::Imbalance1s,
        FeatureId::LiqStress,
        FeatureId::BbWidthPct,
        FeatureId::DonWidthPct,
        FeatureId::Vov,
        FeatureId::Acf1,
        FeatureId::SeasonSin,
        FeatureId::SeasonCos,
    ];

    /// Canonical column name.
    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureId::Ret1m => "ret_1m",
            FeatureId::Rv1m => "rv_1m",
            FeatureId::ZVol1m => "z_vol_1m",
            FeatureId::TradeRate1s => "trade_rate_1s",
            FeatureId::Imbalance1s => "imbalance_1s",
            FeatureId::LiqStress => "liq_stress",
            FeatureId::BbWidthPct => "bb_width_pct",
            FeatureId::DonWidthPct => "don_width_pct",
            FeatureId::Vov => "vov",
            FeatureId::Acf1 => "acf1",
            FeatureId::SeasonSin => "season_sin",
            FeatureId::SeasonCos => "season_cos",
        }
    }
}

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeatureId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FeatureId::ALL
            .iter()
            .copied()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| Error::UnknownFeature(s.to_string()))
    }
}
