//! Macro regime detection.
//!
//! Aggregates the 1-minute grid into macro bars (default 4h), classifies each
//! bar as bull/bear/range from the OLS slope and R² of log price over a
//! trailing window, applies hysteresis so a state must persist before it is
//! accepted, and extracts the flip events the rest of the pipeline treats as
//! ground truth.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::errors::{Error, Result};
use crate::types::{Bar, FlipEvent, TrendState};

/// Regime detector parameters (research defaults).
#[derive(Debug, Clone)]
pub struct RegimeConfig {
    /// Macro bar width in minutes.
    pub macro_bar_minutes: i64,
    /// Trailing macro bars used for the trend regression.
    pub lookback_bars: usize,
    /// Minimum R² for a non-range classification.
    pub r2_min: f64,
    /// Consecutive differing bars required before a state change is accepted.
    pub hysteresis_bars: usize,
    /// Trailing macro bars for the realized-volatility proxy.
    pub rv_lookback_bars: usize,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
            macro_bar_minutes: 240,
            lookback_bars: 18,
            r2_min: 0.4,
            hysteresis_bars: 2,
            rv_lookback_bars: 30,
        }
    }
}

/// One macro bar with its trend classification.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MacroBar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// Realized-volatility proxy over the trailing window (NaN-free once warm).
    pub realized_vol: Option<f64>,
    pub slope: Option<f64>,
    pub r_squared: Option<f64>,
    /// Trend state after hysteresis.
    pub trend: TrendState,
}

/// OLS slope and R² of `y` against `0..n`.
fn ols_slope_r2(y: &[f64]) -> Option<(f64, f64)> {
    let n = y.len();
    if n < 2 {
        return None;
    }
    let nf = n as f64;
    let mean_x = (nf - 1.0) / 2.0;
    let mean_y = y.iter().sum::<f64>() / nf;
    let mut sxy = 0.0;
    let mut sxx = 0.0;
    let mut syy = 0.0;
    for (i, &v) in y.iter().enumerate() {
        let dx = i as f64 - mean_x;
        let dy = v - mean_y;
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }
    if sxx <= 0.0 {
        return None;
    }
    let slope = sxy / sxx;
    let r2 = if syy > 0.0 { (sxy * sxy) / (sxx * syy) } else { 0.0 };
    Some((slope, r2))
}

fn floor_to(ts: DateTime<Utc>, minutes: i64) -> DateTime<Utc> {
    let secs = ts.timestamp();
    let width = minutes * 60;
    DateTime::from_timestamp(secs.div_euclid(width) * width, 0).unwrap_or(ts)
}

/// Aggregate 1-minute bars into macro bars and classify the trend state.
pub fn build_macro_regime(bars_1m: &[Bar], cfg: &RegimeConfig) -> Result<Vec<MacroBar>> {
    if bars_1m.is_empty() {
        return Err(Error::EmptyInput { context: "bars" });
    }
    if cfg.macro_bar_minutes <= 0 {
        return Err(Error::invalid_parameter(
            "macro_bar_minutes",
            "must be positive",
        ));
    }
    if cfg.lookback_bars < 2 {
        return Err(Error::invalid_parameter(
            "lookback_bars",
            "need at least 2 bars for a trend regression",
        ));
    }

    // Aggregate to macro bars.
    let mut agg: Vec<MacroBar> = Vec::new();
    for bar in bars_1m {
        let bucket = floor_to(bar.timestamp, cfg.macro_bar_minutes);
        match agg.last_mut() {
            Some(m) if m.timestamp == bucket => {
                m.high = m.high.max(bar.high);
                m.low = m.low.min(bar.low);
                m.close = bar.close;
            }
            _ => agg.push(MacroBar {
                timestamp: bucket,
                open: bar.open,
                high: bar.high,
                low: bar.low,
                close: bar.close,
                realized_vol: None,
                slope: None,
                r_squared: None,
                trend: TrendState::Range,
            }),
        }
    }

    // Realized-vol proxy: sqrt of summed squared close-to-close returns.
    let closes: Vec<f64> = agg.iter().map(|m| m.close).collect();
    for i in 0..agg.len() {
        if i + 1 >= cfg.rv_lookback_bars {
            let lo = i + 1 - cfg.rv_lookback_bars;
            let ss: f64 = (lo.max(1)..=i)
                .map(|j| {
                    let r = closes[j] / closes[j - 1] - 1.0;
                    r * r
                })
                .sum();
            agg[i].realized_vol = Some(ss.sqrt());
        }
    }

    // Raw trend state from the regression over the bars strictly before i.
    let log_close: Vec<f64> = closes.iter().map(|c| c.ln()).collect();
    let mut raw_state = vec![TrendState::Range; agg.len()];
    for i in 0..agg.len() {
        if i < cfg.lookback_bars {
            continue;
        }
        if let Some((slope, r2)) = ols_slope_r2(&log_close[i - cfg.lookback_bars..i]) {
            agg[i].slope = Some(slope);
            agg[i].r_squared = Some(r2);
            raw_state[i] = if r2 >= cfg.r2_min {
                if slope > 0.0 {
                    TrendState::Bull
                } else if slope < 0.0 {
                    TrendState::Bear
                } else {
                    TrendState::Range
                }
            } else {
                TrendState::Range
            };
        }
    }

    // Hysteresis: a differing state must persist for `hysteresis_bars`
    // consecutive bars before it replaces the accepted state.
    let h = cfg.hysteresis_bars.max(1);
    let mut accepted = raw_state.first().copied().unwrap_or(TrendState::Range);
    let mut pending = 0usize;
    for i in 0..agg.len() {
        if i == 0 {
            agg[i].trend = accepted;
            continue;
        }
        if raw_state[i] != accepted {
            pending += 1;
            if pending >= h {
                accepted = raw_state[i];
                pending = 0;
            }
        } else {
            pending = 0;
        }
        agg[i].trend = accepted;
    }

    debug!(
        macro_bars = agg.len(),
        lookback = cfg.lookback_bars,
        "macro regime built"
    );
    Ok(agg)
}

/// Extract flip events: every bar whose accepted state differs from the
/// previous bar's.
pub fn find_flips(macro_bars: &[MacroBar]) -> Vec<FlipEvent> {
    macro_bars
        .windows(2)
        .filter(|w| w[1].trend != w[0].trend)
        .map(|w| FlipEvent {
            timestamp: w[1].timestamp,
            direction: w[1].trend,
        })
        .collect()
}
