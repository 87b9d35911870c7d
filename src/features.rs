//! Causal micro-feature construction.
//!
//! Builds the minute-level feature table the rest of the pipeline consumes.
//! Every tick- or bar-derived column is shifted one minute, so the value
//! stamped `t` is computable from data with timestamp strictly before `t`;
//! each column's lookback window is bounded and listed below.
//!
//! | column          | lookback (minutes)            |
//! |-----------------|-------------------------------|
//! | `ret_1m`        | 2                             |
//! | `rv_1m`         | 1                             |
//! | `z_vol_1m`      | `vol_z_window`                |
//! | `trade_rate_1s` | 1                             |
//! | `imbalance_1s`  | 1                             |
//! | `liq_stress`    | `liq_vol_window`              |
//! | `bb_width_pct`  | `bb_window`                   |
//! | `don_width_pct` | `don_window`                  |
//! | `vov`           | `vov_window + vov_of_window`  |
//! | `acf1`          | `acf_window`                  |
//! | `season_sin/cos`| 0 (function of the clock)     |
//!
//! Rows with any unfilled window are dropped, so the resulting
//! [`FeatureMatrix`] contains only fully-formed, finite values.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Timelike, Utc};

use crate::errors::{Error, Result};
use crate::schema::FeatureId;
use crate::timeline::FeatureMatrix;
use crate::types::{Bar, Tick};

const EPS: f64 = 1e-12;

/// Rolling-window widths for feature construction (units: minutes/bars).
#[derive(Debug, Clone)]
pub struct MicroFeatureConfig {
    /// Window for the volume z-score.
    pub vol_z_window: usize,
    /// Bollinger band window.
    pub bb_window: usize,
    /// Donchian channel window.
    pub don_window: usize,
    /// Return-volatility window for the liquidity-stress proxy.
    pub liq_vol_window: usize,
    /// Inner window for vol-of-vol (rolling std of returns).
    pub vov_window: usize,
    /// Outer window for vol-of-vol (std of the rolling std).
    pub vov_of_window: usize,
    /// Window for the lag-1 autocorrelation estimate.
    pub acf_window: usize,
}

impl Default for MicroFeatureConfig {
    fn default() -> Self {
        Self {
            vol_z_window: 256,
            bb_window: 20,
            don_window: 60,
            liq_vol_window: 64,
            vov_window: 32,
            vov_of_window: 16,
            acf_window: 128,
        }
    }
}

/// Floor a timestamp to its minute boundary.
fn floor_minute(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts - Duration::seconds(ts.second() as i64)
        - Duration::nanoseconds(ts.nanosecond() as i64)
}

/// Aggregate a tick stream into 1-minute OHLCV bars.
///
/// Ticks must be non-decreasing in time with positive price and quantity.
/// Minutes without ticks produce no bar (the grid may have gaps).
pub fn bars_from_ticks(ticks: &[Tick]) -> Result<Vec<Bar>> {
    if ticks.is_empty() {
        return Err(Error::EmptyInput { context: "ticks" });
    }
    let mut bars: Vec<Bar> = Vec::new();
    let mut prev_ts: Option<DateTime<Utc>> = None;
    for (i, tick) in ticks.iter().enumerate() {
        if !(tick.price.is_finite() && tick.price > 0.0) {
            return Err(Error::NonFiniteValue {
                context: "tick price",
                row: i,
            });
        }
        if !(tick.quantity.is_finite() && tick.quantity > 0.0) {
            return Err(Error::NonFiniteValue {
                context: "tick quantity",
                row: i,
            });
        }
        if let Some(prev) = prev_ts {
            if tick.timestamp < prev {
                return Err(Error::NonMonotonicTimestamps {
                    context: "ticks",
                    prev,
                    at: tick.timestamp,
                });
            }
        }
        prev_ts = Some(tick.timestamp);

        let minute = floor_minute(tick.timestamp);
        match bars.last_mut() {
            Some(bar) if bar.timestamp == minute => {
                bar.high = bar.high.max(tick.price);
                bar.low = bar.low.min(tick.price);
                bar.close = tick.price;
                bar.volume += tick.quantity;
            }
            _ => bars.push(Bar {
                timestamp: minute,
                open: tick.price,
                high: tick.price,
                low: tick.price,
                close: tick.price,
                volume: tick.quantity,
            }),
        }
    }
    Ok(bars)
}

/// Per-minute statistics derived from raw ticks.
struct MinuteTickStats {
    /// Realized variance from per-second last-price log returns.
    rv: f64,
    /// Trades per second averaged over the minute.
    trade_rate: f64,
    /// Mean per-second signed-volume imbalance, when maker flags exist.
    imbalance: Option<f64>,
}

fn tick_minute_stats(ticks: &[Tick]) -> HashMap<DateTime<Utc>, MinuteTickStats> {
    // Group by minute, then by second within the minute.
    let mut out: HashMap<DateTime<Utc>, MinuteTickStats> = HashMap::new();
    let mut i = 0;
    while i < ticks.len() {
        let minute = floor_minute(ticks[i].timestamp);
        let mut j = i;
        while j < ticks.len() && floor_minute(ticks[j].timestamp) == minute {
            j += 1;
        }
        let group = &ticks[i..j];

        // Per-second last price and signed/total quantity. Ordered map so
        // the imbalance sum is reproducible bit for bit.
        let mut sec_last_price: Vec<(i64, f64)> = Vec::new();
        let mut sec_flow: BTreeMap<i64, (f64, f64)> = BTreeMap::new(); // (signed, total)
        let mut any_maker_flag = false;
        for t in group {
            let sec = t.timestamp.timestamp();
            match sec_last_price.last_mut() {
                Some((s, p)) if *s == sec => *p = t.price,
                _ => sec_last_price.push((sec, t.price)),
            }
            if let Some(maker) = t.is_buyer_maker {
                any_maker_flag = true;
                let sign = if maker { 1.0 } else { -1.0 };
                let entry = sec_flow.entry(sec).or_insert((0.0, 0.0));
                entry.0 += sign * t.quantity;
                entry.1 += t.quantity;
            }
        }

        let rv: f64 = sec_last_price
            .windows(2)
            .map(|w| {
                let r = (w[1].1 / w[0].1).ln();
                r * r
            })
            .sum();

        let trade_rate = group.len() as f64 / 60.0;

        let imbalance = if any_maker_flag {
            let imbs: Vec<f64> = sec_flow
                .values()
                .map(|&(signed, total)| (signed / (total + EPS)).clamp(-1.0, 1.0))
                .collect();
            Some(imbs.iter().sum::<f64>() / imbs.len() as f64)
        } else {
            None
        };

        out.insert(
            minute,
            MinuteTickStats {
                rv,
                trade_rate,
                imbalance,
            },
        );
        i = j;
    }
    out
}

// --- NaN-aware rolling helpers ------------------------------------------

/// Apply `f` over trailing windows of `window` values, requiring at least
/// `min_periods` finite values; emits NaN otherwise.
fn rolling_apply<F>(values: &[f64], window: usize, min_periods: usize, f: F) -> Vec<f64>
where
    F: Fn(&[f64]) -> f64,
{
    let mut out = vec![f64::NAN; values.len()];
    let mut finite: Vec<f64> = Vec::with_capacity(window);
    for i in 0..values.len() {
        let lo = (i + 1).saturating_sub(window);
        finite.clear();
        finite.extend(values[lo..=i].iter().copied().filter(|v| v.is_finite()));
        if finite.len() >= min_periods {
            out[i] = f(&finite);
        }
    }
    out
}

fn rolling_mean(values: &[f64], window: usize, min_periods: usize) -> Vec<f64> {
    rolling_apply(values, window, min_periods, |w| {
        w.iter().sum::<f64>() / w.len() as f64
    })
}

fn rolling_std(values: &[f64], window: usize, min_periods: usize) -> Vec<f64> {
    rolling_apply(values, window, min_periods, |w| {
        if w.len() < 2 {
            return f64::NAN;
        }
        let m = w.iter().sum::<f64>() / w.len() as f64;
        let ss: f64 = w.iter().map(|v| (v - m) * (v - m)).sum();
        (ss / (w.len() - 1) as f64).sqrt()
    })
}

fn rolling_max(values: &[f64], window: usize, min_periods: usize) -> Vec<f64> {
    rolling_apply(values, window, min_periods, |w| {
        w.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    })
}

fn rolling_min(values: &[f64], window: usize, min_periods: usize) -> Vec<f64> {
    rolling_apply(values, window, min_periods, |w| {
        w.iter().copied().fold(f64::INFINITY, f64::min)
    })
}

/// Rolling lag-1 autocorrelation; NaN until `window` finite values exist.
fn rolling_acf1(values: &[f64], window: usize) -> Vec<f64> {
    rolling_apply(values, window, window, |w| {
        if w.len() < 3 {
            return f64::NAN;
        }
        let x = &w[..w.len() - 1];
        let y = &w[1..];
        let mx = x.iter().sum::<f64>() / x.len() as f64;
        let my = y.iter().sum::<f64>() / y.len() as f64;
        let mut cov = 0.0;
        let mut vx = 0.0;
        let mut vy = 0.0;
        for (a, b) in x.iter().zip(y) {
            cov += (a - mx) * (b - my);
            vx += (a - mx) * (a - mx);
            vy += (b - my) * (b - my);
        }
        if vx > 0.0 && vy > 0.0 {
            cov / (vx.sqrt() * vy.sqrt())
        } else {
            f64::NAN
        }
    })
}

/// Shift a column one step forward in time: `out[i] = values[i - 1]`.
fn shift1(values: &[f64]) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    out[1..].copy_from_slice(&values[..values.len() - 1]);
    out
}

/// Build the causal micro-feature matrix from 1-minute bars and raw ticks.
///
/// The `imbalance_1s` column is present only when the tick stream carries
/// `is_buyer_maker` flags; all other schema columns are always produced.
pub fn build_micro_features(
    bars: &[Bar],
    ticks: &[Tick],
    cfg: &MicroFeatureConfig,
) -> Result<FeatureMatrix> {
    if bars.is_empty() {
        return Err(Error::EmptyInput { context: "bars" });
    }
    let n = bars.len();
    let tick_stats = tick_minute_stats(ticks);
    let has_maker_flags = tick_stats.values().any(|s| s.imbalance.is_some());

    let close: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let ret: Vec<f64> = std::iter::once(f64::NAN)
        .chain(close.windows(2).map(|w| (w[1] / w[0]).ln()))
        .collect();
    let volume: Vec<f64> = bars.iter().map(|b| b.volume).collect();
    let highs: Vec<f64> = bars.iter().map(|b| b.high).collect();
    let lows: Vec<f64> = bars.iter().map(|b| b.low).collect();

    let ret_1m = shift1(&ret);

    let rv_raw: Vec<f64> = bars
        .iter()
        .map(|b| tick_stats.get(&b.timestamp).map_or(f64::NAN, |s| s.rv))
        .collect();
    let rv_1m = shift1(&rv_raw);

    let vol_mu = rolling_mean(&volume, cfg.vol_z_window, (cfg.vol_z_window / 4).max(16));
    let vol_sd = rolling_std(&volume, cfg.vol_z_window, (cfg.vol_z_window / 4).max(16));
    let z_vol_raw: Vec<f64> = (0..n)
        .map(|i| (volume[i] - vol_mu[i]) / (vol_sd[i] + EPS))
        .collect();
    let z_vol_1m = shift1(&z_vol_raw);

    let trade_rate_raw: Vec<f64> = bars
        .iter()
        .map(|b| {
            tick_stats
                .get(&b.timestamp)
                .map_or(f64::NAN, |s| s.trade_rate)
        })
        .collect();
    let trade_rate_1s = shift1(&trade_rate_raw);

    let imbalance_1s = if has_maker_flags {
        let raw: Vec<f64> = bars
            .iter()
            .map(|b| {
                tick_stats
                    .get(&b.timestamp)
                    .and_then(|s| s.imbalance)
                    .unwrap_or(f64::NAN)
            })
            .collect();
        Some(shift1(&raw))
    } else {
        None
    };

    let ret_vol = rolling_std(&ret, cfg.liq_vol_window, cfg.liq_vol_window);
    let liq_raw: Vec<f64> = (0..n)
        .map(|i| ret[i].abs() / (ret_vol[i].sqrt() + EPS))
        .collect();
    let liq_stress = shift1(&liq_raw);

    // band width is 4 standard deviations regardless of the band center
    let bb_sd = rolling_std(&close, cfg.bb_window, cfg.bb_window);
    let bb_raw: Vec<f64> = (0..n).map(|i| 4.0 * bb_sd[i] / close[i]).collect();
    let bb_width_pct = shift1(&bb_raw);

    let don_h = rolling_max(&highs, cfg.don_window, cfg.don_window);
    let don_l = rolling_min(&lows, cfg.don_window, cfg.don_window);
    let don_raw: Vec<f64> = (0..n).map(|i| (don_h[i] - don_l[i]) / close[i]).collect();
    let don_width_pct = shift1(&don_raw);

    let rv_inner = rolling_std(&ret, cfg.vov_window, cfg.vov_window);
    let vov_raw = rolling_std(&rv_inner, cfg.vov_of_window, cfg.vov_of_window);
    let vov = shift1(&vov_raw);

    let acf1 = shift1(&rolling_acf1(&ret, cfg.acf_window));

    // Seasonality is a function of the clock, not of market data.
    let (season_sin, season_cos): (Vec<f64>, Vec<f64>) = bars
        .iter()
        .map(|b| {
            let hod = b.timestamp.hour() as f64 + b.timestamp.minute() as f64 / 60.0;
            let phase = 2.0 * std::f64::consts::PI * hod / 24.0;
            (phase.sin(), phase.cos())
        })
        .unzip();

    let mut columns = vec![
        FeatureId::Ret1m,
        FeatureId::Rv1m,
        FeatureId::ZVol1m,
        FeatureId::TradeRate1s,
    ];
    let mut series: Vec<&[f64]> = vec![
        ret_1m.as_slice(),
        rv_1m.as_slice(),
        z_vol_1m.as_slice(),
        trade_rate_1s.as_slice(),
    ];
    if let Some(imb) = imbalance_1s.as_deref() {
        columns.push(FeatureId::Imbalance1s);
        series.push(imb);
    }
    columns.extend([
        FeatureId::LiqStress,
        FeatureId::BbWidthPct,
        FeatureId::DonWidthPct,
        FeatureId::Vov,
        FeatureId::Acf1,
        FeatureId::SeasonSin,
        FeatureId::SeasonCos,
    ]);
    series.extend([
        liq_stress.as_slice(),
        bb_width_pct.as_slice(),
        don_width_pct.as_slice(),
        vov.as_slice(),
        acf1.as_slice(),
        season_sin.as_slice(),
        season_cos.as_slice(),
    ]);

    // Keep only rows where every window is filled.
    let mut index = Vec::new();
    let mut rows = Vec::new();
    for i in 0..n {
        let row: Vec<f64> = series.iter().map(|s| s[i]).collect();
        if row.iter().all(|v| v.is_finite()) {
            index.push(bars[i].timestamp);
            rows.push(row);
        }
    }
    FeatureMatrix::new(index, columns, rows)
}

/// Causal rolling robust z-score (median/MAD) with clipped tails.
///
/// The statistics for a row come from the window strictly before it,
/// refreshed every `refresh_minutes` rows to keep the pass tractable; the
/// refresh point only ever uses past data. Tails are winsorized with a fixed
/// symmetric clip; quantile-based winsorization would need the full sample.
#[derive(Debug, Clone)]
pub struct RollingRobustZ {
    /// Trailing window, in minutes.
    pub window_minutes: usize,
    /// Minimum samples before a z-score is emitted.
    pub min_periods: usize,
    /// Rows between statistic refreshes.
    pub refresh_minutes: usize,
    /// Symmetric clip applied to the z-score.
    pub z_clip: f64,
}

impl Default for RollingRobustZ {
    fn default() -> Self {
        Self {
            window_minutes: 5 * 24 * 60,
            min_periods: 64,
            refresh_minutes: 60,
            z_clip: 8.0,
        }
    }
}

impl RollingRobustZ {
    /// Normalize every column of a matrix; rows without filled windows drop.
    pub fn transform(&self, matrix: &FeatureMatrix) -> Result<FeatureMatrix> {
        if self.window_minutes == 0 || self.refresh_minutes == 0 {
            return Err(Error::invalid_parameter(
                "window_minutes/refresh_minutes",
                "must be positive",
            ));
        }
        let n = matrix.n_rows();
        let n_cols = matrix.n_columns();
        let mut zrows: Vec<Vec<f64>> = vec![vec![f64::NAN; n_cols]; n];

        for col in 0..n_cols {
            let values: Vec<f64> = (0..n).map(|i| matrix.value(i, col)).collect();
            let mut med = f64::NAN;
            let mut mad = f64::NAN;
            let mut last_refresh = usize::MAX;
            for i in 0..n {
                if last_refresh == usize::MAX || i - last_refresh >= self.refresh_minutes {
                    let lo = i.saturating_sub(self.window_minutes);
                    let window = &values[lo..i];
                    if window.len() >= self.min_periods {
                        med = crate::stats::median(window).unwrap_or(f64::NAN);
                        mad = crate::stats::median(
                            &window.iter().map(|v| (v - med).abs()).collect::<Vec<_>>(),
                        )
                        .unwrap_or(f64::NAN);
                    }
                    last_refresh = i;
                }
                if med.is_finite() && mad.is_finite() {
                    let z = (values[i] - med) / (mad + 1e-9);
                    zrows[i][col] = z.clamp(-self.z_clip, self.z_clip);
                }
            }
        }

        let mut index = Vec::new();
        let mut rows = Vec::new();
        for (i, row) in zrows.into_iter().enumerate() {
            if row.iter().all(|v| v.is_finite()) {
                index.push(matrix.timestamps()[i]);
                rows.push(row);
            }
        }
        FeatureMatrix::new(index, matrix.columns().to_vec(), rows)
    }
}
