//! Pure, stateless derived-metric functions (C4). Grounded on
//! `domain/market/market_regime.rs`'s explicit-sum `Decimal` arithmetic
//! (no floating-point shortcuts for ATR/trend strength) for the money-like
//! calculations, and on `statrs`-style statistics for the dimensionless
//! ones (volatility, correlation), generalized to the two-series
//! covariance form needed for portfolio beta.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::domain::signals::{Candle, Field, RegimeSignals, SignalBundle};

/// Simple moving average of the last `period` closes. `missing` (`None`)
/// if fewer than `period` closes are available.
pub fn sma(closes: &[Decimal], period: usize) -> Option<Decimal> {
    if period == 0 || closes.len() < period {
        return None;
    }
    let window = &closes[closes.len() - period..];
    let sum: Decimal = window.iter().copied().sum();
    Some(sum / Decimal::from(period as u64))
}

fn true_range(candle: &Candle, prev_close: Decimal) -> Decimal {
    let hl = candle.high - candle.low;
    let hc = (candle.high - prev_close).abs();
    let lc = (candle.low - prev_close).abs();
    hl.max(hc).max(lc)
}

/// Wilder-style +DM/-DM for one step.
fn directional_movement(prev: &Candle, curr: &Candle) -> (Decimal, Decimal) {
    let up_move = curr.high - prev.high;
    let down_move = prev.low - curr.low;
    let plus_dm = if up_move > down_move && up_move > Decimal::ZERO { up_move } else { Decimal::ZERO };
    let minus_dm = if down_move > up_move && down_move > Decimal::ZERO { down_move } else { Decimal::ZERO };
    (plus_dm, minus_dm)
}

/// ADX over `candles` with Wilder's smoothing period (default 14).
///
/// **Resolved open question** (documented in `DESIGN.md`): when the window
/// is long enough for at least one full smoothing pass (`candles.len() >=
/// 2*period`), this computes Wilder's fully smoothed ADX. When the window
/// is shorter, it falls back to the unsmoothed DX on the trailing `period`
/// candles — the approximation the spec explicitly permits, documented
/// rather than silently substituted.
pub fn adx(candles: &[Candle], period: usize) -> Option<Decimal> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }

    let mut trs = Vec::with_capacity(candles.len() - 1);
    let mut plus_dms = Vec::with_capacity(candles.len() - 1);
    let mut minus_dms = Vec::with_capacity(candles.len() - 1);
    for window in candles.windows(2) {
        let (prev, curr) = (&window[0], &window[1]);
        trs.push(true_range(curr, prev.close));
        let (plus_dm, minus_dm) = directional_movement(prev, curr);
        plus_dms.push(plus_dm);
        minus_dms.push(minus_dm);
    }

    let dx_series = dx_series(&trs, &plus_dms, &minus_dms, period)?;

    if candles.len() >= 2 * period {
        // Full Wilder smoothing: ADX is the Wilder-smoothed average of the DX series.
        wilder_smooth(&dx_series, period)
    } else {
        // Short window: DX-as-ADX approximation, using the most recent DX value.
        dx_series.last().copied()
    }
}

fn wilder_smooth(series: &[Decimal], period: usize) -> Option<Decimal> {
    if series.len() < period {
        return None;
    }
    let first_avg: Decimal = series[..period].iter().copied().sum::<Decimal>() / Decimal::from(period as u64);
    let mut smoothed = first_avg;
    for value in &series[period..] {
        smoothed = (smoothed * Decimal::from(period as u64 - 1) + *value) / Decimal::from(period as u64);
    }
    Some(smoothed)
}

fn dx_series(trs: &[Decimal], plus_dms: &[Decimal], minus_dms: &[Decimal], period: usize) -> Option<Vec<Decimal>> {
    if trs.len() < period {
        return None;
    }
    let smoothed_tr = wilder_smoothed_series(trs, period);
    let smoothed_plus = wilder_smoothed_series(plus_dms, period);
    let smoothed_minus = wilder_smoothed_series(minus_dms, period);

    let mut dx = Vec::with_capacity(smoothed_tr.len());
    for i in 0..smoothed_tr.len() {
        let tr = smoothed_tr[i];
        if tr.is_zero() {
            dx.push(Decimal::ZERO);
            continue;
        }
        let plus_di = (smoothed_plus[i] / tr) * Decimal::from(100);
        let minus_di = (smoothed_minus[i] / tr) * Decimal::from(100);
        let di_sum = plus_di + minus_di;
        let value = if di_sum.is_zero() {
            Decimal::ZERO
        } else {
            ((plus_di - minus_di).abs() / di_sum) * Decimal::from(100)
        };
        dx.push(value);
    }
    Some(dx)
}

/// Wilder running-sum smoothing applied to a raw series, producing one
/// smoothed value per window of `period` inputs (rolling, not a single
/// average).
fn wilder_smoothed_series(series: &[Decimal], period: usize) -> Vec<Decimal> {
    if series.len() < period {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(series.len() - period + 1);
    let mut running: Decimal = series[..period].iter().copied().sum();
    out.push(running);
    for value in &series[period..] {
        running = running - (running / Decimal::from(period as u64)) + *value;
        out.push(running);
    }
    out
}

/// Periods per year for a given candle cadence, used to annualize realized
/// volatility.
pub enum Cadence {
    Hourly,
    Daily,
    Weekly,
}

impl Cadence {
    fn periods_per_year(&self) -> f64 {
        match self {
            Cadence::Hourly => 24.0 * 365.0,
            Cadence::Daily => 365.0,
            Cadence::Weekly => 52.0,
        }
    }
}

fn log_returns(closes: &[f64]) -> Vec<f64> {
    closes.windows(2).map(|w| (w[1] / w[0]).ln()).collect()
}

/// Standard deviation of log returns over the window, annualized by
/// `sqrt(periods_per_year)`. `None` if fewer than 2 closes are available.
pub fn realized_volatility(closes: &[Decimal], cadence: Cadence) -> Option<f64> {
    if closes.len() < 2 {
        return None;
    }
    let floats: Vec<f64> = closes.iter().filter_map(|d| d.to_f64()).collect();
    if floats.len() < 2 {
        return None;
    }
    let returns = log_returns(&floats);
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
    Some(variance.sqrt() * cadence.periods_per_year().sqrt())
}

/// Pearson correlation of two return series, clamped to `[-1, 1]`.
/// `None` if series lengths differ or there are fewer than 2 points.
pub fn pearson_correlation(returns_a: &[f64], returns_b: &[f64]) -> Option<f64> {
    if returns_a.len() != returns_b.len() || returns_a.len() < 2 {
        return None;
    }
    let n = returns_a.len() as f64;
    let mean_a = returns_a.iter().sum::<f64>() / n;
    let mean_b = returns_b.iter().sum::<f64>() / n;
    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for i in 0..returns_a.len() {
        let da = returns_a[i] - mean_a;
        let db = returns_b[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    if var_a == 0.0 || var_b == 0.0 {
        return Some(0.0);
    }
    Some((cov / (var_a.sqrt() * var_b.sqrt())).clamp(-1.0, 1.0))
}

/// Portfolio beta vs. BTC: `cov(portfolio_returns, btc_returns) /
/// var(btc_returns)`.
pub fn portfolio_beta(portfolio_returns: &[f64], btc_returns: &[f64]) -> Option<f64> {
    if portfolio_returns.len() != btc_returns.len() || portfolio_returns.len() < 2 {
        return None;
    }
    let n = portfolio_returns.len() as f64;
    let mean_p = portfolio_returns.iter().sum::<f64>() / n;
    let mean_b = btc_returns.iter().sum::<f64>() / n;
    let mut cov = 0.0;
    let mut var_b = 0.0;
    for i in 0..portfolio_returns.len() {
        let dp = portfolio_returns[i] - mean_p;
        let db = btc_returns[i] - mean_b;
        cov += dp * db;
        var_b += db * db;
    }
    if var_b == 0.0 {
        return None;
    }
    Some(cov / var_b)
}

/// Maximum drawdown over a value series: `max((peak_<=t - value_t) / peak_<=t)`.
pub fn max_drawdown(values: &[Decimal]) -> Decimal {
    let mut peak = match values.first() {
        Some(v) => *v,
        None => return Decimal::ZERO,
    };
    let mut worst = Decimal::ZERO;
    for value in values {
        if *value > peak {
            peak = *value;
        }
        if !peak.is_zero() {
            let drawdown = (peak - *value) / peak;
            if drawdown > worst {
                worst = drawdown;
            }
        }
    }
    worst
}

/// Propagates confidence through a derived metric: the output's
/// confidence never exceeds the minimum confidence of its inputs.
pub fn propagate_confidence(input_confidences: &[f64]) -> f64 {
    input_confidences.iter().copied().fold(1.0, f64::min)
}

/// Applies confidence propagation to a `Field`-wrapped derived value,
/// consistent with "insufficient data => missing, never a silent zero".
pub fn derived_field<T>(
    value: Option<T>,
    input_confidences: &[f64],
    source: &str,
) -> Field<T> {
    match value {
        Some(v) => Field::present(v, propagate_confidence(input_confidences), source),
        None => Field::missing(source, "insufficient data"),
    }
}

fn trailing_return(closes: &[Decimal], periods_ago: usize) -> Option<f64> {
    if closes.len() <= periods_ago {
        return None;
    }
    let now = closes[closes.len() - 1];
    let then = closes[closes.len() - 1 - periods_ago];
    if then.is_zero() {
        return None;
    }
    ((now - then) / then).to_f64()
}

fn sma_distance_pct(closes: &[Decimal], period: usize) -> Option<f64> {
    let average = sma(closes, period)?;
    let last = *closes.last()?;
    if average.is_zero() {
        return None;
    }
    ((last - average) / average * Decimal::from(100)).to_f64()
}

/// Derives the Oracle-facing feature set from a fetched signal bundle plus
/// the scheduler's running candle history. One candle is assumed per hour
/// of the cadence the history was collected at (the fast/medium loops feed
/// the same history forward), so `realized_vol_24h` windows the trailing 24
/// candles rather than a fixed wall-clock span.
///
/// `cross_asset_correlation` and `macro_risk_score` are left `Missing`: a
/// single bundle carries neither a second asset's return series nor a
/// macro risk model, and fabricating either would silently misrepresent
/// confidence rather than honestly reporting data the agent doesn't have.
pub fn build_regime_signals(bundle: &SignalBundle, candles: &[Candle]) -> RegimeSignals {
    let closes: Vec<Decimal> = candles.iter().map(|c| c.close).collect();
    let recent_window = &closes[closes.len().saturating_sub(24)..];

    let higher_high = candles.len() >= 2 && candles.last().map(|c| c.high) > candles.get(candles.len() - 2).map(|c| c.high);
    let higher_low = candles.len() >= 2 && candles.last().map(|c| c.low) > candles.get(candles.len() - 2).map(|c| c.low);

    RegimeSignals {
        return_1d: trailing_return(&closes, 1),
        return_7d: trailing_return(&closes, 7),
        return_30d: trailing_return(&closes, 30),
        return_90d: trailing_return(&closes, 90),
        sma20_distance_pct: sma_distance_pct(&closes, 20),
        sma50_distance_pct: sma_distance_pct(&closes, 50),
        higher_high: if candles.len() >= 2 { Some(higher_high) } else { None },
        higher_low: if candles.len() >= 2 { Some(higher_low) } else { None },
        adx: adx(candles, 14).and_then(|v| v.to_f64()),
        realized_vol_24h: realized_volatility(recent_window, Cadence::Hourly),
        avg_funding_rate: bundle.funding_rate.as_ref().and_then(|f| f.value()).and_then(|d| d.to_f64()),
        bid_ask_spread_bps: bundle.bid_ask_spread_bps.as_ref().and_then(|f| f.value()).and_then(|d| d.to_f64()),
        order_book_depth: bundle.order_book_depth.as_ref().and_then(|f| f.value()).and_then(|d| d.to_f64()),
        cross_asset_correlation: None,
        macro_risk_score: None,
        sentiment_index: bundle.fear_greed_index.as_ref().and_then(|f| f.value()).copied(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn sma_requires_full_period() {
        let closes = vec![dec!(1), dec!(2), dec!(3)];
        assert_eq!(sma(&closes, 3), Some(dec!(2)));
        assert_eq!(sma(&closes, 4), None);
    }

    fn candle(h: i64, l: i64, c: i64) -> Candle {
        Candle { open: Decimal::from(c), high: Decimal::from(h), low: Decimal::from(l), close: Decimal::from(c), volume: Decimal::ZERO, timestamp: 0 }
    }

    #[test]
    fn adx_short_window_falls_back_to_dx_approximation() {
        let candles: Vec<Candle> = (0..16)
            .map(|i| candle(100 + i, 90 + i, 95 + i))
            .collect();
        // 16 candles, period 14: 16 < 2*14, so this takes the DX fallback path.
        let result = adx(&candles, 14);
        assert!(result.is_some());
    }

    #[test]
    fn adx_long_window_uses_wilder_smoothing() {
        let candles: Vec<Candle> = (0..40)
            .map(|i| candle(100 + i, 90 + i, 95 + i))
            .collect();
        // 40 candles, period 14: 40 >= 2*14, full smoothing path.
        let result = adx(&candles, 14);
        assert!(result.is_some());
    }

    #[test]
    fn realized_volatility_annualizes_by_sqrt_periods() {
        let closes: Vec<Decimal> = vec![dec!(100), dec!(101), dec!(99), dec!(102), dec!(98)];
        let vol = realized_volatility(&closes, Cadence::Daily).unwrap();
        assert!(vol > 0.0);
    }

    #[test]
    fn pearson_correlation_of_identical_series_is_one() {
        let series = vec![0.01, -0.02, 0.03, 0.01];
        assert!((pearson_correlation(&series, &series).unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn max_drawdown_tracks_worst_peak_to_trough() {
        let values = vec![dec!(100), dec!(120), dec!(90), dec!(110)];
        let dd = max_drawdown(&values);
        assert_eq!(dd, (dec!(120) - dec!(90)) / dec!(120));
    }

    #[test]
    fn propagate_confidence_takes_the_minimum() {
        assert_eq!(propagate_confidence(&[0.9, 0.5, 0.8]), 0.5);
    }

    #[test]
    fn build_regime_signals_leaves_cross_asset_fields_missing() {
        let candles: Vec<Candle> = (0..10).map(|i| candle(100 + i, 90 + i, 95 + i)).collect();
        let bundle = crate::domain::signals::SignalBundle::fallback(crate::domain::signals::SignalKind::Medium, chrono::Utc::now());
        let signals = build_regime_signals(&bundle, &candles);
        assert!(signals.cross_asset_correlation.is_none());
        assert!(signals.macro_risk_score.is_none());
        assert_eq!(signals.higher_high, Some(true));
        assert!(signals.return_1d.is_some());
        assert!(signals.return_90d.is_none());
    }

    #[test]
    fn build_regime_signals_handles_empty_history() {
        let bundle = crate::domain::signals::SignalBundle::fallback(crate::domain::signals::SignalKind::Fast, chrono::Utc::now());
        let signals = build_regime_signals(&bundle, &[]);
        assert!(signals.return_1d.is_none());
        assert!(signals.higher_high.is_none());
    }
}
