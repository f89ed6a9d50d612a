// =============================================================================
// Divergence detection — RSI and MACD vs. price
// =============================================================================
//
// Splits the trailing `lookback` candles into two halves and compares the
// price extreme in each half against the oscillator extreme in the same
// half:
//
//   Bullish divergence: price makes a lower low, oscillator makes a higher low.
//   Bearish divergence: price makes a higher high, oscillator makes a lower high.

use crate::market_data::Candle;

use super::macd::calculate_macd;
use super::rsi::calculate_rsi;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DivergenceKind {
    Bullish,
    Bearish,
    None,
}

fn split_extreme(values: &[f64], want_min: bool) -> Option<(f64, f64)> {
    if values.len() < 4 {
        return None;
    }
    let mid = values.len() / 2;
    let (first, second) = values.split_at(mid);
    let extreme = |slice: &[f64]| -> f64 {
        if want_min {
            slice.iter().cloned().fold(f64::INFINITY, f64::min)
        } else {
            slice.iter().cloned().fold(f64::NEG_INFINITY, f64::max)
        }
    };
    Some((extreme(first), extreme(second)))
}

fn detect_from_series(closes: &[f64], oscillator: &[f64]) -> DivergenceKind {
    let price_window = &closes[closes.len().saturating_sub(oscillator.len())..];
    if price_window.len() != oscillator.len() || oscillator.len() < 4 {
        return DivergenceKind::None;
    }

    let (price_low_1, price_low_2) = match split_extreme(price_window, true) {
        Some(v) => v,
        None => return DivergenceKind::None,
    };
    let (osc_low_1, osc_low_2) = match split_extreme(oscillator, true) {
        Some(v) => v,
        None => return DivergenceKind::None,
    };
    if price_low_2 < price_low_1 && osc_low_2 > osc_low_1 {
        return DivergenceKind::Bullish;
    }

    let (price_high_1, price_high_2) = match split_extreme(price_window, false) {
        Some(v) => v,
        None => return DivergenceKind::None,
    };
    let (osc_high_1, osc_high_2) = match split_extreme(oscillator, false) {
        Some(v) => v,
        None => return DivergenceKind::None,
    };
    if price_high_2 > price_high_1 && osc_high_2 < osc_high_1 {
        return DivergenceKind::Bearish;
    }

    DivergenceKind::None
}

/// RSI divergence over the trailing `lookback` candles.
pub fn rsi_divergence(candles: &[Candle], lookback: usize, rsi_period: usize) -> DivergenceKind {
    if candles.len() < lookback {
        return DivergenceKind::None;
    }
    let window = &candles[candles.len() - lookback..];
    let closes: Vec<f64> = window.iter().map(|c| c.close).collect();
    let rsi_series = calculate_rsi(&closes, rsi_period);
    if rsi_series.is_empty() {
        return DivergenceKind::None;
    }
    detect_from_series(&closes, &rsi_series)
}

/// MACD-histogram divergence over the trailing `lookback` candles.
pub fn macd_divergence(candles: &[Candle], lookback: usize) -> DivergenceKind {
    if candles.len() < lookback {
        return DivergenceKind::None;
    }
    let window = &candles[candles.len() - lookback..];
    let closes: Vec<f64> = window.iter().map(|c| c.close).collect();

    // Build a rolling histogram series by sliding a MACD window across closes.
    let mut histogram_series = Vec::new();
    for end in 35..=closes.len() {
        if let Some(result) = calculate_macd(&closes[..end], 12, 26, 9) {
            histogram_series.push(result.histogram);
        }
    }
    if histogram_series.is_empty() {
        return DivergenceKind::None;
    }
    let price_tail = &closes[closes.len() - histogram_series.len()..];
    detect_from_series(price_tail, &histogram_series)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(close: f64) -> Candle {
        Candle {
            open_time: 0,
            close_time: 0,
            open: close,
            high: close + 0.5,
            low: close - 0.5,
            close,
            volume: 1.0,
            quote_volume: 1.0,
            trades_count: 1,
            taker_buy_volume: 0.5,
            taker_buy_quote_volume: 0.5,
            is_closed: true,
        }
    }

    #[test]
    fn rsi_divergence_insufficient_data() {
        let candles: Vec<Candle> = (0..5).map(|i| candle(100.0 + i as f64)).collect();
        assert_eq!(rsi_divergence(&candles, 40, 14), DivergenceKind::None);
    }

    #[test]
    fn rsi_divergence_detects_bullish() {
        // Price: falls hard then falls slightly (lower low).
        // RSI: oversold extreme in the first half, less oversold in the
        // second half (higher low) because the decline has lost momentum.
        let mut closes = Vec::new();
        for i in 0..20 {
            closes.push(100.0 - i as f64 * 3.0); // steep decline
        }
        for i in 0..20 {
            closes.push(closes[19] - i as f64 * 0.2); // shallow decline, new low
        }
        let candles: Vec<Candle> = closes.iter().map(|&c| candle(c)).collect();
        let result = rsi_divergence(&candles, 40, 14);
        assert_eq!(result, DivergenceKind::Bullish);
    }
}
