// =============================================================================
// Ichimoku Cloud (Kinko Hyo)
// =============================================================================
//
// Conversion (Tenkan-sen, 9):  (highest-high + lowest-low) / 2 over 9 bars
// Base (Kijun-sen, 26):        same formula over 26 bars
// Leading Span A (Senkou A):   (Tenkan + Kijun) / 2, projected 26 bars ahead
// Leading Span B (Senkou B):   (highest-high + lowest-low) / 2 over 52 bars,
//                               projected 26 bars ahead
//
// This module reports the *current* unshifted cloud values; the engine only
// needs today's cloud thickness and price-vs-cloud position, not the plotted
// forward-shifted chart the 26-bar projection implies.

use crate::market_data::Candle;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IchimokuResult {
    pub tenkan: f64,
    pub kijun: f64,
    pub senkou_a: f64,
    pub senkou_b: f64,
    /// true when price trades above both cloud spans.
    pub above_cloud: bool,
    /// true when price trades below both cloud spans.
    pub below_cloud: bool,
}

fn high_low_midpoint(candles: &[Candle], period: usize) -> Option<f64> {
    if candles.len() < period {
        return None;
    }
    let window = &candles[candles.len() - period..];
    let high = window.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
    let low = window.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
    let mid = (high + low) / 2.0;
    if mid.is_finite() {
        Some(mid)
    } else {
        None
    }
}

/// Compute the current (unshifted) Ichimoku cloud state.
///
/// Returns `None` when there are fewer than 52 candles (the Senkou Span B
/// look-back), or an intermediate value is non-finite.
pub fn calculate_ichimoku(candles: &[Candle]) -> Option<IchimokuResult> {
    if candles.len() < 52 {
        return None;
    }
    let tenkan = high_low_midpoint(candles, 9)?;
    let kijun = high_low_midpoint(candles, 26)?;
    let senkou_a = (tenkan + kijun) / 2.0;
    let senkou_b = high_low_midpoint(candles, 52)?;

    let price = candles.last()?.close;
    let cloud_top = senkou_a.max(senkou_b);
    let cloud_bottom = senkou_a.min(senkou_b);

    Some(IchimokuResult {
        tenkan,
        kijun,
        senkou_a,
        senkou_b,
        above_cloud: price > cloud_top,
        below_cloud: price < cloud_bottom,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(high: f64, low: f64, close: f64) -> Candle {
        Candle {
            open_time: 0,
            close_time: 0,
            open: close,
            high,
            low,
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
    fn ichimoku_insufficient_data() {
        let candles = vec![candle(101.0, 99.0, 100.0); 40];
        assert!(calculate_ichimoku(&candles).is_none());
    }

    #[test]
    fn ichimoku_uptrend_reports_above_cloud() {
        let candles: Vec<Candle> = (0..60)
            .map(|i| {
                let base = 100.0 + i as f64 * 2.0;
                candle(base + 1.0, base - 1.0, base)
            })
            .collect();
        let result = calculate_ichimoku(&candles).unwrap();
        assert!(result.above_cloud);
        assert!(!result.below_cloud);
    }

    #[test]
    fn ichimoku_flat_market_is_inside_cloud() {
        let candles = vec![candle(101.0, 99.0, 100.0); 60];
        let result = calculate_ichimoku(&candles).unwrap();
        assert!(!result.above_cloud);
        assert!(!result.below_cloud);
    }
}
