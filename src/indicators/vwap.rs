// =============================================================================
// Volume-Weighted Average Price (VWAP)
// =============================================================================
//
// VWAP = sum(typical_price * volume) / sum(volume) over the supplied window.
// Typical price = (high + low + close) / 3. Callers are expected to pass a
// session-scoped slice of candles (the engine resets its VWAP window daily).

use crate::market_data::Candle;

/// Compute VWAP over the full supplied candle slice.
///
/// Returns `None` for an empty slice or when total volume is zero
/// (no trading activity to weight by).
pub fn calculate_vwap(candles: &[Candle]) -> Option<f64> {
    if candles.is_empty() {
        return None;
    }
    let mut pv_sum = 0.0;
    let mut v_sum = 0.0;
    for c in candles {
        let typical = (c.high + c.low + c.close) / 3.0;
        pv_sum += typical * c.volume;
        v_sum += c.volume;
    }
    if v_sum <= 0.0 {
        return None;
    }
    let vwap = pv_sum / v_sum;
    if vwap.is_finite() {
        Some(vwap)
    } else {
        None
    }
}

/// Percentage distance of `price` from VWAP: positive means above VWAP.
pub fn vwap_deviation_pct(candles: &[Candle], price: f64) -> Option<f64> {
    let vwap = calculate_vwap(candles)?;
    if vwap == 0.0 {
        return None;
    }
    Some((price - vwap) / vwap * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(high: f64, low: f64, close: f64, volume: f64) -> Candle {
        Candle {
            open_time: 0,
            close_time: 0,
            open: close,
            high,
            low,
            close,
            volume,
            quote_volume: volume * close,
            trades_count: 1,
            taker_buy_volume: volume / 2.0,
            taker_buy_quote_volume: volume * close / 2.0,
            is_closed: true,
        }
    }

    #[test]
    fn vwap_empty_input() {
        assert!(calculate_vwap(&[]).is_none());
    }

    #[test]
    fn vwap_zero_volume_is_none() {
        let candles = vec![candle(101.0, 99.0, 100.0, 0.0); 5];
        assert!(calculate_vwap(&candles).is_none());
    }

    #[test]
    fn vwap_basic_average() {
        let candles = vec![
            candle(102.0, 98.0, 100.0, 10.0),
            candle(102.0, 98.0, 100.0, 10.0),
        ];
        let vwap = calculate_vwap(&candles).unwrap();
        assert!((vwap - 100.0).abs() < 1e-9);
    }

    #[test]
    fn vwap_deviation_positive_above() {
        let candles = vec![candle(102.0, 98.0, 100.0, 10.0); 3];
        let dev = vwap_deviation_pct(&candles, 110.0).unwrap();
        assert!(dev > 0.0);
    }
}
