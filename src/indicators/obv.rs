// =============================================================================
// On-Balance Volume (OBV)
// =============================================================================
//
// Running total of signed volume: add volume on an up close, subtract on a
// down close, carry forward on an unchanged close. Divergence between OBV's
// trend and price's trend is a leading indicator (see divergence.rs).

use crate::market_data::Candle;

/// Compute the full OBV series for a slice of closed candles.
///
/// Returns an empty vec for fewer than 2 candles (no deltas to sign).
pub fn calculate_obv(candles: &[Candle]) -> Vec<f64> {
    if candles.len() < 2 {
        return Vec::new();
    }

    let mut obv = Vec::with_capacity(candles.len());
    let mut running = 0.0;
    obv.push(running);

    for pair in candles.windows(2) {
        let (prev, cur) = (&pair[0], &pair[1]);
        if cur.close > prev.close {
            running += cur.volume;
        } else if cur.close < prev.close {
            running -= cur.volume;
        }
        obv.push(running);
    }
    obv
}

/// Short-period OBV slope as a crude trend signal: positive means
/// accumulation, negative means distribution.
pub fn obv_slope(candles: &[Candle], lookback: usize) -> Option<f64> {
    let series = calculate_obv(candles);
    if series.len() < lookback + 1 || lookback == 0 {
        return None;
    }
    let recent = &series[series.len() - lookback - 1..];
    let first = *recent.first()?;
    let last = *recent.last()?;
    Some(last - first)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(close: f64, volume: f64) -> Candle {
        Candle {
            open_time: 0,
            close_time: 0,
            open: close,
            high: close,
            low: close,
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
    fn obv_insufficient_data() {
        assert!(calculate_obv(&[candle(100.0, 10.0)]).is_empty());
    }

    #[test]
    fn obv_accumulates_on_up_closes() {
        let candles = vec![
            candle(100.0, 10.0),
            candle(101.0, 5.0),
            candle(102.0, 5.0),
        ];
        let obv = calculate_obv(&candles);
        assert_eq!(obv, vec![0.0, 5.0, 10.0]);
    }

    #[test]
    fn obv_distributes_on_down_closes() {
        let candles = vec![
            candle(100.0, 10.0),
            candle(99.0, 5.0),
            candle(98.0, 5.0),
        ];
        let obv = calculate_obv(&candles);
        assert_eq!(obv, vec![0.0, -5.0, -10.0]);
    }

    #[test]
    fn obv_slope_positive_on_accumulation() {
        let candles = vec![
            candle(100.0, 10.0),
            candle(101.0, 5.0),
            candle(102.0, 5.0),
        ];
        assert_eq!(obv_slope(&candles, 2), Some(10.0));
    }
}
