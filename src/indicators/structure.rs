// =============================================================================
// Market Structure — pivots, trend, higher-highs / higher-lows detection
// =============================================================================
//
// A swing high/low is confirmed when a candle's high (low) is the highest
// (lowest) over a 2-bar window on either side. Trend classification compares
// the two most recent confirmed highs and the two most recent confirmed lows:
//
//   HH + HL  => bullish
//   LH + LL  => bearish
//   anything mixed => neutral

use crate::market_data::Candle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructureTrend {
    Bullish,
    Bearish,
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MarketStructure {
    pub higher_high: bool,
    pub higher_low: bool,
    pub lower_high: bool,
    pub lower_low: bool,
}

impl MarketStructure {
    pub fn trend(&self) -> StructureTrend {
        if self.higher_high && self.higher_low {
            StructureTrend::Bullish
        } else if self.lower_high && self.lower_low {
            StructureTrend::Bearish
        } else {
            StructureTrend::Neutral
        }
    }
}

const CONFIRM_BARS: usize = 2;

fn pivot_highs(candles: &[Candle]) -> Vec<(usize, f64)> {
    let mut pivots = Vec::new();
    if candles.len() < CONFIRM_BARS * 2 + 1 {
        return pivots;
    }
    for i in CONFIRM_BARS..candles.len() - CONFIRM_BARS {
        let h = candles[i].high;
        let is_pivot = (i - CONFIRM_BARS..i)
            .chain(i + 1..=i + CONFIRM_BARS)
            .all(|j| candles[j].high <= h);
        if is_pivot {
            pivots.push((i, h));
        }
    }
    pivots
}

fn pivot_lows(candles: &[Candle]) -> Vec<(usize, f64)> {
    let mut pivots = Vec::new();
    if candles.len() < CONFIRM_BARS * 2 + 1 {
        return pivots;
    }
    for i in CONFIRM_BARS..candles.len() - CONFIRM_BARS {
        let l = candles[i].low;
        let is_pivot = (i - CONFIRM_BARS..i)
            .chain(i + 1..=i + CONFIRM_BARS)
            .all(|j| candles[j].low >= l);
        if is_pivot {
            pivots.push((i, l));
        }
    }
    pivots
}

/// Classify market structure over the trailing `lookback` candles.
///
/// Requires at least two confirmed swing highs and two confirmed swing lows
/// within the window; otherwise returns the default (all-false) structure,
/// which carries a neutral trend.
pub fn detect_structure(candles: &[Candle], lookback: usize) -> MarketStructure {
    if candles.len() < lookback.max(CONFIRM_BARS * 2 + 1) {
        return MarketStructure::default();
    }
    let window = &candles[candles.len() - lookback..];

    let highs = pivot_highs(window);
    let lows = pivot_lows(window);

    if highs.len() < 2 || lows.len() < 2 {
        return MarketStructure::default();
    }

    let (_, prev_high) = highs[highs.len() - 2];
    let (_, last_high) = highs[highs.len() - 1];
    let (_, prev_low) = lows[lows.len() - 2];
    let (_, last_low) = lows[lows.len() - 1];

    MarketStructure {
        higher_high: last_high > prev_high,
        higher_low: last_low > prev_low,
        lower_high: last_high < prev_high,
        lower_low: last_low < prev_low,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(high: f64, low: f64) -> Candle {
        Candle {
            open_time: 0,
            close_time: 0,
            open: (high + low) / 2.0,
            high,
            low,
            close: (high + low) / 2.0,
            volume: 1.0,
            quote_volume: 1.0,
            trades_count: 1,
            taker_buy_volume: 0.5,
            taker_buy_quote_volume: 0.5,
            is_closed: true,
        }
    }

    #[test]
    fn structure_insufficient_data() {
        let candles = vec![candle(101.0, 99.0); 3];
        assert_eq!(detect_structure(&candles, 40).trend(), StructureTrend::Neutral);
    }

    #[test]
    fn structure_detects_uptrend() {
        // Zigzag with each swing higher than the last.
        let mut candles = Vec::new();
        let mut base = 100.0;
        for _ in 0..10 {
            candles.push(candle(base + 1.0, base - 1.0));
            candles.push(candle(base + 3.0, base + 0.5));
            candles.push(candle(base + 1.5, base - 0.5));
            base += 5.0;
        }
        let structure = detect_structure(&candles, candles.len());
        assert_eq!(structure.trend(), StructureTrend::Bullish);
    }

    #[test]
    fn structure_detects_downtrend() {
        let mut candles = Vec::new();
        let mut base = 200.0;
        for _ in 0..10 {
            candles.push(candle(base + 1.0, base - 1.0));
            candles.push(candle(base - 0.5, base - 3.0));
            candles.push(candle(base + 0.5, base - 1.5));
            base -= 5.0;
        }
        let structure = detect_structure(&candles, candles.len());
        assert_eq!(structure.trend(), StructureTrend::Bearish);
    }
}
