// =============================================================================
// Candle patterns and candle context
// =============================================================================
//
// Single-candle pattern recognition (engulfing, pin-bar, doji, hammer,
// shooting-star) plus CandleContext: a summary of recent price action used
// by the Entry Layer's candle confirmation step (spec "big candle straddling
// the price rejects the entry outright").

use crate::market_data::Candle;
use crate::types::CandlePattern;

use super::atr::calculate_atr;

fn body(c: &Candle) -> f64 {
    (c.close - c.open).abs()
}

fn range(c: &Candle) -> f64 {
    c.high - c.low
}

fn is_bullish(c: &Candle) -> bool {
    c.close > c.open
}

fn is_bearish(c: &Candle) -> bool {
    c.close < c.open
}

/// Classify the most recent candle in `candles`, optionally using the prior
/// candle for two-bar patterns (engulfing). Returns `CandlePattern::None`
/// when fewer than 2 candles are available or no pattern matches.
pub fn classify_last(candles: &[Candle]) -> CandlePattern {
    if candles.is_empty() {
        return CandlePattern::None;
    }
    let last = candles.last().unwrap();
    let r = range(last);
    if r <= 0.0 {
        return CandlePattern::None;
    }
    let b = body(last);
    let body_ratio = b / r;

    // Doji: negligible body relative to range.
    if body_ratio < 0.1 {
        return CandlePattern::Doji;
    }

    let upper_wick = last.high - last.open.max(last.close);
    let lower_wick = last.open.min(last.close) - last.low;

    // Hammer: small body near the top, long lower wick, little upper wick.
    if lower_wick > b * 2.0 && upper_wick < b * 0.5 {
        return CandlePattern::Hammer;
    }
    // Shooting star: small body near the bottom, long upper wick.
    if upper_wick > b * 2.0 && lower_wick < b * 0.5 {
        return CandlePattern::ShootingStar;
    }

    // Pin bar: dominated by one wick on either side, body in the outer third.
    if upper_wick > r * 0.6 && body_ratio < 0.3 {
        return CandlePattern::PinBarBearish;
    }
    if lower_wick > r * 0.6 && body_ratio < 0.3 {
        return CandlePattern::PinBarBullish;
    }

    // Engulfing: needs a prior candle whose body is fully engulfed.
    if candles.len() >= 2 {
        let prev = &candles[candles.len() - 2];
        let prev_body_low = prev.open.min(prev.close);
        let prev_body_high = prev.open.max(prev.close);
        let last_body_low = last.open.min(last.close);
        let last_body_high = last.open.max(last.close);

        if is_bullish(last)
            && is_bearish(prev)
            && last_body_low <= prev_body_low
            && last_body_high >= prev_body_high
        {
            return CandlePattern::BullishEngulfing;
        }
        if is_bearish(last)
            && is_bullish(prev)
            && last_body_low <= prev_body_low
            && last_body_high >= prev_body_high
        {
            return CandlePattern::BearishEngulfing;
        }
    }

    CandlePattern::None
}

/// Derived summary of recent candle action consumed by the Entry Layer's
/// confirmation step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CandleContext {
    /// A large opposite-color candle (>1.5x average true range) straddles
    /// the current price from above — resistance.
    pub big_candle_resistance: bool,
    /// Same, but straddling from below — support.
    pub big_candle_support: bool,
    /// true if the last candle closed bullish.
    pub last_bullish: bool,
    /// Body size as a fraction of the candle's full range, in [0, 1].
    pub body_ratio: f64,
    /// Count of consecutive candles sharing the last candle's direction.
    pub consecutive_same_direction: u32,
}

/// Build a `CandleContext` for the given candle window and current price.
///
/// Returns `None` when there are fewer than 15 candles (enough for a
/// meaningful average true range) or the last candle has zero range.
pub fn build_candle_context(candles: &[Candle], current_price: f64) -> Option<CandleContext> {
    if candles.len() < 15 {
        return None;
    }
    let last = candles.last()?;
    let r = range(last);
    if r <= 0.0 {
        return None;
    }
    let body_ratio = body(last) / r;
    let last_bullish = is_bullish(last);

    let atr_avg = calculate_atr(candles, 14)?;

    let mut big_candle_resistance = false;
    let mut big_candle_support = false;
    for c in candles.iter().rev().take(20) {
        let c_range = range(c);
        if c_range <= 1.5 * atr_avg {
            continue;
        }
        let straddles = c.low <= current_price && c.high >= current_price;
        if !straddles {
            continue;
        }
        if is_bearish(c) && c.low > current_price - c_range * 0.1 {
            big_candle_resistance = true;
        }
        if is_bullish(c) && c.high < current_price + c_range * 0.1 {
            big_candle_support = true;
        }
    }

    let mut consecutive = 1u32;
    for pair in candles.iter().rev().collect::<Vec<_>>().windows(2) {
        if is_bullish(pair[0]) == is_bullish(pair[1]) {
            consecutive += 1;
        } else {
            break;
        }
    }

    Some(CandleContext {
        big_candle_resistance,
        big_candle_support,
        last_bullish,
        body_ratio,
        consecutive_same_direction: consecutive,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            open_time: 0,
            close_time: 0,
            open,
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
    fn classify_doji() {
        let candles = vec![candle(100.0, 102.0, 98.0, 100.05)];
        assert_eq!(classify_last(&candles), CandlePattern::Doji);
    }

    #[test]
    fn classify_hammer() {
        let candles = vec![candle(100.0, 100.5, 94.0, 100.3)];
        assert_eq!(classify_last(&candles), CandlePattern::Hammer);
    }

    #[test]
    fn classify_shooting_star() {
        let candles = vec![candle(100.0, 106.0, 99.5, 100.2)];
        assert_eq!(classify_last(&candles), CandlePattern::ShootingStar);
    }

    #[test]
    fn classify_bullish_engulfing() {
        let candles = vec![
            candle(100.0, 100.5, 97.0, 98.0), // bearish
            candle(97.5, 101.0, 97.0, 100.5), // bullish, engulfs prior body
        ];
        assert_eq!(classify_last(&candles), CandlePattern::BullishEngulfing);
    }

    #[test]
    fn candle_context_requires_minimum_history() {
        let candles = vec![candle(100.0, 101.0, 99.0, 100.5); 5];
        assert!(build_candle_context(&candles, 100.0).is_none());
    }

    #[test]
    fn candle_context_tracks_consecutive_direction() {
        let mut candles = Vec::new();
        for i in 0..20 {
            let base = 100.0 + i as f64;
            candles.push(candle(base, base + 1.0, base - 0.5, base + 0.8));
        }
        let ctx = build_candle_context(&candles, 119.0).unwrap();
        assert!(ctx.last_bullish);
        assert!(ctx.consecutive_same_direction >= 2);
    }
}
