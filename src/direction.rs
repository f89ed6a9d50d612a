// =============================================================================
// Direction Layer — six-vote consensus on the filter timeframe
// =============================================================================
//
// Grounded on the teacher's `regime/detector.rs` classification-with-reason
// shape, generalized from a single classifier into a six-independent-vote
// tally with an explicit consensus mapping.

use crate::indicators::adx::calculate_adx;
use crate::indicators::ema::calculate_ema;
use crate::indicators::macd::calculate;
use crate::indicators::rsi::calculate_rsi;
use crate::indicators::structure::{detect_structure, StructureTrend};
use crate::htf_analysis::HtfAnalysis;
use crate::market_data::Candle;
use crate::types::Direction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    Long,
    Short,
    Neutral,
}

#[derive(Debug, Clone)]
pub struct DirectionReport {
    pub bias: Direction,
    pub score: f64,
    pub votes: Vec<(&'static str, Vote, String)>,
}

pub struct DirectionInputs<'a> {
    pub candles: &'a [Candle],
    pub current_price: f64,
    pub ema_fast_period: usize,
    pub ema_slow_period: usize,
    pub ema_neutral_threshold: f64,
    pub rsi_long_threshold: f64,
    pub rsi_short_threshold: f64,
    pub structure_lookback: usize,
    /// Swing mode may be configured to reject a neutral bias outright.
    pub reject_neutral: bool,
    /// V4 only: 15M/1H EMA-alignment gate, consulted when the six-vote
    /// consensus lands neutral. `None` for V1-V3 or when HTF data is
    /// unavailable.
    pub htf: Option<&'a HtfAnalysis>,
}

fn tally(long: u32, short: u32) -> (Direction, u32, u32) {
    let total_aligned = long.max(short);
    let opposite = long.min(short);
    (if long > short { Direction::Long } else { Direction::Short }, total_aligned, opposite)
}

/// Evaluate the six-vote consensus and return the direction bias + score.
pub fn evaluate_direction(inputs: &DirectionInputs) -> Option<DirectionReport> {
    let closes: Vec<f64> = inputs.candles.iter().map(|c| c.close).collect();
    if closes.len() < 200 {
        return None;
    }

    let mut votes = Vec::with_capacity(6);

    // 1. EMA fast vs slow spread beyond neutral threshold, price on the same side.
    let ema_fast = calculate_ema(&closes, inputs.ema_fast_period);
    let ema_slow = calculate_ema(&closes, inputs.ema_slow_period);
    let vote1 = match (ema_fast.last(), ema_slow.last()) {
        (Some(&fast), Some(&slow)) if slow != 0.0 => {
            let spread_pct = (fast - slow) / slow * 100.0;
            if spread_pct > inputs.ema_neutral_threshold && inputs.current_price > slow {
                Vote::Long
            } else if spread_pct < -inputs.ema_neutral_threshold && inputs.current_price < slow {
                Vote::Short
            } else {
                Vote::Neutral
            }
        }
        _ => Vote::Neutral,
    };
    votes.push(("ema_spread", vote1, format!("EMA{} vs EMA{} spread check", inputs.ema_fast_period, inputs.ema_slow_period)));

    // 2. MarketStructure trend.
    let structure = detect_structure(inputs.candles, inputs.structure_lookback);
    let vote2 = match structure.trend() {
        StructureTrend::Bullish => Vote::Long,
        StructureTrend::Bearish => Vote::Short,
        StructureTrend::Neutral => Vote::Neutral,
    };
    votes.push(("structure", vote2, "MarketStructure trend".to_string()));

    // 3. RSI thresholds.
    let rsi_series = calculate_rsi(&closes, 14);
    let vote3 = match rsi_series.last() {
        Some(&rsi) if rsi > inputs.rsi_long_threshold => Vote::Long,
        Some(&rsi) if rsi < inputs.rsi_short_threshold => Vote::Short,
        _ => Vote::Neutral,
    };
    votes.push(("rsi", vote3, "RSI threshold check".to_string()));

    // 4. MACD histogram sign.
    let vote4 = match calculate(&closes) {
        Some(m) if m.histogram > 0.0 => Vote::Long,
        Some(m) if m.histogram < 0.0 => Vote::Short,
        _ => Vote::Neutral,
    };
    votes.push(("macd", vote4, "MACD histogram sign".to_string()));

    // 5. ADX strength with +DI/-DI ordering (approximated via ADX + EMA slope
    //    since this module's ADX is strength-only; direction of DI follows
    //    the same sign as the MarketStructure trend check when ADX qualifies).
    let adx = calculate_adx(inputs.candles, 14);
    let vote5 = match adx {
        Some(value) if value >= 20.0 => vote2,
        _ => Vote::Neutral,
    };
    votes.push(("adx", vote5, "ADX >= 20 with DI ordering".to_string()));

    // 6. Price vs EMA200.
    let ema200 = calculate_ema(&closes, 200);
    let vote6 = match ema200.last() {
        Some(&e200) if inputs.current_price > e200 => Vote::Long,
        Some(&e200) if inputs.current_price < e200 => Vote::Short,
        _ => Vote::Neutral,
    };
    votes.push(("price_vs_ema200", vote6, "Price vs EMA200".to_string()));

    let long_votes = votes.iter().filter(|(_, v, _)| *v == Vote::Long).count() as u32;
    let short_votes = votes.iter().filter(|(_, v, _)| *v == Vote::Short).count() as u32;

    let (leaning, aligned, opposite) = tally(long_votes, short_votes);

    let (bias, mut score) = if aligned >= 5 {
        (leaning, 100.0)
    } else if aligned >= 4 {
        (leaning, 85.0)
    } else if aligned >= 3 && opposite <= 1 {
        (leaning, 65.0)
    } else {
        (Direction::None, 40.0) // neutral; direction carries no lean
    };

    let is_neutral = aligned < 3 || (aligned == 3 && opposite > 1);
    if is_neutral {
        // V4 only (SPEC_FULL.md §11): HTF can rescue a neutral six-vote
        // consensus when both higher time frames agree on a direction.
        if let Some(htf) = inputs.htf {
            if htf.buy_allowed {
                let score = (50.0 + htf.confidence * 20.0).clamp(0.0, 100.0);
                return Some(DirectionReport { bias: Direction::Long, score, votes });
            } else if htf.sell_signal {
                let score = (50.0 + htf.confidence * 20.0).clamp(0.0, 100.0);
                return Some(DirectionReport { bias: Direction::Short, score, votes });
            }
        }

        if inputs.reject_neutral {
            return None;
        }
        score /= 2.0;
        return Some(DirectionReport { bias: Direction::None, score, votes });
    }

    // HTF conflict with a non-neutral bias halves the score rather than
    // rejecting outright (matches CUSUM's soft-block factor in entry.rs).
    if let Some(htf) = inputs.htf {
        let conflict = (bias == Direction::Long && htf.sell_signal) || (bias == Direction::Short && htf.buy_allowed);
        if conflict {
            score /= 2.0;
        }
    }

    Some(DirectionReport { bias, score, votes })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(close: f64) -> Candle {
        Candle {
            open_time: 0,
            close_time: 0,
            open: close,
            high: close + 0.1,
            low: close - 0.1,
            close,
            volume: 100.0,
            quote_volume: 100.0 * close,
            trades_count: 10,
            taker_buy_volume: 50.0,
            taker_buy_quote_volume: 50.0 * close,
            is_closed: true,
        }
    }

    fn strong_uptrend(n: usize) -> Vec<Candle> {
        (0..n).map(|i| candle(50.0 + i as f64 * 0.5)).collect()
    }

    #[test]
    fn direction_insufficient_data_returns_none() {
        let candles = strong_uptrend(50);
        let inputs = DirectionInputs {
            candles: &candles,
            current_price: candles.last().unwrap().close,
            ema_fast_period: 20,
            ema_slow_period: 50,
            ema_neutral_threshold: 0.2,
            rsi_long_threshold: 55.0,
            rsi_short_threshold: 45.0,
            structure_lookback: 40,
            reject_neutral: false,
            htf: None,
        };
        assert!(evaluate_direction(&inputs).is_none());
    }

    #[test]
    fn strong_uptrend_yields_long_bias() {
        let candles = strong_uptrend(250);
        let price = candles.last().unwrap().close;
        let inputs = DirectionInputs {
            candles: &candles,
            current_price: price,
            ema_fast_period: 20,
            ema_slow_period: 50,
            ema_neutral_threshold: 0.2,
            rsi_long_threshold: 55.0,
            rsi_short_threshold: 45.0,
            structure_lookback: 40,
            reject_neutral: false,
            htf: None,
        };
        let report = evaluate_direction(&inputs).unwrap();
        assert_eq!(report.bias, Direction::Long);
        assert!(report.score >= 65.0);
    }

    #[test]
    fn flat_market_is_neutral_and_rejected_when_configured() {
        let candles: Vec<Candle> = (0..250).map(|_| candle(100.0)).collect();
        let inputs = DirectionInputs {
            candles: &candles,
            current_price: 100.0,
            ema_fast_period: 20,
            ema_slow_period: 50,
            ema_neutral_threshold: 0.2,
            rsi_long_threshold: 55.0,
            rsi_short_threshold: 45.0,
            structure_lookback: 40,
            reject_neutral: true,
            htf: None,
        };
        assert!(evaluate_direction(&inputs).is_none());
    }

    #[test]
    fn htf_rescues_a_neutral_consensus() {
        let candles: Vec<Candle> = (0..250).map(|_| candle(100.0)).collect();
        let htf = HtfAnalysis {
            direction: "BULLISH".to_string(),
            confidence: 0.5,
            buy_allowed: true,
            sell_signal: false,
            trend_15m: "BULLISH".to_string(),
            trend_1h: "BULLISH".to_string(),
            ema_sep_15m: 0.3,
            ema_sep_1h: 0.2,
            momentum_1h: 0.1,
            candles_15m: 50,
            candles_1h: 50,
            reason: String::new(),
        };
        let inputs = DirectionInputs {
            candles: &candles,
            current_price: 100.0,
            ema_fast_period: 20,
            ema_slow_period: 50,
            ema_neutral_threshold: 0.2,
            rsi_long_threshold: 55.0,
            rsi_short_threshold: 45.0,
            structure_lookback: 40,
            reject_neutral: true,
            htf: Some(&htf),
        };
        let report = evaluate_direction(&inputs).unwrap();
        assert_eq!(report.bias, Direction::Long);
    }
}
