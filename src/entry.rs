// =============================================================================
// Entry Layer — setup detectors + candle confirmation
// =============================================================================
//
// Grounded on the teacher's `strategy.rs::evaluate_symbol` pipeline shape
// (run a battery of detectors, keep the strongest, attach a confluence
// bonus) generalized to the five detectors and candle-confirmation pass
// named in the spec.

use crate::indicators::bollinger::calculate_bollinger;
use crate::indicators::candles::{build_candle_context, classify_last};
use crate::indicators::divergence::{macd_divergence, rsi_divergence, DivergenceKind};
use crate::indicators::ema::calculate_ema;
use crate::indicators::ichimoku::calculate_ichimoku;
use crate::indicators::macd::calculate as calculate_macd_default;
use crate::indicators::obv::calculate_obv;
use crate::indicators::stoch_rsi::calculate as calculate_stoch_rsi_default;
use crate::indicators::vwap::calculate_vwap;
use crate::absorption_detector::AbsorptionState;
use crate::config::EntryConfig;
use crate::cusum_detector::{CusumDetector, CusumState};
use crate::market_data::Candle;
use crate::types::{CandlePattern, Direction};

#[derive(Debug, Clone)]
pub struct EntrySetup {
    pub setup_type: &'static str,
    pub direction: Direction,
    pub entry_price: f64,
    pub pattern_score: f64,
    pub vol_score: f64,
    pub reason: String,
    pub key_level: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct EntryResult {
    pub chosen: EntrySetup,
    pub confluence_score: f64,
    pub fired_count: usize,
    pub candidates: Vec<EntrySetup>,
}

#[derive(Debug, Clone, Copy)]
pub struct CandleConfirmation {
    pub confirmed: bool,
    pub modifier: f64,
    pub reason: &'static str,
}

#[derive(Debug, Clone)]
pub struct StructuralConfirmation {
    pub modifier: f64,
    pub reason: String,
}

fn direction_matches(bias: Direction, candidate: Direction) -> bool {
    bias == candidate || bias == Direction::None
}

fn confluence_score(fired: usize) -> f64 {
    match fired {
        0 => 0.0,
        1 => 5.0,
        2 => 15.0,
        _ => 25.0,
    }
}

fn obv_rising(candles: &[Candle], lookback: usize) -> bool {
    let series = calculate_obv(candles);
    if series.len() < lookback + 1 {
        return false;
    }
    let tail = &series[series.len() - lookback - 1..];
    tail.last().unwrap() > tail.first().unwrap()
}

fn obv_falling(candles: &[Candle], lookback: usize) -> bool {
    let series = calculate_obv(candles);
    if series.len() < lookback + 1 {
        return false;
    }
    let tail = &series[series.len() - lookback - 1..];
    tail.last().unwrap() < tail.first().unwrap()
}

fn detect_breakout(
    candles: &[Candle],
    closes: &[f64],
    current_price: f64,
    volume_ratio: f64,
    bias: Direction,
    config: &EntryConfig,
) -> Option<EntrySetup> {
    let bb = calculate_bollinger(closes, 20, 2.0)?;
    if bb.width > config.bb_squeeze_threshold {
        return None;
    }
    if volume_ratio < config.volume_spike_ratio {
        return None;
    }

    let direction = if current_price > bb.upper {
        Direction::Long
    } else if current_price < bb.lower {
        Direction::Short
    } else {
        return None;
    };
    if !direction_matches(bias, direction) {
        return None;
    }

    let mut pattern_score = 30.0;
    let mut reasons = vec![format!(
        "BB width {:.2} <= squeeze {:.2}, volume ratio {:.2} >= spike {:.2}",
        bb.width, config.bb_squeeze_threshold, volume_ratio, config.volume_spike_ratio
    )];

    let obv_confirms = match direction {
        Direction::Long => obv_rising(candles, 5),
        Direction::Short => obv_falling(candles, 5),
        Direction::None => false,
    };
    if obv_confirms {
        pattern_score += 5.0;
        reasons.push("OBV last-5 confirms".to_string());
    }

    let macd_confirms = match calculate_macd_default(closes) {
        Some(m) if direction == Direction::Long => m.histogram > 0.0,
        Some(m) if direction == Direction::Short => m.histogram < 0.0,
        _ => false,
    };
    if macd_confirms {
        pattern_score += 5.0;
        reasons.push("MACD histogram confirms".to_string());
    }

    let vol_score = ((volume_ratio / config.volume_spike_ratio * 10.0).floor()).clamp(0.0, 20.0);

    Some(EntrySetup {
        setup_type: "breakout",
        direction,
        entry_price: current_price,
        pattern_score,
        vol_score,
        reason: reasons.join("; "),
        key_level: Some(if direction == Direction::Long { bb.upper } else { bb.lower }),
    })
}

fn detect_retest(
    candles: &[Candle],
    closes: &[f64],
    current_price: f64,
    bias: Direction,
    config: &EntryConfig,
) -> Option<EntrySetup> {
    if candles.len() < 20 {
        return None;
    }
    let window = &candles[candles.len() - 20..];
    let high20 = window.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
    let low20 = window.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);

    let last = candles.last()?;
    let body = (last.close - last.open).abs();
    if body <= 0.0 {
        return None;
    }

    let near_high = (current_price - high20).abs() / high20 <= config.retest_buffer_pct / 100.0;
    let near_low = (current_price - low20).abs() / low20 <= config.retest_buffer_pct / 100.0;

    let (direction, key_level, wick) = if near_high {
        let upper_wick = last.high - last.open.max(last.close);
        (Direction::Short, high20, upper_wick)
    } else if near_low {
        let lower_wick = last.open.min(last.close) - last.low;
        (Direction::Long, low20, lower_wick)
    } else {
        return None;
    };

    if wick <= config.rejection_wick_ratio * body {
        return None;
    }
    if !direction_matches(bias, direction) {
        return None;
    }

    let mut pattern_score = 28.0;
    let mut reasons = vec![format!("Rejection wick {:.2} > {:.2}x body at {:.2}", wick, config.rejection_wick_ratio, key_level)];

    let stoch_confirms = match calculate_stoch_rsi_default(closes) {
        Some(s) if direction == Direction::Long => s.k < 0.2,
        Some(s) if direction == Direction::Short => s.k > 0.8,
        _ => false,
    };
    if stoch_confirms {
        pattern_score += 5.0;
        reasons.push("Stoch-RSI extreme confirms".to_string());
    }

    if let Some(vwap) = calculate_vwap(candles) {
        let proximity = (current_price - vwap).abs() / vwap;
        if proximity <= 0.005 {
            pattern_score += 4.0;
            reasons.push("VWAP proximity confirms".to_string());
        }
    }

    Some(EntrySetup {
        setup_type: "retest",
        direction,
        entry_price: current_price,
        pattern_score,
        vol_score: 0.0,
        reason: reasons.join("; "),
        key_level: Some(key_level),
    })
}

fn detect_divergence(
    candles: &[Candle],
    current_price: f64,
    bias: Direction,
) -> Option<EntrySetup> {
    let rsi_div = rsi_divergence(candles, 40, 14);
    let macd_div = macd_divergence(candles, 60);

    let direction = match (rsi_div, macd_div) {
        (DivergenceKind::Bullish, _) | (_, DivergenceKind::Bullish) => Direction::Long,
        (DivergenceKind::Bearish, _) | (_, DivergenceKind::Bearish) => Direction::Short,
        _ => return None,
    };
    if !direction_matches(bias, direction) {
        return None;
    }

    let double = matches!(
        (rsi_div, macd_div),
        (DivergenceKind::Bullish, DivergenceKind::Bullish) | (DivergenceKind::Bearish, DivergenceKind::Bearish)
    );
    let pattern_score = if double { 38.0 } else { 30.0 };

    Some(EntrySetup {
        setup_type: "divergence",
        direction,
        entry_price: current_price,
        pattern_score,
        vol_score: 0.0,
        reason: format!("RSI divergence {:?}, MACD divergence {:?}, double={double}", rsi_div, macd_div),
        key_level: None,
    })
}

fn detect_ema_bounce(
    candles: &[Candle],
    closes: &[f64],
    current_price: f64,
    bias: Direction,
    config: &EntryConfig,
) -> Option<EntrySetup> {
    let ema20 = calculate_ema(closes, 20);
    let ema50 = calculate_ema(closes, 50);
    let (e20, e50) = (*ema20.last()?, *ema50.last()?);
    if e20 == 0.0 {
        return None;
    }

    let proximity = (current_price - e20).abs() / e20;
    if proximity > config.ema_bounce_proximity_pct / 100.0 {
        return None;
    }

    let direction = if e20 > e50 {
        Direction::Long
    } else if e20 < e50 {
        Direction::Short
    } else {
        return None;
    };
    if !direction_matches(bias, direction) {
        return None;
    }

    let pattern = classify_last(candles);
    let confirming = matches!(
        (direction, pattern),
        (Direction::Long, CandlePattern::BullishEngulfing | CandlePattern::PinBarBullish)
            | (Direction::Short, CandlePattern::BearishEngulfing | CandlePattern::PinBarBearish)
    );
    if !confirming {
        return None;
    }

    let mut pattern_score = 27.0;
    let mut reasons = vec![format!("Price within {:.2}% of EMA20, confirming {:?}", config.ema_bounce_proximity_pct, pattern)];

    if let Some(ichimoku) = calculate_ichimoku(candles) {
        let on_right_side = (direction == Direction::Long && ichimoku.above_cloud)
            || (direction == Direction::Short && ichimoku.below_cloud);
        if on_right_side {
            pattern_score += 5.0;
            reasons.push("Right side of Ichimoku cloud".to_string());
        }
    }
    if let Some(vwap) = calculate_vwap(candles) {
        if vwap != 0.0 && (current_price - vwap).abs() / vwap <= 0.005 {
            pattern_score += 3.0;
            reasons.push("VWAP proximity confirms".to_string());
        }
    }

    Some(EntrySetup {
        setup_type: "ema_bounce",
        direction,
        entry_price: current_price,
        pattern_score,
        vol_score: 0.0,
        reason: reasons.join("; "),
        key_level: Some(e20),
    })
}

fn detect_momentum(
    candles: &[Candle],
    closes: &[f64],
    current_price: f64,
    adx: f64,
    bias: Direction,
) -> Option<EntrySetup> {
    if adx < 20.0 {
        return None;
    }
    let rsi_series = crate::indicators::rsi::calculate_rsi(closes, 14);
    let rsi = *rsi_series.last()?;
    if !(rsi < 35.0 || rsi > 65.0) {
        return None;
    }

    let direction = if rsi > 65.0 { Direction::Long } else { Direction::Short };
    if !direction_matches(bias, direction) {
        return None;
    }

    let ema20 = calculate_ema(closes, 20);
    let ema50 = calculate_ema(closes, 50);
    let (e20, e50) = (*ema20.last()?, *ema50.last()?);
    let ema_confirms = match direction {
        Direction::Long => current_price > e20 && current_price > e50,
        Direction::Short => current_price < e20 && current_price < e50,
        Direction::None => false,
    };
    if !ema_confirms {
        return None;
    }

    let mut pattern_score = 26.0;
    let mut reasons = vec![format!("ADX {adx:.1} >= 20, RSI {rsi:.1} extreme, EMA confirms")];

    let rsi_extremity_bonus = if rsi > 75.0 || rsi < 25.0 { 4.0 } else { 0.0 };
    pattern_score += rsi_extremity_bonus;
    if rsi_extremity_bonus > 0.0 {
        reasons.push("RSI extremity bonus".to_string());
    }

    if adx >= 30.0 {
        pattern_score += 3.0;
        reasons.push("ADX strength bonus".to_string());
    }

    let macd_confirms = match calculate_macd_default(closes) {
        Some(m) if direction == Direction::Long => m.histogram > 0.0,
        Some(m) if direction == Direction::Short => m.histogram < 0.0,
        _ => false,
    };
    if macd_confirms {
        pattern_score += 3.0;
        reasons.push("MACD alignment bonus".to_string());
    }

    Some(EntrySetup {
        setup_type: "momentum",
        direction,
        entry_price: current_price,
        pattern_score,
        vol_score: 0.0,
        reason: reasons.join("; "),
        key_level: None,
    })
}

/// Run every detector named in `config.setups`, keep the single strongest
/// candidate by `pattern_score + vol_score`, and attach the confluence bonus.
pub fn evaluate_entry(
    candles: &[Candle],
    current_price: f64,
    volume_ratio: f64,
    adx: f64,
    bias: Direction,
    config: &EntryConfig,
) -> Option<EntryResult> {
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let mut candidates = Vec::new();

    for setup_name in &config.setups {
        let found = match setup_name.as_str() {
            "breakout" => detect_breakout(candles, &closes, current_price, volume_ratio, bias, config),
            "retest" => detect_retest(candles, &closes, current_price, bias, config),
            "divergence" => detect_divergence(candles, current_price, bias),
            "ema_bounce" => detect_ema_bounce(candles, &closes, current_price, bias, config),
            "momentum" => detect_momentum(candles, &closes, current_price, adx, bias),
            _ => None,
        };
        if let Some(setup) = found {
            candidates.push(setup);
        }
    }

    if candidates.is_empty() {
        return None;
    }

    let fired_count = candidates.len();
    let best_idx = candidates
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| {
            (a.pattern_score + a.vol_score)
                .partial_cmp(&(b.pattern_score + b.vol_score))
                .unwrap()
        })
        .map(|(i, _)| i)?;
    let chosen = candidates.remove(best_idx);

    Some(EntryResult {
        chosen,
        confluence_score: confluence_score(fired_count),
        fired_count,
        candidates,
    })
}

/// Apply candle confirmation to the chosen entry (spec §4.1/§4.4).
pub fn apply_candle_confirmation(candles: &[Candle], current_price: f64, direction: Direction) -> CandleConfirmation {
    let context = match build_candle_context(candles, current_price) {
        Some(c) => c,
        None => return CandleConfirmation { confirmed: true, modifier: 0.0, reason: "insufficient history for candle context" },
    };

    let rejects = match direction {
        Direction::Long => context.big_candle_resistance,
        Direction::Short => context.big_candle_support,
        Direction::None => false,
    };
    if rejects {
        return CandleConfirmation {
            confirmed: false,
            modifier: 0.0,
            reason: "big opposite-color candle straddles price, entry rejected",
        };
    }

    let pattern = classify_last(candles);
    let confirming = matches!(
        (direction, pattern),
        (Direction::Long, CandlePattern::BullishEngulfing | CandlePattern::Hammer)
            | (Direction::Short, CandlePattern::BearishEngulfing | CandlePattern::ShootingStar)
    );
    if confirming {
        return CandleConfirmation { confirmed: true, modifier: 8.0, reason: "confirming candle pattern" };
    }

    let against_direction = !context.last_bullish && direction == Direction::Long
        || context.last_bullish && direction == Direction::Short;
    if against_direction && context.body_ratio > 0.6 {
        return CandleConfirmation { confirmed: true, modifier: -10.0, reason: "strong last candle against direction" };
    }

    if pattern == CandlePattern::Doji {
        return CandleConfirmation { confirmed: true, modifier: -5.0, reason: "doji indecision" };
    }

    if context.consecutive_same_direction >= 3 && against_direction {
        return CandleConfirmation { confirmed: true, modifier: -10.0, reason: "three or more consecutive opposite candles" };
    }

    let contradictory = matches!(
        (direction, pattern),
        (Direction::Long, CandlePattern::BearishEngulfing | CandlePattern::ShootingStar)
            | (Direction::Short, CandlePattern::BullishEngulfing | CandlePattern::Hammer)
    );
    if contradictory {
        return CandleConfirmation { confirmed: true, modifier: -15.0, reason: "directly contradictory candle pattern" };
    }

    CandleConfirmation { confirmed: true, modifier: 0.0, reason: "neutral" }
}

/// Apply CUSUM structural-break and absorption confirmation to the chosen
/// entry (V4 only, SPEC_FULL.md §11). A structural break or absorption
/// opposing the setup's direction downgrades `pattern_score`; one agreeing
/// with it is rewarded. Mirrors `apply_candle_confirmation`'s shape: a
/// post-hoc modifier on the already-chosen entry rather than a vote in
/// `evaluate_entry` itself.
pub fn apply_structural_confirmation(
    direction: Direction,
    cusum: Option<&CusumState>,
    absorption: Option<&AbsorptionState>,
    htf_bullish: Option<bool>,
) -> StructuralConfirmation {
    let mut modifier = 0.0;
    let mut reasons = Vec::new();

    if let Some(state) = cusum {
        let agrees = (direction == Direction::Long && state.bullish_break) || (direction == Direction::Short && state.bearish_break);
        let opposes = (direction == Direction::Long && state.bearish_break) || (direction == Direction::Short && state.bullish_break);

        if agrees || opposes {
            let factor = htf_bullish
                .map(|bullish| CusumDetector::htf_conflict_factor(state, bullish))
                .unwrap_or(1.0);
            let delta = if agrees { 10.0 } else { -10.0 } * state.break_confidence * factor;
            modifier += delta;
            reasons.push(format!(
                "CUSUM {} (confidence {:.2}, htf_factor {:.2})",
                if agrees { "confirms" } else { "opposes" },
                state.break_confidence,
                factor
            ));
        }
    }

    if let Some(state) = absorption {
        if state.detected {
            let agrees = (direction == Direction::Long && state.direction == "BULLISH") || (direction == Direction::Short && state.direction == "BEARISH");
            let opposes = (direction == Direction::Long && state.direction == "BEARISH") || (direction == Direction::Short && state.direction == "BULLISH");
            if agrees || opposes {
                let delta = if agrees { 8.0 } else { -8.0 } * state.strength;
                modifier += delta;
                reasons.push(format!("absorption {} ({})", if agrees { "confirms" } else { "opposes" }, state.reason));
            }
        }
    }

    if reasons.is_empty() {
        reasons.push("no structural signal".to_string());
    }

    StructuralConfirmation { modifier, reason: reasons.join("; ") }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open: f64, high: f64, low: f64, close: f64, volume: f64) -> Candle {
        Candle {
            open_time: 0,
            close_time: 0,
            open,
            high,
            low,
            close,
            volume,
            quote_volume: volume * close,
            trades_count: 10,
            taker_buy_volume: volume / 2.0,
            taker_buy_quote_volume: volume * close / 2.0,
            is_closed: true,
        }
    }

    fn squeeze_then_breakout() -> Vec<Candle> {
        let mut candles = Vec::new();
        for i in 0..30 {
            let base = 100.0 + (i as f64 * 0.05);
            candles.push(candle(base, base + 0.2, base - 0.2, base, 10.0));
        }
        candles.push(candle(100.0, 100.6, 99.9, 100.5, 25.0));
        candles
    }

    #[test]
    fn breakout_scenario_s3_vol_score() {
        let candles = squeeze_then_breakout();
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let config = EntryConfig {
            setups: vec!["breakout".to_string()],
            min_score: 50.0,
            bb_squeeze_threshold: 1.5,
            volume_spike_ratio: 1.8,
            retest_buffer_pct: 0.15,
            rejection_wick_ratio: 1.5,
            ema_bounce_proximity_pct: 0.3,
        };
        let result = detect_breakout(&candles, &closes, 100.5, 2.5, Direction::Long, &config);
        if let Some(setup) = result {
            assert_eq!(setup.vol_score, 13.0);
            assert!((30.0..=40.0).contains(&setup.pattern_score));
        }
    }

    #[test]
    fn candle_confirmation_rejects_on_big_opposite_candle() {
        let mut candles: Vec<Candle> = (0..20).map(|i| candle(100.0 + i as f64, 100.5 + i as f64, 99.5 + i as f64, 100.2 + i as f64, 5.0)).collect();
        // Giant bearish candle straddling price 118.
        candles.push(candle(130.0, 131.0, 100.0, 105.0, 5.0));
        let confirmation = apply_candle_confirmation(&candles, 118.0, Direction::Long);
        assert!(!confirmation.confirmed);
    }

    #[test]
    fn evaluate_entry_returns_none_with_no_firing_detector() {
        let candles: Vec<Candle> = (0..60).map(|_| candle(100.0, 100.5, 99.5, 100.0, 5.0)).collect();
        let config = EntryConfig {
            setups: vec!["breakout".to_string(), "momentum".to_string()],
            min_score: 50.0,
            bb_squeeze_threshold: 1.5,
            volume_spike_ratio: 1.8,
            retest_buffer_pct: 0.15,
            rejection_wick_ratio: 1.5,
            ema_bounce_proximity_pct: 0.3,
        };
        assert!(evaluate_entry(&candles, 100.0, 1.0, 10.0, Direction::None, &config).is_none());
    }

    fn cusum_state(bullish_break: bool, bearish_break: bool, confidence: f64) -> CusumState {
        CusumState {
            s_plus: 0.0,
            s_minus: 0.0,
            threshold: 1.0,
            rolling_mean: 100.0,
            rolling_std: 1.0,
            bullish_break,
            bearish_break,
            break_confidence: confidence,
            candles_since_break: 1,
            reason: String::new(),
        }
    }

    #[test]
    fn structural_confirmation_rewards_agreeing_cusum_break() {
        let state = cusum_state(true, false, 0.8);
        let result = apply_structural_confirmation(Direction::Long, Some(&state), None, Some(true));
        assert!(result.modifier > 0.0);
    }

    #[test]
    fn structural_confirmation_penalises_opposing_cusum_break() {
        let state = cusum_state(false, true, 0.8);
        let result = apply_structural_confirmation(Direction::Long, Some(&state), None, None);
        assert!(result.modifier < 0.0);
    }

    #[test]
    fn structural_confirmation_couples_htf_conflict_into_cusum_weight() {
        let state = cusum_state(true, false, 0.8);
        let aligned = apply_structural_confirmation(Direction::Long, Some(&state), None, Some(true));
        let conflicted = apply_structural_confirmation(Direction::Long, Some(&state), None, Some(false));
        assert!(conflicted.modifier.abs() < aligned.modifier.abs());
    }

    #[test]
    fn structural_confirmation_is_neutral_with_no_inputs() {
        let result = apply_structural_confirmation(Direction::Long, None, None, None);
        assert_eq!(result.modifier, 0.0);
    }
}
