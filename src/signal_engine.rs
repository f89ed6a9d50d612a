// =============================================================================
// Signal Engine — §4.5 orchestration
// =============================================================================
//
// Runs Tradeability -> Direction -> Entry -> Sentiment -> Risk in order,
// rejecting at the first failing gate, then assembles the final weighted
// score. V4 bots additionally fold in a Market Regime read, an MTF
// confluence modifier, a VWAP modifier and the Adaptive Learner's bounded
// modifier — all added strictly AFTER the base min-score gate is checked, per
// the critical ordering rule in spec §4.5 step 12.
//
// Grounded on the teacher's `strategy.rs::evaluate_symbol` pipeline shape:
// one function walks every layer in sequence, short-circuiting to a rejection
// variant, finally building a single output record.

use std::collections::HashSet;

use tracing::{debug, instrument};

use crate::absorption_detector::AbsorptionDetector;
use crate::adaptive_learner::{AdaptiveLearner, SignalContext};
use crate::config::BotConfig;
use crate::cusum_detector::CusumDetector;
use crate::direction::{evaluate_direction, DirectionInputs};
use crate::entry::{apply_candle_confirmation, apply_structural_confirmation, evaluate_entry};
use crate::htf_analysis;
use crate::indicators::adx::calculate_adx;
use crate::indicators::atr::calculate_atr;
use crate::indicators::rsi::calculate_rsi;
use crate::indicators::structure::{detect_structure, StructureTrend};
use crate::indicators::vwap::vwap_deviation_pct;
use crate::market_data::Candle;
use crate::regime::{evaluate_regime, RegimeDetector};
use crate::risk_calculator::calculate_risk;
use crate::sentiment::SentimentSnapshot;
use crate::tradeability::{evaluate_tradeability, TradeabilityInputs};
use crate::types::{
    BotVersion, Direction, IndicatorSnapshot, Mode, NoTradeReason, Regime,
    RegimeSnapshot, ScoresSnapshot, Signal, SignalOutcome, SignalStatus,
};

/// VWAP modifier only kicks in once price clears this distance from VWAP.
const VWAP_MODIFIER_THRESHOLD_PCT: f64 = 0.15;

/// Everything the Signal Engine needs for one (symbol, mode) analysis pass.
/// Market-data fetch and learner/adaptive lookups happen at the Scanner
/// layer; this struct is the pure-function boundary.
pub struct AnalysisInputs<'a> {
    pub symbol: &'a str,
    pub mode: Mode,
    pub bot_version: BotVersion,
    pub candles_analysis: &'a [Candle],
    pub candles_filter: &'a [Candle],
    pub current_price: f64,
    pub spread_pct: Option<f64>,
    /// Combined bid+ask depth in quote-currency (USD); `None` when the
    /// orderbook snapshot is unavailable.
    pub depth_usd: Option<f64>,
    pub funding_rate_pct: f64,
    pub oi_change_pct: f64,
    pub order_flow_ratio: Option<f64>,
    /// V4 only: 15M/1H closes for the HTF EMA-alignment gate. `None` for
    /// V1-V3 or when either timeframe's history is unavailable.
    pub closes_15m: Option<&'a [f64]>,
    pub closes_1h: Option<&'a [f64]>,
    /// V4 only: net buy/sell volume direction from the deal stream, fed into
    /// the absorption detector's CVD confirmation check.
    pub cvd_direction: Option<f64>,
    pub sentiment: &'a SentimentSnapshot,
    /// Setup types the legacy trade_learner has disabled for this
    /// (symbol, mode) combination.
    pub disabled_setups: &'a HashSet<String>,
    /// V4 only: the Adaptive Learner queried at step 12 once setup_type,
    /// direction, final_score and mtf are known. `None` for V1-V3.
    pub learner: Option<&'a AdaptiveLearner>,
    pub regime_detector: Option<&'a RegimeDetector>,
}

fn no_trade(reason: impl Into<String>, tradeability_score: f64) -> SignalOutcome {
    SignalOutcome::NoTrade(NoTradeReason {
        reason: reason.into(),
        kill_reason: None,
        tradeability_score,
    })
}

fn no_trade_killed(reason: impl Into<String>, kill_reason: String) -> SignalOutcome {
    SignalOutcome::NoTrade(NoTradeReason { reason: reason.into(), kill_reason: Some(kill_reason), tradeability_score: 0.0 })
}

/// MTF confluence ∈ [-15, +15]: compares analysis-TF and filter-TF structure
/// trend, RSI side, and ADX regime, each worth up to 5 points toward or
/// against the chosen direction.
fn mtf_confluence(candles_analysis: &[Candle], candles_filter: &[Candle], direction: Direction) -> f64 {
    let mut score = 0.0;

    let closes_f: Vec<f64> = candles_filter.iter().map(|c| c.close).collect();

    let structure_a = detect_structure(candles_analysis, 40.min(candles_analysis.len()).max(5));
    let structure_f = detect_structure(candles_filter, 40.min(candles_filter.len()).max(5));
    score += structure_vote(structure_a.trend(), direction);
    score += structure_vote(structure_f.trend(), direction);

    let rsi_side = |rsi: Option<f64>| -> f64 {
        match rsi {
            Some(r) if r > 50.0 && direction == Direction::Long => 5.0,
            Some(r) if r < 50.0 && direction == Direction::Short => 5.0,
            Some(r) if r > 50.0 && direction == Direction::Short => -5.0,
            Some(r) if r < 50.0 && direction == Direction::Long => -5.0,
            _ => 0.0,
        }
    };
    score += rsi_side(calculate_rsi(&closes_f, 14).last().copied());

    let adx = calculate_adx(candles_filter, 14).unwrap_or(0.0);
    if adx >= 20.0 {
        score += 5.0 * structure_f.trend().sign_for(direction);
    }

    score.clamp(-15.0, 15.0)
}

fn structure_vote(trend: StructureTrend, direction: Direction) -> f64 {
    match (trend, direction) {
        (StructureTrend::Bullish, Direction::Long) => 5.0,
        (StructureTrend::Bearish, Direction::Short) => 5.0,
        (StructureTrend::Bullish, Direction::Short) => -5.0,
        (StructureTrend::Bearish, Direction::Long) => -5.0,
        _ => 0.0,
    }
}

trait TrendSign {
    fn sign_for(self, direction: Direction) -> f64;
}

impl TrendSign for StructureTrend {
    fn sign_for(self, direction: Direction) -> f64 {
        match (self, direction) {
            (StructureTrend::Bullish, Direction::Long) => 1.0,
            (StructureTrend::Bearish, Direction::Short) => 1.0,
            (StructureTrend::Bullish, Direction::Short) => -1.0,
            (StructureTrend::Bearish, Direction::Long) => -1.0,
            _ => 0.0,
        }
    }
}

/// VWAP modifier: ±5 once price clears `VWAP_MODIFIER_THRESHOLD_PCT` on the
/// side that agrees (or disagrees) with the trade direction.
fn vwap_modifier(candles: &[Candle], current_price: f64, direction: Direction) -> f64 {
    let deviation = match vwap_deviation_pct(candles, current_price) {
        Some(d) => d,
        None => return 0.0,
    };
    if deviation.abs() < VWAP_MODIFIER_THRESHOLD_PCT {
        return 0.0;
    }
    match direction {
        Direction::Long if deviation > 0.0 => 5.0,
        Direction::Long => -5.0,
        Direction::Short if deviation < 0.0 => 5.0,
        Direction::Short => -5.0,
        Direction::None => 0.0,
    }
}

/// Regime modifier folded into the V4 setup score (step 10): rewards a setup
/// whose character matches the prevailing regime.
fn regime_modifier(regime: Regime, setup_type: &str, confidence: f64) -> f64 {
    let matches = match regime {
        Regime::Trending => matches!(setup_type, "breakout" | "momentum"),
        Regime::Ranging => matches!(setup_type, "retest" | "ema_bounce"),
        Regime::Volatile => setup_type == "divergence",
    };
    if matches {
        5.0 * confidence
    } else {
        -2.0 * confidence
    }
}

/// Run the full Signal Engine pipeline for one (symbol, mode) snapshot.
#[instrument(skip(inputs, config), fields(symbol = inputs.symbol, mode = %inputs.mode))]
pub fn analyze_pair(inputs: &AnalysisInputs, config: &BotConfig) -> SignalOutcome {
    let mode_config = config.mode_config(inputs.mode);

    // --- Step 2: Tradeability on the analysis timeframe -----------------
    let atr_series: Vec<f64> = (14..inputs.candles_analysis.len())
        .filter_map(|i| calculate_atr(&inputs.candles_analysis[..=i], 14))
        .collect();
    let atr_current = atr_series.last().copied().unwrap_or(0.0);
    let atr_mean = if atr_series.is_empty() {
        atr_current
    } else {
        atr_series.iter().sum::<f64>() / atr_series.len() as f64
    };

    let volume_current = inputs.candles_analysis.last().map(|c| c.volume).unwrap_or(0.0);
    let volume_mean = {
        let window: Vec<f64> = inputs
            .candles_analysis
            .iter()
            .rev()
            .take(20)
            .map(|c| c.volume)
            .collect();
        if window.is_empty() {
            0.0
        } else {
            window.iter().sum::<f64>() / window.len() as f64
        }
    };

    let adx = calculate_adx(inputs.candles_analysis, 14).unwrap_or(0.0);

    let tradeability = evaluate_tradeability(
        &TradeabilityInputs {
            atr_current,
            atr_mean,
            volume_current,
            volume_mean,
            spread_pct: inputs.spread_pct,
            depth_usd: inputs.depth_usd,
            funding_rate_pct: inputs.funding_rate_pct,
            oi_change_pct: inputs.oi_change_pct,
            adx,
            order_flow_ratio: inputs.order_flow_ratio,
            mode: inputs.mode,
        },
        &config.tradeability,
    );

    if !tradeability.is_tradable {
        if let Some(kill) = &tradeability.kill_reason {
            return no_trade_killed("NON-TRADABLE", kill.clone());
        }
        return no_trade("NON-TRADABLE", tradeability.score);
    }

    // --- Step 3: Direction on the filter timeframe ------------------------
    // V4 only (SPEC_FULL.md §11): HTF EMA-alignment gate, consulted by the
    // six-vote consensus when it lands neutral.
    let htf = if config.bot_version.is_v4() {
        inputs
            .closes_15m
            .zip(inputs.closes_1h)
            .and_then(|(closes_15m, closes_1h)| htf_analysis::analyze(inputs.symbol, closes_15m, closes_1h))
    } else {
        None
    };

    let direction = match evaluate_direction(&DirectionInputs {
        candles: inputs.candles_filter,
        current_price: inputs.current_price,
        ema_fast_period: config.direction.ema_fast,
        ema_slow_period: config.direction.ema_slow,
        ema_neutral_threshold: config.direction.ema_neutral_threshold,
        rsi_long_threshold: config.direction.rsi_long_threshold,
        rsi_short_threshold: config.direction.rsi_short_threshold,
        structure_lookback: config.direction.structure_lookback,
        reject_neutral: mode_config.reject_neutral,
        htf: htf.as_ref(),
    }) {
        Some(d) => d,
        None => return no_trade("DIRECTION_REJECTED", tradeability.score),
    };

    // --- Step 4: V4-only Market Regime + MTF confluence -------------------
    let regime_snapshot: Option<RegimeSnapshot> = if config.bot_version.is_v4() {
        inputs
            .regime_detector
            .and_then(|d| evaluate_regime(d, inputs.candles_analysis))
    } else {
        None
    };
    let mtf = if config.bot_version.is_v4() {
        mtf_confluence(inputs.candles_analysis, inputs.candles_filter, direction.bias)
    } else {
        0.0
    };

    // --- Step 5: legacy trade_learner disabled-setup filter ----------------
    let mut entry_config = config.entry.clone();
    entry_config.setups.retain(|s| !inputs.disabled_setups.contains(s));
    entry_config.setups.retain(|s| mode_config.entry.setups.contains(s));

    // --- Step 6: Entry detection -------------------------------------------
    let volume_ratio = if volume_mean > 0.0 { volume_current / volume_mean } else { 0.0 };
    let entry = match evaluate_entry(
        inputs.candles_analysis,
        inputs.current_price,
        volume_ratio,
        adx,
        direction.bias,
        &entry_config,
    ) {
        Some(e) => e,
        None => return no_trade("NO_SETUP", tradeability.score),
    };

    // --- Step 7: Candle confirmation -----------------------------------
    let confirmation = apply_candle_confirmation(inputs.candles_analysis, inputs.current_price, entry.chosen.direction);
    if !confirmation.confirmed {
        return no_trade(format!("CANDLE_REJECTED: {}", confirmation.reason), tradeability.score);
    }

    // --- Step 7b: V4-only CUSUM structural-break + absorption confirmation --
    let structural = if config.bot_version.is_v4() {
        let closes_5m: Vec<f64> = inputs.candles_analysis.iter().map(|c| c.close).collect();
        let cusum_state = CusumDetector::new(100).detect(&closes_5m);
        let absorption_state = AbsorptionDetector::detect(inputs.candles_analysis, inputs.cvd_direction.unwrap_or(0.0));
        let htf_bullish = htf.as_ref().and_then(|h| {
            if h.buy_allowed {
                Some(true)
            } else if h.sell_signal {
                Some(false)
            } else {
                None
            }
        });
        Some(apply_structural_confirmation(
            entry.chosen.direction,
            cusum_state.as_ref(),
            absorption_state.as_ref(),
            htf_bullish,
        ))
    } else {
        None
    };

    // --- Step 8: Sentiment alignment multiplier -----------------------
    let direction_score = direction.score * inputs.sentiment.alignment_multiplier(entry.chosen.direction);

    // --- Step 9: Risk calculation ---------------------------------------
    let entry_atr = calculate_atr(inputs.candles_analysis, 14).unwrap_or(atr_current);
    let risk = match calculate_risk(
        inputs.candles_analysis,
        entry.chosen.entry_price,
        entry.chosen.direction,
        entry_atr,
        &mode_config,
    ) {
        Some(r) => r,
        None => return no_trade("RISK_CALC_FAILED", tradeability.score),
    };

    // --- Step 10: Setup score ---------------------------------------------
    let mut setup_score = entry.chosen.pattern_score
        + entry.chosen.vol_score
        + risk.rr_ratio * 5.0
        + entry.confluence_score
        + confirmation.modifier;
    if config.bot_version.is_v4() {
        if let Some(snapshot) = &regime_snapshot {
            setup_score += regime_modifier(snapshot.regime, entry.chosen.setup_type, snapshot.confidence);
        }
        if let Some(structural) = &structural {
            setup_score += structural.modifier;
        }
    }

    // --- Step 11: Final (base) score ---------------------------------------
    let weights = config.scoring_for_mode(inputs.mode);
    let normalised_sentiment = (inputs.sentiment.score + 100.0) / 2.0;
    let mut final_score = weights.tradeability * tradeability.score * 100.0
        + weights.direction * direction_score
        + weights.setup * setup_score
        + weights.sentiment * normalised_sentiment;
    final_score = final_score.clamp(0.0, 100.0);

    let min_score = mode_config.entry.min_score;

    // --- Step 12: V4 gating order (critical) --------------------------
    if final_score < min_score {
        return no_trade(format!("BELOW_MIN_SCORE: {final_score:.1} < {min_score:.1}"), tradeability.score);
    }

    let mut learning_modifier = 0.0;
    if config.bot_version.is_v4() {
        final_score += mtf;
        final_score += vwap_modifier(inputs.candles_analysis, inputs.current_price, entry.chosen.direction);
        if let Some(learner) = inputs.learner {
            use chrono::Timelike;
            let ctx = SignalContext {
                setup_type: entry.chosen.setup_type.to_string(),
                symbol: inputs.symbol.to_string(),
                mode: inputs.mode,
                regime: regime_snapshot.as_ref().map(|s| s.regime).unwrap_or(Regime::Ranging),
                hour_utc: chrono::Utc::now().hour(),
                final_score,
                direction: entry.chosen.direction,
                mtf_confluence: mtf,
            };
            let (modifier, _reasons) = learner.get_total_modifier(&ctx);
            learning_modifier = modifier;
        }
        final_score += learning_modifier;
        final_score = final_score.clamp(0.0, 100.0);
        if final_score < min_score {
            return no_trade(format!("BELOW_MIN_SCORE_POST_MODIFIERS: {final_score:.1} < {min_score:.1}"), tradeability.score);
        }
    }

    // --- Step 13: Assemble the signal ---------------------------------
    let indicator_snapshot = config.bot_version.is_v4().then(|| IndicatorSnapshot {
        rsi: calculate_rsi(&inputs.candles_analysis.iter().map(|c| c.close).collect::<Vec<_>>(), 14).last().copied().unwrap_or(0.0),
        adx,
        atr: entry_atr,
        bb_bandwidth: crate::indicators::bollinger::calculate_bollinger(
            &inputs.candles_analysis.iter().map(|c| c.close).collect::<Vec<_>>(),
            20,
            2.0,
        )
        .map(|b| b.width)
        .unwrap_or(0.0),
        ema_fast: *crate::indicators::ema::calculate_ema(
            &inputs.candles_analysis.iter().map(|c| c.close).collect::<Vec<_>>(),
            config.direction.ema_fast,
        )
        .last()
        .unwrap_or(&0.0),
        ema_slow: *crate::indicators::ema::calculate_ema(
            &inputs.candles_analysis.iter().map(|c| c.close).collect::<Vec<_>>(),
            config.direction.ema_slow,
        )
        .last()
        .unwrap_or(&0.0),
    });

    let scores_snapshot = config.bot_version.is_v4().then(|| ScoresSnapshot {
        tradeability: tradeability.score,
        direction: direction_score,
        setup: setup_score,
        sentiment: normalised_sentiment,
        mtf_confluence: mtf,
        learning_modifier,
        final_score,
    });

    let candle_pattern = Some(crate::indicators::candles::classify_last(inputs.candles_analysis));

    let signal = Signal {
        id: uuid::Uuid::new_v4().to_string(),
        symbol: inputs.symbol.to_string(),
        mode: inputs.mode,
        bot_version: config.bot_version,
        direction: entry.chosen.direction,
        score: final_score,
        entry_price: entry.chosen.entry_price,
        stop_loss: risk.stop_loss,
        tp1: risk.tp1,
        tp2: risk.tp2,
        tp3: risk.tp3,
        setup_type: entry.chosen.setup_type.to_string(),
        leverage: risk.leverage,
        rr_ratio: risk.rr_ratio,
        tp1_close_pct: risk.tp1_close_pct,
        tp2_close_pct: risk.tp2_close_pct,
        tp3_close_pct: risk.tp3_close_pct,
        reasons: {
            let mut reasons = vec![entry.chosen.reason.clone(), confirmation.reason.to_string()];
            if let Some(structural) = &structural {
                reasons.push(structural.reason.clone());
            }
            reasons
        },
        tradeability_score: tradeability.score,
        direction_score,
        setup_score,
        sentiment_score: normalised_sentiment,
        status: SignalStatus::Active,
        created_at: chrono::Utc::now().to_rfc3339(),
        indicator_snapshot,
        regime_snapshot,
        scores_snapshot,
        candle_pattern,
        entry_atr: Some(entry_atr),
    };

    debug!(score = final_score, setup = signal.setup_type, "signal produced");
    SignalOutcome::Signal(Box::new(signal))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BotVersion;

    fn candle(i: usize, base: f64, volume: f64) -> Candle {
        let close = base + i as f64 * 0.5;
        Candle {
            open_time: i as i64,
            close_time: i as i64,
            open: close - 0.1,
            high: close + 0.3,
            low: close - 0.3,
            close,
            volume,
            quote_volume: volume * close,
            trades_count: 10,
            taker_buy_volume: volume / 2.0,
            taker_buy_quote_volume: volume * close / 2.0,
            is_closed: true,
        }
    }

    fn uptrend(n: usize) -> Vec<Candle> {
        (0..n).map(|i| candle(i, 100.0, 10.0)).collect()
    }

    #[test]
    fn tradeability_kill_short_circuits_before_direction() {
        let config = BotConfig::default_for(BotVersion::V1);
        let analysis = uptrend(60);
        let filter = uptrend(250);
        let sentiment = SentimentSnapshot { score: 0.0, bias: "NEUTRAL".to_string() };
        let disabled = HashSet::new();
        let inputs = AnalysisInputs {
            symbol: "BTCUSDT",
            mode: Mode::Scalping,
            bot_version: BotVersion::V1,
            candles_analysis: &analysis,
            candles_filter: &filter,
            current_price: *analysis.last().map(|c| &c.close).unwrap(),
            spread_pct: Some(0.9), // above spread_kill
            depth_usd: Some(100_000.0),
            funding_rate_pct: 0.0,
            oi_change_pct: 0.0,
            order_flow_ratio: None,
            closes_15m: None,
            closes_1h: None,
            cvd_direction: None,
            sentiment: &sentiment,
            disabled_setups: &disabled,
            learner: None,
            regime_detector: None,
        };
        let outcome = analyze_pair(&inputs, &config);
        match outcome {
            SignalOutcome::NoTrade(reason) => {
                assert_eq!(reason.reason, "NON-TRADABLE");
                assert!(reason.kill_reason.is_some());
            }
            SignalOutcome::Signal(_) => panic!("expected no_trade on spread kill"),
        }
    }

    #[test]
    fn flat_market_yields_no_setup() {
        let config = BotConfig::default_for(BotVersion::V1);
        let flat: Vec<Candle> = (0..250).map(|_| candle(0, 100.0, 10.0)).collect();
        let sentiment = SentimentSnapshot { score: 0.0, bias: "NEUTRAL".to_string() };
        let disabled = HashSet::new();
        let inputs = AnalysisInputs {
            symbol: "BTCUSDT",
            mode: Mode::Scalping,
            bot_version: BotVersion::V1,
            candles_analysis: &flat,
            candles_filter: &flat,
            current_price: 100.0,
            spread_pct: Some(0.02),
            depth_usd: Some(100_000.0),
            funding_rate_pct: 0.0,
            oi_change_pct: 0.0,
            order_flow_ratio: None,
            closes_15m: None,
            closes_1h: None,
            cvd_direction: None,
            sentiment: &sentiment,
            disabled_setups: &disabled,
            learner: None,
            regime_detector: None,
        };
        let outcome = analyze_pair(&inputs, &config);
        assert!(matches!(outcome, SignalOutcome::NoTrade(_)));
    }
}
