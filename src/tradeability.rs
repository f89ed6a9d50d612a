// =============================================================================
// Tradeability Layer
// =============================================================================
//
// Eight to nine independently scored checks over [-1, 1], each carrying a
// human-readable reason. A check returning -1 is a kill switch: tradeability
// becomes false immediately regardless of the weighted sum. Otherwise the
// aggregate is a configured weighted sum, gated by `min_score`.
//
// Grounded on the teacher's `trade_insurance.rs` gate-chain shape (ordered
// checks, each producing a reason string) generalized from a boolean
// pass/fail chain into a scored-and-weighted one.

use tracing::debug;

use crate::config::TradeabilityConfig;
use crate::types::Mode;

/// Missing-orderbook sentinel (Open Question #3): when the orderbook is
/// unavailable, spread is reported via this sentinel rather than a hardcoded
/// literal scattered across call sites.
pub const MISSING_ORDERBOOK_SPREAD_PCT: f64 = 999.0;

#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: &'static str,
    pub score: f64,
    pub reason: String,
    pub is_kill: bool,
}

#[derive(Debug, Clone)]
pub struct TradeabilityReport {
    pub is_tradable: bool,
    pub score: f64,
    pub kill_reason: Option<String>,
    pub checks: Vec<CheckResult>,
}

/// All inputs the Tradeability Layer scores against.
#[derive(Debug, Clone, Copy)]
pub struct TradeabilityInputs {
    pub atr_current: f64,
    pub atr_mean: f64,
    pub volume_current: f64,
    pub volume_mean: f64,
    /// `None` when the orderbook snapshot is unavailable.
    pub spread_pct: Option<f64>,
    /// Combined bid+ask depth in quote-currency (USD); `None` when the
    /// orderbook snapshot is unavailable.
    pub depth_usd: Option<f64>,
    pub funding_rate_pct: f64,
    pub oi_change_pct: f64,
    pub adx: f64,
    /// V4-only order-flow buy/sell ratio, `None` for V1-V3.
    pub order_flow_ratio: Option<f64>,
    pub mode: Mode,
}

fn score_volatility(atr_ratio: f64) -> (f64, String) {
    if (0.8..=2.0).contains(&atr_ratio) {
        (1.0, format!("ATR ratio {atr_ratio:.2} within ideal band [0.8, 2.0]"))
    } else if atr_ratio < 0.8 {
        let score = (atr_ratio / 0.8).clamp(0.0, 1.0);
        (score, format!("ATR ratio {atr_ratio:.2} below ideal band, score {score:.2}"))
    } else {
        let score = (2.0 / atr_ratio).clamp(0.0, 1.0);
        (score, format!("ATR ratio {atr_ratio:.2} above ideal band, score {score:.2}"))
    }
}

fn score_volume(volume_ratio: f64, min_ratio: f64) -> (f64, String) {
    if volume_ratio <= min_ratio {
        (0.0, format!("Volume ratio {volume_ratio:.2} at or below minimum {min_ratio:.2}"))
    } else if volume_ratio >= 2.0 {
        (1.0, format!("Volume ratio {volume_ratio:.2} at or above 2.0x"))
    } else {
        let score = (volume_ratio - min_ratio) / (2.0 - min_ratio);
        (score.clamp(0.0, 1.0), format!("Volume ratio {volume_ratio:.2} scaled to {score:.2}"))
    }
}

fn score_spread(spread_pct: Option<f64>, spread_max: f64, spread_kill: f64) -> CheckResult {
    let spread = match spread_pct {
        None => {
            return CheckResult {
                name: "spread",
                score: 0.7,
                reason: "Orderbook unavailable, neutral-positive spread score".to_string(),
                is_kill: false,
            }
        }
        Some(s) => s,
    };

    if spread >= spread_kill {
        return CheckResult {
            name: "spread",
            score: -1.0,
            reason: format!("Spread {spread:.4}% > {spread_kill:.1}% KILL"),
            is_kill: true,
        };
    }

    let score = (1.0 - spread / spread_max).clamp(0.0, 1.0);
    CheckResult {
        name: "spread",
        score,
        reason: format!("Spread {spread:.4}% scaled toward max {spread_max:.2}%, score {score:.2}"),
        is_kill: false,
    }
}

fn score_depth(depth_usd: Option<f64>, depth_min_usd: f64) -> CheckResult {
    let depth = match depth_usd {
        None => {
            return CheckResult {
                name: "depth",
                score: 0.7,
                reason: "Orderbook unavailable, neutral-positive depth score".to_string(),
                is_kill: false,
            }
        }
        Some(d) => d,
    };

    let score = (depth / depth_min_usd).clamp(0.0, 1.0);
    CheckResult {
        name: "depth",
        score,
        reason: format!("Depth ${depth:.0} scaled toward min ${depth_min_usd:.0}, score {score:.2}"),
        is_kill: false,
    }
}

fn score_funding(funding_pct: f64, funding_max: f64, funding_kill: f64) -> CheckResult {
    let abs_funding = funding_pct.abs();
    if abs_funding >= funding_kill {
        return CheckResult {
            name: "funding",
            score: -1.0,
            reason: format!("|Funding| {abs_funding:.4}% >= {funding_kill:.2}% KILL"),
            is_kill: true,
        };
    }
    let score = (1.0 - abs_funding / funding_max).clamp(0.0, 1.0);
    CheckResult {
        name: "funding",
        score,
        reason: format!("Funding {funding_pct:.4}% scaled toward max {funding_max:.2}%, score {score:.2}"),
        is_kill: false,
    }
}

fn score_oi(oi_change_pct: f64, oi_drop_max_pct: f64) -> (f64, String) {
    if oi_change_pct >= -1.0 {
        (1.0, format!("OI change {oi_change_pct:.2}% stable within +/-1%"))
    } else {
        let drop = -oi_change_pct;
        let score = (1.0 - (drop - 1.0) / (oi_drop_max_pct - 1.0)).clamp(0.0, 1.0);
        (score, format!("OI dropping {drop:.2}%, scaled toward max {oi_drop_max_pct:.1}%, score {score:.2}"))
    }
}

fn score_adx(adx: f64) -> (f64, String) {
    let score = if adx >= 30.0 {
        1.0
    } else if adx >= 25.0 {
        0.8
    } else if adx >= 20.0 {
        0.5
    } else {
        0.2
    };
    (score, format!("ADX {adx:.1} -> score {score:.2}"))
}

fn score_order_flow(ratio: f64) -> (f64, String) {
    // Reward decisiveness (far from 50/50), penalise perfect balance.
    let imbalance = (ratio - 0.5).abs();
    let score = if imbalance >= 0.1 {
        1.0
    } else {
        0.5 + imbalance * 5.0
    };
    (score.clamp(0.0, 1.0), format!("Order-flow ratio {ratio:.2}, imbalance {imbalance:.2}, score {score:.2}"))
}

/// Run the full Tradeability Layer scoring chain.
pub fn evaluate_tradeability(inputs: &TradeabilityInputs, config: &TradeabilityConfig) -> TradeabilityReport {
    let mut checks = Vec::with_capacity(9);

    let atr_ratio = if inputs.atr_mean > 0.0 {
        inputs.atr_current / inputs.atr_mean
    } else {
        1.0
    };
    let (vol_score, vol_reason) = score_volatility(atr_ratio);
    checks.push(CheckResult { name: "volatility", score: vol_score, reason: vol_reason, is_kill: false });

    let volume_ratio = if inputs.volume_mean > 0.0 {
        inputs.volume_current / inputs.volume_mean
    } else {
        0.0
    };
    let (volume_score, volume_reason) = score_volume(volume_ratio, config.thresholds.volume_min_ratio);
    checks.push(CheckResult { name: "volume", score: volume_score, reason: volume_reason, is_kill: false });

    let spread_max = match inputs.mode {
        Mode::Scalping => config.thresholds.spread_max_scalp,
        Mode::Swing => config.thresholds.spread_max_swing,
    };
    checks.push(score_spread(inputs.spread_pct, spread_max, config.thresholds.spread_kill));

    checks.push(score_depth(inputs.depth_usd, config.thresholds.depth_min_usd));

    checks.push(score_funding(inputs.funding_rate_pct, config.thresholds.funding_max, config.thresholds.funding_kill));

    let (oi_score, oi_reason) = score_oi(inputs.oi_change_pct, config.thresholds.oi_drop_max_pct);
    checks.push(CheckResult { name: "oi", score: oi_score, reason: oi_reason, is_kill: false });

    let (adx_score, adx_reason) = score_adx(inputs.adx);
    checks.push(CheckResult { name: "adx", score: adx_score, reason: adx_reason, is_kill: false });

    if let Some(ratio) = inputs.order_flow_ratio {
        let (of_score, of_reason) = score_order_flow(ratio);
        checks.push(CheckResult { name: "order_flow", score: of_score, reason: of_reason, is_kill: false });
    }

    if let Some(kill) = checks.iter().find(|c| c.is_kill) {
        debug!(reason = %kill.reason, "tradeability kill switch tripped");
        return TradeabilityReport {
            is_tradable: false,
            score: 0.0,
            kill_reason: Some(kill.reason.clone()),
            checks,
        };
    }

    let weights = &config.weights;
    let weighted: f64 = checks
        .iter()
        .map(|c| c.score * weight_for(c.name, weights))
        .sum();

    let is_tradable = weighted >= config.min_score;
    TradeabilityReport {
        is_tradable,
        score: weighted,
        kill_reason: None,
        checks,
    }
}

fn weight_for(name: &str, weights: &crate::config::TradeabilityWeights) -> f64 {
    match name {
        "volatility" => weights.volatility,
        "volume" => weights.volume,
        "spread" => weights.spread,
        "funding" => weights.funding,
        "oi" => weights.oi,
        "adx" => weights.adx,
        "order_flow" => weights.order_flow,
        "depth" => weights.depth,
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TradeabilityConfig;

    fn base_inputs() -> TradeabilityInputs {
        TradeabilityInputs {
            atr_current: 1.0,
            atr_mean: 1.0,
            volume_current: 1.5,
            volume_mean: 1.0,
            spread_pct: Some(0.05),
            depth_usd: Some(100_000.0),
            funding_rate_pct: 0.01,
            oi_change_pct: 0.0,
            adx: 28.0,
            order_flow_ratio: None,
            mode: Mode::Scalping,
        }
    }

    #[test]
    fn spread_kill_switch_scenario_s1() {
        let config = TradeabilityConfig::default();
        let mut inputs = base_inputs();
        inputs.spread_pct = Some(0.50);
        let report = evaluate_tradeability(&inputs, &config);
        assert!(!report.is_tradable);
        assert_eq!(report.score, 0.0);
        assert_eq!(
            report.kill_reason.as_deref(),
            Some("Spread 0.5000% > 0.4% KILL")
        );
    }

    #[test]
    fn funding_kill_switch_trips() {
        let config = TradeabilityConfig::default();
        let mut inputs = base_inputs();
        inputs.funding_rate_pct = 0.25;
        let report = evaluate_tradeability(&inputs, &config);
        assert!(!report.is_tradable);
        assert!(report.kill_reason.is_some());
    }

    #[test]
    fn missing_orderbook_is_neutral_positive() {
        let config = TradeabilityConfig::default();
        let mut inputs = base_inputs();
        inputs.spread_pct = None;
        inputs.depth_usd = None;
        let report = evaluate_tradeability(&inputs, &config);
        let spread_check = report.checks.iter().find(|c| c.name == "spread").unwrap();
        assert_eq!(spread_check.score, 0.7);
        let depth_check = report.checks.iter().find(|c| c.name == "depth").unwrap();
        assert_eq!(depth_check.score, 0.7);
    }

    #[test]
    fn thin_depth_scales_down_the_depth_check() {
        let config = TradeabilityConfig::default();
        let mut inputs = base_inputs();
        inputs.depth_usd = Some(10_000.0);
        let report = evaluate_tradeability(&inputs, &config);
        let depth_check = report.checks.iter().find(|c| c.name == "depth").unwrap();
        assert!((depth_check.score - 0.2).abs() < 1e-9);
    }

    #[test]
    fn good_conditions_are_tradable() {
        let config = TradeabilityConfig::default();
        let inputs = base_inputs();
        let report = evaluate_tradeability(&inputs, &config);
        assert!(report.is_tradable);
        assert!(report.score >= config.min_score);
    }

    #[test]
    fn order_flow_rewards_imbalance() {
        let (balanced, _) = score_order_flow(0.50);
        let (imbalanced, _) = score_order_flow(0.65);
        assert!(imbalanced > balanced);
    }
}
