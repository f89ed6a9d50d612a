// =============================================================================
// Risk Calculator — §4.6 stop/TP/leverage
// =============================================================================
//
// Given an entry, direction, ATR, and the mode's risk config, compute a stop
// distance by the configured method, TPs as RR multiples of that distance,
// and a leverage figure that shrinks as the stop widens. Grounded on the
// teacher's `exit/triple_barrier.rs::BarrierConfig::from_atr` regime-aware
// multiplier pattern, generalized from "barrier width" to the full
// stop/TP/leverage bundle the spec names.

use crate::config::{ModeConfig, StopMethod};
use crate::market_data::Candle;
use crate::types::Direction;

#[derive(Debug, Clone, Copy)]
pub struct RiskPlan {
    pub stop_loss: f64,
    pub tp1: f64,
    pub tp2: f64,
    pub tp3: f64,
    pub sl_distance: f64,
    pub risk_pct: f64,
    pub leverage: f64,
    pub rr_ratio: f64,
    pub tp1_close_pct: f64,
    pub tp2_close_pct: f64,
    pub tp3_close_pct: f64,
}

/// Recent swing extreme used by the structural stop method: the worst price
/// against the trade direction over the trailing 20 candles.
fn structural_swing(candles: &[Candle], direction: Direction) -> Option<f64> {
    let window_len = candles.len().min(20);
    if window_len == 0 {
        return None;
    }
    let window = &candles[candles.len() - window_len..];
    match direction {
        Direction::Long => window.iter().map(|c| c.low).fold(f64::INFINITY, f64::min).into(),
        Direction::Short => window.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max).into(),
        Direction::None => None,
    }
}

/// Piecewise-linear leverage: stops at or below 0.1% get `lev_max`, stops at
/// or above 1.0% get `lev_min`, linear in between.
fn leverage_for_stop_pct(stop_pct: f64, lev_min: f64, lev_max: f64) -> f64 {
    const SMALL: f64 = 0.1;
    const LARGE: f64 = 1.0;
    if stop_pct <= SMALL {
        lev_max
    } else if stop_pct >= LARGE {
        lev_min
    } else {
        let t = (stop_pct - SMALL) / (LARGE - SMALL);
        lev_max - t * (lev_max - lev_min)
    }
}

/// Compute the full stop/TP/leverage bundle for a candidate entry.
///
/// Returns `None` when the resolved stop distance would be zero or negative
/// (degenerate ATR/structural input) — the caller must reject the signal.
pub fn calculate_risk(
    candles: &[Candle],
    entry_price: f64,
    direction: Direction,
    atr: f64,
    mode_config: &ModeConfig,
) -> Option<RiskPlan> {
    if entry_price <= 0.0 || direction == Direction::None {
        return None;
    }

    let stop_cfg = &mode_config.stop_loss;
    let mut sl_distance = match stop_cfg.method {
        StopMethod::Atr => atr * stop_cfg.atr_multiplier,
        StopMethod::Structural => {
            let swing = structural_swing(candles, direction)?;
            let buffer = atr * stop_cfg.buffer_atr;
            match direction {
                Direction::Long => entry_price - (swing - buffer),
                Direction::Short => (swing + buffer) - entry_price,
                Direction::None => return None,
            }
        }
    };

    if !sl_distance.is_finite() || sl_distance <= 0.0 {
        return None;
    }

    let max_distance = entry_price * stop_cfg.max_stop_pct / 100.0;
    if sl_distance > max_distance {
        sl_distance = max_distance;
    }

    let stop_loss = match direction {
        Direction::Long => entry_price - sl_distance,
        Direction::Short => entry_price + sl_distance,
        Direction::None => return None,
    };

    let tp_cfg = &mode_config.take_profit;
    let tp_price = |rr: f64| -> f64 {
        match direction {
            Direction::Long => entry_price + sl_distance * rr,
            Direction::Short => entry_price - sl_distance * rr,
            Direction::None => entry_price,
        }
    };

    let risk_pct = sl_distance / entry_price * 100.0;
    let leverage = leverage_for_stop_pct(risk_pct, mode_config.risk.lev_min, mode_config.risk.lev_max);

    Some(RiskPlan {
        stop_loss,
        tp1: tp_price(tp_cfg.tp1_rr),
        tp2: tp_price(tp_cfg.tp2_rr),
        tp3: tp_price(tp_cfg.tp3_rr),
        sl_distance,
        risk_pct,
        leverage,
        rr_ratio: tp_cfg.tp1_rr,
        tp1_close_pct: tp_cfg.tp1_close_pct,
        tp2_close_pct: tp_cfg.tp2_close_pct,
        tp3_close_pct: tp_cfg.tp3_close_pct,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModeConfig;
    use crate::types::Mode;

    fn candle(high: f64, low: f64, close: f64) -> Candle {
        Candle {
            open_time: 0,
            close_time: 0,
            open: close,
            high,
            low,
            close,
            volume: 1.0,
            quote_volume: close,
            trades_count: 1,
            taker_buy_volume: 0.5,
            taker_buy_quote_volume: 0.5 * close,
            is_closed: true,
        }
    }

    fn scalping_config() -> ModeConfig {
        crate::config::BotConfig::default_for(crate::types::BotVersion::V1)
            .mode_config(Mode::Scalping)
            .clone()
    }

    #[test]
    fn atr_method_scales_tps_by_rr() {
        let candles: Vec<Candle> = (0..30).map(|_| candle(101.0, 99.0, 100.0)).collect();
        let config = scalping_config();
        let plan = calculate_risk(&candles, 100.0, Direction::Long, 1.0, &config).unwrap();
        assert!(plan.stop_loss < 100.0);
        assert!((plan.tp1 - 100.0) > 0.0);
        let sl_distance = 100.0 - plan.stop_loss;
        assert!((plan.tp1 - 100.0 - sl_distance * config.take_profit.tp1_rr).abs() < 1e-6);
    }

    #[test]
    fn stop_is_capped_by_max_stop_pct() {
        let candles: Vec<Candle> = (0..30).map(|_| candle(101.0, 99.0, 100.0)).collect();
        let mut config = scalping_config();
        config.stop_loss.atr_multiplier = 50.0; // deliberately huge to force the cap
        let plan = calculate_risk(&candles, 100.0, Direction::Long, 1.0, &config).unwrap();
        let max_distance = 100.0 * config.stop_loss.max_stop_pct / 100.0;
        assert!((plan.sl_distance - max_distance).abs() < 1e-9);
    }

    #[test]
    fn small_stop_gets_max_leverage() {
        assert_eq!(leverage_for_stop_pct(0.05, 3.0, 10.0), 10.0);
        assert_eq!(leverage_for_stop_pct(1.5, 3.0, 10.0), 3.0);
        let mid = leverage_for_stop_pct(0.55, 3.0, 10.0);
        assert!(mid > 3.0 && mid < 10.0);
    }

    #[test]
    fn structural_method_uses_recent_swing_low() {
        let mut candles: Vec<Candle> = (0..20).map(|_| candle(105.0, 95.0, 100.0)).collect();
        candles.push(candle(106.0, 90.0, 100.0));
        let mut config = scalping_config();
        config.stop_loss.method = StopMethod::Structural;
        config.stop_loss.buffer_atr = 0.0;
        let plan = calculate_risk(&candles, 100.0, Direction::Long, 1.0, &config).unwrap();
        assert!((plan.stop_loss - 90.0).abs() < 1e-6);
    }

    #[test]
    fn direction_none_is_rejected() {
        let candles: Vec<Candle> = (0..30).map(|_| candle(101.0, 99.0, 100.0)).collect();
        let config = scalping_config();
        assert!(calculate_risk(&candles, 100.0, Direction::None, 1.0, &config).is_none());
    }
}
