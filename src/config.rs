// =============================================================================
// Per-bot-version configuration — spec §6 EXTERNAL INTERFACES
// =============================================================================
//
// Keyed YAML, one file per bot version. Mirrors the teacher's
// `runtime_config.rs` load/save shape (atomic tmp-then-rename, per-field
// `#[serde(default = "fn")]`) but the file format is YAML per spec §6 rather
// than the teacher's JSON (see SPEC_FULL.md §10.3).
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::{AccountMode, BotVersion, Mode, TradingMode};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairConfig {
    pub symbol: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_seconds: u64,
    #[serde(default = "default_modes")]
    pub modes: Vec<Mode>,
    /// Anti-flip-flop window. Resolved at 45s — see DESIGN.md Open
    /// Question 4 (spec §9 names both 300s and 45s across source
    /// revisions; 45s is the tighter, more conservative choice and matches
    /// spec §4.7's literal example).
    #[serde(default = "default_anti_flip_flop_secs")]
    pub anti_flip_flop_secs: u64,
    /// Small inter-symbol delay (spec §4.7 step 7) to avoid rate-limit bursts.
    #[serde(default = "default_inter_symbol_delay_ms")]
    pub inter_symbol_delay_ms: u64,
}

fn default_interval_secs() -> u64 {
    15
}
fn default_modes() -> Vec<Mode> {
    vec![Mode::Scalping, Mode::Swing]
}
fn default_anti_flip_flop_secs() -> u64 {
    45
}
fn default_inter_symbol_delay_ms() -> u64 {
    150
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval_secs(),
            modes: default_modes(),
            anti_flip_flop_secs: default_anti_flip_flop_secs(),
            inter_symbol_delay_ms: default_inter_symbol_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectionConfig {
    #[serde(default = "d_ema_fast")]
    pub ema_fast: usize,
    #[serde(default = "d_ema_slow")]
    pub ema_slow: usize,
    #[serde(default = "d_ema_neutral_threshold")]
    pub ema_neutral_threshold: f64,
    #[serde(default = "d_rsi_long")]
    pub rsi_long_threshold: f64,
    #[serde(default = "d_rsi_short")]
    pub rsi_short_threshold: f64,
    #[serde(default = "d_structure_lookback")]
    pub structure_lookback: usize,
}

fn d_ema_fast() -> usize {
    20
}
fn d_ema_slow() -> usize {
    50
}
fn d_ema_neutral_threshold() -> f64 {
    0.2
}
fn d_rsi_long() -> f64 {
    55.0
}
fn d_rsi_short() -> f64 {
    45.0
}
fn d_structure_lookback() -> usize {
    40
}

impl Default for DirectionConfig {
    fn default() -> Self {
        Self {
            ema_fast: d_ema_fast(),
            ema_slow: d_ema_slow(),
            ema_neutral_threshold: d_ema_neutral_threshold(),
            rsi_long_threshold: d_rsi_long(),
            rsi_short_threshold: d_rsi_short(),
            structure_lookback: d_structure_lookback(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryConfig {
    #[serde(default = "e_setups")]
    pub setups: Vec<String>,
    #[serde(default = "e_min_score")]
    pub min_score: f64,
    #[serde(default = "e_bb_squeeze")]
    pub bb_squeeze_threshold: f64,
    #[serde(default = "e_volume_spike")]
    pub volume_spike_ratio: f64,
    #[serde(default = "e_retest_buffer")]
    pub retest_buffer_pct: f64,
    #[serde(default = "e_rejection_wick")]
    pub rejection_wick_ratio: f64,
    #[serde(default = "e_ema_bounce_proximity")]
    pub ema_bounce_proximity_pct: f64,
}

fn e_setups() -> Vec<String> {
    vec![
        "breakout".into(),
        "retest".into(),
        "divergence".into(),
        "ema_bounce".into(),
        "momentum".into(),
    ]
}
fn e_min_score() -> f64 {
    50.0
}
fn e_bb_squeeze() -> f64 {
    1.5
}
fn e_volume_spike() -> f64 {
    1.8
}
fn e_retest_buffer() -> f64 {
    0.15
}
fn e_rejection_wick() -> f64 {
    1.5
}
fn e_ema_bounce_proximity() -> f64 {
    0.3
}

impl Default for EntryConfig {
    fn default() -> Self {
        Self {
            setups: e_setups(),
            min_score: e_min_score(),
            bb_squeeze_threshold: e_bb_squeeze(),
            volume_spike_ratio: e_volume_spike(),
            retest_buffer_pct: e_retest_buffer(),
            rejection_wick_ratio: e_rejection_wick(),
            ema_bounce_proximity_pct: e_ema_bounce_proximity(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopMethod {
    Atr,
    Structural,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopLossConfig {
    pub method: StopMethod,
    pub atr_multiplier: f64,
    pub buffer_atr: f64,
    pub max_stop_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TakeProfitConfig {
    pub tp1_rr: f64,
    pub tp2_rr: f64,
    pub tp3_rr: f64,
    pub tp1_close_pct: f64,
    pub tp2_close_pct: f64,
    pub tp3_close_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskRangeConfig {
    pub lev_min: f64,
    pub lev_max: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryModeConfig {
    pub setups: Vec<String>,
    pub min_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EarlyProtectionConfig {
    pub breakeven_at_pct: f64,
    pub trail_activation_pct: f64,
    pub trail_behind_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeConfig {
    pub timeframes_analysis: Vec<String>,
    pub timeframes_filter: String,
    pub stop_loss: StopLossConfig,
    pub take_profit: TakeProfitConfig,
    pub risk: RiskRangeConfig,
    pub entry: EntryModeConfig,
    pub early_protection: EarlyProtectionConfig,
    pub max_hold_seconds: u64,
    pub min_profit_usd: f64,
    pub max_loss_usd: f64,
    /// Swing-only: reject a neutral Direction bias outright rather than
    /// allowing it through at half score (spec §4.3).
    #[serde(default)]
    pub reject_neutral: bool,
}

impl ModeConfig {
    fn scalping_default() -> Self {
        Self {
            timeframes_analysis: vec!["5m".into()],
            timeframes_filter: "1h".into(),
            stop_loss: StopLossConfig {
                method: StopMethod::Atr,
                atr_multiplier: 1.5,
                buffer_atr: 0.3,
                max_stop_pct: 1.2,
            },
            take_profit: TakeProfitConfig {
                tp1_rr: 1.0,
                tp2_rr: 2.0,
                tp3_rr: 3.5,
                tp1_close_pct: 40.0,
                tp2_close_pct: 35.0,
                tp3_close_pct: 25.0,
            },
            risk: RiskRangeConfig {
                lev_min: 3.0,
                lev_max: 10.0,
            },
            entry: EntryModeConfig {
                setups: e_setups(),
                min_score: 55.0,
            },
            early_protection: EarlyProtectionConfig {
                breakeven_at_pct: 0.4,
                trail_activation_pct: 0.7,
                trail_behind_pct: 0.3,
            },
            max_hold_seconds: 4 * 3600,
            min_profit_usd: 0.05,
            max_loss_usd: 25.0,
            reject_neutral: false,
        }
    }

    fn swing_default() -> Self {
        Self {
            timeframes_analysis: vec!["1h".into()],
            timeframes_filter: "4h".into(),
            stop_loss: StopLossConfig {
                method: StopMethod::Structural,
                atr_multiplier: 2.0,
                buffer_atr: 0.5,
                max_stop_pct: 3.0,
            },
            take_profit: TakeProfitConfig {
                tp1_rr: 1.5,
                tp2_rr: 3.0,
                tp3_rr: 5.0,
                tp1_close_pct: 30.0,
                tp2_close_pct: 40.0,
                tp3_close_pct: 30.0,
            },
            risk: RiskRangeConfig {
                lev_min: 2.0,
                lev_max: 5.0,
            },
            entry: EntryModeConfig {
                setups: e_setups(),
                min_score: 60.0,
            },
            early_protection: EarlyProtectionConfig {
                breakeven_at_pct: 0.5,
                trail_activation_pct: 0.75,
                trail_behind_pct: 0.25,
            },
            max_hold_seconds: 3 * 24 * 3600,
            min_profit_usd: 0.05,
            max_loss_usd: 80.0,
            reject_neutral: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeabilityThresholds {
    pub atr_min_ratio: f64,
    pub atr_max_ratio: f64,
    pub volume_min_ratio: f64,
    pub spread_kill: f64,
    pub spread_max_scalp: f64,
    pub spread_max_swing: f64,
    pub funding_kill: f64,
    pub funding_max: f64,
    pub oi_drop_max_pct: f64,
    /// Bid+ask depth in quote-currency (USD) below which the depth check
    /// starts scaling down from 1.0; see `tradeability::score_depth`.
    pub depth_min_usd: f64,
}

impl Default for TradeabilityThresholds {
    fn default() -> Self {
        Self {
            atr_min_ratio: 0.8,
            atr_max_ratio: 2.0,
            volume_min_ratio: 0.8,
            spread_kill: 0.40,
            spread_max_scalp: 0.12,
            spread_max_swing: 0.25,
            funding_kill: 0.20,
            funding_max: 0.08,
            oi_drop_max_pct: 8.0,
            depth_min_usd: 50_000.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeabilityWeights {
    pub volatility: f64,
    pub volume: f64,
    pub spread: f64,
    pub funding: f64,
    pub oi: f64,
    pub adx: f64,
    /// V4 only; ignored (weight 0) for V1-V3 unless explicitly configured.
    pub order_flow: f64,
    pub depth: f64,
}

impl Default for TradeabilityWeights {
    fn default() -> Self {
        Self {
            volatility: 0.15,
            volume: 0.15,
            spread: 0.15,
            funding: 0.15,
            oi: 0.10,
            adx: 0.20,
            order_flow: 0.0,
            depth: 0.10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TradeabilityConfig {
    #[serde(default)]
    pub thresholds: TradeabilityThresholds,
    #[serde(default)]
    pub weights: TradeabilityWeights,
    #[serde(default = "t_min_score")]
    pub min_score: f64,
}

fn t_min_score() -> f64 {
    0.35
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub tradeability: f64,
    pub direction: f64,
    pub setup: f64,
    pub sentiment: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            tradeability: 0.30,
            direction: 0.30,
            setup: 0.30,
            sentiment: 0.10,
        }
    }
}

// ---- V4-only sections ------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeesConfig {
    pub taker_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingConfig {
    pub base_pct: f64,
    pub min_margin: f64,
    pub max_margin: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimitsConfig {
    pub max_daily_loss_usd: f64,
    pub max_consecutive_losses: u32,
    pub pause_minutes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfitProtectionConfig {
    pub activation_fee_mult: f64,
    pub giveback_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrailingTpConfig {
    pub enabled: bool,
    pub tp3_close_pct: f64,
    pub trail_atr: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct V4Extensions {
    pub fees: FeesConfig,
    pub sizing: SizingConfig,
    pub risk_limits: RiskLimitsConfig,
    pub profit_protection: ProfitProtectionConfig,
    pub trailing_tp: TrailingTpConfig,
}

impl Default for V4Extensions {
    fn default() -> Self {
        Self {
            fees: FeesConfig { taker_pct: 0.06 },
            sizing: SizingConfig {
                base_pct: 3.0,
                min_margin: 5.0,
                max_margin: 50.0,
            },
            risk_limits: RiskLimitsConfig {
                max_daily_loss_usd: 30.0,
                max_consecutive_losses: 4,
                pause_minutes: 60,
            },
            profit_protection: ProfitProtectionConfig {
                activation_fee_mult: 3.0,
                giveback_pct: 0.50,
            },
            trailing_tp: TrailingTpConfig {
                enabled: true,
                tp3_close_pct: 100.0,
                trail_atr: 1.0,
            },
        }
    }
}

/// Full per-bot-version configuration (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    #[serde(skip)]
    pub bot_version: BotVersion,
    pub pairs: Vec<PairConfig>,
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub direction: DirectionConfig,
    #[serde(default)]
    pub entry: EntryConfig,
    #[serde(default)]
    pub modes: HashMap<Mode, ModeConfig>,
    #[serde(default)]
    pub tradeability: TradeabilityConfig,
    #[serde(default)]
    pub scoring: ScoringWeights,
    #[serde(default)]
    pub swing_neutral_allowed: bool,
    #[serde(default = "i_initial_balance")]
    pub initial_balance: f64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub v4: Option<V4Extensions>,
    /// Global safety gate (SPEC_FULL.md §10.6, DESIGN.md Open Question 13):
    /// `main.rs` only logs whatever this resolves to at boot, it never
    /// overrides it — this engine has no live order-placement adapter for a
    /// forced-Paused default to protect against, so the default is `Live`
    /// and the Scanner runs unless an operator edits this field on disk and
    /// restarts. `Killed` stops the Scanner loop entirely but leaves the
    /// Position Monitor managing open trades.
    #[serde(default)]
    pub trading_mode: TradingMode,
    /// Everything this engine does is paper trading (no live order
    /// placement adapter exists — spec §1 scopes that out), so this stays
    /// `Demo` in practice; carried from the teacher's config shape for
    /// parity with its persisted-row semantics.
    #[serde(default)]
    pub account_mode: AccountMode,
}

fn i_initial_balance() -> f64 {
    1000.0
}

impl BotConfig {
    /// Construct the compiled-in defaults for a given bot version,
    /// matching spec §6: V4 carries the extra `fees`/`sizing`/`risk_limits`/
    /// `profit_protection`/`trailing_tp` sections, V1-V3 do not.
    pub fn default_for(bot_version: BotVersion) -> Self {
        let mut modes = HashMap::new();
        modes.insert(Mode::Scalping, ModeConfig::scalping_default());
        modes.insert(Mode::Swing, ModeConfig::swing_default());

        let scoring = match bot_version {
            // spec §4.5 step 11: V4 scalping 0.35/0.30/0.30/0.05, V4 swing
            // 0.30/0.25/0.25/0.20 — represented here as the V4 default;
            // `scoring_for_mode` applies the mode-specific split.
            BotVersion::V4 => ScoringWeights {
                tradeability: 0.35,
                direction: 0.30,
                setup: 0.30,
                sentiment: 0.05,
            },
            _ => ScoringWeights::default(),
        };

        Self {
            bot_version,
            pairs: vec![
                PairConfig {
                    symbol: "BTCUSDT".into(),
                    enabled: true,
                },
                PairConfig {
                    symbol: "ETHUSDT".into(),
                    enabled: true,
                },
            ],
            scanner: ScannerConfig::default(),
            direction: DirectionConfig::default(),
            entry: EntryConfig::default(),
            modes,
            tradeability: TradeabilityConfig::default(),
            scoring,
            swing_neutral_allowed: !matches!(bot_version, BotVersion::V4),
            initial_balance: i_initial_balance(),
            v4: matches!(bot_version, BotVersion::V4).then(V4Extensions::default),
            // Unlike the teacher, this engine has no live order-placement
            // adapter at all (spec §1 scopes it out), so there's nothing
            // for a Paused default to protect against; a freshly
            // bootstrapped bot should actually scan. `Paused`/`Killed`
            // remain available as an operator-editable kill switch.
            trading_mode: TradingMode::Live,
            account_mode: AccountMode::default(),
        }
    }

    /// Scoring weights split for (bot_version, mode) per spec §4.5 step 11.
    pub fn scoring_for_mode(&self, mode: Mode) -> ScoringWeights {
        if self.bot_version.is_v4() {
            return match mode {
                Mode::Scalping => ScoringWeights {
                    tradeability: 0.35,
                    direction: 0.30,
                    setup: 0.30,
                    sentiment: 0.05,
                },
                Mode::Swing => ScoringWeights {
                    tradeability: 0.30,
                    direction: 0.25,
                    setup: 0.25,
                    sentiment: 0.20,
                },
            };
        }
        self.scoring.clone()
    }

    /// Look up a mode's config section, falling back to the compiled-in
    /// default for that mode when an operator-edited config file only
    /// defines one of the two `modes:` sections. An incomplete-but-valid
    /// config must never panic the spawned scan loop the first time the
    /// missing mode is reached.
    pub fn mode_config(&self, mode: Mode) -> ModeConfig {
        self.modes.get(&mode).cloned().unwrap_or_else(|| {
            warn!(%mode, "bot config is missing this mode's section, falling back to built-in default");
            match mode {
                Mode::Scalping => ModeConfig::scalping_default(),
                Mode::Swing => ModeConfig::swing_default(),
            }
        })
    }

    /// Load from `path`; on any error, log a warning and fall back to
    /// compiled-in defaults rather than failing startup (teacher's
    /// `RuntimeConfig::load` shape).
    pub fn load(path: impl AsRef<Path>, bot_version: BotVersion) -> Self {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(raw) => match serde_yaml::from_str::<BotConfig>(&raw) {
                Ok(mut cfg) => {
                    cfg.bot_version = bot_version;
                    cfg
                }
                Err(e) => {
                    warn!(?path, error = %e, "failed to parse bot config, using defaults");
                    Self::default_for(bot_version)
                }
            },
            Err(e) => {
                warn!(?path, error = %e, "failed to read bot config, using defaults");
                Self::default_for(bot_version)
            }
        }
    }

    /// Atomic write-then-rename save (teacher's `RuntimeConfig::save` idiom).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let yaml = serde_yaml::to_string(self).context("serialize bot config to YAML")?;
        let tmp_path = path.with_extension("yaml.tmp");
        std::fs::write(&tmp_path, yaml)
            .with_context(|| format!("write temp config file {tmp_path:?}"))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("rename temp config into place at {path:?}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_default_carries_extensions() {
        let cfg = BotConfig::default_for(BotVersion::V4);
        assert!(cfg.v4.is_some());
        assert!(!cfg.swing_neutral_allowed);
    }

    #[test]
    fn v1_default_has_no_v4_extensions() {
        let cfg = BotConfig::default_for(BotVersion::V1);
        assert!(cfg.v4.is_none());
        assert!(cfg.swing_neutral_allowed);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = std::env::temp_dir().join(format!("aurora-cfg-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("v1.yaml");
        let cfg = BotConfig::default_for(BotVersion::V1);
        cfg.save(&path).unwrap();
        let loaded = BotConfig::load(&path, BotVersion::V1);
        assert_eq!(loaded.pairs.len(), cfg.pairs.len());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn scoring_for_mode_v4_differs_by_mode() {
        let cfg = BotConfig::default_for(BotVersion::V4);
        let scalp = cfg.scoring_for_mode(Mode::Scalping);
        let swing = cfg.scoring_for_mode(Mode::Swing);
        assert!((scalp.sentiment - 0.05).abs() < 1e-9);
        assert!((swing.sentiment - 0.20).abs() < 1e-9);
    }
}
