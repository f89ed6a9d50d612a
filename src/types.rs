// =============================================================================
// Shared data model — spec §3
// =============================================================================

use serde::{Deserialize, Serialize};

/// Opaque exchange-native symbol identifier, e.g. "BTCUSDT".
pub type Symbol = String;

/// Analysis mode. Each carries its own timeframe set, setup whitelist,
/// stop/TP policy, minimum score and hold/loss limits (see `config.rs`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Scalping,
    Swing,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scalping => write!(f, "scalping"),
            Self::Swing => write!(f, "swing"),
        }
    }
}

/// Tags every persisted row and selects a variant of scoring weights and
/// feature subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BotVersion {
    V1,
    V2,
    V3,
    V4,
}

impl BotVersion {
    pub fn is_v4(self) -> bool {
        matches!(self, BotVersion::V4)
    }

    pub fn all() -> [BotVersion; 4] {
        [BotVersion::V1, BotVersion::V2, BotVersion::V3, BotVersion::V4]
    }
}

impl std::fmt::Display for BotVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::V1 => write!(f, "V1"),
            Self::V2 => write!(f, "V2"),
            Self::V3 => write!(f, "V3"),
            Self::V4 => write!(f, "V4"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
    None,
}

impl Direction {
    pub fn sign(self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
            Direction::None => 0.0,
        }
    }

    pub fn as_side(self) -> &'static str {
        match self {
            Direction::Long => "BUY",
            Direction::Short => "SELL",
            Direction::None => "NONE",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
            Self::None => write!(f, "none"),
        }
    }
}

/// Market regime as named by spec §4.5 step 4 (a collapse of the richer
/// 5-way classifier in `regime/detector.rs` — see SPEC_FULL.md §11).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Regime {
    Trending,
    Ranging,
    Volatile,
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trending => write!(f, "trending"),
            Self::Ranging => write!(f, "ranging"),
            Self::Volatile => write!(f, "volatile"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeSnapshot {
    pub regime: Regime,
    pub confidence: f64,
}

/// V4-only enrichment snapshots captured at signal time and carried onto
/// the resulting position for later learner/telemetry use.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IndicatorSnapshot {
    pub rsi: f64,
    pub adx: f64,
    pub atr: f64,
    pub bb_bandwidth: f64,
    pub ema_fast: f64,
    pub ema_slow: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ScoresSnapshot {
    pub tradeability: f64,
    pub direction: f64,
    pub setup: f64,
    pub sentiment: f64,
    pub mtf_confluence: f64,
    pub learning_modifier: f64,
    pub final_score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandlePattern {
    BullishEngulfing,
    BearishEngulfing,
    PinBarBullish,
    PinBarBearish,
    Doji,
    Hammer,
    ShootingStar,
    None,
}

/// Reason a candidate analysis did not produce a tradeable signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoTradeReason {
    pub reason: String,
    /// Present when the rejection was a tradeability kill switch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kill_reason: Option<String>,
    pub tradeability_score: f64,
}

/// Lifecycle status of a persisted `Signal` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalStatus {
    Active,
    Executed,
    Skipped,
    Error,
    Test,
}

/// Immutable record produced by the Signal Engine (spec §3). Represented as
/// a tagged variant per spec's Design Notes ("dict-typed signals → tagged
/// variants"): a `Signal` carries the full trade parameters; a `NoTrade`
/// carries only the rejection reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalOutcome {
    Signal(Box<Signal>),
    NoTrade(NoTradeReason),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    pub symbol: Symbol,
    pub mode: Mode,
    pub bot_version: BotVersion,
    pub direction: Direction,
    pub score: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub tp1: f64,
    pub tp2: f64,
    pub tp3: f64,
    pub setup_type: String,
    pub leverage: f64,
    pub rr_ratio: f64,
    pub tp1_close_pct: f64,
    pub tp2_close_pct: f64,
    pub tp3_close_pct: f64,
    pub reasons: Vec<String>,
    pub tradeability_score: f64,
    pub direction_score: f64,
    pub setup_score: f64,
    pub sentiment_score: f64,
    pub status: SignalStatus,
    pub created_at: String,

    // V4-only enrichment, absent for V1-V3.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub indicator_snapshot: Option<IndicatorSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regime_snapshot: Option<RegimeSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scores_snapshot: Option<ScoresSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candle_pattern: Option<CandlePattern>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_atr: Option<f64>,
}

/// State monotonicity chain: active -> (breakeven|closed); breakeven ->
/// (trailing|closed); trailing -> (trailing_tp|closed); trailing_tp -> closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionState {
    Active,
    Breakeven,
    Trailing,
    TrailingTp,
    Closed,
}

impl PositionState {
    /// True if `next` is a legal successor of `self` (or a no-op self-loop).
    pub fn can_transition_to(self, next: PositionState) -> bool {
        use PositionState::*;
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Active, Breakeven)
                | (Active, Closed)
                | (Breakeven, Trailing)
                | (Breakeven, Closed)
                | (Trailing, TrailingTp)
                | (Trailing, Closed)
                | (TrailingTp, Closed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloseReason {
    Sl,
    Tp1,
    Tp2,
    Tp3,
    ProfitGiveback,
    StaleTimeout,
    QuickExit,
    Manual,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Sl => "sl",
            Self::Tp1 => "tp1",
            Self::Tp2 => "tp2",
            Self::Tp3 => "tp3",
            Self::ProfitGiveback => "profit_giveback",
            Self::StaleTimeout => "stale_timeout",
            Self::QuickExit => "quick_exit",
            Self::Manual => "manual",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TradeResult {
    Win,
    Loss,
}

impl std::fmt::Display for TradeResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Win => write!(f, "win"),
            Self::Loss => write!(f, "loss"),
        }
    }
}

/// Mutable record owned exclusively by the Position Monitor of its bot
/// (spec §3 "Position").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    // identity
    pub id: String,
    pub signal_id: String,
    pub bot_version: BotVersion,
    pub symbol: Symbol,
    pub mode: Mode,
    pub direction: Direction,
    pub setup_type: String,

    // prices
    pub entry_price: f64,
    pub stop_loss: f64,
    pub tp1: f64,
    pub tp2: f64,
    pub tp3: f64,
    pub tp1_close_pct: f64,
    pub tp2_close_pct: f64,
    pub tp3_close_pct: f64,

    // size
    pub original_quantity: f64,
    pub remaining_quantity: f64,
    pub position_size_usd: f64,
    pub margin_required: f64,
    pub leverage: f64,

    // exchange order ids — live mode only, absent in paper/demo mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sl_order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tp_order_ids: Option<Vec<String>>,

    pub state: PositionState,

    pub tp1_hit: bool,
    pub tp2_hit: bool,
    pub tp3_hit: bool,
    pub sl_hit: bool,

    pub entry_time: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_reason: Option<CloseReason>,

    // V4 tracking
    pub max_profit_usd: f64,
    pub max_drawdown_usd: f64,
    pub original_sl: f64,
    pub entry_atr: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub indicator_snapshot: Option<IndicatorSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regime_snapshot: Option<RegimeSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scores_snapshot: Option<ScoresSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candle_pattern: Option<CandlePattern>,

    /// Wall-clock "processing" guard preventing a second tick from
    /// triggering an overlapping transition (spec §5 ordering guarantee).
    /// Not serialised; reconstructed as `false` on load.
    #[serde(skip, default)]
    pub processing: bool,
}

impl Position {
    pub fn unrealised_pnl_usd(&self, current_price: f64) -> f64 {
        let diff = match self.direction {
            Direction::Long => current_price - self.entry_price,
            Direction::Short => self.entry_price - current_price,
            Direction::None => 0.0,
        };
        diff * self.remaining_quantity
    }
}

/// One closed-position journal row (spec §3 "Trade"), written exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeJournalRow {
    pub id: String,
    pub position_id: String,
    pub bot_version: BotVersion,
    pub symbol: Symbol,
    pub mode: Mode,
    pub direction: Direction,
    pub setup_type: String,
    pub entry_price: f64,
    pub exit_price: f64,
    pub pnl_usd: f64,
    pub pnl_pct: f64,
    pub result: String,
    pub close_reason: CloseReason,
    pub duration_secs: i64,
    pub entry_time: chrono::DateTime<chrono::Utc>,
    pub closed_at: chrono::DateTime<chrono::Utc>,
}

/// Unique key (setup_type, symbol, mode); the legacy trade_learner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupPerformance {
    pub setup_type: String,
    pub symbol: Symbol,
    pub mode: Mode,
    pub wins: u32,
    pub losses: u32,
    pub total_pnl: f64,
    pub disabled: bool,
}

/// One of the 8 Adaptive Learner dimensions (spec §4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearnerDimension {
    SetupType,
    Symbol,
    Mode,
    Regime,
    HourGroup,
    ScoreRange,
    Direction,
    MtfConfluence,
}

impl std::fmt::Display for LearnerDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SetupType => "setup_type",
            Self::Symbol => "symbol",
            Self::Mode => "mode",
            Self::Regime => "regime",
            Self::HourGroup => "hour_group",
            Self::ScoreRange => "score_range",
            Self::Direction => "direction",
            Self::MtfConfluence => "mtf_confluence",
        };
        write!(f, "{s}")
    }
}

/// Unique key (dimension, dimension_value, bot_version).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningWeight {
    pub dimension: LearnerDimension,
    pub dimension_value: String,
    pub bot_version: BotVersion,
    pub weight_modifier: f64,
    pub confidence: f64,
    pub win_rate_7d: f64,
    pub win_rate_30d: f64,
    pub win_rate_all: f64,
    pub avg_pnl: f64,
    pub sample_size: u32,
}

/// Append-only row capturing the complete snapshot used to train
/// `LearningWeight`s (spec §3 "TradeContext").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeContext {
    pub id: String,
    pub bot_version: BotVersion,
    pub symbol: Symbol,
    pub mode: Mode,
    pub setup_type: String,
    pub direction: Direction,
    pub regime: Regime,
    pub score_range: String,
    pub mtf_confluence_bucket: String,
    pub hour_utc: u32,
    pub day_of_week: u32,
    /// Gross pnl (pre round-trip-fee deduction) — see DESIGN.md Open
    /// Question 1: the learner trains on the same pre-fee value the
    /// Python source fed it.
    pub pnl: f64,
    /// Net pnl (post fee deduction), added so learner consumers can
    /// reconcile against journaled numbers without re-deriving fees.
    pub pnl_net: f64,
    pub max_profit_usd: f64,
    pub max_drawdown_usd: f64,
    pub duration_secs: i64,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Per-bot simulated portfolio (spec §3 "PaperPortfolio").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperPortfolio {
    pub bot_version: BotVersion,
    pub initial_balance: f64,
    pub current_balance: f64,
    pub reserved_margin: f64,
    pub total_trades: u32,
    pub wins: u32,
    pub losses: u32,
    pub total_pnl: f64,
    pub best_trade_pnl: f64,
    pub worst_trade_pnl: f64,
}

impl PaperPortfolio {
    pub fn new(bot_version: BotVersion, initial_balance: f64) -> Self {
        Self {
            bot_version,
            initial_balance,
            current_balance: initial_balance,
            reserved_margin: 0.0,
            total_trades: 0,
            wins: 0,
            losses: 0,
            total_pnl: 0.0,
            best_trade_pnl: 0.0,
            worst_trade_pnl: 0.0,
        }
    }

    pub fn available_balance(&self) -> f64 {
        self.current_balance - self.reserved_margin
    }
}

/// Whether the engine is actively trading, paused, or killed. Carried over
/// from the teacher for safety-override semantics in `main.rs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    Live,
    Paused,
    Killed,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Paused
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "Live"),
            Self::Paused => write!(f, "Paused"),
            Self::Killed => write!(f, "Killed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountMode {
    Demo,
    Live,
}

impl Default for AccountMode {
    fn default() -> Self {
        Self::Demo
    }
}

impl std::fmt::Display for AccountMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Demo => write!(f, "Demo"),
            Self::Live => write!(f, "Live"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_monotonicity_chain() {
        use PositionState::*;
        assert!(Active.can_transition_to(Breakeven));
        assert!(Active.can_transition_to(Closed));
        assert!(Breakeven.can_transition_to(Trailing));
        assert!(Trailing.can_transition_to(TrailingTp));
        assert!(TrailingTp.can_transition_to(Closed));
        assert!(!Trailing.can_transition_to(Active));
        assert!(!Closed.can_transition_to(Active));
        assert!(!Breakeven.can_transition_to(TrailingTp));
    }

    #[test]
    fn paper_portfolio_available_balance() {
        let mut p = PaperPortfolio::new(BotVersion::V1, 1000.0);
        p.reserved_margin = 100.0;
        assert_eq!(p.available_balance(), 900.0);
    }
}
