// =============================================================================
// Position Monitor — spec §4.9, the state machine
// =============================================================================
//
// Owns every open `Position` for one bot instance: per-tick evaluation
// (early-profit protection, TP/SL transitions, V4 profit-giveback/quick-exit
// preflight, stale-timeout), the atomic close-and-journal path, and the
// per-symbol deal-stream worker lifecycle. Position/state-field layout is
// grounded on the teacher's `position_engine.rs`; the ATR-aware trailing-stop
// mechanism generalizes the teacher's `exit/{triple_barrier,micro_trail}.rs`
// into the V1-V4 policy branches named in SPEC_FULL.md §11. The reconnect
// loop is the teacher's `main.rs` `tokio::spawn { loop { ... sleep } }` idiom,
// reused here per symbol instead of once per process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::adaptive_learner::{mtf_bucket, score_range, AdaptiveLearner};
use crate::config::{BotConfig, ModeConfig};
use crate::indicators::atr::calculate_atr;
use crate::market_data::client::MarketDataClient;
use crate::market_data::deal_stream::{run_deal_stream, DealStreamProcessor};
use crate::paper_trader::Execution;
use crate::persistence::Persistence;
use crate::types::{
    BotVersion, CloseReason, Direction, Position, PositionState, Regime, SetupPerformance, Symbol,
    TradeContext, TradeJournalRow, TradeResult,
};

const BACKUP_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const TICK_POLL_INTERVAL: Duration = Duration::from_millis(250);
const WS_RECONNECT_DELAY: Duration = Duration::from_secs(3);
const DYNAMIC_SL_WIDEN_RATIO: f64 = 1.5;
const DYNAMIC_SL_WIDEN_CAP: f64 = 2.0;
const V1_V3_STALE_PNL_FLOOR: f64 = 0.05;

/// Emitted once a position fully closes; `bot.rs` consumes these and invokes
/// the Paper Trader's `on_position_closed` callback (spec §4.8's "register a
/// callback that releases reserved margin").
#[derive(Debug, Clone)]
pub struct ClosedPositionEvent {
    pub position_id: String,
    pub symbol: Symbol,
    pub pnl_usd: f64,
}

pub struct PositionMonitor {
    bot_version: BotVersion,
    persistence: Arc<dyn Persistence>,
    market_client: Arc<MarketDataClient>,
    config: Arc<BotConfig>,
    learner: Option<Arc<AdaptiveLearner>>,
    ws_base_url: String,
    positions: Mutex<HashMap<String, Position>>,
    ws_tasks: Mutex<HashMap<Symbol, JoinHandle<()>>>,
    running: AtomicBool,
    close_tx: mpsc::UnboundedSender<ClosedPositionEvent>,
}

impl PositionMonitor {
    pub fn new(
        bot_version: BotVersion,
        persistence: Arc<dyn Persistence>,
        market_client: Arc<MarketDataClient>,
        config: Arc<BotConfig>,
        learner: Option<Arc<AdaptiveLearner>>,
        ws_base_url: String,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ClosedPositionEvent>) {
        let (close_tx, close_rx) = mpsc::unbounded_channel();
        let monitor = Arc::new(Self {
            bot_version,
            persistence,
            market_client,
            config,
            learner,
            ws_base_url,
            positions: Mutex::new(HashMap::new()),
            ws_tasks: Mutex::new(HashMap::new()),
            running: AtomicBool::new(true),
            close_tx,
        });
        (monitor, close_rx)
    }

    pub fn has_open_position(&self, symbol: &str) -> bool {
        self.positions
            .lock()
            .values()
            .any(|p| p.symbol == symbol && p.state != PositionState::Closed)
    }

    pub fn open_position_count(&self) -> usize {
        self.positions.lock().values().filter(|p| p.state != PositionState::Closed).count()
    }

    /// Accept a Paper Trader execution: build the `Position`, persist it,
    /// lazily spawn its symbol's deal-stream worker if one isn't already
    /// running, and return the assigned id.
    #[instrument(skip(self, execution), fields(symbol = %execution.symbol))]
    pub async fn register_trade(self: &Arc<Self>, execution: &Execution) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let position = Position {
            id: id.clone(),
            signal_id: execution.signal_id.clone(),
            bot_version: execution.bot_version,
            symbol: execution.symbol.clone(),
            mode: execution.mode,
            direction: execution.direction,
            setup_type: execution.setup_type.clone(),
            entry_price: execution.entry_price,
            stop_loss: execution.stop_loss,
            tp1: execution.tp1,
            tp2: execution.tp2,
            tp3: execution.tp3,
            tp1_close_pct: execution.tp1_close_pct,
            tp2_close_pct: execution.tp2_close_pct,
            tp3_close_pct: execution.tp3_close_pct,
            original_quantity: execution.quantity,
            remaining_quantity: execution.quantity,
            position_size_usd: execution.quantity * execution.entry_price,
            margin_required: execution.margin,
            leverage: execution.leverage,
            sl_order_id: None,
            tp_order_ids: None,
            state: PositionState::Active,
            tp1_hit: false,
            tp2_hit: false,
            tp3_hit: false,
            sl_hit: false,
            entry_time: Utc::now(),
            closed_at: None,
            close_reason: None,
            max_profit_usd: 0.0,
            max_drawdown_usd: 0.0,
            original_sl: execution.stop_loss,
            entry_atr: execution.entry_atr,
            indicator_snapshot: execution.indicator_snapshot.clone(),
            regime_snapshot: execution.regime_snapshot.clone(),
            scores_snapshot: execution.scores_snapshot.clone(),
            candle_pattern: execution.candle_pattern,
            processing: false,
        };
        self.persistence.upsert_active_position(&position).await?;
        self.positions.lock().insert(id.clone(), position);
        self.ensure_ws_worker(execution.symbol.clone());
        Ok(id)
    }

    // -------------------------------------------------------------------
    // Per-tick dispatch
    // -------------------------------------------------------------------

    /// Dispatch a new last-trade price to every open, non-processing
    /// position on this symbol. Spec §5: "cross-position fan-out with no
    /// lock" — each position's evaluation acquires only its own entry.
    pub async fn tick(&self, symbol: &str, price: f64) {
        let ids: Vec<String> = {
            let positions = self.positions.lock();
            positions
                .values()
                .filter(|p| p.symbol == symbol && p.state != PositionState::Closed)
                .map(|p| p.id.clone())
                .collect()
        };
        for id in ids {
            self.evaluate_position(&id, price).await;
        }
    }

    async fn evaluate_position(&self, position_id: &str, price: f64) {
        {
            let mut positions = self.positions.lock();
            let Some(pos) = positions.get_mut(position_id) else { return };
            if pos.processing || pos.state == PositionState::Closed {
                return;
            }
            pos.processing = true;
        }

        let outcome = self.apply_tick(position_id, price);

        match outcome {
            Some((close_reason, exit_price)) => {
                let pos = { self.positions.lock().get(position_id).cloned() };
                if let Some(pos) = pos {
                    self.close_and_journal(pos, exit_price, close_reason).await;
                    self.positions.lock().remove(position_id);
                }
            }
            None => {
                let mut positions = self.positions.lock();
                if let Some(pos) = positions.get_mut(position_id) {
                    pos.processing = false;
                }
            }
        }
    }

    /// Mutate `position_id`'s in-memory state for one tick; returns
    /// `Some((reason, exit_price))` if the position should close.
    fn apply_tick(&self, position_id: &str, price: f64) -> Option<(CloseReason, f64)> {
        let mut positions = self.positions.lock();
        let pos = positions.get_mut(position_id)?;
        let mode_cfg = self.config.mode_config(pos.mode);
        let is_v4 = self.bot_version.is_v4();

        // V4 preflight: track extrema, then quick-exit/stale-timeout/giveback.
        if is_v4 {
            let pnl = pos.unrealised_pnl_usd(price);
            pos.max_profit_usd = pos.max_profit_usd.max(pnl);
            pos.max_drawdown_usd = pos.max_drawdown_usd.min(pnl);

            if let Some(reason) = self.v4_preflight(pos, pnl, mode_cfg) {
                return Some((reason, price));
            }
        }

        // V3/V4 mode-level preflight: absolute max-loss cap (see DESIGN.md
        // Open Question 9) and the stale-timeout threshold.
        if matches!(self.bot_version, BotVersion::V3 | BotVersion::V4) {
            let pnl = pos.unrealised_pnl_usd(price);
            if pnl <= -mode_cfg.max_loss_usd {
                return Some((CloseReason::Sl, price));
            }
        }
        if self.is_stale(pos, mode_cfg, price) {
            return Some((CloseReason::StaleTimeout, price));
        }

        match pos.state {
            PositionState::Active => self.evaluate_pre_tp1(pos, price, mode_cfg),
            PositionState::Breakeven => self.evaluate_post_tp1(pos, price),
            PositionState::Trailing => self.evaluate_post_tp2(pos, price),
            PositionState::TrailingTp => self.evaluate_trailing_tp(pos, price),
            PositionState::Closed => None,
        }
    }

    fn is_stale(&self, pos: &Position, mode_cfg: &ModeConfig, price: f64) -> bool {
        let expired = pos.entry_time + chrono::Duration::seconds(mode_cfg.max_hold_seconds as i64) < Utc::now();
        if !expired {
            return false;
        }
        let pnl = pos.unrealised_pnl_usd(price);
        if self.bot_version.is_v4() {
            pnl < 0.0
        } else {
            pnl < V1_V3_STALE_PNL_FLOOR
        }
    }

    /// V4-only: quick-exit (disabled by default) and profit-giveback.
    fn v4_preflight(&self, pos: &Position, pnl: f64, _mode_cfg: &ModeConfig) -> Option<CloseReason> {
        let v4 = self.config.v4.as_ref()?;
        let round_trip_fees = pos.position_size_usd * v4.fees.taker_pct / 100.0 * 2.0;
        let activation = v4.profit_protection.activation_fee_mult * round_trip_fees;
        if pos.max_profit_usd >= activation && pos.max_profit_usd > f64::EPSILON {
            let giveback = (pos.max_profit_usd - pnl) / pos.max_profit_usd;
            if giveback >= v4.profit_protection.giveback_pct && pnl - round_trip_fees > 0.0 {
                return Some(CloseReason::ProfitGiveback);
            }
        }
        None
    }

    /// Before TP1: early-profit protection (breakeven migration, then
    /// trailing), then TP1/SL checks.
    fn evaluate_pre_tp1(&self, pos: &mut Position, price: f64, mode_cfg: &ModeConfig) -> Option<CloseReason> {
        let progress_pct = self.progress_pct(pos, price);
        let ep = &mode_cfg.early_protection;

        if pos.state == PositionState::Active && progress_pct >= ep.breakeven_at_pct {
            let breakeven = self.fee_adjusted_breakeven(pos);
            raise_stop_monotonic(pos, breakeven);
        }
        if progress_pct >= ep.trail_activation_pct {
            let tp1_distance = (pos.tp1 - pos.entry_price).abs();
            let trail_offset = (progress_pct - ep.trail_behind_pct) * tp1_distance;
            let candidate = match pos.direction {
                Direction::Long => pos.entry_price + trail_offset,
                Direction::Short => pos.entry_price - trail_offset,
                Direction::None => pos.stop_loss,
            };
            raise_stop_monotonic(pos, candidate);
        }

        if tp_hit(pos, price, pos.tp1) {
            let taker_pct = self.config.v4.as_ref().map(|v| v.fees.taker_pct);
            transition_tp1(pos, self.bot_version.is_v4(), taker_pct);
            return None;
        }
        if sl_hit(pos, price) {
            return Some(CloseReason::Sl);
        }
        None
    }

    /// Progress toward TP1 as a fraction of the entry-to-TP1 distance,
    /// clamped to `[0, 1]` (the early-protection percentages are read from
    /// config as fractions of this progress, e.g. `0.4` == 40% of the way).
    fn progress_pct(&self, pos: &Position, price: f64) -> f64 {
        let tp1_distance = (pos.tp1 - pos.entry_price).abs();
        if tp1_distance <= f64::EPSILON {
            return 0.0;
        }
        let moved = match pos.direction {
            Direction::Long => price - pos.entry_price,
            Direction::Short => pos.entry_price - price,
            Direction::None => 0.0,
        };
        (moved / tp1_distance).clamp(0.0, 10.0)
    }

    /// After TP1, before TP2: TP2/SL checks only (no further early-profit
    /// logic — the SL is already at breakeven or trailing toward it).
    fn evaluate_post_tp1(&self, pos: &mut Position, price: f64) -> Option<CloseReason> {
        if tp_hit(pos, price, pos.tp2) {
            transition_tp2(pos);
            return None;
        }
        if sl_hit(pos, price) {
            return Some(CloseReason::Sl);
        }
        None
    }

    /// After TP2, before TP3.
    fn evaluate_post_tp2(&self, pos: &mut Position, price: f64) -> Option<CloseReason> {
        if tp_hit(pos, price, pos.tp3) {
            if self.bot_version.is_v4() {
                if let Some(v4) = self.config.v4.as_ref() {
                    if v4.trailing_tp.enabled && v4.trailing_tp.tp3_close_pct < 100.0 {
                        transition_tp3_trailing(pos, v4.trailing_tp.tp3_close_pct, v4.trailing_tp.trail_atr);
                        return None;
                    }
                }
            }
            return Some(CloseReason::Tp3);
        }
        if sl_hit(pos, price) {
            return Some(CloseReason::Sl);
        }
        None
    }

    /// After a partial TP3 close (V4 `trailing_tp` config): keep trailing
    /// the remainder by `trail_atr * entry_atr` behind price.
    fn evaluate_trailing_tp(&self, pos: &mut Position, price: f64) -> Option<CloseReason> {
        if let Some(v4) = self.config.v4.as_ref() {
            if v4.trailing_tp.enabled && pos.entry_atr > f64::EPSILON {
                let trail_distance = pos.entry_atr * v4.trailing_tp.trail_atr;
                let candidate = match pos.direction {
                    Direction::Long => price - trail_distance,
                    Direction::Short => price + trail_distance,
                    Direction::None => pos.stop_loss,
                };
                raise_stop_monotonic(pos, candidate);
            }
        }
        if sl_hit(pos, price) {
            return Some(CloseReason::Sl);
        }
        None
    }

    /// `entry ± round_trip_fees / remaining_quantity`, on the side that
    /// covers the round-trip taker fee (V4 only); plain entry for V1-V3.
    /// Used pre-TP1, where `remaining_quantity` still equals the original
    /// size.
    fn fee_adjusted_breakeven(&self, pos: &Position) -> f64 {
        let taker_pct = self.config.v4.as_ref().map(|v| v.fees.taker_pct);
        fee_adjusted_breakeven_with(pos, self.bot_version.is_v4(), taker_pct)
    }

    // -------------------------------------------------------------------
    // Close path
    // -------------------------------------------------------------------

    #[instrument(skip(self, pos), fields(position_id = %pos.id, symbol = %pos.symbol, reason = %close_reason))]
    async fn close_and_journal(&self, mut pos: Position, exit_price: f64, close_reason: CloseReason) {
        let mut pnl_usd = pos.unrealised_pnl_usd(exit_price);
        if self.bot_version.is_v4() {
            if let Some(v4) = self.config.v4.as_ref() {
                pnl_usd -= pos.position_size_usd * v4.fees.taker_pct / 100.0 * 2.0;
            }
        }
        let pnl_pct = if pos.margin_required.abs() > f64::EPSILON {
            pnl_usd / pos.margin_required * 100.0
        } else {
            0.0
        };
        let result = if pnl_usd > 0.0 { TradeResult::Win } else { TradeResult::Loss };
        let now = Utc::now();
        pos.closed_at = Some(now);
        pos.close_reason = Some(close_reason);
        pos.state = PositionState::Closed;

        if let Err(e) = self.persistence.close_active_position(&pos.id).await {
            warn!(position_id = %pos.id, error = %e, "failed to mark position closed in persistence");
        }

        let duration_secs = (now - pos.entry_time).num_seconds();
        let journal_row = TradeJournalRow {
            id: Uuid::new_v4().to_string(),
            position_id: pos.id.clone(),
            bot_version: pos.bot_version,
            symbol: pos.symbol.clone(),
            mode: pos.mode,
            direction: pos.direction,
            setup_type: pos.setup_type.clone(),
            entry_price: pos.entry_price,
            exit_price,
            pnl_usd,
            pnl_pct,
            result: result.to_string(),
            close_reason,
            duration_secs,
            entry_time: pos.entry_time,
            closed_at: now,
        };
        if let Err(e) = self.persistence.insert_trade_journal(&journal_row).await {
            warn!(position_id = %pos.id, error = %e, "failed to insert trade journal row");
        }

        if let Err(e) = self.update_legacy_learner(&pos, pnl_usd).await {
            warn!(error = %e, "failed to update legacy setup performance tracker");
        }

        if self.bot_version.is_v4() {
            if let Some(learner) = &self.learner {
                let gross_pnl = pos.unrealised_pnl_usd(exit_price);
                let hour_utc = now.format("%H").to_string().parse::<u32>().unwrap_or(0);
                let day_of_week = now.format("%u").to_string().parse::<u32>().unwrap_or(1);
                let regime = pos.regime_snapshot.as_ref().map(|r| r.regime).unwrap_or(Regime::Ranging);
                let final_score = pos.scores_snapshot.as_ref().map(|s| s.final_score).unwrap_or(0.0);
                let mtf = pos.scores_snapshot.as_ref().map(|s| s.mtf_confluence).unwrap_or(0.0);
                let ctx = TradeContext {
                    id: Uuid::new_v4().to_string(),
                    bot_version: pos.bot_version,
                    symbol: pos.symbol.clone(),
                    mode: pos.mode,
                    setup_type: pos.setup_type.clone(),
                    direction: pos.direction,
                    regime,
                    score_range: score_range(final_score).to_string(),
                    mtf_confluence_bucket: mtf_bucket(mtf).to_string(),
                    hour_utc,
                    day_of_week,
                    pnl: gross_pnl,
                    pnl_net: pnl_usd,
                    max_profit_usd: pos.max_profit_usd,
                    max_drawdown_usd: pos.max_drawdown_usd,
                    duration_secs,
                    created_at: now,
                };
                if let Err(e) = learner.record_trade_context(&ctx).await {
                    warn!(error = %e, "failed to record trade context with adaptive learner");
                }
            }
        }

        let _ = self.close_tx.send(ClosedPositionEvent {
            position_id: pos.id.clone(),
            symbol: pos.symbol.clone(),
            pnl_usd,
        });

        info!(position_id = %pos.id, symbol = %pos.symbol, pnl_usd, reason = %close_reason, "position closed");
    }

    async fn update_legacy_learner(&self, pos: &Position, pnl_usd: f64) -> Result<()> {
        let rows = self.persistence.load_setup_performance(&pos.symbol, pos.mode).await?;
        let mut row = rows
            .into_iter()
            .find(|r| r.setup_type == pos.setup_type)
            .unwrap_or_else(|| SetupPerformance {
                setup_type: pos.setup_type.clone(),
                symbol: pos.symbol.clone(),
                mode: pos.mode,
                wins: 0,
                losses: 0,
                total_pnl: 0.0,
                disabled: false,
            });
        if pnl_usd > 0.0 {
            row.wins += 1;
        } else {
            row.losses += 1;
        }
        row.total_pnl += pnl_usd;
        self.persistence.upsert_setup_performance(&row).await
    }

    // -------------------------------------------------------------------
    // Backup reconciliation + V3 dynamic SL widening
    // -------------------------------------------------------------------

    pub async fn run_backup_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(BACKUP_CHECK_INTERVAL);
        loop {
            interval.tick().await;
            if !self.running.load(Ordering::Relaxed) {
                break;
            }
            self.backup_check().await;
        }
    }

    async fn backup_check(&self) {
        match self.persistence.load_active_positions(self.bot_version).await {
            Ok(rows) => {
                let mut positions = self.positions.lock();
                for row in rows {
                    positions.entry(row.id.clone()).or_insert(row);
                }
            }
            Err(e) => warn!(error = %e, "backup_check: failed to reload active positions"),
        }

        if matches!(self.bot_version, BotVersion::V3) {
            self.widen_stops_for_volatility().await;
        }
    }

    async fn widen_stops_for_volatility(&self) {
        let targets: Vec<(String, Symbol)> = self
            .positions
            .lock()
            .values()
            .filter(|p| p.state != PositionState::Closed)
            .map(|p| (p.id.clone(), p.symbol.clone()))
            .collect();

        for (id, symbol) in targets {
            let candles = match self.market_client.fetch_ohlcv(&symbol, "5m", 50).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "dynamic SL widening: OHLCV fetch failed");
                    continue;
                }
            };
            let Some(current_atr) = calculate_atr(&candles, 14) else { continue };

            let mut positions = self.positions.lock();
            let Some(pos) = positions.get_mut(&id) else { continue };
            if pos.entry_atr <= f64::EPSILON {
                continue;
            }
            let ratio = current_atr / pos.entry_atr;
            if ratio <= DYNAMIC_SL_WIDEN_RATIO {
                continue;
            }
            let original_distance = (pos.original_sl - pos.entry_price).abs();
            let widened = match pos.direction {
                Direction::Long => pos.entry_price - original_distance * ratio.min(DYNAMIC_SL_WIDEN_CAP),
                Direction::Short => pos.entry_price + original_distance * ratio.min(DYNAMIC_SL_WIDEN_CAP),
                Direction::None => pos.stop_loss,
            };
            pos.stop_loss = match pos.direction {
                Direction::Long => pos.stop_loss.min(widened),
                Direction::Short => pos.stop_loss.max(widened),
                Direction::None => pos.stop_loss,
            };
        }
    }

    // -------------------------------------------------------------------
    // WebSocket worker lifecycle
    // -------------------------------------------------------------------

    /// Spawn the symbol's deal-stream worker if it isn't already running.
    /// Two sub-tasks run concurrently: the reconnecting WS connection that
    /// feeds the shared `DealStreamProcessor`, and a short-interval poller
    /// that turns its `last_price()` into `tick()` calls (the processor
    /// exposes only a last-value getter, not a push callback).
    fn ensure_ws_worker(self: &Arc<Self>, symbol: Symbol) {
        let mut tasks = self.ws_tasks.lock();
        if tasks.contains_key(&symbol) {
            return;
        }
        let processor = self.market_client.deal_processor(&symbol);
        let monitor = Arc::clone(self);
        let task_symbol = symbol.clone();
        let handle = tokio::spawn(async move {
            let ws_future = monitor.clone().run_deal_stream_loop(task_symbol.clone(), Arc::clone(&processor));
            let tick_future = monitor.clone().run_tick_poll_loop(task_symbol.clone(), processor);
            tokio::join!(ws_future, tick_future);
            monitor.ws_tasks.lock().remove(&task_symbol);
            info!(symbol = %task_symbol, "deal stream worker terminated, no open positions remain");
        });
        tasks.insert(symbol, handle);
    }

    async fn run_deal_stream_loop(self: Arc<Self>, symbol: Symbol, processor: Arc<DealStreamProcessor>) {
        loop {
            if !self.has_open_position(&symbol) {
                break;
            }
            let url = format!("{}/{}", self.ws_base_url, symbol.to_lowercase());
            if let Err(e) = run_deal_stream(&url, &symbol, &processor).await {
                warn!(symbol = %symbol, error = %e, "deal stream error, reconnecting in 3s");
            }
            if !self.has_open_position(&symbol) {
                break;
            }
            tokio::time::sleep(WS_RECONNECT_DELAY).await;
        }
    }

    async fn run_tick_poll_loop(self: Arc<Self>, symbol: Symbol, processor: Arc<DealStreamProcessor>) {
        let mut last_seen = 0.0_f64;
        let mut interval = tokio::time::interval(TICK_POLL_INTERVAL);
        loop {
            interval.tick().await;
            if !self.has_open_position(&symbol) {
                break;
            }
            let price = processor.last_price();
            if price > 0.0 && (price - last_seen).abs() > f64::EPSILON {
                last_seen = price;
                self.tick(&symbol, price).await;
            }
        }
    }

    /// Stop the backup loop and abort every in-flight WS worker (spec §5
    /// cancellation: "running=false flag").
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Relaxed);
        for (_, handle) in self.ws_tasks.lock().drain() {
            handle.abort();
        }
    }
}

fn tp_hit(pos: &Position, price: f64, tp: f64) -> bool {
    match pos.direction {
        Direction::Long => price >= tp,
        Direction::Short => price <= tp,
        Direction::None => false,
    }
}

fn sl_hit(pos: &Position, price: f64) -> bool {
    match pos.direction {
        Direction::Long => price <= pos.stop_loss,
        Direction::Short => price >= pos.stop_loss,
        Direction::None => false,
    }
}

/// Move the stop loss toward `candidate` only if it's an improvement in the
/// profitable direction — never loosen an already-favorable stop.
fn raise_stop_monotonic(pos: &mut Position, candidate: f64) {
    pos.stop_loss = match pos.direction {
        Direction::Long => pos.stop_loss.max(candidate),
        Direction::Short => pos.stop_loss.min(candidate),
        Direction::None => pos.stop_loss,
    };
}

/// `entry ± round_trip_fees / remaining_quantity` (V4) or plain `entry`
/// (V1-V3), on the side that covers the round-trip taker fee.
fn fee_adjusted_breakeven_with(pos: &Position, is_v4: bool, taker_pct: Option<f64>) -> f64 {
    if !is_v4 {
        return pos.entry_price;
    }
    let (Some(taker_pct), true) = (taker_pct, pos.remaining_quantity > f64::EPSILON) else {
        return pos.entry_price;
    };
    let fee_offset = (pos.position_size_usd * taker_pct / 100.0 * 2.0) / pos.remaining_quantity;
    match pos.direction {
        Direction::Long => pos.entry_price + fee_offset,
        Direction::Short => pos.entry_price - fee_offset,
        Direction::None => pos.entry_price,
    }
}

fn transition_tp1(pos: &mut Position, is_v4: bool, taker_pct: Option<f64>) {
    pos.remaining_quantity = (pos.original_quantity * (1.0 - pos.tp1_close_pct / 100.0)).max(0.0);
    pos.tp1_hit = true;
    pos.stop_loss = fee_adjusted_breakeven_with(pos, is_v4, taker_pct);
    pos.state = PositionState::Breakeven;
}

fn transition_tp2(pos: &mut Position) {
    pos.stop_loss = pos.tp1;
    pos.remaining_quantity = pos.original_quantity * (pos.tp3_close_pct / 100.0);
    pos.tp2_hit = true;
    pos.state = PositionState::Trailing;
}

fn transition_tp3_trailing(pos: &mut Position, tp3_close_pct: f64, trail_atr: f64) {
    pos.tp3_hit = true;
    pos.remaining_quantity = (pos.remaining_quantity * (1.0 - tp3_close_pct / 100.0)).max(0.0);
    let new_sl = match pos.direction {
        Direction::Long => pos.tp3 - pos.entry_atr * trail_atr,
        Direction::Short => pos.tp3 + pos.entry_atr * trail_atr,
        Direction::None => pos.stop_loss,
    };
    raise_stop_monotonic(pos, new_sl);
    pos.state = PositionState::TrailingTp;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BotConfig;
    use crate::persistence::memory::InMemoryPersistence;
    use crate::types::Mode;

    fn sample_position(bot_version: BotVersion) -> Position {
        Position {
            id: "pos-1".into(),
            signal_id: "sig-1".into(),
            bot_version,
            symbol: "BTCUSDT".into(),
            mode: Mode::Scalping,
            direction: Direction::Long,
            setup_type: "breakout".into(),
            entry_price: 100.0,
            stop_loss: 99.0,
            tp1: 101.0,
            tp2: 102.0,
            tp3: 103.5,
            tp1_close_pct: 40.0,
            tp2_close_pct: 35.0,
            tp3_close_pct: 25.0,
            original_quantity: 10.0,
            remaining_quantity: 10.0,
            position_size_usd: 1000.0,
            margin_required: 100.0,
            leverage: 10.0,
            sl_order_id: None,
            tp_order_ids: None,
            state: PositionState::Active,
            tp1_hit: false,
            tp2_hit: false,
            tp3_hit: false,
            sl_hit: false,
            entry_time: Utc::now(),
            closed_at: None,
            close_reason: None,
            max_profit_usd: 0.0,
            max_drawdown_usd: 0.0,
            original_sl: 99.0,
            entry_atr: 1.0,
            indicator_snapshot: None,
            regime_snapshot: None,
            scores_snapshot: None,
            candle_pattern: None,
            processing: false,
        }
    }

    fn monitor(bot_version: BotVersion) -> Arc<PositionMonitor> {
        let (monitor, _rx) = PositionMonitor::new(
            bot_version,
            Arc::new(InMemoryPersistence::new()),
            Arc::new(MarketDataClient::new()),
            Arc::new(BotConfig::default_for(bot_version)),
            None,
            "wss://example.invalid/stream".to_string(),
        );
        monitor
    }

    #[test]
    fn tp1_hit_moves_to_breakeven_and_reduces_remaining_quantity() {
        let mon = monitor(BotVersion::V1);
        mon.positions.lock().insert("pos-1".into(), sample_position(BotVersion::V1));
        let outcome = mon.apply_tick("pos-1", 101.0);
        assert!(outcome.is_none());
        let positions = mon.positions.lock();
        let pos = positions.get("pos-1").unwrap();
        assert_eq!(pos.state, PositionState::Breakeven);
        assert!(pos.tp1_hit);
        assert!((pos.remaining_quantity - 6.0).abs() < 1e-9);
        assert_eq!(pos.stop_loss, 100.0);
    }

    #[test]
    fn v4_breakeven_is_fee_adjusted_above_entry() {
        let mon = monitor(BotVersion::V4);
        mon.positions.lock().insert("pos-1".into(), sample_position(BotVersion::V4));
        mon.apply_tick("pos-1", 101.0);
        let positions = mon.positions.lock();
        let pos = positions.get("pos-1").unwrap();
        assert!(pos.stop_loss > 100.0);
    }

    #[test]
    fn sl_hit_before_tp1_closes() {
        let mon = monitor(BotVersion::V1);
        mon.positions.lock().insert("pos-1".into(), sample_position(BotVersion::V1));
        let outcome = mon.apply_tick("pos-1", 98.5);
        assert_eq!(outcome, Some((CloseReason::Sl, 98.5)));
    }

    #[test]
    fn tp2_hit_moves_sl_to_tp1_and_enters_trailing() {
        let mon = monitor(BotVersion::V1);
        let mut pos = sample_position(BotVersion::V1);
        pos.state = PositionState::Breakeven;
        pos.tp1_hit = true;
        pos.stop_loss = 100.0;
        pos.remaining_quantity = 6.0;
        mon.positions.lock().insert("pos-1".into(), pos);
        let outcome = mon.apply_tick("pos-1", 102.0);
        assert!(outcome.is_none());
        let positions = mon.positions.lock();
        let pos = positions.get("pos-1").unwrap();
        assert_eq!(pos.state, PositionState::Trailing);
        assert_eq!(pos.stop_loss, 101.0);
        assert!((pos.remaining_quantity - 2.5).abs() < 1e-9);
    }

    #[test]
    fn tp3_hit_closes_without_v4_trailing_tp() {
        let mon = monitor(BotVersion::V1);
        let mut pos = sample_position(BotVersion::V1);
        pos.state = PositionState::Trailing;
        pos.tp1_hit = true;
        pos.tp2_hit = true;
        pos.stop_loss = 101.0;
        pos.remaining_quantity = 2.5;
        mon.positions.lock().insert("pos-1".into(), pos);
        let outcome = mon.apply_tick("pos-1", 103.5);
        assert_eq!(outcome, Some((CloseReason::Tp3, 103.5)));
    }

    #[test]
    fn stale_timeout_closes_v1_below_five_cent_floor() {
        let mon = monitor(BotVersion::V1);
        let mut pos = sample_position(BotVersion::V1);
        pos.entry_time = Utc::now() - chrono::Duration::seconds(100_000);
        mon.positions.lock().insert("pos-1".into(), pos);
        let outcome = mon.apply_tick("pos-1", 100.001);
        assert_eq!(outcome, Some((CloseReason::StaleTimeout, 100.001)));
    }

    #[test]
    fn v3_v4_hard_max_loss_cap_closes_before_sl() {
        let mon = monitor(BotVersion::V4);
        let mut pos = sample_position(BotVersion::V4);
        pos.margin_required = 100_000.0; // keep pnl_pct math irrelevant here
        pos.stop_loss = 0.0; // never let the ordinary SL fire first
        mon.positions.lock().insert("pos-1".into(), pos);
        // 10 qty * $3/unit drop = $30 loss, default V4 scalping max_loss_usd is $25
        let outcome = mon.apply_tick("pos-1", 97.0);
        assert_eq!(outcome, Some((CloseReason::Sl, 97.0)));
    }

    #[test]
    fn progress_pct_is_zero_at_entry_and_one_at_tp1() {
        let mon = monitor(BotVersion::V1);
        let pos = sample_position(BotVersion::V1);
        assert_eq!(mon.progress_pct(&pos, 100.0), 0.0);
        assert!((mon.progress_pct(&pos, 101.0) - 1.0).abs() < 1e-9);
    }
}
