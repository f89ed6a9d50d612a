// =============================================================================
// Scanner — §4.7 per-bot tick loop
// =============================================================================
//
// A fixed-interval cooperative loop over (enabled symbol x enabled mode):
// fetch market-data snapshot, run the Signal Engine, dedupe/cooldown-gate the
// result, persist, hand accepted signals to the Paper Trader and on to the
// Position Monitor. Grounded on the teacher's `main.rs` strategy-loop shape
// (`tokio::time::interval`, per-symbol iteration, error-boundary logging
// around each symbol so one bad fetch doesn't stall the whole cycle).
//
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::adaptive_learner::AdaptiveLearner;
use crate::config::BotConfig;
use crate::market_data::client::MarketDataClient;
use crate::paper_trader::PaperTrader;
use crate::persistence::Persistence;
use crate::position_monitor::PositionMonitor;
use crate::regime::RegimeDetector;
use crate::sentiment::SentimentProvider;
use crate::signal_engine::{analyze_pair, AnalysisInputs};
use crate::tradeability::MISSING_ORDERBOOK_SPREAD_PCT;
use crate::types::{BotVersion, Direction, Mode, Signal, SignalOutcome, SignalStatus, Symbol, TradingMode};

/// Dedup guard: same direction + setup + entry price within this fraction of
/// the previous signal for a (symbol, mode) is treated as a repeat.
const DEDUPE_ENTRY_PRICE_TOLERANCE: f64 = 0.002;

#[derive(Debug, Clone)]
struct LastSignal {
    direction: Direction,
    setup_type: String,
    entry_price: f64,
    at: Instant,
}

/// Status snapshot exposed per spec §4.7 ("running flag, enabled pairs,
/// enabled modes, active signals count, cooldowns map").
#[derive(Debug, Clone)]
pub struct ScannerStatus {
    pub running: bool,
    pub enabled_pairs: Vec<Symbol>,
    pub enabled_modes: Vec<Mode>,
    pub active_signals: usize,
    pub cooldowns: HashMap<Symbol, Duration>,
}

pub struct Scanner {
    bot_version: BotVersion,
    config: Arc<BotConfig>,
    market_client: Arc<MarketDataClient>,
    sentiment: Arc<SentimentProvider>,
    persistence: Arc<dyn Persistence>,
    paper_trader: Arc<PaperTrader>,
    position_monitor: Arc<PositionMonitor>,
    learner: Option<Arc<AdaptiveLearner>>,
    regime_detector: Option<Arc<RegimeDetector>>,
    last_signals: Mutex<HashMap<(Symbol, Mode), LastSignal>>,
    running: std::sync::atomic::AtomicBool,
}

impl Scanner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bot_version: BotVersion,
        config: Arc<BotConfig>,
        market_client: Arc<MarketDataClient>,
        sentiment: Arc<SentimentProvider>,
        persistence: Arc<dyn Persistence>,
        paper_trader: Arc<PaperTrader>,
        position_monitor: Arc<PositionMonitor>,
        learner: Option<Arc<AdaptiveLearner>>,
        regime_detector: Option<Arc<RegimeDetector>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            bot_version,
            config,
            market_client,
            sentiment,
            persistence,
            paper_trader,
            position_monitor,
            learner,
            regime_detector,
            last_signals: Mutex::new(HashMap::new()),
            running: std::sync::atomic::AtomicBool::new(true),
        })
    }

    pub fn status(&self) -> ScannerStatus {
        let cooldowns: HashMap<Symbol, Duration> = self
            .last_signals
            .lock()
            .iter()
            .map(|((symbol, _), last)| (symbol.clone(), last.at.elapsed()))
            .collect();
        ScannerStatus {
            running: self.running.load(std::sync::atomic::Ordering::Relaxed),
            enabled_pairs: self.config.pairs.iter().filter(|p| p.enabled).map(|p| p.symbol.clone()).collect(),
            enabled_modes: self.config.scanner.modes.clone(),
            active_signals: self.position_monitor.open_position_count(),
            cooldowns,
        }
    }

    pub fn shutdown(&self) {
        self.running.store(false, std::sync::atomic::Ordering::Relaxed);
    }

    /// Run the fixed-interval cycle loop until `shutdown()` is called.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.scanner.interval_seconds));
        loop {
            interval.tick().await;
            if !self.running.load(std::sync::atomic::Ordering::Relaxed) {
                return;
            }
            self.run_cycle().await;
        }
    }

    #[instrument(skip(self), fields(bot_version = %self.bot_version))]
    async fn run_cycle(&self) {
        if !matches!(self.config.trading_mode, TradingMode::Live) {
            debug!(trading_mode = %self.config.trading_mode, "trading mode is not Live, skipping scan (Position Monitor keeps managing open trades)");
            return;
        }

        if let Some(learner) = &self.learner {
            if let Err(e) = learner.maybe_refresh().await {
                warn!(error = %e, "adaptive learner refresh failed, using stale cache");
            }
        }

        if !self.market_client.is_connected() {
            warn!("market-data client disconnected, skipping cycle");
            return;
        }

        let symbols: Vec<Symbol> = self.config.pairs.iter().filter(|p| p.enabled).map(|p| p.symbol.clone()).collect();
        let modes = self.config.scanner.modes.clone();

        for symbol in &symbols {
            for mode in &modes {
                if self.is_under_cooldown(symbol, *mode) {
                    continue;
                }
                if let Err(e) = self.scan_one(symbol, *mode).await {
                    warn!(symbol = %symbol, mode = %mode, error = %e, "scan cycle failed for symbol/mode");
                }
            }
            tokio::time::sleep(Duration::from_millis(self.config.scanner.inter_symbol_delay_ms)).await;
        }
    }

    fn is_under_cooldown(&self, symbol: &str, mode: Mode) -> bool {
        let window = Duration::from_secs(self.config.scanner.anti_flip_flop_secs);
        self.last_signals
            .lock()
            .get(&(symbol.to_string(), mode))
            .map(|last| last.at.elapsed() < window)
            .unwrap_or(false)
    }

    async fn scan_one(&self, symbol: &str, mode: Mode) -> anyhow::Result<()> {
        let mode_config = self.config.mode_config(mode);
        let analysis_interval = mode_config.timeframes_analysis.first().map(String::as_str).unwrap_or("5m");
        let filter_interval = mode_config.timeframes_filter.as_str();

        let candles_analysis = self.market_client.fetch_ohlcv(symbol, analysis_interval, 300).await?;
        let candles_filter = self.market_client.fetch_ohlcv(symbol, filter_interval, 300).await?;
        if candles_analysis.len() < 20 || candles_filter.len() < 20 {
            debug!(symbol, mode = %mode, "insufficient candle history, skipping");
            return Ok(());
        }

        let current_price = self
            .market_client
            .ticker_price(symbol, analysis_interval)
            .unwrap_or_else(|| candles_analysis.last().map(|c| c.close).unwrap_or(0.0));

        let spread_pct = self.market_client.orderbook.spread_bps(symbol).map(|bps| bps / 100.0).unwrap_or(MISSING_ORDERBOOK_SPREAD_PCT);
        let depth_usd = self.market_client.orderbook.depth_usd(symbol);
        let funding_rate_pct = self.market_client.fetch_funding(symbol).await.map(|f| f.rate_pct).unwrap_or(0.0);
        let oi_change_pct = self.market_client.fetch_open_interest(symbol).await.map(|oi| oi.oi_change_1h_pct).unwrap_or(0.0);
        let order_flow_ratio = self.bot_version.is_v4().then(|| self.market_client.deal_processor(symbol).buy_volume_ratio());
        let sentiment = self.sentiment.snapshot(symbol).await;

        // V4 only: HTF EMA-alignment gate (§11) needs 15M/1H closes; CVD
        // direction feeds the absorption detector's confirmation check.
        let candles_15m = if self.bot_version.is_v4() {
            self.market_client.fetch_ohlcv(symbol, "15m", 100).await.ok()
        } else {
            None
        };
        let candles_1h = if self.bot_version.is_v4() {
            self.market_client.fetch_ohlcv(symbol, "1h", 100).await.ok()
        } else {
            None
        };
        let closes_15m: Option<Vec<f64>> = candles_15m.map(|cs| cs.iter().map(|c| c.close).collect());
        let closes_1h: Option<Vec<f64>> = candles_1h.map(|cs| cs.iter().map(|c| c.close).collect());
        let cvd_direction = self.bot_version.is_v4().then(|| self.market_client.deal_processor(symbol).cvd());

        let disabled_setups = self.disabled_setups(symbol, mode).await;

        let inputs = AnalysisInputs {
            symbol,
            mode,
            bot_version: self.bot_version,
            candles_analysis: &candles_analysis,
            candles_filter: &candles_filter,
            current_price,
            spread_pct: Some(spread_pct),
            depth_usd,
            funding_rate_pct,
            oi_change_pct,
            order_flow_ratio,
            closes_15m: closes_15m.as_deref(),
            closes_1h: closes_1h.as_deref(),
            cvd_direction,
            sentiment: &sentiment,
            disabled_setups: &disabled_setups,
            learner: self.learner.as_deref(),
            regime_detector: self.regime_detector.as_deref(),
        };

        match analyze_pair(&inputs, &self.config) {
            SignalOutcome::NoTrade(reason) => {
                debug!(symbol, mode = %mode, reason = reason.reason, score = reason.tradeability_score, "no_trade");
                Ok(())
            }
            SignalOutcome::Signal(signal) => self.handle_signal(*signal, symbol, mode, spread_pct).await,
        }
    }

    async fn handle_signal(&self, signal: Signal, symbol: &str, mode: Mode, spread_pct: f64) -> anyhow::Result<()> {
        if self.is_duplicate(symbol, mode, &signal) {
            debug!(symbol, mode = %mode, "duplicate signal discarded");
            return Ok(());
        }
        if self.position_monitor.has_open_position(symbol) {
            debug!(symbol, mode = %mode, "position already open for symbol, signal rejected");
            return Ok(());
        }
        if self.is_under_cooldown(symbol, mode) {
            debug!(symbol, mode = %mode, "anti-flip-flop window active, signal rejected");
            return Ok(());
        }

        self.persistence.insert_signal(&signal).await?;

        match self.paper_trader.admit(&signal, &self.config, spread_pct) {
            Ok(execution) => {
                let position_id = self.position_monitor.register_trade(&execution).await?;
                self.paper_trader.record_open(position_id.clone(), &execution).await?;
                self.persistence.update_signal_status(&signal.id, SignalStatus::Executed).await?;
                self.record_last_signal(symbol, mode, &signal);
                info!(symbol, mode = %mode, position_id, score = signal.score, "signal executed");
            }
            Err(reason) => {
                debug!(symbol, mode = %mode, reason, "paper trader rejected signal");
                self.persistence.update_signal_status(&signal.id, SignalStatus::Skipped).await?;
            }
        }

        Ok(())
    }

    fn is_duplicate(&self, symbol: &str, mode: Mode, signal: &Signal) -> bool {
        let last_signals = self.last_signals.lock();
        let Some(last) = last_signals.get(&(symbol.to_string(), mode)) else {
            return false;
        };
        if last.direction != signal.direction || last.setup_type != signal.setup_type {
            return false;
        }
        if last.entry_price.abs() < f64::EPSILON {
            return false;
        }
        ((signal.entry_price - last.entry_price) / last.entry_price).abs() < DEDUPE_ENTRY_PRICE_TOLERANCE
    }

    fn record_last_signal(&self, symbol: &str, mode: Mode, signal: &Signal) {
        self.last_signals.lock().insert(
            (symbol.to_string(), mode),
            LastSignal {
                direction: signal.direction,
                setup_type: signal.setup_type.clone(),
                entry_price: signal.entry_price,
                at: Instant::now(),
            },
        );
    }

    /// Legacy trade_learner: setups the persistence layer has flagged
    /// `disabled` for this (symbol, mode) are stripped from entry detection.
    async fn disabled_setups(&self, symbol: &str, mode: Mode) -> std::collections::HashSet<String> {
        match self.persistence.load_setup_performance(symbol, mode).await {
            Ok(rows) => rows.into_iter().filter(|r| r.disabled).map(|r| r.setup_type).collect(),
            Err(e) => {
                warn!(symbol, mode = %mode, error = %e, "failed to load setup performance, no setups disabled this cycle");
                std::collections::HashSet::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::memory::InMemoryPersistence;
    use crate::types::{BotVersion, Direction};

    fn sample_signal(entry_price: f64) -> Signal {
        Signal {
            id: "sig-1".to_string(),
            symbol: "BTCUSDT".to_string(),
            mode: Mode::Scalping,
            bot_version: BotVersion::V1,
            direction: Direction::Long,
            score: 80.0,
            entry_price,
            stop_loss: entry_price - 10.0,
            tp1: entry_price + 10.0,
            tp2: entry_price + 20.0,
            tp3: entry_price + 30.0,
            setup_type: "breakout".to_string(),
            leverage: 5.0,
            rr_ratio: 1.0,
            tp1_close_pct: 40.0,
            tp2_close_pct: 35.0,
            tp3_close_pct: 25.0,
            reasons: vec![],
            tradeability_score: 0.9,
            direction_score: 80.0,
            setup_score: 60.0,
            sentiment_score: 50.0,
            status: SignalStatus::Active,
            created_at: "2026-01-01T00:00:00Z".to_string(),
            indicator_snapshot: None,
            regime_snapshot: None,
            scores_snapshot: None,
            candle_pattern: None,
            entry_atr: None,
        }
    }

    fn scanner() -> Arc<Scanner> {
        let config = Arc::new(BotConfig::default_for(BotVersion::V1));
        let persistence: Arc<dyn Persistence> = Arc::new(InMemoryPersistence::new());
        let market_client = Arc::new(MarketDataClient::new());
        let paper_trader = Arc::new(PaperTrader::new(BotVersion::V1, config.initial_balance, persistence.clone()));
        let (monitor, _rx) = PositionMonitor::new(
            BotVersion::V1,
            persistence.clone(),
            market_client.clone(),
            config.clone(),
            None,
            "wss://example.invalid".to_string(),
        );
        Scanner::new(
            BotVersion::V1,
            config,
            market_client,
            Arc::new(SentimentProvider::new(BotVersion::V1)),
            persistence,
            paper_trader,
            monitor,
            None,
            None,
        )
    }

    #[test]
    fn duplicate_signal_within_price_tolerance_is_rejected() {
        let scanner = scanner();
        let first = sample_signal(100.0);
        scanner.record_last_signal("BTCUSDT", Mode::Scalping, &first);
        let repeat = sample_signal(100.1);
        assert!(scanner.is_duplicate("BTCUSDT", Mode::Scalping, &repeat));
    }

    #[test]
    fn different_setup_is_not_a_duplicate() {
        let scanner = scanner();
        let first = sample_signal(100.0);
        scanner.record_last_signal("BTCUSDT", Mode::Scalping, &first);
        let mut other = sample_signal(100.05);
        other.setup_type = "retest".to_string();
        assert!(!scanner.is_duplicate("BTCUSDT", Mode::Scalping, &other));
    }

    #[test]
    fn cooldown_blocks_until_window_elapses() {
        let scanner = scanner();
        let signal = sample_signal(100.0);
        scanner.record_last_signal("BTCUSDT", Mode::Scalping, &signal);
        assert!(scanner.is_under_cooldown("BTCUSDT", Mode::Scalping));
        assert!(!scanner.is_under_cooldown("ETHUSDT", Mode::Scalping));
    }

    #[test]
    fn status_reports_enabled_pairs_and_modes() {
        let scanner = scanner();
        let status = scanner.status();
        assert!(status.running);
        assert_eq!(status.enabled_pairs.len(), 2);
        assert_eq!(status.enabled_modes.len(), 2);
    }
}
