// =============================================================================
// Bot instance — spec §9 "shared singletons -> per-bot owned objects"
// =============================================================================
//
// Wires one bot version's Scanner, Paper Trader, Position Monitor, Adaptive
// Learner (V4 only) and Regime Detector (V4 only) together and owns the
// `ClosedPositionEvent` channel between the Position Monitor and the Paper
// Trader. Everything else (the Market-Data Client, persistence) is passed in
// from `main.rs` as a shared dependency — spec §9 names the market-data
// client as the only truly process-wide object; persistence is likewise
// shared because all four bots write to the same backend, isolated only by
// the `bot_version` tag on every row (spec §5).
//
// Grounded on the teacher's `main.rs`, which built exactly this graph
// (client, state, strategy task, reconcile task) once per process; here the
// same construction happens four times, once per `BotVersion`.
// =============================================================================

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::adaptive_learner::AdaptiveLearner;
use crate::config::BotConfig;
use crate::market_data::client::MarketDataClient;
use crate::paper_trader::PaperTrader;
use crate::persistence::Persistence;
use crate::position_monitor::PositionMonitor;
use crate::regime::RegimeDetector;
use crate::scanner::{Scanner, ScannerStatus};
use crate::sentiment::SentimentProvider;
use crate::types::BotVersion;

/// One running instance of the engine for a single `BotVersion`. Holds the
/// Scanner and Position Monitor handles needed to drive and shut the bot
/// down; the Paper Trader and config live inside the Scanner/Position
/// Monitor already and aren't needed directly once wired.
pub struct BotInstance {
    bot_version: BotVersion,
    config: Arc<BotConfig>,
    scanner: Arc<Scanner>,
    position_monitor: Arc<PositionMonitor>,
    tasks: Vec<JoinHandle<()>>,
}

impl BotInstance {
    /// Build the per-bot object graph and spawn its two background loops
    /// (Scanner cycle, Position Monitor backup sweep) plus the closed-
    /// position relay task. Returns before either loop has necessarily run
    /// once; callers await `shutdown()` for a clean stop.
    #[instrument(skip_all, fields(bot_version = %config.bot_version))]
    pub fn spawn(
        config: BotConfig,
        market_client: Arc<MarketDataClient>,
        persistence: Arc<dyn Persistence>,
        ws_base_url: String,
    ) -> Self {
        let bot_version = config.bot_version;
        let config = Arc::new(config);

        let sentiment = Arc::new(SentimentProvider::new(bot_version));

        let learner = bot_version
            .is_v4()
            .then(|| Arc::new(AdaptiveLearner::new(bot_version, persistence.clone())));
        let regime_detector = bot_version.is_v4().then(RegimeDetector::new);

        let paper_trader = Arc::new(PaperTrader::new(
            bot_version,
            config.initial_balance,
            persistence.clone(),
        ));

        let (position_monitor, mut closed_rx) = PositionMonitor::new(
            bot_version,
            persistence.clone(),
            market_client.clone(),
            config.clone(),
            learner.clone(),
            ws_base_url,
        );

        let scanner = Scanner::new(
            bot_version,
            config.clone(),
            market_client,
            sentiment,
            persistence,
            paper_trader.clone(),
            position_monitor.clone(),
            learner,
            regime_detector,
        );

        let mut tasks = Vec::with_capacity(3);

        // Relay closed positions into the Paper Trader's margin-release and
        // setup-performance bookkeeping (spec §4.8). Errors are logged and
        // swallowed per §7: a single bad close must not kill the relay for
        // every other position.
        let relay_trader = paper_trader.clone();
        let relay_config = config.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(event) = closed_rx.recv().await {
                if let Err(e) = relay_trader
                    .on_position_closed(&event.position_id, &event.symbol, event.pnl_usd, &relay_config)
                    .await
                {
                    warn!(position_id = %event.position_id, error = %e, "failed to apply closed position to paper trader");
                }
            }
        }));

        tasks.push(tokio::spawn(position_monitor.clone().run_backup_loop()));
        tasks.push(tokio::spawn(scanner.clone().run()));

        info!(bot_version = %bot_version, "bot instance spawned");

        Self {
            bot_version,
            config,
            scanner,
            position_monitor,
            tasks,
        }
    }

    pub fn bot_version(&self) -> BotVersion {
        self.bot_version
    }

    pub fn config(&self) -> &Arc<BotConfig> {
        &self.config
    }

    pub fn status(&self) -> ScannerStatus {
        self.scanner.status()
    }

    /// Stop both background loops and wait for their current iteration to
    /// finish. The closed-position relay task only returns once every
    /// `Arc<PositionMonitor>` clone is gone and its sender half drops, so
    /// `scanner`/`position_monitor` must be dropped here before awaiting
    /// `tasks`, not after.
    pub async fn shutdown(self) {
        self.scanner.shutdown();
        self.position_monitor.shutdown();
        let Self { scanner, position_monitor, tasks, .. } = self;
        drop(scanner);
        drop(position_monitor);
        for task in tasks {
            let _ = task.await;
        }
    }
}
