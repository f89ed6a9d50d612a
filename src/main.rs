// =============================================================================
// Aurora Futures Decision Engine — Main Entry Point
// =============================================================================
//
// Boots a fleet of independent bot instances, one per selected `BotVersion`,
// all sharing the single process-wide Market-Data Client and persistence
// backend (spec §5/§9). Paper trading only — there is no live order
// placement adapter in this core (spec §1), so there is no real-money state
// for a startup safety override to guard; see DESIGN.md Open Question 13.
// =============================================================================

mod absorption_detector;
mod adaptive_learner;
mod bot;
mod cluster;
mod config;
mod cusum_detector;
mod direction;
mod entry;
mod futures_intel;
mod htf_analysis;
mod indicators;
mod market_data;
mod paper_trader;
mod persistence;
mod position_monitor;
mod regime;
mod risk_calculator;
mod scanner;
mod sentiment;
mod signal_engine;
mod tradeability;
mod types;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::bot::BotInstance;
use crate::config::BotConfig;
use crate::market_data::client::MarketDataClient;
use crate::persistence::memory::InMemoryPersistence;
use crate::persistence::sqlite::SqlitePersistence;
use crate::persistence::Persistence;
use crate::types::BotVersion;

const DEFAULT_DEAL_STREAM_WS_URL: &str = "wss://contract.example-exchange.com/ws";

/// Fleet-of-bots CLI (spec §9's four independently-configured bot variants).
#[derive(Parser, Debug)]
#[command(name = "aurora-engine", about = "Crypto-futures decision engine")]
struct Cli {
    /// Comma-separated bot versions to run, e.g. "v1,v2,v3,v4".
    #[arg(long, value_delimiter = ',', default_value = "v1,v2,v3,v4")]
    bot_versions: Vec<String>,

    /// Directory holding `v1.yaml` .. `v4.yaml` per-bot config files.
    #[arg(long, default_value = "config")]
    config_dir: PathBuf,

    /// `sqlite://path/to.db` persistence URL. Defaults to an in-memory
    /// backend (no database file, state is lost on restart) when unset.
    #[arg(long)]
    database_url: Option<String>,
}

fn parse_bot_version(s: &str) -> Option<BotVersion> {
    match s.trim().to_lowercase().as_str() {
        "v1" => Some(BotVersion::V1),
        "v2" => Some(BotVersion::V2),
        "v3" => Some(BotVersion::V3),
        "v4" => Some(BotVersion::V4),
        _ => None,
    }
}

fn config_file_name(bot_version: BotVersion) -> &'static str {
    match bot_version {
        BotVersion::V1 => "v1.yaml",
        BotVersion::V2 => "v2.yaml",
        BotVersion::V3 => "v3.yaml",
        BotVersion::V4 => "v4.yaml",
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Aurora Futures Decision Engine — Starting Up      ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let cli = Cli::parse();

    let bot_versions: Vec<BotVersion> = cli
        .bot_versions
        .iter()
        .filter_map(|s| {
            let parsed = parse_bot_version(s);
            if parsed.is_none() {
                warn!(value = %s, "ignoring unrecognised --bot-versions entry");
            }
            parsed
        })
        .collect();

    if bot_versions.is_empty() {
        anyhow::bail!("no valid bot versions selected (--bot-versions v1,v2,v3,v4)");
    }

    let ws_base_url = std::env::var("AURORA_DEAL_STREAM_WS_URL").unwrap_or_else(|_| {
        warn!(
            default = DEFAULT_DEAL_STREAM_WS_URL,
            "AURORA_DEAL_STREAM_WS_URL not set, using placeholder deal-stream endpoint"
        );
        DEFAULT_DEAL_STREAM_WS_URL.to_string()
    });

    let persistence: Arc<dyn Persistence> = match cli.database_url {
        Some(url) => {
            info!(url = %url, "connecting to sqlite persistence");
            Arc::new(SqlitePersistence::connect(&url).await?)
        }
        None => {
            warn!("no --database-url given, running with in-memory persistence (state is lost on restart)");
            Arc::new(InMemoryPersistence::new())
        }
    };

    let market_client = Arc::new(MarketDataClient::new());

    let mut instances = Vec::with_capacity(bot_versions.len());
    for bot_version in bot_versions {
        let config_path = cli.config_dir.join(config_file_name(bot_version));
        let config = BotConfig::load(&config_path, bot_version);

        info!(
            bot_version = %bot_version,
            trading_mode = %config.trading_mode,
            account_mode = %config.account_mode,
            path = ?config_path,
            "loaded bot config"
        );

        instances.push(BotInstance::spawn(
            config,
            market_client.clone(),
            persistence.clone(),
            ws_base_url.clone(),
        ));
    }

    info!(count = instances.len(), "all bot instances running, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping gracefully");

    for instance in instances {
        let bot_version = instance.bot_version();
        let config_path = cli.config_dir.join(config_file_name(bot_version));
        if let Err(e) = instance.config().save(&config_path) {
            error!(bot_version = %bot_version, error = %e, "failed to save bot config on shutdown");
        }
        instance.shutdown().await;
    }

    info!("Aurora Futures Decision Engine shut down complete.");
    Ok(())
}
