// =============================================================================
// Persistence contract — spec §6
// =============================================================================
//
// The core reads and writes through this trait; the backend schema itself is
// explicitly out of scope (spec §1). Grounded on the `sqlx::AnyPool`
// repository pattern (the only real persistence stack in the example pack);
// the teacher itself has no persistence layer.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::types::{
    BotVersion, LearningWeight, PaperPortfolio, Position, SetupPerformance, Signal, SignalStatus,
    TradeContext, TradeJournalRow,
};

#[async_trait]
pub trait Persistence: Send + Sync {
    async fn insert_signal(&self, signal: &Signal) -> Result<()>;
    async fn update_signal_status(&self, signal_id: &str, status: SignalStatus) -> Result<()>;

    async fn insert_trade_journal(&self, row: &TradeJournalRow) -> Result<()>;

    async fn upsert_active_position(&self, position: &Position) -> Result<()>;
    async fn close_active_position(&self, position_id: &str) -> Result<()>;
    async fn load_active_positions(&self, bot_version: BotVersion) -> Result<Vec<Position>>;

    async fn upsert_paper_portfolio(&self, portfolio: &PaperPortfolio) -> Result<()>;
    async fn load_paper_portfolio(&self, bot_version: BotVersion) -> Result<Option<PaperPortfolio>>;
    async fn reserve_paper_margin(&self, bot_version: BotVersion, delta: f64) -> Result<()>;
    async fn update_paper_balance(&self, bot_version: BotVersion, delta: f64) -> Result<()>;

    async fn upsert_setup_performance(&self, row: &SetupPerformance) -> Result<()>;
    async fn load_setup_performance(
        &self,
        symbol: &str,
        mode: crate::types::Mode,
    ) -> Result<Vec<SetupPerformance>>;

    async fn insert_trade_context(&self, ctx: &TradeContext) -> Result<()>;
    async fn trade_contexts_since(
        &self,
        bot_version: BotVersion,
        since_days: i64,
        limit: usize,
    ) -> Result<Vec<TradeContext>>;

    async fn upsert_learning_weight(&self, weight: &LearningWeight) -> Result<()>;
    async fn load_learning_weights(&self, bot_version: BotVersion) -> Result<Vec<LearningWeight>>;
}

/// In-process, lock-guarded implementation used by unit tests and by any
/// bot instance run without a database configured. Mirrors the shape of
/// the teacher's in-memory `AppState` maps, generalized per spec's "shared
/// singletons -> per-bot owned objects" note by keying every table on
/// `bot_version`.
pub mod memory {
    use super::*;
    use parking_lot::RwLock;
    use std::collections::HashMap;

    #[derive(Default)]
    pub struct InMemoryPersistence {
        signals: RwLock<HashMap<String, Signal>>,
        journal: RwLock<Vec<TradeJournalRow>>,
        positions: RwLock<HashMap<String, Position>>,
        portfolios: RwLock<HashMap<BotVersion, PaperPortfolio>>,
        setup_perf: RwLock<HashMap<(String, String, String), SetupPerformance>>,
        trade_contexts: RwLock<Vec<TradeContext>>,
        learning_weights: RwLock<HashMap<(String, String, BotVersion), LearningWeight>>,
    }

    impl InMemoryPersistence {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl Persistence for InMemoryPersistence {
        async fn insert_signal(&self, signal: &Signal) -> Result<()> {
            self.signals.write().insert(signal.id.clone(), signal.clone());
            Ok(())
        }

        async fn update_signal_status(&self, signal_id: &str, status: SignalStatus) -> Result<()> {
            if let Some(s) = self.signals.write().get_mut(signal_id) {
                s.status = status;
            }
            Ok(())
        }

        async fn insert_trade_journal(&self, row: &TradeJournalRow) -> Result<()> {
            self.journal.write().push(row.clone());
            Ok(())
        }

        async fn upsert_active_position(&self, position: &Position) -> Result<()> {
            self.positions
                .write()
                .insert(position.id.clone(), position.clone());
            Ok(())
        }

        async fn close_active_position(&self, position_id: &str) -> Result<()> {
            self.positions.write().remove(position_id);
            Ok(())
        }

        async fn load_active_positions(&self, bot_version: BotVersion) -> Result<Vec<Position>> {
            Ok(self
                .positions
                .read()
                .values()
                .filter(|p| p.bot_version == bot_version)
                .cloned()
                .collect())
        }

        async fn upsert_paper_portfolio(&self, portfolio: &PaperPortfolio) -> Result<()> {
            self.portfolios
                .write()
                .insert(portfolio.bot_version, portfolio.clone());
            Ok(())
        }

        async fn load_paper_portfolio(
            &self,
            bot_version: BotVersion,
        ) -> Result<Option<PaperPortfolio>> {
            Ok(self.portfolios.read().get(&bot_version).cloned())
        }

        async fn reserve_paper_margin(&self, bot_version: BotVersion, delta: f64) -> Result<()> {
            if let Some(p) = self.portfolios.write().get_mut(&bot_version) {
                p.reserved_margin = (p.reserved_margin + delta).max(0.0);
            }
            Ok(())
        }

        async fn update_paper_balance(&self, bot_version: BotVersion, delta: f64) -> Result<()> {
            if let Some(p) = self.portfolios.write().get_mut(&bot_version) {
                p.current_balance += delta;
            }
            Ok(())
        }

        async fn upsert_setup_performance(&self, row: &SetupPerformance) -> Result<()> {
            let key = (row.setup_type.clone(), row.symbol.clone(), row.mode.to_string());
            self.setup_perf.write().insert(key, row.clone());
            Ok(())
        }

        async fn load_setup_performance(
            &self,
            symbol: &str,
            mode: crate::types::Mode,
        ) -> Result<Vec<SetupPerformance>> {
            Ok(self
                .setup_perf
                .read()
                .values()
                .filter(|r| r.symbol == symbol && r.mode == mode)
                .cloned()
                .collect())
        }

        async fn insert_trade_context(&self, ctx: &TradeContext) -> Result<()> {
            self.trade_contexts.write().push(ctx.clone());
            Ok(())
        }

        async fn trade_contexts_since(
            &self,
            bot_version: BotVersion,
            since_days: i64,
            limit: usize,
        ) -> Result<Vec<TradeContext>> {
            let cutoff = chrono::Utc::now() - chrono::Duration::days(since_days);
            let mut rows: Vec<TradeContext> = self
                .trade_contexts
                .read()
                .iter()
                .filter(|c| c.bot_version == bot_version && c.created_at >= cutoff)
                .cloned()
                .collect();
            rows.sort_by_key(|c| std::cmp::Reverse(c.created_at));
            rows.truncate(limit);
            Ok(rows)
        }

        async fn upsert_learning_weight(&self, weight: &LearningWeight) -> Result<()> {
            let key = (
                weight.dimension.to_string(),
                weight.dimension_value.clone(),
                weight.bot_version,
            );
            self.learning_weights.write().insert(key, weight.clone());
            Ok(())
        }

        async fn load_learning_weights(&self, bot_version: BotVersion) -> Result<Vec<LearningWeight>> {
            Ok(self
                .learning_weights
                .read()
                .values()
                .filter(|w| w.bot_version == bot_version)
                .cloned()
                .collect())
        }
    }
}

/// `sqlx`-backed implementation. Schema lives outside this crate's scope
/// (spec §1); this impl assumes tables matching the contract's field names
/// already exist and focuses on the read/write contract itself.
pub mod sqlite {
    use super::*;
    use sqlx::SqlitePool;

    pub struct SqlitePersistence {
        pool: SqlitePool,
    }

    impl SqlitePersistence {
        pub async fn connect(url: &str) -> Result<Self> {
            let pool = SqlitePool::connect(url)
                .await
                .with_context(|| format!("connect to sqlite persistence at {url}"))?;
            Ok(Self { pool })
        }
    }

    #[async_trait]
    impl Persistence for SqlitePersistence {
        async fn insert_signal(&self, signal: &Signal) -> Result<()> {
            let payload = serde_json::to_string(signal).context("serialize signal")?;
            sqlx::query(
                "INSERT INTO signals (id, bot_version, symbol, status, payload) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&signal.id)
            .bind(signal.bot_version.to_string())
            .bind(&signal.symbol)
            .bind(format!("{:?}", signal.status))
            .bind(payload)
            .execute(&self.pool)
            .await
            .context("insert signal row")?;
            Ok(())
        }

        async fn update_signal_status(&self, signal_id: &str, status: SignalStatus) -> Result<()> {
            sqlx::query("UPDATE signals SET status = ? WHERE id = ?")
                .bind(format!("{status:?}"))
                .bind(signal_id)
                .execute(&self.pool)
                .await
                .context("update signal status")?;
            Ok(())
        }

        async fn insert_trade_journal(&self, row: &TradeJournalRow) -> Result<()> {
            let payload = serde_json::to_string(row).context("serialize trade journal row")?;
            sqlx::query("INSERT INTO trades_journal (id, bot_version, payload) VALUES (?, ?, ?)")
                .bind(&row.id)
                .bind(row.bot_version.to_string())
                .bind(payload)
                .execute(&self.pool)
                .await
                .context("insert trade journal row")?;
            Ok(())
        }

        async fn upsert_active_position(&self, position: &Position) -> Result<()> {
            let payload = serde_json::to_string(position).context("serialize position")?;
            sqlx::query(
                "INSERT INTO active_positions (id, bot_version, state, payload) VALUES (?, ?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET state = excluded.state, payload = excluded.payload",
            )
            .bind(&position.id)
            .bind(position.bot_version.to_string())
            .bind(format!("{:?}", position.state))
            .bind(payload)
            .execute(&self.pool)
            .await
            .context("upsert active position")?;
            Ok(())
        }

        async fn close_active_position(&self, position_id: &str) -> Result<()> {
            sqlx::query("UPDATE active_positions SET state = 'closed' WHERE id = ?")
                .bind(position_id)
                .execute(&self.pool)
                .await
                .context("close active position")?;
            Ok(())
        }

        async fn load_active_positions(&self, bot_version: BotVersion) -> Result<Vec<Position>> {
            let rows: Vec<(String,)> = sqlx::query_as(
                "SELECT payload FROM active_positions WHERE bot_version = ? AND state != 'closed'",
            )
            .bind(bot_version.to_string())
            .fetch_all(&self.pool)
            .await
            .context("load active positions")?;
            rows.into_iter()
                .map(|(payload,)| serde_json::from_str(&payload).context("deserialize position"))
                .collect()
        }

        async fn upsert_paper_portfolio(&self, portfolio: &PaperPortfolio) -> Result<()> {
            let payload = serde_json::to_string(portfolio).context("serialize portfolio")?;
            sqlx::query(
                "INSERT INTO paper_portfolio (bot_version, payload) VALUES (?, ?)
                 ON CONFLICT(bot_version) DO UPDATE SET payload = excluded.payload",
            )
            .bind(portfolio.bot_version.to_string())
            .bind(payload)
            .execute(&self.pool)
            .await
            .context("upsert paper portfolio")?;
            Ok(())
        }

        async fn load_paper_portfolio(
            &self,
            bot_version: BotVersion,
        ) -> Result<Option<PaperPortfolio>> {
            let row: Option<(String,)> =
                sqlx::query_as("SELECT payload FROM paper_portfolio WHERE bot_version = ?")
                    .bind(bot_version.to_string())
                    .fetch_optional(&self.pool)
                    .await
                    .context("load paper portfolio")?;
            row.map(|(payload,)| serde_json::from_str(&payload).context("deserialize portfolio"))
                .transpose()
        }

        async fn reserve_paper_margin(&self, bot_version: BotVersion, delta: f64) -> Result<()> {
            // Atomic delta at the row level — spec §6 "atomic deltas via
            // reserve_paper_margin".
            sqlx::query(
                "UPDATE paper_portfolio SET payload = json_set(payload, '$.reserved_margin',
                 MAX(0, json_extract(payload, '$.reserved_margin') + ?)) WHERE bot_version = ?",
            )
            .bind(delta)
            .bind(bot_version.to_string())
            .execute(&self.pool)
            .await
            .context("reserve paper margin")?;
            Ok(())
        }

        async fn update_paper_balance(&self, bot_version: BotVersion, delta: f64) -> Result<()> {
            sqlx::query(
                "UPDATE paper_portfolio SET payload = json_set(payload, '$.current_balance',
                 json_extract(payload, '$.current_balance') + ?) WHERE bot_version = ?",
            )
            .bind(delta)
            .bind(bot_version.to_string())
            .execute(&self.pool)
            .await
            .context("update paper balance")?;
            Ok(())
        }

        async fn upsert_setup_performance(&self, row: &SetupPerformance) -> Result<()> {
            let payload = serde_json::to_string(row).context("serialize setup performance")?;
            sqlx::query(
                "INSERT INTO setup_performance (setup_type, symbol, mode, payload) VALUES (?, ?, ?, ?)
                 ON CONFLICT(setup_type, symbol, mode) DO UPDATE SET payload = excluded.payload",
            )
            .bind(&row.setup_type)
            .bind(&row.symbol)
            .bind(row.mode.to_string())
            .bind(payload)
            .execute(&self.pool)
            .await
            .context("upsert setup performance")?;
            Ok(())
        }

        async fn load_setup_performance(
            &self,
            symbol: &str,
            mode: crate::types::Mode,
        ) -> Result<Vec<SetupPerformance>> {
            let rows: Vec<(String,)> =
                sqlx::query_as("SELECT payload FROM setup_performance WHERE symbol = ? AND mode = ?")
                    .bind(symbol)
                    .bind(mode.to_string())
                    .fetch_all(&self.pool)
                    .await
                    .context("load setup performance")?;
            rows.into_iter()
                .map(|(payload,)| serde_json::from_str(&payload).context("deserialize setup perf"))
                .collect()
        }

        async fn insert_trade_context(&self, ctx: &TradeContext) -> Result<()> {
            let payload = serde_json::to_string(ctx).context("serialize trade context")?;
            sqlx::query(
                "INSERT INTO trade_context (id, bot_version, created_at, payload) VALUES (?, ?, ?, ?)",
            )
            .bind(&ctx.id)
            .bind(ctx.bot_version.to_string())
            .bind(ctx.created_at.to_rfc3339())
            .bind(payload)
            .execute(&self.pool)
            .await
            .context("insert trade context")?;
            Ok(())
        }

        async fn trade_contexts_since(
            &self,
            bot_version: BotVersion,
            since_days: i64,
            limit: usize,
        ) -> Result<Vec<TradeContext>> {
            let cutoff = (chrono::Utc::now() - chrono::Duration::days(since_days)).to_rfc3339();
            let rows: Vec<(String,)> = sqlx::query_as(
                "SELECT payload FROM trade_context WHERE bot_version = ? AND created_at >= ?
                 ORDER BY created_at DESC LIMIT ?",
            )
            .bind(bot_version.to_string())
            .bind(cutoff)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .context("load trade contexts")?;
            rows.into_iter()
                .map(|(payload,)| serde_json::from_str(&payload).context("deserialize trade context"))
                .collect()
        }

        async fn upsert_learning_weight(&self, weight: &LearningWeight) -> Result<()> {
            let payload = serde_json::to_string(weight).context("serialize learning weight")?;
            sqlx::query(
                "INSERT INTO learning_weights (dimension, dimension_value, bot_version, payload)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT(dimension, dimension_value, bot_version)
                 DO UPDATE SET payload = excluded.payload",
            )
            .bind(weight.dimension.to_string())
            .bind(&weight.dimension_value)
            .bind(weight.bot_version.to_string())
            .bind(payload)
            .execute(&self.pool)
            .await
            .context("upsert learning weight")?;
            Ok(())
        }

        async fn load_learning_weights(&self, bot_version: BotVersion) -> Result<Vec<LearningWeight>> {
            let rows: Vec<(String,)> =
                sqlx::query_as("SELECT payload FROM learning_weights WHERE bot_version = ?")
                    .bind(bot_version.to_string())
                    .fetch_all(&self.pool)
                    .await
                    .context("load learning weights")?;
            rows.into_iter()
                .map(|(payload,)| serde_json::from_str(&payload).context("deserialize learning weight"))
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::InMemoryPersistence;
    use super::*;
    use crate::types::*;

    fn sample_portfolio() -> PaperPortfolio {
        PaperPortfolio::new(BotVersion::V1, 1000.0)
    }

    #[tokio::test]
    async fn reserve_margin_never_goes_negative() {
        let store = InMemoryPersistence::new();
        store.upsert_paper_portfolio(&sample_portfolio()).await.unwrap();
        store.reserve_paper_margin(BotVersion::V1, -500.0).await.unwrap();
        let p = store.load_paper_portfolio(BotVersion::V1).await.unwrap().unwrap();
        assert_eq!(p.reserved_margin, 0.0);
    }

    #[tokio::test]
    async fn trade_contexts_since_filters_by_window() {
        let store = InMemoryPersistence::new();
        let old = TradeContext {
            id: "old".into(),
            bot_version: BotVersion::V4,
            symbol: "BTCUSDT".into(),
            mode: Mode::Scalping,
            setup_type: "breakout".into(),
            direction: Direction::Long,
            regime: Regime::Trending,
            score_range: "70-79".into(),
            mtf_confluence_bucket: "positive".into(),
            hour_utc: 10,
            day_of_week: 2,
            pnl: 1.0,
            pnl_net: 0.8,
            max_profit_usd: 1.5,
            max_drawdown_usd: -0.2,
            duration_secs: 600,
            created_at: chrono::Utc::now() - chrono::Duration::days(40),
        };
        let mut recent = old.clone();
        recent.id = "recent".into();
        recent.created_at = chrono::Utc::now();
        store.insert_trade_context(&old).await.unwrap();
        store.insert_trade_context(&recent).await.unwrap();

        let rows = store.trade_contexts_since(BotVersion::V4, 30, 2000).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "recent");
    }
}
