// =============================================================================
// Adaptive Learner — spec §4.10 (V4 only)
// =============================================================================
//
// Tracks 8 dimensions of historical trade performance and folds a bounded
// weight modifier back into signal scoring. Shape grounded on the teacher's
// `risk.rs` rolling-counter/reset pattern (recompute-then-cache) and
// `app_state.rs`'s snapshot-struct convention — the teacher has nothing like
// a learner, so this module is new, built the way the teacher builds its own
// stateful trackers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::Mutex;
use tracing::{info, instrument};

use crate::persistence::Persistence;
use crate::types::{
    BotVersion, Direction, LearnerDimension, LearningWeight, Mode, Regime, TradeContext,
};

const CACHE_REFRESH_INTERVAL: Duration = Duration::from_secs(120);
const FULL_HISTORY_DAYS: i64 = 36_500;
const FULL_HISTORY_LIMIT: usize = 2000;
const MIN_SAMPLE_FOR_MODIFIER: u32 = 5;
const MIN_SAMPLE_FOR_STRONG_PENALTY: u32 = 8;

/// The dimension values a candidate signal maps onto, computed the same way
/// a closed trade's `TradeContext` is bucketed.
#[derive(Debug, Clone)]
pub struct SignalContext {
    pub setup_type: String,
    pub symbol: String,
    pub mode: Mode,
    pub regime: Regime,
    pub hour_utc: u32,
    pub final_score: f64,
    pub direction: Direction,
    pub mtf_confluence: f64,
}

/// Bucket an UTC hour into the three session groups used by the spec.
pub fn hour_group(hour_utc: u32) -> &'static str {
    match hour_utc % 24 {
        0..=7 => "asian",
        8..=15 => "european",
        _ => "us",
    }
}

/// Bucket a final score into the four named ranges.
pub fn score_range(final_score: f64) -> &'static str {
    if final_score >= 80.0 {
        "80+"
    } else if final_score >= 70.0 {
        "70-79"
    } else if final_score >= 60.0 {
        "60-69"
    } else {
        "50-59"
    }
}

/// Bucket an MTF confluence value into negative/zero/positive.
pub fn mtf_bucket(mtf_confluence: f64) -> &'static str {
    if mtf_confluence > 0.0 {
        "positive"
    } else if mtf_confluence < 0.0 {
        "negative"
    } else {
        "zero"
    }
}

impl SignalContext {
    fn dimension_values(&self) -> [(LearnerDimension, String); 8] {
        [
            (LearnerDimension::SetupType, self.setup_type.clone()),
            (LearnerDimension::Symbol, self.symbol.clone()),
            (LearnerDimension::Mode, self.mode.to_string()),
            (LearnerDimension::Regime, self.regime.to_string()),
            (LearnerDimension::HourGroup, hour_group(self.hour_utc).to_string()),
            (LearnerDimension::ScoreRange, score_range(self.final_score).to_string()),
            (LearnerDimension::Direction, self.direction.to_string()),
            (LearnerDimension::MtfConfluence, mtf_bucket(self.mtf_confluence).to_string()),
        ]
    }
}

fn trade_context_dimension_values(ctx: &TradeContext) -> [(LearnerDimension, String); 8] {
    [
        (LearnerDimension::SetupType, ctx.setup_type.clone()),
        (LearnerDimension::Symbol, ctx.symbol.clone()),
        (LearnerDimension::Mode, ctx.mode.to_string()),
        (LearnerDimension::Regime, ctx.regime.to_string()),
        (LearnerDimension::HourGroup, hour_group(ctx.hour_utc).to_string()),
        (LearnerDimension::ScoreRange, ctx.score_range.clone()),
        (LearnerDimension::Direction, ctx.direction.to_string()),
        (LearnerDimension::MtfConfluence, ctx.mtf_confluence_bucket.clone()),
    ]
}

/// One dimension/value's win-rate breakdown accumulated during a refresh.
#[derive(Default, Clone, Copy)]
struct Tally {
    wins_7d: u32,
    losses_7d: u32,
    wins_30d: u32,
    losses_30d: u32,
    wins_all: u32,
    losses_all: u32,
    pnl_sum: f64,
}

impl Tally {
    fn win_rate_7d(&self) -> f64 {
        win_rate(self.wins_7d, self.losses_7d)
    }
    fn win_rate_30d(&self) -> f64 {
        win_rate(self.wins_30d, self.losses_30d)
    }
    fn win_rate_all(&self) -> f64 {
        win_rate(self.wins_all, self.losses_all)
    }
    fn sample_size(&self) -> u32 {
        self.wins_all + self.losses_all
    }
    fn sample_size_7d(&self) -> u32 {
        self.wins_7d + self.losses_7d
    }
    fn avg_pnl(&self) -> f64 {
        let n = self.sample_size();
        if n == 0 {
            0.0
        } else {
            self.pnl_sum / n as f64
        }
    }
}

fn win_rate(wins: u32, losses: u32) -> f64 {
    let total = wins + losses;
    if total == 0 {
        0.0
    } else {
        (wins as f64 / total as f64) * 100.0
    }
}

/// Hysteresis weight-modifier rule (spec §4.10).
fn weight_modifier(sample_size: u32, wr_7d: f64, sample_7d: u32, wr_30d: f64) -> f64 {
    if sample_size < MIN_SAMPLE_FOR_MODIFIER {
        return 0.0;
    }
    let wr = if sample_7d > 0 { wr_7d } else { wr_30d };
    if wr < 30.0 && sample_size >= MIN_SAMPLE_FOR_STRONG_PENALTY {
        -15.0
    } else if wr < 40.0 {
        -8.0
    } else if wr > 65.0 {
        5.0
    } else {
        0.0
    }
}

/// A detected performance-edge decay for one dimension/value.
#[derive(Debug, Clone)]
pub struct EdgeDecayAlert {
    pub dimension: LearnerDimension,
    pub dimension_value: String,
    pub win_rate_7d: f64,
    pub win_rate_30d: f64,
    pub sample_size: u32,
    pub drop: f64,
}

/// Process-local cache of `LearningWeight`s plus the calibration report,
/// refreshed from persistence on demand or every `CACHE_REFRESH_INTERVAL`.
pub struct AdaptiveLearner {
    bot_version: BotVersion,
    persistence: Arc<dyn Persistence>,
    cache: Mutex<HashMap<(LearnerDimension, String), LearningWeight>>,
    calibration: Mutex<HashMap<String, f64>>,
    last_refresh: Mutex<Option<Instant>>,
}

impl AdaptiveLearner {
    pub fn new(bot_version: BotVersion, persistence: Arc<dyn Persistence>) -> Self {
        Self {
            bot_version,
            persistence,
            cache: Mutex::new(HashMap::new()),
            calibration: Mutex::new(HashMap::new()),
            last_refresh: Mutex::new(None),
        }
    }

    /// Sum the cached modifiers for a candidate signal's context, clamped to
    /// `[-20, +10]`, with one human-readable reason per nonzero contribution.
    pub fn get_total_modifier(&self, ctx: &SignalContext) -> (f64, Vec<String>) {
        let cache = self.cache.lock();
        let mut total = 0.0;
        let mut reasons = Vec::new();
        for (dimension, value) in ctx.dimension_values() {
            if let Some(weight) = cache.get(&(dimension, value.clone())) {
                if weight.weight_modifier != 0.0 {
                    total += weight.weight_modifier;
                    reasons.push(format!(
                        "{dimension}={value}: {:+.0} (wr7d={:.0}%, n={})",
                        weight.weight_modifier, weight.win_rate_7d, weight.sample_size
                    ));
                }
            }
        }
        (total.clamp(-20.0, 10.0), reasons)
    }

    /// Refresh the cache if it's stale; idempotent, safe to call every tick.
    pub async fn maybe_refresh(&self) -> Result<()> {
        let stale = match *self.last_refresh.lock() {
            Some(at) => at.elapsed() >= CACHE_REFRESH_INTERVAL,
            None => true,
        };
        if stale {
            self.refresh().await?;
        }
        Ok(())
    }

    #[instrument(skip(self), fields(bot_version = %self.bot_version))]
    async fn refresh(&self) -> Result<()> {
        let history = self
            .persistence
            .trade_contexts_since(self.bot_version, FULL_HISTORY_DAYS, FULL_HISTORY_LIMIT)
            .await?;

        let cutoff_7d = chrono::Utc::now() - chrono::Duration::days(7);
        let cutoff_30d = chrono::Utc::now() - chrono::Duration::days(30);

        let mut tallies: HashMap<(LearnerDimension, String), Tally> = HashMap::new();
        let mut score_range_tallies: HashMap<String, (u32, u32)> = HashMap::new();

        for ctx in &history {
            let win = ctx.pnl > 0.0;
            for (dimension, value) in trade_context_dimension_values(ctx) {
                let tally = tallies.entry((dimension, value)).or_default();
                tally.pnl_sum += ctx.pnl;
                if ctx.created_at >= cutoff_7d {
                    if win {
                        tally.wins_7d += 1;
                    } else {
                        tally.losses_7d += 1;
                    }
                }
                if ctx.created_at >= cutoff_30d {
                    if win {
                        tally.wins_30d += 1;
                    } else {
                        tally.losses_30d += 1;
                    }
                }
                if win {
                    tally.wins_all += 1;
                } else {
                    tally.losses_all += 1;
                }
            }
            let entry = score_range_tallies.entry(ctx.score_range.clone()).or_default();
            if win {
                entry.0 += 1;
            } else {
                entry.1 += 1;
            }
        }

        let mut cache = HashMap::new();
        for ((dimension, value), tally) in tallies {
            let sample_size = tally.sample_size();
            let modifier = weight_modifier(
                sample_size,
                tally.win_rate_7d(),
                tally.sample_size_7d(),
                tally.win_rate_30d(),
            );
            let weight = LearningWeight {
                dimension,
                dimension_value: value.clone(),
                bot_version: self.bot_version,
                weight_modifier: modifier,
                confidence: (sample_size as f64 / 20.0).min(1.0),
                win_rate_7d: tally.win_rate_7d(),
                win_rate_30d: tally.win_rate_30d(),
                win_rate_all: tally.win_rate_all(),
                avg_pnl: tally.avg_pnl(),
                sample_size,
            };
            self.persistence.upsert_learning_weight(&weight).await?;
            cache.insert((dimension, value), weight);
        }

        let calibration: HashMap<String, f64> = score_range_tallies
            .into_iter()
            .map(|(range, (wins, losses))| (range, win_rate(wins, losses)))
            .collect();

        *self.cache.lock() = cache;
        *self.calibration.lock() = calibration;
        *self.last_refresh.lock() = Some(Instant::now());

        info!(
            bot_version = %self.bot_version,
            rows = history.len(),
            dimensions = self.cache.lock().len(),
            "adaptive learner cache refreshed"
        );
        Ok(())
    }

    /// Append the trade context row and recompute all weights for this bot.
    /// Spec §5 requires this to serialise under its own lock so two closes
    /// in the same loop turn don't interleave weight writes — the `Mutex`
    /// on `cache`/`last_refresh` provides that serialisation implicitly
    /// since `refresh` holds it only for the final swap, but the insert +
    /// refresh pair as a whole is not re-entrant-safe across awaits, so
    /// callers must not invoke this concurrently for the same bot.
    pub async fn record_trade_context(&self, ctx: &TradeContext) -> Result<()> {
        self.persistence.insert_trade_context(ctx).await?;
        self.refresh().await
    }

    /// Weights with `sample_size >= 5` and a 7d-vs-30d win-rate drop `>= 15`.
    pub fn edge_decay_alerts(&self) -> Vec<EdgeDecayAlert> {
        self.cache
            .lock()
            .values()
            .filter(|w| w.sample_size >= MIN_SAMPLE_FOR_MODIFIER)
            .filter_map(|w| {
                let drop = w.win_rate_30d - w.win_rate_7d;
                (drop >= 15.0).then(|| EdgeDecayAlert {
                    dimension: w.dimension,
                    dimension_value: w.dimension_value.clone(),
                    win_rate_7d: w.win_rate_7d,
                    win_rate_30d: w.win_rate_30d,
                    sample_size: w.sample_size,
                    drop,
                })
            })
            .collect()
    }

    /// Win rates grouped by `score_range` only.
    pub fn calibration_report(&self) -> HashMap<String, f64> {
        self.calibration.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hour_buckets_match_session_windows() {
        assert_eq!(hour_group(3), "asian");
        assert_eq!(hour_group(10), "european");
        assert_eq!(hour_group(20), "us");
    }

    #[test]
    fn score_range_buckets() {
        assert_eq!(score_range(82.0), "80+");
        assert_eq!(score_range(71.0), "70-79");
        assert_eq!(score_range(61.0), "60-69");
        assert_eq!(score_range(52.0), "50-59");
    }

    #[test]
    fn weight_modifier_requires_minimum_sample() {
        assert_eq!(weight_modifier(3, 10.0, 3, 10.0), 0.0);
    }

    #[test]
    fn weight_modifier_strong_penalty_needs_larger_sample() {
        assert_eq!(weight_modifier(6, 20.0, 6, 20.0), -8.0);
        assert_eq!(weight_modifier(8, 20.0, 8, 20.0), -15.0);
    }

    #[test]
    fn weight_modifier_rewards_high_win_rate() {
        assert_eq!(weight_modifier(10, 70.0, 10, 70.0), 5.0);
    }

    #[test]
    fn weight_modifier_falls_back_to_30d_when_7d_empty() {
        assert_eq!(weight_modifier(10, 0.0, 0, 70.0), 5.0);
    }

    #[test]
    fn total_modifier_is_clamped() {
        let learner = AdaptiveLearner::new(
            BotVersion::V4,
            Arc::new(crate::persistence::memory::InMemoryPersistence::new()),
        );
        let ctx = SignalContext {
            setup_type: "breakout".into(),
            symbol: "SYM0".into(),
            mode: Mode::Scalping,
            regime: Regime::Trending,
            hour_utc: 10,
            final_score: 75.0,
            direction: Direction::Long,
            mtf_confluence: 5.0,
        };
        {
            let mut cache = learner.cache.lock();
            for (dimension, value) in ctx.dimension_values() {
                cache.insert(
                    (dimension, value.clone()),
                    LearningWeight {
                        dimension,
                        dimension_value: value,
                        bot_version: BotVersion::V4,
                        weight_modifier: 5.0,
                        confidence: 1.0,
                        win_rate_7d: 70.0,
                        win_rate_30d: 70.0,
                        win_rate_all: 70.0,
                        avg_pnl: 1.0,
                        sample_size: 20,
                    },
                );
            }
        }
        let (total, reasons) = learner.get_total_modifier(&ctx);
        assert_eq!(total, 10.0);
        assert_eq!(reasons.len(), 8);
    }
}
