// =============================================================================
// Sentiment Provider — cached aggregate of external sentiment indicators
// =============================================================================
//
// Aggregates the funding-rate contrarian signal (all bot versions) with the
// long/short account-ratio signal (V4 only, SPEC_FULL.md §11) into a single
// {score ∈ [-100, +100], bias} snapshot, cached per symbol so the Signal
// Engine doesn't refetch on every tick. Grounded on `futures_intel::
// funding_rate`'s cached-fetch-with-interpretation shape, generalized from a
// single indicator to a weighted aggregate with its own cache layer (the
// teacher has no caching layer of its own to draw on for the TTL mechanism;
// this follows the same `RwLock<HashMap<..>>` lazily-populated-cache idiom
// used by `market_data::client::MarketDataClient`'s `oi_memory`).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::futures_intel::funding_rate::FundingRateMonitor;
use crate::futures_intel::long_short_ratio::LongShortMonitor;
use crate::types::{BotVersion, Direction};

const CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentimentSnapshot {
    /// Aggregate contrarian sentiment in [-100, +100]; positive is bullish.
    pub score: f64,
    pub bias: String,
}

impl SentimentSnapshot {
    /// Normalise to [-1, +1] for the Signal Engine's final weighted sum.
    pub fn normalised(&self) -> f64 {
        self.score / 100.0
    }

    /// §4.5 step 8: direction_score multiplier based on alignment with bias.
    pub fn alignment_multiplier(&self, direction: Direction) -> f64 {
        let aligned = (self.score > 5.0 && direction == Direction::Long)
            || (self.score < -5.0 && direction == Direction::Short);
        let opposed = (self.score > 5.0 && direction == Direction::Short)
            || (self.score < -5.0 && direction == Direction::Long);
        if aligned {
            1.3
        } else if opposed {
            0.6
        } else {
            1.0
        }
    }
}

struct CacheEntry {
    snapshot: SentimentSnapshot,
    fetched_at: Instant,
}

/// Fetches funding-rate (all versions) and long/short-ratio (V4 only)
/// signals, blends them, and caches the result per symbol for `CACHE_TTL`.
pub struct SentimentProvider {
    bot_version: BotVersion,
    funding: FundingRateMonitor,
    long_short: LongShortMonitor,
    cache: RwLock<HashMap<String, CacheEntry>>,
}

impl SentimentProvider {
    pub fn new(bot_version: BotVersion) -> Self {
        Self {
            bot_version,
            funding: FundingRateMonitor::new(),
            long_short: LongShortMonitor::new(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_monitors(bot_version: BotVersion, funding: FundingRateMonitor, long_short: LongShortMonitor) -> Self {
        Self {
            bot_version,
            funding,
            long_short,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Return the cached snapshot for `symbol` if still fresh, refetching and
    /// re-caching otherwise. Never fails the caller: a fetch error on either
    /// leg degrades that leg to neutral rather than propagating.
    pub async fn snapshot(&self, symbol: &str) -> SentimentSnapshot {
        if let Some(entry) = self.cache.read().get(symbol) {
            if entry.fetched_at.elapsed() < CACHE_TTL {
                return entry.snapshot.clone();
            }
        }

        let funding_signal = match self.funding.fetch(symbol).await {
            Ok(state) => state.signal,
            Err(e) => {
                debug!(symbol, error = %e, "sentiment: funding leg failed, treating as neutral");
                0.0
            }
        };
        // V4 only (SPEC_FULL.md §11): the long/short account-ratio leg is an
        // additional sentiment-adjacent vote layered on top of funding.
        let long_short_signal = if self.bot_version.is_v4() {
            match self.long_short.fetch(symbol).await {
                Ok(state) => Some(state.signal),
                Err(e) => {
                    debug!(symbol, error = %e, "sentiment: long/short leg failed, treating as neutral");
                    Some(0.0)
                }
            }
        } else {
            None
        };

        let snapshot = blend(funding_signal, long_short_signal);
        self.cache.write().insert(
            symbol.to_string(),
            CacheEntry { snapshot: snapshot.clone(), fetched_at: Instant::now() },
        );
        snapshot
    }
}

/// Equal-weight blend of funding with the optional V4-only long/short leg;
/// with no long/short leg, funding alone drives the score.
fn blend(funding_signal: f64, long_short_signal: Option<f64>) -> SentimentSnapshot {
    let combined = match long_short_signal {
        Some(ls) => (funding_signal + ls) / 2.0,
        None => funding_signal,
    };
    let score = (combined * 100.0).clamp(-100.0, 100.0);
    let bias = if score > 20.0 {
        "BULLISH"
    } else if score < -20.0 {
        "BEARISH"
    } else {
        "NEUTRAL"
    };
    SentimentSnapshot { score, bias: bias.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blend_averages_both_legs_when_long_short_present() {
        let snap = blend(0.8, Some(0.4));
        assert!((snap.score - 60.0).abs() < 1e-9);
        assert_eq!(snap.bias, "BULLISH");
    }

    #[test]
    fn blend_uses_funding_alone_for_non_v4() {
        let snap = blend(0.8, None);
        assert!((snap.score - 80.0).abs() < 1e-9);
        assert_eq!(snap.bias, "BULLISH");
    }

    #[test]
    fn neutral_legs_yield_neutral_bias() {
        let snap = blend(0.0, Some(0.05));
        assert_eq!(snap.bias, "NEUTRAL");
    }

    #[test]
    fn alignment_multiplier_rewards_matching_direction() {
        let bullish = SentimentSnapshot { score: 60.0, bias: "BULLISH".to_string() };
        assert_eq!(bullish.alignment_multiplier(Direction::Long), 1.3);
        assert_eq!(bullish.alignment_multiplier(Direction::Short), 0.6);
        assert_eq!(bullish.alignment_multiplier(Direction::None), 1.0);
    }

    #[test]
    fn neutral_sentiment_is_multiplier_one() {
        let neutral = SentimentSnapshot { score: 2.0, bias: "NEUTRAL".to_string() };
        assert_eq!(neutral.alignment_multiplier(Direction::Long), 1.0);
        assert_eq!(neutral.alignment_multiplier(Direction::Short), 1.0);
    }

    #[test]
    fn normalised_divides_by_hundred() {
        let snap = SentimentSnapshot { score: 45.0, bias: "BULLISH".to_string() };
        assert!((snap.normalised() - 0.45).abs() < 1e-9);
    }
}
