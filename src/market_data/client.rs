// =============================================================================
// Market-Data Client — spec §2 "the only truly process-wide object"
// =============================================================================
//
// Fetches OHLCV/orderbook/funding/ticker; maintains per-symbol open-interest
// delta; exposes the multi-symbol deal-stream WebSocket connection. Shared
// read-only across all four bot instances (spec §5: "The market-data client
// is read-shared; its OI-delta memory is keyed per symbol and the last-value
// update is benign under the single-threaded scheduler").
//
// Grounded on the teacher's `binance/client.rs` (reqwest client shape,
// `#[instrument]` usage, public-endpoint error handling) trimmed to public
// market-data endpoints only — signed account/order endpoints are dropped
// because order placement adapters are explicitly out of this core's scope
// (spec §1). Funding/OI/long-short polling grounded on the teacher's
// `futures_intel::*`.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tracing::{debug, instrument, warn};

use super::candle::{Candle, CandleBuffer, CandleKey};
use super::deal_stream::DealStreamProcessor;
use super::orderbook::OrderBookManager;
use crate::futures_intel::funding_rate::{FundingRateMonitor, FundingState};
use crate::futures_intel::long_short_ratio::{LSState, LongShortMonitor};
use crate::futures_intel::open_interest::{OIState, OpenInterestTracker};

/// Rolling memory of open-interest readings used to compute a real
/// percentage delta (the teacher's own `OpenInterestTracker::fetch` returns
/// a stateless single-snapshot reading and leaves history-tracking to the
/// caller — this is that caller).
struct OiMemory {
    history: std::collections::VecDeque<(chrono::DateTime<chrono::Utc>, f64)>,
}

impl OiMemory {
    fn new() -> Self {
        Self {
            history: std::collections::VecDeque::with_capacity(64),
        }
    }

    fn push_and_delta_pct(&mut self, oi: f64) -> f64 {
        let now = chrono::Utc::now();
        self.history.push_back((now, oi));
        let cutoff = now - chrono::Duration::hours(1);
        while self
            .history
            .front()
            .map(|(t, _)| *t < cutoff)
            .unwrap_or(false)
            && self.history.len() > 1
        {
            self.history.pop_front();
        }
        match self.history.front() {
            Some((_, first)) if *first > 0.0 => (oi - first) / first * 100.0,
            _ => 0.0,
        }
    }
}

pub struct MarketDataClient {
    http: reqwest::Client,
    base_url: String,
    pub candles: Arc<CandleBuffer>,
    pub orderbook: Arc<OrderBookManager>,
    pub deal_processors: RwLock<HashMap<String, Arc<DealStreamProcessor>>>,
    funding: FundingRateMonitor,
    open_interest: OpenInterestTracker,
    long_short: LongShortMonitor,
    oi_memory: RwLock<HashMap<String, OiMemory>>,
    connected: std::sync::atomic::AtomicBool,
}

impl MarketDataClient {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");
        Self {
            http: http.clone(),
            base_url: "https://api.binance.com".to_string(),
            candles: Arc::new(CandleBuffer::new(500)),
            orderbook: Arc::new(OrderBookManager::new()),
            deal_processors: RwLock::new(HashMap::new()),
            funding: FundingRateMonitor::with_client(http.clone()),
            open_interest: OpenInterestTracker::with_client(http.clone()),
            long_short: LongShortMonitor::with_client(http),
            oi_memory: RwLock::new(HashMap::new()),
            connected: std::sync::atomic::AtomicBool::new(true),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected
            .store(connected, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn deal_processor(&self, symbol: &str) -> Arc<DealStreamProcessor> {
        if let Some(p) = self.deal_processors.read().get(symbol) {
            return p.clone();
        }
        let mut map = self.deal_processors.write();
        map.entry(symbol.to_string())
            .or_insert_with(|| Arc::new(DealStreamProcessor::new()))
            .clone()
    }

    /// GET klines (public, no signature required) and feed them into the
    /// shared candle buffer, then return the requested window.
    #[instrument(skip(self), name = "market_data::fetch_ohlcv")]
    pub async fn fetch_ohlcv(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Candle>> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url, symbol, interval, limit
        );
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .context("GET klines request failed")?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse klines response")?;
        if !status.is_success() {
            anyhow::bail!("klines endpoint returned {}: {}", status, body);
        }
        let raw = body.as_array().context("klines response is not an array")?;

        let mut candles = Vec::with_capacity(raw.len());
        for entry in raw {
            let arr = entry.as_array().context("kline entry is not an array")?;
            if arr.len() < 11 {
                warn!(len = arr.len(), "skipping malformed kline entry");
                continue;
            }
            let open_time = arr[0].as_i64().unwrap_or(0);
            let open = parse_str_f64(&arr[1])?;
            let high = parse_str_f64(&arr[2])?;
            let low = parse_str_f64(&arr[3])?;
            let close = parse_str_f64(&arr[4])?;
            let volume = parse_str_f64(&arr[5])?;
            let close_time = arr[6].as_i64().unwrap_or(0);
            let quote_volume = parse_str_f64(&arr[7])?;
            let trades_count = arr[8].as_u64().unwrap_or(0);
            let taker_buy_volume = parse_str_f64(&arr[9])?;
            let taker_buy_quote_volume = parse_str_f64(&arr[10])?;

            let candle = Candle {
                open_time,
                close_time,
                open,
                high,
                low,
                close,
                volume,
                quote_volume,
                trades_count,
                taker_buy_volume,
                taker_buy_quote_volume,
                is_closed: true,
            };
            let key = CandleKey {
                symbol: symbol.to_string(),
                interval: interval.to_string(),
            };
            self.candles.update(key, candle.clone());
            candles.push(candle);
        }
        debug!(symbol, interval, count = candles.len(), "OHLCV fetched");
        Ok(candles)
    }

    /// Last traded price from the deal stream, falling back to the most
    /// recent closed candle's close if no deal has been observed yet.
    pub fn ticker_price(&self, symbol: &str, fallback_interval: &str) -> Option<f64> {
        let from_deals = self
            .deal_processors
            .read()
            .get(symbol)
            .map(|p| p.last_price())
            .filter(|p| *p > 0.0);
        from_deals.or_else(|| {
            self.candles.last_close(&CandleKey {
                symbol: symbol.to_string(),
                interval: fallback_interval.to_string(),
            })
        })
    }

    #[instrument(skip(self), name = "market_data::fetch_funding")]
    pub async fn fetch_funding(&self, symbol: &str) -> Result<FundingState> {
        self.funding.fetch(symbol).await
    }

    /// Fetch current OI and return it alongside the real hourly delta,
    /// computed from this client's own rolling per-symbol memory.
    #[instrument(skip(self), name = "market_data::fetch_open_interest")]
    pub async fn fetch_open_interest(&self, symbol: &str) -> Result<OIState> {
        let mut state = self.open_interest.fetch(symbol).await?;
        let delta = {
            let mut mem = self.oi_memory.write();
            mem.entry(symbol.to_string())
                .or_insert_with(OiMemory::new)
                .push_and_delta_pct(state.current_oi)
        };
        state.oi_change_1h_pct = delta;
        state.block_trading = delta < -10.0;
        Ok(state)
    }

    #[instrument(skip(self), name = "market_data::fetch_long_short_ratio")]
    pub async fn fetch_long_short_ratio(&self, symbol: &str) -> Result<LSState> {
        self.long_short.fetch(symbol).await
    }
}

impl Default for MarketDataClient {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .with_context(|| format!("failed to parse '{s}' as f64"))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        anyhow::bail!("expected string or number, got: {val}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oi_memory_computes_delta_against_first_reading() {
        let mut mem = OiMemory::new();
        assert_eq!(mem.push_and_delta_pct(1000.0), 0.0);
        let delta = mem.push_and_delta_pct(900.0);
        assert!((delta - (-10.0)).abs() < 1e-9);
    }

    #[test]
    fn ticker_price_falls_back_to_candle_close() {
        let client = MarketDataClient::new();
        client.candles.update(
            CandleKey {
                symbol: "BTCUSDT".into(),
                interval: "5m".into(),
            },
            Candle {
                open_time: 0,
                close_time: 1,
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.5,
                volume: 10.0,
                quote_volume: 1000.0,
                trades_count: 5,
                taker_buy_volume: 5.0,
                taker_buy_quote_volume: 500.0,
                is_closed: true,
            },
        );
        assert_eq!(client.ticker_price("BTCUSDT", "5m"), Some(100.5));
    }
}
