// =============================================================================
// Deal stream — spec §6 "Market-data inbound protocol"
// =============================================================================
//
// `{channel: "push.deal", symbol: "<NATIVE>", data: [{p, v, T, t}, ...]}`,
// taker-side 1=buy, 2=sell. `data` may also be a single object. Keepalive is
// `{"method":"ping"}` every 20s (spec §5 "WebSocket keepalive is 20s").
//
// Grounded on the teacher's `market_data/trade_stream.rs` (CVD/buy-sell
// volume aggregation shape, reconnect-by-return-to-caller convention) with
// the wire parser reshaped to the `push.deal` envelope instead of Binance's
// `aggTrade` envelope, and an explicit client-side ping loop added (the
// teacher relies on tungstenite's automatic pong reply only, which answers
// server pings but never originates one).
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// One decoded deal (executed trade) tick.
#[derive(Debug, Clone, Copy)]
pub struct Deal {
    pub price: f64,
    pub volume: f64,
    /// true if the taker side was a buy (`T == 1`).
    pub taker_buy: bool,
    pub ts_ms: i64,
}

/// Per-symbol aggregator fed by the deal stream. Tracks the last traded
/// price (consumed by the Position Monitor's `tick` dispatch) and a CVD /
/// buy-sell volume split (consumed by V4's order-flow-adaptive trailing,
/// see SPEC_FULL.md §11).
pub struct DealStreamProcessor {
    last_price: RwLock<f64>,
    cvd: RwLock<f64>,
    buy_volume: RwLock<f64>,
    sell_volume: RwLock<f64>,
    deal_count: AtomicU64,
}

impl DealStreamProcessor {
    pub fn new() -> Self {
        Self {
            last_price: RwLock::new(0.0),
            cvd: RwLock::new(0.0),
            buy_volume: RwLock::new(0.0),
            sell_volume: RwLock::new(0.0),
            deal_count: AtomicU64::new(0),
        }
    }

    pub fn process(&self, deal: Deal) {
        *self.last_price.write() = deal.price;
        if deal.taker_buy {
            *self.buy_volume.write() += deal.volume;
            *self.cvd.write() += deal.volume;
        } else {
            *self.sell_volume.write() += deal.volume;
            *self.cvd.write() -= deal.volume;
        }
        self.deal_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn last_price(&self) -> f64 {
        *self.last_price.read()
    }

    pub fn cvd(&self) -> f64 {
        *self.cvd.read()
    }

    pub fn buy_volume_ratio(&self) -> f64 {
        let buy = *self.buy_volume.read();
        let sell = *self.sell_volume.read();
        let total = buy + sell;
        if total <= 0.0 {
            0.5
        } else {
            buy / total
        }
    }

    pub fn deal_count(&self) -> u64 {
        self.deal_count.load(Ordering::Relaxed)
    }

    pub fn reset_window(&self) {
        *self.buy_volume.write() = 0.0;
        *self.sell_volume.write() = 0.0;
    }
}

impl Default for DealStreamProcessor {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a `push.deal` envelope. `data` may be a single object or an array.
pub fn parse_push_deal(text: &str) -> Result<(String, Vec<Deal>)> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse push.deal JSON")?;

    if root.get("channel").and_then(|c| c.as_str()) != Some("push.deal") {
        anyhow::bail!("not a push.deal message");
    }

    let symbol = root["symbol"]
        .as_str()
        .context("missing field symbol")?
        .to_string();

    let data = &root["data"];
    let entries: Vec<&serde_json::Value> = if data.is_array() {
        data.as_array().unwrap().iter().collect()
    } else {
        vec![data]
    };

    let mut deals = Vec::with_capacity(entries.len());
    for entry in entries {
        let price = entry["p"].as_f64().context("missing field data.p")?;
        let volume = entry["v"].as_f64().context("missing field data.v")?;
        let taker_side = entry["T"].as_i64().context("missing field data.T")?;
        let ts_ms = entry["t"].as_i64().context("missing field data.t")?;
        deals.push(Deal {
            price,
            volume,
            taker_buy: taker_side == 1,
            ts_ms,
        });
    }

    Ok((symbol, deals))
}

/// Connect, subscribe, forward ticks, send a client-side `{"method":"ping"}`
/// keepalive every 20s, and return on disconnect so the caller can
/// reconnect with its own backoff (spec §4.9 "reconnect with 3s backoff").
pub async fn run_deal_stream(
    ws_url: &str,
    symbol: &str,
    processor: &Arc<DealStreamProcessor>,
) -> Result<()> {
    info!(url = %ws_url, symbol, "connecting to deal stream");
    let (ws_stream, _response) = connect_async(ws_url)
        .await
        .context("failed to connect to deal stream")?;
    info!(symbol, "deal stream connected");

    let (mut write, mut read) = ws_stream.split();
    let mut keepalive = tokio::time::interval(Duration::from_secs(20));
    keepalive.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match parse_push_deal(&text) {
                            Ok((sym, deals)) => {
                                for deal in deals {
                                    debug!(symbol = %sym, price = deal.price, "deal tick");
                                    processor.process(deal);
                                }
                            }
                            Err(e) => warn!(error = %e, "failed to parse deal stream message"),
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!(symbol, error = %e, "deal stream read error");
                        return Err(e.into());
                    }
                    None => {
                        warn!(symbol, "deal stream ended");
                        return Ok(());
                    }
                }
            }
            _ = keepalive.tick() => {
                if write.send(Message::Text(r#"{"method":"ping"}"#.to_string())).await.is_err() {
                    warn!(symbol, "failed to send deal stream keepalive ping");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_array_envelope() {
        let json = r#"{"channel":"push.deal","symbol":"BTCUSDT","data":[
            {"p":37000.5,"v":1.2,"T":1,"t":1700000000000},
            {"p":37001.0,"v":0.5,"T":2,"t":1700000000100}
        ]}"#;
        let (symbol, deals) = parse_push_deal(json).unwrap();
        assert_eq!(symbol, "BTCUSDT");
        assert_eq!(deals.len(), 2);
        assert!(deals[0].taker_buy);
        assert!(!deals[1].taker_buy);
    }

    #[test]
    fn parses_single_object_envelope() {
        let json = r#"{"channel":"push.deal","symbol":"ETHUSDT","data":
            {"p":2000.0,"v":3.0,"T":1,"t":1700000000000}
        }"#;
        let (symbol, deals) = parse_push_deal(json).unwrap();
        assert_eq!(symbol, "ETHUSDT");
        assert_eq!(deals.len(), 1);
    }

    #[test]
    fn processor_tracks_cvd_and_buy_ratio() {
        let proc = DealStreamProcessor::new();
        proc.process(Deal { price: 100.0, volume: 10.0, taker_buy: true, ts_ms: 0 });
        proc.process(Deal { price: 101.0, volume: 4.0, taker_buy: false, ts_ms: 1 });
        assert_eq!(proc.last_price(), 101.0);
        assert_eq!(proc.cvd(), 6.0);
        assert!((proc.buy_volume_ratio() - 10.0 / 14.0).abs() < 1e-9);
    }

    #[test]
    fn buy_ratio_defaults_neutral_with_no_volume() {
        let proc = DealStreamProcessor::new();
        assert_eq!(proc.buy_volume_ratio(), 0.5);
    }
}
