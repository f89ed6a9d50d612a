pub mod candle;
pub mod client;
pub mod deal_stream;
pub mod orderbook;

// Re-export the Candle struct for convenient access (e.g. `use crate::market_data::Candle`).
pub use candle::{Candle, CandleBuffer, CandleKey};
pub use client::MarketDataClient;
pub use deal_stream::{Deal, DealStreamProcessor};
pub use orderbook::OrderBookManager;
