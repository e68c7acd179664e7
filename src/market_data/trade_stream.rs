// =============================================================================
// Trade Stream Processor — Aggregates real-time trade data
// =============================================================================
//
// Consumes Bybit v5's `publicTrade.{symbol}` topic. Beyond the teacher's
// cumulative CVD/buy-ratio, this keeps a short sliding window of individual
// trades so `trades_per_minute` (count over the trailing 60s) and a 10s
// volume delta can be read without a separate scheduler thread — each read
// just drops window entries older than its horizon first.
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use parking_lot::RwLock;
use serde::Deserialize;
use tokio_tungstenite::connect_async;
use tracing::{error, info, instrument, warn};

use crate::types::OrderSide;

const TRADES_PER_MINUTE_WINDOW_MS: i64 = 60_000;
const VOLUME_DELTA_WINDOW_MS: i64 = 10_000;
/// Bound the window so a quiet symbol doesn't grow this unboundedly; at
/// worst this drops the oldest entries before they'd age out anyway.
const MAX_WINDOW_ENTRIES: usize = 20_000;

#[derive(Debug, Clone, Copy)]
struct TradeRecord {
    ts_ms: i64,
    volume_usd: f64,
    side: OrderSide,
}

/// Processes and aggregates individual trades from the Bybit trade stream.
pub struct TradeStreamProcessor {
    symbol: String,
    cvd: RwLock<f64>,
    buy_volume: RwLock<f64>,
    sell_volume: RwLock<f64>,
    trade_count: AtomicU64,
    last_price: RwLock<f64>,
    buy_volume_ratio: RwLock<f64>,
    window: RwLock<VecDeque<TradeRecord>>,
}

impl TradeStreamProcessor {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            cvd: RwLock::new(0.0),
            buy_volume: RwLock::new(0.0),
            sell_volume: RwLock::new(0.0),
            trade_count: AtomicU64::new(0),
            last_price: RwLock::new(0.0),
            buy_volume_ratio: RwLock::new(0.5),
            window: RwLock::new(VecDeque::new()),
        }
    }

    /// Process an incoming trade. `side` is the taker's side.
    pub fn process_trade(&self, price: f64, quantity: f64, side: OrderSide, ts_ms: i64) {
        let volume = price * quantity;

        match side {
            OrderSide::Buy => {
                *self.buy_volume.write() += volume;
                *self.cvd.write() += volume;
            }
            OrderSide::Sell => {
                *self.sell_volume.write() += volume;
                *self.cvd.write() -= volume;
            }
        }

        *self.last_price.write() = price;
        self.trade_count.fetch_add(1, Ordering::Relaxed);

        let buy = *self.buy_volume.read();
        let sell = *self.sell_volume.read();
        let total = buy + sell;
        if total > 0.0 {
            *self.buy_volume_ratio.write() = buy / total;
        }

        let mut window = self.window.write();
        window.push_back(TradeRecord {
            ts_ms,
            volume_usd: volume,
            side,
        });
        if window.len() > MAX_WINDOW_ENTRIES {
            window.pop_front();
        }
    }

    fn prune_window(window: &mut VecDeque<TradeRecord>, now_ms: i64, horizon_ms: i64) {
        while let Some(front) = window.front() {
            if now_ms - front.ts_ms > horizon_ms {
                window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Count of trades in the trailing 60s window (already expressed as a
    /// per-minute rate since the window IS one minute).
    pub fn trades_per_minute(&self, now_ms: i64) -> f64 {
        let mut window = self.window.write();
        Self::prune_window(&mut window, now_ms, TRADES_PER_MINUTE_WINDOW_MS);
        window.len() as f64
    }

    /// Buy volume minus sell volume over the trailing 10s, in quote units.
    pub fn volume_delta_10s(&self, now_ms: i64) -> f64 {
        let mut window = self.window.write();
        Self::prune_window(&mut window, now_ms, TRADES_PER_MINUTE_WINDOW_MS.max(VOLUME_DELTA_WINDOW_MS));
        window
            .iter()
            .filter(|t| now_ms - t.ts_ms <= VOLUME_DELTA_WINDOW_MS)
            .map(|t| match t.side {
                OrderSide::Buy => t.volume_usd,
                OrderSide::Sell => -t.volume_usd,
            })
            .sum()
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn cvd(&self) -> f64 {
        *self.cvd.read()
    }

    pub fn buy_volume_ratio(&self) -> f64 {
        *self.buy_volume_ratio.read()
    }

    pub fn last_price(&self) -> f64 {
        *self.last_price.read()
    }

    pub fn trade_count(&self) -> u64 {
        self.trade_count.load(Ordering::Relaxed)
    }

    /// Reset windowed buy/sell accumulators (call periodically). CVD is
    /// cumulative and is never reset here.
    pub fn reset_window(&self) {
        *self.buy_volume.write() = 0.0;
        *self.sell_volume.write() = 0.0;
    }
}

// ---------------------------------------------------------------------------
// Trade WebSocket stream
// ---------------------------------------------------------------------------

/// Connect to the Bybit `publicTrade.{symbol}` WebSocket topic and feed
/// trades into `processor`.
///
/// Runs until the stream disconnects or an error occurs, then returns so
/// that the caller (main.rs) can handle reconnection.
#[instrument(skip(processor), fields(symbol = %symbol))]
pub async fn run_trade_stream(symbol: &str, processor: &Arc<TradeStreamProcessor>) -> Result<()> {
    use futures_util::SinkExt;

    let url = "wss://stream.bybit.com/v5/public/linear";
    info!(url, symbol = %symbol, "connecting to trade WebSocket");

    let (ws_stream, _response) = connect_async(url)
        .await
        .context("failed to connect to trade WebSocket")?;
    let (mut write, mut read) = ws_stream.split();

    let topic = format!("publicTrade.{symbol}");
    let subscribe = serde_json::json!({ "op": "subscribe", "args": [topic] });
    write
        .send(tokio_tungstenite::tungstenite::Message::Text(subscribe.to_string()))
        .await
        .context("failed to send subscribe frame")?;

    info!(symbol = %symbol, "trade WebSocket subscribed");

    loop {
        match read.next().await {
            Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                match parse_public_trade(&text) {
                    Ok(trades) => {
                        for (price, qty, side, ts_ms) in trades {
                            processor.process_trade(price, qty, side, ts_ms);
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to parse publicTrade message"),
                }
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!(symbol = %symbol, error = %e, "trade WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!(symbol = %symbol, "trade WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct PublicTradeMessage {
    topic: Option<String>,
    data: Option<Vec<PublicTradeEntry>>,
}

#[derive(Debug, Deserialize)]
struct PublicTradeEntry {
    #[serde(rename = "T")]
    ts_ms: i64,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "S")]
    side: String,
}

/// Parse a Bybit `publicTrade.{symbol}` frame.
///
/// Expected shape:
/// ```json
/// { "topic": "publicTrade.BTCUSDT", "data": [
///   { "i": "...", "T": 1700000000000, "p": "37000.00", "v": "0.123", "S": "Buy" }
/// ]}
/// ```
fn parse_public_trade(text: &str) -> Result<Vec<(f64, f64, OrderSide, i64)>> {
    let msg: PublicTradeMessage = serde_json::from_str(text).context("failed to parse publicTrade JSON")?;
    if msg.topic.is_none() {
        return Ok(Vec::new());
    }
    let entries = msg.data.unwrap_or_default();
    entries
        .into_iter()
        .map(|e| {
            let price: f64 = e.price.parse().context("failed to parse trade price")?;
            let volume: f64 = e.volume.parse().context("failed to parse trade volume")?;
            let side = if e.side == "Buy" { OrderSide::Buy } else { OrderSide::Sell };
            Ok((price, volume, side, e.ts_ms))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trades_per_minute_counts_within_window() {
        let p = TradeStreamProcessor::new("BTCUSDT");
        p.process_trade(100.0, 1.0, OrderSide::Buy, 0);
        p.process_trade(100.0, 1.0, OrderSide::Sell, 30_000);
        p.process_trade(100.0, 1.0, OrderSide::Buy, 59_000);
        assert_eq!(p.trades_per_minute(59_500), 3.0);
        assert_eq!(p.trades_per_minute(61_001), 1.0);
    }

    #[test]
    fn volume_delta_10s_nets_buy_sell() {
        let p = TradeStreamProcessor::new("BTCUSDT");
        p.process_trade(100.0, 2.0, OrderSide::Buy, 0);
        p.process_trade(100.0, 1.0, OrderSide::Sell, 5_000);
        let delta = p.volume_delta_10s(9_000);
        assert!((delta - 100.0).abs() < 1e-9);
    }

    #[test]
    fn cvd_is_cumulative_across_resets() {
        let p = TradeStreamProcessor::new("BTCUSDT");
        p.process_trade(100.0, 1.0, OrderSide::Buy, 0);
        p.reset_window();
        p.process_trade(100.0, 1.0, OrderSide::Sell, 1);
        assert_eq!(p.cvd(), 0.0);
    }

    #[test]
    fn parse_public_trade_entry() {
        let text = r#"{"topic":"publicTrade.BTCUSDT","data":[{"i":"1","T":1700000000000,"p":"37000.00","v":"0.123","S":"Buy"}]}"#;
        let trades = parse_public_trade(text).unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].2, OrderSide::Buy);
    }
}
