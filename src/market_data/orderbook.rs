// =============================================================================
// Order Book Manager — Real-time orderbook aggregation
// =============================================================================
//
// Maintains a full, ordered L2 book per symbol from Bybit v5's
// `orderbook.{depth}.{symbol}` topic. The first message for a symbol is a
// `snapshot`; subsequent messages are `delta`s applying (price, size)
// upserts, where `size == 0` removes the level. Bybit stamps every message
// with a monotonic `u` (update id) and a `seq` that must increase by
// exactly the server's internal counter; a gap in `u` means we missed an
// update and must resync from a fresh snapshot rather than silently
// continuing on stale state.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Deserialize;
use tokio_tungstenite::connect_async;
use tracing::{error, info, instrument, warn};

use crate::diagnostics::DiagnosticCollector;
use crate::types::{BookLevel, DiagnosticEvent, OrderBookSnapshot};

/// A single symbol's book kept as ordered maps so inserts/removals by price
/// stay cheap and the top-of-book read is a simple `first_key_value`.
struct LiveBook {
    bids: BTreeMap<OrderedPrice, f64>,
    asks: BTreeMap<OrderedPrice, f64>,
    last_update_id: u64,
    last_seq: u64,
}

/// `f64` isn't `Ord`; prices here are always finite and positive so this
/// wrapper is safe. Bids are stored with descending order via `Reverse`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct OrderedPrice(f64);

impl Eq for OrderedPrice {}
impl PartialOrd for OrderedPrice {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for OrderedPrice {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.partial_cmp(&other.0).unwrap_or(std::cmp::Ordering::Equal)
    }
}

impl LiveBook {
    fn empty() -> Self {
        Self {
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_update_id: 0,
            last_seq: 0,
        }
    }

    fn apply_side(side: &mut BTreeMap<OrderedPrice, f64>, levels: &[(f64, f64)]) {
        for &(price, size) in levels {
            if size <= 0.0 {
                side.remove(&OrderedPrice(price));
            } else {
                side.insert(OrderedPrice(price), size);
            }
        }
    }

    fn to_snapshot(&self, symbol: &str, ts: i64) -> OrderBookSnapshot {
        let bids: Vec<BookLevel> = self
            .bids
            .iter()
            .rev() // descending price
            .map(|(p, &size)| BookLevel { price: p.0, size })
            .collect();
        let asks: Vec<BookLevel> = self
            .asks
            .iter() // ascending price
            .map(|(p, &size)| BookLevel { price: p.0, size })
            .collect();
        OrderBookSnapshot {
            symbol: symbol.to_string(),
            bids,
            asks,
            sequence_id: self.last_update_id,
            ts,
        }
    }
}

/// Manages orderbook state for multiple symbols.
pub struct OrderBookManager {
    books: RwLock<HashMap<String, LiveBook>>,
    /// Symbols whose last applied message left a detected sequence gap and
    /// are waiting on a fresh snapshot before deltas are trusted again.
    desynced: RwLock<HashMap<String, bool>>,
}

impl OrderBookManager {
    pub fn new() -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
            desynced: RwLock::new(HashMap::new()),
        }
    }

    /// Replace a symbol's book wholesale (snapshot message, or resync after
    /// a detected gap).
    pub fn apply_snapshot(&self, symbol: &str, bids: &[(f64, f64)], asks: &[(f64, f64)], update_id: u64, seq: u64) {
        let mut book = LiveBook::empty();
        LiveBook::apply_side(&mut book.bids, bids);
        LiveBook::apply_side(&mut book.asks, asks);
        book.last_update_id = update_id;
        book.last_seq = seq;
        self.books.write().insert(symbol.to_string(), book);
        self.desynced.write().insert(symbol.to_string(), false);
    }

    /// Apply a delta message. Returns `false` (and marks the symbol
    /// desynced) if `seq` does not continue from the last applied message,
    /// signalling the caller must fetch a fresh snapshot.
    pub fn apply_delta(&self, symbol: &str, bids: &[(f64, f64)], asks: &[(f64, f64)], update_id: u64, seq: u64) -> bool {
        let mut books = self.books.write();
        let Some(book) = books.get_mut(symbol) else {
            self.desynced.write().insert(symbol.to_string(), true);
            return false;
        };
        if seq <= book.last_seq {
            // Duplicate or out-of-order delta; ignore without desyncing.
            return true;
        }
        if seq != book.last_seq + 1 {
            warn!(symbol, expected = book.last_seq + 1, got = seq, "orderbook sequence gap detected");
            self.desynced.write().insert(symbol.to_string(), true);
            return false;
        }
        LiveBook::apply_side(&mut book.bids, bids);
        LiveBook::apply_side(&mut book.asks, asks);
        book.last_update_id = update_id;
        book.last_seq = seq;
        true
    }

    pub fn is_desynced(&self, symbol: &str) -> bool {
        self.desynced.read().get(symbol).copied().unwrap_or(true)
    }

    /// Get the current orderbook snapshot for a symbol.
    pub fn get(&self, symbol: &str) -> Option<OrderBookSnapshot> {
        self.books.read().get(symbol).map(|b| b.to_snapshot(symbol, now_ms()))
    }

    pub fn spread_bps(&self, symbol: &str) -> Option<f64> {
        self.get(symbol).and_then(|s| s.to_l2_depth()).map(|d| d.spread_bps)
    }

    pub fn imbalance(&self, symbol: &str) -> Option<f64> {
        self.get(symbol).and_then(|s| s.to_l2_depth()).map(|d| d.imbalance)
    }

    pub fn symbols(&self) -> Vec<String> {
        self.books.read().keys().cloned().collect()
    }
}

impl Default for OrderBookManager {
    fn default() -> Self {
        Self::new()
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ---------------------------------------------------------------------------
// Depth WebSocket stream
// ---------------------------------------------------------------------------

/// Connect to the Bybit v5 public orderbook WebSocket stream for a single
/// symbol and feed updates into `manager`. `depth` selects the subscription
/// tier (Bybit linear perps support 1/50/200/500).
///
/// Runs until the stream disconnects or an error occurs, then returns so
/// that the caller (main.rs) can handle reconnection.
#[instrument(skip(manager, diagnostics), fields(symbol = %symbol, depth = depth))]
pub async fn run_depth_stream(
    symbol: &str,
    depth: u32,
    manager: &Arc<OrderBookManager>,
    diagnostics: &Arc<DiagnosticCollector>,
) -> Result<()> {
    let url = "wss://stream.bybit.com/v5/public/linear";
    info!(url, symbol = %symbol, "connecting to orderbook WebSocket");

    let (ws_stream, _response) = connect_async(url)
        .await
        .context("failed to connect to orderbook WebSocket")?;
    let (mut write, mut read) = ws_stream.split();

    let topic = format!("orderbook.{depth}.{symbol}");
    subscribe(&mut write, &topic).await?;

    info!(symbol = %symbol, "orderbook WebSocket subscribed");

    loop {
        match read.next().await {
            Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                match parse_depth_message(&text) {
                    Ok(Some(msg)) => {
                        if !apply_depth_message(manager, &msg) {
                            resync(&mut write, symbol, &topic, diagnostics).await?;
                        }
                    }
                    Ok(None) => {} // subscription ack / heartbeat, nothing to apply
                    Err(e) => warn!(error = %e, "failed to parse orderbook message"),
                }
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!(symbol = %symbol, error = %e, "orderbook WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!(symbol = %symbol, "orderbook WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

type WsWrite = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    tokio_tungstenite::tungstenite::Message,
>;

async fn subscribe(write: &mut WsWrite, topic: &str) -> Result<()> {
    let frame = serde_json::json!({ "op": "subscribe", "args": [topic] });
    write
        .send(tokio_tungstenite::tungstenite::Message::Text(frame.to_string()))
        .await
        .context("failed to send subscribe frame")
}

async fn unsubscribe(write: &mut WsWrite, topic: &str) -> Result<()> {
    let frame = serde_json::json!({ "op": "unsubscribe", "args": [topic] });
    write
        .send(tokio_tungstenite::tungstenite::Message::Text(frame.to_string()))
        .await
        .context("failed to send unsubscribe frame")
}

/// Drops the desynced book and re-subscribes so the next `snapshot` frame
/// rebuilds it from scratch, rather than limping along on stale deltas.
async fn resync(write: &mut WsWrite, symbol: &str, topic: &str, diagnostics: &Arc<DiagnosticCollector>) -> Result<()> {
    warn!(symbol, "orderbook desynced, resubscribing for a fresh snapshot");
    diagnostics.record(DiagnosticEvent {
        ts: chrono::Utc::now().timestamp_millis(),
        component: "market_data".to_string(),
        stage: "orderbook:resync".to_string(),
        symbol: Some(symbol.to_string()),
        payload: serde_json::json!({ "topic": topic }),
        reason: Some("sequence gap detected, resubscribing".to_string()),
        passed: Some(false),
    });
    unsubscribe(write, topic).await?;
    subscribe(write, topic).await
}

/// Applies one parsed frame. Returns `false` when a delta left the book
/// desynced and the caller must resubscribe for a fresh snapshot.
fn apply_depth_message(manager: &Arc<OrderBookManager>, msg: &DepthMessage) -> bool {
    let bids = parse_levels(&msg.data.b);
    let asks = parse_levels(&msg.data.a);
    match msg.msg_type.as_str() {
        "snapshot" => {
            manager.apply_snapshot(&msg.data.s, &bids, &asks, msg.data.u, msg.data.seq);
            true
        }
        "delta" => manager.apply_delta(&msg.data.s, &bids, &asks, msg.data.u, msg.data.seq),
        other => {
            warn!(msg_type = other, "unrecognized orderbook message type");
            true
        }
    }
}

#[derive(Debug, Deserialize)]
struct DepthMessage {
    #[serde(rename = "type")]
    msg_type: String,
    data: DepthData,
}

#[derive(Debug, Deserialize)]
struct DepthData {
    s: String,
    b: Vec<[String; 2]>,
    a: Vec<[String; 2]>,
    u: u64,
    seq: u64,
}

fn parse_levels(raw: &[[String; 2]]) -> Vec<(f64, f64)> {
    raw.iter()
        .filter_map(|[p, q]| Some((p.parse().ok()?, q.parse().ok()?)))
        .collect()
}

/// Parses one Bybit v5 orderbook WS frame. Returns `Ok(None)` for frames
/// that carry no orderbook payload (subscription acks, pings).
fn parse_depth_message(text: &str) -> Result<Option<DepthMessage>> {
    let root: serde_json::Value = serde_json::from_str(text).context("failed to parse orderbook JSON")?;
    if root.get("topic").is_none() {
        return Ok(None);
    }
    let msg: DepthMessage = serde_json::from_value(root).context("failed to decode orderbook frame")?;
    Ok(Some(msg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_then_matching_delta_applies() {
        let manager = OrderBookManager::new();
        manager.apply_snapshot("BTCUSDT", &[(100.0, 1.0)], &[(101.0, 1.0)], 1, 1);
        assert!(!manager.is_desynced("BTCUSDT"));
        let applied = manager.apply_delta("BTCUSDT", &[(100.0, 2.0)], &[], 2, 2);
        assert!(applied);
        let snap = manager.get("BTCUSDT").unwrap();
        assert_eq!(snap.best_bid(), Some(100.0));
    }

    #[test]
    fn sequence_gap_marks_desynced() {
        let manager = OrderBookManager::new();
        manager.apply_snapshot("BTCUSDT", &[(100.0, 1.0)], &[(101.0, 1.0)], 1, 1);
        let applied = manager.apply_delta("BTCUSDT", &[(100.0, 2.0)], &[], 5, 5);
        assert!(!applied);
        assert!(manager.is_desynced("BTCUSDT"));
    }

    #[test]
    fn zero_size_level_removes_it() {
        let manager = OrderBookManager::new();
        manager.apply_snapshot("BTCUSDT", &[(100.0, 1.0), (99.0, 1.0)], &[(101.0, 1.0)], 1, 1);
        manager.apply_delta("BTCUSDT", &[(100.0, 0.0)], &[], 2, 2);
        let snap = manager.get("BTCUSDT").unwrap();
        assert_eq!(snap.best_bid(), Some(99.0));
    }
}
