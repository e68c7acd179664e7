use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// A single OHLCV candle from the Binance kline stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub quote_volume: f64,
    pub trades_count: u64,
    pub taker_buy_volume: f64,
    pub taker_buy_quote_volume: f64,
    pub is_closed: bool,
}

/// Composite key that identifies a unique candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CandleKey {
    pub symbol: String,
    pub interval: String,
}

impl std::fmt::Display for CandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.interval)
    }
}

// ---------------------------------------------------------------------------
// CandleBuffer -- thread-safe ring buffer per (symbol, interval)
// ---------------------------------------------------------------------------

/// Thread-safe ring-buffer that stores the most recent candles per
/// `(symbol, interval)` pair.  The live (unclosed) candle is continuously
/// updated in-place; when a candle closes it becomes permanent and the ring is
/// trimmed to `max_candles`.
pub struct CandleBuffer {
    buffers: RwLock<HashMap<CandleKey, VecDeque<Candle>>>,
    max_candles: usize,
}

impl CandleBuffer {
    /// Create a new buffer that retains at most `max_candles` closed candles per
    /// key, plus one in-progress candle.
    pub fn new(max_candles: usize) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            max_candles,
        }
    }

    /// Insert or replace the latest candle for the given key.
    ///
    /// * If the incoming candle is closed (`is_closed == true`) it is appended
    ///   and the ring is trimmed to `max_candles`.
    /// * If the incoming candle is still open it replaces the last element when
    ///   that element is also an open candle with the same `open_time`
    ///   (in-progress update), otherwise it is simply appended.
    pub fn update(&self, key: CandleKey, candle: Candle) {
        let mut map = self.buffers.write();
        let ring = map
            .entry(key)
            .or_insert_with(|| VecDeque::with_capacity(self.max_candles + 1));

        if candle.is_closed {
            // If the last entry was the in-progress version of this same
            // candle, replace it with the finalized version.
            if let Some(last) = ring.back() {
                if !last.is_closed && last.open_time == candle.open_time {
                    ring.pop_back();
                }
            }
            ring.push_back(candle);
            // Trim oldest to stay within budget.
            while ring.len() > self.max_candles {
                ring.pop_front();
            }
        } else {
            // In-progress candle -- replace existing in-progress or append.
            if let Some(last) = ring.back() {
                if !last.is_closed && last.open_time == candle.open_time {
                    ring.pop_back();
                }
            }
            ring.push_back(candle);
        }
    }

    /// Return the most recent `count` **closed** candles (oldest-first order).
    pub fn get_closed(&self, key: &CandleKey, count: usize) -> Vec<Candle> {
        let map = self.buffers.read();
        match map.get(key) {
            Some(ring) => {
                let closed: Vec<&Candle> = ring.iter().filter(|c| c.is_closed).collect();
                let start = closed.len().saturating_sub(count);
                closed[start..].iter().map(|c| (*c).clone()).collect()
            }
            None => Vec::new(),
        }
    }

    /// Return the most recent `count` close prices from closed candles
    /// (oldest-first order).
    pub fn get_closes(&self, key: &CandleKey, count: usize) -> Vec<f64> {
        self.get_closed(key, count)
            .iter()
            .map(|c| c.close)
            .collect()
    }

    /// Alias for [`get_closed`] — used by strategy.rs and main.rs.
    pub fn get_closed_candles(&self, key: &CandleKey, count: usize) -> Vec<Candle> {
        self.get_closed(key, count)
    }

    /// Return the close price of the most recent closed candle, if any.
    pub fn last_close(&self, key: &CandleKey) -> Option<f64> {
        let map = self.buffers.read();
        map.get(key)
            .and_then(|ring| ring.iter().rev().find(|c| c.is_closed).map(|c| c.close))
    }

    /// Total number of candles (including any in-progress candle) stored for a
    /// key.
    pub fn count(&self, key: &CandleKey) -> usize {
        let map = self.buffers.read();
        map.get(key).map_or(0, VecDeque::len)
    }
}

// ---------------------------------------------------------------------------
// Kline WebSocket stream
// ---------------------------------------------------------------------------

/// Supported intervals that the bot subscribes to.
const SUPPORTED_INTERVALS: &[&str] = &["1m", "5m", "15m", "1h"];

/// Map an engine interval string to Bybit's numeric kline interval.
fn bybit_kline_interval(interval: &str) -> &str {
    match interval {
        "1m" => "1",
        "5m" => "5",
        "15m" => "15",
        "1h" => "60",
        other => other,
    }
}

/// Build the Bybit public WS URL and the topic this symbol/interval
/// subscribes to, for a single-stream subscription over the linear
/// category socket.
#[cfg(test)]
fn build_kline_topic(symbol: &str, interval: &str) -> String {
    format!("kline.{}.{symbol}", bybit_kline_interval(interval))
}

/// Helper: numeric kline fields arrive as JSON strings.
fn parse_string_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

/// Connect to the Bybit v5 public kline WebSocket topic for a single
/// (symbol, interval) pair and feed candles into `buffer`.
///
/// Runs until the stream disconnects or an error occurs, then returns so that
/// the caller (main.rs) can handle reconnection.
///
/// ```ignore
/// let buf = Arc::new(CandleBuffer::new(500));
/// loop {
///     if let Err(e) = run_kline_stream("BTCUSDT", "1m", &buf).await {
///         error!("stream error: {e}");
///     }
///     tokio::time::sleep(Duration::from_secs(5)).await;
/// }
/// ```
pub async fn run_kline_stream(
    symbol: &str,
    interval: &str,
    buffer: &Arc<CandleBuffer>,
) -> Result<()> {
    use futures_util::SinkExt;

    if !SUPPORTED_INTERVALS.contains(&interval) {
        warn!(
            interval = %interval,
            "unsupported kline interval requested -- it will still be subscribed"
        );
    }

    let url = "wss://stream.bybit.com/v5/public/linear";
    info!(url, symbol = %symbol, interval = %interval, "connecting to kline WebSocket");

    let (ws_stream, _response) = connect_async(url)
        .await
        .context("failed to connect to kline WebSocket")?;

    let (mut write, mut read) = ws_stream.split();
    let topic = format!("kline.{}.{symbol}", bybit_kline_interval(interval));
    let subscribe = serde_json::json!({ "op": "subscribe", "args": [topic] });
    write
        .send(tokio_tungstenite::tungstenite::Message::Text(subscribe.to_string()))
        .await
        .context("failed to send subscribe frame")?;

    info!(symbol = %symbol, interval = %interval, "kline WebSocket subscribed");

    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match parse_kline_message_single(&text) {
                        Ok(Some((key, candle))) => {
                            debug!(
                                key = %key,
                                close = candle.close,
                                closed = candle.is_closed,
                                "candle update"
                            );
                            buffer.update(key, candle);
                        }
                        Ok(None) => {} // subscription ack / non-kline frame
                        Err(e) => {
                            warn!(error = %e, "failed to parse kline message");
                        }
                    }
                }
                // Silently ignore Ping / Pong / Binary / Close frames --
                // tungstenite handles pong replies automatically.
            }
            Some(Err(e)) => {
                error!(error = %e, "kline WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!(symbol = %symbol, interval = %interval, "kline WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

/// Parse a Bybit v5 kline WS frame.
///
/// Expected shape:
/// ```json
/// { "topic": "kline.5.BTCUSDT", "data": [{
///     "start": 1700000000000, "end": 1700000299999, "interval": "5",
///     "open": "37000.00", "high": "37050.00", "low": "36990.00",
///     "close": "37020.00", "volume": "123.456", "turnover": "4567890.12",
///     "confirm": false, "timestamp": 1700000001000
/// }]}
/// ```
/// Returns `Ok(None)` for frames with no kline payload (subscription acks).
fn parse_kline_message_single(text: &str) -> Result<Option<(CandleKey, Candle)>> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse kline JSON")?;

    let Some(topic) = root.get("topic").and_then(|t| t.as_str()) else {
        return Ok(None);
    };
    let symbol = topic
        .rsplit('.')
        .next()
        .context("malformed kline topic")?
        .to_uppercase();
    let bybit_interval = topic
        .split('.')
        .nth(1)
        .context("malformed kline topic")?
        .to_string();
    let interval = match bybit_interval.as_str() {
        "1" => "1m",
        "5" => "5m",
        "15" => "15m",
        "60" => "1h",
        other => other,
    }
    .to_string();

    let entries = root["data"].as_array().context("missing field data")?;
    let k = entries.first().context("empty kline data array")?;

    let open_time = k["start"].as_i64().context("missing field start")?;
    let close_time = k["end"].as_i64().context("missing field end")?;

    let open = parse_string_f64(&k["open"], "open")?;
    let high = parse_string_f64(&k["high"], "high")?;
    let low = parse_string_f64(&k["low"], "low")?;
    let close = parse_string_f64(&k["close"], "close")?;
    let volume = parse_string_f64(&k["volume"], "volume")?;
    let quote_volume = parse_string_f64(&k["turnover"], "turnover")?;
    let is_closed = k["confirm"].as_bool().context("missing field confirm")?;

    let key = CandleKey { symbol, interval };
    let candle = Candle {
        open_time,
        close_time,
        open,
        high,
        low,
        close,
        volume,
        quote_volume,
        // Bybit's kline topic does not report trade count or the
        // taker-buy split; those fields stay zero for stream-sourced
        // candles (REST backfill via the exchange adapter fills real
        // values where the venue's kline endpoint provides them).
        trades_count: 0,
        taker_buy_volume: 0.0,
        taker_buy_quote_volume: 0.0,
        is_closed,
    };

    Ok(Some((key, candle)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_candle(open_time: i64, close: f64, is_closed: bool) -> Candle {
        Candle {
            open_time,
            close_time: open_time + 59_999,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 100.0,
            quote_volume: 200.0,
            trades_count: 50,
            taker_buy_volume: 60.0,
            taker_buy_quote_volume: 120.0,
            is_closed,
        }
    }

    fn make_key(sym: &str, iv: &str) -> CandleKey {
        CandleKey {
            symbol: sym.into(),
            interval: iv.into(),
        }
    }

    #[test]
    fn ring_buffer_trimming() {
        let buf = CandleBuffer::new(3);
        let key = make_key("BTCUSDT", "1m");

        for i in 0..5 {
            buf.update(
                key.clone(),
                sample_candle(i * 60_000, 100.0 + i as f64, true),
            );
        }

        assert_eq!(buf.count(&key), 3);
        let closes = buf.get_closes(&key, 10);
        assert_eq!(closes, vec![102.0, 103.0, 104.0]);
    }

    #[test]
    fn in_progress_replacement() {
        let buf = CandleBuffer::new(10);
        let key = make_key("ETHUSDT", "5m");

        buf.update(key.clone(), sample_candle(0, 50.0, false));
        assert_eq!(buf.count(&key), 1);

        // Same open_time, still open -- should replace.
        buf.update(key.clone(), sample_candle(0, 51.0, false));
        assert_eq!(buf.count(&key), 1);

        // Close it.
        buf.update(key.clone(), sample_candle(0, 52.0, true));
        assert_eq!(buf.count(&key), 1);
        assert_eq!(buf.last_close(&key), Some(52.0));
    }

    #[test]
    fn get_closed_filters_out_in_progress() {
        let buf = CandleBuffer::new(10);
        let key = make_key("BTCUSDT", "1m");

        buf.update(key.clone(), sample_candle(0, 100.0, true));
        buf.update(key.clone(), sample_candle(60_000, 101.0, true));
        buf.update(key.clone(), sample_candle(120_000, 102.0, false)); // in progress

        let closed = buf.get_closed(&key, 10);
        assert_eq!(closed.len(), 2);
    }

    #[test]
    fn last_close_empty_returns_none() {
        let buf = CandleBuffer::new(10);
        let key = make_key("XYZUSDT", "1h");
        assert_eq!(buf.last_close(&key), None);
    }

    #[test]
    fn build_topic_uses_bybit_numeric_interval() {
        assert_eq!(build_kline_topic("BTCUSDT", "5m"), "kline.5.BTCUSDT");
        assert_eq!(build_kline_topic("ETHUSDT", "1h"), "kline.60.ETHUSDT");
    }

    #[test]
    fn parse_kline_message_ok() {
        let json = r#"{
            "topic": "kline.1.BTCUSDT",
            "data": [{
                "start": 1700000000000,
                "end": 1700000059999,
                "interval": "1",
                "open": "37000.00",
                "high": "37050.00",
                "low": "36990.00",
                "close": "37020.00",
                "volume": "123.456",
                "turnover": "4567890.12",
                "confirm": false,
                "timestamp": 1700000001000
            }]
        }"#;
        let (key, candle) = parse_kline_message_single(json).expect("should parse").expect("should have payload");
        assert_eq!(key.symbol, "BTCUSDT");
        assert_eq!(key.interval, "1m");
        assert!((candle.close - 37020.0).abs() < f64::EPSILON);
        assert!(!candle.is_closed);
    }

    #[test]
    fn parse_kline_message_ignores_non_kline_frames() {
        let json = r#"{"success":true,"op":"subscribe"}"#;
        assert!(parse_kline_message_single(json).unwrap().is_none());
    }
}
