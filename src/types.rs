// =============================================================================
// Shared domain types for the breakout trading engine
// =============================================================================
//
// These are the entities described in the data model: Candle (see
// `market_data::candle_buffer::Candle`), L2Depth, OrderBookSnapshot,
// MarketData, TradingLevel, ScanResult, Signal, Order, Position,
// RiskMetrics, DiagnosticEvent, FSMTransition.
// =============================================================================

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Balance snapshot for a single asset from the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceInfo {
    pub asset: String,
    #[serde(default)]
    pub free: f64,
    #[serde(default)]
    pub locked: f64,
}

/// Whether the engine is actively trading, paused, or killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    Live,
    Paused,
    Killed,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Paused
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "Live"),
            Self::Paused => write!(f, "Paused"),
            Self::Killed => write!(f, "Killed"),
        }
    }
}

/// Whether we are running against real funds or simulated (paper).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountMode {
    Paper,
    Live,
}

impl Default for AccountMode {
    fn default() -> Self {
        Self::Paper
    }
}

impl std::fmt::Display for AccountMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Paper => write!(f, "Paper"),
            Self::Live => write!(f, "Live"),
        }
    }
}

// =============================================================================
// L2Depth / OrderBookSnapshot
// =============================================================================

/// Summarized L2 liquidity at fixed price bands around the mid, derived from
/// a symbol's current `OrderBookSnapshot`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct L2Depth {
    pub bid_usd_0_3pct: f64,
    pub ask_usd_0_3pct: f64,
    pub bid_usd_0_5pct: f64,
    pub ask_usd_0_5pct: f64,
    pub spread_bps: f64,
    /// (bids - asks) / (bids + asks), in [-1, 1].
    pub imbalance: f64,
}

impl L2Depth {
    pub fn from_bands(bid_0_3: f64, ask_0_3: f64, bid_0_5: f64, ask_0_5: f64, spread_bps: f64) -> Self {
        let total = bid_0_5 + ask_0_5;
        let imbalance = if total > 0.0 {
            ((bid_0_5 - ask_0_5) / total).clamp(-1.0, 1.0)
        } else {
            0.0
        };
        Self {
            bid_usd_0_3pct: bid_0_3,
            ask_usd_0_3pct: ask_0_3,
            bid_usd_0_5pct: bid_0_5,
            ask_usd_0_5pct: ask_0_5,
            spread_bps,
            imbalance,
        }
    }
}

/// A single price level in an order book side.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    pub size: f64,
}

/// Full L2 order book state for one symbol. Bids are kept descending by
/// price, asks ascending. Produced by a stream snapshot plus validated
/// deltas; an invalid (non-monotonic) sequence id forces a resync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub symbol: String,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub sequence_id: u64,
    pub ts: i64,
}

impl OrderBookSnapshot {
    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|l| l.price)
    }

    pub fn mid(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some((b + a) / 2.0),
            _ => None,
        }
    }

    /// Cumulative USD depth on one side within `pct` of the mid price.
    pub fn depth_usd_within(&self, side_bids: bool, pct: f64) -> f64 {
        let Some(mid) = self.mid() else { return 0.0 };
        let band = mid * pct;
        let levels = if side_bids { &self.bids } else { &self.asks };
        levels
            .iter()
            .filter(|l| (l.price - mid).abs() <= band)
            .map(|l| l.price * l.size)
            .sum()
    }

    /// Derive the summarized `L2Depth` view consumed by the scanner and
    /// signal generator.
    pub fn to_l2_depth(&self) -> Option<L2Depth> {
        let mid = self.mid()?;
        let bid = self.best_bid()?;
        let ask = self.best_ask()?;
        let spread_bps = if mid > 0.0 { ((ask - bid) / mid) * 10_000.0 } else { 0.0 };
        Some(L2Depth::from_bands(
            self.depth_usd_within(true, 0.003),
            self.depth_usd_within(false, 0.003),
            self.depth_usd_within(true, 0.005),
            self.depth_usd_within(false, 0.005),
            spread_bps,
        ))
    }

    /// Cheap clone up to `depth` levels per side, for consumer read snapshots
    /// that must not share the live book structure.
    pub fn read_snapshot(&self, depth: usize) -> OrderBookSnapshot {
        OrderBookSnapshot {
            symbol: self.symbol.clone(),
            bids: self.bids.iter().take(depth).copied().collect(),
            asks: self.asks.iter().take(depth).copied().collect(),
            sequence_id: self.sequence_id,
            ts: self.ts,
        }
    }
}

// =============================================================================
// MarketData
// =============================================================================

/// Per-symbol aggregate consumed by the scanner and signal generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketData {
    pub symbol: String,
    pub price: f64,
    pub volume_24h_usd: f64,
    pub oi_usd: Option<f64>,
    pub trades_per_minute: f64,
    pub atr_5m: f64,
    pub atr_15m: f64,
    pub bb_width_pct: f64,
    pub btc_correlation: f64,
    /// Trailing 1h volume divided by its own rolling baseline; 1.0 is flat.
    pub vol_surge_1h: f64,
    /// Trailing 5m volume divided by its own rolling baseline; 1.0 is flat.
    pub vol_surge_5m: f64,
    /// Fractional change in open interest over the lookback window used by
    /// `VolatilityFilters::oi_delta_threshold`. `None` when OI isn't tracked.
    pub oi_delta: Option<f64>,
    pub l2_depth: Option<L2Depth>,
    pub ts: i64,
}

// =============================================================================
// TradingLevel
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LevelType {
    Support,
    Resistance,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingLevel {
    pub price: f64,
    pub level_type: LevelType,
    pub touch_count: u32,
    pub strength: f64,
    pub first_touch_ts: i64,
    pub last_touch_ts: i64,
    pub base_height: Option<f64>,
}

// =============================================================================
// ScanResult
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub symbol: String,
    pub score: f64,
    pub rank: u32,
    pub market_data: MarketData,
    pub filter_results: std::collections::BTreeMap<String, bool>,
    pub filter_details: std::collections::BTreeMap<String, serde_json::Value>,
    pub score_components: std::collections::BTreeMap<String, f64>,
    pub levels: Vec<TradingLevel>,
    pub ts: i64,
}

impl ScanResult {
    /// `passed_all_filters(r) ⇔ conjunction of r.filter_results values`.
    pub fn passed_all_filters(&self) -> bool {
        self.filter_results.values().all(|&v| v)
    }
}

// =============================================================================
// Signal
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn mirror(self) -> Self {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strategy {
    Momentum,
    Retest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub side: Side,
    pub strategy: Strategy,
    pub entry: f64,
    pub level: f64,
    pub stop_loss: f64,
    pub confidence: f64,
    pub reason: String,
    pub meta: serde_json::Value,
    pub ts: i64,
}

impl Signal {
    /// Construct a signal, asserting the invariants in debug builds:
    /// `side=long ⇒ sl<entry`, `side=short ⇒ sl>entry`, `entry>0`.
    pub fn new(
        symbol: impl Into<String>,
        side: Side,
        strategy: Strategy,
        entry: f64,
        level: f64,
        stop_loss: f64,
        confidence: f64,
        reason: impl Into<String>,
        meta: serde_json::Value,
        ts: i64,
    ) -> Self {
        #[cfg(debug_assertions)]
        {
            assert!(entry > 0.0, "signal entry must be positive, got {entry}");
            match side {
                Side::Long => assert!(
                    stop_loss < entry,
                    "long signal stop_loss {stop_loss} must be < entry {entry}"
                ),
                Side::Short => assert!(
                    stop_loss > entry,
                    "short signal stop_loss {stop_loss} must be > entry {entry}"
                ),
            }
        }
        Self {
            symbol: symbol.into(),
            side,
            strategy,
            entry,
            level,
            stop_loss,
            confidence: confidence.clamp(0.0, 1.0),
            reason: reason.into(),
            meta,
            ts,
        }
    }

    pub fn stop_distance(&self) -> f64 {
        (self.entry - self.stop_loss).abs()
    }
}

// =============================================================================
// Order
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    StopLimit,
    PostOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderIntent {
    Entry,
    Exit,
    AddOn,
    Tp,
    Sl,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub client_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub qty: f64,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub status: OrderStatus,
    pub filled_qty: f64,
    pub avg_fill_price: f64,
    pub fees_usd: f64,
    pub reduce_only: bool,
    pub intent: OrderIntent,
    pub created_ts: i64,
    pub updated_ts: i64,
    pub parent_id: Option<String>,
    pub children: Vec<String>,
}

impl Order {
    pub fn new_client_id() -> String {
        Uuid::new_v4().to_string()
    }
}

// =============================================================================
// Position
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionState {
    Opening,
    Open,
    Reducing,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PositionMeta {
    pub trail_anchor: Option<f64>,
    pub breakeven_moved: bool,
    pub adds_done: u32,
    pub tp_rungs_executed: Vec<usize>,
    pub highest_high_since_entry: Option<f64>,
    pub lowest_low_since_entry: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub qty_open: f64,
    pub initial_qty: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit_levels: Vec<(f64, f64)>,
    pub realized_pnl_usd: f64,
    pub realized_pnl_r: f64,
    pub opened_ts: i64,
    pub mode: AccountMode,
    pub strategy: Strategy,
    pub state: PositionState,
    pub origin_signal_id: Option<String>,
    pub meta: PositionMeta,
    /// Risk distance at entry (|entry - initial stop|), used as the R-unit
    /// denominator for `realized_pnl_r` and for chandelier/time-stop math.
    pub initial_stop_distance: f64,
}

impl Position {
    /// `qty_open == 0 ⇔ state == Closed`.
    pub fn invariant_holds(&self) -> bool {
        let closed_iff_empty = (self.state == PositionState::Closed) == (self.qty_open <= 1e-12);
        let bounded = self.qty_open >= -1e-9 && self.qty_open <= self.initial_qty + 1e-9;
        closed_iff_empty && bounded
    }

    pub fn current_pnl_r(&self, current_price: f64) -> f64 {
        if self.initial_stop_distance <= 0.0 {
            return 0.0;
        }
        let raw = match self.side {
            Side::Long => current_price - self.entry_price,
            Side::Short => self.entry_price - current_price,
        };
        raw / self.initial_stop_distance
    }
}

// =============================================================================
// RiskMetrics
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskMetrics {
    pub account_equity: f64,
    pub daily_pnl_usd: f64,
    pub daily_pnl_r: f64,
    pub peak_equity: f64,
    pub current_drawdown_r: f64,
    pub consecutive_losses: u32,
    pub open_positions: u32,
    pub daily_risk_used_pct: f64,
    pub kill_switch_active: bool,
    pub reason: Option<String>,
}

// =============================================================================
// DiagnosticEvent / FSMTransition
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticEvent {
    pub ts: i64,
    pub component: String,
    pub stage: String,
    pub symbol: Option<String>,
    pub payload: serde_json::Value,
    pub reason: Option<String>,
    pub passed: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FSMTransition {
    pub from: String,
    pub to: String,
    pub reason: String,
    pub ts: i64,
    pub metadata: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_invariants_long() {
        let s = Signal::new(
            "BTCUSDT",
            Side::Long,
            Strategy::Momentum,
            50000.0,
            49800.0,
            49700.0,
            0.7,
            "breakout",
            serde_json::json!({}),
            0,
        );
        assert!(s.stop_loss < s.entry);
        assert!(s.stop_distance() > 0.0);
    }

    #[test]
    #[should_panic]
    fn signal_invariant_violation_panics_in_debug() {
        let _ = Signal::new(
            "BTCUSDT",
            Side::Long,
            Strategy::Momentum,
            50000.0,
            49800.0,
            50100.0, // invalid: sl > entry for a long
            0.7,
            "bad",
            serde_json::json!({}),
            0,
        );
    }

    #[test]
    fn scan_result_passed_all_filters_iff_conjunction() {
        let mut filter_results = std::collections::BTreeMap::new();
        filter_results.insert("liquidity".to_string(), true);
        filter_results.insert("volatility".to_string(), true);
        filter_results.insert("correlation".to_string(), false);
        let r = ScanResult {
            symbol: "BTCUSDT".into(),
            score: 0.0,
            rank: 0,
            market_data: MarketData {
                symbol: "BTCUSDT".into(),
                price: 1.0,
                volume_24h_usd: 0.0,
                oi_usd: None,
                trades_per_minute: 0.0,
                atr_5m: 0.0,
                atr_15m: 0.0,
                bb_width_pct: 0.0,
                btc_correlation: 0.0,
                vol_surge_1h: 0.0,
                vol_surge_5m: 0.0,
                oi_delta: None,
                l2_depth: None,
                ts: 0,
            },
            filter_results,
            filter_details: Default::default(),
            score_components: Default::default(),
            levels: vec![],
            ts: 0,
        };
        assert!(!r.passed_all_filters());
    }

    #[test]
    fn position_invariant_closed_iff_qty_zero() {
        let mut p = Position {
            id: "p1".into(),
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            qty_open: 1.0,
            initial_qty: 1.0,
            entry_price: 100.0,
            stop_loss: 95.0,
            take_profit_levels: vec![],
            realized_pnl_usd: 0.0,
            realized_pnl_r: 0.0,
            opened_ts: 0,
            mode: AccountMode::Paper,
            strategy: Strategy::Momentum,
            state: PositionState::Open,
            origin_signal_id: None,
            meta: PositionMeta::default(),
            initial_stop_distance: 5.0,
        };
        assert!(p.invariant_holds());
        p.qty_open = 0.0;
        p.state = PositionState::Open; // wrong: should be Closed
        assert!(!p.invariant_holds());
        p.state = PositionState::Closed;
        assert!(p.invariant_holds());
    }

    #[test]
    fn orderbook_depth_within_band() {
        let book = OrderBookSnapshot {
            symbol: "BTCUSDT".into(),
            bids: vec![
                BookLevel { price: 100.0, size: 1.0 },
                BookLevel { price: 99.0, size: 1.0 },
            ],
            asks: vec![
                BookLevel { price: 101.0, size: 1.0 },
                BookLevel { price: 105.0, size: 1.0 },
            ],
            sequence_id: 1,
            ts: 0,
        };
        assert_eq!(book.best_bid(), Some(100.0));
        assert_eq!(book.best_ask(), Some(101.0));
        let depth = book.to_l2_depth().unwrap();
        assert!(depth.spread_bps > 0.0);
    }
}
