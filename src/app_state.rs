// =============================================================================
// Central Application State
// =============================================================================
//
// The single source of truth for the engine. All subsystems hold Arc
// references to their own state; AppState ties them together and provides a
// unified snapshot for the dashboard API and WebSocket feed.
//
// Thread safety:
//   - Atomic counters for lock-free version tracking.
//   - parking_lot::RwLock for all mutable shared collections.
//   - Arc wrappers for subsystem engines that manage their own interior
//     mutability.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::config::{SystemConfig, TradingPreset};
use crate::decision_envelope::DecisionEnvelope;
use crate::diagnostics::DiagnosticCollector;
use crate::market_data::{Candle, CandleBuffer, OrderBookManager, TradeStreamProcessor};
use crate::metrics::MetricsRegistry;
use crate::persistence::PositionStore;
use crate::position_engine::PositionManager;
use crate::regime::RegimeDetector;
use crate::risk::RiskEngine;
use crate::signals::{ScoringResult, SignalDecayManager, VPINState, WeightedScorer};
use crate::types::{BalanceInfo, Position, ScanResult};

// =============================================================================
// Error Record
// =============================================================================

/// A recorded error event for the dashboard error log.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    /// Human-readable error message.
    pub message: String,
    /// Component that raised it, from `EngineError::component()`.
    pub component: Option<String>,
    /// ISO 8601 timestamp.
    pub at: String,
}

// =============================================================================
// AppState
// =============================================================================

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;
/// Maximum number of recent decisions to retain.
const MAX_RECENT_DECISIONS: usize = 100;

/// Central application state shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    // ── Version tracking ────────────────────────────────────────────────
    /// Monotonically increasing version counter. Incremented on every
    /// meaningful state mutation. The WebSocket feed uses this to detect
    /// changes and push updates.
    pub state_version: AtomicU64,

    /// WebSocket message sequence number (incremented per message sent).
    pub ws_sequence_number: AtomicU64,
    /// Whether a dashboard client currently holds the WebSocket open.
    pub ws_user_connected: RwLock<bool>,
    /// Timestamp of the last client-originated WebSocket/heartbeat activity.
    pub last_ws_user_event: RwLock<std::time::Instant>,

    // ── Configuration ───────────────────────────────────────────────────
    pub system_config: Arc<RwLock<SystemConfig>>,
    pub preset: Arc<RwLock<TradingPreset>>,

    // ── Market Data ─────────────────────────────────────────────────────
    pub candle_buffer: Arc<CandleBuffer>,
    pub trade_processors: RwLock<HashMap<String, Arc<TradeStreamProcessor>>>,
    pub orderbook_manager: Arc<OrderBookManager>,

    /// Most recent scanner output, consumed by LEVEL_BUILDING/SIGNAL_WAIT/
    /// SIZING without re-running the scan.
    pub last_scan: RwLock<Option<Vec<ScanResult>>>,
    /// Candle history fetched for the symbols in `last_scan`, keyed by
    /// symbol, so downstream cycle stages avoid re-reading the buffer.
    pub last_candles_by_symbol: RwLock<HashMap<String, Vec<Candle>>>,

    // ── Risk ────────────────────────────────────────────────────────────
    pub risk_engine: Arc<RiskEngine>,

    // ── Positions ───────────────────────────────────────────────────────
    pub position_manager: Arc<PositionManager>,

    // ── Regime Detection ────────────────────────────────────────────────
    pub regime_detector: Arc<RegimeDetector>,

    // ── Signal Pipeline ─────────────────────────────────────────────────
    pub weighted_scorer: Arc<RwLock<WeightedScorer>>,
    pub signal_decay: Arc<SignalDecayManager>,
    pub vpin_states: RwLock<HashMap<String, VPINState>>,
    pub last_scoring: RwLock<Option<ScoringResult>>,

    // ── Account / Exchange ──────────────────────────────────────────────
    pub balances: RwLock<Vec<BalanceInfo>>,

    // ── Decision Audit Trail ────────────────────────────────────────────
    pub recent_decisions: RwLock<Vec<DecisionEnvelope>>,

    // ── Error Log ───────────────────────────────────────────────────────
    pub recent_errors: RwLock<Vec<ErrorRecord>>,

    // ── Operational Status ──────────────────────────────────────────────
    pub no_go_reason: RwLock<Option<String>>,
    pub last_reconcile_ok: RwLock<Option<std::time::Instant>>,
    pub last_reconcile_error: RwLock<Option<String>>,

    // ── Futures Intelligence ────────────────────────────────────────────
    pub futures_intel: RwLock<HashMap<String, serde_json::Value>>,

    // ── Diagnostics & Metrics ────────────────────────────────────────────
    pub diagnostics: Arc<DiagnosticCollector>,
    pub metrics: Arc<MetricsRegistry>,

    // ── Persistence ─────────────────────────────────────────────────────
    pub position_store: Arc<PositionStore>,

    // ── Timing ──────────────────────────────────────────────────────────
    /// Instant when the engine was started. Used for uptime calculations.
    pub start_time: std::time::Instant,
}

impl AppState {
    /// Construct a new `AppState` from system settings and the active
    /// trading preset. All subsystems are initialised with values derived
    /// from `preset`; the returned value is typically wrapped in `Arc`
    /// immediately.
    pub fn new(system: SystemConfig, preset: TradingPreset) -> Self {
        let mut trade_processors = HashMap::new();
        for symbol in &system.symbols {
            trade_processors.insert(symbol.clone(), Arc::new(TradeStreamProcessor::new(symbol.clone())));
        }

        let risk_engine = RiskEngine::new(system.paper_starting_balance, preset.risk.clone());
        let position_manager = PositionManager::new(preset.position_config.clone(), preset.execution_config.taker_fee_bps);
        let position_store = match PositionStore::open(system.database_url.as_deref()) {
            Ok(store) => store,
            Err(e) => {
                tracing::error!(error = %e, "failed to open position store, persistence disabled");
                PositionStore::open(None).expect("disabled position store never fails to open")
            }
        };

        Self {
            state_version: AtomicU64::new(1),
            ws_sequence_number: AtomicU64::new(0),
            ws_user_connected: RwLock::new(false),
            last_ws_user_event: RwLock::new(std::time::Instant::now()),

            system_config: Arc::new(RwLock::new(system)),
            preset: Arc::new(RwLock::new(preset)),

            candle_buffer: Arc::new(CandleBuffer::new(500)),
            trade_processors: RwLock::new(trade_processors),
            orderbook_manager: Arc::new(OrderBookManager::new()),

            last_scan: RwLock::new(None),
            last_candles_by_symbol: RwLock::new(HashMap::new()),

            risk_engine: Arc::new(risk_engine),
            position_manager: Arc::new(position_manager),

            regime_detector: RegimeDetector::new(),
            weighted_scorer: Arc::new(RwLock::new(WeightedScorer::default())),
            signal_decay: Arc::new(SignalDecayManager::default()),
            vpin_states: RwLock::new(HashMap::new()),
            last_scoring: RwLock::new(None),

            balances: RwLock::new(Vec::new()),
            recent_decisions: RwLock::new(Vec::new()),
            recent_errors: RwLock::new(Vec::new()),

            no_go_reason: RwLock::new(None),
            last_reconcile_ok: RwLock::new(None),
            last_reconcile_error: RwLock::new(None),

            futures_intel: RwLock::new(HashMap::new()),

            diagnostics: Arc::new(DiagnosticCollector::default()),
            metrics: Arc::new(MetricsRegistry::new()),

            position_store: Arc::new(position_store),

            start_time: std::time::Instant::now(),
        }
    }

    // ── Version Management ──────────────────────────────────────────────

    /// Atomically increment the state version. Call this after every
    /// meaningful mutation to signal WebSocket clients that fresh data is
    /// available.
    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    /// Read the current state version without modifying it.
    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Error Logging ───────────────────────────────────────────────────

    /// Record an error message. The ring buffer is capped at
    /// [`MAX_RECENT_ERRORS`]; oldest entries are evicted when the limit is
    /// reached.
    pub fn push_error(&self, msg: String) {
        self.push_error_with_component(msg, None);
    }

    /// Record an error with the originating component name.
    pub fn push_error_with_component(&self, msg: String, component: Option<String>) {
        let record = ErrorRecord {
            message: msg,
            component,
            at: Utc::now().to_rfc3339(),
        };

        let mut errors = self.recent_errors.write();
        errors.push(record);
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }

        self.increment_version();
    }

    /// Record an `EngineError`, tagging the error log entry with its
    /// component so the dashboard can group failures by subsystem.
    pub fn push_engine_error(&self, err: &crate::error::EngineError) {
        self.push_error_with_component(err.to_string(), Some(err.component().to_string()));
    }

    // ── Decision Audit ──────────────────────────────────────────────────

    /// Record a decision envelope. The ring buffer is capped at
    /// [`MAX_RECENT_DECISIONS`]; oldest entries are evicted when the limit
    /// is reached.
    pub fn push_decision(&self, envelope: DecisionEnvelope) {
        let mut decisions = self.recent_decisions.write();
        decisions.push(envelope);
        while decisions.len() > MAX_RECENT_DECISIONS {
            decisions.remove(0);
        }

        self.increment_version();
    }

    // ── Snapshot Builder ────────────────────────────────────────────────

    /// Build a complete, serialisable snapshot of the entire engine state.
    ///
    /// This is the payload sent to the dashboard via the REST
    /// `GET /api/v1/state` endpoint and the WebSocket push feed.
    pub fn build_snapshot(&self) -> StateSnapshot {
        let now = Utc::now();
        let system = self.system_config.read();
        let preset = self.preset.read();
        let version = self.current_state_version();

        let reconcile_last_ok_age_s = self.last_reconcile_ok.read().map(|t| t.elapsed().as_secs());
        let risk = self.risk_engine.snapshot();

        let truth = TruthHeader {
            reconcile_last_ok_age_s,
            reconcile_last_error: self.last_reconcile_error.read().clone(),
            no_go_reason: self.no_go_reason.read().clone(),
            state_version: version,
            ws_sequence_number: self.ws_sequence_number.load(Ordering::Relaxed),
            trading_mode: system.trading_mode.to_string(),
            account_mode: system.account_mode.to_string(),
            kill_switch_active: risk.kill_switch_active,
            server_time: now.timestamp_millis(),
        };

        let positions = self.position_manager.open_positions();
        let recent_decisions = self.recent_decisions.read().clone();

        let system_config_summary = SystemConfigSummary {
            trading_mode: system.trading_mode.to_string(),
            account_mode: system.account_mode.to_string(),
            symbols: system.symbols.clone(),
            max_concurrent_positions: preset.risk.max_concurrent_positions,
            daily_risk_limit: preset.risk.daily_risk_limit,
            max_consecutive_losses: preset.risk.max_consecutive_losses,
            preset_name: preset.name.clone(),
        };

        let balances = self.balances.read().clone();
        let recent_errors = self.recent_errors.read().clone();
        let market_data = self.build_market_data_snapshot(&system.symbols);

        let regime = self.regime_detector.current_regime().map(|rs| RegimeSnapshot {
            regime: rs.regime.to_string(),
            adx: Some(rs.adx),
            bbw: Some(rs.bbw),
            hurst: Some(rs.hurst),
            entropy: Some(rs.entropy),
            regime_age_seconds: Some(rs.regime_age_secs),
        });

        let scoring = self.last_scoring.read().clone();

        let vpin = {
            let states = self.vpin_states.read();
            if states.is_empty() { None } else { Some(states.clone()) }
        };

        let futures_intel = {
            let intel = self.futures_intel.read();
            if intel.is_empty() { None } else { Some(intel.clone()) }
        };

        let closed_positions = self.position_manager.closed_positions(500);
        let journal_stats = if closed_positions.is_empty() {
            None
        } else {
            let total_trades = closed_positions.len();
            let wins = closed_positions.iter().filter(|p| p.realized_pnl_usd > 0.0).count();
            let win_rate = wins as f64 / total_trades as f64;
            let total_net_pnl: f64 = closed_positions.iter().map(|p| p.realized_pnl_usd).sum();
            let gross_profit: f64 = closed_positions.iter().map(|p| p.realized_pnl_usd).filter(|&p| p > 0.0).sum();
            let gross_loss: f64 = closed_positions
                .iter()
                .map(|p| p.realized_pnl_usd)
                .filter(|&p| p < 0.0)
                .map(f64::abs)
                .sum();
            let profit_factor = if gross_loss > 0.0 {
                gross_profit / gross_loss
            } else if gross_profit > 0.0 {
                f64::INFINITY
            } else {
                0.0
            };
            Some(JournalStats { total_trades, win_rate, total_net_pnl, profit_factor })
        };

        StateSnapshot {
            state_version: version,
            server_time: now.timestamp_millis(),
            truth,
            positions,
            recent_decisions,
            risk,
            system_config: system_config_summary,
            balances: Some(balances),
            recent_errors: Some(recent_errors),
            market_data: Some(market_data),
            regime,
            scoring,
            vpin,
            futures_intel,
            journal_stats,
        }
    }

    /// Build market data snapshots for each tracked symbol.
    fn build_market_data_snapshot(&self, symbols: &[String]) -> MarketDataSnapshot {
        let mut symbol_data = HashMap::new();
        let trade_procs = self.trade_processors.read();

        for symbol in symbols {
            let last_price = trade_procs.get(symbol).map(|tp| tp.last_price()).unwrap_or(0.0);
            let cvd = trade_procs.get(symbol).map(|tp| tp.cvd()).unwrap_or(0.0);
            let buy_volume_ratio = trade_procs.get(symbol).map(|tp| tp.buy_volume_ratio()).unwrap_or(0.5);
            let orderbook_imbalance = self.orderbook_manager.imbalance(symbol).unwrap_or(0.0);
            let spread_bps = self.orderbook_manager.spread_bps(symbol);

            symbol_data.insert(
                symbol.clone(),
                SymbolMarketData { last_price, spread_bps, cvd, orderbook_imbalance, buy_volume_ratio },
            );
        }

        MarketDataSnapshot { symbols: symbol_data }
    }
}

// =============================================================================
// Serialisable snapshot types
// =============================================================================

/// Full engine state snapshot sent to the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub truth: TruthHeader,
    pub positions: Vec<Position>,
    pub recent_decisions: Vec<DecisionEnvelope>,
    pub risk: crate::types::RiskMetrics,
    pub system_config: SystemConfigSummary,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub balances: Option<Vec<BalanceInfo>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub recent_errors: Option<Vec<ErrorRecord>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub market_data: Option<MarketDataSnapshot>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub regime: Option<RegimeSnapshot>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub scoring: Option<ScoringResult>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub vpin: Option<HashMap<String, VPINState>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub futures_intel: Option<HashMap<String, serde_json::Value>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub journal_stats: Option<JournalStats>,
}

/// Operational truth header — the dashboard's primary status banner.
#[derive(Debug, Clone, Serialize)]
pub struct TruthHeader {
    pub reconcile_last_ok_age_s: Option<u64>,
    pub reconcile_last_error: Option<String>,
    pub no_go_reason: Option<String>,
    pub state_version: u64,
    pub ws_sequence_number: u64,
    pub trading_mode: String,
    pub account_mode: String,
    pub kill_switch_active: bool,
    pub server_time: i64,
}

/// Summary of system settings and the active preset's risk envelope, for
/// the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct SystemConfigSummary {
    pub trading_mode: String,
    pub account_mode: String,
    pub symbols: Vec<String>,
    pub max_concurrent_positions: u32,
    pub daily_risk_limit: f64,
    pub max_consecutive_losses: u32,
    pub preset_name: String,
}

/// Market data for all tracked symbols.
#[derive(Debug, Clone, Serialize)]
pub struct MarketDataSnapshot {
    pub symbols: HashMap<String, SymbolMarketData>,
}

/// Per-symbol market data indicators.
#[derive(Debug, Clone, Serialize)]
pub struct SymbolMarketData {
    pub last_price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spread_bps: Option<f64>,
    pub cvd: f64,
    pub orderbook_imbalance: f64,
    pub buy_volume_ratio: f64,
}

/// Regime detection snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct RegimeSnapshot {
    pub regime: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adx: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bbw: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hurst: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entropy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regime_age_seconds: Option<f64>,
}

/// Trade journal aggregate statistics.
#[derive(Debug, Clone, Serialize)]
pub struct JournalStats {
    pub total_trades: usize,
    pub win_rate: f64,
    pub total_net_pnl: f64,
    pub profit_factor: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_app_state_starts_with_no_open_positions_and_version_one() {
        let state = AppState::new(SystemConfig::default(), TradingPreset::default());
        assert_eq!(state.current_state_version(), 1);
        assert!(state.position_manager.open_positions().is_empty());
    }

    #[test]
    fn build_snapshot_reports_configured_symbols() {
        let mut system = SystemConfig::default();
        system.symbols = vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()];
        let state = AppState::new(system, TradingPreset::default());
        let snapshot = state.build_snapshot();
        assert_eq!(snapshot.system_config.symbols.len(), 2);
        assert!(snapshot.market_data.unwrap().symbols.contains_key("BTCUSDT"));
    }

    #[test]
    fn push_error_caps_at_max_recent_errors() {
        let state = AppState::new(SystemConfig::default(), TradingPreset::default());
        for i in 0..(MAX_RECENT_ERRORS + 10) {
            state.push_error(format!("error {i}"));
        }
        assert_eq!(state.recent_errors.read().len(), MAX_RECENT_ERRORS);
    }

    #[test]
    fn increment_version_is_monotonic() {
        let state = AppState::new(SystemConfig::default(), TradingPreset::default());
        let v1 = state.increment_version();
        let v2 = state.increment_version();
        assert!(v2 > v1);
    }
}
