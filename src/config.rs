// =============================================================================
// Configuration — the TradingPreset aggregate and system-wide settings
// =============================================================================
//
// Every tunable lives in a flat composition of small value records
// referenced from `TradingPreset`, replacing a deep "*Config" inheritance
// chain with enumerated, range-validated fields (see the re-architecture
// notes). All fields carry `#[serde(default = "...")]` so an older preset
// JSON missing newer fields still loads; unrecognized keys are warned about,
// never rejected, via `warn_unknown_fields`.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::EngineError;
use crate::types::{AccountMode, TradingMode};

// =============================================================================
// Default-value helpers
// =============================================================================

fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}

fn default_symbols() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "SOLUSDT".to_string(),
    ]
}

// risk
fn default_risk_per_trade() -> f64 {
    0.015
}
fn default_max_concurrent_positions() -> u32 {
    3
}
fn default_daily_risk_limit() -> f64 {
    0.03
}
fn default_kill_switch_loss_limit() -> f64 {
    0.1
}
fn default_correlation_limit() -> f64 {
    0.7
}
fn default_max_consecutive_losses() -> u32 {
    5
}

// liquidity_filters
fn default_min_24h_volume_usd() -> f64 {
    20_000_000.0
}
fn default_max_spread_bps() -> f64 {
    10.0
}
fn default_min_depth_usd_0_5pct() -> f64 {
    150_000.0
}
fn default_min_depth_usd_0_3pct() -> f64 {
    100_000.0
}
fn default_min_trades_per_minute() -> f64 {
    20.0
}

// volatility_filters
fn default_atr_range_min() -> f64 {
    0.002
}
fn default_atr_range_max() -> f64 {
    0.05
}
fn default_bb_width_percentile_max() -> f64 {
    0.15
}
fn default_volume_surge_min() -> f64 {
    1.5
}

// signal_config
fn default_momentum_volume_multiplier() -> f64 {
    2.0
}
fn default_momentum_body_ratio_min() -> f64 {
    0.6
}
fn default_momentum_epsilon() -> f64 {
    0.0005
}
fn default_retest_pierce_tolerance() -> f64 {
    0.001
}
fn default_retest_max_pierce_atr() -> f64 {
    0.3
}
fn default_l2_imbalance_threshold() -> f64 {
    0.4
}
fn default_vwap_gap_max_atr() -> f64 {
    1.0
}
fn default_retest_min_trades_per_minute() -> f64 {
    15.0
}
fn default_min_stop_distance_ticks() -> f64 {
    2.0
}

// position_config
fn default_tp1_r() -> f64 {
    1.5
}
fn default_tp1_size_pct() -> f64 {
    0.4
}
fn default_tp2_r() -> f64 {
    2.8
}
fn default_tp2_size_pct() -> f64 {
    0.35
}
fn default_chandelier_atr_mult() -> f64 {
    3.0
}
fn default_max_hold_time_hours() -> f64 {
    24.0
}
fn default_add_on_max_size_pct() -> f64 {
    0.5
}
fn default_panic_exit_atr_mult() -> f64 {
    4.0
}

// scanner_config
fn default_max_candidates() -> u32 {
    10
}
fn default_scan_interval_seconds() -> u64 {
    30
}
pub(crate) fn default_score_weights() -> HashMap<String, f64> {
    let mut m = HashMap::new();
    m.insert("vol_surge".to_string(), 0.30);
    m.insert("oi_delta".to_string(), 0.15);
    m.insert("atr_quality".to_string(), 0.20);
    m.insert("correlation".to_string(), -0.15);
    m.insert("trades_per_minute".to_string(), 0.20);
    m
}

// execution_config
fn default_max_depth_fraction() -> f64 {
    0.1
}
fn default_twap_min_slices() -> u32 {
    3
}
fn default_twap_max_slices() -> u32 {
    10
}
fn default_twap_interval_seconds() -> u64 {
    5
}
fn default_iceberg_min_notional() -> f64 {
    50_000.0
}
fn default_limit_offset_bps() -> f64 {
    5.0
}
fn default_spread_widen_bps() -> f64 {
    15.0
}
fn default_deadman_timeout_ms() -> u64 {
    15_000
}
fn default_taker_fee_bps() -> f64 {
    5.0
}
fn default_maker_fee_bps() -> f64 {
    2.0
}

fn default_strategy_priority() -> StrategyPriority {
    StrategyPriority::Momentum
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyPriority {
    Momentum,
    Retest,
}

// =============================================================================
// Sub-records
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "default_risk_per_trade")]
    pub risk_per_trade: f64,
    #[serde(default = "default_max_concurrent_positions")]
    pub max_concurrent_positions: u32,
    #[serde(default = "default_daily_risk_limit")]
    pub daily_risk_limit: f64,
    #[serde(default)]
    pub max_position_size_usd: Option<f64>,
    #[serde(default = "default_kill_switch_loss_limit")]
    pub kill_switch_loss_limit: f64,
    #[serde(default = "default_correlation_limit")]
    pub correlation_limit: f64,
    #[serde(default = "default_max_consecutive_losses")]
    pub max_consecutive_losses: u32,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            risk_per_trade: default_risk_per_trade(),
            max_concurrent_positions: default_max_concurrent_positions(),
            daily_risk_limit: default_daily_risk_limit(),
            max_position_size_usd: None,
            kill_switch_loss_limit: default_kill_switch_loss_limit(),
            correlation_limit: default_correlation_limit(),
            max_consecutive_losses: default_max_consecutive_losses(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidityFilters {
    #[serde(default = "default_min_24h_volume_usd")]
    pub min_24h_volume_usd: f64,
    #[serde(default)]
    pub min_oi_usd: Option<f64>,
    #[serde(default = "default_max_spread_bps")]
    pub max_spread_bps: f64,
    #[serde(default = "default_min_depth_usd_0_5pct")]
    pub min_depth_usd_0_5pct: f64,
    #[serde(default = "default_min_depth_usd_0_3pct")]
    pub min_depth_usd_0_3pct: f64,
    #[serde(default = "default_min_trades_per_minute")]
    pub min_trades_per_minute: f64,
}

impl Default for LiquidityFilters {
    fn default() -> Self {
        Self {
            min_24h_volume_usd: default_min_24h_volume_usd(),
            min_oi_usd: None,
            max_spread_bps: default_max_spread_bps(),
            min_depth_usd_0_5pct: default_min_depth_usd_0_5pct(),
            min_depth_usd_0_3pct: default_min_depth_usd_0_3pct(),
            min_trades_per_minute: default_min_trades_per_minute(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolatilityFilters {
    #[serde(default = "default_atr_range_min")]
    pub atr_range_min: f64,
    #[serde(default = "default_atr_range_max")]
    pub atr_range_max: f64,
    #[serde(default = "default_bb_width_percentile_max")]
    pub bb_width_percentile_max: f64,
    #[serde(default = "default_volume_surge_min")]
    pub volume_surge_1h_min: f64,
    #[serde(default = "default_volume_surge_min")]
    pub volume_surge_5m_min: f64,
    #[serde(default)]
    pub oi_delta_threshold: Option<f64>,
}

impl Default for VolatilityFilters {
    fn default() -> Self {
        Self {
            atr_range_min: default_atr_range_min(),
            atr_range_max: default_atr_range_max(),
            bb_width_percentile_max: default_bb_width_percentile_max(),
            volume_surge_1h_min: default_volume_surge_min(),
            volume_surge_5m_min: default_volume_surge_min(),
            oi_delta_threshold: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalConfig {
    #[serde(default = "default_momentum_volume_multiplier")]
    pub momentum_volume_multiplier: f64,
    #[serde(default = "default_momentum_body_ratio_min")]
    pub momentum_body_ratio_min: f64,
    #[serde(default = "default_momentum_epsilon")]
    pub momentum_epsilon: f64,
    #[serde(default = "default_retest_pierce_tolerance")]
    pub retest_pierce_tolerance: f64,
    #[serde(default = "default_retest_max_pierce_atr")]
    pub retest_max_pierce_atr: f64,
    #[serde(default = "default_l2_imbalance_threshold")]
    pub l2_imbalance_threshold: f64,
    #[serde(default = "default_vwap_gap_max_atr")]
    pub vwap_gap_max_atr: f64,
    #[serde(default = "default_retest_min_trades_per_minute")]
    pub retest_min_trades_per_minute: f64,
    /// Minimum stop distance in exchange ticks; a signal whose stop is
    /// closer than this to entry is rejected at sizing time.
    #[serde(default = "default_min_stop_distance_ticks")]
    pub min_stop_distance_ticks: f64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            momentum_volume_multiplier: default_momentum_volume_multiplier(),
            momentum_body_ratio_min: default_momentum_body_ratio_min(),
            momentum_epsilon: default_momentum_epsilon(),
            retest_pierce_tolerance: default_retest_pierce_tolerance(),
            retest_max_pierce_atr: default_retest_max_pierce_atr(),
            l2_imbalance_threshold: default_l2_imbalance_threshold(),
            vwap_gap_max_atr: default_vwap_gap_max_atr(),
            retest_min_trades_per_minute: default_retest_min_trades_per_minute(),
            min_stop_distance_ticks: default_min_stop_distance_ticks(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionConfig {
    #[serde(default = "default_tp1_r")]
    pub tp1_r: f64,
    #[serde(default = "default_tp1_size_pct")]
    pub tp1_size_pct: f64,
    #[serde(default = "default_tp2_r")]
    pub tp2_r: f64,
    #[serde(default = "default_tp2_size_pct")]
    pub tp2_size_pct: f64,
    #[serde(default = "default_chandelier_atr_mult")]
    pub chandelier_atr_mult: f64,
    #[serde(default = "default_max_hold_time_hours")]
    pub max_hold_time_hours: f64,
    #[serde(default = "default_false")]
    pub add_on_enabled: bool,
    #[serde(default = "default_add_on_max_size_pct")]
    pub add_on_max_size_pct: f64,
    #[serde(default = "default_panic_exit_atr_mult")]
    pub panic_exit_atr_mult: f64,
}

impl Default for PositionConfig {
    fn default() -> Self {
        Self {
            tp1_r: default_tp1_r(),
            tp1_size_pct: default_tp1_size_pct(),
            tp2_r: default_tp2_r(),
            tp2_size_pct: default_tp2_size_pct(),
            chandelier_atr_mult: default_chandelier_atr_mult(),
            max_hold_time_hours: default_max_hold_time_hours(),
            add_on_enabled: false,
            add_on_max_size_pct: default_add_on_max_size_pct(),
            panic_exit_atr_mult: default_panic_exit_atr_mult(),
        }
    }
}

/// Returns the ordered TP ladder `(r_multiple, size_fraction)` derived from
/// the two configured rungs. A richer N-rung ladder could extend this to a
/// `Vec` field directly; two rungs is what every preset in this system uses.
impl PositionConfig {
    pub fn tp_ladder(&self) -> Vec<(f64, f64)> {
        vec![(self.tp1_r, self.tp1_size_pct), (self.tp2_r, self.tp2_size_pct)]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    #[serde(default = "default_max_candidates")]
    pub max_candidates: u32,
    #[serde(default = "default_scan_interval_seconds")]
    pub scan_interval_seconds: u64,
    #[serde(default = "default_score_weights")]
    pub score_weights: HashMap<String, f64>,
    #[serde(default)]
    pub symbol_whitelist: Option<Vec<String>>,
    #[serde(default)]
    pub symbol_blacklist: Option<Vec<String>>,
    #[serde(default)]
    pub top_n_by_volume: Option<u32>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            max_candidates: default_max_candidates(),
            scan_interval_seconds: default_scan_interval_seconds(),
            score_weights: default_score_weights(),
            symbol_whitelist: None,
            symbol_blacklist: None,
            top_n_by_volume: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_true")]
    pub enable_twap: bool,
    #[serde(default = "default_true")]
    pub enable_iceberg: bool,
    #[serde(default = "default_max_depth_fraction")]
    pub max_depth_fraction: f64,
    #[serde(default = "default_twap_min_slices")]
    pub twap_min_slices: u32,
    #[serde(default = "default_twap_max_slices")]
    pub twap_max_slices: u32,
    #[serde(default = "default_twap_interval_seconds")]
    pub twap_interval_seconds: u64,
    #[serde(default = "default_iceberg_min_notional")]
    pub iceberg_min_notional: f64,
    #[serde(default = "default_limit_offset_bps")]
    pub limit_offset_bps: f64,
    #[serde(default = "default_spread_widen_bps")]
    pub spread_widen_bps: f64,
    #[serde(default = "default_deadman_timeout_ms")]
    pub deadman_timeout_ms: u64,
    #[serde(default = "default_taker_fee_bps")]
    pub taker_fee_bps: f64,
    #[serde(default = "default_maker_fee_bps")]
    pub maker_fee_bps: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            enable_twap: true,
            enable_iceberg: true,
            max_depth_fraction: default_max_depth_fraction(),
            twap_min_slices: default_twap_min_slices(),
            twap_max_slices: default_twap_max_slices(),
            twap_interval_seconds: default_twap_interval_seconds(),
            iceberg_min_notional: default_iceberg_min_notional(),
            limit_offset_bps: default_limit_offset_bps(),
            spread_widen_bps: default_spread_widen_bps(),
            deadman_timeout_ms: default_deadman_timeout_ms(),
            taker_fee_bps: default_taker_fee_bps(),
            maker_fee_bps: default_maker_fee_bps(),
        }
    }
}

// =============================================================================
// TradingPreset
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingPreset {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub liquidity_filters: LiquidityFilters,
    #[serde(default)]
    pub volatility_filters: VolatilityFilters,
    #[serde(default)]
    pub signal_config: SignalConfig,
    #[serde(default)]
    pub position_config: PositionConfig,
    #[serde(default)]
    pub scanner_config: ScannerConfig,
    #[serde(default)]
    pub execution_config: ExecutionConfig,
    #[serde(default = "default_strategy_priority")]
    pub strategy_priority: StrategyPriority,
    #[serde(default)]
    pub correlation_limit: f64,
}

impl Default for TradingPreset {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            risk: RiskConfig::default(),
            liquidity_filters: LiquidityFilters::default(),
            volatility_filters: VolatilityFilters::default(),
            signal_config: SignalConfig::default(),
            position_config: PositionConfig::default(),
            scanner_config: ScannerConfig::default(),
            execution_config: ExecutionConfig::default(),
            strategy_priority: StrategyPriority::Momentum,
            correlation_limit: default_correlation_limit(),
        }
    }
}

impl TradingPreset {
    /// Validate every numeric range named in the configuration contract.
    /// Returns `EngineError::ConfigInvalid` with a descriptive reason on the
    /// first violation found.
    pub fn validate(&self) -> Result<(), EngineError> {
        let r = &self.risk;
        if !(0.0 < r.risk_per_trade && r.risk_per_trade <= 1.0) {
            return Err(EngineError::config_invalid(format!(
                "risk.risk_per_trade must be in (0,1], got {}",
                r.risk_per_trade
            )));
        }
        if !(1..=10).contains(&r.max_concurrent_positions) {
            return Err(EngineError::config_invalid(format!(
                "risk.max_concurrent_positions must be in [1,10], got {}",
                r.max_concurrent_positions
            )));
        }
        if !(0.0 < r.daily_risk_limit && r.daily_risk_limit <= 1.0) {
            return Err(EngineError::config_invalid(
                "risk.daily_risk_limit must be in (0,1]",
            ));
        }
        if !(0.0 < r.kill_switch_loss_limit && r.kill_switch_loss_limit <= 1.0) {
            return Err(EngineError::config_invalid(
                "risk.kill_switch_loss_limit must be in (0,1]",
            ));
        }
        if !(0.0..=1.0).contains(&r.correlation_limit) {
            return Err(EngineError::config_invalid(
                "risk.correlation_limit must be in [0,1]",
            ));
        }
        if !(1..=20).contains(&r.max_consecutive_losses) {
            return Err(EngineError::config_invalid(
                "risk.max_consecutive_losses must be in [1,20]",
            ));
        }

        let v = &self.volatility_filters;
        if v.atr_range_max <= v.atr_range_min {
            return Err(EngineError::config_invalid(
                "volatility_filters.atr_range_max must be > atr_range_min",
            ));
        }

        let s = &self.signal_config;
        if !(0.0..=1.0).contains(&s.momentum_body_ratio_min) {
            return Err(EngineError::config_invalid(
                "signal_config.momentum_body_ratio_min must be in [0,1]",
            ));
        }
        if !(0.0..=1.0).contains(&s.l2_imbalance_threshold) {
            return Err(EngineError::config_invalid(
                "signal_config.l2_imbalance_threshold must be in [0,1]",
            ));
        }

        let p = &self.position_config;
        if p.tp2_r <= p.tp1_r {
            return Err(EngineError::config_invalid(
                "position_config.tp2_r must be > tp1_r",
            ));
        }
        if !(0.0..=1.0).contains(&p.tp1_size_pct) || !(0.0..=1.0).contains(&p.tp2_size_pct) {
            return Err(EngineError::config_invalid(
                "position_config tp size fractions must be in [0,1]",
            ));
        }
        if p.tp1_size_pct + p.tp2_size_pct > 1.0 + 1e-9 {
            return Err(EngineError::config_invalid(
                "position_config tp1_size_pct + tp2_size_pct must be <= 1.0",
            ));
        }
        if !(0.0..=1.0).contains(&p.add_on_max_size_pct) {
            return Err(EngineError::config_invalid(
                "position_config.add_on_max_size_pct must be in [0,1]",
            ));
        }

        let sc = &self.scanner_config;
        if sc.max_candidates < 1 {
            return Err(EngineError::config_invalid(
                "scanner_config.max_candidates must be >= 1",
            ));
        }
        if sc.scan_interval_seconds < 1 {
            return Err(EngineError::config_invalid(
                "scanner_config.scan_interval_seconds must be >= 1",
            ));
        }
        let weight_sum: f64 = sc.score_weights.values().map(|w| w.abs()).sum();
        if (weight_sum - 1.0).abs() > 0.25 {
            warn!(
                weight_sum,
                "scanner_config.score_weights |sum| is far from 1.0 (validation warns, does not fail)"
            );
        }

        let e = &self.execution_config;
        if !(0.0 < e.max_depth_fraction && e.max_depth_fraction <= 1.0) {
            return Err(EngineError::config_invalid(
                "execution_config.max_depth_fraction must be in (0,1]",
            ));
        }
        if e.twap_min_slices > e.twap_max_slices {
            return Err(EngineError::config_invalid(
                "execution_config.twap_min_slices must be <= twap_max_slices",
            ));
        }
        if e.twap_interval_seconds == 0 {
            return Err(EngineError::config_invalid(
                "execution_config.twap_interval_seconds must be > 0",
            ));
        }
        if e.deadman_timeout_ms < 1000 {
            return Err(EngineError::config_invalid(
                "execution_config.deadman_timeout_ms must be >= 1000",
            ));
        }

        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read preset from {}", path.display()))?;
        let value: serde_json::Value = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse preset JSON from {}", path.display()))?;
        warn_unknown_fields(&value);
        let preset: Self = serde_json::from_value(value)
            .with_context(|| format!("failed to deserialize preset from {}", path.display()))?;
        preset
            .validate()
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("preset at {} failed validation", path.display()))?;
        info!(path = %path.display(), name = %preset.name, "trading preset loaded");
        Ok(preset)
    }
}

/// Warn (but never fail) on unrecognized top-level keys, matching the
/// configuration contract's "unknown fields cause a warning but do not
/// fail" rule.
fn warn_unknown_fields(value: &serde_json::Value) {
    const KNOWN: &[&str] = &[
        "name",
        "risk",
        "liquidity_filters",
        "volatility_filters",
        "signal_config",
        "position_config",
        "scanner_config",
        "execution_config",
        "strategy_priority",
        "correlation_limit",
    ];
    if let Some(obj) = value.as_object() {
        for key in obj.keys() {
            if !KNOWN.contains(&key.as_str()) {
                warn!(field = %key, "unrecognized preset field ignored");
            }
        }
    }
}

// =============================================================================
// System-wide settings (process scope)
// =============================================================================

fn default_paper_starting_balance() -> f64 {
    100_000.0
}
fn default_paper_slippage_bps() -> f64 {
    2.0
}
fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(default)]
    pub trading_mode: TradingMode,
    #[serde(default)]
    pub account_mode: AccountMode,
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,
    #[serde(default = "default_paper_starting_balance")]
    pub paper_starting_balance: f64,
    #[serde(default = "default_paper_slippage_bps")]
    pub paper_slippage_bps: f64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub database_url: Option<String>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            trading_mode: TradingMode::Paused,
            account_mode: AccountMode::Paper,
            symbols: default_symbols(),
            paper_starting_balance: default_paper_starting_balance(),
            paper_slippage_bps: default_paper_slippage_bps(),
            log_level: default_log_level(),
            database_url: None,
        }
    }
}

impl SystemConfig {
    /// Load system settings from environment variables, following the
    /// teacher's `dotenv` + env-var convention.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(mode) = std::env::var("TRADING_MODE") {
            cfg.trading_mode = match mode.to_lowercase().as_str() {
                "live" => TradingMode::Live,
                "killed" => TradingMode::Killed,
                _ => TradingMode::Paused,
            };
        }
        if let Ok(mode) = std::env::var("ACCOUNT_MODE") {
            cfg.account_mode = match mode.to_lowercase().as_str() {
                "live" => AccountMode::Live,
                _ => AccountMode::Paper,
            };
        }
        if let Ok(symbols) = std::env::var("SYMBOLS") {
            cfg.symbols = symbols.split(',').map(|s| s.trim().to_uppercase()).collect();
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            cfg.database_url = Some(url);
        }
        if let Ok(level) = std::env::var("RUST_LOG") {
            cfg.log_level = level;
        }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_preset_is_valid() {
        let preset = TradingPreset::default();
        assert!(preset.validate().is_ok());
    }

    #[test]
    fn tp2_must_exceed_tp1() {
        let mut preset = TradingPreset::default();
        preset.position_config.tp2_r = preset.position_config.tp1_r;
        assert!(preset.validate().is_err());
    }

    #[test]
    fn tp_size_fractions_must_not_exceed_one() {
        let mut preset = TradingPreset::default();
        preset.position_config.tp1_size_pct = 0.7;
        preset.position_config.tp2_size_pct = 0.5;
        assert!(preset.validate().is_err());
    }

    #[test]
    fn deserialize_empty_json_uses_defaults() {
        let preset: TradingPreset = serde_json::from_str("{}").unwrap();
        assert!(preset.validate().is_ok());
        assert_eq!(preset.strategy_priority, StrategyPriority::Momentum);
    }

    #[test]
    fn roundtrip_serialization() {
        let preset = TradingPreset::default();
        let json = serde_json::to_string(&preset).unwrap();
        let preset2: TradingPreset = serde_json::from_str(&json).unwrap();
        assert_eq!(preset.risk.risk_per_trade, preset2.risk.risk_per_trade);
    }

    #[test]
    fn twap_slice_bounds_validated() {
        let mut preset = TradingPreset::default();
        preset.execution_config.twap_min_slices = 10;
        preset.execution_config.twap_max_slices = 3;
        assert!(preset.validate().is_err());
    }
}
