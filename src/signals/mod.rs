// =============================================================================
// Signals Module
// =============================================================================
//
// Turns a scanner's `ScanResult` (candidate symbol + detected levels) into
// zero or more tradable `Signal`s. Two independent strategies run against
// every detected level:
//
// - `momentum`: the level breaks with volume and body conviction, entering
//   in the direction of the break.
// - `retest`: the level is pierced and then reclaimed on its originating
//   side, entering against the pierce (a failed-breakout fade).
//
// `vpin` and `signal_decay` stay diagnostic-only: they annotate a signal or
// a symbol's toxicity/freshness for risk and orchestration to read, but
// neither one can veto or produce a signal on its own.

pub mod momentum;
pub mod retest;
pub mod signal_decay;
pub mod vpin;
pub mod weighted_score;

pub use signal_decay::SignalDecayManager;
pub use vpin::{VPINCalculator, VPINState};
pub use weighted_score::{ScoringResult, SignalInput, WeightedScorer};

use crate::config::SignalConfig;
use crate::market_data::Candle;
use crate::types::{LevelType, ScanResult, Side, Signal};

const VWAP_WINDOW: usize = 20;

/// Volume-weighted average price over the trailing `VWAP_WINDOW` closed
/// candles, using typical price `(h+l+c)/3` per bar.
fn rolling_vwap(candles: &[Candle]) -> f64 {
    let window = &candles[candles.len().saturating_sub(VWAP_WINDOW)..];
    let mut pv = 0.0;
    let mut v = 0.0;
    for c in window {
        let typical = (c.high + c.low + c.close) / 3.0;
        pv += typical * c.volume;
        v += c.volume;
    }
    if v > 0.0 {
        pv / v
    } else {
        0.0
    }
}

/// Generates every momentum and retest signal a scan result's detected
/// levels support. A resistance level breaks upward (momentum long) or
/// fades back below it after a fakeout (retest short); a support level
/// mirrors that on the downside.
pub fn generate(result: &ScanResult, candles: &[Candle], config: &SignalConfig, now_ms: i64) -> Vec<Signal> {
    if candles.is_empty() {
        return Vec::new();
    }
    let atr_5m = result.market_data.atr_5m;
    let vwap = rolling_vwap(candles);
    let l2_depth = result.market_data.l2_depth.as_ref();

    let mut signals = Vec::new();
    for level in &result.levels {
        let (momentum_side, retest_side) = match level.level_type {
            LevelType::Resistance => (Side::Long, Side::Short),
            LevelType::Support => (Side::Short, Side::Long),
        };

        if let Some(signal) = momentum::evaluate(
            &result.symbol,
            candles,
            level,
            momentum_side,
            atr_5m,
            vwap,
            l2_depth,
            config,
            now_ms,
        ) {
            signals.push(signal);
        }
        if let Some(signal) = retest::evaluate(
            &result.symbol,
            candles,
            level,
            retest_side,
            atr_5m,
            vwap,
            l2_depth,
            result.market_data.trades_per_minute,
            config,
            now_ms,
        ) {
            signals.push(signal);
        }
    }
    signals
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{L2Depth, MarketData, TradingLevel};
    use std::collections::BTreeMap;

    fn candle(open: f64, high: f64, low: f64, close: f64, volume: f64) -> Candle {
        Candle {
            open_time: 0,
            close_time: 0,
            open,
            high,
            low,
            close,
            volume,
            quote_volume: volume * close,
            trades_count: 10,
            taker_buy_volume: volume / 2.0,
            taker_buy_quote_volume: volume * close / 2.0,
            is_closed: true,
        }
    }

    fn scan_result_with_level(level_type: LevelType) -> ScanResult {
        ScanResult {
            symbol: "BTCUSDT".to_string(),
            score: 1.0,
            rank: 1,
            market_data: MarketData {
                symbol: "BTCUSDT".to_string(),
                price: 100.0,
                volume_24h_usd: 10_000_000.0,
                oi_usd: Some(1_000_000.0),
                trades_per_minute: 30.0,
                atr_5m: 1.0,
                atr_15m: 1.5,
                bb_width_pct: 0.05,
                btc_correlation: 0.1,
                vol_surge_1h: 2.0,
                vol_surge_5m: 2.0,
                oi_delta: Some(0.1),
                l2_depth: Some(L2Depth::default()),
                ts: 0,
            },
            filter_results: BTreeMap::new(),
            filter_details: BTreeMap::new(),
            score_components: BTreeMap::new(),
            levels: vec![TradingLevel {
                price: 100.0,
                level_type,
                touch_count: 3,
                strength: 0.5,
                first_touch_ts: 0,
                last_touch_ts: 0,
                base_height: Some(1.0),
            }],
            ts: 0,
        }
    }

    #[test]
    fn no_candles_produces_no_signals() {
        let result = scan_result_with_level(LevelType::Resistance);
        assert!(generate(&result, &[], &SignalConfig::default(), 0).is_empty());
    }

    #[test]
    fn resistance_breakout_produces_momentum_long() {
        let result = scan_result_with_level(LevelType::Resistance);
        let mut candles: Vec<Candle> = (0..20).map(|_| candle(100.0, 100.5, 99.5, 100.0, 10.0)).collect();
        candles.push(candle(100.0, 102.0, 99.9, 101.9, 50.0));
        let signals = generate(&result, &candles, &SignalConfig::default(), 0);
        assert!(signals.iter().any(|s| s.strategy == crate::types::Strategy::Momentum && s.side == Side::Long));
    }
}
