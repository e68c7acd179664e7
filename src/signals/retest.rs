// =============================================================================
// Retest strategy — pierce-and-reclaim entries at a known level
// =============================================================================
//
// Where momentum wants a clean break, retest wants the opposite: the bar
// pierces through the level, then closes back on the side it came from. Order
// flow (L2 imbalance) and distance from fair value (VWAP gap, in ATRs) gate
// the entry the way `smart_filters.rs`'s sequential checks gate a trade —
// each condition independently disqualifying, none compensating for another.
// =============================================================================

use crate::config::SignalConfig;
use crate::market_data::Candle;
use crate::types::{L2Depth, Side, Signal, Strategy, TradingLevel};

// A retest only makes sense against a level that was actually broken
// recently; beyond this many bars the level is stale context, not a level
// currently being retested.
const BREAKOUT_LOOKBACK_BARS: usize = 60;

/// True if some bar (excluding the current entry bar) within the trailing
/// lookback window already cleared the level in `breakout_side`'s direction
/// — i.e. a breakout was actually recorded for this level before we treat a
/// later bar as retesting it.
fn breakout_recorded(candles: &[Candle], level: &TradingLevel, breakout_side: Side, epsilon: f64) -> bool {
    if candles.len() < 2 {
        return false;
    }
    let history = &candles[..candles.len() - 1];
    let window_start = history.len().saturating_sub(BREAKOUT_LOOKBACK_BARS);
    history[window_start..].iter().any(|c| match breakout_side {
        Side::Long => c.close > level.price * (1.0 + epsilon),
        Side::Short => c.close < level.price * (1.0 - epsilon),
    })
}

/// Attempts to build a retest entry signal from the most recently closed bar
/// against a detected level. `vwap` is the session (or rolling) volume
/// weighted average price; `l2_depth`, when available, confirms the retest
/// with resting order flow on the side being entered. `trades_per_minute` is
/// the trailing trade rate, used to confirm the retest window is actually
/// liquid rather than thin/stale.
pub fn evaluate(
    symbol: &str,
    candles: &[Candle],
    level: &TradingLevel,
    side: Side,
    atr_5m: f64,
    vwap: f64,
    l2_depth: Option<&L2Depth>,
    trades_per_minute: f64,
    config: &SignalConfig,
    ts: i64,
) -> Option<Signal> {
    let entry_bar = candles.last()?;
    if atr_5m <= 0.0 {
        return None;
    }

    // Prerequisite: a breakout must actually have happened at this level
    // within the bounded lookback before we treat this bar as a retest of it.
    if !breakout_recorded(candles, level, side.mirror(), config.momentum_epsilon) {
        return None;
    }

    // Condition 4: trade activity must be sustained, not a thin/illiquid tape.
    if trades_per_minute < config.retest_min_trades_per_minute {
        return None;
    }

    // Condition 1: the bar pierces the level (wick beyond it) but closes
    // back on the originating side, within a bounded pierce depth.
    let pierce_tolerance = level.price.abs() * config.retest_pierce_tolerance;
    let max_pierce = atr_5m * config.retest_max_pierce_atr;
    let (pierced, reclaimed, pierce_depth) = match side {
        Side::Long => {
            let pierce = level.price - entry_bar.low;
            (
                entry_bar.low < level.price - pierce_tolerance,
                entry_bar.close > level.price,
                pierce,
            )
        }
        Side::Short => {
            let pierce = entry_bar.high - level.price;
            (
                entry_bar.high > level.price + pierce_tolerance,
                entry_bar.close < level.price,
                pierce,
            )
        }
    };
    if !pierced || !reclaimed || pierce_depth <= 0.0 || pierce_depth > max_pierce {
        return None;
    }

    // Condition 2: resting order flow must lean toward the entry direction.
    if let Some(depth) = l2_depth {
        let aligned = match side {
            Side::Long => depth.imbalance >= config.l2_imbalance_threshold,
            Side::Short => depth.imbalance <= -config.l2_imbalance_threshold,
        };
        if !aligned {
            return None;
        }
    }

    // Condition 3: the entry can't be chasing price too far from fair value.
    if vwap > 0.0 {
        let vwap_gap_atr = (entry_bar.close - vwap).abs() / atr_5m;
        if vwap_gap_atr > config.vwap_gap_max_atr {
            return None;
        }
    }

    let stop_loss = match side {
        Side::Long => entry_bar.low - atr_5m * 0.25,
        Side::Short => entry_bar.high + atr_5m * 0.25,
    };
    if (side == Side::Long && stop_loss >= entry_bar.close) || (side == Side::Short && stop_loss <= entry_bar.close) {
        return None;
    }

    let confidence = (1.0 - (pierce_depth / max_pierce)).clamp(0.0, 1.0);
    Some(Signal::new(
        symbol,
        side,
        Strategy::Retest,
        entry_bar.close,
        level.price,
        stop_loss,
        confidence,
        format!("retest reclaim: pierce {pierce_depth:.4}, max {max_pierce:.4}"),
        serde_json::json!({
            "pierce_depth": pierce_depth,
            "max_pierce": max_pierce,
            "l2_imbalance": l2_depth.map(|d| d.imbalance),
        }),
        ts,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            open_time: 0,
            close_time: 0,
            open,
            high,
            low,
            close,
            volume: 10.0,
            quote_volume: 1000.0,
            trades_count: 5,
            taker_buy_volume: 5.0,
            taker_buy_quote_volume: 500.0,
            is_closed: true,
        }
    }

    fn support_level() -> TradingLevel {
        TradingLevel {
            price: 100.0,
            level_type: crate::types::LevelType::Support,
            touch_count: 4,
            strength: 0.6,
            first_touch_ts: 0,
            last_touch_ts: 0,
            base_height: Some(1.0),
        }
    }

    fn with_prior_breakdown(entry: Candle) -> Vec<Candle> {
        vec![candle(100.0, 100.1, 98.5, 98.8), entry]
    }

    #[test]
    fn pierce_and_reclaim_produces_long_signal() {
        let candles = with_prior_breakdown(candle(100.5, 100.8, 99.8, 100.4));
        let level = support_level();
        let signal = evaluate(
            "BTCUSDT",
            &candles,
            &level,
            Side::Long,
            1.0,
            100.3,
            None,
            20.0,
            &SignalConfig::default(),
            0,
        );
        assert!(signal.is_some());
    }

    #[test]
    fn no_reclaim_rejects_signal() {
        let candles = with_prior_breakdown(candle(100.5, 100.8, 99.0, 99.2));
        let level = support_level();
        let signal = evaluate(
            "BTCUSDT",
            &candles,
            &level,
            Side::Long,
            1.0,
            100.3,
            None,
            20.0,
            &SignalConfig::default(),
            0,
        );
        assert!(signal.is_none());
    }

    #[test]
    fn opposing_l2_imbalance_rejects_signal() {
        let candles = with_prior_breakdown(candle(100.5, 100.8, 99.8, 100.4));
        let level = support_level();
        let depth = L2Depth {
            bid_usd_0_3pct: 0.0,
            ask_usd_0_3pct: 0.0,
            bid_usd_0_5pct: 10_000.0,
            ask_usd_0_5pct: 100_000.0,
            spread_bps: 3.0,
            imbalance: -0.8,
        };
        let signal = evaluate(
            "BTCUSDT",
            &candles,
            &level,
            Side::Long,
            1.0,
            100.3,
            Some(&depth),
            20.0,
            &SignalConfig::default(),
            0,
        );
        assert!(signal.is_none());
    }

    #[test]
    fn excessive_vwap_gap_rejects_signal() {
        let candles = with_prior_breakdown(candle(100.5, 100.8, 99.8, 100.4));
        let level = support_level();
        let signal = evaluate(
            "BTCUSDT",
            &candles,
            &level,
            Side::Long,
            1.0,
            150.0,
            None,
            20.0,
            &SignalConfig::default(),
            0,
        );
        assert!(signal.is_none());
    }

    #[test]
    fn no_prior_breakout_rejects_signal() {
        let candles = vec![candle(100.5, 100.8, 99.8, 100.4)];
        let level = support_level();
        let signal = evaluate(
            "BTCUSDT",
            &candles,
            &level,
            Side::Long,
            1.0,
            100.3,
            None,
            20.0,
            &SignalConfig::default(),
            0,
        );
        assert!(signal.is_none());
    }

    #[test]
    fn thin_tape_rejects_signal() {
        let candles = with_prior_breakdown(candle(100.5, 100.8, 99.8, 100.4));
        let level = support_level();
        let signal = evaluate(
            "BTCUSDT",
            &candles,
            &level,
            Side::Long,
            1.0,
            100.3,
            None,
            5.0,
            &SignalConfig::default(),
            0,
        );
        assert!(signal.is_none());
    }
}
