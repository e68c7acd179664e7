// =============================================================================
// Momentum strategy — breakout-with-confirmation entries
// =============================================================================
//
// A level is broken with conviction when the bar that closes beyond it also
// shows above-average volume and a strong directional body. Mirrors the
// teacher's per-condition early-return style (`strategy.rs`'s pipeline of
// named checks) but expressed as the numbered conditions this strategy is
// defined by, rather than the teacher's proprietary gate stack.
// =============================================================================

use crate::config::SignalConfig;
use crate::market_data::Candle;
use crate::types::{L2Depth, Side, Signal, Strategy, TradingLevel};

const VOLUME_LOOKBACK: usize = 20;
// Candles passed in are 5-minute bars; two bars span the trailing 10 minutes
// used for the swing-low/high stop anchor.
const SWING_BARS_10M: usize = 2;

fn rolling_median_volume(baseline: &[Candle]) -> f64 {
    let mut volumes: Vec<f64> = baseline.iter().map(|c| c.volume).collect();
    volumes.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = volumes.len();
    if n == 0 {
        return 0.0;
    }
    if n % 2 == 1 {
        volumes[n / 2]
    } else {
        (volumes[n / 2 - 1] + volumes[n / 2]) / 2.0
    }
}

/// Attempts to build a momentum entry signal from the most recently closed
/// bar against a detected level. `candles` must be closed candles in
/// oldest-first order; the last element is the candidate entry bar. `vwap`
/// and `l2_depth` mirror the retest strategy's fair-value and order-flow
/// gates.
pub fn evaluate(
    symbol: &str,
    candles: &[Candle],
    level: &TradingLevel,
    side: Side,
    atr_5m: f64,
    vwap: f64,
    l2_depth: Option<&L2Depth>,
    config: &SignalConfig,
    ts: i64,
) -> Option<Signal> {
    // Condition 1: enough history to compute a volume baseline.
    if candles.len() < VOLUME_LOOKBACK + 1 {
        return None;
    }
    let entry_bar = candles.last()?;
    let baseline = &candles[candles.len() - VOLUME_LOOKBACK - 1..candles.len() - 1];
    let median_volume = rolling_median_volume(baseline);

    // Condition 2: volume surge relative to the trailing median.
    if median_volume <= 0.0 || entry_bar.volume < median_volume * config.momentum_volume_multiplier {
        return None;
    }

    // Condition 3: directional body dominance (wick-light breakout bar).
    let range = entry_bar.high - entry_bar.low;
    if range <= 0.0 {
        return None;
    }
    let body_ratio = (entry_bar.close - entry_bar.open).abs() / range;
    if body_ratio < config.momentum_body_ratio_min {
        return None;
    }

    // Condition 4: close clears the level by at least epsilon, in the
    // direction implied by `side`, and the bar's body direction agrees.
    let cleared = match side {
        Side::Long => entry_bar.close > level.price * (1.0 + config.momentum_epsilon) && entry_bar.close > entry_bar.open,
        Side::Short => entry_bar.close < level.price * (1.0 - config.momentum_epsilon) && entry_bar.close < entry_bar.open,
    };
    if !cleared {
        return None;
    }

    // Condition 5: resting order flow must lean toward the breakout direction.
    if let Some(depth) = l2_depth {
        let aligned = match side {
            Side::Long => depth.imbalance >= config.l2_imbalance_threshold,
            Side::Short => depth.imbalance <= -config.l2_imbalance_threshold,
        };
        if !aligned {
            return None;
        }
    }

    // Condition 6: the breakout can't be chasing price too far from fair value.
    if vwap > 0.0 && atr_5m > 0.0 {
        let vwap_gap_atr = (entry_bar.close - vwap).abs() / atr_5m;
        if vwap_gap_atr > config.vwap_gap_max_atr {
            return None;
        }
    }

    // Condition 7 (anti-squeeze): the level must not already have been
    // cleared by the prior bar, else this is a stale continuation rather
    // than a fresh break.
    if let Some(prior) = candles.len().checked_sub(2).map(|i| &candles[i]) {
        let prior_already_cleared = match side {
            Side::Long => prior.close > level.price * (1.0 + config.momentum_epsilon),
            Side::Short => prior.close < level.price * (1.0 - config.momentum_epsilon),
        };
        if prior_already_cleared {
            return None;
        }
    }

    let swing_window_start = candles.len().saturating_sub(SWING_BARS_10M);
    let swing_window = &candles[swing_window_start..];
    let stop_loss = match side {
        Side::Long => {
            let swing_low_10m = swing_window.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
            swing_low_10m.max(entry_bar.close - atr_5m * 1.2)
        }
        Side::Short => {
            let swing_high_10m = swing_window.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
            swing_high_10m.min(entry_bar.close + atr_5m * 1.2)
        }
    };
    if (side == Side::Long && stop_loss >= entry_bar.close) || (side == Side::Short && stop_loss <= entry_bar.close) {
        return None;
    }

    let confidence = (body_ratio).min(1.0);
    Some(Signal::new(
        symbol,
        side,
        Strategy::Momentum,
        entry_bar.close,
        level.price,
        stop_loss,
        confidence,
        format!(
            "momentum breakout: volume {:.1}x median, body_ratio {:.2}",
            entry_bar.volume / median_volume,
            body_ratio
        ),
        serde_json::json!({
            "median_volume": median_volume,
            "entry_volume": entry_bar.volume,
            "body_ratio": body_ratio,
            "l2_imbalance": l2_depth.map(|d| d.imbalance),
        }),
        ts,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(volume: f64, open: f64, high: f64, low: f64, close: f64) -> Candle {
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

    fn baseline(n: usize) -> Vec<Candle> {
        (0..n).map(|_| candle(10.0, 100.0, 100.5, 99.5, 100.0)).collect()
    }

    #[test]
    fn strong_breakout_bar_produces_signal() {
        let mut candles = baseline(VOLUME_LOOKBACK);
        candles.push(candle(50.0, 100.0, 102.0, 99.9, 101.9));
        let level = TradingLevel {
            price: 100.0,
            level_type: crate::types::LevelType::Resistance,
            touch_count: 3,
            strength: 0.5,
            first_touch_ts: 0,
            last_touch_ts: 0,
            base_height: None,
        };
        let signal = evaluate(
            "BTCUSDT",
            &candles,
            &level,
            Side::Long,
            1.0,
            0.0,
            None,
            &SignalConfig::default(),
            0,
        );
        assert!(signal.is_some());
    }

    #[test]
    fn weak_volume_rejects_signal() {
        let mut candles = baseline(VOLUME_LOOKBACK);
        candles.push(candle(11.0, 100.0, 102.0, 99.9, 101.9));
        let level = TradingLevel {
            price: 100.0,
            level_type: crate::types::LevelType::Resistance,
            touch_count: 3,
            strength: 0.5,
            first_touch_ts: 0,
            last_touch_ts: 0,
            base_height: None,
        };
        let signal = evaluate(
            "BTCUSDT",
            &candles,
            &level,
            Side::Long,
            1.0,
            0.0,
            None,
            &SignalConfig::default(),
            0,
        );
        assert!(signal.is_none());
    }

    #[test]
    fn insufficient_history_returns_none() {
        let candles = baseline(3);
        let level = TradingLevel {
            price: 100.0,
            level_type: crate::types::LevelType::Resistance,
            touch_count: 0,
            strength: 0.0,
            first_touch_ts: 0,
            last_touch_ts: 0,
            base_height: None,
        };
        assert!(evaluate("BTCUSDT", &candles, &level, Side::Long, 1.0, 0.0, None, &SignalConfig::default(), 0).is_none());
    }

    #[test]
    fn stale_breakout_rejected_by_anti_squeeze() {
        let mut candles = baseline(VOLUME_LOOKBACK - 1);
        // Prior bar already cleared the level; the "breakout" bar is a stale
        // continuation rather than a fresh break.
        candles.push(candle(40.0, 100.0, 102.5, 99.9, 102.0));
        candles.push(candle(50.0, 102.0, 103.0, 101.9, 102.9));
        let level = TradingLevel {
            price: 100.0,
            level_type: crate::types::LevelType::Resistance,
            touch_count: 3,
            strength: 0.5,
            first_touch_ts: 0,
            last_touch_ts: 0,
            base_height: None,
        };
        let signal = evaluate(
            "BTCUSDT",
            &candles,
            &level,
            Side::Long,
            1.0,
            0.0,
            None,
            &SignalConfig::default(),
            0,
        );
        assert!(signal.is_none());
    }
}
