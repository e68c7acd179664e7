// =============================================================================
// Trading level detection — Donchian-channel support/resistance
// =============================================================================
//
// Builds the `TradingLevel` list a `ScanResult` carries: the Donchian
// channel edges over the lookback window seed candidate support/resistance
// prices, and each is scored by how many closed candles in the window
// touched within tolerance of it.
// =============================================================================

use crate::indicators::donchian;
use crate::market_data::Candle;
use crate::types::{LevelType, TradingLevel};

const LOOKBACK_PERIOD: usize = 50;
/// Touch tolerance as a fraction of the channel width.
const TOUCH_TOLERANCE_FRACTION: f64 = 0.002;

/// Detects the resistance (channel upper) and support (channel lower)
/// levels implied by the trailing `LOOKBACK_PERIOD` closed candles.
pub fn detect_levels(candles: &[Candle]) -> Vec<TradingLevel> {
    let Some(channel) = donchian::calculate(candles, LOOKBACK_PERIOD) else {
        return Vec::new();
    };
    let window = &candles[candles.len().saturating_sub(LOOKBACK_PERIOD)..];
    let tolerance = (channel.upper - channel.lower).abs() * TOUCH_TOLERANCE_FRACTION;

    let first_ts = window.first().map(|c| c.open_time).unwrap_or(0);
    let last_ts = window.last().map(|c| c.close_time).unwrap_or(0);

    let resistance = TradingLevel {
        price: channel.upper,
        level_type: LevelType::Resistance,
        touch_count: donchian::touch_count(window, channel.upper, tolerance),
        strength: 0.0,
        first_touch_ts: first_ts,
        last_touch_ts: last_ts,
        base_height: Some(channel.upper - channel.mid),
    };
    let support = TradingLevel {
        price: channel.lower,
        level_type: LevelType::Support,
        touch_count: donchian::touch_count(window, channel.lower, tolerance),
        strength: 0.0,
        first_touch_ts: first_ts,
        last_touch_ts: last_ts,
        base_height: Some(channel.mid - channel.lower),
    };

    vec![with_strength(resistance), with_strength(support)]
}

/// Strength is the touch count normalized against a ceiling of 10 touches,
/// so a level hit more than 10 times within the window still caps at 1.0.
fn with_strength(mut level: TradingLevel) -> TradingLevel {
    level.strength = (level.touch_count as f64 / 10.0).min(1.0);
    level
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open_time: i64, high: f64, low: f64) -> Candle {
        Candle {
            open_time,
            close_time: open_time + 299_999,
            open: (high + low) / 2.0,
            high,
            low,
            close: (high + low) / 2.0,
            volume: 10.0,
            quote_volume: 1000.0,
            trades_count: 5,
            taker_buy_volume: 5.0,
            taker_buy_quote_volume: 500.0,
            is_closed: true,
        }
    }

    #[test]
    fn insufficient_history_returns_empty() {
        let candles = vec![candle(0, 10.0, 9.0)];
        assert!(detect_levels(&candles).is_empty());
    }

    #[test]
    fn detects_support_and_resistance_from_window() {
        let candles: Vec<Candle> = (0..60)
            .map(|i| candle(i * 300_000, 100.0 + (i % 3) as f64, 90.0 - (i % 2) as f64))
            .collect();
        let levels = detect_levels(&candles);
        assert_eq!(levels.len(), 2);
        assert!(levels.iter().any(|l| l.level_type == LevelType::Resistance));
        assert!(levels.iter().any(|l| l.level_type == LevelType::Support));
    }
}
