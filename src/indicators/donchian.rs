// =============================================================================
// Donchian Channel
// =============================================================================
//
// Highest-high / lowest-low over a trailing N-period window, the basis for
// the scanner's support/resistance level detection. Pure function in the
// same style as `ema.rs`/`atr.rs`: `Option<T>` return, no internal state.
// =============================================================================

use crate::market_data::Candle;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DonchianChannel {
    pub upper: f64,
    pub lower: f64,
    pub mid: f64,
}

/// Computes the Donchian channel over the most recent `period` candles.
/// Returns `None` if fewer than `period` candles are available.
pub fn calculate(candles: &[Candle], period: usize) -> Option<DonchianChannel> {
    if candles.len() < period || period == 0 {
        return None;
    }
    let window = &candles[candles.len() - period..];
    let upper = window.iter().map(|c| c.high).fold(f64::MIN, f64::max);
    let lower = window.iter().map(|c| c.low).fold(f64::MAX, f64::min);
    Some(DonchianChannel {
        upper,
        lower,
        mid: (upper + lower) / 2.0,
    })
}

/// Counts how many of the trailing `period` candles touched within
/// `tolerance` (absolute price units) of `level`, used to score a level's
/// strength by touch count.
pub fn touch_count(candles: &[Candle], level: f64, tolerance: f64) -> u32 {
    candles
        .iter()
        .filter(|c| (c.high - level).abs() <= tolerance || (c.low - level).abs() <= tolerance)
        .count() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(high: f64, low: f64) -> Candle {
        Candle {
            open_time: 0,
            close_time: 0,
            open: (high + low) / 2.0,
            high,
            low,
            close: (high + low) / 2.0,
            volume: 0.0,
            quote_volume: 0.0,
            trades_count: 0,
            taker_buy_volume: 0.0,
            taker_buy_quote_volume: 0.0,
            is_closed: true,
        }
    }

    #[test]
    fn insufficient_candles_returns_none() {
        let candles = vec![candle(10.0, 9.0)];
        assert!(calculate(&candles, 5).is_none());
    }

    #[test]
    fn channel_uses_extremes_of_window() {
        let candles = vec![candle(10.0, 9.0), candle(12.0, 8.0), candle(11.0, 9.5)];
        let channel = calculate(&candles, 3).unwrap();
        assert_eq!(channel.upper, 12.0);
        assert_eq!(channel.lower, 8.0);
        assert_eq!(channel.mid, 10.0);
    }

    #[test]
    fn touch_count_within_tolerance() {
        let candles = vec![candle(100.1, 95.0), candle(99.9, 94.0), candle(105.0, 100.05)];
        assert_eq!(touch_count(&candles, 100.0, 0.2), 2);
    }
}
