// =============================================================================
// Scanner filter pipeline — four sequential gates over one symbol's data
// =============================================================================
//
// Sequential flag-style gate evaluation is carried from the teacher's
// `SmartFilterEngine::evaluate` (each stage runs in order and records why it
// blocked); the difference is every gate here is a named spec filter rather
// than a feature-flagged proprietary layer, and all four always run so the
// caller gets a complete `filter_results`/`filter_details` map rather than
// an early return.
// =============================================================================

use std::collections::BTreeMap;

use serde_json::json;

use crate::config::{LiquidityFilters, VolatilityFilters};
use crate::types::MarketData;

pub struct FilterOutcome {
    pub results: BTreeMap<String, bool>,
    pub details: BTreeMap<String, serde_json::Value>,
}

/// Runs the liquidity, volatility, spread, and correlation gates over one
/// symbol's current market data. Every gate runs regardless of earlier
/// outcomes so `ScanResult::passed_all_filters` reflects the full picture.
pub fn evaluate(
    data: &MarketData,
    liquidity: &LiquidityFilters,
    volatility: &VolatilityFilters,
    correlation_limit: f64,
) -> FilterOutcome {
    let mut results = BTreeMap::new();
    let mut details = BTreeMap::new();

    // ── Liquidity gate ───────────────────────────────────────────────────
    let volume_ok = data.volume_24h_usd >= liquidity.min_24h_volume_usd;
    let oi_ok = match (liquidity.min_oi_usd, data.oi_usd) {
        (Some(min_oi), Some(oi)) => oi >= min_oi,
        (Some(_), None) => false,
        (None, _) => true,
    };
    let depth_ok = data
        .l2_depth
        .map(|d| {
            (d.bid_usd_0_5pct.min(d.ask_usd_0_5pct)) >= liquidity.min_depth_usd_0_5pct
                && (d.bid_usd_0_3pct.min(d.ask_usd_0_3pct)) >= liquidity.min_depth_usd_0_3pct
        })
        .unwrap_or(false);
    let trades_ok = data.trades_per_minute >= liquidity.min_trades_per_minute;
    let liquidity_pass = volume_ok && oi_ok && depth_ok && trades_ok;
    results.insert("liquidity".to_string(), liquidity_pass);
    details.insert(
        "liquidity".to_string(),
        json!({
            "volume_ok": volume_ok,
            "oi_ok": oi_ok,
            "depth_ok": depth_ok,
            "trades_ok": trades_ok,
        }),
    );

    // ── Spread gate ──────────────────────────────────────────────────────
    let spread_ok = data
        .l2_depth
        .map(|d| d.spread_bps <= liquidity.max_spread_bps)
        .unwrap_or(false);
    results.insert("spread".to_string(), spread_ok);
    details.insert(
        "spread".to_string(),
        json!({ "spread_bps": data.l2_depth.map(|d| d.spread_bps) }),
    );

    // ── Volatility gate ──────────────────────────────────────────────────
    let atr_pct = if data.price > 0.0 { data.atr_5m / data.price } else { 0.0 };
    let atr_in_range = atr_pct >= volatility.atr_range_min && atr_pct <= volatility.atr_range_max;
    let bbw_ok = data.bb_width_pct <= volatility.bb_width_percentile_max;
    let surge_1h_ok = data.vol_surge_1h >= volatility.volume_surge_1h_min;
    let surge_5m_ok = data.vol_surge_5m >= volatility.volume_surge_5m_min;
    let oi_delta_ok = match (volatility.oi_delta_threshold, data.oi_delta) {
        (Some(min_delta), Some(delta)) => delta.abs() >= min_delta,
        (Some(_), None) => false,
        (None, _) => true,
    };
    let volatility_pass = atr_in_range && bbw_ok && surge_1h_ok && surge_5m_ok && oi_delta_ok;
    results.insert("volatility".to_string(), volatility_pass);
    details.insert(
        "volatility".to_string(),
        json!({
            "atr_pct": atr_pct,
            "bb_width_pct": data.bb_width_pct,
            "vol_surge_1h": data.vol_surge_1h,
            "vol_surge_5m": data.vol_surge_5m,
            "oi_delta": data.oi_delta,
        }),
    );

    // ── Correlation gate ─────────────────────────────────────────────────
    let correlation_pass = data.btc_correlation.abs() <= correlation_limit;
    results.insert("correlation".to_string(), correlation_pass);
    details.insert(
        "correlation".to_string(),
        json!({ "btc_correlation": data.btc_correlation, "limit": correlation_limit }),
    );

    FilterOutcome { results, details }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::L2Depth;

    fn sample_data() -> MarketData {
        MarketData {
            symbol: "BTCUSDT".into(),
            price: 50_000.0,
            volume_24h_usd: 30_000_000.0,
            oi_usd: Some(10_000_000.0),
            trades_per_minute: 40.0,
            atr_5m: 250.0,
            atr_15m: 400.0,
            bb_width_pct: 0.05,
            btc_correlation: 0.2,
            vol_surge_1h: 2.0,
            vol_surge_5m: 2.0,
            oi_delta: Some(0.1),
            l2_depth: Some(L2Depth::from_bands(120_000.0, 120_000.0, 200_000.0, 200_000.0, 5.0)),
            ts: 0,
        }
    }

    #[test]
    fn all_gates_pass_for_healthy_symbol() {
        let outcome = evaluate(
            &sample_data(),
            &crate::config::LiquidityFilters::default(),
            &crate::config::VolatilityFilters::default(),
            0.7,
        );
        assert!(outcome.results.values().all(|&v| v));
    }

    #[test]
    fn low_volume_fails_liquidity_gate() {
        let mut data = sample_data();
        data.volume_24h_usd = 1_000.0;
        let outcome = evaluate(
            &data,
            &crate::config::LiquidityFilters::default(),
            &crate::config::VolatilityFilters::default(),
            0.7,
        );
        assert!(!outcome.results["liquidity"]);
    }

    #[test]
    fn high_correlation_fails_correlation_gate() {
        let mut data = sample_data();
        data.btc_correlation = 0.95;
        let outcome = evaluate(
            &data,
            &crate::config::LiquidityFilters::default(),
            &crate::config::VolatilityFilters::default(),
            0.7,
        );
        assert!(!outcome.results["correlation"]);
    }
}
