// =============================================================================
// Scanner — ranks the tradable universe into a bounded candidate list
// =============================================================================

pub mod cache;
pub mod filters;
pub mod levels;
pub mod scorer;

use std::collections::HashMap;

use tracing::{info, instrument};

use crate::config::ScannerConfig;
use crate::config::{LiquidityFilters, VolatilityFilters};
use crate::market_data::Candle;
use crate::types::{MarketData, ScanResult};

pub use cache::ScanResultCache;

pub struct Scanner {
    cache: ScanResultCache,
}

impl Scanner {
    pub fn new(cache_capacity: usize) -> Self {
        Self {
            cache: ScanResultCache::new(cache_capacity),
        }
    }

    /// Runs one full scan cycle: apply whitelist/blacklist and top-N-by-volume
    /// pre-selection, evaluate the four-stage filter pipeline per symbol,
    /// score the surviving universe with z-score weighting, attach detected
    /// trading levels, sort by score, and truncate to `max_candidates`.
    #[instrument(skip(self, universe, candles_by_symbol, scanner_config, liquidity, volatility))]
    pub fn scan(
        &self,
        universe: &[MarketData],
        candles_by_symbol: &HashMap<String, Vec<Candle>>,
        scanner_config: &ScannerConfig,
        liquidity: &LiquidityFilters,
        volatility: &VolatilityFilters,
        correlation_limit: f64,
        now_ms: i64,
    ) -> Vec<ScanResult> {
        let preselected = preselect(universe, scanner_config);
        let scored = scorer::score_universe(&preselected, &scanner_config.score_weights);

        let mut results: Vec<ScanResult> = preselected
            .iter()
            .zip(scored.iter())
            .map(|(data, scored)| {
                let outcome = filters::evaluate(data, liquidity, volatility, correlation_limit);
                let levels = candles_by_symbol
                    .get(&data.symbol)
                    .map(|c| levels::detect_levels(c))
                    .unwrap_or_default();
                ScanResult {
                    symbol: data.symbol.clone(),
                    score: scored.score,
                    rank: 0,
                    market_data: data.clone(),
                    filter_results: outcome.results,
                    filter_details: outcome.details,
                    score_components: scored.components.clone(),
                    levels,
                    ts: now_ms,
                }
            })
            .filter(|r| r.passed_all_filters())
            .collect();

        results.sort_by(|a, b| {
            b.score
                .abs()
                .partial_cmp(&a.score.abs())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    b.market_data
                        .volume_24h_usd
                        .partial_cmp(&a.market_data.volume_24h_usd)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.symbol.cmp(&b.symbol))
        });
        for (i, r) in results.iter_mut().enumerate() {
            r.rank = i as u32 + 1;
        }
        results.truncate(scanner_config.max_candidates as usize);

        for r in &results {
            self.cache.put(r.clone());
        }
        info!(candidates = results.len(), "scan cycle complete");
        results
    }

    pub fn cached(&self, symbol: &str) -> Option<ScanResult> {
        self.cache.get(symbol)
    }
}

/// Applies the whitelist/blacklist and top-N-by-volume narrowing before the
/// expensive per-symbol filter/score work runs.
fn preselect(universe: &[MarketData], config: &ScannerConfig) -> Vec<MarketData> {
    let mut candidates: Vec<MarketData> = universe
        .iter()
        .filter(|d| {
            if let Some(whitelist) = &config.symbol_whitelist {
                if !whitelist.contains(&d.symbol) {
                    return false;
                }
            }
            if let Some(blacklist) = &config.symbol_blacklist {
                if blacklist.contains(&d.symbol) {
                    return false;
                }
            }
            true
        })
        .cloned()
        .collect();

    if let Some(top_n) = config.top_n_by_volume {
        candidates.sort_by(|a, b| b.volume_24h_usd.partial_cmp(&a.volume_24h_usd).unwrap_or(std::cmp::Ordering::Equal));
        candidates.truncate(top_n as usize);
    }

    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::L2Depth;

    fn data(symbol: &str, volume: f64) -> MarketData {
        MarketData {
            symbol: symbol.into(),
            price: 100.0,
            volume_24h_usd: volume,
            oi_usd: Some(5_000_000.0),
            trades_per_minute: 30.0,
            atr_5m: 1.0,
            atr_15m: 1.5,
            bb_width_pct: 0.05,
            btc_correlation: 0.1,
            vol_surge_1h: 2.0,
            vol_surge_5m: 2.0,
            oi_delta: Some(0.1),
            l2_depth: Some(L2Depth::from_bands(200_000.0, 200_000.0, 300_000.0, 300_000.0, 3.0)),
            ts: 0,
        }
    }

    #[test]
    fn scan_ranks_and_truncates() {
        let scanner = Scanner::new(10);
        let universe = vec![
            data("A", 10_000_000.0),
            data("B", 80_000_000.0),
            data("C", 40_000_000.0),
        ];
        let mut config = ScannerConfig::default();
        config.max_candidates = 2;
        let results = scanner.scan(
            &universe,
            &HashMap::new(),
            &config,
            &LiquidityFilters::default(),
            &VolatilityFilters::default(),
            0.7,
            0,
        );
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].rank, 1);
    }

    #[test]
    fn blacklist_excludes_symbol() {
        let scanner = Scanner::new(10);
        let universe = vec![data("A", 10_000_000.0), data("B", 80_000_000.0)];
        let mut config = ScannerConfig::default();
        config.symbol_blacklist = Some(vec!["B".to_string()]);
        let results = scanner.scan(
            &universe,
            &HashMap::new(),
            &config,
            &LiquidityFilters::default(),
            &VolatilityFilters::default(),
            0.7,
            0,
        );
        assert!(results.iter().all(|r| r.symbol != "B"));
    }
}
