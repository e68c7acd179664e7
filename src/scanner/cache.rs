// =============================================================================
// Scan result cache — bounded, most-recently-used per symbol
// =============================================================================
//
// Same shape as `candle_buffer::CandleBuffer`: a `parking_lot::RwLock`-guarded
// map with an explicit capacity bound, trimmed on insert rather than grown
// unboundedly. Eviction order here is access recency (LRU) instead of
// insertion order, since a cache's job is to keep what's still being read,
// not just what's newest.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::types::ScanResult;

struct Entry {
    result: ScanResult,
    last_used: u64,
}

pub struct ScanResultCache {
    entries: RwLock<HashMap<String, Entry>>,
    capacity: usize,
    clock: std::sync::atomic::AtomicU64,
}

impl ScanResultCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity,
            clock: std::sync::atomic::AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    pub fn put(&self, result: ScanResult) {
        let tick = self.tick();
        let mut entries = self.entries.write();
        entries.insert(
            result.symbol.clone(),
            Entry {
                result,
                last_used: tick,
            },
        );
        if entries.len() > self.capacity {
            if let Some(evict_key) = entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&evict_key);
            }
        }
    }

    pub fn get(&self, symbol: &str) -> Option<ScanResult> {
        let tick = self.tick();
        let mut entries = self.entries.write();
        let entry = entries.get_mut(symbol)?;
        entry.last_used = tick;
        Some(entry.result.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn sample(symbol: &str) -> ScanResult {
        ScanResult {
            symbol: symbol.to_string(),
            score: 0.0,
            rank: 0,
            market_data: crate::types::MarketData {
                symbol: symbol.to_string(),
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
            filter_results: BTreeMap::new(),
            filter_details: BTreeMap::new(),
            score_components: BTreeMap::new(),
            levels: vec![],
            ts: 0,
        }
    }

    #[test]
    fn evicts_least_recently_used_past_capacity() {
        let cache = ScanResultCache::new(2);
        cache.put(sample("A"));
        cache.put(sample("B"));
        cache.get("A"); // touch A, making B the LRU entry
        cache.put(sample("C"));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("A").is_some());
        assert!(cache.get("B").is_none());
        assert!(cache.get("C").is_some());
    }

    #[test]
    fn get_on_missing_symbol_returns_none() {
        let cache = ScanResultCache::new(4);
        assert!(cache.get("NOPE").is_none());
    }
}
