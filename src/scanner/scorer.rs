// =============================================================================
// Scanner scorer — z-score weighted ranking over the current candidate universe
// =============================================================================
//
// The contribution-sum shape (per-metric weight * normalized value, summed
// into one score, each contribution recorded individually) is carried from
// `signals/weighted_score.rs`'s `WeightedScorer`. What changes: instead of
// per-signal confidence/direction inputs, each metric is z-scored across the
// whole candidate universe first, so a symbol's score reflects how it ranks
// relative to its peers this cycle rather than against a fixed threshold.
// =============================================================================

use std::collections::{BTreeMap, HashMap};

use crate::types::MarketData;

/// One metric extracted from `MarketData`, with the sign the weight should
/// apply in (a negative weight in the config, like `correlation`, still
/// multiplies the same raw z-score — the sign lives in the weight, not here).
fn raw_metrics(data: &MarketData) -> HashMap<&'static str, f64> {
    let atr_pct = if data.price > 0.0 { data.atr_5m / data.price } else { 0.0 };
    let mut m = HashMap::new();
    m.insert("vol_surge", (data.vol_surge_1h + data.vol_surge_5m) / 2.0);
    m.insert("oi_delta", data.oi_delta.unwrap_or(0.0));
    m.insert("atr_quality", atr_pct);
    m.insert("correlation", data.btc_correlation.abs());
    m.insert("trades_per_minute", data.trades_per_minute);
    m
}

fn mean_std(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    if n == 0.0 {
        return (0.0, 0.0);
    }
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

pub struct ScoredSymbol {
    pub symbol: String,
    pub score: f64,
    pub components: BTreeMap<String, f64>,
}

/// Score every symbol in `universe` against the weighted z-score model.
/// Symbols are returned in the same order as the input; callers sort and
/// truncate separately.
pub fn score_universe(universe: &[MarketData], weights: &HashMap<String, f64>) -> Vec<ScoredSymbol> {
    if universe.is_empty() {
        return Vec::new();
    }

    let metric_names = ["vol_surge", "oi_delta", "atr_quality", "correlation", "trades_per_minute"];
    let raw: Vec<HashMap<&'static str, f64>> = universe.iter().map(raw_metrics).collect();

    let mut stats = HashMap::new();
    for &name in &metric_names {
        let values: Vec<f64> = raw.iter().map(|m| m[name]).collect();
        stats.insert(name, mean_std(&values));
    }

    universe
        .iter()
        .zip(raw.iter())
        .map(|(data, metrics)| {
            let mut components = BTreeMap::new();
            let mut score = 0.0;
            for &name in &metric_names {
                let (mean, std) = stats[name];
                let z = if std > 1e-12 { (metrics[name] - mean) / std } else { 0.0 };
                let weight = weights.get(name).copied().unwrap_or(0.0);
                let contribution = weight * z;
                components.insert(name.to_string(), contribution);
                score += contribution;
            }
            ScoredSymbol {
                symbol: data.symbol.clone(),
                score,
                components,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_score_weights;

    fn data(symbol: &str, volume: f64, trades_per_minute: f64) -> MarketData {
        MarketData {
            symbol: symbol.into(),
            price: 100.0,
            volume_24h_usd: volume,
            oi_usd: Some(1_000_000.0),
            trades_per_minute,
            atr_5m: 1.0,
            atr_15m: 1.5,
            bb_width_pct: 0.05,
            btc_correlation: 0.1,
            vol_surge_1h: volume / 10_000_000.0,
            vol_surge_5m: volume / 10_000_000.0,
            oi_delta: Some(0.05),
            l2_depth: None,
            ts: 0,
        }
    }

    #[test]
    fn higher_volume_and_activity_scores_higher() {
        let universe = vec![
            data("LOW", 1_000_000.0, 5.0),
            data("HIGH", 50_000_000.0, 100.0),
        ];
        let weights = default_score_weights();
        let scored = score_universe(&universe, &weights);
        let low = scored.iter().find(|s| s.symbol == "LOW").unwrap();
        let high = scored.iter().find(|s| s.symbol == "HIGH").unwrap();
        assert!(high.score > low.score);
    }

    #[test]
    fn empty_universe_returns_empty() {
        let weights = default_score_weights();
        assert!(score_universe(&[], &weights).is_empty());
    }

    #[test]
    fn single_symbol_universe_has_zero_variance_scores() {
        let universe = vec![data("ONLY", 10_000_000.0, 20.0)];
        let weights = default_score_weights();
        let scored = score_universe(&universe, &weights);
        assert_eq!(scored[0].score, 0.0);
    }
}
