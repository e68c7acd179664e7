// =============================================================================
// Metrics registry
// =============================================================================
//
// Counters, gauges, and latency histograms with a fixed-size per-metric ring
// (<= 10,000 points) for scrape. Labels are kept low-cardinality (symbol,
// component) by construction — callers pass a pre-joined key string rather
// than an open-ended label map, the same flattening `rate_limit.rs` does for
// its header-derived fields.
// =============================================================================

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

/// Hard ceiling on points retained per metric series.
pub const MAX_POINTS_PER_METRIC: usize = 10_000;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct MetricPoint {
    pub ts: i64,
    pub value: f64,
}

#[derive(Default)]
struct Ring {
    points: Vec<MetricPoint>,
}

impl Ring {
    fn push(&mut self, value: f64) {
        self.points.push(MetricPoint { ts: Utc::now().timestamp_millis(), value });
        if self.points.len() > MAX_POINTS_PER_METRIC {
            let overflow = self.points.len() - MAX_POINTS_PER_METRIC;
            self.points.drain(0..overflow);
        }
    }

    fn last(&self) -> f64 {
        self.points.last().map(|p| p.value).unwrap_or(0.0)
    }
}

/// A key is `"{metric_name}:{symbol_or_component}"` — callers build it once
/// and reuse it, keeping cardinality bounded to the universe of tracked
/// symbols/components rather than arbitrary label combinations.
pub type MetricKey = String;

#[derive(Default)]
pub struct MetricsRegistry {
    counters: RwLock<HashMap<MetricKey, Ring>>,
    gauges: RwLock<HashMap<MetricKey, Ring>>,
    histograms: RwLock<HashMap<MetricKey, Ring>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistogramSummary {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub p50: f64,
    pub p95: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, f64>,
    pub gauges: HashMap<String, f64>,
    pub histograms: HashMap<String, HistogramSummary>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a monotonic counter; `delta` is typically 1.0 but callers
    /// may batch (e.g. fills processed this tick).
    pub fn incr_counter(&self, key: impl Into<MetricKey>, delta: f64) {
        let mut counters = self.counters.write();
        let ring = counters.entry(key.into()).or_default();
        let running = ring.last() + delta;
        ring.push(running);
    }

    /// Set a point-in-time gauge value.
    pub fn set_gauge(&self, key: impl Into<MetricKey>, value: f64) {
        let mut gauges = self.gauges.write();
        gauges.entry(key.into()).or_default().push(value);
    }

    /// Record one observation into a latency/size histogram.
    pub fn observe_histogram(&self, key: impl Into<MetricKey>, value: f64) {
        let mut histograms = self.histograms.write();
        histograms.entry(key.into()).or_default().push(value);
    }

    pub fn counter_value(&self, key: &str) -> f64 {
        self.counters.read().get(key).map(Ring::last).unwrap_or(0.0)
    }

    pub fn gauge_value(&self, key: &str) -> f64 {
        self.gauges.read().get(key).map(Ring::last).unwrap_or(0.0)
    }

    pub fn histogram_summary(&self, key: &str) -> Option<HistogramSummary> {
        let histograms = self.histograms.read();
        let ring = histograms.get(key)?;
        summarize(&ring.points)
    }

    /// Full scrape snapshot: last value for every counter/gauge, a computed
    /// summary for every histogram.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self.counters.read().iter().map(|(k, r)| (k.clone(), r.last())).collect();
        let gauges = self.gauges.read().iter().map(|(k, r)| (k.clone(), r.last())).collect();
        let histograms = self
            .histograms
            .read()
            .iter()
            .filter_map(|(k, r)| summarize(&r.points).map(|s| (k.clone(), s)))
            .collect();
        MetricsSnapshot { counters, gauges, histograms }
    }
}

fn summarize(points: &[MetricPoint]) -> Option<HistogramSummary> {
    if points.is_empty() {
        return None;
    }
    let mut values: Vec<f64> = points.iter().map(|p| p.value).collect();
    values.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let count = values.len();
    let percentile = |p: f64| -> f64 {
        let idx = ((count - 1) as f64 * p).round() as usize;
        values[idx.min(count - 1)]
    };
    Some(HistogramSummary {
        count,
        min: values[0],
        max: values[count - 1],
        mean: values.iter().sum::<f64>() / count as f64,
        p50: percentile(0.50),
        p95: percentile(0.95),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_accumulates() {
        let registry = MetricsRegistry::new();
        registry.incr_counter("signals_generated:BTCUSDT", 1.0);
        registry.incr_counter("signals_generated:BTCUSDT", 2.0);
        assert_eq!(registry.counter_value("signals_generated:BTCUSDT"), 3.0);
    }

    #[test]
    fn gauge_reports_last_value() {
        let registry = MetricsRegistry::new();
        registry.set_gauge("open_positions", 2.0);
        registry.set_gauge("open_positions", 5.0);
        assert_eq!(registry.gauge_value("open_positions"), 5.0);
    }

    #[test]
    fn histogram_summary_computes_percentiles() {
        let registry = MetricsRegistry::new();
        for v in [10.0, 20.0, 30.0, 40.0, 50.0] {
            registry.observe_histogram("execution_latency_ms:BTCUSDT", v);
        }
        let summary = registry.histogram_summary("execution_latency_ms:BTCUSDT").unwrap();
        assert_eq!(summary.count, 5);
        assert_eq!(summary.min, 10.0);
        assert_eq!(summary.max, 50.0);
        assert!((summary.mean - 30.0).abs() < 1e-9);
    }

    #[test]
    fn ring_caps_at_ten_thousand_points() {
        let registry = MetricsRegistry::new();
        for i in 0..(MAX_POINTS_PER_METRIC + 500) {
            registry.observe_histogram("k", i as f64);
        }
        let summary = registry.histogram_summary("k").unwrap();
        assert_eq!(summary.count, MAX_POINTS_PER_METRIC);
    }

    #[test]
    fn missing_metric_returns_none() {
        let registry = MetricsRegistry::new();
        assert!(registry.histogram_summary("nonexistent").is_none());
    }
}
