// =============================================================================
// Diagnostic event collector
// =============================================================================
//
// Append-only, bounded-ring collector for `DiagnosticEvent`s: every filter
// evaluation, signal-condition check, and ad-hoc engine event a component
// wants on the audit trail without promoting it to a full `DecisionEnvelope`.
// Same shape as `AppState`'s `recent_errors`/`recent_decisions` rings — a
// `parking_lot::RwLock<VecDeque<_>>` trimmed from the front on overflow.
// =============================================================================

use std::collections::VecDeque;

use chrono::Utc;
use parking_lot::RwLock;

use crate::types::DiagnosticEvent;

/// Default ring capacity. The resource governor may shrink this further
/// under memory pressure via [`DiagnosticCollector::trim_to`].
pub const DEFAULT_CAPACITY: usize = 5_000;

pub struct DiagnosticCollector {
    events: RwLock<VecDeque<DiagnosticEvent>>,
    capacity: RwLock<usize>,
}

impl DiagnosticCollector {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: RwLock::new(capacity),
        }
    }

    /// Record a raw event. Evicts oldest entries past the current capacity.
    pub fn record(&self, event: DiagnosticEvent) {
        let cap = *self.capacity.read();
        let mut events = self.events.write();
        events.push_back(event);
        while events.len() > cap {
            events.pop_front();
        }
    }

    /// Record one filter's pass/fail verdict for a symbol during scanning.
    pub fn record_filter(
        &self,
        component: impl Into<String>,
        symbol: impl Into<String>,
        stage: impl Into<String>,
        passed: bool,
        reason: Option<String>,
        payload: serde_json::Value,
    ) {
        self.record(DiagnosticEvent {
            ts: Utc::now().timestamp_millis(),
            component: component.into(),
            stage: stage.into(),
            symbol: Some(symbol.into()),
            payload,
            reason,
            passed: Some(passed),
        });
    }

    /// Record one signal-generation condition's evaluation (momentum/retest
    /// sub-checks), independent of whether the overall signal fired.
    pub fn record_signal_condition(
        &self,
        symbol: impl Into<String>,
        stage: impl Into<String>,
        passed: bool,
        payload: serde_json::Value,
    ) {
        self.record(DiagnosticEvent {
            ts: Utc::now().timestamp_millis(),
            component: "signals".to_string(),
            stage: stage.into(),
            symbol: Some(symbol.into()),
            payload,
            reason: None,
            passed: Some(passed),
        });
    }

    pub fn recent(&self, count: usize) -> Vec<DiagnosticEvent> {
        let events = self.events.read();
        let start = events.len().saturating_sub(count);
        events.iter().skip(start).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shrink the ring's effective capacity, evicting from the front if
    /// already over the new bound. Called by the resource governor under
    /// memory pressure; never invoked from the trading path itself.
    pub fn trim_to(&self, new_capacity: usize) {
        *self.capacity.write() = new_capacity;
        let mut events = self.events.write();
        while events.len() > new_capacity {
            events.pop_front();
        }
    }
}

impl Default for DiagnosticCollector {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_evicts_oldest_past_capacity() {
        let collector = DiagnosticCollector::new(3);
        for i in 0..5 {
            collector.record_filter("scanner", "BTCUSDT", "liquidity", true, None, serde_json::json!({ "i": i }));
        }
        assert_eq!(collector.len(), 3);
        let recent = collector.recent(10);
        assert_eq!(recent[0].payload["i"], 2);
    }

    #[test]
    fn trim_to_shrinks_and_evicts() {
        let collector = DiagnosticCollector::new(10);
        for _ in 0..8 {
            collector.record_signal_condition("ETHUSDT", "momentum_volume", false, serde_json::Value::Null);
        }
        assert_eq!(collector.len(), 8);
        collector.trim_to(4);
        assert_eq!(collector.len(), 4);
    }

    #[test]
    fn recent_returns_fewer_than_requested_when_ring_is_shorter() {
        let collector = DiagnosticCollector::new(10);
        collector.record_filter("scanner", "BTCUSDT", "volatility", true, None, serde_json::Value::Null);
        assert_eq!(collector.recent(50).len(), 1);
    }
}
