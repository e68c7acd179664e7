// =============================================================================
// Resource governor
// =============================================================================
//
// Samples host CPU/memory every 5s and, under pressure, shrinks ambient
// caches — never trading state. Mirrors the teacher's background-task idiom
// (a single `tokio::spawn`ed loop observing a cancellation token) used
// throughout `market_data/` and `execution.rs`.
// =============================================================================

use std::sync::Arc;

use parking_lot::Mutex;
use sysinfo::System;
use tracing::{info, instrument, warn};

use crate::app_state::AppState;
use crate::orchestrator::ShutdownToken;

const SAMPLE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

/// Memory-pressure threshold at which the diagnostic ring is shrunk.
const MEM_SHRINK_CACHE_PCT: f64 = 80.0;
/// Memory-pressure threshold at which the scanner batch size is reduced.
const MEM_REDUCE_BATCH_PCT: f64 = 85.0;

/// Minimum bound a shrink action will ever leave `max_candidates` at, so the
/// scanner never starves entirely under sustained pressure.
const MIN_SCANNER_BATCH: u32 = 5;
/// Minimum bound a shrink leaves the diagnostic ring at.
const MIN_DIAGNOSTIC_CAPACITY: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GovernorAction {
    None,
    ShrinkCache,
    ReduceBatch,
}

/// Pure decision function: which action a given memory-utilization
/// percentage calls for. `ReduceBatch` implies `ShrinkCache` also applies —
/// callers act on both when memory is at or above the higher threshold.
fn action_for(mem_pct: f64) -> GovernorAction {
    if mem_pct >= MEM_REDUCE_BATCH_PCT {
        GovernorAction::ReduceBatch
    } else if mem_pct >= MEM_SHRINK_CACHE_PCT {
        GovernorAction::ShrinkCache
    } else {
        GovernorAction::None
    }
}

pub struct ResourceGovernor {
    state: Arc<AppState>,
    system: Mutex<System>,
}

impl ResourceGovernor {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state, system: Mutex::new(System::new()) }
    }

    fn sample_mem_pct(&self) -> f64 {
        let mut system = self.system.lock();
        system.refresh_memory();
        let total = system.total_memory();
        if total == 0 {
            return 0.0;
        }
        (system.used_memory() as f64 / total as f64) * 100.0
    }

    #[instrument(skip(self))]
    fn apply(&self, action: GovernorAction, mem_pct: f64) {
        match action {
            GovernorAction::None => {}
            GovernorAction::ShrinkCache => {
                let new_cap = (self.state.diagnostics.len() / 2).max(MIN_DIAGNOSTIC_CAPACITY);
                self.state.diagnostics.trim_to(new_cap);
                warn!(mem_pct, new_cap, "memory pressure: diagnostic ring shrunk");
            }
            GovernorAction::ReduceBatch => {
                let new_cap = (self.state.diagnostics.len() / 2).max(MIN_DIAGNOSTIC_CAPACITY);
                self.state.diagnostics.trim_to(new_cap);

                let mut preset = self.state.preset.write();
                let current = preset.scanner_config.max_candidates;
                let reduced = (current.saturating_sub(current / 4)).max(MIN_SCANNER_BATCH);
                preset.scanner_config.max_candidates = reduced;
                warn!(mem_pct, from = current, to = reduced, "memory pressure: scanner batch size reduced");
            }
        }
        self.state.metrics.set_gauge("resource_governor.mem_pct", mem_pct);
    }

    /// Runs until `shutdown` is triggered. Never touches positions, risk
    /// state, or in-flight orders.
    pub async fn run(&self, shutdown: ShutdownToken) {
        info!("resource governor started");
        loop {
            if shutdown.is_triggered() {
                info!("resource governor stopping");
                return;
            }
            let mem_pct = self.sample_mem_pct();
            let action = action_for(mem_pct);
            if action != GovernorAction::None {
                self.apply(action, mem_pct);
            } else {
                self.state.metrics.set_gauge("resource_governor.mem_pct", mem_pct);
            }
            tokio::time::sleep(SAMPLE_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SystemConfig, TradingPreset};

    #[test]
    fn below_eighty_percent_takes_no_action() {
        assert_eq!(action_for(50.0), GovernorAction::None);
        assert_eq!(action_for(79.9), GovernorAction::None);
    }

    #[test]
    fn eighty_to_eightyfive_shrinks_cache_only() {
        assert_eq!(action_for(80.0), GovernorAction::ShrinkCache);
        assert_eq!(action_for(84.9), GovernorAction::ShrinkCache);
    }

    #[test]
    fn eightyfive_and_above_reduces_batch() {
        assert_eq!(action_for(85.0), GovernorAction::ReduceBatch);
        assert_eq!(action_for(99.0), GovernorAction::ReduceBatch);
    }

    #[test]
    fn apply_reduce_batch_never_drops_below_minimum() {
        let mut system = SystemConfig::default();
        system.symbols = vec!["BTCUSDT".to_string()];
        let mut preset = TradingPreset::default();
        preset.scanner_config.max_candidates = MIN_SCANNER_BATCH;
        let state = Arc::new(AppState::new(system, preset));
        let governor = ResourceGovernor::new(state.clone());

        governor.apply(GovernorAction::ReduceBatch, 90.0);

        assert_eq!(state.preset.read().scanner_config.max_candidates, MIN_SCANNER_BATCH);
    }

    #[test]
    fn apply_shrink_cache_never_drops_below_minimum() {
        let state = Arc::new(AppState::new(SystemConfig::default(), TradingPreset::default()));
        let governor = ResourceGovernor::new(state.clone());

        governor.apply(GovernorAction::ShrinkCache, 82.0);

        assert!(state.diagnostics.len() <= MIN_DIAGNOSTIC_CAPACITY || state.diagnostics.is_empty());
    }
}
