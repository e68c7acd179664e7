// =============================================================================
// Orchestrator — drives the single authoritative cycle across every component
// =============================================================================
//
// Owns the FSM, the cooperative shutdown token, and the auto-retry backoff
// policy. Exposes start/stop/pause/resume/emergency_stop; guarantees at most
// one cycle active at a time by running the whole loop on a single task.
// =============================================================================

pub mod cycle;
pub mod fsm;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{error, info, instrument, warn};

use crate::app_state::AppState;
use crate::error::EngineError;
use crate::exchange::ExchangeAdapter;
use crate::types::FSMTransition;

pub use fsm::{FsmState, RetryPolicy};

const MAX_TRANSITION_HISTORY: usize = 500;

/// Cooperative cancellation signal observed at every suspension point inside
/// the cycle. Mirrors `execution::CancelToken`'s shape.
#[derive(Clone, Default)]
pub struct ShutdownToken(Arc<AtomicBool>);

impl ShutdownToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Exposes the backing flag so other cooperative-cancellation types
    /// (e.g. `execution::CancelToken`) can observe this same signal instead
    /// of carrying an independent one.
    pub fn flag(&self) -> Arc<AtomicBool> {
        self.0.clone()
    }
}

pub struct Orchestrator {
    pub state: Arc<AppState>,
    pub adapter: Arc<dyn ExchangeAdapter>,
    fsm_state: RwLock<FsmState>,
    transitions: RwLock<Vec<FSMTransition>>,
    retry: RwLock<RetryPolicy>,
    shutdown: ShutdownToken,
}

impl Orchestrator {
    pub fn new(state: Arc<AppState>, adapter: Arc<dyn ExchangeAdapter>) -> Self {
        Self {
            state,
            adapter,
            fsm_state: RwLock::new(FsmState::Idle),
            transitions: RwLock::new(Vec::new()),
            retry: RwLock::new(RetryPolicy::new()),
            shutdown: ShutdownToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown.clone()
    }

    pub fn current_state(&self) -> FsmState {
        *self.fsm_state.read()
    }

    pub fn recent_transitions(&self, count: usize) -> Vec<FSMTransition> {
        let history = self.transitions.read();
        let start = history.len().saturating_sub(count);
        history[start..].to_vec()
    }

    /// Attempt a transition; records it in the append-only history on
    /// success and never panics on rejection.
    #[instrument(skip(self), fields(to = %to))]
    fn transition(&self, to: FsmState, reason: &str) -> Result<(), EngineError> {
        let from = *self.fsm_state.read();
        from.validate_transition(to)?;

        *self.fsm_state.write() = to;
        let mut history = self.transitions.write();
        history.push(FSMTransition {
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
            reason: reason.to_string(),
            ts: Utc::now().timestamp_millis(),
            metadata: serde_json::Value::Null,
        });
        while history.len() > MAX_TRANSITION_HISTORY {
            history.remove(0);
        }
        drop(history);

        self.state.increment_version();
        info!(from = %from, to = %to, reason, "fsm transition");
        Ok(())
    }

    pub fn pause(&self) -> Result<(), EngineError> {
        self.transition(FsmState::Paused, "operator pause")
    }

    pub fn resume(&self) -> Result<(), EngineError> {
        self.transition(FsmState::Scanning, "operator resume")
    }

    pub fn stop(&self) -> Result<(), EngineError> {
        self.shutdown.trigger();
        self.transition(FsmState::Stopped, "operator stop")
    }

    /// Cancels all open orders and, per policy, market-closes positions.
    /// Terminal until an operator issues an explicit reset.
    pub async fn emergency_stop(&self, reason: &str) -> Result<(), EngineError> {
        self.transition(FsmState::Emergency, reason)?;
        warn!(reason, "emergency stop engaged — cancelling open orders");
        for pos in self.state.position_manager.open_positions() {
            if let Err(e) = self.adapter.cancel_order(&pos.symbol, &pos.id).await {
                error!(position_id = %pos.id, error = %e, "failed to cancel order during emergency stop");
            }
        }
        Ok(())
    }

    /// Runs the steady-state loop until the shutdown token is triggered or
    /// an unrecoverable error forces `EMERGENCY`. One iteration = one full
    /// `SCANNING -> ... -> MANAGING -> SCANNING` cycle.
    pub async fn run(&self) {
        if let Err(e) = self.transition(FsmState::Initializing, "startup") {
            error!(error = %e, "failed to enter INITIALIZING");
            return;
        }
        if let Err(e) = self.transition(FsmState::Scanning, "initial scan") {
            error!(error = %e, "failed to enter SCANNING");
            return;
        }

        loop {
            if self.shutdown.is_triggered() {
                let _ = self.transition(FsmState::Stopped, "shutdown token triggered");
                return;
            }

            if self.current_state() == FsmState::Paused {
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                continue;
            }

            if let Err(reason) = self.run_cycle().await {
                self.handle_cycle_error(&reason).await;
                continue;
            }

            if let Err(e) = self.transition(FsmState::Scanning, "cycle complete") {
                error!(error = %e, "failed to loop back to SCANNING");
            }
        }
    }

    async fn handle_cycle_error(&self, reason: &str) {
        error!(reason, "cycle stage failed");
        let _ = self.transition(FsmState::Error, reason);

        let can_retry = self.retry.write().record_attempt();
        if !can_retry {
            warn!("auto-retry budget exhausted in current window — escalating to EMERGENCY");
            let _ = self.emergency_stop("auto-retry budget exhausted").await;
            return;
        }

        let attempt = {
            let retry = self.retry.read();
            retry.backoff_for_current()
        };
        tokio::time::sleep(attempt).await;
        let _ = self.transition(FsmState::Scanning, "auto-retry recovery");
    }

    /// Awaits `fut` inside `state`'s hard timeout, if it has one. A stage
    /// that blows its budget is reported the same way a stage error is.
    async fn run_stage<T, E: std::fmt::Display>(
        &self,
        state: FsmState,
        fut: impl std::future::Future<Output = Result<T, E>>,
    ) -> Result<T, String> {
        match state.timeout() {
            Some(budget) => match tokio::time::timeout(budget, fut).await {
                Ok(result) => result.map_err(|e| format!("{}: {e}", state.as_str())),
                Err(_) => Err(format!("{}: exceeded {:?} timeout", state.as_str(), budget)),
            },
            None => fut.await.map_err(|e| format!("{}: {e}", state.as_str())),
        }
    }

    /// Runs one full cycle through every stage, short-circuiting to `Err`
    /// with the failure reason on the first stage that fails or times out.
    async fn run_cycle(&self) -> Result<(), String> {
        self.run_stage(FsmState::Scanning, cycle::run_scanning(self)).await?;
        if self.state.position_manager.open_positions().len() as u32
            >= self.state.preset.read().risk.max_concurrent_positions
        {
            // At capacity: skip straight to managing existing positions.
            self.transition(FsmState::Managing, "at max concurrent positions").map_err(|e| e.to_string())?;
            self.run_stage(FsmState::Managing, cycle::run_managing(self)).await?;
            return Ok(());
        }

        self.transition(FsmState::LevelBuilding, "candidates ranked").map_err(|e| e.to_string())?;
        self.run_stage(FsmState::LevelBuilding, cycle::run_level_building(self)).await?;

        self.transition(FsmState::SignalWait, "levels built").map_err(|e| e.to_string())?;
        let signals = self.run_stage(FsmState::SignalWait, cycle::run_signal_wait(self)).await?;

        if signals.is_empty() {
            self.transition(FsmState::Managing, "no signals this cycle").map_err(|e| e.to_string())?;
            self.run_stage(FsmState::Managing, cycle::run_managing(self)).await?;
            return Ok(());
        }

        self.transition(FsmState::Sizing, "signals pending").map_err(|e| e.to_string())?;
        let sized = self.run_stage(FsmState::Sizing, cycle::run_sizing(self, signals)).await?;

        self.transition(FsmState::Execution, "orders sized").map_err(|e| e.to_string())?;
        self.run_stage(FsmState::Execution, cycle::run_execution(self, sized)).await?;

        self.transition(FsmState::Managing, "orders routed").map_err(|e| e.to_string())?;
        self.run_stage(FsmState::Managing, cycle::run_managing(self)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SystemConfig, TradingPreset};
    use crate::exchange::paper;

    fn orchestrator() -> Orchestrator {
        let state = Arc::new(AppState::new(SystemConfig::default(), TradingPreset::default()));
        let adapter = paper::new_shared(10_000.0, state.preset.read().execution_config.clone());
        Orchestrator::new(state, adapter)
    }

    #[test]
    fn starts_idle() {
        assert_eq!(orchestrator().current_state(), FsmState::Idle);
    }

    #[test]
    fn pause_then_resume_round_trips() {
        let orch = orchestrator();
        orch.transition(FsmState::Scanning, "test").unwrap();
        orch.pause().unwrap();
        assert_eq!(orch.current_state(), FsmState::Paused);
        orch.resume().unwrap();
        assert_eq!(orch.current_state(), FsmState::Scanning);
    }

    #[test]
    fn stop_triggers_shutdown_token() {
        let orch = orchestrator();
        orch.stop().unwrap();
        assert!(orch.shutdown_token().is_triggered());
        assert_eq!(orch.current_state(), FsmState::Stopped);
    }

    #[test]
    fn invalid_transition_does_not_panic() {
        let orch = orchestrator();
        // IDLE -> SIZING is not a legal edge.
        let err = orch.transition(FsmState::Sizing, "bad").unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
        assert_eq!(orch.current_state(), FsmState::Idle);
    }
}
