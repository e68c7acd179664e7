// =============================================================================
// Orchestrator state machine — pure transition table, no I/O
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FsmState {
    Idle,
    Initializing,
    Scanning,
    LevelBuilding,
    SignalWait,
    Sizing,
    Execution,
    Managing,
    Paused,
    Error,
    Emergency,
    Stopped,
}

impl FsmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Initializing => "INITIALIZING",
            Self::Scanning => "SCANNING",
            Self::LevelBuilding => "LEVEL_BUILDING",
            Self::SignalWait => "SIGNAL_WAIT",
            Self::Sizing => "SIZING",
            Self::Execution => "EXECUTION",
            Self::Managing => "MANAGING",
            Self::Paused => "PAUSED",
            Self::Error => "ERROR",
            Self::Emergency => "EMERGENCY",
            Self::Stopped => "STOPPED",
        }
    }

    /// Per-state hard timeout, `None` for states with no suspension point.
    pub fn timeout(&self) -> Option<std::time::Duration> {
        use std::time::Duration;
        match self {
            Self::Scanning => Some(Duration::from_secs(60)),
            Self::LevelBuilding => Some(Duration::from_secs(30)),
            Self::SignalWait => Some(Duration::from_secs(30)),
            Self::Sizing => Some(Duration::from_secs(10)),
            Self::Execution => Some(Duration::from_secs(60)),
            _ => None,
        }
    }

    fn allowed_next(&self) -> &'static [FsmState] {
        use FsmState::*;
        match self {
            Idle => &[Initializing, Scanning, Stopped, Error],
            Initializing => &[Scanning, Error, Emergency, Stopped],
            Scanning => &[LevelBuilding, Managing, Paused, Error, Emergency, Stopped],
            LevelBuilding => &[SignalWait, Scanning, Error, Emergency, Stopped],
            SignalWait => &[Sizing, Managing, Scanning, Paused, Error, Emergency, Stopped],
            Sizing => &[Execution, Scanning, Error, Emergency, Stopped],
            Execution => &[Managing, Scanning, Error, Emergency, Stopped],
            Managing => &[Scanning, Managing, Paused, Error, Emergency, Stopped],
            Paused => &[Scanning, Managing, Idle, Error, Emergency, Stopped],
            Error => &[Scanning, Managing, Idle, Emergency, Stopped],
            Emergency => &[Stopped, Idle],
            Stopped => &[Idle, Initializing],
        }
    }

    /// Validate a transition, including same-state idempotent re-entry.
    pub fn validate_transition(&self, to: FsmState) -> Result<(), EngineError> {
        if *self == to {
            return Ok(());
        }
        if self.allowed_next().contains(&to) {
            Ok(())
        } else {
            Err(EngineError::InvalidTransition {
                from: self.as_str().to_string(),
                to: to.as_str().to_string(),
            })
        }
    }
}

impl std::fmt::Display for FsmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Backoff schedule for auto-retry out of `ERROR`: 1s, 2s, 4s, capped at 30s;
/// at most 5 automated recoveries per 5-minute window before `EMERGENCY`.
pub struct RetryPolicy {
    attempts_in_window: u32,
    window_started: std::time::Instant,
}

const MAX_AUTO_RECOVERIES_PER_WINDOW: u32 = 5;
const WINDOW: std::time::Duration = std::time::Duration::from_secs(300);

impl RetryPolicy {
    pub fn new() -> Self {
        Self { attempts_in_window: 0, window_started: std::time::Instant::now() }
    }

    /// Backoff duration for the Nth retry (1-indexed), capped at 30s.
    pub fn backoff_for(attempt: u32) -> std::time::Duration {
        let secs = 2u64.saturating_pow(attempt.saturating_sub(1)).min(30);
        std::time::Duration::from_secs(secs)
    }

    /// Record an auto-retry attempt. Returns `true` if recovery may proceed,
    /// `false` if the window's recovery budget is exhausted and the caller
    /// must transition to `EMERGENCY` instead.
    pub fn record_attempt(&mut self) -> bool {
        if self.window_started.elapsed() >= WINDOW {
            self.attempts_in_window = 0;
            self.window_started = std::time::Instant::now();
        }
        self.attempts_in_window += 1;
        self.attempts_in_window <= MAX_AUTO_RECOVERIES_PER_WINDOW
    }

    /// Backoff duration for the attempt most recently recorded via
    /// `record_attempt`.
    pub fn backoff_for_current(&self) -> std::time::Duration {
        Self::backoff_for(self.attempts_in_window)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_state_reentry_is_idempotent() {
        assert!(FsmState::Scanning.validate_transition(FsmState::Scanning).is_ok());
    }

    #[test]
    fn scanning_to_level_building_allowed() {
        assert!(FsmState::Scanning.validate_transition(FsmState::LevelBuilding).is_ok());
    }

    #[test]
    fn idle_to_sizing_rejected() {
        let err = FsmState::Idle.validate_transition(FsmState::Sizing).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[test]
    fn emergency_is_terminal_except_stopped_and_idle() {
        assert!(FsmState::Emergency.validate_transition(FsmState::Stopped).is_ok());
        assert!(FsmState::Emergency.validate_transition(FsmState::Idle).is_ok());
        assert!(FsmState::Emergency.validate_transition(FsmState::Scanning).is_err());
    }

    #[test]
    fn backoff_schedule_caps_at_thirty_seconds() {
        assert_eq!(RetryPolicy::backoff_for(1), std::time::Duration::from_secs(1));
        assert_eq!(RetryPolicy::backoff_for(2), std::time::Duration::from_secs(2));
        assert_eq!(RetryPolicy::backoff_for(3), std::time::Duration::from_secs(4));
        assert_eq!(RetryPolicy::backoff_for(10), std::time::Duration::from_secs(30));
    }

    #[test]
    fn retry_policy_exhausts_after_five_in_window() {
        let mut policy = RetryPolicy::new();
        for _ in 0..5 {
            assert!(policy.record_attempt());
        }
        assert!(!policy.record_attempt());
    }
}
