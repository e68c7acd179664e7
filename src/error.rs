// =============================================================================
// Typed error taxonomy for the trading core
// =============================================================================
//
// Every core operation (orchestrator, scanner, signal generator, risk,
// execution, position manager) returns `Result<T, EngineError>`. Exchange
// adapter I/O that is not yet classified continues to flow through
// `anyhow::Result` and is converted at the adapter boundary (see
// `exchange::mod::AdapterError`).
//
// Kill-switch is deliberately not a variant here — it is a first-class
// latched state on `RiskMetrics`, not an error (spec taxonomy, see risk.rs).
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("config invalid: {reason}")]
    ConfigInvalid { reason: String },

    #[error("exchange unreachable ({component}): {reason}")]
    ExchangeUnreachable { component: String, reason: String },

    #[error("exchange rejected request ({component}): {reason}")]
    ExchangeRejected { component: String, reason: String },

    #[error("market data stale for {symbol} (age_ms={age_ms})")]
    DataStale { symbol: String, age_ms: i64 },

    #[error("invalid FSM transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("risk denied: {reason}")]
    RiskDenied { reason: String },

    #[error("execution timed out ({component}): {reason}")]
    ExecutionTimeout { component: String, reason: String },

    #[error("slippage exceeded permitted band: {slippage_bps} bps (limit {limit_bps} bps)")]
    SlippageExceeded { slippage_bps: f64, limit_bps: f64 },

    #[error("in-flight order already pending for {position_id}/{intent}")]
    InFlight { position_id: String, intent: String },

    #[error("internal invariant violated ({component}/{stage}): {reason}")]
    Internal {
        component: String,
        stage: String,
        reason: String,
    },
}

impl EngineError {
    /// Component name used for structured logging, matching the
    /// `component`/`stage`/`reason` triple required by the error-handling
    /// design (every error produces a structured log entry).
    pub fn component(&self) -> &str {
        match self {
            Self::ConfigInvalid { .. } => "config",
            Self::ExchangeUnreachable { component, .. } => component,
            Self::ExchangeRejected { component, .. } => component,
            Self::DataStale { .. } => "market_data",
            Self::InvalidTransition { .. } => "orchestrator",
            Self::RiskDenied { .. } => "risk",
            Self::ExecutionTimeout { component, .. } => component,
            Self::SlippageExceeded { .. } => "execution",
            Self::InFlight { .. } => "position_manager",
            Self::Internal { component, .. } => component,
        }
    }

    pub fn config_invalid(reason: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            reason: reason.into(),
        }
    }

    pub fn risk_denied(reason: impl Into<String>) -> Self {
        Self::RiskDenied {
            reason: reason.into(),
        }
    }

    pub fn internal(
        component: impl Into<String>,
        stage: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Internal {
            component: component.into(),
            stage: stage.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_transition(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::InvalidTransition {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// Log an `EngineError` as a structured entry and return it, for use at
/// `?`-propagation sites that also need the error surfaced to diagnostics.
pub fn log_and_return<T>(err: EngineError) -> Result<T, EngineError> {
    tracing::error!(component = err.component(), error = %err, "engine error");
    Err(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn component_extraction() {
        let e = EngineError::risk_denied("daily_risk_limit_exceeded");
        assert_eq!(e.component(), "risk");
    }

    #[test]
    fn invalid_transition_message() {
        let e = EngineError::invalid_transition("SCANNING", "EXECUTION");
        assert!(e.to_string().contains("SCANNING -> EXECUTION"));
    }
}
