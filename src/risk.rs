// =============================================================================
// Risk Engine — pre-trade gates, R-model sizing, and the kill-switch latch
// =============================================================================
//
// Gate order on every entry attempt (short-circuit, first failure wins):
//   1. Kill switch        — latched state; only a manual clear lifts it.
//   2. Daily risk limit   — cumulative R lost today.
//   3. Concurrent positions.
//   4. Consecutive losses — also latches the kill switch when it trips.
//   5. Correlation cap    — candidate too correlated with an open position.
//
// The kill switch itself is latched whenever any of three conditions holds:
// cumulative equity drawdown past `kill_switch_loss_limit`, daily R loss past
// `daily_risk_limit`, or a consecutive-loss streak past `max_consecutive_losses`.
// None of these auto-clear at day rollover — only `clear_kill_switch` does,
// mirroring the consecutive-failure circuit breaker idiom from the wider
// risk-orchestration ecosystem, kept permanent here rather than soft, since a
// losing streak severe enough to trip it is exactly the case a daily reset
// should not silently forgive.
//
// Sizing follows the R model: risk a fixed fraction of equity per trade,
// sized off the signal's stop distance, then four ordered adjustments clamp
// it to what the venue and current risk posture can actually support.
// =============================================================================

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::config::{ExecutionConfig, RiskConfig};
use crate::error::EngineError;
use crate::exchange::MarketSpec;
use crate::types::RiskMetrics;

struct Inner {
    equity: f64,
    peak_equity: f64,
    daily_pnl_usd: f64,
    daily_pnl_r: f64,
    consecutive_losses: u32,
    open_positions: u32,
    current_date: String,
    kill_switch_active: bool,
    kill_reason: Option<String>,
}

pub struct RiskEngine {
    state: RwLock<Inner>,
    config: RiskConfig,
}

/// Result of the R-model sizing pipeline.
#[derive(Debug, Clone, Copy)]
pub struct SizedOrder {
    pub qty: f64,
    /// Set when the depth constraint clamp was binding by more than 1.5x —
    /// the execution manager should route this as a TWAP slice train.
    pub mark_for_twap: bool,
}

impl RiskEngine {
    pub fn new(starting_equity: f64, config: RiskConfig) -> Self {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        info!(
            starting_equity,
            risk_per_trade = config.risk_per_trade,
            max_concurrent_positions = config.max_concurrent_positions,
            daily_risk_limit = config.daily_risk_limit,
            kill_switch_loss_limit = config.kill_switch_loss_limit,
            "risk engine initialised"
        );
        Self {
            state: RwLock::new(Inner {
                equity: starting_equity,
                peak_equity: starting_equity,
                daily_pnl_usd: 0.0,
                daily_pnl_r: 0.0,
                consecutive_losses: 0,
                open_positions: 0,
                current_date: today,
                kill_switch_active: false,
                kill_reason: None,
            }),
            config,
        }
    }

    // -------------------------------------------------------------------------
    // Pre-trade gate
    // -------------------------------------------------------------------------

    /// Evaluates the five-gate order. `candidate_correlations` is the
    /// absolute pairwise correlation of the candidate symbol against each
    /// currently open position; any entry exceeding `correlation_limit`
    /// rejects.
    pub fn can_open_position(&self, candidate_correlations: &[f64]) -> Result<(), EngineError> {
        self.maybe_reset_daily();
        let mut s = self.state.write();

        if s.kill_switch_active {
            return Err(EngineError::risk_denied(format!(
                "kill switch active: {}",
                s.kill_reason.as_deref().unwrap_or("unspecified")
            )));
        }
        if -s.daily_pnl_r >= self.config.daily_risk_limit {
            return Err(EngineError::risk_denied(format!(
                "daily_risk_limit reached ({:.2}R lost, limit {:.2}R)",
                -s.daily_pnl_r, self.config.daily_risk_limit
            )));
        }
        if s.open_positions >= self.config.max_concurrent_positions {
            return Err(EngineError::risk_denied(format!(
                "max_concurrent_positions reached ({}/{})",
                s.open_positions, self.config.max_concurrent_positions
            )));
        }
        if s.consecutive_losses >= self.config.max_consecutive_losses {
            let reason = format!(
                "{} consecutive losses (limit {})",
                s.consecutive_losses, self.config.max_consecutive_losses
            );
            if !s.kill_switch_active {
                warn!(reason = %reason, "kill switch latched: consecutive losses");
                s.kill_switch_active = true;
                s.kill_reason = Some(reason.clone());
            }
            return Err(EngineError::risk_denied(reason));
        }
        if candidate_correlations.iter().any(|c| c.abs() > self.config.correlation_limit) {
            return Err(EngineError::risk_denied(format!(
                "candidate exceeds correlation_limit ({:.2})",
                self.config.correlation_limit
            )));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Position sizing
    // -------------------------------------------------------------------------

    /// Sizes a position so a stop-loss fill risks `risk_per_trade` fraction
    /// of current equity, then applies the four ordered adjustments: max
    /// notional clamp, depth-constraint clamp (flagging TWAP when binding),
    /// exchange-precision rounding, and soft risk-reduction.
    pub fn size_position(
        &self,
        entry: f64,
        stop_loss: f64,
        available_depth_at_entry_side: f64,
        market_spec: &MarketSpec,
        execution: &ExecutionConfig,
        min_stop_distance_ticks: f64,
    ) -> Result<SizedOrder, EngineError> {
        let stop_distance = (entry - stop_loss).abs();
        if stop_distance <= 0.0 || entry <= 0.0 {
            return Err(EngineError::risk_denied("stop distance must be positive"));
        }
        if market_spec.price_tick > 0.0 {
            let min_stop_distance = min_stop_distance_ticks * market_spec.price_tick;
            if stop_distance < min_stop_distance {
                return Err(EngineError::risk_denied(format!(
                    "stop distance {stop_distance} below min_stop_distance {min_stop_distance} ({min_stop_distance_ticks} ticks)"
                )));
            }
        }

        let s = self.state.read();
        let risk_usd = s.equity * self.config.risk_per_trade;
        let mut qty = risk_usd / stop_distance;

        // Adjustment 1: max notional.
        if let Some(cap_usd) = self.config.max_position_size_usd {
            qty = qty.min(cap_usd / entry);
        }

        // Adjustment 2: depth constraint, flagging TWAP if binding by > 1.5x.
        let mut mark_for_twap = false;
        let depth_cap = execution.max_depth_fraction * available_depth_at_entry_side / entry;
        if depth_cap > 0.0 && qty > depth_cap {
            if qty > depth_cap * 1.5 {
                mark_for_twap = true;
            }
            qty = depth_cap;
        }

        // Adjustment 3: exchange precision.
        if market_spec.amount_step > 0.0 {
            qty = (qty / market_spec.amount_step).floor() * market_spec.amount_step;
        }
        if qty < market_spec.min_qty {
            return Err(EngineError::risk_denied(format!(
                "rounded qty {qty} below min_qty {}",
                market_spec.min_qty
            )));
        }

        // Adjustment 4: soft risk-reduction.
        let daily_risk_used_pct = if self.config.daily_risk_limit > 0.0 {
            (-s.daily_pnl_r / self.config.daily_risk_limit).max(0.0)
        } else {
            0.0
        };
        let drawdown_r = if s.peak_equity > 0.0 && self.config.risk_per_trade > 0.0 {
            ((s.peak_equity - s.equity) / s.peak_equity) / self.config.risk_per_trade
        } else {
            0.0
        };
        let near_capacity = s.open_positions == self.config.max_concurrent_positions.saturating_sub(0);
        if daily_risk_used_pct >= 0.8
            || drawdown_r >= 0.5 * (self.config.kill_switch_loss_limit / self.config.risk_per_trade.max(1e-9))
            || near_capacity
        {
            qty *= 0.5;
        }

        Ok(SizedOrder { qty, mark_for_twap })
    }

    // -------------------------------------------------------------------------
    // Trade lifecycle bookkeeping
    // -------------------------------------------------------------------------

    pub fn register_position_opened(&self) {
        self.state.write().open_positions += 1;
    }

    pub fn register_position_closed(&self, realized_pnl_usd: f64, realized_pnl_r: f64) {
        self.maybe_reset_daily();
        let mut s = self.state.write();
        s.open_positions = s.open_positions.saturating_sub(1);
        s.equity += realized_pnl_usd;
        s.daily_pnl_usd += realized_pnl_usd;
        s.daily_pnl_r += realized_pnl_r;

        if s.equity > s.peak_equity {
            s.peak_equity = s.equity;
        }
        if realized_pnl_r < 0.0 {
            s.consecutive_losses += 1;
        } else {
            s.consecutive_losses = 0;
        }

        Self::recompute_kill_switch(&mut s, &self.config);

        debug!(
            realized_pnl_usd,
            realized_pnl_r,
            daily_pnl_r = s.daily_pnl_r,
            consecutive_losses = s.consecutive_losses,
            "position closed, risk counters updated"
        );
    }

    /// Kill-switch semantics: latched when cumulative equity drawdown, daily
    /// R loss, or the consecutive-loss streak crosses its respective limit.
    fn recompute_kill_switch(s: &mut Inner, config: &RiskConfig) {
        if s.kill_switch_active {
            return;
        }
        let drawdown_pct = if s.peak_equity > 0.0 {
            (s.peak_equity - s.equity) / s.peak_equity
        } else {
            0.0
        };
        let reason = if drawdown_pct >= config.kill_switch_loss_limit {
            Some(format!(
                "equity drawdown {:.2}% from peak (limit {:.2}%)",
                drawdown_pct * 100.0,
                config.kill_switch_loss_limit * 100.0
            ))
        } else if -s.daily_pnl_r >= config.daily_risk_limit {
            Some(format!(
                "daily_pnl_r {:.2}R at or below -{:.2}R limit",
                s.daily_pnl_r, config.daily_risk_limit
            ))
        } else if s.consecutive_losses >= config.max_consecutive_losses {
            Some(format!(
                "{} consecutive losses (limit {})",
                s.consecutive_losses, config.max_consecutive_losses
            ))
        } else {
            None
        };
        if let Some(reason) = reason {
            warn!(reason = %reason, "kill switch latched");
            s.kill_switch_active = true;
            s.kill_reason = Some(reason);
        }
    }

    /// Manually clears the kill switch. The only way to resume trading after
    /// it latches — never done automatically, including at day rollover.
    pub fn clear_kill_switch(&self) {
        let mut s = self.state.write();
        s.kill_switch_active = false;
        s.kill_reason = None;
        info!("kill switch cleared manually");
    }

    /// Daily R budget not yet consumed, for callers (e.g. the add-on rule)
    /// that need to admit incremental risk without going through the full
    /// entry gate.
    pub fn remaining_daily_risk_r(&self) -> f64 {
        self.maybe_reset_daily();
        let s = self.state.read();
        (self.config.daily_risk_limit + s.daily_pnl_r).max(0.0)
    }

    pub fn snapshot(&self) -> RiskMetrics {
        self.maybe_reset_daily();
        let s = self.state.read();
        let current_drawdown_r = if s.peak_equity > 0.0 && self.config.risk_per_trade > 0.0 {
            ((s.peak_equity - s.equity) / s.peak_equity) / self.config.risk_per_trade
        } else {
            0.0
        };
        RiskMetrics {
            account_equity: s.equity,
            daily_pnl_usd: s.daily_pnl_usd,
            daily_pnl_r: s.daily_pnl_r,
            peak_equity: s.peak_equity,
            current_drawdown_r,
            consecutive_losses: s.consecutive_losses,
            open_positions: s.open_positions,
            daily_risk_used_pct: if self.config.daily_risk_limit > 0.0 {
                ((-s.daily_pnl_r) / self.config.daily_risk_limit * 100.0).max(0.0)
            } else {
                0.0
            },
            kill_switch_active: s.kill_switch_active,
            reason: s.kill_reason.clone(),
        }
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// Daily PnL counters reset at calendar rollover; the kill switch does not.
    fn maybe_reset_daily(&self) {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        {
            let s = self.state.read();
            if s.current_date == today {
                return;
            }
        }
        let mut s = self.state.write();
        if s.current_date != today {
            info!(old_date = %s.current_date, new_date = %today, "date rolled, resetting daily risk counters");
            s.daily_pnl_usd = 0.0;
            s.daily_pnl_r = 0.0;
            s.current_date = today;
        }
    }
}

impl std::fmt::Debug for RiskEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskEngine")
            .field("risk_per_trade", &self.config.risk_per_trade)
            .field("max_concurrent_positions", &self.config.max_concurrent_positions)
            .field("daily_risk_limit", &self.config.daily_risk_limit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> RiskEngine {
        RiskEngine::new(10_000.0, RiskConfig::default())
    }

    fn market_spec() -> MarketSpec {
        MarketSpec {
            symbol: "BTCUSDT".into(),
            base: "BTC".into(),
            quote: "USDT".into(),
            amount_step: 0.001,
            price_tick: 0.1,
            min_qty: 0.001,
            min_notional: 5.0,
            contract_type: "linear_perpetual".into(),
        }
    }

    #[test]
    fn sizes_position_to_risk_fraction_of_equity() {
        let engine = engine();
        let sized = engine
            .size_position(100.0, 99.0, 1_000_000.0, &market_spec(), &ExecutionConfig::default(), 2.0)
            .unwrap();
        let risked = sized.qty * 1.0;
        assert!((risked - 10_000.0 * engine.config.risk_per_trade).abs() < 1.0);
    }

    #[test]
    fn depth_constraint_marks_twap_when_binding_hard() {
        let engine = engine();
        let mut execution = ExecutionConfig::default();
        execution.max_depth_fraction = 0.1;
        let sized = engine.size_position(100.0, 99.0, 10.0, &market_spec(), &execution, 2.0).unwrap();
        assert!(sized.mark_for_twap);
    }

    #[test]
    fn stop_distance_below_min_ticks_rejected() {
        let engine = engine();
        // price_tick 0.1, min_stop_distance_ticks 2.0 => min distance 0.2
        let sized = engine.size_position(100.0, 99.95, 1_000_000.0, &market_spec(), &ExecutionConfig::default(), 2.0);
        assert!(sized.is_err());
    }

    #[test]
    fn max_concurrent_positions_denies_further_entries() {
        let engine = engine();
        for _ in 0..engine.config.max_concurrent_positions {
            engine.register_position_opened();
        }
        assert!(engine.can_open_position(&[]).is_err());
    }

    #[test]
    fn consecutive_losses_latch_kill_switch_and_persist() {
        let mut config = RiskConfig::default();
        config.max_consecutive_losses = 2;
        let engine = RiskEngine::new(10_000.0, config);
        engine.register_position_closed(-50.0, -0.5);
        engine.register_position_closed(-50.0, -0.5);
        assert!(engine.can_open_position(&[]).is_err());
        assert!(engine.snapshot().kill_switch_active);
    }

    #[test]
    fn winning_trade_resets_consecutive_loss_streak() {
        let engine = engine();
        engine.register_position_closed(-50.0, -0.5);
        engine.register_position_closed(100.0, 1.0);
        assert_eq!(engine.snapshot().consecutive_losses, 0);
    }

    #[test]
    fn clear_kill_switch_restores_trading() {
        let mut config = RiskConfig::default();
        config.max_consecutive_losses = 1;
        let engine = RiskEngine::new(10_000.0, config);
        engine.register_position_closed(-50.0, -0.5);
        assert!(engine.can_open_position(&[]).is_err());
        engine.clear_kill_switch();
        assert!(engine.can_open_position(&[]).is_ok());
    }

    #[test]
    fn correlated_candidate_rejected() {
        let engine = engine();
        assert!(engine.can_open_position(&[0.95]).is_err());
    }
}
