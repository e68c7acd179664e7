// =============================================================================
// Position Manager — per-position trackers: TP ladder, breakeven, chandelier
// trail, add-on, time stop, panic exit
// =============================================================================
//
// Generalizes the teacher's simpler TP1/TP2-plus-fixed-trailing-stop ladder
// into the configurable rung list `PositionConfig::tp_ladder()` drives, and
// its fixed-percentage trail into a true chandelier stop. `evaluate_tick`
// keeps the teacher's `check_exits` shape — one pass per open position per
// tick, ordered checks, mutate-then-report — but reports `UpdateInstruction`s
// instead of closing positions directly, since exits and partials here route
// through the execution manager rather than filling synchronously.
//
// Concurrency discipline: at most one outstanding order per (position,
// intent). `try_begin` is a depth-2 admission counter — first caller
// proceeds, a second coalesces into it, a third is rejected with `InFlight`.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::config::PositionConfig;
use crate::error::EngineError;
use crate::types::{OrderIntent, Position, PositionState, Side};

/// One action the caller (orchestrator) must route through the execution
/// manager, or apply locally in the case of `MoveSl`.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateInstruction {
    MoveSl { position_id: String, new_sl: f64 },
    PartialClose { position_id: String, intent: OrderIntent, qty: f64, reason: String },
    FullClose { position_id: String, intent: OrderIntent, reason: String },
    AddOn { position_id: String, qty: f64 },
}

/// What `confirm_fill` produced once an exchange fill for a tp/sl/exit/add-on
/// instruction comes back.
#[derive(Debug, Clone, Copy)]
pub struct FillOutcome {
    pub realized_pnl_usd: f64,
    pub realized_pnl_r: f64,
    pub position_closed: bool,
}

/// Market context a single tick needs to evaluate one position.
#[derive(Debug, Clone, Copy)]
pub struct TickContext {
    pub current_price: f64,
    pub atr_5m: f64,
    pub atr_1m: f64,
    pub now_ts: i64,
}

pub struct PositionManager {
    open: RwLock<HashMap<String, Position>>,
    closed: RwLock<Vec<Position>>,
    in_flight: RwLock<HashMap<(String, OrderIntent), u8>>,
    config: PositionConfig,
    taker_fee_bps: f64,
}

impl PositionManager {
    pub fn new(config: PositionConfig, taker_fee_bps: f64) -> Self {
        Self {
            open: RwLock::new(HashMap::new()),
            closed: RwLock::new(Vec::new()),
            in_flight: RwLock::new(HashMap::new()),
            config,
            taker_fee_bps,
        }
    }

    pub fn open_position(&self, position: Position) {
        info!(id = %position.id, symbol = %position.symbol, entry = position.entry_price, "position opened");
        self.open.write().insert(position.id.clone(), position);
    }

    pub fn get(&self, position_id: &str) -> Option<Position> {
        self.open.read().get(position_id).cloned()
    }

    pub fn open_positions(&self) -> Vec<Position> {
        self.open.read().values().cloned().collect()
    }

    pub fn closed_positions(&self, count: usize) -> Vec<Position> {
        let closed = self.closed.read();
        closed.iter().rev().take(count).cloned().collect()
    }

    /// Depth-2 admission counter for the (position, intent) in-flight rule.
    /// `Ok(true)` — caller should submit a new order. `Ok(false)` — an order
    /// is already in flight, this request coalesced into it. `Err` — a third
    /// concurrent request on the same family.
    fn try_begin(&self, position_id: &str, intent: OrderIntent) -> Result<bool, EngineError> {
        let mut map = self.in_flight.write();
        let entry = map.entry((position_id.to_string(), intent)).or_insert(0);
        match *entry {
            0 => {
                *entry = 1;
                Ok(true)
            }
            1 => {
                *entry = 2;
                Ok(false)
            }
            _ => Err(EngineError::InFlight {
                position_id: position_id.to_string(),
                intent: format!("{intent:?}"),
            }),
        }
    }

    fn finish(&self, position_id: &str, intent: OrderIntent) {
        let mut map = self.in_flight.write();
        let key = (position_id.to_string(), intent);
        if let Some(count) = map.get_mut(&key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                map.remove(&key);
            }
        }
    }

    /// Evaluates one position for this tick: panic exit, stop loss, TP
    /// ladder (with breakeven move on TP1), chandelier trail, time stop —
    /// in that order, each short-circuiting on a full close.
    #[instrument(skip(self, ctx), fields(position_id = %position_id))]
    pub fn evaluate_tick(&self, position_id: &str, ctx: &TickContext) -> Result<Vec<UpdateInstruction>, EngineError> {
        let mut open = self.open.write();
        let position = open.get_mut(position_id).ok_or_else(|| {
            EngineError::internal("position_manager", "evaluate_tick", format!("unknown position {position_id}"))
        })?;
        if position.state == PositionState::Closed {
            return Ok(Vec::new());
        }

        let hh = position.meta.highest_high_since_entry.unwrap_or(position.entry_price).max(ctx.current_price);
        let ll = position.meta.lowest_low_since_entry.unwrap_or(position.entry_price).min(ctx.current_price);
        position.meta.highest_high_since_entry = Some(hh);
        position.meta.lowest_low_since_entry = Some(ll);

        let pnl_r = position.current_pnl_r(ctx.current_price);
        let mut instructions = Vec::new();

        // ── Panic exit — adverse excursion vs 1m ATR, bypasses everything else.
        let adverse_excursion = match position.side {
            Side::Long => position.entry_price - ctx.current_price,
            Side::Short => ctx.current_price - position.entry_price,
        };
        if ctx.atr_1m > 0.0 && adverse_excursion > self.config.panic_exit_atr_mult * ctx.atr_1m {
            if self.try_begin(position_id, OrderIntent::Exit)? {
                position.state = PositionState::Closing;
                warn!(adverse_excursion, atr_1m = ctx.atr_1m, "panic exit triggered");
                instructions.push(UpdateInstruction::FullClose {
                    position_id: position_id.to_string(),
                    intent: OrderIntent::Exit,
                    reason: "panic_exit".to_string(),
                });
            }
            return Ok(instructions);
        }

        // ── Stop loss.
        let stop_hit = match position.side {
            Side::Long => ctx.current_price <= position.stop_loss,
            Side::Short => ctx.current_price >= position.stop_loss,
        };
        if stop_hit {
            if self.try_begin(position_id, OrderIntent::Sl)? {
                position.state = PositionState::Closing;
                instructions.push(UpdateInstruction::FullClose {
                    position_id: position_id.to_string(),
                    intent: OrderIntent::Sl,
                    reason: "stop_loss".to_string(),
                });
            }
            return Ok(instructions);
        }

        // ── Take-profit ladder, breakeven move on TP1.
        for (idx, (r_multiple, size_fraction)) in position.take_profit_levels.clone().into_iter().enumerate() {
            if position.meta.tp_rungs_executed.contains(&idx) || pnl_r < r_multiple {
                continue;
            }
            if !self.try_begin(position_id, OrderIntent::Tp)? {
                continue;
            }
            let qty = (size_fraction * position.initial_qty).min(position.qty_open);
            if qty <= 0.0 {
                self.finish(position_id, OrderIntent::Tp);
                continue;
            }
            position.meta.tp_rungs_executed.push(idx);
            position.state = PositionState::Reducing;
            debug!(rung = idx, r_multiple, qty, "tp rung triggered");
            instructions.push(UpdateInstruction::PartialClose {
                position_id: position_id.to_string(),
                intent: OrderIntent::Tp,
                qty,
                reason: format!("tp{}", idx + 1),
            });

            if idx == 0 && !position.meta.breakeven_moved {
                let cushion = 2.0 * self.taker_fee_bps * position.entry_price / 10_000.0;
                let new_sl = match position.side {
                    Side::Long => position.entry_price + cushion,
                    Side::Short => position.entry_price - cushion,
                };
                position.stop_loss = new_sl;
                position.meta.breakeven_moved = true;
                position.meta.trail_anchor = Some(new_sl);
                instructions.push(UpdateInstruction::MoveSl { position_id: position_id.to_string(), new_sl });
            }
        }

        // ── Chandelier trail, active once breakeven has moved. Ratchets
        // favorably only.
        if position.meta.breakeven_moved {
            let chandelier_sl = match position.side {
                Side::Long => hh - self.config.chandelier_atr_mult * ctx.atr_5m,
                Side::Short => ll + self.config.chandelier_atr_mult * ctx.atr_5m,
            };
            let improves = match position.side {
                Side::Long => chandelier_sl > position.stop_loss,
                Side::Short => chandelier_sl < position.stop_loss,
            };
            if improves {
                position.stop_loss = chandelier_sl;
                position.meta.trail_anchor = Some(chandelier_sl);
                instructions.push(UpdateInstruction::MoveSl { position_id: position_id.to_string(), new_sl: chandelier_sl });
            }
        }

        // ── Time stop.
        let hours_open = (ctx.now_ts - position.opened_ts) as f64 / 3_600_000.0;
        if hours_open >= self.config.max_hold_time_hours && pnl_r < 1.0 && self.try_begin(position_id, OrderIntent::Exit)? {
            position.state = PositionState::Closing;
            instructions.push(UpdateInstruction::FullClose {
                position_id: position_id.to_string(),
                intent: OrderIntent::Exit,
                reason: "time_stop".to_string(),
            });
        }

        Ok(instructions)
    }

    /// Pullback-to-9-EMA add-on, allowed once per position. `obv_confirms`
    /// and `incremental_risk_r` are computed by the caller, which has access
    /// to the order-flow and risk-sizing context this module doesn't own.
    pub fn try_add_on(
        &self,
        position_id: &str,
        current_price: f64,
        ema9_5m: f64,
        obv_confirms: bool,
        incremental_risk_r: f64,
        daily_risk_remaining_r: f64,
    ) -> Result<Option<UpdateInstruction>, EngineError> {
        if !self.config.add_on_enabled {
            return Ok(None);
        }
        if !self.try_begin(position_id, OrderIntent::AddOn)? {
            return Ok(None);
        }

        let mut open = self.open.write();
        let Some(position) = open.get_mut(position_id) else {
            self.finish(position_id, OrderIntent::AddOn);
            return Ok(None);
        };

        if position.meta.adds_done > 0 || position.state == PositionState::Closed {
            self.finish(position_id, OrderIntent::AddOn);
            return Ok(None);
        }

        const PULLBACK_BAND: f64 = 0.004;
        let pullback_ok = match position.side {
            Side::Long => {
                current_price > position.entry_price
                    && (current_price - ema9_5m).abs() / ema9_5m.max(1e-9) <= PULLBACK_BAND
            }
            Side::Short => {
                current_price < position.entry_price
                    && (current_price - ema9_5m).abs() / ema9_5m.max(1e-9) <= PULLBACK_BAND
            }
        };
        let flow_confirms = match position.side {
            Side::Long => obv_confirms,
            Side::Short => !obv_confirms,
        };
        if !pullback_ok || !flow_confirms || incremental_risk_r > daily_risk_remaining_r {
            self.finish(position_id, OrderIntent::AddOn);
            return Ok(None);
        }

        let add_qty = self.config.add_on_max_size_pct * position.initial_qty;
        position.initial_qty += add_qty;
        position.qty_open += add_qty;
        position.meta.adds_done += 1;
        info!(add_qty, "add-on triggered");

        Ok(Some(UpdateInstruction::AddOn { position_id: position_id.to_string(), qty: add_qty }))
    }

    /// Reconciles a confirmed fill for a tp/sl/exit/add-on instruction,
    /// moving the position to `closed` if this fill emptied it.
    pub fn confirm_fill(
        &self,
        position_id: &str,
        intent: OrderIntent,
        filled_qty: f64,
        fill_price: f64,
        fees_usd: f64,
    ) -> Result<FillOutcome, EngineError> {
        self.finish(position_id, intent);

        let mut open = self.open.write();
        let position = open.get_mut(position_id).ok_or_else(|| {
            EngineError::internal("position_manager", "confirm_fill", format!("unknown position {position_id}"))
        })?;

        let price_pnl_per_unit = match position.side {
            Side::Long => fill_price - position.entry_price,
            Side::Short => position.entry_price - fill_price,
        };
        let pnl_usd = price_pnl_per_unit * filled_qty - fees_usd;
        let pnl_r = if position.initial_stop_distance > 0.0 && position.initial_qty > 0.0 {
            (price_pnl_per_unit / position.initial_stop_distance) * (filled_qty / position.initial_qty)
        } else {
            0.0
        };

        position.qty_open = (position.qty_open - filled_qty).max(0.0);
        position.realized_pnl_usd += pnl_usd;
        position.realized_pnl_r += pnl_r;

        let closed = position.qty_open <= 1e-9;
        if closed {
            position.qty_open = 0.0;
            position.state = PositionState::Closed;
        } else if position.state == PositionState::Closing {
            position.state = PositionState::Reducing;
        }

        let outcome = FillOutcome { realized_pnl_usd: pnl_usd, realized_pnl_r: pnl_r, position_closed: closed };
        debug!(?outcome, "fill confirmed");

        if closed {
            if let Some(finished) = open.remove(position_id) {
                drop(open);
                self.closed.write().push(finished);
            }
        }

        Ok(outcome)
    }
}

impl std::fmt::Debug for PositionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionManager")
            .field("open_count", &self.open.read().len())
            .field("closed_count", &self.closed.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AccountMode, PositionMeta, Strategy};

    fn position(side: Side, entry: f64, stop: f64) -> Position {
        Position {
            id: "pos-1".to_string(),
            symbol: "BTCUSDT".to_string(),
            side,
            qty_open: 1.0,
            initial_qty: 1.0,
            entry_price: entry,
            stop_loss: stop,
            take_profit_levels: PositionConfig::default().tp_ladder(),
            realized_pnl_usd: 0.0,
            realized_pnl_r: 0.0,
            opened_ts: 0,
            mode: AccountMode::Paper,
            strategy: Strategy::Momentum,
            state: PositionState::Open,
            origin_signal_id: None,
            meta: PositionMeta::default(),
            initial_stop_distance: (entry - stop).abs(),
        }
    }

    fn ctx(price: f64) -> TickContext {
        TickContext { current_price: price, atr_5m: 1.0, atr_1m: 0.3, now_ts: 0 }
    }

    #[test]
    fn stop_loss_hit_produces_full_close_and_latches_in_flight() {
        let mgr = PositionManager::new(PositionConfig::default(), 5.0);
        mgr.open_position(position(Side::Long, 100.0, 99.0));
        let instructions = mgr.evaluate_tick("pos-1", &ctx(98.5)).unwrap();
        assert_eq!(instructions.len(), 1);
        assert!(matches!(instructions[0], UpdateInstruction::FullClose { intent: OrderIntent::Sl, .. }));

        // Second tick while the sl order is still in flight coalesces (no new instruction).
        let again = mgr.evaluate_tick("pos-1", &ctx(98.0)).unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn third_concurrent_request_rejected_with_in_flight() {
        let mgr = PositionManager::new(PositionConfig::default(), 5.0);
        mgr.open_position(position(Side::Long, 100.0, 99.0));
        assert!(mgr.evaluate_tick("pos-1", &ctx(98.5)).is_ok());
        assert!(mgr.evaluate_tick("pos-1", &ctx(98.0)).is_ok());
        assert!(mgr.evaluate_tick("pos-1", &ctx(97.5)).is_err());
    }

    #[test]
    fn tp1_fires_and_moves_stop_to_breakeven_plus_cushion() {
        let mgr = PositionManager::new(PositionConfig::default(), 5.0);
        let entry = 100.0;
        let stop = 99.0;
        mgr.open_position(position(Side::Long, entry, stop));
        let tp1_r = PositionConfig::default().tp1_r;
        let target_price = entry + tp1_r * (entry - stop);
        let instructions = mgr.evaluate_tick("pos-1", &ctx(target_price)).unwrap();
        assert!(instructions.iter().any(|i| matches!(i, UpdateInstruction::PartialClose { intent: OrderIntent::Tp, .. })));
        assert!(instructions.iter().any(|i| matches!(i, UpdateInstruction::MoveSl { new_sl, .. } if *new_sl > entry)));
        let position = mgr.get("pos-1").unwrap();
        assert!(position.meta.breakeven_moved);
        assert_eq!(position.meta.tp_rungs_executed, vec![0]);
    }

    #[test]
    fn chandelier_trail_only_ratchets_favorably() {
        let mgr = PositionManager::new(PositionConfig::default(), 5.0);
        let entry = 100.0;
        let stop = 99.0;
        mgr.open_position(position(Side::Long, entry, stop));
        let tp1_r = PositionConfig::default().tp1_r;
        let target_price = entry + tp1_r * (entry - stop);
        mgr.evaluate_tick("pos-1", &ctx(target_price)).unwrap();
        mgr.confirm_fill("pos-1", OrderIntent::Tp, 0.4, target_price, 0.1).unwrap();

        let higher_price = target_price + 2.0;
        let instructions = mgr.evaluate_tick("pos-1", &ctx(higher_price)).unwrap();
        let sl_after_push = mgr.get("pos-1").unwrap().stop_loss;
        assert!(instructions.iter().any(|i| matches!(i, UpdateInstruction::MoveSl { .. })));

        // A pullback that doesn't make a new high must never loosen the stop.
        let pulled_back = mgr.evaluate_tick("pos-1", &ctx(higher_price - 1.0)).unwrap();
        assert!(!pulled_back.iter().any(|i| matches!(i, UpdateInstruction::MoveSl { .. })));
        assert_eq!(mgr.get("pos-1").unwrap().stop_loss, sl_after_push);
    }

    #[test]
    fn panic_exit_bypasses_ladder() {
        let mgr = PositionManager::new(PositionConfig::default(), 5.0);
        mgr.open_position(position(Side::Long, 100.0, 90.0));
        // adverse excursion of 3.0 against a 1m ATR of 0.3 exceeds panic_exit_atr_mult (4.0 default => 1.2)
        let instructions = mgr.evaluate_tick("pos-1", &ctx(97.0)).unwrap();
        assert!(instructions.iter().any(|i| matches!(i, UpdateInstruction::FullClose { reason, .. } if reason == "panic_exit")));
    }

    #[test]
    fn time_stop_closes_stale_low_pnl_position() {
        let mut config = PositionConfig::default();
        config.max_hold_time_hours = 1.0;
        let mgr = PositionManager::new(config, 5.0);
        mgr.open_position(position(Side::Long, 100.0, 99.0));
        let ctx = TickContext { current_price: 100.2, atr_5m: 1.0, atr_1m: 0.3, now_ts: 3_600_001 };
        let instructions = mgr.evaluate_tick("pos-1", &ctx).unwrap();
        assert!(instructions.iter().any(|i| matches!(i, UpdateInstruction::FullClose { reason, .. } if reason == "time_stop")));
    }

    #[test]
    fn add_on_rejected_without_obv_confirmation() {
        let mut config = PositionConfig::default();
        config.add_on_enabled = true;
        let mgr = PositionManager::new(config, 5.0);
        mgr.open_position(position(Side::Long, 100.0, 99.0));
        let result = mgr
            .try_add_on("pos-1", 100.1, 100.08, false, 0.1, 1.0)
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn add_on_applied_once_and_increases_size() {
        let mut config = PositionConfig::default();
        config.add_on_enabled = true;
        let mgr = PositionManager::new(config.clone(), 5.0);
        mgr.open_position(position(Side::Long, 100.0, 99.0));
        let result = mgr.try_add_on("pos-1", 100.1, 100.08, true, 0.1, 1.0).unwrap();
        assert!(result.is_some());
        let position = mgr.get("pos-1").unwrap();
        assert_eq!(position.meta.adds_done, 1);
        assert!((position.initial_qty - (1.0 + config.add_on_max_size_pct)).abs() < 1e-9);

        // A second attempt must not re-add.
        let second = mgr.try_add_on("pos-1", 100.1, 100.08, true, 0.1, 1.0).unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn confirm_fill_closes_position_and_moves_to_closed_list() {
        let mgr = PositionManager::new(PositionConfig::default(), 5.0);
        mgr.open_position(position(Side::Long, 100.0, 99.0));
        let outcome = mgr.confirm_fill("pos-1", OrderIntent::Sl, 1.0, 99.0, 0.5).unwrap();
        assert!(outcome.position_closed);
        assert!(mgr.get("pos-1").is_none());
        assert_eq!(mgr.closed_positions(10).len(), 1);
    }
}
