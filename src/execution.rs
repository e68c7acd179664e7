// =============================================================================
// Execution Engine — routes sized orders through the exchange adapter with
// TWAP slicing, iceberg display, dead-man timeout, and fill accounting
// =============================================================================
//
// One parent `Order` per `execute()` call, fanning out into child `Order`s
// placed through whichever `ExchangeAdapter` is wired in (live Bybit or the
// paper simulator) — everything here is mode-agnostic, mirroring the
// teacher's single-client routing shape but generalized from one request per
// call to a slice train with its own cancellation and timeout discipline.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::config::ExecutionConfig;
use crate::error::EngineError;
use crate::exchange::{ExchangeAdapter, PlaceOrderRequest};
use crate::risk::SizedOrder;
use crate::types::{Order, OrderIntent, OrderSide, OrderStatus, OrderType, Strategy};

/// Cooperative cancellation flag for an in-flight slice train. Cloneable,
/// cheap to check between slices.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    /// Builds a token that observes an externally-owned flag, so cancelling
    /// through that other owner (e.g. the orchestrator's shutdown token)
    /// cancels this slice train too.
    pub fn from_flag(flag: Arc<AtomicBool>) -> Self {
        Self(flag)
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A market snapshot the execution manager needs at submission time:
/// reference price for slippage accounting, available depth on the entry
/// side, and current spread for the adaptive TWAP cancel rule.
#[derive(Debug, Clone, Copy)]
pub struct MarketSnapshot {
    pub reference_price: f64,
    pub depth_usd_at_side: f64,
    pub spread_bps: f64,
}

/// Aggregated result of routing a sized order to completion (or timeout).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub parent_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub intent: OrderIntent,
    pub target_qty: f64,
    pub filled_qty: f64,
    pub avg_fill_price: f64,
    pub fees_usd: f64,
    pub slippage_bps: f64,
    pub status: OrderStatus,
    pub children: Vec<Order>,
}

pub struct ExecutionEngine {
    adapter: Arc<dyn ExchangeAdapter>,
    config: ExecutionConfig,
}

impl ExecutionEngine {
    pub fn new(adapter: Arc<dyn ExchangeAdapter>, config: ExecutionConfig) -> Self {
        Self { adapter, config }
    }

    /// Chooses the order type for a child slice by intent and, for entries,
    /// by which strategy produced the signal.
    fn choose_order_type(intent: OrderIntent, strategy: Option<Strategy>, urgent: bool) -> OrderType {
        match intent {
            OrderIntent::Entry => match strategy {
                Some(Strategy::Momentum) => OrderType::StopLimit,
                Some(Strategy::Retest) | None => OrderType::Limit,
            },
            OrderIntent::Exit => {
                if urgent {
                    OrderType::Market
                } else {
                    OrderType::Limit
                }
            }
            OrderIntent::Tp => OrderType::Limit,
            OrderIntent::Sl => OrderType::StopLimit,
            OrderIntent::AddOn => OrderType::Limit,
        }
    }

    /// Computes the slice count for a TWAP train: clamped between
    /// `twap_min_slices` and `twap_max_slices`.
    fn slice_count(&self, qty: f64, depth_usd: f64, reference_price: f64) -> u32 {
        if depth_usd <= 0.0 || reference_price <= 0.0 {
            return self.config.twap_min_slices;
        }
        let depth_qty = depth_usd / reference_price;
        let raw = (qty / (depth_qty * self.config.max_depth_fraction)).ceil().max(1.0) as u32;
        raw.clamp(self.config.twap_min_slices, self.config.twap_max_slices)
    }

    /// Routes a sized order to the exchange: single child order, or a TWAP
    /// slice train when flagged or when qty exceeds the depth-fraction
    /// threshold. Iceberg display only affects how much of each slice is
    /// shown; the adapter still receives the full slice quantity since the
    /// reference contract has no native display-quantity field.
    #[instrument(skip(self, sized, snapshot, cancel), fields(symbol = %symbol))]
    pub async fn execute(
        &self,
        symbol: &str,
        side: OrderSide,
        intent: OrderIntent,
        strategy: Option<Strategy>,
        sized: SizedOrder,
        price_hint: Option<f64>,
        snapshot: MarketSnapshot,
        urgent: bool,
        cancel: CancelToken,
        amount_step: f64,
    ) -> Result<ExecutionReport, EngineError> {
        let target_qty = sized.qty;
        let notional = target_qty * snapshot.reference_price;
        let use_twap = sized.mark_for_twap
            || target_qty > self.config.max_depth_fraction * (snapshot.depth_usd_at_side / snapshot.reference_price.max(1e-9));
        let slices = if use_twap {
            self.slice_count(target_qty, snapshot.depth_usd_at_side, snapshot.reference_price)
        } else {
            1
        };
        let show_iceberg = self.config.enable_iceberg && notional > self.config.iceberg_min_notional;
        let order_type = Self::choose_order_type(intent, strategy, urgent);

        info!(slices, use_twap, show_iceberg, target_qty, "routing sized order");

        let slice_qty = target_qty / slices as f64;
        let mut children = Vec::with_capacity(slices as usize);
        let mut filled_qty = 0.0;
        let mut notional_filled = 0.0;
        let mut fees_usd = 0.0;

        for i in 0..slices {
            if cancel.is_cancelled() {
                warn!(slice = i, "slice train cancelled before submission");
                break;
            }
            if i > 0 && snapshot.spread_bps > self.config.spread_widen_bps {
                warn!(spread_bps = snapshot.spread_bps, "spread widened beyond threshold, cancelling remaining slices");
                break;
            }

            let request = PlaceOrderRequest {
                symbol: symbol.to_string(),
                side,
                order_type,
                qty: slice_qty,
                price: price_hint,
                stop_price: if order_type == OrderType::StopLimit { price_hint } else { None },
                reduce_only: matches!(intent, OrderIntent::Exit | OrderIntent::Tp | OrderIntent::Sl),
                intent,
                idempotency_key: Order::new_client_id(),
            };

            let placed = tokio::time::timeout(
                Duration::from_millis(self.config.deadman_timeout_ms),
                self.adapter.place_order(request),
            )
            .await;

            let order = match placed {
                Ok(Ok(order)) => order,
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    warn!(slice = i, timeout_ms = self.config.deadman_timeout_ms, "dead-man timeout, no ack");
                    return Err(EngineError::ExecutionTimeout {
                        component: "execution".to_string(),
                        reason: format!("no ack within {}ms", self.config.deadman_timeout_ms),
                    });
                }
            };

            filled_qty += order.filled_qty;
            notional_filled += order.filled_qty * order.avg_fill_price;
            fees_usd += order.fees_usd;
            children.push(order);

            if slices > 1 && i + 1 < slices {
                tokio::time::sleep(Duration::from_secs(self.config.twap_interval_seconds)).await;
            }
        }

        let avg_fill_price = if filled_qty > 0.0 { notional_filled / filled_qty } else { 0.0 };
        // Rounding tolerance is one exchange amount_step, not an arbitrary epsilon.
        let fill_tolerance = if amount_step > 0.0 { amount_step } else { 1e-9 };
        let status = if filled_qty + fill_tolerance >= target_qty {
            OrderStatus::Filled
        } else if filled_qty > 0.0 {
            OrderStatus::PartiallyFilled
        } else {
            OrderStatus::Cancelled
        };

        let slippage_bps = if avg_fill_price > 0.0 && snapshot.reference_price > 0.0 {
            let sign = match side {
                OrderSide::Buy => 1.0,
                OrderSide::Sell => -1.0,
            };
            sign * (avg_fill_price - snapshot.reference_price) / snapshot.reference_price * 10_000.0
        } else {
            0.0
        };

        debug!(filled_qty, avg_fill_price, fees_usd, slippage_bps, ?status, "execution complete");

        Ok(ExecutionReport {
            parent_id: Order::new_client_id(),
            symbol: symbol.to_string(),
            side,
            intent,
            target_qty,
            filled_qty,
            avg_fill_price,
            fees_usd,
            slippage_bps,
            status,
            children,
        })
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn momentum_entry_chooses_stop_limit() {
        assert_eq!(
            ExecutionEngine::choose_order_type(OrderIntent::Entry, Some(Strategy::Momentum), false),
            OrderType::StopLimit
        );
    }

    #[test]
    fn retest_entry_chooses_limit() {
        assert_eq!(
            ExecutionEngine::choose_order_type(OrderIntent::Entry, Some(Strategy::Retest), false),
            OrderType::Limit
        );
    }

    #[test]
    fn urgent_exit_chooses_market() {
        assert_eq!(ExecutionEngine::choose_order_type(OrderIntent::Exit, None, true), OrderType::Market);
    }

    #[test]
    fn non_urgent_exit_chooses_limit() {
        assert_eq!(ExecutionEngine::choose_order_type(OrderIntent::Exit, None, false), OrderType::Limit);
    }

    #[test]
    fn cancel_token_reflects_cancellation() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }
}
