// =============================================================================
// Paper adapter — simulated fills for the paper trading mode
// =============================================================================
//
// Implements the same ExchangeAdapter contract as the live venue so the
// engine above this layer never branches on mode. Fills are synthesized
// from the last known order book: price = mid +/- spread/2, with slippage
// added as a function of order size relative to visible depth, commission
// charged at the configured fee rate, and a fixed latency sleep to keep
// ordering realistic relative to the live adapter's round trip.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::instrument;
use uuid::Uuid;

use crate::config::ExecutionConfig;
use crate::error::EngineError;
use crate::exchange::{AccountBalance, ExchangeAdapter, MarketSpec, PlaceOrderRequest, Trade};
use crate::market_data::Candle;
use crate::types::{Order, OrderBookSnapshot, OrderSide, OrderStatus};

/// Slippage model coefficients: `slippage_bps = a + b * (qty / depth_usd)`.
/// `a` approximates fixed venue latency slippage, `b` scales with how much
/// of the visible book the order consumes.
const SLIPPAGE_A_BPS: f64 = 0.5;
const SLIPPAGE_B_BPS: f64 = 40.0;

pub struct PaperAdapter {
    execution: ExecutionConfig,
    balance: RwLock<AccountBalance>,
    orders: RwLock<Vec<Order>>,
    last_books: RwLock<std::collections::HashMap<String, OrderBookSnapshot>>,
}

impl PaperAdapter {
    pub fn new(starting_balance_usd: f64, execution: ExecutionConfig) -> Self {
        Self {
            execution,
            balance: RwLock::new(AccountBalance {
                equity_usd: starting_balance_usd,
                free_usd: starting_balance_usd,
                positions: vec![],
            }),
            orders: RwLock::new(Vec::new()),
            last_books: RwLock::new(std::collections::HashMap::new()),
        }
    }

    /// Fed by the market-data layer so simulated fills track the real book.
    pub fn observe_orderbook(&self, book: OrderBookSnapshot) {
        self.last_books.write().insert(book.symbol.clone(), book);
    }

    fn simulate_fill_price(&self, symbol: &str, side: OrderSide, qty: f64) -> Result<f64, EngineError> {
        let books = self.last_books.read();
        let book = books.get(symbol).ok_or_else(|| EngineError::DataStale {
            symbol: symbol.to_string(),
            age_ms: i64::MAX,
        })?;
        let mid = book.mid().ok_or_else(|| EngineError::DataStale {
            symbol: symbol.to_string(),
            age_ms: i64::MAX,
        })?;
        let spread = book
            .best_ask()
            .zip(book.best_bid())
            .map(|(ask, bid)| ask.price - bid.price)
            .unwrap_or(mid * 0.0005);

        let depth_usd = book.depth_usd_within(side == OrderSide::Buy, 0.003).max(1.0);
        let notional = qty * mid;
        let slippage_bps = SLIPPAGE_A_BPS + SLIPPAGE_B_BPS * (notional / depth_usd);
        let slippage_frac = slippage_bps / 10_000.0;

        let base = match side {
            OrderSide::Buy => mid + spread / 2.0,
            OrderSide::Sell => mid - spread / 2.0,
        };
        let fill = match side {
            OrderSide::Buy => base * (1.0 + slippage_frac),
            OrderSide::Sell => base * (1.0 - slippage_frac),
        };
        Ok(fill)
    }
}

#[async_trait]
impl ExchangeAdapter for PaperAdapter {
    #[instrument(skip(self), name = "paper::load_markets")]
    async fn load_markets(&self) -> Result<Vec<MarketSpec>, EngineError> {
        Ok(Vec::new())
    }

    #[instrument(skip(self), name = "paper::fetch_candles")]
    async fn fetch_candles(
        &self,
        _symbol: &str,
        _timeframe: &str,
        _limit: u32,
    ) -> Result<Vec<Candle>, EngineError> {
        Ok(Vec::new())
    }

    #[instrument(skip(self), name = "paper::fetch_orderbook")]
    async fn fetch_orderbook(&self, symbol: &str, depth: u32) -> Result<OrderBookSnapshot, EngineError> {
        self.last_books
            .read()
            .get(symbol)
            .map(|b| b.read_snapshot(depth as usize))
            .ok_or_else(|| EngineError::DataStale {
                symbol: symbol.to_string(),
                age_ms: i64::MAX,
            })
    }

    #[instrument(skip(self), name = "paper::fetch_recent_trades")]
    async fn fetch_recent_trades(&self, _symbol: &str, _since_ms: i64) -> Result<Vec<Trade>, EngineError> {
        Ok(Vec::new())
    }

    #[instrument(skip(self, request), name = "paper::place_order")]
    async fn place_order(&self, request: PlaceOrderRequest) -> Result<Order, EngineError> {
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;

        let fill_price = self.simulate_fill_price(&request.symbol, request.side, request.qty)?;
        let notional = fill_price * request.qty;
        let fee = notional * (self.execution.taker_fee_bps / 10_000.0);

        {
            let mut balance = self.balance.write();
            balance.free_usd -= fee;
            balance.equity_usd -= fee;
        }

        let now = chrono::Utc::now().timestamp_millis();
        let order = Order {
            id: Uuid::new_v4().to_string(),
            client_id: request.idempotency_key,
            symbol: request.symbol,
            side: request.side,
            order_type: request.order_type,
            qty: request.qty,
            price: request.price,
            stop_price: request.stop_price,
            status: OrderStatus::Filled,
            filled_qty: request.qty,
            avg_fill_price: fill_price,
            fees_usd: fee,
            reduce_only: request.reduce_only,
            intent: request.intent,
            created_ts: now,
            updated_ts: now,
            parent_id: None,
            children: vec![],
        };
        self.orders.write().push(order.clone());
        Ok(order)
    }

    #[instrument(skip(self), name = "paper::cancel_order")]
    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> Result<(), EngineError> {
        let mut orders = self.orders.write();
        if let Some(o) = orders.iter_mut().find(|o| o.id == order_id) {
            o.status = OrderStatus::Cancelled;
            Ok(())
        } else {
            Err(EngineError::Internal {
                component: "paper".to_string(),
                stage: "cancel_order".to_string(),
                reason: format!("unknown order id {order_id}"),
            })
        }
    }

    #[instrument(skip(self), name = "paper::fetch_open_orders")]
    async fn fetch_open_orders(&self, symbol: Option<&str>) -> Result<Vec<Order>, EngineError> {
        let orders = self.orders.read();
        Ok(orders
            .iter()
            .filter(|o| o.status == OrderStatus::Open || o.status == OrderStatus::PartiallyFilled)
            .filter(|o| symbol.map(|s| s == o.symbol).unwrap_or(true))
            .cloned()
            .collect())
    }

    #[instrument(skip(self), name = "paper::fetch_balance")]
    async fn fetch_balance(&self) -> Result<AccountBalance, EngineError> {
        Ok(self.balance.read().clone())
    }
}

/// Convenience constructor matching the teacher's `Arc`-wrapped subsystem
/// ownership style.
pub fn new_shared(starting_balance_usd: f64, execution: ExecutionConfig) -> Arc<PaperAdapter> {
    Arc::new(PaperAdapter::new(starting_balance_usd, execution))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BookLevel;

    fn sample_book(symbol: &str) -> OrderBookSnapshot {
        OrderBookSnapshot {
            symbol: symbol.to_string(),
            bids: vec![BookLevel { price: 99.9, size: 10.0 }],
            asks: vec![BookLevel { price: 100.1, size: 10.0 }],
            sequence_id: 1,
            ts: 0,
        }
    }

    #[tokio::test]
    async fn place_order_fills_against_observed_book() {
        let adapter = PaperAdapter::new(10_000.0, ExecutionConfig::default());
        adapter.observe_orderbook(sample_book("BTCUSDT"));

        let req = PlaceOrderRequest {
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            order_type: crate::types::OrderType::Market,
            qty: 0.1,
            price: None,
            stop_price: None,
            reduce_only: false,
            intent: crate::types::OrderIntent::Entry,
            idempotency_key: "test-1".to_string(),
        };
        let order = adapter.place_order(req).await.unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert!(order.avg_fill_price > 100.0);
    }

    #[tokio::test]
    async fn place_order_without_book_returns_data_stale() {
        let adapter = PaperAdapter::new(10_000.0, ExecutionConfig::default());
        let req = PlaceOrderRequest {
            symbol: "ETHUSDT".to_string(),
            side: OrderSide::Buy,
            order_type: crate::types::OrderType::Market,
            qty: 1.0,
            price: None,
            stop_price: None,
            reduce_only: false,
            intent: crate::types::OrderIntent::Entry,
            idempotency_key: "test-2".to_string(),
        };
        let result = adapter.place_order(req).await;
        assert!(matches!(result, Err(EngineError::DataStale { .. })));
    }

    #[tokio::test]
    async fn cancel_unknown_order_errors() {
        let adapter = PaperAdapter::new(10_000.0, ExecutionConfig::default());
        let result = adapter.cancel_order("BTCUSDT", "nonexistent").await;
        assert!(result.is_err());
    }
}
