// =============================================================================
// Exchange adapter contract
// =============================================================================
//
// A single interface implemented by a live venue and a paper simulator so
// that everything above this layer is mode-agnostic (see design note:
// "paper vs live branching sprinkled through code" -> one adapter trait,
// two implementations). The reference venue is Bybit v5.
// =============================================================================

pub mod bybit;
pub mod paper;
pub mod rate_limit;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::market_data::Candle;
use crate::types::{Order, OrderBookSnapshot, OrderSide, OrderType, OrderIntent};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSpec {
    pub symbol: String,
    pub base: String,
    pub quote: String,
    pub amount_step: f64,
    pub price_tick: f64,
    pub min_qty: f64,
    pub min_notional: f64,
    pub contract_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub ts_ms: i64,
    pub price: f64,
    pub amount: f64,
    pub side: OrderSide,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountBalance {
    pub equity_usd: f64,
    pub free_usd: f64,
    pub positions: Vec<serde_json::Value>,
}

/// A request to place an order. `idempotency_key` lets the adapter dedupe
/// retries at the exchange (Bybit's `orderLinkId`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceOrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub qty: f64,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub reduce_only: bool,
    pub intent: OrderIntent,
    pub idempotency_key: String,
}

#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    async fn load_markets(&self) -> Result<Vec<MarketSpec>, EngineError>;

    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
    ) -> Result<Vec<Candle>, EngineError>;

    async fn fetch_orderbook(&self, symbol: &str, depth: u32) -> Result<OrderBookSnapshot, EngineError>;

    async fn fetch_recent_trades(&self, symbol: &str, since_ms: i64) -> Result<Vec<Trade>, EngineError>;

    async fn place_order(&self, request: PlaceOrderRequest) -> Result<Order, EngineError>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), EngineError>;

    async fn fetch_open_orders(&self, symbol: Option<&str>) -> Result<Vec<Order>, EngineError>;

    async fn fetch_balance(&self) -> Result<AccountBalance, EngineError>;
}

/// Map a low-level transport failure into the taxonomy's `ExchangeUnreachable`,
/// keeping the `anyhow::Context` chain readable in the log line.
pub fn map_transport_err(component: &str, err: anyhow::Error) -> EngineError {
    EngineError::ExchangeUnreachable {
        component: component.to_string(),
        reason: format!("{err:#}"),
    }
}

/// Map an explicit exchange rejection (bad params, insufficient balance,
/// rate limited) into `ExchangeRejected`.
pub fn map_rejection_err(component: &str, reason: impl Into<String>) -> EngineError {
    EngineError::ExchangeRejected {
        component: component.to_string(),
        reason: reason.into(),
    }
}
