use crate::error::BrokerError;
use crate::model::{AccountSnapshot, BrokerPosition, Candle, Side};
use async_trait::async_trait;
use rust_decimal::Decimal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    Limit,
    Market,
    StopMarket,
}

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub client_order_id: String,
    pub post_only: bool,
    pub reduce_only: bool,
}

impl OrderRequest {
    pub fn limit(
        symbol: &str,
        side: Side,
        quantity: Decimal,
        price: Decimal,
        client_order_id: String,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Limit,
            quantity,
            price: Some(price),
            stop_price: None,
            client_order_id,
            post_only: false,
            reduce_only: false,
        }
    }

    pub fn market(symbol: &str, side: Side, quantity: Decimal, client_order_id: String) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            stop_price: None,
            client_order_id,
            post_only: false,
            reduce_only: false,
        }
    }

    pub fn post_only(mut self) -> Self {
        self.post_only = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

impl OrderState {
    pub fn is_open(&self) -> bool {
        matches!(self, OrderState::New | OrderState::PartiallyFilled)
    }
}

#[derive(Debug, Clone)]
pub struct OrderAck {
    pub broker_order_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub state: OrderState,
    pub executed_qty: Decimal,
    pub avg_price: Option<Decimal>,
    pub t_ack: i64,
}

#[derive(Debug, Clone)]
pub struct OrderStatusReport {
    pub broker_order_id: String,
    pub state: OrderState,
    pub executed_qty: Decimal,
    pub avg_fill_price: Option<Decimal>,
}

/// Capability surface of an exchange connection. The gateway is the only
/// caller; strategies never hold an adapter directly.
///
/// The three optional capabilities have default `Unsupported` implementations
/// so venue adapters only implement what the venue offers.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn send_order(&self, order: OrderRequest) -> Result<OrderAck, BrokerError>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<OrderAck, BrokerError>;

    async fn get_order_status(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<OrderStatusReport, BrokerError>;

    async fn get_account(&self) -> Result<AccountSnapshot, BrokerError>;

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError>;

    async fn close_position(&self, symbol: &str) -> Result<OrderAck, BrokerError>;

    async fn close_all_positions(&self) -> Result<usize, BrokerError>;

    async fn test_connection(&self) -> Result<(), BrokerError>;

    async fn update_stop_loss(&self, _symbol: &str, _stop: Decimal) -> Result<(), BrokerError> {
        Err(BrokerError::Unsupported("update_stop_loss"))
    }

    async fn get_open_interest(&self, _symbol: &str) -> Result<Decimal, BrokerError> {
        Err(BrokerError::Unsupported("get_open_interest"))
    }

    async fn fetch_ohlcv(
        &self,
        _symbol: &str,
        _interval: &str,
        _limit: u32,
    ) -> Result<Vec<Candle>, BrokerError> {
        Err(BrokerError::Unsupported("fetch_ohlcv"))
    }
}
