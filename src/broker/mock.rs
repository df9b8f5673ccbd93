use crate::broker::adapter::{
    BrokerAdapter, OrderAck, OrderRequest, OrderState, OrderStatusReport, OrderType,
};
use crate::error::BrokerError;
use crate::model::{AccountSnapshot, BrokerPosition, Side};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

/// Test double for the adapter seam.
///
/// Knobs:
/// - `fill_delay_ms`: how long after placement a resting order fills;
/// - `simulate_fill`: when false, resting orders never fill;
/// - `partial_fill_ratio`: fraction of the requested size that fills.
pub struct MockAdapter {
    pub knobs: RwLock<MockKnobs>,
    equity: RwLock<Decimal>,
    broker_positions: RwLock<Vec<BrokerPosition>>,
    orders: DashMap<String, MockOrder>,
    order_seq: AtomicU64,
    pub stop_updates: AtomicU32,
    pub cancel_count: AtomicU32,
    pub send_count: AtomicU32,
}

#[derive(Debug, Clone)]
pub struct MockKnobs {
    pub fill_delay_ms: u64,
    pub simulate_fill: bool,
    pub partial_fill_ratio: Decimal,
}

impl Default for MockKnobs {
    fn default() -> Self {
        Self {
            fill_delay_ms: 50,
            simulate_fill: true,
            partial_fill_ratio: dec!(1),
        }
    }
}

struct MockOrder {
    request: OrderRequest,
    placed_at: Instant,
    canceled: bool,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self {
            knobs: RwLock::new(MockKnobs::default()),
            equity: RwLock::new(dec!(1000)),
            broker_positions: RwLock::new(Vec::new()),
            orders: DashMap::new(),
            order_seq: AtomicU64::new(0),
            stop_updates: AtomicU32::new(0),
            cancel_count: AtomicU32::new(0),
            send_count: AtomicU32::new(0),
        }
    }

    pub fn with_equity(equity: Decimal) -> Self {
        let adapter = Self::new();
        *adapter.equity.write() = equity;
        adapter
    }

    pub fn set_knobs(&self, knobs: MockKnobs) {
        *self.knobs.write() = knobs;
    }

    pub fn set_equity(&self, equity: Decimal) {
        *self.equity.write() = equity;
    }

    pub fn set_broker_positions(&self, positions: Vec<BrokerPosition>) {
        *self.broker_positions.write() = positions;
    }

    fn status_of(&self, order: &MockOrder) -> (OrderState, Decimal, Option<Decimal>) {
        let knobs = self.knobs.read().clone();
        let fill_price = order.request.price.unwrap_or(dec!(0));

        // Market orders fill immediately in full.
        if order.request.order_type == OrderType::Market {
            return (OrderState::Filled, order.request.quantity, Some(fill_price));
        }

        let elapsed_ms = order.placed_at.elapsed().as_millis() as u64;
        let fillable = knobs.simulate_fill && elapsed_ms >= knobs.fill_delay_ms;

        if !fillable {
            if order.canceled {
                return (OrderState::Canceled, Decimal::ZERO, None);
            }
            return (OrderState::New, Decimal::ZERO, None);
        }

        let executed = order.request.quantity * knobs.partial_fill_ratio;
        if executed >= order.request.quantity {
            (OrderState::Filled, order.request.quantity, Some(fill_price))
        } else if order.canceled {
            (OrderState::Canceled, executed, Some(fill_price))
        } else if executed > Decimal::ZERO {
            (OrderState::PartiallyFilled, executed, Some(fill_price))
        } else {
            (OrderState::New, Decimal::ZERO, None)
        }
    }
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerAdapter for MockAdapter {
    fn name(&self) -> &str {
        "mock"
    }

    async fn send_order(&self, order: OrderRequest) -> Result<OrderAck, BrokerError> {
        self.send_count.fetch_add(1, Ordering::SeqCst);
        let id = format!("mock-{}", self.order_seq.fetch_add(1, Ordering::SeqCst) + 1);

        if order.quantity <= Decimal::ZERO {
            return Err(BrokerError::Rejected("non-positive quantity".into()));
        }

        let ack = OrderAck {
            broker_order_id: id.clone(),
            client_order_id: order.client_order_id.clone(),
            symbol: order.symbol.clone(),
            state: OrderState::New,
            executed_qty: Decimal::ZERO,
            avg_price: None,
            t_ack: chrono::Utc::now().timestamp_millis(),
        };

        self.orders.insert(
            id,
            MockOrder {
                request: order,
                placed_at: Instant::now(),
                canceled: false,
            },
        );
        Ok(ack)
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> Result<OrderAck, BrokerError> {
        self.cancel_count.fetch_add(1, Ordering::SeqCst);
        let mut order = self
            .orders
            .get_mut(order_id)
            .ok_or_else(|| BrokerError::OrderNotFound(order_id.to_string()))?;
        order.canceled = true;

        let (state, executed, avg) = self.status_of(&order);
        Ok(OrderAck {
            broker_order_id: order_id.to_string(),
            client_order_id: order.request.client_order_id.clone(),
            symbol: order.request.symbol.clone(),
            state: if state == OrderState::Filled {
                OrderState::Filled
            } else {
                OrderState::Canceled
            },
            executed_qty: executed,
            avg_price: avg,
            t_ack: chrono::Utc::now().timestamp_millis(),
        })
    }

    async fn get_order_status(
        &self,
        _symbol: &str,
        order_id: &str,
    ) -> Result<OrderStatusReport, BrokerError> {
        let order = self
            .orders
            .get(order_id)
            .ok_or_else(|| BrokerError::OrderNotFound(order_id.to_string()))?;
        let (state, executed_qty, avg_fill_price) = self.status_of(&order);
        Ok(OrderStatusReport {
            broker_order_id: order_id.to_string(),
            state,
            executed_qty,
            avg_fill_price,
        })
    }

    async fn get_account(&self) -> Result<AccountSnapshot, BrokerError> {
        let equity = *self.equity.read();
        Ok(AccountSnapshot {
            equity,
            cash: equity,
            margin_used: Decimal::ZERO,
        })
    }

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        Ok(self.broker_positions.read().clone())
    }

    async fn close_position(&self, symbol: &str) -> Result<OrderAck, BrokerError> {
        let mut positions = self.broker_positions.write();
        let before = positions.len();
        positions.retain(|p| p.symbol != symbol);
        if positions.len() == before {
            return Err(BrokerError::Rejected(format!("no position in {}", symbol)));
        }
        Ok(OrderAck {
            broker_order_id: format!("close-{}", symbol),
            client_order_id: String::new(),
            symbol: symbol.to_string(),
            state: OrderState::Filled,
            executed_qty: Decimal::ZERO,
            avg_price: None,
            t_ack: chrono::Utc::now().timestamp_millis(),
        })
    }

    async fn close_all_positions(&self) -> Result<usize, BrokerError> {
        let mut positions = self.broker_positions.write();
        let count = positions.len();
        positions.clear();
        Ok(count)
    }

    async fn test_connection(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn update_stop_loss(&self, _symbol: &str, _stop: Decimal) -> Result<(), BrokerError> {
        self.stop_updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limit_order() -> OrderRequest {
        OrderRequest::limit("BTCUSDT", Side::Buy, dec!(0.1), dec!(50000), "c-1".into()).post_only()
    }

    #[tokio::test]
    async fn test_fill_after_delay() {
        let adapter = MockAdapter::new();
        adapter.set_knobs(MockKnobs {
            fill_delay_ms: 30,
            simulate_fill: true,
            partial_fill_ratio: dec!(1),
        });

        let ack = adapter.send_order(limit_order()).await.unwrap();
        let early = adapter
            .get_order_status("BTCUSDT", &ack.broker_order_id)
            .await
            .unwrap();
        assert_eq!(early.state, OrderState::New);

        tokio::time::sleep(Duration::from_millis(40)).await;
        let later = adapter
            .get_order_status("BTCUSDT", &ack.broker_order_id)
            .await
            .unwrap();
        assert_eq!(later.state, OrderState::Filled);
        assert_eq!(later.executed_qty, dec!(0.1));
    }

    #[tokio::test]
    async fn test_no_fill_when_simulation_disabled() {
        let adapter = MockAdapter::new();
        adapter.set_knobs(MockKnobs {
            fill_delay_ms: 0,
            simulate_fill: false,
            partial_fill_ratio: dec!(1),
        });

        let ack = adapter.send_order(limit_order()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let status = adapter
            .get_order_status("BTCUSDT", &ack.broker_order_id)
            .await
            .unwrap();
        assert_eq!(status.state, OrderState::New);

        let cancel = adapter
            .cancel_order("BTCUSDT", &ack.broker_order_id)
            .await
            .unwrap();
        assert_eq!(cancel.state, OrderState::Canceled);
        assert_eq!(cancel.executed_qty, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_partial_fill_ratio() {
        let adapter = MockAdapter::new();
        adapter.set_knobs(MockKnobs {
            fill_delay_ms: 0,
            simulate_fill: true,
            partial_fill_ratio: dec!(0.4),
        });

        let ack = adapter.send_order(limit_order()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let status = adapter
            .get_order_status("BTCUSDT", &ack.broker_order_id)
            .await
            .unwrap();
        assert_eq!(status.state, OrderState::PartiallyFilled);
        assert_eq!(status.executed_qty, dec!(0.04));
    }

    #[tokio::test]
    async fn test_close_all_reports_count() {
        let adapter = MockAdapter::new();
        adapter.set_broker_positions(vec![
            BrokerPosition {
                symbol: "BTCUSDT".into(),
                side: Side::Long,
                size: dec!(0.1),
                entry_price: dec!(50000),
                stop_loss: None,
                unrealized_pnl: Decimal::ZERO,
            },
            BrokerPosition {
                symbol: "ETHUSDT".into(),
                side: Side::Short,
                size: dec!(1),
                entry_price: dec!(2000),
                stop_loss: None,
                unrealized_pnl: Decimal::ZERO,
            },
        ]);
        assert_eq!(adapter.close_all_positions().await.unwrap(), 2);
        assert!(adapter.get_positions().await.unwrap().is_empty());
    }
}
