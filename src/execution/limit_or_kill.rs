use crate::broker::adapter::{OrderRequest, OrderState};
use crate::broker::gateway::BrokerGateway;
use crate::config::ExecutionConfig;
use crate::error::ErrorCode;
use crate::execution::{
    aborted, ExecutionParams, ExecutionResult, ExecutionStatus, ExecutionStrategy,
    MissedEntryDiagnostic,
};
use crate::market_data::orderbook_cache::OrderBookCache;
use crate::model::Side;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Phase 1 MAKER entry: post-only at the best resting price, poll, and kill
/// exactly at the deadline. Never chases, never crosses the spread.
pub struct LimitOrKill {
    gateway: Arc<BrokerGateway>,
    cache: Arc<OrderBookCache>,
    wait_time: Duration,
    poll_interval: Duration,
}

impl LimitOrKill {
    pub fn new(
        gateway: Arc<BrokerGateway>,
        cache: Arc<OrderBookCache>,
        config: &ExecutionConfig,
    ) -> Self {
        Self {
            gateway,
            cache,
            wait_time: Duration::from_millis(config.wait_time_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }

    fn resting_price(&self, symbol: &str, side: Side) -> Option<(Decimal, Decimal)> {
        let summary = self.cache.validate(symbol).ok()?;
        // Join the queue on our own side of the book.
        let price = match side.entry_order_side() {
            Side::Buy => summary.best_bid,
            _ => summary.best_ask,
        };
        Some((price, summary.best_bid))
    }

    fn current_bid(&self, symbol: &str) -> Decimal {
        self.cache
            .summary(symbol)
            .map(|s| s.best_bid)
            .unwrap_or(Decimal::ZERO)
    }

    async fn cancel_and_classify(
        &self,
        params: &ExecutionParams,
        order_id: &str,
        bid_at_entry: Decimal,
        canceled_by_abort: bool,
    ) -> ExecutionResult {
        let ack = match self.gateway.cancel_order(&params.symbol, order_id).await {
            Ok(ack) => ack,
            Err(e) => {
                // The cancel can race a fill; re-read before giving up.
                warn!(signal_id = %params.signal_id, "Cancel failed, re-reading status: {}", e);
                match self
                    .gateway
                    .get_order_status(&params.symbol, order_id)
                    .await
                {
                    Ok(status) if status.state == OrderState::Filled => {
                        return ExecutionResult::filled(
                            order_id.to_string(),
                            status.avg_fill_price.unwrap_or(Decimal::ZERO),
                            status.executed_qty,
                        );
                    }
                    _ => return ExecutionResult::error(e.code(), e.to_string()),
                }
            }
        };

        // A fill that landed during cancellation still counts in full.
        if ack.state == OrderState::Filled || ack.executed_qty >= params.size {
            return ExecutionResult::filled(
                order_id.to_string(),
                ack.avg_price.unwrap_or(Decimal::ZERO),
                params.size,
            );
        }

        if ack.executed_qty > Decimal::ZERO {
            let residual = params.size - ack.executed_qty;
            info!(
                signal_id = %params.signal_id,
                filled = %ack.executed_qty,
                residual = %residual,
                "Deadline partial fill, residual canceled"
            );
            return ExecutionResult::partially_filled(
                order_id.to_string(),
                ack.avg_price.unwrap_or(Decimal::ZERO),
                ack.executed_qty,
                residual,
            );
        }

        if canceled_by_abort {
            return ExecutionResult::canceled(ErrorCode::MissedEntry, "aborted".into());
        }

        let current_bid = self.current_bid(&params.symbol);
        let price_movement_pct = if bid_at_entry.is_zero() {
            Decimal::ZERO
        } else {
            (current_bid - bid_at_entry) / bid_at_entry * Decimal::from(100)
        };
        warn!(
            signal_id = %params.signal_id,
            bid_at_entry = %bid_at_entry,
            current_bid = %current_bid,
            "No fill at deadline"
        );
        ExecutionResult {
            status: ExecutionStatus::MissedEntry,
            fill_price: None,
            fill_size: Decimal::ZERO,
            residual_size: params.size,
            reason: Some("Price ran away".to_string()),
            code: Some(ErrorCode::MissedEntry),
            broker_order_id: Some(order_id.to_string()),
            diagnostic: Some(MissedEntryDiagnostic {
                bid_at_entry,
                current_bid,
                price_movement_pct,
            }),
        }
    }
}

#[async_trait]
impl ExecutionStrategy for LimitOrKill {
    fn name(&self) -> &'static str {
        "limit_or_kill"
    }

    async fn execute(&self, params: &ExecutionParams, abort: &AtomicBool) -> ExecutionResult {
        let (price, bid_at_entry) = match self.resting_price(&params.symbol, params.side) {
            Some(p) => p,
            None => {
                return ExecutionResult::error(
                    ErrorCode::NoMarketData,
                    "no usable book for entry price".into(),
                )
            }
        };

        let request = OrderRequest::limit(
            &params.symbol,
            params.side,
            params.size,
            price,
            format!("{}-lok", params.signal_id),
        )
        .post_only();

        let ack = match self.gateway.send_order(request).await {
            Ok(ack) => ack,
            Err(e) => return ExecutionResult::error(e.code(), e.to_string()),
        };
        let order_id = ack.broker_order_id;
        let deadline = Instant::now() + self.wait_time;

        info!(
            signal_id = %params.signal_id,
            symbol = %params.symbol,
            price = %price,
            size = %params.size,
            "Post-only entry placed"
        );

        loop {
            // Honor the absolute deadline within polling granularity.
            let now = Instant::now();
            if now >= deadline {
                return self
                    .cancel_and_classify(params, &order_id, bid_at_entry, false)
                    .await;
            }
            tokio::time::sleep_until((now + self.poll_interval).min(deadline)).await;

            if aborted(abort) {
                return self
                    .cancel_and_classify(params, &order_id, bid_at_entry, true)
                    .await;
            }

            match self
                .gateway
                .get_order_status(&params.symbol, &order_id)
                .await
            {
                Ok(status) => {
                    // A fill of exactly the requested size is FILLED.
                    if status.state == OrderState::Filled || status.executed_qty >= params.size {
                        info!(
                            signal_id = %params.signal_id,
                            fill_price = ?status.avg_fill_price,
                            "Entry filled before deadline"
                        );
                        return ExecutionResult::filled(
                            order_id,
                            status.avg_fill_price.unwrap_or(price),
                            params.size,
                        );
                    }
                    if status.state == OrderState::Rejected {
                        return ExecutionResult::error(
                            ErrorCode::BrokerRejected,
                            "post-only order rejected".into(),
                        );
                    }
                }
                Err(e) if e.is_transient() => {
                    warn!(signal_id = %params.signal_id, "Status poll failed: {}", e);
                }
                Err(e) => return ExecutionResult::error(e.code(), e.to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::mock::{MockAdapter, MockKnobs};
    use crate::config::BrokerConfig;
    use crate::market_data::types::{BookLevel, BookSnapshot};
    use crate::model::SignalType;
    use rust_decimal_macros::dec;

    fn seeded_cache() -> Arc<OrderBookCache> {
        let cache = OrderBookCache::new(5, Duration::from_secs(3));
        cache.apply_snapshot(BookSnapshot {
            symbol: "BTCUSDT".into(),
            update_id: 1,
            bids: vec![BookLevel {
                price: dec!(50000),
                quantity: dec!(5),
            }],
            asks: vec![BookLevel {
                price: dec!(50010),
                quantity: dec!(5),
            }],
        });
        cache
    }

    fn params() -> ExecutionParams {
        ExecutionParams {
            signal_id: "sig-1".into(),
            symbol: "BTCUSDT".into(),
            side: Side::Buy,
            size: dec!(0.1),
            limit_price: Some(dec!(50100)),
            stop_loss: dec!(49500),
            take_profits: vec![],
            signal_type: SignalType::Scalp,
            urgency_score: 50,
            alpha_half_life_ms: None,
        }
    }

    fn fast_config(wait_ms: u64) -> ExecutionConfig {
        ExecutionConfig {
            wait_time_ms: wait_ms,
            poll_interval_ms: 10,
            ..ExecutionConfig::default()
        }
    }

    #[tokio::test]
    async fn test_full_fill_before_deadline() {
        let adapter = Arc::new(MockAdapter::new());
        adapter.set_knobs(MockKnobs {
            fill_delay_ms: 20,
            simulate_fill: true,
            partial_fill_ratio: dec!(1),
        });
        let gateway = BrokerGateway::new(adapter.clone(), &BrokerConfig::default());
        let strategy = LimitOrKill::new(gateway, seeded_cache(), &fast_config(2_000));

        let abort = AtomicBool::new(false);
        let result = strategy.execute(&params(), &abort).await;

        assert_eq!(result.status, ExecutionStatus::Filled);
        assert_eq!(result.fill_price, Some(dec!(50000)));
        assert_eq!(result.fill_size, dec!(0.1));
        // No further attempts after the fill.
        assert_eq!(adapter.send_count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_missed_entry_with_diagnostic() {
        let adapter = Arc::new(MockAdapter::new());
        adapter.set_knobs(MockKnobs {
            fill_delay_ms: 0,
            simulate_fill: false,
            partial_fill_ratio: dec!(1),
        });
        let gateway = BrokerGateway::new(adapter.clone(), &BrokerConfig::default());
        let strategy = LimitOrKill::new(gateway, seeded_cache(), &fast_config(100));

        let start = std::time::Instant::now();
        let abort = AtomicBool::new(false);
        let result = strategy.execute(&params(), &abort).await;

        assert_eq!(result.status, ExecutionStatus::MissedEntry);
        assert_eq!(result.reason.as_deref(), Some("Price ran away"));
        let diag = result.diagnostic.expect("diagnostic expected");
        assert_eq!(diag.bid_at_entry, dec!(50000));
        // Deadline honored within polling granularity.
        let elapsed = start.elapsed().as_millis();
        assert!(elapsed >= 100 && elapsed < 400, "elapsed {}ms", elapsed);
        assert_eq!(adapter.cancel_count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_partial_fill_cancels_residual() {
        let adapter = Arc::new(MockAdapter::new());
        adapter.set_knobs(MockKnobs {
            fill_delay_ms: 0,
            simulate_fill: true,
            partial_fill_ratio: dec!(0.6),
        });
        let gateway = BrokerGateway::new(adapter, &BrokerConfig::default());
        let strategy = LimitOrKill::new(gateway, seeded_cache(), &fast_config(80));

        let abort = AtomicBool::new(false);
        let result = strategy.execute(&params(), &abort).await;

        assert_eq!(result.status, ExecutionStatus::PartiallyFilled);
        assert_eq!(result.fill_size, dec!(0.06));
        assert_eq!(result.residual_size, dec!(0.04));
    }

    #[tokio::test]
    async fn test_abort_cancels_at_poll_boundary() {
        let adapter = Arc::new(MockAdapter::new());
        adapter.set_knobs(MockKnobs {
            fill_delay_ms: 0,
            simulate_fill: false,
            partial_fill_ratio: dec!(1),
        });
        let gateway = BrokerGateway::new(adapter, &BrokerConfig::default());
        let strategy = Arc::new(LimitOrKill::new(
            gateway,
            seeded_cache(),
            &fast_config(5_000),
        ));

        let abort = Arc::new(AtomicBool::new(false));
        let abort_clone = abort.clone();
        let strategy_clone = strategy.clone();
        let handle =
            tokio::spawn(async move { strategy_clone.execute(&params(), &abort_clone).await });

        tokio::time::sleep(Duration::from_millis(40)).await;
        abort.store(true, std::sync::atomic::Ordering::SeqCst);

        let result = handle.await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Canceled);
    }

    #[tokio::test]
    async fn test_no_book_is_error() {
        let adapter = Arc::new(MockAdapter::new());
        let gateway = BrokerGateway::new(adapter, &BrokerConfig::default());
        let cache = OrderBookCache::new(5, Duration::from_secs(3));
        let strategy = LimitOrKill::new(gateway, cache, &fast_config(100));

        let abort = AtomicBool::new(false);
        let result = strategy.execute(&params(), &abort).await;
        assert_eq!(result.status, ExecutionStatus::Error);
        assert_eq!(result.code, Some(ErrorCode::NoMarketData));
    }
}
