use crate::broker::adapter::{OrderRequest, OrderState};
use crate::broker::gateway::BrokerGateway;
use crate::config::ExecutionConfig;
use crate::error::ErrorCode;
use crate::events::{Event, EventBus};
use crate::execution::{aborted, ExecutionParams, ExecutionResult, ExecutionStrategy};
use crate::market_data::orderbook_cache::OrderBookCache;
use crate::model::Side;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const URGENCY_EXTENSION_THRESHOLD: u32 = 95;
const URGENCY_EXTENSION_FACTOR: f64 = 1.5;

/// Adaptive MAKER entry for alpha-decaying signals: rest at the touch,
/// reprice one tick adverse per interval, and give up the moment the edge is
/// gone (alpha below threshold, imbalance turning against us, or hard
/// tick/time limits).
pub struct LimitChaser {
    gateway: Arc<BrokerGateway>,
    cache: Arc<OrderBookCache>,
    events: EventBus,
    chase_interval: Duration,
    max_chase_ticks: u32,
    max_chase_time: Duration,
    min_alpha_threshold: f64,
}

/// Remaining edge fraction after `elapsed_ms`: alpha(t) = 0.5^(t / half_life).
pub fn remaining_alpha(elapsed_ms: u64, half_life_ms: f64) -> f64 {
    if half_life_ms <= 0.0 {
        return 0.0;
    }
    0.5_f64.powf(elapsed_ms as f64 / half_life_ms)
}

/// Half-life by signal class, with the explicit signal override first and
/// the urgency extension applied strictly above the threshold.
pub fn effective_half_life_ms(params: &ExecutionParams) -> f64 {
    let base = params
        .alpha_half_life_ms
        .unwrap_or_else(|| params.signal_type.default_half_life_ms()) as f64;
    if params.urgency_score > URGENCY_EXTENSION_THRESHOLD {
        base * URGENCY_EXTENSION_FACTOR
    } else {
        base
    }
}

/// OBI worsening is a strict tick-over-tick move against the order side.
/// A null reading on either side is not-worsening.
pub fn obi_worsening(side: Side, previous: Option<f64>, current: Option<f64>) -> bool {
    match (previous, current) {
        (Some(prev), Some(curr)) => match side.entry_order_side() {
            Side::Buy => curr < prev,
            _ => curr > prev,
        },
        _ => false,
    }
}

impl LimitChaser {
    pub fn new(
        gateway: Arc<BrokerGateway>,
        cache: Arc<OrderBookCache>,
        events: EventBus,
        config: &ExecutionConfig,
    ) -> Self {
        Self {
            gateway,
            cache,
            events,
            chase_interval: Duration::from_millis(config.chase_interval_ms),
            max_chase_ticks: config.max_chase_ticks,
            max_chase_time: Duration::from_millis(config.max_chase_time_ms),
            min_alpha_threshold: config.min_alpha_threshold,
        }
    }

    async fn cancel_resting(
        &self,
        params: &ExecutionParams,
        order_id: &str,
    ) -> Option<ExecutionResult> {
        match self.gateway.cancel_order(&params.symbol, order_id).await {
            Ok(ack) => {
                if ack.state == OrderState::Filled || ack.executed_qty >= params.size {
                    return Some(ExecutionResult::filled(
                        order_id.to_string(),
                        ack.avg_price.unwrap_or(Decimal::ZERO),
                        params.size,
                    ));
                }
                if ack.executed_qty > Decimal::ZERO {
                    return Some(ExecutionResult::partially_filled(
                        order_id.to_string(),
                        ack.avg_price.unwrap_or(Decimal::ZERO),
                        ack.executed_qty,
                        params.size - ack.executed_qty,
                    ));
                }
                None
            }
            Err(e) => {
                warn!(signal_id = %params.signal_id, "Chase cancel failed: {}", e);
                None
            }
        }
    }

    async fn place_at(
        &self,
        params: &ExecutionParams,
        price: Decimal,
        tick_no: u32,
    ) -> Result<String, ExecutionResult> {
        let request = OrderRequest::limit(
            &params.symbol,
            params.side,
            params.size,
            price,
            format!("{}-chase-{}", params.signal_id, tick_no),
        )
        .post_only();

        match self.gateway.send_order(request).await {
            Ok(ack) => Ok(ack.broker_order_id),
            Err(e) => Err(ExecutionResult::error(e.code(), e.to_string())),
        }
    }
}

#[async_trait]
impl ExecutionStrategy for LimitChaser {
    fn name(&self) -> &'static str {
        "limit_chaser"
    }

    async fn execute(&self, params: &ExecutionParams, abort: &AtomicBool) -> ExecutionResult {
        let summary = match self.cache.validate(&params.symbol) {
            Ok(s) => s,
            Err(_) => {
                // No price, no order.
                return ExecutionResult::error(
                    ErrorCode::NoPriceData,
                    "no price data for chase".into(),
                );
            }
        };

        let tick_size = summary.tick_size;
        let order_side = params.side.entry_order_side();
        // Start at the far touch: best-ask for BUY, best-bid for SELL.
        let mut price = match order_side {
            Side::Buy => summary.best_ask,
            _ => summary.best_bid,
        };
        let mut prev_obi = summary.obi;

        let half_life_ms = effective_half_life_ms(params);
        let started = Instant::now();
        let mut ticks: u32 = 0;

        self.events.publish(Event::ChaseStart {
            signal_id: params.signal_id.clone(),
            symbol: params.symbol.clone(),
            initial_price: price,
        });
        info!(
            signal_id = %params.signal_id,
            symbol = %params.symbol,
            initial_price = %price,
            half_life_ms = half_life_ms,
            "Chase started"
        );

        let mut order_id = match self.place_at(params, price, ticks).await {
            Ok(id) => id,
            Err(result) => return result,
        };

        loop {
            tokio::time::sleep(self.chase_interval).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            if aborted(abort) {
                if let Some(result) = self.cancel_resting(params, &order_id).await {
                    return result;
                }
                return ExecutionResult::canceled(ErrorCode::MissedEntry, "aborted".into());
            }

            // Fill check first so a resting fill beats any cancel reason.
            match self
                .gateway
                .get_order_status(&params.symbol, &order_id)
                .await
            {
                Ok(status) if status.state == OrderState::Filled => {
                    self.events.publish(Event::ChaseFilled {
                        signal_id: params.signal_id.clone(),
                        fill_price: status.avg_fill_price.unwrap_or(price),
                        ticks,
                    });
                    return ExecutionResult::filled(
                        order_id,
                        status.avg_fill_price.unwrap_or(price),
                        params.size,
                    );
                }
                Ok(_) => {}
                Err(e) if e.is_transient() => {
                    warn!(signal_id = %params.signal_id, "Chase status poll failed: {}", e);
                }
                Err(e) => return ExecutionResult::error(e.code(), e.to_string()),
            }

            // Alpha decay gate.
            let alpha = remaining_alpha(elapsed_ms, half_life_ms);
            if alpha < self.min_alpha_threshold {
                if let Some(result) = self.cancel_resting(params, &order_id).await {
                    return result;
                }
                info!(
                    signal_id = %params.signal_id,
                    remaining_alpha = alpha,
                    elapsed_ms,
                    "Chase abandoned, alpha expired"
                );
                self.events.publish(Event::ChaseAlphaExpired {
                    signal_id: params.signal_id.clone(),
                    remaining_alpha: alpha,
                });
                return ExecutionResult::canceled(
                    ErrorCode::AlphaExpired,
                    format!("remaining_alpha {:.4} < {}", alpha, self.min_alpha_threshold),
                );
            }

            // Imbalance turning against us.
            let current_obi = self.cache.summary(&params.symbol).and_then(|s| s.obi);
            if obi_worsening(params.side, prev_obi, current_obi) {
                if let Some(result) = self.cancel_resting(params, &order_id).await {
                    return result;
                }
                self.events.publish(Event::ChaseObiWorsening {
                    signal_id: params.signal_id.clone(),
                    previous_obi: prev_obi.unwrap_or(0.0),
                    current_obi: current_obi.unwrap_or(0.0),
                });
                return ExecutionResult::canceled(
                    ErrorCode::ObiWorsening,
                    format!(
                        "obi {:?} -> {:?} against {:?}",
                        prev_obi, current_obi, params.side
                    ),
                );
            }
            prev_obi = current_obi.or(prev_obi);

            // Hard limits.
            if ticks >= self.max_chase_ticks || elapsed_ms >= self.max_chase_time.as_millis() as u64
            {
                if let Some(result) = self.cancel_resting(params, &order_id).await {
                    return result;
                }
                self.events.publish(Event::ChaseTimeout {
                    signal_id: params.signal_id.clone(),
                    ticks,
                    elapsed_ms,
                });
                return ExecutionResult::canceled(
                    ErrorCode::FillTimeout,
                    format!("{} ticks / {}ms without fill", ticks, elapsed_ms),
                );
            }

            // Reprice one tick in the adverse direction and re-post.
            if let Some(result) = self.cancel_resting(params, &order_id).await {
                return result;
            }
            price = match order_side {
                Side::Buy => price + tick_size,
                _ => price - tick_size,
            };
            ticks += 1;
            order_id = match self.place_at(params, price, ticks).await {
                Ok(id) => id,
                Err(result) => return result,
            };
        }
    }
}
