pub mod limit_chaser;
pub mod limit_or_kill;
pub mod pyramid;

use crate::broker::adapter::{OrderRequest, OrderState};
use crate::broker::gateway::BrokerGateway;
use crate::error::ErrorCode;
use crate::model::{Side, SignalType};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// Inputs common to every placement algorithm.
#[derive(Debug, Clone)]
pub struct ExecutionParams {
    pub signal_id: String,
    pub symbol: String,
    /// Order side (Buy/Sell), already derived from the signal direction.
    pub side: Side,
    pub size: Decimal,
    pub limit_price: Option<Decimal>,
    pub stop_loss: Decimal,
    pub take_profits: Vec<Decimal>,
    pub signal_type: SignalType,
    pub urgency_score: u32,
    pub alpha_half_life_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Filled,
    PartiallyFilled,
    MissedEntry,
    Canceled,
    Error,
}

/// Top-of-book context captured at order-placement time, reported on
/// MISSED_ENTRY so operators can see how far price ran.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissedEntryDiagnostic {
    pub bid_at_entry: Decimal,
    pub current_bid: Decimal,
    pub price_movement_pct: Decimal,
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub fill_price: Option<Decimal>,
    pub fill_size: Decimal,
    pub residual_size: Decimal,
    pub reason: Option<String>,
    pub code: Option<ErrorCode>,
    pub broker_order_id: Option<String>,
    pub diagnostic: Option<MissedEntryDiagnostic>,
}

impl ExecutionResult {
    pub fn filled(order_id: String, price: Decimal, size: Decimal) -> Self {
        Self {
            status: ExecutionStatus::Filled,
            fill_price: Some(price),
            fill_size: size,
            residual_size: Decimal::ZERO,
            reason: None,
            code: None,
            broker_order_id: Some(order_id),
            diagnostic: None,
        }
    }

    pub fn partially_filled(
        order_id: String,
        price: Decimal,
        filled: Decimal,
        residual: Decimal,
    ) -> Self {
        Self {
            status: ExecutionStatus::PartiallyFilled,
            fill_price: Some(price),
            fill_size: filled,
            residual_size: residual,
            reason: None,
            code: None,
            broker_order_id: Some(order_id),
            diagnostic: None,
        }
    }

    pub fn canceled(code: ErrorCode, reason: String) -> Self {
        Self {
            status: ExecutionStatus::Canceled,
            fill_price: None,
            fill_size: Decimal::ZERO,
            residual_size: Decimal::ZERO,
            reason: Some(reason),
            code: Some(code),
            broker_order_id: None,
            diagnostic: None,
        }
    }

    pub fn error(code: ErrorCode, reason: String) -> Self {
        Self {
            status: ExecutionStatus::Error,
            fill_price: None,
            fill_size: Decimal::ZERO,
            residual_size: Decimal::ZERO,
            reason: Some(reason),
            code: Some(code),
            broker_order_id: None,
            diagnostic: None,
        }
    }

    pub fn is_filled(&self) -> bool {
        matches!(
            self.status,
            ExecutionStatus::Filled | ExecutionStatus::PartiallyFilled
        ) && self.fill_size > Decimal::ZERO
    }
}

/// Cooperative abort flag shared between the dispatcher and a running
/// strategy; honored at the next poll/tick boundary.
pub type AbortFlag = Arc<AtomicBool>;

pub fn aborted(flag: &AtomicBool) -> bool {
    flag.load(Ordering::SeqCst)
}

#[async_trait]
pub trait ExecutionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(&self, params: &ExecutionParams, abort: &AtomicBool) -> ExecutionResult;
}

/// TAKER-mode entry: cross the book with a market order. Used by Phase 2/3
/// where fill certainty beats queue position.
pub struct MarketEntry {
    gateway: Arc<BrokerGateway>,
}

impl MarketEntry {
    pub fn new(gateway: Arc<BrokerGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl ExecutionStrategy for MarketEntry {
    fn name(&self) -> &'static str {
        "market_entry"
    }

    async fn execute(&self, params: &ExecutionParams, abort: &AtomicBool) -> ExecutionResult {
        if aborted(abort) {
            return ExecutionResult::canceled(ErrorCode::MissedEntry, "aborted before send".into());
        }

        let request = OrderRequest::market(
            &params.symbol,
            params.side,
            params.size,
            format!("{}-mkt", params.signal_id),
        );

        let ack = match self.gateway.send_order(request).await {
            Ok(ack) => ack,
            Err(e) => return ExecutionResult::error(e.code(), e.to_string()),
        };

        // Market orders settle immediately on every supported venue; one
        // status read picks up the fill price.
        let status = match self
            .gateway
            .get_order_status(&params.symbol, &ack.broker_order_id)
            .await
        {
            Ok(s) => s,
            Err(e) => return ExecutionResult::error(e.code(), e.to_string()),
        };

        match status.state {
            OrderState::Filled => {
                info!(
                    signal_id = %params.signal_id,
                    symbol = %params.symbol,
                    fill_price = ?status.avg_fill_price,
                    "Market entry filled"
                );
                ExecutionResult::filled(
                    ack.broker_order_id,
                    status.avg_fill_price.unwrap_or(Decimal::ZERO),
                    status.executed_qty,
                )
            }
            OrderState::PartiallyFilled => ExecutionResult::partially_filled(
                ack.broker_order_id,
                status.avg_fill_price.unwrap_or(Decimal::ZERO),
                status.executed_qty,
                params.size - status.executed_qty,
            ),
            _ => ExecutionResult::error(
                ErrorCode::BrokerRejected,
                format!("market order ended {:?}", status.state),
            ),
        }
    }
}
