use crate::broker::adapter::{BrokerAdapter, OrderAck, OrderRequest, OrderStatusReport};
use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::metrics;
use crate::model::{AccountSnapshot, BrokerPosition, Candle};
use crate::rate_limiter::TokenBucket;
use rust_decimal::Decimal;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

const RETRY_BASE_DELAY_MS: u64 = 100;

/// The only component that touches adapters. Every call first takes a token
/// from the process-wide bucket within a bounded wait, then runs with a
/// per-call timeout; transient faults retry with capped exponential backoff,
/// everything else surfaces immediately.
pub struct BrokerGateway {
    adapter: Arc<dyn BrokerAdapter>,
    limiter: TokenBucket,
    acquire_timeout: Duration,
    call_timeout: Duration,
    max_retries: u32,
}

impl BrokerGateway {
    pub fn new(adapter: Arc<dyn BrokerAdapter>, config: &BrokerConfig) -> Arc<Self> {
        info!(
            adapter = adapter.name(),
            rate_limit_rps = config.rate_limit_rps,
            burst = config.rate_limit_burst,
            "Broker gateway initialized"
        );
        Arc::new(Self {
            adapter,
            limiter: TokenBucket::new(config.rate_limit_burst, config.rate_limit_rps),
            acquire_timeout: Duration::from_millis(config.acquire_timeout_ms),
            call_timeout: Duration::from_millis(config.call_timeout_ms),
            max_retries: config.max_retries,
        })
    }

    pub fn adapter_name(&self) -> &str {
        self.adapter.name()
    }

    async fn call<T, F, Fut>(&self, op: &'static str, mut f: F) -> Result<T, BrokerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BrokerError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            if let Err(e) = self.limiter.acquire_timeout(1, self.acquire_timeout).await {
                metrics::inc_rate_limited();
                return Err(e);
            }

            let result = match timeout(self.call_timeout, f()).await {
                Ok(r) => r,
                Err(_) => Err(BrokerError::Transient(format!("{} timed out", op))),
            };

            match result {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    let delay = RETRY_BASE_DELAY_MS * (1u64 << attempt.min(6));
                    warn!(
                        op,
                        attempt = attempt + 1,
                        delay_ms = delay,
                        "Transient broker fault, retrying: {}",
                        e
                    );
                    attempt += 1;
                    sleep(Duration::from_millis(delay)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn send_order(&self, order: OrderRequest) -> Result<OrderAck, BrokerError> {
        let adapter = self.adapter.clone();
        self.call("send_order", move || {
            let adapter = adapter.clone();
            let order = order.clone();
            async move { adapter.send_order(order).await }
        })
        .await
    }

    pub async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<OrderAck, BrokerError> {
        let adapter = self.adapter.clone();
        let symbol = symbol.to_string();
        let order_id = order_id.to_string();
        self.call("cancel_order", move || {
            let adapter = adapter.clone();
            let symbol = symbol.clone();
            let order_id = order_id.clone();
            async move { adapter.cancel_order(&symbol, &order_id).await }
        })
        .await
    }

    pub async fn get_order_status(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<OrderStatusReport, BrokerError> {
        let adapter = self.adapter.clone();
        let symbol = symbol.to_string();
        let order_id = order_id.to_string();
        self.call("get_order_status", move || {
            let adapter = adapter.clone();
            let symbol = symbol.clone();
            let order_id = order_id.clone();
            async move { adapter.get_order_status(&symbol, &order_id).await }
        })
        .await
    }

    pub async fn get_account(&self) -> Result<AccountSnapshot, BrokerError> {
        let adapter = self.adapter.clone();
        self.call("get_account", move || {
            let adapter = adapter.clone();
            async move { adapter.get_account().await }
        })
        .await
    }

    pub async fn get_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        let adapter = self.adapter.clone();
        self.call("get_positions", move || {
            let adapter = adapter.clone();
            async move { adapter.get_positions().await }
        })
        .await
    }

    pub async fn close_position(&self, symbol: &str) -> Result<OrderAck, BrokerError> {
        let adapter = self.adapter.clone();
        let symbol = symbol.to_string();
        self.call("close_position", move || {
            let adapter = adapter.clone();
            let symbol = symbol.clone();
            async move { adapter.close_position(&symbol).await }
        })
        .await
    }

    pub async fn close_all_positions(&self) -> Result<usize, BrokerError> {
        let adapter = self.adapter.clone();
        self.call("close_all_positions", move || {
            let adapter = adapter.clone();
            async move { adapter.close_all_positions().await }
        })
        .await
    }

    pub async fn test_connection(&self) -> Result<(), BrokerError> {
        let adapter = self.adapter.clone();
        self.call("test_connection", move || {
            let adapter = adapter.clone();
            async move { adapter.test_connection().await }
        })
        .await
    }

    pub async fn update_stop_loss(&self, symbol: &str, stop: Decimal) -> Result<(), BrokerError> {
        let adapter = self.adapter.clone();
        let symbol = symbol.to_string();
        self.call("update_stop_loss", move || {
            let adapter = adapter.clone();
            let symbol = symbol.clone();
            async move { adapter.update_stop_loss(&symbol, stop).await }
        })
        .await
    }

    pub async fn get_open_interest(&self, symbol: &str) -> Result<Decimal, BrokerError> {
        let adapter = self.adapter.clone();
        let symbol = symbol.to_string();
        self.call("get_open_interest", move || {
            let adapter = adapter.clone();
            let symbol = symbol.clone();
            async move { adapter.get_open_interest(&symbol).await }
        })
        .await
    }

    pub async fn fetch_ohlcv(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<Candle>, BrokerError> {
        let adapter = self.adapter.clone();
        let symbol = symbol.to_string();
        let interval = interval.to_string();
        self.call("fetch_ohlcv", move || {
            let adapter = adapter.clone();
            let symbol = symbol.clone();
            let interval = interval.clone();
            async move { adapter.fetch_ohlcv(&symbol, &interval, limit).await }
        })
        .await
    }
}
