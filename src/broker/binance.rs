use crate::broker::adapter::{
    BrokerAdapter, OrderAck, OrderRequest, OrderState, OrderStatusReport, OrderType,
};
use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::model::{AccountSnapshot, BrokerPosition, Candle, Side};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::info;

type HmacSha256 = Hmac<Sha256>;

const MAINNET_URL: &str = "https://fapi.binance.com";
const TESTNET_URL: &str = "https://testnet.binancefuture.com";

/// USD-M futures adapter. All signed endpoints take their parameters as a
/// query string; the HMAC goes over that exact string.
pub struct BinanceAdapter {
    client: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
}

impl BinanceAdapter {
    pub fn new(config: &BrokerConfig) -> Result<Self, BrokerError> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| BrokerError::Auth("missing Binance api_key".into()))?;
        let api_secret = config
            .api_secret
            .clone()
            .ok_or_else(|| BrokerError::Auth("missing Binance api_secret".into()))?;

        let base_url = if config.testnet {
            TESTNET_URL.to_string()
        } else {
            MAINNET_URL.to_string()
        };
        info!(base_url = %base_url, "Binance adapter created");

        Ok(Self {
            client: Client::new(),
            base_url,
            api_key,
            api_secret,
        })
    }

    fn sign_query(&self, params: &BTreeMap<&str, String>) -> Result<String, BrokerError> {
        let query = serde_urlencoded::to_string(params)
            .map_err(|e| BrokerError::Rejected(format!("query encode: {}", e)))?;
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| BrokerError::Auth(e.to_string()))?;
        mac.update(query.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());
        Ok(format!("{}&signature={}", query, signature))
    }

    async fn signed_request<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        mut params: BTreeMap<&str, String>,
    ) -> Result<T, BrokerError> {
        params.insert(
            "timestamp",
            chrono::Utc::now().timestamp_millis().to_string(),
        );
        params.insert("recvWindow", "5000".to_string());

        let query = self.sign_query(&params)?;
        let url = format!("{}{}?{}", self.base_url, endpoint, query);

        let response = self
            .client
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(|e| BrokerError::Transient(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| BrokerError::Transient(e.to_string()))?;

        if status.as_u16() == 429 || status.as_u16() == 418 {
            return Err(BrokerError::Transient(format!("Binance throttled: {}", text)));
        }
        if status.is_server_error() {
            return Err(BrokerError::Transient(format!("HTTP {}: {}", status, text)));
        }
        if !status.is_success() {
            return Err(BrokerError::Rejected(format!("HTTP {}: {}", status, text)));
        }

        serde_json::from_str(&text)
            .map_err(|e| BrokerError::Rejected(format!("decode: {} | body: {}", e, text)))
    }

    fn order_side(side: Side) -> &'static str {
        match side {
            Side::Buy | Side::Long => "BUY",
            Side::Sell | Side::Short => "SELL",
        }
    }

    fn map_state(status: &str) -> OrderState {
        match status {
            "FILLED" => OrderState::Filled,
            "PARTIALLY_FILLED" => OrderState::PartiallyFilled,
            "CANCELED" | "EXPIRED" => OrderState::Canceled,
            "REJECTED" => OrderState::Rejected,
            _ => OrderState::New,
        }
    }

    fn dec(raw: &str) -> Decimal {
        Decimal::from_str(raw).unwrap_or(Decimal::ZERO)
    }
}

#[async_trait]
impl BrokerAdapter for BinanceAdapter {
    fn name(&self) -> &str {
        "binance"
    }

    async fn send_order(&self, order: OrderRequest) -> Result<OrderAck, BrokerError> {
        let mut params = BTreeMap::new();
        params.insert("symbol", order.symbol.clone());
        params.insert("side", Self::order_side(order.side).to_string());
        params.insert("quantity", order.quantity.to_string());
        params.insert("newClientOrderId", order.client_order_id.clone());

        match order.order_type {
            OrderType::Limit => {
                params.insert("type", "LIMIT".to_string());
                let price = order
                    .price
                    .ok_or_else(|| BrokerError::Rejected("limit order without price".into()))?;
                params.insert("price", price.to_string());
                // GTX = post-only on Binance futures.
                params.insert(
                    "timeInForce",
                    if order.post_only { "GTX" } else { "GTC" }.to_string(),
                );
            }
            OrderType::Market => {
                params.insert("type", "MARKET".to_string());
            }
            OrderType::StopMarket => {
                params.insert("type", "STOP_MARKET".to_string());
                let stop = order
                    .stop_price
                    .ok_or_else(|| BrokerError::Rejected("stop order without stop price".into()))?;
                params.insert("stopPrice", stop.to_string());
            }
        }
        if order.reduce_only {
            params.insert("reduceOnly", "true".to_string());
        }

        let resp: BinanceOrder = self
            .signed_request(Method::POST, "/fapi/v1/order", params)
            .await?;

        let executed = Self::dec(&resp.executed_qty);
        let avg = Self::dec(&resp.avg_price);
        Ok(OrderAck {
            broker_order_id: resp.order_id.to_string(),
            client_order_id: resp.client_order_id,
            symbol: resp.symbol,
            state: Self::map_state(&resp.status),
            executed_qty: executed,
            avg_price: if avg.is_zero() { None } else { Some(avg) },
            t_ack: chrono::Utc::now().timestamp_millis(),
        })
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<OrderAck, BrokerError> {
        let mut params = BTreeMap::new();
        params.insert("symbol", symbol.to_string());
        params.insert("orderId", order_id.to_string());

        let resp: BinanceOrder = self
            .signed_request(Method::DELETE, "/fapi/v1/order", params)
            .await?;

        let executed = Self::dec(&resp.executed_qty);
        let avg = Self::dec(&resp.avg_price);
        Ok(OrderAck {
            broker_order_id: resp.order_id.to_string(),
            client_order_id: resp.client_order_id,
            symbol: resp.symbol,
            state: Self::map_state(&resp.status),
            executed_qty: executed,
            avg_price: if avg.is_zero() { None } else { Some(avg) },
            t_ack: chrono::Utc::now().timestamp_millis(),
        })
    }

    async fn get_order_status(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<OrderStatusReport, BrokerError> {
        let mut params = BTreeMap::new();
        params.insert("symbol", symbol.to_string());
        params.insert("orderId", order_id.to_string());

        let resp: BinanceOrder = self
            .signed_request(Method::GET, "/fapi/v1/order", params)
            .await?;

        let executed = Self::dec(&resp.executed_qty);
        let avg = Self::dec(&resp.avg_price);
        Ok(OrderStatusReport {
            broker_order_id: resp.order_id.to_string(),
            state: Self::map_state(&resp.status),
            executed_qty: executed,
            avg_fill_price: if avg.is_zero() { None } else { Some(avg) },
        })
    }

    async fn get_account(&self) -> Result<AccountSnapshot, BrokerError> {
        let resp: BinanceAccount = self
            .signed_request(Method::GET, "/fapi/v2/account", BTreeMap::new())
            .await?;

        Ok(AccountSnapshot {
            equity: Self::dec(&resp.total_margin_balance),
            cash: Self::dec(&resp.available_balance),
            margin_used: Self::dec(&resp.total_initial_margin),
        })
    }

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        let resp: Vec<BinancePositionRisk> = self
            .signed_request(Method::GET, "/fapi/v2/positionRisk", BTreeMap::new())
            .await?;

        Ok(resp
            .into_iter()
            .filter(|p| !Self::dec(&p.position_amt).is_zero())
            .map(|p| {
                let amt = Self::dec(&p.position_amt);
                BrokerPosition {
                    symbol: p.symbol,
                    side: if amt > Decimal::ZERO {
                        Side::Long
                    } else {
                        Side::Short
                    },
                    size: amt.abs(),
                    entry_price: Self::dec(&p.entry_price),
                    stop_loss: None,
                    unrealized_pnl: Self::dec(&p.un_realized_profit),
                }
            })
            .collect())
    }

    async fn close_position(&self, symbol: &str) -> Result<OrderAck, BrokerError> {
        let positions = self.get_positions().await?;
        let position = positions
            .into_iter()
            .find(|p| p.symbol == symbol)
            .ok_or_else(|| BrokerError::Rejected(format!("no position in {}", symbol)))?;

        self.send_order(OrderRequest {
            symbol: symbol.to_string(),
            side: position.side.exit_order_side(),
            order_type: OrderType::Market,
            quantity: position.size,
            price: None,
            stop_price: None,
            client_order_id: format!("close-{}", chrono::Utc::now().timestamp_millis()),
            post_only: false,
            reduce_only: true,
        })
        .await
    }

    async fn close_all_positions(&self) -> Result<usize, BrokerError> {
        let positions = self.get_positions().await?;
        let mut closed = 0;
        for position in positions {
            self.close_position(&position.symbol).await?;
            closed += 1;
        }
        Ok(closed)
    }

    async fn test_connection(&self) -> Result<(), BrokerError> {
        self.get_account().await.map(|_| ())
    }

    async fn update_stop_loss(&self, symbol: &str, stop: Decimal) -> Result<(), BrokerError> {
        let positions = self.get_positions().await?;
        let position = positions
            .into_iter()
            .find(|p| p.symbol == symbol)
            .ok_or_else(|| BrokerError::Rejected(format!("no position in {}", symbol)))?;

        // Replace-style stop: closePosition STOP_MARKET at the new level.
        self.send_order(OrderRequest {
            symbol: symbol.to_string(),
            side: position.side.exit_order_side(),
            order_type: OrderType::StopMarket,
            quantity: position.size,
            price: None,
            stop_price: Some(stop),
            client_order_id: format!("sl-{}", chrono::Utc::now().timestamp_millis()),
            post_only: false,
            reduce_only: true,
        })
        .await
        .map(|_| ())
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<Candle>, BrokerError> {
        let url = format!(
            "{}/fapi/v1/klines?symbol={}&interval={}&limit={}",
            self.base_url, symbol, interval, limit
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| BrokerError::Transient(e.to_string()))?;
        let rows: Vec<Vec<serde_json::Value>> = response
            .json()
            .await
            .map_err(|e| BrokerError::Rejected(format!("decode klines: {}", e)))?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let as_dec = |v: &serde_json::Value| {
                    v.as_str().and_then(|s| Decimal::from_str(s).ok())
                };
                Some(Candle {
                    open_time: row.first()?.as_i64()?,
                    open: as_dec(row.get(1)?)?,
                    high: as_dec(row.get(2)?)?,
                    low: as_dec(row.get(3)?)?,
                    close: as_dec(row.get(4)?)?,
                    volume: as_dec(row.get(5)?)?,
                })
            })
            .collect())
    }
}

#[derive(Deserialize)]
struct BinanceOrder {
    #[serde(rename = "orderId")]
    order_id: u64,
    #[serde(rename = "clientOrderId")]
    client_order_id: String,
    symbol: String,
    status: String,
    #[serde(rename = "executedQty", default)]
    executed_qty: String,
    #[serde(rename = "avgPrice", default)]
    avg_price: String,
}

#[derive(Deserialize)]
struct BinanceAccount {
    #[serde(rename = "totalMarginBalance", default)]
    total_margin_balance: String,
    #[serde(rename = "availableBalance", default)]
    available_balance: String,
    #[serde(rename = "totalInitMargin", default)]
    total_initial_margin: String,
}

#[derive(Deserialize)]
struct BinancePositionRisk {
    symbol: String,
    #[serde(rename = "positionAmt", default)]
    position_amt: String,
    #[serde(rename = "entryPrice", default)]
    entry_price: String,
    #[serde(rename = "unRealizedProfit", default)]
    un_realized_profit: String,
}
