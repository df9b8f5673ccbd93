use crate::broker::adapter::{
    BrokerAdapter, OrderAck, OrderRequest, OrderState, OrderStatusReport, OrderType,
};
use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::model::{AccountSnapshot, BrokerPosition, Side};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;
use std::str::FromStr;
use tracing::info;

type HmacSha256 = Hmac<Sha256>;

const MAINNET_URL: &str = "https://api.bybit.com";
const TESTNET_URL: &str = "https://api-testnet.bybit.com";
const RECV_WINDOW: &str = "5000";

/// Linear USDT perpetual adapter (Bybit V5 unified account).
pub struct BybitAdapter {
    client: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
}

impl BybitAdapter {
    pub fn new(config: &BrokerConfig) -> Result<Self, BrokerError> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| BrokerError::Auth("missing Bybit api_key".into()))?;
        let api_secret = config
            .api_secret
            .clone()
            .ok_or_else(|| BrokerError::Auth("missing Bybit api_secret".into()))?;

        let base_url = if config.testnet {
            TESTNET_URL.to_string()
        } else {
            MAINNET_URL.to_string()
        };
        info!(base_url = %base_url, "Bybit adapter created");

        Ok(Self {
            client: Client::new(),
            base_url,
            api_key,
            api_secret,
        })
    }

    fn sign(&self, timestamp: &str, params: &str) -> Result<String, BrokerError> {
        let payload = format!("{}{}{}{}", timestamp, self.api_key, RECV_WINDOW, params);
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| BrokerError::Auth(e.to_string()))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// POST signs the JSON body; GET signs the query string.
    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        query: Option<String>,
        payload: Option<serde_json::Value>,
    ) -> Result<T, BrokerError> {
        let timestamp = chrono::Utc::now().timestamp_millis().to_string();
        let body_str = match &payload {
            Some(p) => serde_json::to_string(p)
                .map_err(|e| BrokerError::Rejected(format!("payload encode: {}", e)))?,
            None => String::new(),
        };

        let params_for_sign = if method == Method::GET {
            query.clone().unwrap_or_default()
        } else {
            body_str.clone()
        };
        let signature = self.sign(&timestamp, &params_for_sign)?;

        let mut url = format!("{}{}", self.base_url, endpoint);
        if let Some(q) = &query {
            url = format!("{}?{}", url, q);
        }

        let mut request = self
            .client
            .request(method, &url)
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", timestamp)
            .header("X-BAPI-SIGN", signature)
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
            .header("Content-Type", "application/json");

        if !body_str.is_empty() {
            request = request.body(body_str);
        }

        let response = request
            .send()
            .await
            .map_err(|e| BrokerError::Transient(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| BrokerError::Transient(e.to_string()))?;

        if status.is_server_error() {
            return Err(BrokerError::Transient(format!("HTTP {}: {}", status, text)));
        }
        if !status.is_success() {
            return Err(BrokerError::Rejected(format!("HTTP {}: {}", status, text)));
        }

        let base: BybitBaseResponse<T> = serde_json::from_str(&text)
            .map_err(|e| BrokerError::Rejected(format!("decode: {} | body: {}", e, text)))?;

        if base.ret_code != 0 {
            // 10006 is Bybit's own rate-limit code.
            if base.ret_code == 10006 {
                return Err(BrokerError::Transient(format!(
                    "Bybit throttled: {}",
                    base.ret_msg
                )));
            }
            return Err(BrokerError::Rejected(format!(
                "Bybit {}: {}",
                base.ret_code, base.ret_msg
            )));
        }
        Ok(base.result)
    }

    fn order_side(side: Side) -> &'static str {
        match side {
            Side::Buy | Side::Long => "Buy",
            Side::Sell | Side::Short => "Sell",
        }
    }

    fn map_state(status: &str) -> OrderState {
        match status {
            "Filled" => OrderState::Filled,
            "PartiallyFilled" => OrderState::PartiallyFilled,
            "Cancelled" | "PartiallyFilledCanceled" | "Deactivated" => OrderState::Canceled,
            "Rejected" => OrderState::Rejected,
            _ => OrderState::New,
        }
    }

    fn decimal_field(raw: &str) -> Decimal {
        Decimal::from_str(raw).unwrap_or(Decimal::ZERO)
    }
}

#[async_trait]
impl BrokerAdapter for BybitAdapter {
    fn name(&self) -> &str {
        "bybit"
    }

    async fn send_order(&self, order: OrderRequest) -> Result<OrderAck, BrokerError> {
        let order_type = match order.order_type {
            OrderType::Limit => "Limit",
            OrderType::Market => "Market",
            OrderType::StopMarket => {
                return Err(BrokerError::Rejected(
                    "stops are managed via set-trading-stop".into(),
                ))
            }
        };

        let time_in_force = if order.post_only { "PostOnly" } else { "GTC" };

        let mut payload = serde_json::json!({
            "category": "linear",
            "symbol": order.symbol,
            "side": Self::order_side(order.side),
            "orderType": order_type,
            "qty": order.quantity.to_string(),
            "timeInForce": time_in_force,
            "orderLinkId": order.client_order_id,
            "reduceOnly": order.reduce_only,
        });
        if let Some(price) = order.price {
            payload["price"] = serde_json::json!(price.to_string());
        }

        let resp: BybitOrderResult = self
            .request(Method::POST, "/v5/order/create", None, Some(payload))
            .await?;

        Ok(OrderAck {
            broker_order_id: resp.order_id,
            client_order_id: resp.order_link_id,
            symbol: order.symbol,
            state: OrderState::New,
            executed_qty: Decimal::ZERO,
            avg_price: None,
            t_ack: chrono::Utc::now().timestamp_millis(),
        })
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<OrderAck, BrokerError> {
        let payload = serde_json::json!({
            "category": "linear",
            "symbol": symbol,
            "orderId": order_id,
        });
        let resp: BybitOrderResult = self
            .request(Method::POST, "/v5/order/cancel", None, Some(payload))
            .await?;

        Ok(OrderAck {
            broker_order_id: resp.order_id,
            client_order_id: resp.order_link_id,
            symbol: symbol.to_string(),
            state: OrderState::Canceled,
            executed_qty: Decimal::ZERO,
            avg_price: None,
            t_ack: chrono::Utc::now().timestamp_millis(),
        })
    }

    async fn get_order_status(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<OrderStatusReport, BrokerError> {
        let query = format!("category=linear&symbol={}&orderId={}", symbol, order_id);
        let resp: BybitListResult<BybitOrderDetail> = self
            .request(Method::GET, "/v5/order/realtime", Some(query), None)
            .await?;

        let detail = resp
            .list
            .into_iter()
            .next()
            .ok_or_else(|| BrokerError::OrderNotFound(order_id.to_string()))?;

        let executed_qty = Self::decimal_field(&detail.cum_exec_qty);
        let avg = Self::decimal_field(&detail.avg_price);
        Ok(OrderStatusReport {
            broker_order_id: detail.order_id,
            state: Self::map_state(&detail.order_status),
            executed_qty,
            avg_fill_price: if avg.is_zero() { None } else { Some(avg) },
        })
    }

    async fn get_account(&self) -> Result<AccountSnapshot, BrokerError> {
        let query = "accountType=UNIFIED".to_string();
        let resp: BybitListResult<BybitWallet> = self
            .request(Method::GET, "/v5/account/wallet-balance", Some(query), None)
            .await?;

        let wallet = resp
            .list
            .into_iter()
            .next()
            .ok_or_else(|| BrokerError::Rejected("empty wallet response".into()))?;

        Ok(AccountSnapshot {
            equity: Self::decimal_field(&wallet.total_equity),
            cash: Self::decimal_field(&wallet.total_available_balance),
            margin_used: Self::decimal_field(&wallet.total_initial_margin),
        })
    }

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        let query = "category=linear&settleCoin=USDT".to_string();
        let resp: BybitListResult<BybitPosition> = self
            .request(Method::GET, "/v5/position/list", Some(query), None)
            .await?;

        Ok(resp
            .list
            .into_iter()
            .filter(|p| !Self::decimal_field(&p.size).is_zero())
            .map(|p| {
                let stop = Self::decimal_field(&p.stop_loss);
                BrokerPosition {
                    symbol: p.symbol,
                    side: if p.side == "Buy" { Side::Long } else { Side::Short },
                    size: Self::decimal_field(&p.size),
                    entry_price: Self::decimal_field(&p.avg_price),
                    stop_loss: if stop.is_zero() { None } else { Some(stop) },
                    unrealized_pnl: Self::decimal_field(&p.unrealised_pnl),
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
        let payload = serde_json::json!({
            "category": "linear",
            "symbol": symbol,
            "stopLoss": stop.to_string(),
            "positionIdx": 0,
        });
        let _: serde_json::Value = self
            .request(Method::POST, "/v5/position/trading-stop", None, Some(payload))
            .await?;
        Ok(())
    }

    async fn get_open_interest(&self, symbol: &str) -> Result<Decimal, BrokerError> {
        let query = format!(
            "category=linear&symbol={}&intervalTime=5min&limit=1",
            symbol
        );
        let resp: BybitListResult<BybitOpenInterest> = self
            .request(Method::GET, "/v5/market/open-interest", Some(query), None)
            .await?;
        resp.list
            .into_iter()
            .next()
            .map(|oi| Self::decimal_field(&oi.open_interest))
            .ok_or_else(|| BrokerError::Rejected("empty open-interest response".into()))
    }
}

#[derive(Deserialize)]
struct BybitBaseResponse<T> {
    #[serde(rename = "retCode")]
    ret_code: i32,
    #[serde(rename = "retMsg")]
    ret_msg: String,
    result: T,
}

#[derive(Deserialize)]
struct BybitListResult<T> {
    list: Vec<T>,
}

#[derive(Deserialize)]
struct BybitOrderResult {
    #[serde(rename = "orderId")]
    order_id: String,
    #[serde(rename = "orderLinkId")]
    order_link_id: String,
}

#[derive(Deserialize)]
struct BybitOrderDetail {
    #[serde(rename = "orderId")]
    order_id: String,
    #[serde(rename = "orderStatus")]
    order_status: String,
    #[serde(rename = "cumExecQty", default)]
    cum_exec_qty: String,
    #[serde(rename = "avgPrice", default)]
    avg_price: String,
}

#[derive(Deserialize)]
struct BybitWallet {
    #[serde(rename = "totalEquity", default)]
    total_equity: String,
    #[serde(rename = "totalAvailableBalance", default)]
    total_available_balance: String,
    #[serde(rename = "totalInitialMargin", default)]
    total_initial_margin: String,
}

#[derive(Deserialize)]
struct BybitPosition {
    symbol: String,
    side: String,
    #[serde(default)]
    size: String,
    #[serde(rename = "avgPrice", default)]
    avg_price: String,
    #[serde(rename = "stopLoss", default)]
    stop_loss: String,
    #[serde(rename = "unrealisedPnl", default)]
    unrealised_pnl: String,
}

#[derive(Deserialize)]
struct BybitOpenInterest {
    #[serde(rename = "openInterest")]
    open_interest: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_mapping() {
        assert_eq!(BybitAdapter::map_state("Filled"), OrderState::Filled);
        assert_eq!(
            BybitAdapter::map_state("PartiallyFilled"),
            OrderState::PartiallyFilled
        );
        assert_eq!(BybitAdapter::map_state("Cancelled"), OrderState::Canceled);
        assert_eq!(BybitAdapter::map_state("New"), OrderState::New);
    }

    #[test]
    fn test_missing_credentials_fail_closed() {
        let config = BrokerConfig::default();
        assert!(matches!(
            BybitAdapter::new(&config),
            Err(BrokerError::Auth(_))
        ));
    }

    #[test]
    fn test_wallet_response_decodes() {
        let raw = r#"{
            "retCode": 0,
            "retMsg": "OK",
            "result": {
                "list": [{
                    "totalEquity": "1234.56",
                    "totalAvailableBalance": "1000.00",
                    "totalInitialMargin": "234.56"
                }]
            }
        }"#;
        let resp: BybitBaseResponse<BybitListResult<BybitWallet>> =
            serde_json::from_str(raw).unwrap();
        assert_eq!(resp.ret_code, 0);
        assert_eq!(resp.result.list[0].total_equity, "1234.56");
    }
}
