use crate::market_data::orderbook_cache::OrderBookCache;
use crate::market_data::types::{ApplyOutcome, BookLevel, BookSnapshot, DepthUpdate, PriceTick};
use futures::StreamExt;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{error, info, warn};
use url::Url;

const RECONNECT_BASE_DELAY_SECS: u64 = 1;
const RECONNECT_MAX_DELAY_SECS: u64 = 30;
const PRICE_CHANNEL_CAPACITY: usize = 1024;

/// Combined-stream depth message: {"stream":"btcusdt@depth@100ms","data":{...}}
#[derive(Debug, Deserialize)]
struct StreamMessage {
    #[allow(dead_code)]
    stream: String,
    data: DepthFrame,
}

#[derive(Debug, Deserialize)]
struct DepthFrame {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "U")]
    #[allow(dead_code)]
    first_update_id: u64,
    #[serde(rename = "u")]
    update_id: u64,
    #[serde(rename = "pu")]
    prev_update_id: u64,
    #[serde(rename = "b")]
    bids: Vec<[String; 2]>,
    #[serde(rename = "a")]
    asks: Vec<[String; 2]>,
    #[serde(rename = "E", default)]
    event_time: i64,
}

#[derive(Debug, Deserialize)]
struct RestDepthSnapshot {
    #[serde(rename = "lastUpdateId")]
    last_update_id: u64,
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

fn parse_levels(raw: &[[String; 2]]) -> Vec<BookLevel> {
    raw.iter()
        .filter_map(|pair| {
            let price = Decimal::from_str(&pair[0]).ok()?;
            let quantity = Decimal::from_str(&pair[1]).ok()?;
            Some(BookLevel { price, quantity })
        })
        .collect()
}

/// Single writer per symbol: this consumer is the only component that mutates
/// the order-book cache. Reconnects with exponential backoff and resyncs each
/// subscribed symbol from REST after every (re)connect or sequence gap.
pub struct DepthStreamConnector {
    cache: Arc<OrderBookCache>,
    ws_url: String,
    rest_url: String,
    symbols: Vec<String>,
    depth: usize,
    http: reqwest::Client,
    price_tx: broadcast::Sender<PriceTick>,
}

impl DepthStreamConnector {
    pub fn new(
        cache: Arc<OrderBookCache>,
        ws_url: String,
        rest_url: String,
        symbols: Vec<String>,
        depth: usize,
    ) -> Arc<Self> {
        let (price_tx, _) = broadcast::channel(PRICE_CHANNEL_CAPACITY);
        Arc::new(Self {
            cache,
            ws_url,
            rest_url,
            symbols,
            depth,
            http: reqwest::Client::new(),
            price_tx,
        })
    }

    /// Mid-price ticks for the client-side trigger engine.
    pub fn subscribe_prices(&self) -> broadcast::Receiver<PriceTick> {
        self.price_tx.subscribe()
    }

    fn stream_url(&self) -> String {
        let streams: Vec<String> = self
            .symbols
            .iter()
            .map(|s| format!("{}@depth@100ms", s.to_lowercase()))
            .collect();
        format!("{}?streams={}", self.ws_url, streams.join("/"))
    }

    async fn resync_symbol(&self, symbol: &str) {
        self.cache.invalidate(symbol);
        let url = format!(
            "{}/fapi/v1/depth?symbol={}&limit={}",
            self.rest_url, symbol, self.depth
        );
        match self.http.get(&url).send().await {
            Ok(resp) => match resp.json::<RestDepthSnapshot>().await {
                Ok(snapshot) => {
                    self.cache.apply_snapshot(BookSnapshot {
                        symbol: symbol.to_string(),
                        update_id: snapshot.last_update_id,
                        bids: parse_levels(&snapshot.bids),
                        asks: parse_levels(&snapshot.asks),
                    });
                    info!(symbol = %symbol, "Book resynced from REST snapshot");
                }
                Err(e) => warn!(symbol = %symbol, "Snapshot decode failed: {}", e),
            },
            Err(e) => warn!(symbol = %symbol, "Snapshot request failed: {}", e),
        }
    }

    async fn resync_all(&self) {
        for symbol in &self.symbols {
            self.resync_symbol(symbol).await;
        }
    }

    fn handle_frame(&self, frame: DepthFrame) -> Option<String> {
        let update = DepthUpdate {
            symbol: frame.symbol.clone(),
            prev_update_id: frame.prev_update_id,
            update_id: frame.update_id,
            bids: parse_levels(&frame.bids),
            asks: parse_levels(&frame.asks),
            event_time_ms: frame.event_time,
        };

        match self.cache.apply_update(&update) {
            ApplyOutcome::Applied => {
                if let Some(summary) = self.cache.summary(&frame.symbol) {
                    let _ = self.price_tx.send(PriceTick {
                        symbol: frame.symbol,
                        price: summary.mid_price(),
                        timestamp_ms: frame.event_time,
                    });
                }
                None
            }
            ApplyOutcome::DroppedStale => None,
            ApplyOutcome::GapDetected => Some(update.symbol),
        }
    }

    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let connector = self.clone();

        tokio::spawn(async move {
            let mut backoff_secs = RECONNECT_BASE_DELAY_SECS;

            loop {
                let url_str = connector.stream_url();
                info!("Connecting to depth stream: {}", url_str);

                if let Err(e) = Url::parse(&url_str) {
                    error!("Invalid WebSocket URL {}: {}", url_str, e);
                    return;
                }

                match connect_async(url_str.as_str()).await {
                    Ok((ws_stream, _)) => {
                        info!("✅ Depth stream connected");
                        backoff_secs = RECONNECT_BASE_DELAY_SECS;

                        // Books are unusable until the post-connect snapshot.
                        connector.resync_all().await;

                        let (_, mut read) = ws_stream.split();
                        while let Some(msg) = read.next().await {
                            match msg {
                                Ok(Message::Text(text)) => {
                                    match serde_json::from_str::<StreamMessage>(&text) {
                                        Ok(stream_msg) => {
                                            if let Some(gapped) =
                                                connector.handle_frame(stream_msg.data)
                                            {
                                                connector.resync_symbol(&gapped).await;
                                            }
                                        }
                                        Err(e) => {
                                            if text.contains("depthUpdate") {
                                                warn!("Failed to parse depth frame: {}", e);
                                            }
                                        }
                                    }
                                }
                                Ok(Message::Ping(_)) => {}
                                Ok(Message::Close(_)) => {
                                    warn!("Depth stream closed by server");
                                    break;
                                }
                                Err(e) => {
                                    error!("WebSocket error: {}", e);
                                    break;
                                }
                                _ => {}
                            }
                        }
                    }
                    Err(e) => {
                        error!("Failed to connect depth stream: {}", e);
                    }
                }

                // Subscriptions are baked into the URL, so they survive the
                // reconnect; books stay invalid until resynced.
                for symbol in &connector.symbols {
                    connector.cache.invalidate(symbol);
                }

                warn!("Depth stream disconnected. Reconnecting in {}s...", backoff_secs);
                tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                backoff_secs = (backoff_secs * 2).min(RECONNECT_MAX_DELAY_SECS);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_frame_parses_exchange_shape() {
        let raw = r#"{
            "stream": "btcusdt@depth@100ms",
            "data": {
                "e": "depthUpdate",
                "E": 1700000000500,
                "s": "BTCUSDT",
                "U": 101,
                "u": 105,
                "pu": 100,
                "b": [["50000.0", "2.5"], ["49999.5", "0"]],
                "a": [["50010.0", "1.0"]]
            }
        }"#;

        let msg: StreamMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.data.symbol, "BTCUSDT");
        assert_eq!(msg.data.prev_update_id, 100);
        assert_eq!(msg.data.update_id, 105);

        let bids = parse_levels(&msg.data.bids);
        assert_eq!(bids.len(), 2);
        assert!(bids[1].quantity.is_zero());
    }

    #[test]
    fn test_stream_url_joins_symbols() {
        let cache = OrderBookCache::new(5, Duration::from_secs(3));
        let connector = DepthStreamConnector::new(
            cache,
            "wss://example.com/stream".into(),
            "https://example.com".into(),
            vec!["BTCUSDT".into(), "ETHUSDT".into()],
            20,
        );
        assert_eq!(
            connector.stream_url(),
            "wss://example.com/stream?streams=btcusdt@depth@100ms/ethusdt@depth@100ms"
        );
    }
}
