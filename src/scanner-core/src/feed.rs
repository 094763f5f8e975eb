//! Upstream feed client: one durable duplex WebSocket stream carrying book
//! snapshots, price-change deltas, and trade prints for every watched token.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::models::TokenId;

pub type FeedStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("websocket connection failed: {0}")]
    Connection(#[from] WsError),

    #[error("failed to serialise subscription frame: {0}")]
    Serialize(String),

    #[error("connect timed out")]
    Timeout,
}

/// One resting price level as carried on the wire (decimal strings).
#[derive(Debug, Clone, Deserialize)]
pub struct WireLevel {
    pub price: String,
    pub size: String,
}

impl WireLevel {
    pub fn price_decimal(&self) -> Option<Decimal> {
        self.price.parse().ok()
    }

    pub fn size_decimal(&self) -> Option<Decimal> {
        self.size.parse().ok()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BookFrame {
    pub event_type: String,
    pub asset_id: String,
    #[serde(alias = "buys")]
    pub bids: Vec<WireLevel>,
    #[serde(alias = "sells")]
    pub asks: Vec<WireLevel>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriceChangeEntry {
    pub asset_id: String,
    pub price: String,
    pub size: String,
    pub side: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriceChangeFrame {
    pub event_type: String,
    pub price_changes: Vec<PriceChangeEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TradeFrame {
    pub event_type: String,
    pub asset_id: String,
    pub size: String,
}

/// Parsed shape of a server->client frame. Malformed frames and unrecognised
/// event kinds both resolve to variants that callers drop silently.
#[derive(Debug, Clone)]
pub enum FeedMessage {
    Book(BookFrame),
    Books(Vec<BookFrame>),
    PriceChange(PriceChangeFrame),
    Trade(TradeFrame),
    Ack,
    Unrecognised,
}

/// Parse one raw text frame. Never panics; unparseable or unknown frames
/// resolve to `Unrecognised` and are the caller's responsibility to drop.
pub fn parse_message(text: &str) -> FeedMessage {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
        return FeedMessage::Unrecognised;
    };

    if let Some(arr) = value.as_array() {
        if arr.is_empty() {
            return FeedMessage::Ack;
        }
        let books: Vec<BookFrame> = arr
            .iter()
            .filter(|v| v.get("event_type").and_then(|e| e.as_str()) == Some("book"))
            .filter_map(|v| serde_json::from_value(v.clone()).ok())
            .collect();
        if !books.is_empty() {
            return FeedMessage::Books(books);
        }
        return FeedMessage::Unrecognised;
    }

    match value.get("event_type").and_then(|v| v.as_str()) {
        Some("book") => serde_json::from_value(value)
            .map(FeedMessage::Book)
            .unwrap_or(FeedMessage::Unrecognised),
        Some("price_change") => serde_json::from_value(value)
            .map(FeedMessage::PriceChange)
            .unwrap_or(FeedMessage::Unrecognised),
        Some("last_trade_price") => serde_json::from_value(value)
            .map(FeedMessage::Trade)
            .unwrap_or(FeedMessage::Unrecognised),
        _ => FeedMessage::Unrecognised,
    }
}

#[derive(Debug, Serialize)]
pub struct SubscribeRequest {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub assets_ids: Vec<String>,
}

impl SubscribeRequest {
    pub fn market(asset_ids: Vec<String>) -> Self {
        Self {
            msg_type: "market".to_string(),
            assets_ids: asset_ids,
        }
    }
}

/// Maximum token identifiers carried in one subscription frame.
const SUBSCRIBE_BATCH_SIZE: usize = 500;

/// Feed client holding the reconnect posture. Does not itself own a run
/// loop; the binary's Feed Connector task drives it, interleaving control
/// messages between frame reads.
pub struct FeedClient {
    ws_url: String,
    reconnect_delay: Duration,
    max_reconnect_delay: Duration,
    keepalive_interval: Duration,
}

impl FeedClient {
    pub fn new(ws_url: String) -> Self {
        Self {
            ws_url,
            reconnect_delay: Duration::from_millis(100),
            max_reconnect_delay: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(30),
        }
    }

    pub fn keepalive_interval(&self) -> Duration {
        self.keepalive_interval
    }

    pub fn initial_reconnect_delay(&self) -> Duration {
        self.reconnect_delay
    }

    pub async fn connect(&self) -> Result<FeedStream, FeedError> {
        info!(url = %self.ws_url, "connecting to feed");
        let (stream, _) = timeout(Duration::from_secs(10), connect_async(&self.ws_url))
            .await
            .map_err(|_| FeedError::Timeout)??;
        info!("feed connected");
        Ok(stream)
    }

    /// Connect, retrying with exponential backoff starting at 100ms and
    /// capping at 30s. Resets on the next successful `connect` call; the
    /// reset itself happens in the caller since this client holds no
    /// mutable attempt state across calls.
    pub async fn connect_with_retry(&self) -> FeedStream {
        let mut delay = self.reconnect_delay;
        loop {
            match self.connect().await {
                Ok(stream) => return stream,
                Err(e) => {
                    warn!(error = %e, delay_ms = delay.as_millis() as u64, "feed connect failed, retrying");
                    sleep(delay).await;
                    delay = std::cmp::min(delay * 2, self.max_reconnect_delay);
                }
            }
        }
    }

    /// Send the full watched set, chunked to `SUBSCRIBE_BATCH_SIZE` per frame.
    pub async fn subscribe(&self, ws: &mut FeedStream, tokens: &[TokenId]) -> Result<(), FeedError> {
        let total_batches = tokens.len().div_ceil(SUBSCRIBE_BATCH_SIZE).max(1);
        for (batch_num, chunk) in tokens.chunks(SUBSCRIBE_BATCH_SIZE.max(1)).enumerate() {
            let request = SubscribeRequest::market(chunk.to_vec());
            let text = serde_json::to_string(&request).map_err(|e| FeedError::Serialize(e.to_string()))?;
            debug!(batch = batch_num + 1, total = total_batches, count = chunk.len(), "sending subscribe batch");
            ws.send(Message::Text(text.into())).await?;
        }
        Ok(())
    }

    pub async fn unsubscribe(&self, ws: &mut FeedStream, tokens: &[TokenId]) -> Result<(), FeedError> {
        for chunk in tokens.chunks(SUBSCRIBE_BATCH_SIZE.max(1)) {
            let mut request = SubscribeRequest::market(chunk.to_vec());
            request.msg_type = "unsubscribe".to_string();
            let text = serde_json::to_string(&request).map_err(|e| FeedError::Serialize(e.to_string()))?;
            ws.send(Message::Text(text.into())).await?;
        }
        Ok(())
    }

    pub async fn send_ping(&self, ws: &mut FeedStream) -> Result<(), FeedError> {
        ws.send(Message::Ping(Vec::new().into())).await?;
        Ok(())
    }
}
