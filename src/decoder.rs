//! Decoder module for inbound WebSocket frames
//!
//! A [`Decoder`] turns one raw frame into a topic key plus a trade batch or a
//! depth update. Payload layouts are venue specific; [`BinanceDecoder`] is the
//! reference implementation for Binance combined streams.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::str::FromStr;
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::error::{FeedError, Result};
use crate::websocket::Frame;

/// Aggressor side of a trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeSide {
    Buy,
    Sell,
}

/// A single public trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: u64,
    pub side: TradeSide,
    pub price: Decimal,
    pub quantity: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Trades decoded from one frame, forwarded verbatim to the trade handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeBatch {
    pub symbol: String,
    pub trades: Vec<Trade>,
}

/// One price level change. A missing field makes the whole update malformed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthDelta {
    pub price: Option<Decimal>,
    pub quantity: Option<Decimal>,
}

impl DepthDelta {
    pub fn new(price: Decimal, quantity: Decimal) -> Self {
        Self {
            price: Some(price),
            quantity: Some(quantity),
        }
    }
}

impl From<(Decimal, Decimal)> for DepthDelta {
    fn from((price, quantity): (Decimal, Decimal)) -> Self {
        Self::new(price, quantity)
    }
}

/// Incremental or full book update for one symbol
#[derive(Debug, Clone, PartialEq)]
pub struct DepthUpdate {
    pub symbol: String,
    /// Discard the current book before applying the deltas
    pub is_snapshot: bool,
    pub asks: Vec<DepthDelta>,
    pub bids: Vec<DepthDelta>,
}

/// Result of decoding one frame
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Trades { topic: String, batch: TradeBatch },
    Depth { topic: String, update: DepthUpdate },
    /// Topic identified but carries nothing this client understands
    Unrecognized { topic: String },
    /// Control traffic (acks, application pongs) with no topic
    Skip,
}

/// Venue specific frame decoder
pub trait Decoder: Send + Sync {
    fn decode(&self, frame: &Frame) -> Result<Decoded>;
}

/// Binance combined stream message wrapper
#[derive(Debug, Clone, Deserialize)]
struct StreamMessage {
    stream: String,
    data: Value,
}

/// Binance trade message
#[derive(Debug, Clone, Deserialize)]
struct RawTrade {
    /// Symbol
    #[serde(rename = "s")]
    symbol: String,

    /// Trade ID
    #[serde(rename = "t")]
    trade_id: u64,

    /// Price
    #[serde(rename = "p", deserialize_with = "deserialize_decimal")]
    price: Decimal,

    /// Quantity
    #[serde(rename = "q", deserialize_with = "deserialize_decimal")]
    quantity: Decimal,

    /// Trade time
    #[serde(rename = "T")]
    trade_time: i64,

    /// Is buyer maker
    #[serde(rename = "m")]
    is_buyer_maker: bool,
}

/// Binance diff depth message
#[derive(Debug, Clone, Deserialize)]
struct RawDepthUpdate {
    #[serde(rename = "s")]
    symbol: String,

    #[serde(rename = "b", deserialize_with = "deserialize_deltas")]
    bids: Vec<DepthDelta>,

    #[serde(rename = "a", deserialize_with = "deserialize_deltas")]
    asks: Vec<DepthDelta>,
}

/// Binance partial book depth message (top N levels, full picture each time)
#[derive(Debug, Clone, Deserialize)]
struct RawPartialDepth {
    #[serde(deserialize_with = "deserialize_deltas")]
    bids: Vec<DepthDelta>,

    #[serde(deserialize_with = "deserialize_deltas")]
    asks: Vec<DepthDelta>,
}

/// Decoder for Binance combined streams (`/stream?streams=...` or `SUBSCRIBE`d)
#[derive(Debug, Clone, Default)]
pub struct BinanceDecoder;

impl BinanceDecoder {
    pub fn new() -> Self {
        Self
    }

    /// Stream names for the diff depth and trade channels of each symbol
    pub fn streams_for(symbols: &[String]) -> Vec<String> {
        symbols
            .iter()
            .flat_map(|s| {
                let s_lower = s.to_lowercase();
                vec![format!("{}@depth@100ms", s_lower), format!("{}@trade", s_lower)]
            })
            .collect()
    }

    /// `SUBSCRIBE` request for the given streams
    pub fn subscribe_message(streams: &[String], id: u64) -> Message {
        let payload = serde_json::json!({
            "method": "SUBSCRIBE",
            "params": streams,
            "id": id,
        });
        Message::Text(payload.to_string())
    }

    fn decode_stream(&self, stream: &str, data: Value) -> Result<Decoded> {
        let topic = stream.to_string();
        let (symbol, channel) = match stream.split_once('@') {
            Some(parts) => parts,
            None => return Ok(Decoded::Unrecognized { topic }),
        };

        if channel == "trade" {
            let raw: RawTrade = serde_json::from_value(data)?;
            let timestamp = Utc
                .timestamp_millis_opt(raw.trade_time)
                .single()
                .ok_or_else(|| FeedError::Decode(format!("invalid trade time {}", raw.trade_time)))?;

            let side = if raw.is_buyer_maker {
                TradeSide::Sell
            } else {
                TradeSide::Buy
            };

            let batch = TradeBatch {
                symbol: raw.symbol,
                trades: vec![Trade {
                    id: raw.trade_id,
                    side,
                    price: raw.price,
                    quantity: raw.quantity,
                    timestamp,
                }],
            };
            return Ok(Decoded::Trades { topic, batch });
        }

        if let Some(rest) = channel.strip_prefix("depth") {
            let levels = rest.split('@').next().unwrap_or_default();
            let update = if levels.is_empty() {
                let raw: RawDepthUpdate = serde_json::from_value(data)?;
                DepthUpdate {
                    symbol: raw.symbol,
                    is_snapshot: false,
                    asks: raw.asks,
                    bids: raw.bids,
                }
            } else if levels.chars().all(|c| c.is_ascii_digit()) {
                let raw: RawPartialDepth = serde_json::from_value(data)?;
                DepthUpdate {
                    symbol: symbol.to_uppercase(),
                    is_snapshot: true,
                    asks: raw.asks,
                    bids: raw.bids,
                }
            } else {
                return Ok(Decoded::Unrecognized { topic });
            };
            return Ok(Decoded::Depth { topic, update });
        }

        Ok(Decoded::Unrecognized { topic })
    }
}

impl Decoder for BinanceDecoder {
    fn decode(&self, frame: &Frame) -> Result<Decoded> {
        let text = frame.as_text()?;
        let value: Value = serde_json::from_str(text)?;

        // Subscription acks: {"result": null, "id": 1}
        if value.get("id").is_some() && value.get("stream").is_none() {
            return Ok(Decoded::Skip);
        }

        let message: StreamMessage = serde_json::from_value(value)?;
        self.decode_stream(&message.stream, message.data)
    }
}

/// Custom deserializer for Decimal from string
fn deserialize_decimal<'de, D>(deserializer: D) -> std::result::Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    Decimal::from_str(&s).map_err(serde::de::Error::custom)
}

/// Price level pairs; unparseable or missing entries become `None` so the
/// order book can reject the update as a whole
fn deserialize_deltas<'de, D>(deserializer: D) -> std::result::Result<Vec<DepthDelta>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<Vec<Value>> = Deserialize::deserialize(deserializer)?;
    Ok(raw
        .iter()
        .map(|pair| DepthDelta {
            price: level_field(pair.first()),
            quantity: level_field(pair.get(1)),
        })
        .collect())
}

fn level_field(value: Option<&Value>) -> Option<Decimal> {
    match value? {
        Value::String(s) => Decimal::from_str(s).ok(),
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        _ => None,
    }
}
