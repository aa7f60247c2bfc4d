//! Market Stream - resilient streaming market data client
//!
//! Keeps a WebSocket feed alive across failures: heartbeats and staleness
//! checks detect dead links, the controller redials and replays every
//! subscription in order, and depth updates are merged into sorted order
//! books before reaching handlers.

pub mod config;
pub mod decoder;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod orderbook;
pub mod websocket;

pub use config::Config;
pub use decoder::{BinanceDecoder, Decoded, Decoder, DepthDelta, DepthUpdate, Trade, TradeBatch, TradeSide};
pub use dispatch::{Delivery, Dispatcher, Handler};
pub use error::{FeedError, Result};
pub use metrics::FeedMetrics;
pub use orderbook::{BookSnapshot, Level, OrderBook, OrderBookManager, Side};
pub use websocket::{ConnectionState, Connector, FeedClient, FeedClientBuilder, Frame, HeartbeatProbe, Link};
