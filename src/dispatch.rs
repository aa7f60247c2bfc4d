//! Message dispatcher
//!
//! Routes each decoded frame to the handler registered for its topic. Depth
//! updates pass through the order book first; the handler receives the
//! resulting snapshot.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, error, trace, warn};

use crate::decoder::{Decoded, Decoder, TradeBatch};
use crate::error::{FeedError, Result};
use crate::metrics::FeedMetrics;
use crate::orderbook::{BookSnapshot, OrderBookManager};
use crate::websocket::Frame;

pub type TradeHandler = Arc<dyn Fn(&TradeBatch) + Send + Sync>;
pub type DepthHandler = Arc<dyn Fn(&BookSnapshot) + Send + Sync>;

/// Callback bound to one topic
#[derive(Clone)]
pub enum Handler {
    Trades(TradeHandler),
    Depth(DepthHandler),
}

impl Handler {
    pub fn trades<F>(f: F) -> Self
    where
        F: Fn(&TradeBatch) + Send + Sync + 'static,
    {
        Handler::Trades(Arc::new(f))
    }

    pub fn depth<F>(f: F) -> Self
    where
        F: Fn(&BookSnapshot) + Send + Sync + 'static,
    {
        Handler::Depth(Arc::new(f))
    }

    fn kind(&self) -> &'static str {
        match self {
            Handler::Trades(_) => "trades",
            Handler::Depth(_) => "depth",
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handler::{}", self.kind())
    }
}

/// What happened to a frame
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Trades,
    Depth(BookSnapshot),
    /// Control traffic with no topic
    Skipped,
    /// Decoded fine but nobody listens on this topic
    Unrouted(String),
}

/// Topic router shared by every link generation
pub struct Dispatcher {
    decoder: Arc<dyn Decoder>,
    handlers: RwLock<HashMap<String, Handler>>,
    books: Mutex<OrderBookManager>,
    metrics: Arc<FeedMetrics>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("topics", &self.topics())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(decoder: Arc<dyn Decoder>, depth_limit: Option<usize>, metrics: Arc<FeedMetrics>) -> Self {
        Self {
            decoder,
            handlers: RwLock::new(HashMap::new()),
            books: Mutex::new(OrderBookManager::with_depth(depth_limit)),
            metrics,
        }
    }

    /// Bind `handler` to `topic`, replacing any previous binding
    pub fn register(&self, topic: impl Into<String>, handler: Handler) {
        let topic = topic.into();
        debug!(topic = %topic, kind = handler.kind(), "Registering handler");
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(topic, handler);
    }

    pub fn is_registered(&self, topic: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(topic)
    }

    pub fn topics(&self) -> Vec<String> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn handler_for(&self, topic: &str) -> Option<Handler> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .cloned()
    }

    /// Decode one frame and deliver it.
    ///
    /// Handlers run outside every internal lock.
    pub fn dispatch(&self, frame: &Frame) -> Result<Delivery> {
        match self.decoder.decode(frame)? {
            Decoded::Skip => Ok(Delivery::Skipped),
            Decoded::Unrecognized { topic } => Ok(Delivery::Unrouted(topic)),
            Decoded::Trades { topic, batch } => match self.handler_for(&topic) {
                Some(Handler::Trades(handler)) => {
                    handler(&batch);
                    Ok(Delivery::Trades)
                }
                Some(_) => Err(FeedError::HandlerMismatch {
                    topic,
                    expected: "trades",
                }),
                None => Ok(Delivery::Unrouted(topic)),
            },
            Decoded::Depth { topic, update } => {
                let handler = match self.handler_for(&topic) {
                    Some(Handler::Depth(handler)) => handler,
                    Some(_) => {
                        return Err(FeedError::HandlerMismatch {
                            topic,
                            expected: "depth",
                        })
                    }
                    None => return Ok(Delivery::Unrouted(topic)),
                };

                let snapshot = {
                    let mut books = self.books.lock().unwrap_or_else(PoisonError::into_inner);
                    books.apply_update(&update)?
                };
                handler(&snapshot);
                Ok(Delivery::Depth(snapshot))
            }
        }
    }

    /// Dispatch and log; no frame-level failure escapes
    pub fn dispatch_logged(&self, frame: &Frame) {
        self.metrics.frames_received.inc();

        match self.dispatch(frame) {
            Ok(Delivery::Trades) | Ok(Delivery::Depth(_)) => {}
            Ok(Delivery::Skipped) => trace!("Control frame skipped"),
            Ok(Delivery::Unrouted(topic)) => warn!(topic = %topic, "No handler for topic, dropping frame"),
            Err(FeedError::Decode(reason)) => {
                self.metrics.decode_errors.inc();
                warn!(error = %reason, len = frame.len(), "Failed to decode frame");
            }
            Err(e @ FeedError::MalformedDelta(_)) => warn!(error = %e, "Rejected depth update"),
            Err(e) => error!(error = %e, "Dispatch failed"),
        }
    }

    /// Latest book for `symbol`
    pub fn book_snapshot(&self, symbol: &str) -> Option<BookSnapshot> {
        self.books
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_snapshot(symbol)
    }
}
