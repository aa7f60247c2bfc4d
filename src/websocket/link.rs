//! A single physical WebSocket connection
//!
//! Handles dialing, frame send/receive and liveness stamping. A link never
//! reconnects itself; the controller replaces it when it fails.

use futures_util::future::BoxFuture;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, RwLock, RwLockWriteGuard};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::{debug, error, info, warn};

use crate::error::{FeedError, Result};

/// Write half of a link
pub type FrameSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;
/// Read half of a link
pub type FrameStream = Pin<Box<dyn Stream<Item = std::result::Result<Message, WsError>> + Send>>;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// An inbound data frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    /// Frame contents as UTF-8 text
    pub fn as_text(&self) -> Result<&str> {
        match self {
            Frame::Text(text) => Ok(text),
            Frame::Binary(data) => {
                std::str::from_utf8(data).map_err(|e| FeedError::Decode(format!("binary frame is not UTF-8: {}", e)))
            }
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Frame::Text(text) => text.as_bytes(),
            Frame::Binary(data) => data,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One physical duplex connection
pub struct Link {
    url: String,
    writer: Mutex<FrameSink>,
    reader: Mutex<Option<FrameStream>>,
    write_timeout: Duration,
    opened_at: Instant,
    /// Milliseconds after `opened_at` of the last inbound frame
    last_activity_ms: AtomicU64,
    closed: watch::Sender<bool>,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("url", &self.url)
            .field("closed", &self.is_closed())
            .field("idle_for", &self.idle_for())
            .finish()
    }
}

impl Link {
    /// Open a fresh WebSocket connection
    pub async fn dial(url: &str, connect_timeout: Duration) -> Result<Self> {
        info!(url = %url, "Connecting to WebSocket");

        let (ws_stream, response) = timeout(connect_timeout, connect_async(url))
            .await
            .map_err(|_| FeedError::ConnectTimeout)?
            .map_err(|e| FeedError::Connect(format!("Failed to connect to {}: {}", url, e)))?;

        info!(status = ?response.status(), "WebSocket connected");

        let (sink, stream) = ws_stream.split();
        Ok(Self::from_parts(url, Box::pin(sink), Box::pin(stream)))
    }

    /// Build a link over an already established transport
    pub fn from_parts(url: impl Into<String>, sink: FrameSink, stream: FrameStream) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            url: url.into(),
            writer: Mutex::new(sink),
            reader: Mutex::new(Some(stream)),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            opened_at: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            closed,
        }
    }

    /// Bound every write, including the wait for the writer
    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Write one frame. Writes are serialized; no retry.
    ///
    /// Fails once the write timeout elapses, and as soon as the link is
    /// closed while the write is still pending.
    pub async fn send(&self, message: Message) -> Result<()> {
        if self.is_closed() {
            return Err(FeedError::Send("link is closed".to_string()));
        }

        let mut closed = self.closed.subscribe();
        let write = async {
            let mut writer = self.writer.lock().await;
            writer.send(message).await.map_err(|e| FeedError::Send(e.to_string()))
        };

        tokio::select! {
            _ = closed.wait_for(|is_closed| *is_closed) => Err(FeedError::Send("link closed during write".to_string())),
            outcome = timeout(self.write_timeout, write) => match outcome {
                Ok(result) => result,
                Err(_) => {
                    warn!(url = %self.url, timeout_ms = self.write_timeout.as_millis() as u64, "Write timed out");
                    Err(FeedError::Send(format!(
                        "write timed out after {}ms",
                        self.write_timeout.as_millis()
                    )))
                }
            },
        }
    }

    /// Read frames until the link fails or is closed.
    ///
    /// `on_frame` sees every text/binary frame in wire order. `on_error` is
    /// invoked at most once, on a read failure; a local `close()` ends the
    /// loop silently.
    pub async fn receive_loop<F, Fut, E, EFut>(&self, mut on_frame: F, on_error: E)
    where
        F: FnMut(Frame) -> Fut,
        Fut: Future<Output = ()>,
        E: FnOnce(FeedError) -> EFut,
        EFut: Future<Output = ()>,
    {
        let mut closed = self.closed.subscribe();
        let taken = self.reader.lock().await.take();
        let mut stream = match taken {
            Some(stream) => stream,
            None => {
                on_error(FeedError::Receive("receive loop already started".to_string())).await;
                return;
            }
        };

        loop {
            if self.is_closed() {
                debug!(url = %self.url, "Link closed, exiting receive loop");
                return;
            }

            let next = tokio::select! {
                _ = closed.changed() => continue,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(Message::Text(text))) => {
                    self.touch();
                    if self.is_closed() {
                        return;
                    }
                    on_frame(Frame::Text(text)).await;
                }
                Some(Ok(Message::Binary(data))) => {
                    self.touch();
                    if self.is_closed() {
                        return;
                    }
                    on_frame(Frame::Binary(data)).await;
                }
                Some(Ok(Message::Ping(data))) => {
                    self.touch();
                    debug!("Received ping, sending pong");
                    if let Err(e) = self.send(Message::Pong(data)).await {
                        warn!(error = %e, "Failed to answer ping");
                    }
                }
                Some(Ok(Message::Pong(_))) => {
                    self.touch();
                    debug!("Received pong");
                }
                Some(Ok(Message::Close(frame))) => {
                    if self.is_closed() {
                        return;
                    }
                    warn!(frame = ?frame, "Received close frame");
                    on_error(FeedError::Receive("Connection closed by remote".to_string())).await;
                    return;
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Err(e)) => {
                    if self.is_closed() {
                        return;
                    }
                    error!(error = %e, "WebSocket error");
                    on_error(FeedError::Receive(e.to_string())).await;
                    return;
                }
                None => {
                    if self.is_closed() {
                        return;
                    }
                    warn!("WebSocket stream ended");
                    on_error(FeedError::Receive("Stream ended".to_string())).await;
                    return;
                }
            }
        }
    }

    /// Close the connection. Idempotent; wakes a blocked receive loop.
    pub async fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        debug!(url = %self.url, "Closing link");

        match timeout(CLOSE_TIMEOUT, self.writer.lock()).await {
            Ok(mut writer) => {
                if let Ok(Err(e)) = timeout(CLOSE_TIMEOUT, writer.close()).await {
                    debug!(error = %e, "Error while closing WebSocket");
                }
            }
            Err(_) => warn!(url = %self.url, "Writer busy, dropping link without close handshake"),
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Record inbound activity
    pub fn touch(&self) {
        let elapsed = self.opened_at.elapsed().as_millis() as u64;
        self.last_activity_ms.store(elapsed, Ordering::Relaxed);
    }

    /// Time since the last inbound frame (or since the link opened)
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.opened_at.elapsed().saturating_sub(last)
    }
}

/// Dials links; the seam used to swap the transport
pub trait Connector: Send + Sync {
    fn connect<'a>(&'a self, url: &'a str, connect_timeout: Duration) -> BoxFuture<'a, Result<Link>>;
}

/// Connector over tokio-tungstenite
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl Connector for WebSocketConnector {
    fn connect<'a>(&'a self, url: &'a str, connect_timeout: Duration) -> BoxFuture<'a, Result<Link>> {
        Box::pin(Link::dial(url, connect_timeout))
    }
}

/// The link currently installed by the controller, tagged with its generation
#[derive(Debug, Clone)]
pub struct ActiveLink {
    pub generation: u64,
    pub link: Arc<Link>,
}

/// Shared slot holding the installed link
#[derive(Debug, Clone, Default)]
pub struct CurrentLink {
    slot: Arc<RwLock<Option<ActiveLink>>>,
    /// Newest link handed to the controller, installed or still replaying.
    /// Reachable without the slot lock so a close can cut a pending write.
    latest: Arc<StdMutex<Option<Arc<Link>>>>,
}

impl CurrentLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self) -> Option<ActiveLink> {
        self.slot.read().await.clone()
    }

    /// Exclusive access, held across replay-and-install and subscribe-and-send
    pub async fn lock(&self) -> RwLockWriteGuard<'_, Option<ActiveLink>> {
        self.slot.write().await
    }

    pub async fn take(&self) -> Option<ActiveLink> {
        self.slot.write().await.take()
    }

    /// Record `link` as the newest one before it is set up
    pub fn stage(&self, link: Arc<Link>) {
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(link);
    }

    /// Close the newest link without waiting for the slot
    pub async fn close_latest(&self) {
        let latest = self.latest.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(link) = latest {
            link.close().await;
        }
    }
}
