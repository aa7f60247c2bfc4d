//! Shared helpers for integration tests: an in-memory connector whose links
//! are driven from the test body.

#![allow(dead_code)]

use futures_util::future::BoxFuture;
use futures_util::Sink;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;

use market_stream::websocket::{Connector, Link};
use market_stream::{Config, FeedError, Result};

pub const WAIT: Duration = Duration::from_secs(5);

/// Ordered record of dials, writes and handler calls across all links
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Entries after the `n`th (1-based) dial, up to the next one
    pub fn after_dial(&self, n: usize) -> Vec<String> {
        self.entries()
            .split(|entry| entry == "dial")
            .nth(n)
            .map(|chunk| chunk.to_vec())
            .unwrap_or_default()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| *e == entry).count()
    }
}

/// Remote end of one in-memory link
pub struct ServerSide {
    /// Frames written by the client
    pub received: mpsc::UnboundedReceiver<Message>,
    /// Frames (or read errors) delivered to the client
    pub outbound: mpsc::UnboundedSender<std::result::Result<Message, WsError>>,
}

impl ServerSide {
    /// Next text frame written by the client, skipping control frames
    pub async fn next_text(&mut self) -> String {
        loop {
            let message = timeout(WAIT, self.received.recv())
                .await
                .expect("timed out waiting for client frame")
                .expect("client side closed");
            if let Message::Text(text) = message {
                return text;
            }
        }
    }

    pub fn push(&self, text: impl Into<String>) {
        let _ = self.outbound.send(Ok(Message::Text(text.into())));
    }
}

/// Records writes; once `budget` writes are spent it stops accepting more,
/// like a socket whose peer no longer reads
struct JournalSink {
    tx: mpsc::UnboundedSender<Message>,
    journal: Journal,
    budget: usize,
}

impl Sink<Message> for JournalSink {
    type Error = WsError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), WsError>> {
        if self.budget == 0 {
            Poll::Pending
        } else {
            Poll::Ready(Ok(()))
        }
    }

    fn start_send(mut self: Pin<&mut Self>, item: Message) -> std::result::Result<(), WsError> {
        self.budget = self.budget.saturating_sub(1);
        let text = match &item {
            Message::Text(text) => Some(text.clone()),
            _ => None,
        };
        self.tx.send(item).map_err(|_| WsError::ConnectionClosed)?;
        if let Some(text) = text {
            self.journal.push(format!("sent:{}", text));
        }
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), WsError>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), WsError>> {
        Poll::Ready(Ok(()))
    }
}

/// Connector handing out in-memory links
pub struct MockConnector {
    fail_remaining: Arc<AtomicUsize>,
    write_budget: Arc<AtomicUsize>,
    dials: Arc<AtomicUsize>,
    journal: Journal,
    greeting: Option<String>,
    servers: mpsc::UnboundedSender<ServerSide>,
}

/// Test-side view of a [`MockConnector`]
pub struct MockHandle {
    pub servers: mpsc::UnboundedReceiver<ServerSide>,
    pub fail_remaining: Arc<AtomicUsize>,
    /// Writes each new link accepts before stalling
    pub write_budget: Arc<AtomicUsize>,
    pub dials: Arc<AtomicUsize>,
    pub journal: Journal,
}

impl MockHandle {
    /// Wait for the client to dial the next link
    pub async fn next_server(&mut self) -> ServerSide {
        timeout(WAIT, self.servers.recv())
            .await
            .expect("timed out waiting for a dial")
            .expect("connector dropped")
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    /// Links dialed from now on stall after `writes` writes
    pub fn stall_writes_after(&self, writes: usize) {
        self.write_budget.store(writes, Ordering::SeqCst);
    }

    /// Links dialed from now on accept every write
    pub fn unstall_writes(&self) {
        self.write_budget.store(usize::MAX, Ordering::SeqCst);
    }
}

pub fn mock_connector() -> (MockConnector, MockHandle) {
    let (servers_tx, servers_rx) = mpsc::unbounded_channel();
    let fail_remaining = Arc::new(AtomicUsize::new(0));
    let write_budget = Arc::new(AtomicUsize::new(usize::MAX));
    let dials = Arc::new(AtomicUsize::new(0));
    let journal = Journal::default();

    let connector = MockConnector {
        fail_remaining: fail_remaining.clone(),
        write_budget: write_budget.clone(),
        dials: dials.clone(),
        journal: journal.clone(),
        greeting: None,
        servers: servers_tx,
    };
    let handle = MockHandle {
        servers: servers_rx,
        fail_remaining,
        write_budget,
        dials,
        journal,
    };
    (connector, handle)
}

impl MockConnector {
    /// Queue `frame` on every new link before the client sees it
    pub fn with_greeting(mut self, frame: impl Into<String>) -> Self {
        self.greeting = Some(frame.into());
        self
    }
}

impl Connector for MockConnector {
    fn connect<'a>(&'a self, url: &'a str, _connect_timeout: Duration) -> BoxFuture<'a, Result<Link>> {
        Box::pin(async move {
            self.dials.fetch_add(1, Ordering::SeqCst);
            self.journal.push("dial");

            if self
                .fail_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(FeedError::Connect("connection refused".to_string()));
            }

            let (to_server, received) = mpsc::unbounded_channel();
            let (outbound, from_server) = mpsc::unbounded_channel();
            if let Some(greeting) = &self.greeting {
                let _ = outbound.send(Ok(Message::Text(greeting.clone())));
            }

            let sink = JournalSink {
                tx: to_server,
                journal: self.journal.clone(),
                budget: self.write_budget.load(Ordering::SeqCst),
            };
            let stream = futures_util::stream::unfold(from_server, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            });

            let _ = self.servers.send(ServerSide { received, outbound });
            Ok(Link::from_parts(url, Box::pin(sink), Box::pin(stream)))
        })
    }
}

/// Config with quiet heartbeats and fast redials
pub fn test_config() -> Config {
    Config {
        symbols: vec!["BTCUSDT".to_string()],
        ws_endpoint: "mem://feed".to_string(),
        heartbeat_interval_ms: 60_000,
        staleness_grace_ms: 60_000,
        reconnect_delay_ms: 10,
        connect_timeout_ms: 1_000,
        ..Config::default()
    }
}

pub fn trade_frame(id: u64) -> String {
    format!(
        r#"{{"stream":"btcusdt@trade","data":{{"e":"trade","E":1,"s":"BTCUSDT","t":{},"p":"100.5","q":"0.2","T":1700000000000,"m":true}}}}"#,
        id
    )
}

pub fn text(s: &str) -> Message {
    Message::Text(s.to_string())
}

/// Poll `check` until it holds or the wait expires
pub async fn eventually<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
