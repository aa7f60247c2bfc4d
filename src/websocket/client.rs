//! Feed client
//!
//! Public handle over the link, heartbeat and controller tasks. Cloning is
//! cheap; every clone drives the same connection.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use super::controller::{ConnectHook, ConnectionState, Controller, LivenessCallback, Shared};
use super::heartbeat::{liveness_queue, HeartbeatProbe, HeartbeatSupervisor, LivenessEvent};
use super::link::{Connector, CurrentLink, WebSocketConnector};
use super::registry::SubscriptionRegistry;
use crate::config::Config;
use crate::decoder::{Decoder, TradeBatch};
use crate::dispatch::{Dispatcher, Handler};
use crate::error::{FeedError, Result};
use crate::metrics::FeedMetrics;
use crate::orderbook::BookSnapshot;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Configures and connects a [`FeedClient`]
pub struct FeedClientBuilder {
    config: Config,
    decoder: Arc<dyn Decoder>,
    connector: Arc<dyn Connector>,
    probe: HeartbeatProbe,
    on_liveness: Option<LivenessCallback>,
    on_connect: Option<ConnectHook>,
    metrics: Option<Arc<FeedMetrics>>,
}

impl FeedClientBuilder {
    pub fn new<D>(config: Config, decoder: D) -> Self
    where
        D: Decoder + 'static,
    {
        Self {
            config,
            decoder: Arc::new(decoder),
            connector: Arc::new(WebSocketConnector),
            probe: HeartbeatProbe::default(),
            on_liveness: None,
            on_connect: None,
            metrics: None,
        }
    }

    /// Replace the transport
    pub fn connector<C>(mut self, connector: C) -> Self
    where
        C: Connector + 'static,
    {
        self.connector = Arc::new(connector);
        self
    }

    pub fn heartbeat(mut self, probe: HeartbeatProbe) -> Self {
        self.probe = probe;
        self
    }

    /// Called with `None` after every good probe and with the error on every failure
    pub fn on_liveness<F>(mut self, callback: F) -> Self
    where
        F: Fn(Option<&FeedError>) + Send + Sync + 'static,
    {
        self.on_liveness = Some(Arc::new(callback));
        self
    }

    /// Frame written first on every link, before subscriptions are replayed.
    ///
    /// Built fresh for each link so signed or timestamped logins stay valid.
    /// A failed write is handled like a failed replay.
    pub fn on_connect<F>(mut self, build: F) -> Self
    where
        F: Fn() -> Message + Send + Sync + 'static,
    {
        self.on_connect = Some(Arc::new(build));
        self
    }

    /// Use metrics already registered by the caller
    pub fn metrics(mut self, metrics: Arc<FeedMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Dial, install the first link and start supervision.
    ///
    /// A failed first dial is returned as is; retrying it is up to the caller.
    pub async fn connect(self) -> Result<FeedClient> {
        self.config.validate()?;

        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => Arc::new(FeedMetrics::new()?),
        };
        let (events, events_rx) = liveness_queue(
            self.config.event_queue_capacity,
            self.config.event_send_timeout(),
            metrics.clone(),
        );
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let (shutdown, _) = watch::channel(false);
        let heartbeat = HeartbeatSupervisor::new(
            self.probe,
            self.config.heartbeat_interval(),
            self.config.staleness_threshold(),
        );
        let dispatcher = Arc::new(Dispatcher::new(
            self.decoder,
            self.config.snapshot_depth(),
            metrics.clone(),
        ));

        let shared = Arc::new(Shared {
            config: self.config,
            current: CurrentLink::new(),
            registry: SubscriptionRegistry::new(),
            dispatcher,
            events,
            state,
            shutdown,
            metrics,
            on_liveness: self.on_liveness,
            on_connect: self.on_connect,
        });

        let link = self
            .connector
            .connect(&shared.config.ws_endpoint, shared.config.connect_timeout())
            .await?;

        let mut controller = Controller::new(shared.clone(), self.connector, events_rx, heartbeat);
        if let Err(e) = controller.start(link).await {
            shared.current.close_latest().await;
            if let Some(active) = shared.current.take().await {
                active.link.close().await;
            }
            return Err(e);
        }
        let handle = tokio::spawn(controller.run());

        info!(url = %shared.config.ws_endpoint, "Feed client connected");
        Ok(FeedClient {
            inner: Arc::new(ClientInner {
                shared,
                controller: Mutex::new(Some(handle)),
            }),
        })
    }
}

struct ClientInner {
    shared: Arc<Shared>,
    controller: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        // last handle gone: let the controller wind down
        self.shared.shutdown.send_replace(true);
    }
}

/// Handle to a supervised market data connection
#[derive(Clone)]
pub struct FeedClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for FeedClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedClient")
            .field("url", &self.inner.shared.config.ws_endpoint)
            .field("state", &self.state())
            .finish()
    }
}

impl FeedClient {
    pub fn builder<D>(config: Config, decoder: D) -> FeedClientBuilder
    where
        D: Decoder + 'static,
    {
        FeedClientBuilder::new(config, decoder)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.shared.is_shutting_down() {
            Err(FeedError::Closed)
        } else {
            Ok(())
        }
    }

    /// Bind handlers, record `payload` for replay and send it if a link is up.
    ///
    /// A failed send is not an error here: it counts as a liveness failure
    /// and the payload goes out again with the next replay.
    pub async fn subscribe(&self, payload: Message, routes: Vec<(String, Handler)>) -> Result<()> {
        self.ensure_open()?;
        let shared = &self.inner.shared;

        let slot = shared.current.lock().await;
        self.ensure_open()?;

        for (topic, handler) in routes {
            shared.dispatcher.register(topic, handler);
        }
        let index = shared.registry.record(payload.clone()).await;

        let Some(active) = (*slot).clone() else {
            debug!(index, "No link installed, subscription queued for replay");
            return Ok(());
        };
        if let Err(error) = active.link.send(payload).await {
            drop(slot);
            warn!(index, error = %error, "Subscribe send failed, will be replayed on the next link");
            shared
                .events
                .report(LivenessEvent::SendFailed {
                    generation: active.generation,
                    error,
                })
                .await;
        } else {
            debug!(index, generation = active.generation, "Subscription sent");
        }
        Ok(())
    }

    /// Subscribe and route trades on `topic` to `handler`
    pub async fn subscribe_trades<F>(&self, topic: impl Into<String>, payload: Message, handler: F) -> Result<()>
    where
        F: Fn(&TradeBatch) + Send + Sync + 'static,
    {
        self.subscribe(payload, vec![(topic.into(), Handler::trades(handler))])
            .await
    }

    /// Subscribe and route book snapshots for `topic` to `handler`
    pub async fn subscribe_depth<F>(&self, topic: impl Into<String>, payload: Message, handler: F) -> Result<()>
    where
        F: Fn(&BookSnapshot) + Send + Sync + 'static,
    {
        self.subscribe(payload, vec![(topic.into(), Handler::depth(handler))])
            .await
    }

    /// Write one application frame on the current link
    pub async fn send(&self, message: Message) -> Result<()> {
        self.ensure_open()?;
        let shared = &self.inner.shared;
        let active = shared
            .current
            .get()
            .await
            .ok_or_else(|| FeedError::Send("no link installed".to_string()))?;

        if let Err(error) = active.link.send(message).await {
            shared
                .events
                .report(LivenessEvent::SendFailed {
                    generation: active.generation,
                    error: error.clone(),
                })
                .await;
            return Err(error);
        }
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.shared.state.borrow()
    }

    /// Receiver that observes every state transition
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.shared.state.subscribe()
    }

    /// Latest book for `symbol`, if any depth update arrived for it
    pub fn book_snapshot(&self, symbol: &str) -> Option<BookSnapshot> {
        self.inner.shared.dispatcher.book_snapshot(symbol)
    }

    pub async fn subscription_count(&self) -> usize {
        self.inner.shared.registry.len().await
    }

    pub fn metrics(&self) -> Arc<FeedMetrics> {
        self.inner.shared.metrics.clone()
    }

    /// Stop supervision and release the link. Idempotent.
    ///
    /// Once this returns no handler is invoked again and every other
    /// operation fails with [`FeedError::Closed`].
    pub async fn close(&self) {
        let shared = &self.inner.shared;
        if !shared.shutdown.send_replace(true) {
            info!("Closing feed client");
        }

        // a subscribe or replay may hold the slot on a stuck write
        shared.current.close_latest().await;
        match timeout(CLOSE_TIMEOUT, shared.current.take()).await {
            Ok(Some(active)) => active.link.close().await,
            Ok(None) => {}
            Err(_) => warn!("Link slot still busy, leaving it to the controller"),
        }

        let handle = self.inner.controller.lock().await.take();
        if let Some(mut handle) = handle {
            if timeout(CLOSE_TIMEOUT, &mut handle).await.is_err() {
                warn!("Controller did not stop in time, aborting");
                handle.abort();
            }
        }

        shared.set_state(ConnectionState::Closed);
    }
}
