//! Reconnection controller
//!
//! The only component allowed to replace the installed link. Drains liveness
//! events, counts consecutive failures and drives the redial, replay and
//! install cycle with a fixed backoff.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, error, info, warn};

use super::heartbeat::{HeartbeatSupervisor, LivenessEvent, LivenessSender};
use super::link::{ActiveLink, Connector, CurrentLink, Frame, Link};
use super::registry::SubscriptionRegistry;
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::error::{FeedError, Result};
use crate::metrics::FeedMetrics;

const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Diagnostic hook: `None` after a good probe, the failure otherwise
pub type LivenessCallback = Arc<dyn Fn(Option<&FeedError>) + Send + Sync>;

/// Builds the frame sent first on every new link, e.g. a login request
pub type ConnectHook = Arc<dyn Fn() -> Message + Send + Sync>;

/// Observable connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Initial dial in progress
    Connecting,
    Connected,
    /// Installed link has failed probes, still below the reconnect threshold
    Degraded,
    Reconnecting,
    /// Terminal
    Closed,
}

impl ConnectionState {
    /// A link is installed and serving traffic
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Degraded)
    }
}

/// Consecutive liveness failure counter
#[derive(Debug, Clone)]
pub struct FailureTracker {
    threshold: u32,
    consecutive: u32,
}

impl FailureTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            consecutive: 0,
        }
    }

    /// Count one failure; true once the count exceeds the threshold
    pub fn record_failure(&mut self) -> bool {
        self.consecutive = self.consecutive.saturating_add(1);
        self.consecutive > self.threshold
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }
}

/// State shared between the client handle and the controller task
pub(super) struct Shared {
    pub config: Config,
    pub current: CurrentLink,
    pub registry: SubscriptionRegistry,
    pub dispatcher: Arc<Dispatcher>,
    pub events: LivenessSender,
    pub state: watch::Sender<ConnectionState>,
    pub shutdown: watch::Sender<bool>,
    pub metrics: Arc<FeedMetrics>,
    pub on_liveness: Option<LivenessCallback>,
    pub on_connect: Option<ConnectHook>,
}

impl Shared {
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn notify(&self, error: Option<&FeedError>) {
        if let Some(callback) = &self.on_liveness {
            callback(error);
        }
    }

    pub fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(from = ?previous, to = ?next, "Connection state changed");
        }
    }
}

/// Owns link replacement for one client
pub(super) struct Controller {
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    events: mpsc::Receiver<LivenessEvent>,
    shutdown: watch::Receiver<bool>,
    tracker: FailureTracker,
    generation: u64,
    heartbeat: HeartbeatSupervisor,
    reader: Option<JoinHandle<()>>,
}

impl Controller {
    pub fn new(
        shared: Arc<Shared>,
        connector: Arc<dyn Connector>,
        events: mpsc::Receiver<LivenessEvent>,
        heartbeat: HeartbeatSupervisor,
    ) -> Self {
        let shutdown = shared.shutdown.subscribe();
        let tracker = FailureTracker::new(shared.config.max_liveness_failures);
        Self {
            shared,
            connector,
            events,
            shutdown,
            tracker,
            generation: 0,
            heartbeat,
            reader: None,
        }
    }

    /// Install the first link and start the heartbeat
    pub async fn start(&mut self, link: Link) -> Result<()> {
        self.install(link).await?;
        self.heartbeat
            .start(self.shared.current.clone(), self.shared.events.clone())
    }

    /// Send the login frame, replay every recorded subscription on `link`,
    /// then make it current.
    ///
    /// The slot stays write-locked for the whole replay so no application
    /// call can use the link before it is ready, and no subscription can be
    /// recorded without being either replayed or sent. Every write is bounded
    /// by the link's write timeout.
    async fn install(&mut self, link: Link) -> Result<()> {
        let link = Arc::new(link.with_write_timeout(self.shared.config.write_timeout()));
        self.shared.current.stage(link.clone());
        let mut slot = self.shared.current.lock().await;

        if self.shared.is_shutting_down() {
            drop(slot);
            link.close().await;
            return Err(FeedError::Closed);
        }

        if let Some(login) = &self.shared.on_connect {
            if let Err(e) = link.send(login()).await {
                drop(slot);
                warn!(url = %link.url(), error = %e, "Login frame failed");
                link.close().await;
                return Err(FeedError::Login(e.to_string()));
            }
            debug!(url = %link.url(), "Login frame sent");
        }

        let replayed = match self.shared.registry.replay(&link).await {
            Ok(count) => count,
            Err(e) => {
                drop(slot);
                link.close().await;
                return Err(e);
            }
        };

        self.generation += 1;
        let generation = self.generation;
        *slot = Some(ActiveLink {
            generation,
            link: link.clone(),
        });
        self.reader = Some(spawn_reader(
            link.clone(),
            generation,
            self.shared.dispatcher.clone(),
            self.shared.events.clone(),
        ));
        drop(slot);

        self.tracker.record_success();
        self.shared.metrics.replayed_subscriptions.inc_by(replayed as u64);
        self.shared.metrics.connected.set(1);
        self.shared.set_state(ConnectionState::Connected);
        info!(generation, url = %link.url(), replayed, "Link installed");
        Ok(())
    }

    /// Process liveness events until closed
    pub async fn run(mut self) {
        loop {
            if self.shared.is_shutting_down() {
                break;
            }

            let event = tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                event = self.events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            if event.generation() != self.generation {
                debug!(event = ?event, current = self.generation, "Ignoring event from replaced link");
                continue;
            }

            if !self.handle(event).await {
                break;
            }
        }

        self.shut_down().await;
    }

    /// Returns false when the controller must stop
    async fn handle(&mut self, event: LivenessEvent) -> bool {
        match event {
            LivenessEvent::ProbeOk { .. } => {
                self.tracker.record_success();
                self.shared.notify(None);
                if *self.shared.state.borrow() == ConnectionState::Degraded {
                    self.shared.set_state(ConnectionState::Connected);
                }
                true
            }
            LivenessEvent::SendFailed { error, .. } => {
                self.shared.metrics.liveness_failures.inc();
                self.shared.notify(Some(&error));
                if self.tracker.record_failure() {
                    warn!(
                        consecutive = self.tracker.consecutive(),
                        threshold = self.tracker.threshold(),
                        "Liveness failure threshold exceeded"
                    );
                    self.reconnect(&error).await
                } else {
                    debug!(consecutive = self.tracker.consecutive(), error = %error, "Liveness failure");
                    self.shared.set_state(ConnectionState::Degraded);
                    true
                }
            }
            LivenessEvent::Stale { idle, .. } => {
                let error = FeedError::Stale {
                    idle_ms: idle.as_millis() as u64,
                };
                self.shared.metrics.liveness_failures.inc();
                self.shared.notify(Some(&error));
                self.reconnect(&error).await
            }
            LivenessEvent::ReceiveFailed { error, .. } => {
                self.shared.metrics.liveness_failures.inc();
                self.shared.notify(Some(&error));
                self.reconnect(&error).await
            }
        }
    }

    /// Drop the current link and redial until a new one is installed.
    ///
    /// Returns false if the client was closed or the attempt cap was hit.
    async fn reconnect(&mut self, cause: &FeedError) -> bool {
        warn!(generation = self.generation, cause = %cause, "Replacing link");
        self.shared.set_state(ConnectionState::Reconnecting);
        self.shared.metrics.reconnects.inc();
        self.shared.metrics.connected.set(0);
        self.tracker.record_success();

        // cuts any write still pending on the old link before taking the slot
        self.shared.current.close_latest().await;
        if let Some(old) = self.shared.current.take().await {
            old.link.close().await;
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }

        let delay = self.shared.config.reconnect_delay();
        let mut attempts: u32 = 0;

        loop {
            if self.shared.is_shutting_down() {
                return false;
            }
            attempts = attempts.saturating_add(1);
            info!(attempt = attempts, url = %self.shared.config.ws_endpoint, "Redialing");

            let dial = self
                .connector
                .connect(&self.shared.config.ws_endpoint, self.shared.config.connect_timeout());
            let outcome = tokio::select! {
                _ = self.shutdown.changed() => return false,
                outcome = dial => outcome,
            };

            match outcome {
                Ok(link) => match self.install(link).await {
                    Ok(()) => {
                        info!(attempts, "Reconnected");
                        return true;
                    }
                    Err(FeedError::Closed) => return false,
                    Err(e) => {
                        warn!(attempt = attempts, error = %e, "Setup failed on new link");
                        self.shared.notify(Some(&e));
                    }
                },
                Err(e) => {
                    warn!(attempt = attempts, error = %e, "Dial failed");
                    self.shared.notify(Some(&e));
                }
            }

            if let Some(max) = self.shared.config.max_reconnect_attempts {
                if attempts >= max {
                    let err = FeedError::ReconnectCapReached { attempts };
                    error!(attempts, "Giving up on reconnecting");
                    self.shared.notify(Some(&err));
                    return false;
                }
            }

            debug!(delay_ms = delay.as_millis() as u64, "Waiting before next dial");
            tokio::select! {
                _ = self.shutdown.changed() => return false,
                _ = sleep(delay) => {}
            }
        }
    }

    async fn shut_down(&mut self) {
        self.shared.shutdown.send_replace(true);
        // wakes a reader blocked on a full queue
        self.events.close();
        self.shared.current.close_latest().await;
        self.heartbeat.stop().await;

        if let Some(active) = self.shared.current.take().await {
            active.link.close().await;
        }
        if let Some(mut reader) = self.reader.take() {
            if timeout(READER_JOIN_TIMEOUT, &mut reader).await.is_err() {
                warn!("Receive loop did not stop in time, aborting");
                reader.abort();
            }
        }

        self.shared.metrics.connected.set(0);
        self.shared.set_state(ConnectionState::Closed);
        info!(generation = self.generation, "Controller stopped");
    }
}

fn spawn_reader(
    link: Arc<Link>,
    generation: u64,
    dispatcher: Arc<Dispatcher>,
    events: LivenessSender,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        link.receive_loop(
            |frame: Frame| {
                dispatcher.dispatch_logged(&frame);
                std::future::ready(())
            },
            move |error| async move {
                events
                    .report_hard(LivenessEvent::ReceiveFailed { generation, error })
                    .await;
            },
        )
        .await;
        debug!(generation, "Receive loop finished");
    })
}
