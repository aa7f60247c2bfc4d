//! Heartbeat supervision
//!
//! Sends a probe on a fixed interval and checks the installed link for
//! silence. Outcomes are reported as [`LivenessEvent`]s on a bounded queue
//! drained by the reconnection controller.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use super::link::CurrentLink;
use crate::error::{FeedError, Result};
use crate::metrics::FeedMetrics;

const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// What to send as a liveness probe
#[derive(Clone)]
pub enum HeartbeatProbe {
    /// WebSocket control ping
    Ping,
    /// Fixed text payload, e.g. `"ping"`
    Text(String),
    /// Payload built fresh on every tick
    Custom(Arc<dyn Fn() -> Message + Send + Sync>),
}

impl HeartbeatProbe {
    pub fn custom<F>(build: F) -> Self
    where
        F: Fn() -> Message + Send + Sync + 'static,
    {
        HeartbeatProbe::Custom(Arc::new(build))
    }

    pub fn message(&self) -> Message {
        match self {
            HeartbeatProbe::Ping => Message::Ping(Vec::new()),
            HeartbeatProbe::Text(text) => Message::Text(text.clone()),
            HeartbeatProbe::Custom(build) => build(),
        }
    }
}

impl Default for HeartbeatProbe {
    fn default() -> Self {
        HeartbeatProbe::Ping
    }
}

impl fmt::Debug for HeartbeatProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeartbeatProbe::Ping => write!(f, "Ping"),
            HeartbeatProbe::Text(text) => f.debug_tuple("Text").field(text).finish(),
            HeartbeatProbe::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Link health signal for one link generation
#[derive(Debug, Clone, PartialEq)]
pub enum LivenessEvent {
    /// Probe written successfully
    ProbeOk { generation: u64 },
    /// A probe or application write failed
    SendFailed { generation: u64, error: FeedError },
    /// No inbound activity within the staleness threshold
    Stale { generation: u64, idle: Duration },
    /// The receive loop terminated with an error
    ReceiveFailed { generation: u64, error: FeedError },
}

impl LivenessEvent {
    pub fn generation(&self) -> u64 {
        match self {
            LivenessEvent::ProbeOk { generation }
            | LivenessEvent::SendFailed { generation, .. }
            | LivenessEvent::Stale { generation, .. }
            | LivenessEvent::ReceiveFailed { generation, .. } => *generation,
        }
    }
}

/// Producer side of the liveness queue.
///
/// The queue is bounded. Soft signals block for at most `send_timeout`
/// waiting for space and are dropped after that; receive failures wait
/// until the controller takes them.
#[derive(Debug, Clone)]
pub struct LivenessSender {
    tx: mpsc::Sender<LivenessEvent>,
    send_timeout: Duration,
    metrics: Arc<FeedMetrics>,
}

/// Create the liveness queue
pub fn liveness_queue(
    capacity: usize,
    send_timeout: Duration,
    metrics: Arc<FeedMetrics>,
) -> (LivenessSender, mpsc::Receiver<LivenessEvent>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        LivenessSender {
            tx,
            send_timeout,
            metrics,
        },
        rx,
    )
}

impl LivenessSender {
    /// Queue a soft signal; returns false if it was dropped
    pub async fn report(&self, event: LivenessEvent) -> bool {
        match self.tx.send_timeout(event, self.send_timeout).await {
            Ok(()) => true,
            Err(mpsc::error::SendTimeoutError::Timeout(event)) => {
                warn!(event = ?event, "Liveness queue full, dropping event");
                self.metrics.dropped_events.inc();
                false
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => false,
        }
    }

    /// Queue a hard failure, waiting as long as it takes
    pub async fn report_hard(&self, event: LivenessEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }
}

/// Supervisor lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatState {
    Idle,
    Running,
    Stopped,
}

/// Periodic probe and staleness checker
#[derive(Debug)]
pub struct HeartbeatSupervisor {
    probe: HeartbeatProbe,
    interval: Duration,
    staleness: Duration,
    state: HeartbeatState,
    stop: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl HeartbeatSupervisor {
    pub fn new(probe: HeartbeatProbe, interval: Duration, staleness: Duration) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            probe,
            interval,
            staleness,
            state: HeartbeatState::Idle,
            stop,
            handles: Vec::new(),
        }
    }

    pub fn state(&self) -> HeartbeatState {
        self.state
    }

    /// Start probing whatever link is installed in `current`.
    ///
    /// Probing and the staleness check run as separate tasks, so a probe
    /// write stuck on a peer that stopped reading never delays the check.
    pub fn start(&mut self, current: CurrentLink, events: LivenessSender) -> Result<()> {
        match self.state {
            HeartbeatState::Idle => {}
            HeartbeatState::Running => return Ok(()),
            HeartbeatState::Stopped => return Err(FeedError::Closed),
        }

        info!(
            interval_ms = self.interval.as_millis() as u64,
            staleness_ms = self.staleness.as_millis() as u64,
            "Starting heartbeat"
        );

        self.handles = vec![
            tokio::spawn(probe_loop(
                self.probe.clone(),
                self.interval,
                current.clone(),
                events.clone(),
                self.stop.subscribe(),
            )),
            tokio::spawn(staleness_loop(
                self.interval,
                self.staleness,
                current,
                events,
                self.stop.subscribe(),
            )),
        ];

        self.state = HeartbeatState::Running;
        Ok(())
    }

    /// Stop both tasks and wait for them to exit
    pub async fn stop(&mut self) {
        self.stop.send_replace(true);
        self.state = HeartbeatState::Stopped;

        for mut handle in self.handles.drain(..) {
            if timeout(STOP_TIMEOUT, &mut handle).await.is_err() {
                warn!("Heartbeat task did not stop in time, aborting");
                handle.abort();
            }
        }
        info!("Heartbeat stopped");
    }
}

fn ticker(period: Duration) -> Interval {
    let mut tick = interval_at(Instant::now() + period, period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tick
}

async fn probe_loop(
    probe: HeartbeatProbe,
    period: Duration,
    current: CurrentLink,
    events: LivenessSender,
    mut stop: watch::Receiver<bool>,
) {
    let mut tick = ticker(period);
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = tick.tick() => {}
        }

        // Nothing installed while the controller is redialing
        let Some(active) = current.get().await else { continue };
        let outcome = tokio::select! {
            _ = stop.changed() => break,
            outcome = active.link.send(probe.message()) => outcome,
        };
        match outcome {
            Ok(()) => {
                debug!(generation = active.generation, "Heartbeat sent");
                events.report(LivenessEvent::ProbeOk { generation: active.generation }).await;
            }
            Err(error) => {
                warn!(generation = active.generation, error = %error, "Heartbeat failed");
                events
                    .report(LivenessEvent::SendFailed { generation: active.generation, error })
                    .await;
            }
        }
    }
}

async fn staleness_loop(
    period: Duration,
    staleness: Duration,
    current: CurrentLink,
    events: LivenessSender,
    mut stop: watch::Receiver<bool>,
) {
    let mut tick = ticker(period);
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = tick.tick() => {}
        }

        let Some(active) = current.get().await else { continue };
        let idle = active.link.idle_for();
        if idle > staleness {
            warn!(
                generation = active.generation,
                idle_ms = idle.as_millis() as u64,
                "No inbound activity within staleness threshold"
            );
            events.report(LivenessEvent::Stale { generation: active.generation, idle }).await;
        }
    }
}
