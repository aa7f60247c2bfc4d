//! Feed metrics
//!
//! Counters live on an explicit prometheus `Registry` owned by the caller.

use prometheus::{IntCounter, IntGauge, Registry};

use crate::error::Result;

/// Link and dispatch counters
#[derive(Debug, Clone)]
pub struct FeedMetrics {
    pub frames_received: IntCounter,
    pub decode_errors: IntCounter,
    pub liveness_failures: IntCounter,
    pub dropped_events: IntCounter,
    pub reconnects: IntCounter,
    pub replayed_subscriptions: IntCounter,
    pub connected: IntGauge,
}

impl FeedMetrics {
    /// Create unregistered metrics
    pub fn new() -> Result<Self> {
        Ok(Self {
            frames_received: IntCounter::new("feed_frames_received_total", "Data frames read from the link")?,
            decode_errors: IntCounter::new("feed_decode_errors_total", "Frames dropped because they failed to decode")?,
            liveness_failures: IntCounter::new(
                "feed_liveness_failures_total",
                "Failed probes, stale links and receive errors",
            )?,
            dropped_events: IntCounter::new(
                "feed_dropped_liveness_events_total",
                "Liveness events dropped because the queue stayed full",
            )?,
            reconnects: IntCounter::new("feed_reconnects_total", "Reconnection cycles started")?,
            replayed_subscriptions: IntCounter::new(
                "feed_replayed_subscriptions_total",
                "Subscribe payloads resent after reconnecting",
            )?,
            connected: IntGauge::new("feed_connected", "1 while a link is installed")?,
        })
    }

    /// Create metrics and register them on `registry`
    pub fn registered(registry: &Registry) -> Result<Self> {
        let metrics = Self::new()?;
        registry.register(Box::new(metrics.frames_received.clone()))?;
        registry.register(Box::new(metrics.decode_errors.clone()))?;
        registry.register(Box::new(metrics.liveness_failures.clone()))?;
        registry.register(Box::new(metrics.dropped_events.clone()))?;
        registry.register(Box::new(metrics.reconnects.clone()))?;
        registry.register(Box::new(metrics.replayed_subscriptions.clone()))?;
        registry.register(Box::new(metrics.connected.clone()))?;
        Ok(metrics)
    }
}
