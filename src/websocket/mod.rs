//! WebSocket connection management
//!
//! Link, heartbeat supervision, reconnection with subscription replay, and
//! the client handle tying them together.

mod client;
mod controller;
mod heartbeat;
mod link;
mod registry;

pub use client::{FeedClient, FeedClientBuilder};
pub use controller::{ConnectHook, ConnectionState, FailureTracker, LivenessCallback};
pub use heartbeat::{
    liveness_queue, HeartbeatProbe, HeartbeatState, HeartbeatSupervisor, LivenessEvent, LivenessSender,
};
pub use link::{ActiveLink, Connector, CurrentLink, Frame, FrameSink, FrameStream, Link, WebSocketConnector};
pub use registry::SubscriptionRegistry;
