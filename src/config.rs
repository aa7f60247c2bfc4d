//! Configuration module for the market stream client

use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{FeedError, Result};

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Trading symbols to subscribe to (e.g., ["BTCUSDT", "ETHUSDT"])
    pub symbols: Vec<String>,

    /// WebSocket endpoint
    pub ws_endpoint: String,

    /// Interval between liveness probes
    pub heartbeat_interval_ms: u64,

    /// Extra silence tolerated on top of the heartbeat interval before the link is stale
    pub staleness_grace_ms: u64,

    /// Consecutive probe failures tolerated; one more triggers a reconnect
    pub max_liveness_failures: u32,

    /// Fixed delay between redial attempts
    pub reconnect_delay_ms: u64,

    /// Give up after this many failed redials (None retries forever)
    pub max_reconnect_attempts: Option<u32>,

    /// Upper bound on a single dial (TCP + TLS + WebSocket handshake)
    pub connect_timeout_ms: u64,

    /// Upper bound on a single frame write; a peer that stops reading fails the write
    pub write_timeout_ms: u64,

    /// Capacity of the liveness event queue
    pub event_queue_capacity: usize,

    /// How long a liveness event may wait for queue space before it is dropped
    pub event_send_timeout_ms: u64,

    /// Levels per side in emitted snapshots (0 = full book)
    pub depth_levels: usize,

    /// Port for the health check server
    pub health_port: u16,
}

impl Config {
    /// Load configuration from environment variables
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from a `.env` style file without touching the process environment
    pub fn from_env_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let iter = dotenvy::from_path_iter(path)
            .map_err(|e| FeedError::Config(format!("{}: {}", path.display(), e)))?;

        let mut vars = HashMap::new();
        for item in iter {
            let (key, value) = item.map_err(|e| FeedError::Config(e.to_string()))?;
            vars.insert(key, value);
        }

        Self::from_lookup(|key| vars.get(key).cloned())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let symbols: Vec<String> = match lookup("SYMBOLS") {
            Some(raw) => raw
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect(),
            None => defaults.symbols.clone(),
        };

        let max_reconnect_attempts = match lookup("MAX_RECONNECT_ATTEMPTS") {
            Some(raw) if !raw.trim().is_empty() => Some(parse_value("MAX_RECONNECT_ATTEMPTS", &raw)?),
            _ => None,
        };

        let config = Self {
            symbols,
            ws_endpoint: lookup("WS_ENDPOINT").unwrap_or(defaults.ws_endpoint),
            heartbeat_interval_ms: parse_or(&lookup, "HEARTBEAT_INTERVAL_MS", defaults.heartbeat_interval_ms)?,
            staleness_grace_ms: parse_or(&lookup, "STALENESS_GRACE_MS", defaults.staleness_grace_ms)?,
            max_liveness_failures: parse_or(&lookup, "MAX_LIVENESS_FAILURES", defaults.max_liveness_failures)?,
            reconnect_delay_ms: parse_or(&lookup, "RECONNECT_DELAY_MS", defaults.reconnect_delay_ms)?,
            max_reconnect_attempts,
            connect_timeout_ms: parse_or(&lookup, "CONNECT_TIMEOUT_MS", defaults.connect_timeout_ms)?,
            write_timeout_ms: parse_or(&lookup, "WRITE_TIMEOUT_MS", defaults.write_timeout_ms)?,
            event_queue_capacity: parse_or(&lookup, "EVENT_QUEUE_CAPACITY", defaults.event_queue_capacity)?,
            event_send_timeout_ms: parse_or(&lookup, "EVENT_SEND_TIMEOUT_MS", defaults.event_send_timeout_ms)?,
            depth_levels: parse_or(&lookup, "DEPTH_LEVELS", defaults.depth_levels)?,
            health_port: parse_or(&lookup, "HEALTH_PORT", defaults.health_port)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the client cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_ms == 0 {
            return Err(FeedError::Config("HEARTBEAT_INTERVAL_MS must be positive".to_string()));
        }
        if self.write_timeout_ms == 0 {
            return Err(FeedError::Config("WRITE_TIMEOUT_MS must be positive".to_string()));
        }
        if self.event_queue_capacity == 0 {
            return Err(FeedError::Config("EVENT_QUEUE_CAPACITY must be positive".to_string()));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Silence after which the link is considered dead: interval plus grace
    pub fn staleness_threshold(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.saturating_add(self.staleness_grace_ms))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn event_send_timeout(&self) -> Duration {
        Duration::from_millis(self.event_send_timeout_ms)
    }

    /// Snapshot depth limit, `None` for the full book
    pub fn snapshot_depth(&self) -> Option<usize> {
        (self.depth_levels > 0).then_some(self.depth_levels)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            ws_endpoint: "wss://stream.binance.com:9443/stream".to_string(),
            heartbeat_interval_ms: 20_000,
            staleness_grace_ms: 5_000,
            max_liveness_failures: 10,
            reconnect_delay_ms: 1_000,
            max_reconnect_attempts: None,
            connect_timeout_ms: 10_000,
            write_timeout_ms: 10_000,
            event_queue_capacity: 64,
            event_send_timeout_ms: 250,
            depth_levels: 0,
            health_port: 9090,
        }
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| FeedError::Config(format!("invalid value for {}: {:?}", key, raw)))
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_env(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_env_file_overrides_defaults() {
        let file = write_env(
            "SYMBOLS=btcusdt, ethusdt\nWS_ENDPOINT=ws://127.0.0.1:9001/ws\nHEARTBEAT_INTERVAL_MS=500\nMAX_RECONNECT_ATTEMPTS=3\n",
        );

        let config = Config::from_env_file(file.path()).unwrap();
        assert_eq!(config.symbols, vec!["BTCUSDT", "ETHUSDT"]);
        assert_eq!(config.ws_endpoint, "ws://127.0.0.1:9001/ws");
        assert_eq!(config.heartbeat_interval(), Duration::from_millis(500));
        assert_eq!(config.staleness_threshold(), Duration::from_millis(5_500));
        assert_eq!(config.max_reconnect_attempts, Some(3));
        assert_eq!(config.max_liveness_failures, 10);
    }

    #[test]
    fn test_unset_cap_retries_forever() {
        let file = write_env("SYMBOLS=BTCUSDT\n");
        let config = Config::from_env_file(file.path()).unwrap();
        assert_eq!(config.max_reconnect_attempts, None);
        assert_eq!(config.snapshot_depth(), None);
    }

    #[test]
    fn test_invalid_number_is_rejected() {
        let file = write_env("RECONNECT_DELAY_MS=soon\n");
        let err = Config::from_env_file(file.path()).unwrap_err();
        assert!(matches!(err, FeedError::Config(_)));
    }

    #[test]
    fn test_zero_heartbeat_is_rejected() {
        let file = write_env("HEARTBEAT_INTERVAL_MS=0\n");
        assert!(Config::from_env_file(file.path()).is_err());
    }

    #[test]
    fn test_default_symbols_match_env_default() {
        let file = write_env("HEALTH_PORT=9191\n");
        let config = Config::from_env_file(file.path()).unwrap();
        assert_eq!(config.symbols, Config::default().symbols);
        assert_eq!(config.symbols, vec!["BTCUSDT", "ETHUSDT"]);
        assert_eq!(config.write_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_huge_staleness_saturates() {
        let config = Config {
            heartbeat_interval_ms: u64::MAX,
            staleness_grace_ms: 5_000,
            ..Config::default()
        };
        assert_eq!(config.staleness_threshold(), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn test_zero_write_timeout_is_rejected() {
        let file = write_env("WRITE_TIMEOUT_MS=0\n");
        assert!(Config::from_env_file(file.path()).is_err());
    }
}
