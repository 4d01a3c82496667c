//! Client configuration loaded from environment variables.
//!
//! Every setting has a default, so a client can start with nothing but a
//! node address passed to `connect`.

use std::str::FromStr;
use std::time::Duration;

use chainpost_shared::constants::{
    DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_PRUNE_INTERVAL, DEFAULT_RETRY_INTERVAL,
    DEFAULT_SYNC_INTERVAL, MAX_RECONNECT_ATTEMPTS, RECONNECT_BASE_DELAY, SUBSCRIBER_BUFFER,
};
use chainpost_net::ReconnectPolicy;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Node to use for `connect_as_user` when the identity has none.
    /// Env: `CHAINPOST_NODE_ADDRESS`
    pub node_address: Option<String>,

    /// How long `connect` waits for the WebSocket upgrade.
    /// Env: `CHAINPOST_HANDSHAKE_TIMEOUT_SECS`
    /// Default: 10 s
    pub handshake_timeout: Duration,

    /// Interval of the `SYNC_REQUEST` heartbeat.
    /// Env: `CHAINPOST_SYNC_INTERVAL_SECS`
    /// Default: 30 s
    pub sync_interval: Duration,

    /// Interval of the pending-transaction retry sweep.
    /// Env: `CHAINPOST_RETRY_INTERVAL_SECS`
    /// Default: 30 s
    pub retry_interval: Duration,

    /// Interval of the pruner sweep.
    /// Env: `CHAINPOST_PRUNE_INTERVAL_SECS`
    /// Default: 1 h
    pub prune_interval: Duration,

    /// First automatic reconnect delay; doubles on every attempt.
    /// Env: `CHAINPOST_RECONNECT_BASE_MS`
    /// Default: 1000 ms
    pub reconnect_base_delay: Duration,

    /// Env: `CHAINPOST_MAX_RECONNECT_ATTEMPTS`
    /// Default: 5
    pub max_reconnect_attempts: u32,

    /// Capacity of each per-recipient inbound stream.
    /// Env: `CHAINPOST_SUBSCRIBER_BUFFER`
    /// Default: 64
    pub subscriber_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            node_address: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            sync_interval: DEFAULT_SYNC_INTERVAL,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            prune_interval: DEFAULT_PRUNE_INTERVAL,
            reconnect_base_delay: RECONNECT_BASE_DELAY,
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            subscriber_buffer: SUBSCRIBER_BUFFER,
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("CHAINPOST_NODE_ADDRESS") {
            if addr.trim().is_empty() {
                tracing::warn!("Empty CHAINPOST_NODE_ADDRESS, ignoring");
            } else {
                config.node_address = Some(addr);
            }
        }

        if let Some(secs) = parse_var::<u64, _>(&lookup, "CHAINPOST_HANDSHAKE_TIMEOUT_SECS") {
            config.handshake_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "CHAINPOST_SYNC_INTERVAL_SECS") {
            config.sync_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "CHAINPOST_RETRY_INTERVAL_SECS") {
            config.retry_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "CHAINPOST_PRUNE_INTERVAL_SECS") {
            config.prune_interval = Duration::from_secs(secs);
        }

        // -- Reconnection --

        if let Some(ms) = parse_var::<u64, _>(&lookup, "CHAINPOST_RECONNECT_BASE_MS") {
            config.reconnect_base_delay = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var::<u32, _>(&lookup, "CHAINPOST_MAX_RECONNECT_ATTEMPTS") {
            config.max_reconnect_attempts = n;
        }

        if let Some(n) = parse_var::<usize, _>(&lookup, "CHAINPOST_SUBSCRIBER_BUFFER") {
            config.subscriber_buffer = n;
        }

        config
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(self.reconnect_base_delay, self.max_reconnect_attempts)
    }
}

/// Parse a positive number; zero and garbage are logged and ignored.
fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr + PartialEq + Default,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) if value != T::default() => Some(value),
        _ => {
            tracing::warn!(key, value = %raw, "Invalid value, using default");
            None
        }
    }
}
