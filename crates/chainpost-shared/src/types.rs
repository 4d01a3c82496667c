use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of the persistent connection to a node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

/// Snapshot of what the client knows about the network. Replaced as a whole
/// on every change.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    pub connected: bool,
    pub node_address: Option<String>,
    pub block_height: u64,
    pub peer_count: u32,
    pub last_sync_time: Option<DateTime<Utc>>,
}

impl NetworkStatus {
    pub fn disconnected() -> Self {
        Self::default()
    }

    pub fn connected_to(node_address: impl Into<String>) -> Self {
        Self {
            connected: true,
            node_address: Some(node_address.into()),
            last_sync_time: Some(Utc::now()),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connected_snapshot() {
        let status = NetworkStatus::connected_to("ws://127.0.0.1:9000");
        assert!(status.connected);
        assert_eq!(status.node_address.as_deref(), Some("ws://127.0.0.1:9000"));
        assert_eq!(status.block_height, 0);
        assert!(status.last_sync_time.is_some());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());
    }
}
