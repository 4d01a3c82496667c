use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Handshake did not complete within {0:?}")]
    Timeout(Duration),

    #[error("Connection closed")]
    Closed,

    #[error("Outbound queue full")]
    QueueFull,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
