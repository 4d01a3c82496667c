// Transport between the client and a node: one persistent WebSocket
// connection driven by a background task, plus the reconnect policy.

pub mod backoff;
pub mod connection;
pub mod error;

pub use backoff::ReconnectPolicy;
pub use connection::{
    open_connection, ConnectionCommand, ConnectionHandle, ConnectionNotification, NodeConnection,
};
pub use error::NetError;
