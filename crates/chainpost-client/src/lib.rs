//! # chainpost-client
//!
//! Client side of the chainpost transaction layer. The
//! [`ConnectionManager`] keeps one WebSocket connection to a node, signs and
//! submits outbound messages as transactions, tracks them until the node
//! confirms them, and fans inbound messages out to per-recipient streams.

pub mod config;
mod dispatch;
pub mod events;
pub mod manager;
pub mod observer;
mod state;

pub use config::ClientConfig;
pub use events::InboundMessage;
pub use manager::ConnectionManager;
pub use observer::DeliveryObserver;
