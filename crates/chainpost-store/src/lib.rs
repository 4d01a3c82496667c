//! # chainpost-store
//!
//! In-memory lifecycle stores for the transaction layer: the transaction
//! pool, the delivered-message pruner and the rolling consensus view.
//!
//! Each store owns its map behind an async lock and only hands out copies.
//! Handles are cheap to clone and share the same underlying state.

pub mod consensus;
pub mod models;
pub mod pool;
pub mod pruner;

pub use consensus::ConsensusHandler;
pub use models::*;
pub use pool::TransactionPool;
pub use pruner::{MessagePruner, PruneNotifier, SweepReport};
