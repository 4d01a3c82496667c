//! Records kept by the in-memory stores.
//!
//! Every struct is a plain value: stores replace entries wholesale rather
//! than mutating fields behind a shared reference.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use chainpost_shared::constants::PRUNE_WINDOW;
use chainpost_shared::Transaction;

// ---------------------------------------------------------------------------
// Pool entry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TxStatus {
    Pending,
    Confirmed,
    Failed,
}

impl TxStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// A submitted transaction plus its delivery lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolEntry {
    pub transaction: Transaction,
    pub status: TxStatus,
    pub submitted_at: DateTime<Utc>,
    pub retry_count: u32,
    /// Starts at `submitted_at`, so the first retry waits a full spacing
    pub last_retry_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

impl PoolEntry {
    pub fn pending(transaction: Transaction, now: DateTime<Utc>) -> Self {
        Self {
            transaction,
            status: TxStatus::Pending,
            submitted_at: now,
            retry_count: 0,
            last_retry_at: now,
            confirmed_at: None,
            failed_at: None,
            failure_reason: None,
        }
    }

    /// When the entry reached CONFIRMED or FAILED
    pub fn terminal_at(&self) -> Option<DateTime<Utc>> {
        match self.status {
            TxStatus::Pending => None,
            TxStatus::Confirmed => self.confirmed_at,
            TxStatus::Failed => self.failed_at,
        }
    }
}

/// Aggregate pool counters published to observers.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub pending: usize,
    pub confirmed: usize,
    pub failed: usize,
    /// Most recent failure as `(transaction id, reason)`
    pub last_failure: Option<(String, String)>,
}

// ---------------------------------------------------------------------------
// Delivered message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveredMessage {
    pub transaction_hash: String,
    pub delivered_at: DateTime<Utc>,
    pub prune_at: DateTime<Utc>,
}

impl DeliveredMessage {
    pub fn new(transaction_hash: impl Into<String>, delivered_at: DateTime<Utc>) -> Self {
        Self {
            transaction_hash: transaction_hash.into(),
            delivered_at,
            prune_at: delivered_at + span(PRUNE_WINDOW),
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.prune_at
    }
}

// ---------------------------------------------------------------------------
// Consensus
// ---------------------------------------------------------------------------

/// Local view of one block height as last reported by the node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsensusRecord {
    pub height: u64,
    pub hash: String,
    pub peer_count: u32,
    pub timestamp: i64,
    /// Always 1: a single-node client does not count quorum
    pub confirmations: u32,
    pub received_at: DateTime<Utc>,
}

/// Convert a protocol constant into a chrono span.
pub(crate) fn span(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(duration.as_millis().min(i64::MAX as u128) as i64)
}
