//! Transaction pool: lifecycle store for outbound transactions.
//!
//! ```text
//! PENDING --confirm(height)--> CONFIRMED
//! PENDING --fail(reason)-----> FAILED
//! PENDING --retry exhausted--> FAILED
//! ```
//!
//! CONFIRMED and FAILED are terminal. Every operation is total over unknown
//! ids: confirmations can race local cleanup, so a missing key is ignored
//! rather than reported.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use chainpost_shared::constants::{
    MAX_RETRY, MAX_RETRY_REASON, RETRY_SPACING, TERMINAL_RETENTION,
};
use chainpost_shared::Transaction;

use crate::models::{span, PoolEntry, PoolStats, TxStatus};

#[derive(Debug, Default)]
struct PoolState {
    entries: HashMap<String, PoolEntry>,
    /// Pending transaction ids per sender, in submission order
    by_sender: HashMap<String, VecDeque<String>>,
    last_failure: Option<(String, String)>,
}

impl PoolState {
    fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            total: self.entries.len(),
            last_failure: self.last_failure.clone(),
            ..PoolStats::default()
        };
        for entry in self.entries.values() {
            match entry.status {
                TxStatus::Pending => stats.pending += 1,
                TxStatus::Confirmed => stats.confirmed += 1,
                TxStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    fn unqueue(&mut self, sender: &str, id: &str) {
        if let Some(queue) = self.by_sender.get_mut(sender) {
            queue.retain(|queued| queued != id);
            if queue.is_empty() {
                self.by_sender.remove(sender);
            }
        }
    }

    /// Replace a pending entry with its FAILED successor.
    fn mark_failed(&mut self, mut entry: PoolEntry, reason: &str, now: DateTime<Utc>) {
        let id = entry.transaction.id.clone();
        let sender = entry.transaction.sender_id.clone();
        entry.status = TxStatus::Failed;
        entry.failed_at = Some(now);
        entry.failure_reason = Some(reason.to_string());
        self.entries.insert(id.clone(), entry);
        self.unqueue(&sender, &id);
        self.last_failure = Some((id, reason.to_string()));
    }
}

/// In-memory pool of submitted transactions. Cloning yields another handle
/// onto the same pool.
#[derive(Clone)]
pub struct TransactionPool {
    state: Arc<RwLock<PoolState>>,
    stats_tx: Arc<watch::Sender<PoolStats>>,
}

impl TransactionPool {
    pub fn new() -> Self {
        let (stats_tx, _) = watch::channel(PoolStats::default());
        Self {
            state: Arc::new(RwLock::new(PoolState::default())),
            stats_tx: Arc::new(stats_tx),
        }
    }

    fn publish(&self, state: &PoolState) {
        self.stats_tx.send_replace(state.stats());
    }

    /// Track a freshly signed transaction as PENDING.
    ///
    /// Returns `false` if the id is already known; existing entries are
    /// never reset.
    pub async fn add(&self, tx: Transaction) -> bool {
        self.add_at(tx, Utc::now()).await
    }

    pub async fn add_at(&self, tx: Transaction, now: DateTime<Utc>) -> bool {
        let mut state = self.state.write().await;
        if state.entries.contains_key(&tx.id) {
            warn!(tx_id = %tx.id, "Transaction already in pool, ignoring");
            return false;
        }

        let id = tx.id.clone();
        state
            .by_sender
            .entry(tx.sender_id.clone())
            .or_default()
            .push_back(id.clone());
        state.entries.insert(id.clone(), PoolEntry::pending(tx, now));
        self.publish(&state);

        debug!(tx_id = %id, "Transaction added to pool");
        true
    }

    /// PENDING -> CONFIRMED. Returns whether the entry changed.
    pub async fn confirm(&self, id: &str, block_height: u64) -> bool {
        self.confirm_at(id, block_height, Utc::now()).await
    }

    pub async fn confirm_at(&self, id: &str, block_height: u64, now: DateTime<Utc>) -> bool {
        let mut state = self.state.write().await;
        let Some(mut entry) = state
            .entries
            .get(id)
            .filter(|e| e.status == TxStatus::Pending)
            .cloned()
        else {
            debug!(tx_id = %id, "Confirmation for unknown or settled transaction ignored");
            return false;
        };

        let sender = entry.transaction.sender_id.clone();
        entry.status = TxStatus::Confirmed;
        entry.confirmed_at = Some(now);
        entry.transaction.confirmed_block_height = block_height;
        state.entries.insert(id.to_string(), entry);
        state.unqueue(&sender, id);
        self.publish(&state);

        info!(tx_id = %id, block = block_height, "Transaction confirmed");
        true
    }

    /// PENDING -> FAILED. Returns whether the entry changed.
    pub async fn fail(&self, id: &str, reason: &str) -> bool {
        self.fail_at(id, reason, Utc::now()).await
    }

    pub async fn fail_at(&self, id: &str, reason: &str, now: DateTime<Utc>) -> bool {
        let mut state = self.state.write().await;
        let Some(entry) = state
            .entries
            .get(id)
            .filter(|e| e.status == TxStatus::Pending)
            .cloned()
        else {
            return false;
        };

        state.mark_failed(entry, reason, now);
        self.publish(&state);

        warn!(tx_id = %id, reason, "Transaction failed");
        true
    }

    /// Pending entries due for another attempt, oldest submission first.
    pub async fn transactions_for_retry(&self) -> Vec<Transaction> {
        self.transactions_for_retry_at(Utc::now()).await
    }

    pub async fn transactions_for_retry_at(&self, now: DateTime<Utc>) -> Vec<Transaction> {
        let spacing = span(RETRY_SPACING);
        let state = self.state.read().await;

        let mut due: Vec<&PoolEntry> = state
            .entries
            .values()
            .filter(|e| {
                e.status == TxStatus::Pending
                    && e.retry_count < MAX_RETRY
                    && now - e.last_retry_at > spacing
            })
            .collect();
        due.sort_by_key(|e| e.submitted_at);

        due.into_iter().map(|e| e.transaction.clone()).collect()
    }

    /// Record one more attempt. Reaching `MAX_RETRY` fails the entry.
    ///
    /// Returns the status after the increment, or `None` for unknown ids.
    /// Terminal entries are returned unchanged.
    pub async fn increment_retry(&self, id: &str) -> Option<TxStatus> {
        self.increment_retry_at(id, Utc::now()).await
    }

    pub async fn increment_retry_at(&self, id: &str, now: DateTime<Utc>) -> Option<TxStatus> {
        let mut state = self.state.write().await;
        let mut entry = state.entries.get(id).cloned()?;
        if entry.status.is_terminal() {
            return Some(entry.status);
        }

        entry.retry_count += 1;
        entry.last_retry_at = now;

        if entry.retry_count >= MAX_RETRY {
            state.mark_failed(entry, MAX_RETRY_REASON, now);
            self.publish(&state);
            warn!(tx_id = %id, retries = MAX_RETRY, "Retry budget exhausted");
            return Some(TxStatus::Failed);
        }

        debug!(tx_id = %id, retry = entry.retry_count, "Retry recorded");
        state.entries.insert(id.to_string(), entry);
        Some(TxStatus::Pending)
    }

    /// Drop terminal entries settled more than 24 hours ago.
    pub async fn cleanup(&self) -> usize {
        self.cleanup_at(Utc::now()).await
    }

    pub async fn cleanup_at(&self, now: DateTime<Utc>) -> usize {
        let retention = span(TERMINAL_RETENTION);
        let mut state = self.state.write().await;
        let before = state.entries.len();
        state.entries.retain(|_, entry| match entry.terminal_at() {
            Some(at) => now - at <= retention,
            None => true,
        });
        let removed = before - state.entries.len();
        if removed > 0 {
            self.publish(&state);
            debug!(removed, "Cleaned up settled transactions");
        }
        removed
    }

    /// Run `cleanup` every `interval` until the token is cancelled.
    pub fn spawn_cleanup(&self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {},
                    _ = shutdown.cancelled() => {
                        debug!("Pool cleanup task shutting down");
                        return;
                    }
                }
                pool.cleanup().await;
            }
        })
    }

    pub async fn get(&self, id: &str) -> Option<PoolEntry> {
        self.state.read().await.entries.get(id).cloned()
    }

    /// Pending transactions from one sender, in submission order.
    pub async fn pending_for_sender(&self, sender_id: &str) -> Vec<Transaction> {
        let state = self.state.read().await;
        state
            .by_sender
            .get(sender_id)
            .map(|queue| {
                queue
                    .iter()
                    .filter_map(|id| state.entries.get(id))
                    .map(|e| e.transaction.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.entries.is_empty()
    }

    /// Current counters.
    pub fn stats(&self) -> PoolStats {
        self.stats_tx.borrow().clone()
    }

    /// Live counters; the receiver is notified on every change.
    pub fn subscribe_stats(&self) -> watch::Receiver<PoolStats> {
        self.stats_tx.subscribe()
    }
}

impl Default for TransactionPool {
    fn default() -> Self {
        Self::new()
    }
}
