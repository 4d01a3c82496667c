//! Retention of delivered messages.
//!
//! A delivered message is tracked for 48 hours, after which the hourly
//! sweep asks the network to prune it (best effort) and forgets it locally
//! whatever the outcome. A second pass drops anything older than seven days
//! so the tracker stays bounded even if sweeps were skipped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use chainpost_shared::constants::{DEFAULT_PRUNE_INTERVAL, PRUNE_GC_AGE};
use chainpost_shared::ChainError;

use crate::models::{span, DeliveredMessage};

/// Receives the network-side prune notification for each expired record.
pub trait PruneNotifier: Send + Sync {
    fn notify_pruned(&self, record: &DeliveredMessage) -> Result<(), ChainError>;
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Records past their prune deadline, removed locally
    pub pruned: Vec<String>,
    /// How many of those the network notification accepted
    pub notified: usize,
    /// Records removed by the 7-day garbage collection
    pub collected: usize,
}

struct SweepHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Clone)]
pub struct MessagePruner {
    records: Arc<RwLock<HashMap<String, DeliveredMessage>>>,
    initialized: Arc<AtomicBool>,
    sweep: Arc<Mutex<Option<SweepHandle>>>,
    interval: Duration,
}

impl MessagePruner {
    pub fn new() -> Self {
        Self::with_interval(DEFAULT_PRUNE_INTERVAL)
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            initialized: Arc::new(AtomicBool::new(false)),
            sweep: Arc::new(Mutex::new(None)),
            interval,
        }
    }

    /// One-time setup. Returns `true` only on the call that performed it.
    pub fn initialize(&self) -> bool {
        let first = self
            .initialized
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if first {
            info!(
                interval_secs = self.interval.as_secs(),
                "Message pruner initialized"
            );
        }
        first
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------------
    // Tracking
    // -----------------------------------------------------------------------

    pub async fn mark_delivered(&self, transaction_hash: &str) {
        self.mark_delivered_at(transaction_hash, Utc::now()).await;
    }

    /// Insert or replace the record for `transaction_hash`.
    pub async fn mark_delivered_at(&self, transaction_hash: &str, delivered_at: DateTime<Utc>) {
        let record = DeliveredMessage::new(transaction_hash, delivered_at);
        debug!(hash = %transaction_hash, prune_at = %record.prune_at, "Tracking delivered message");
        self.records
            .write()
            .await
            .insert(transaction_hash.to_string(), record);
    }

    pub async fn should_prune(&self, transaction_hash: &str) -> bool {
        self.should_prune_at(transaction_hash, Utc::now()).await
    }

    pub async fn should_prune_at(&self, transaction_hash: &str, now: DateTime<Utc>) -> bool {
        self.records
            .read()
            .await
            .get(transaction_hash)
            .map(|r| r.is_due(now))
            .unwrap_or(false)
    }

    pub async fn messages_to_prune(&self) -> Vec<DeliveredMessage> {
        self.messages_to_prune_at(Utc::now()).await
    }

    /// Records whose deadline has passed, earliest deadline first.
    pub async fn messages_to_prune_at(&self, now: DateTime<Utc>) -> Vec<DeliveredMessage> {
        let records = self.records.read().await;
        let mut due: Vec<DeliveredMessage> =
            records.values().filter(|r| r.is_due(now)).cloned().collect();
        due.sort_by_key(|r| r.prune_at);
        due
    }

    /// Remove and return every record delivered before `cutoff`, ignoring
    /// the 48-hour rule.
    pub async fn force_prune_older_than(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        let mut records = self.records.write().await;
        let doomed: Vec<String> = records
            .values()
            .filter(|r| r.delivered_at < cutoff)
            .map(|r| r.transaction_hash.clone())
            .collect();
        for hash in &doomed {
            records.remove(hash);
        }
        if !doomed.is_empty() {
            info!(count = doomed.len(), cutoff = %cutoff, "Force-pruned delivered messages");
        }
        doomed
    }

    /// Drop records older than the garbage-collection age.
    pub async fn collect_garbage_at(&self, now: DateTime<Utc>) -> usize {
        let max_age = span(PRUNE_GC_AGE);
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, r| now - r.delivered_at <= max_age);
        before - records.len()
    }

    pub async fn tracked_count(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn get(&self, transaction_hash: &str) -> Option<DeliveredMessage> {
        self.records.read().await.get(transaction_hash).cloned()
    }

    // -----------------------------------------------------------------------
    // Sweep
    // -----------------------------------------------------------------------

    /// Remove and return every due record in one step, earliest deadline
    /// first.
    async fn take_due_at(&self, now: DateTime<Utc>) -> Vec<DeliveredMessage> {
        let mut records = self.records.write().await;
        let hashes: Vec<String> = records
            .values()
            .filter(|r| r.is_due(now))
            .map(|r| r.transaction_hash.clone())
            .collect();
        let mut due: Vec<DeliveredMessage> =
            hashes.iter().filter_map(|h| records.remove(h)).collect();
        due.sort_by_key(|r| r.prune_at);
        due
    }

    /// One sweep: forget every due record and notify the network, then
    /// garbage-collect. A record re-marked while the sweep runs is kept.
    pub async fn sweep_at(&self, now: DateTime<Utc>, notifier: &dyn PruneNotifier) -> SweepReport {
        let mut report = SweepReport::default();

        for record in self.take_due_at(now).await {
            match notifier.notify_pruned(&record) {
                Ok(()) => report.notified += 1,
                Err(e) => {
                    warn!(
                        hash = %record.transaction_hash,
                        error = %e,
                        "Network prune notification failed"
                    );
                }
            }
            report.pruned.push(record.transaction_hash);
        }

        report.collected = self.collect_garbage_at(now).await;

        if !report.pruned.is_empty() || report.collected > 0 {
            info!(
                pruned = report.pruned.len(),
                notified = report.notified,
                collected = report.collected,
                "Prune sweep finished"
            );
        }
        report
    }

    /// Start the periodic sweep. No-op if it is already running.
    pub fn start(&self, notifier: Arc<dyn PruneNotifier>) {
        self.initialize();

        let mut slot = self.sweep.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|h| !h.task.is_finished()) {
            debug!("Prune sweep already running");
            return;
        }

        let cancel = CancellationToken::new();
        let pruner = self.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            info!(interval_secs = pruner.interval.as_secs(), "Prune sweep starting");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(pruner.interval) => {},
                    _ = token.cancelled() => {
                        info!("Prune sweep shutting down");
                        return;
                    }
                }
                pruner.sweep_at(Utc::now(), notifier.as_ref()).await;
            }
        });

        *slot = Some(SweepHandle { cancel, task });
    }

    /// Stop the periodic sweep and wait for it to exit. Tracked records are
    /// kept.
    pub async fn stop(&self) {
        let handle = self
            .sweep
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.cancel.cancel();
            if let Err(e) = handle.task.await {
                warn!(error = %e, "Prune sweep task ended abnormally");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.sweep
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|h| !h.task.is_finished())
    }
}

impl Default for MessagePruner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingNotifier {
        calls: AtomicUsize,
        fail: bool,
    }

    impl PruneNotifier for CountingNotifier {
        fn notify_pruned(&self, _record: &DeliveredMessage) -> Result<(), ChainError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ChainError::NotConnected)
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let pruner = MessagePruner::new();
        assert!(pruner.initialize());
        assert!(!pruner.initialize());
        assert!(pruner.is_initialized());
    }

    #[tokio::test]
    async fn test_should_prune_boundary() {
        let pruner = MessagePruner::new();
        let t0 = Utc::now();
        pruner.mark_delivered_at("h1", t0).await;

        assert!(!pruner.should_prune_at("h1", t0 + ChronoDuration::hours(47)).await);
        assert!(
            !pruner
                .should_prune_at("h1", t0 + ChronoDuration::hours(48) - ChronoDuration::milliseconds(1))
                .await
        );
        assert!(pruner.should_prune_at("h1", t0 + ChronoDuration::hours(48)).await);
        assert!(!pruner.should_prune_at("unknown", t0 + ChronoDuration::days(30)).await);
    }

    #[tokio::test]
    async fn test_mark_delivered_upserts() {
        let pruner = MessagePruner::new();
        let t0 = Utc::now();
        pruner.mark_delivered_at("h1", t0 - ChronoDuration::hours(50)).await;
        pruner.mark_delivered_at("h1", t0).await;

        assert_eq!(pruner.tracked_count().await, 1);
        assert!(pruner.messages_to_prune_at(t0).await.is_empty());
    }

    #[tokio::test]
    async fn test_force_prune_ignores_48h_rule() {
        let pruner = MessagePruner::new();
        let now = Utc::now();
        pruner.mark_delivered_at("old", now - ChronoDuration::hours(2)).await;
        pruner.mark_delivered_at("recent", now - ChronoDuration::minutes(10)).await;

        let pruned = pruner.force_prune_older_than(now - ChronoDuration::hours(1)).await;
        assert_eq!(pruned, vec!["old".to_string()]);
        assert!(pruner.get("old").await.is_none());
        assert!(pruner.get("recent").await.is_some());
    }

    #[tokio::test]
    async fn test_sweep_removes_even_when_notification_fails() {
        let pruner = MessagePruner::new();
        let t0 = Utc::now();
        pruner.mark_delivered_at("due", t0 - ChronoDuration::hours(49)).await;
        pruner.mark_delivered_at("fresh", t0 - ChronoDuration::hours(1)).await;

        let notifier = CountingNotifier {
            fail: true,
            ..Default::default()
        };
        let report = pruner.sweep_at(t0, &notifier).await;

        assert_eq!(report.pruned, vec!["due".to_string()]);
        assert_eq!(report.notified, 0);
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 1);
        assert_eq!(pruner.tracked_count().await, 1);
        assert!(pruner.get("fresh").await.is_some());
    }

    /// Re-marks every notified record as delivered at `now`.
    struct Redeliver {
        pruner: MessagePruner,
        now: DateTime<Utc>,
    }

    impl PruneNotifier for Redeliver {
        fn notify_pruned(&self, record: &DeliveredMessage) -> Result<(), ChainError> {
            let mut records = self.pruner.records.try_write().expect("sweep holds no lock");
            records.insert(
                record.transaction_hash.clone(),
                DeliveredMessage::new(&record.transaction_hash, self.now),
            );
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_sweep_keeps_record_redelivered_mid_sweep() {
        let pruner = MessagePruner::new();
        let t0 = Utc::now();
        pruner.mark_delivered_at("h1", t0 - ChronoDuration::hours(49)).await;

        let notifier = Redeliver {
            pruner: pruner.clone(),
            now: t0,
        };
        let report = pruner.sweep_at(t0, &notifier).await;

        assert_eq!(report.pruned, vec!["h1".to_string()]);
        let record = pruner.get("h1").await.expect("fresh record survives");
        assert_eq!(record.delivered_at, t0);
        assert!(!pruner.should_prune_at("h1", t0).await);
    }

    #[tokio::test]
    async fn test_garbage_collection() {
        let pruner = MessagePruner::new();
        let now = Utc::now();
        pruner.mark_delivered_at("ancient", now - ChronoDuration::days(8)).await;
        pruner.mark_delivered_at("recent", now).await;

        assert_eq!(pruner.collect_garbage_at(now).await, 1);
        assert_eq!(pruner.tracked_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_stop_keeps_records() {
        let pruner = MessagePruner::with_interval(Duration::from_secs(3600));
        pruner.mark_delivered("h1").await;

        let notifier = Arc::new(CountingNotifier::default());
        pruner.start(notifier.clone());
        pruner.start(notifier.clone());
        assert!(pruner.is_running());

        pruner.stop().await;
        assert!(!pruner.is_running());
        assert_eq!(pruner.tracked_count().await, 1);
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_runs_on_interval() {
        let pruner = MessagePruner::with_interval(Duration::from_secs(3600));
        pruner
            .mark_delivered_at("due", Utc::now() - ChronoDuration::hours(72))
            .await;

        let notifier = Arc::new(CountingNotifier::default());
        pruner.start(notifier.clone());

        tokio::time::sleep(Duration::from_secs(3601)).await;
        for _ in 0..10 {
            if pruner.tracked_count().await == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert_eq!(pruner.tracked_count().await, 0);
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 1);
        pruner.stop().await;
    }
}
