//! Inbound frame dispatch.
//!
//! Each frame is handled on its own: a frame that fails to parse is logged
//! and dropped, and the loop moves on to the next one.

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use chainpost_net::ConnectionNotification;
use chainpost_shared::protocol::{Confirmation, NetworkStatusUpdate};
use chainpost_shared::{Frame, FrameError, FrameType, Transaction};

use crate::events::InboundMessage;
use crate::manager::ConnectionManager;

impl ConnectionManager {
    /// Handle one inbound text frame.
    pub async fn handle_frame(&self, text: &str) -> Result<(), FrameError> {
        let frame = Frame::parse(text)?;
        match frame.frame_type {
            FrameType::NewMessage => self.on_new_message(&frame.data),
            FrameType::TransactionConfirmed => self.on_transaction_confirmed(&frame.data).await,
            FrameType::NetworkStatus => {
                self.on_network_status(&frame.data);
                Ok(())
            }
            FrameType::ConsensusUpdate => {
                self.on_consensus_update(&frame.data).await;
                Ok(())
            }
            other => {
                debug!(frame_type = other.as_str(), "Ignoring frame");
                Ok(())
            }
        }
    }

    fn on_new_message(&self, data: &str) -> Result<(), FrameError> {
        let tx = Transaction::from_json(data)?;
        debug!(tx_id = %tx.id, from = %tx.sender_id, to = %tx.recipient_id, "New message");
        self.inner.subscribers.publish(InboundMessage::from(tx));
        Ok(())
    }

    async fn on_transaction_confirmed(&self, data: &str) -> Result<(), FrameError> {
        let confirmation = Confirmation::parse(data)?;
        let id = &confirmation.transaction_id;

        let newly_confirmed = self.inner.pool.confirm(id, confirmation.block_number).await;
        if newly_confirmed {
            self.inner.observer.on_confirmed(id, confirmation.block_number);
        }

        // Prefer the hash we signed; fall back to the one the node echoed
        let hash = self
            .inner
            .pool
            .get(id)
            .await
            .map(|entry| entry.transaction.transaction_hash)
            .filter(|hash| !hash.is_empty())
            .or(confirmation.transaction_hash);

        let Some(hash) = hash else {
            debug!(tx_id = %id, "Confirmation without a known hash");
            return Ok(());
        };

        // A replayed confirmation must not push the prune deadline back
        if !newly_confirmed && self.inner.pruner.get(&hash).await.is_some() {
            debug!(tx_id = %id, "Duplicate confirmation ignored");
            return Ok(());
        }
        self.inner.pruner.mark_delivered(&hash).await;
        self.inner.observer.on_delivered(&hash);
        Ok(())
    }

    fn on_network_status(&self, data: &str) {
        let update = NetworkStatusUpdate::parse_lenient(data);
        self.inner.status_tx.send_modify(|status| {
            status.block_height = update.block_height;
            status.peer_count = update.peer_count;
            status.last_sync_time = Some(Utc::now());
        });
        debug!(
            height = update.block_height,
            peers = update.peer_count,
            "Network status updated"
        );
    }

    async fn on_consensus_update(&self, data: &str) {
        let record = self.inner.consensus.on_consensus_update(data).await;
        self.inner.status_tx.send_if_modified(|status| {
            let mut changed = false;
            if record.height > status.block_height {
                status.block_height = record.height;
                changed = true;
            }
            if record.peer_count > 0 && record.peer_count != status.peer_count {
                status.peer_count = record.peer_count;
                changed = true;
            }
            changed
        });
    }

    /// Drain one session's notifications until it ends or is cancelled.
    pub(crate) async fn run_dispatch(
        self,
        session_id: u64,
        cancel: CancellationToken,
        mut notifications: mpsc::Receiver<ConnectionNotification>,
    ) {
        debug!(session = session_id, "Dispatch loop started");
        loop {
            let notification = tokio::select! {
                n = notifications.recv() => n,
                _ = cancel.cancelled() => return,
            };

            match notification {
                Some(ConnectionNotification::Frame(text)) => {
                    if let Err(e) = self.handle_frame(&text).await {
                        warn!(error = %e, "Dropped inbound frame");
                    }
                }
                Some(end) if end.is_unexpected_end() => {
                    info!(session = session_id, reason = ?end, "Connection ended unexpectedly");
                    self.spawn_reconnect(session_id);
                    return;
                }
                Some(_) => return,
                None => {
                    self.spawn_reconnect(session_id);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use chrono::Duration;

    use chainpost_shared::{LocalIdentity, NetworkStatus, TransactionRequest, TransactionSigner};
    use chainpost_store::TxStatus;

    use super::*;
    use crate::config::ClientConfig;
    use crate::observer::DeliveryObserver;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl DeliveryObserver for Recorder {
        fn on_confirmed(&self, transaction_id: &str, block_height: u64) {
            self.events
                .lock()
                .unwrap()
                .push(format!("confirmed:{transaction_id}:{block_height}"));
        }

        fn on_delivered(&self, transaction_hash: &str) {
            self.events
                .lock()
                .unwrap()
                .push(format!("delivered:{transaction_hash}"));
        }
    }

    fn manager_with(observer: Arc<Recorder>) -> ConnectionManager {
        let identity = LocalIdentity::generate().with_user_id("u1");
        ConnectionManager::with_observer(ClientConfig::default(), Arc::new(identity), observer)
    }

    fn frame(frame_type: FrameType, data: &str) -> String {
        Frame::new(frame_type, data).to_text().unwrap()
    }

    fn signed(id: &str) -> Transaction {
        let identity = LocalIdentity::generate().with_user_id("u1");
        let tx = Transaction::from_request(
            TransactionRequest::new("u2", b"c1".to_vec(), "text").with_id(id),
            "u1",
        );
        TransactionSigner::new().sign_with(&tx, &identity).unwrap()
    }

    #[tokio::test]
    async fn test_confirmation_settles_pool_and_tracks_delivery() {
        let recorder = Arc::new(Recorder::default());
        let manager = manager_with(recorder.clone());
        let tx = signed("t1");
        manager.pool().add(tx.clone()).await;

        let before = Utc::now();
        manager
            .handle_frame(&frame(
                FrameType::TransactionConfirmed,
                r#"{"transactionId":"t1","blockNumber":42}"#,
            ))
            .await
            .unwrap();

        let entry = manager.pool().get("t1").await.unwrap();
        assert_eq!(entry.status, TxStatus::Confirmed);
        assert_eq!(entry.transaction.confirmed_block_height, 42);

        let record = manager.pruner().get(&tx.transaction_hash).await.unwrap();
        assert!(record.delivered_at >= before);
        assert_eq!(record.prune_at - record.delivered_at, Duration::hours(48));

        let events = recorder.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                "confirmed:t1:42".to_string(),
                format!("delivered:{}", tx.transaction_hash)
            ]
        );
    }

    #[tokio::test]
    async fn test_duplicate_confirmation_keeps_prune_deadline() {
        let recorder = Arc::new(Recorder::default());
        let manager = manager_with(recorder.clone());
        let tx = signed("t1");
        manager.pool().add(tx.clone()).await;

        let text = frame(
            FrameType::TransactionConfirmed,
            r#"{"transactionId":"t1","blockNumber":42}"#,
        );
        manager.handle_frame(&text).await.unwrap();
        let first = manager.pruner().get(&tx.transaction_hash).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        manager.handle_frame(&text).await.unwrap();

        let second = manager.pruner().get(&tx.transaction_hash).await.unwrap();
        assert_eq!(second.prune_at, first.prune_at);
        assert_eq!(recorder.events.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_confirmation_for_unknown_transaction_uses_echoed_hash() {
        let manager = manager_with(Arc::new(Recorder::default()));
        manager
            .handle_frame(&frame(
                FrameType::TransactionConfirmed,
                r#"{"transactionId":"t9","blockNumber":"7","transactionHash":"aGFzaA=="}"#,
            ))
            .await
            .unwrap();

        assert!(manager.pool().get("t9").await.is_none());
        assert!(manager.pruner().get("aGFzaA==").await.is_some());
    }

    #[tokio::test]
    async fn test_confirmation_without_id_is_rejected() {
        let manager = manager_with(Arc::new(Recorder::default()));
        let result = manager
            .handle_frame(&frame(FrameType::TransactionConfirmed, r#"{"blockNumber":1}"#))
            .await;
        assert!(matches!(result, Err(FrameError::InvalidPayload { .. })));
    }

    #[tokio::test]
    async fn test_new_message_reaches_recipient_subscriber() {
        let manager = manager_with(Arc::new(Recorder::default()));
        let mut inbox = manager.subscribe("u2");
        let tx = signed("t1");

        manager
            .handle_frame(&frame(FrameType::NewMessage, &tx.to_json().unwrap()))
            .await
            .unwrap();

        let message = inbox.recv().await.unwrap();
        assert_eq!(message.id, "t1");
        assert_eq!(message.sender_id, "u1");
        assert_eq!(message.encrypted_content, b"c1");
        assert_eq!(message.transaction_hash, tx.transaction_hash);
    }

    #[tokio::test]
    async fn test_malformed_frames_are_errors_not_panics() {
        let manager = manager_with(Arc::new(Recorder::default()));
        assert!(matches!(
            manager.handle_frame("{not json").await,
            Err(FrameError::Malformed(_))
        ));
        assert!(manager
            .handle_frame(&frame(FrameType::NewMessage, "garbage"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_unknown_frame_type_is_ignored() {
        let manager = manager_with(Arc::new(Recorder::default()));
        let text = r#"{"type":"PEER_GOSSIP","data":"x","timestamp":1}"#;
        assert!(manager.handle_frame(text).await.is_ok());
        assert_eq!(manager.network_status(), NetworkStatus::disconnected());
    }

    #[tokio::test]
    async fn test_network_status_and_consensus_update_status() {
        let manager = manager_with(Arc::new(Recorder::default()));
        manager
            .handle_frame(&frame(
                FrameType::NetworkStatus,
                r#"{"blockHeight":10,"peerCount":3}"#,
            ))
            .await
            .unwrap();
        let status = manager.network_status();
        assert_eq!(status.block_height, 10);
        assert_eq!(status.peer_count, 3);
        assert!(status.last_sync_time.is_some());

        manager
            .handle_frame(&frame(
                FrameType::ConsensusUpdate,
                r#"{"height":12,"hash":"abc","peers":5}"#,
            ))
            .await
            .unwrap();
        let status = manager.network_status();
        assert_eq!(status.block_height, 12);
        assert_eq!(status.peer_count, 5);
        assert!(manager
            .consensus()
            .consensus_state()
            .await
            .contains_key("block_12"));

        // An older height never moves the status backwards
        manager
            .handle_frame(&frame(FrameType::ConsensusUpdate, r#"{"height":4,"hash":"old"}"#))
            .await
            .unwrap();
        assert_eq!(manager.network_status().block_height, 12);
    }
}
