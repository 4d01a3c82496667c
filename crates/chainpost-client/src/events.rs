//! Inbound message stream fan-out.
//!
//! Every recipient id gets its own broadcast channel. A message for a
//! recipient nobody is subscribed to is dropped here; persisting it is the
//! job of the local store behind the subscriber.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use chainpost_shared::Transaction;

/// A message delivered by the node, as handed to the presentation layer.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct InboundMessage {
    pub id: String,
    pub sender_id: String,
    pub recipient_id: String,
    /// Still encrypted; decryption happens upstream
    pub encrypted_content: Vec<u8>,
    pub content_type: String,
    pub sent_at: DateTime<Utc>,
    pub transaction_hash: String,
    pub block_height: u64,
}

impl From<Transaction> for InboundMessage {
    fn from(tx: Transaction) -> Self {
        let sent_at = tx.created_at_time();
        Self {
            id: tx.id,
            sender_id: tx.sender_id,
            recipient_id: tx.recipient_id,
            encrypted_content: tx.encrypted_content,
            content_type: tx.content_type,
            sent_at,
            transaction_hash: tx.transaction_hash,
            block_height: tx.confirmed_block_height,
        }
    }
}

pub(crate) struct SubscriberRegistry {
    channels: Mutex<HashMap<String, broadcast::Sender<InboundMessage>>>,
    capacity: usize,
}

impl SubscriberRegistry {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn subscribe(&self, recipient_id: &str) -> broadcast::Receiver<InboundMessage> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        // Drop channels whose receivers have all gone away
        channels.retain(|_, sender| sender.receiver_count() > 0);
        channels
            .entry(recipient_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Push a message to its recipient's stream. Returns the number of
    /// receivers reached; zero means the message was dropped.
    pub(crate) fn publish(&self, message: InboundMessage) -> usize {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let Some(sender) = channels.get(&message.recipient_id) else {
            tracing::debug!(recipient = %message.recipient_id, id = %message.id, "No subscriber, message dropped");
            return 0;
        };

        let recipient = message.recipient_id.clone();
        match sender.send(message) {
            Ok(reached) => reached,
            Err(_) => {
                // Every receiver is gone
                channels.remove(&recipient);
                tracing::debug!(recipient = %recipient, "Subscriber gone, message dropped");
                0
            }
        }
    }

    pub(crate) fn subscriber_count(&self, recipient_id: &str) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(recipient_id)
            .map_or(0, |sender| sender.receiver_count())
    }
}
