//! Wire protocol spoken with the node.
//!
//! Every text frame is a JSON object with exactly three fields: `type`,
//! `data` (a string, itself often JSON) and `timestamp` (epoch millis).
//! Inbound payloads other than transactions are parsed leniently: missing
//! or mistyped fields fall back to zero values so that one odd frame cannot
//! take the dispatch loop down.

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::FrameError;
use crate::transaction::Transaction;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FrameType {
    // Outbound
    SendTransaction,
    PruneMessages,
    DeleteMessage,
    SyncRequest,

    // Inbound
    NewMessage,
    TransactionConfirmed,
    NetworkStatus,
    ConsensusUpdate,

    /// Any type this client does not know about
    #[serde(other)]
    Unknown,
}

impl FrameType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SendTransaction => "SEND_TRANSACTION",
            Self::PruneMessages => "PRUNE_MESSAGES",
            Self::DeleteMessage => "DELETE_MESSAGE",
            Self::SyncRequest => "SYNC_REQUEST",
            Self::NewMessage => "NEW_MESSAGE",
            Self::TransactionConfirmed => "TRANSACTION_CONFIRMED",
            Self::NetworkStatus => "NETWORK_STATUS",
            Self::ConsensusUpdate => "CONSENSUS_UPDATE",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// A single text frame exchanged over the node connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Frame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub timestamp: i64,
}

impl Frame {
    /// Create a frame stamped with the current time
    pub fn new(frame_type: FrameType, data: impl Into<String>) -> Self {
        Self {
            frame_type,
            data: data.into(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn send_transaction(tx: &Transaction) -> Result<Self, serde_json::Error> {
        Ok(Self::new(FrameType::SendTransaction, tx.to_json()?))
    }

    pub fn prune_messages(cutoff_millis: i64) -> Self {
        Self::new(FrameType::PruneMessages, cutoff_millis.to_string())
    }

    pub fn delete_message(message_id: &str) -> Self {
        Self::new(FrameType::DeleteMessage, message_id)
    }

    pub fn sync_request() -> Self {
        Self::new(FrameType::SyncRequest, "")
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn parse(text: &str) -> Result<Self, FrameError> {
        Ok(serde_json::from_str(text)?)
    }
}

// ---------------------------------------------------------------------------
// Inbound payloads
// ---------------------------------------------------------------------------

/// Payload of `TRANSACTION_CONFIRMED`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub transaction_id: String,
    pub block_number: u64,
    /// Some nodes echo the hash; used when the transaction is not in the pool
    pub transaction_hash: Option<String>,
}

impl Confirmation {
    pub fn parse(data: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(data)?;
        let transaction_id = str_field(&value, "transactionId");
        if transaction_id.is_empty() {
            return Err(FrameError::InvalidPayload {
                frame: FrameType::TransactionConfirmed.as_str(),
                reason: "missing transactionId".to_string(),
            });
        }

        let transaction_hash = Some(str_field(&value, "transactionHash")).filter(|h| !h.is_empty());

        Ok(Self {
            transaction_id,
            block_number: u64_field(&value, "blockNumber"),
            transaction_hash,
        })
    }
}

/// Payload of `CONSENSUS_UPDATE`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsensusUpdate {
    pub height: u64,
    pub hash: String,
    pub peer_count: u32,
    pub timestamp: i64,
}

impl ConsensusUpdate {
    /// Never fails: unparseable input yields a zeroed update.
    pub fn parse_lenient(data: &str) -> Self {
        let value = serde_json::from_str::<Value>(data).unwrap_or(Value::Null);
        Self {
            height: u64_field(&value, "height"),
            hash: str_field(&value, "hash"),
            peer_count: u64_field(&value, "peers").min(u32::MAX as u64) as u32,
            timestamp: i64_field(&value, "timestamp"),
        }
    }
}

/// Payload of `NETWORK_STATUS`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkStatusUpdate {
    pub block_height: u64,
    pub peer_count: u32,
}

impl NetworkStatusUpdate {
    pub fn parse_lenient(data: &str) -> Self {
        let value = serde_json::from_str::<Value>(data).unwrap_or(Value::Null);
        let peers = match u64_field(&value, "peerCount") {
            0 => u64_field(&value, "peers"),
            n => n,
        };
        Self {
            block_height: u64_field(&value, "blockHeight"),
            peer_count: peers.min(u32::MAX as u64) as u32,
        }
    }
}

fn str_field(value: &Value, key: &str) -> String {
    match value.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn u64_field(value: &Value, key: &str) -> u64 {
    match value.get(key) {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

fn i64_field(value: &Value, key: &str) -> i64 {
    match value.get(key) {
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

// ---------------------------------------------------------------------------
// Blocks
// ---------------------------------------------------------------------------

/// A block as received from the node. The client only validates it; it never
/// produces blocks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub height: u64,
    pub hash: String,
    pub previous_hash: String,
    pub timestamp: i64,
    pub transactions: Vec<Transaction>,
    pub merkle_root: String,
    pub nonce: u64,
    pub difficulty: u32,
}

impl Block {
    /// Base64(SHA-256(previousHash || timestamp || merkleRoot || nonce)),
    /// numbers rendered in decimal.
    pub fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.previous_hash.as_bytes());
        hasher.update(self.timestamp.to_string().as_bytes());
        hasher.update(self.merkle_root.as_bytes());
        hasher.update(self.nonce.to_string().as_bytes());
        STANDARD.encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_shape() {
        let frame = Frame::prune_messages(1_700_000_000_000);
        let value: Value = serde_json::from_str(&frame.to_text().unwrap()).unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj.len(), 3);
        assert_eq!(obj["type"], "PRUNE_MESSAGES");
        assert_eq!(obj["data"], "1700000000000");
        assert!(obj["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_sync_request_has_empty_data() {
        let frame = Frame::sync_request();
        assert_eq!(frame.frame_type, FrameType::SyncRequest);
        assert!(frame.data.is_empty());
    }

    #[test]
    fn test_unknown_frame_type() {
        let frame = Frame::parse(r#"{"type":"PEER_GOSSIP","data":"x","timestamp":1}"#).unwrap();
        assert_eq!(frame.frame_type, FrameType::Unknown);
    }

    #[test]
    fn test_malformed_frame() {
        let err = Frame::parse("not json").unwrap_err();
        assert!(matches!(err, FrameError::Malformed(_)));
    }

    #[test]
    fn test_confirmation_parse() {
        let c = Confirmation::parse(r#"{"transactionId":"t1","blockNumber":42}"#).unwrap();
        assert_eq!(c.transaction_id, "t1");
        assert_eq!(c.block_number, 42);
        assert!(c.transaction_hash.is_none());

        let c = Confirmation::parse(r#"{"blockNumber":"7","transactionId":"t2","transactionHash":"h"}"#)
            .unwrap();
        assert_eq!(c.block_number, 7);
        assert_eq!(c.transaction_hash.as_deref(), Some("h"));
    }

    #[test]
    fn test_confirmation_requires_id() {
        let err = Confirmation::parse(r#"{"blockNumber":42}"#).unwrap_err();
        assert!(matches!(err, FrameError::InvalidPayload { .. }));
    }

    #[test]
    fn test_consensus_update_lenient() {
        let update = ConsensusUpdate::parse_lenient(r#"{"height":12,"hash":"abc","peers":5}"#);
        assert_eq!(update.height, 12);
        assert_eq!(update.hash, "abc");
        assert_eq!(update.peer_count, 5);
        assert_eq!(update.timestamp, 0);

        assert_eq!(ConsensusUpdate::parse_lenient("{{garbage"), ConsensusUpdate::default());
        let update = ConsensusUpdate::parse_lenient(r#"{"height":"nope","hash":3}"#);
        assert_eq!(update.height, 0);
        assert_eq!(update.hash, "3");
    }

    #[test]
    fn test_network_status_lenient() {
        let update = NetworkStatusUpdate::parse_lenient(r#"{"blockHeight":100,"peerCount":8}"#);
        assert_eq!(update.block_height, 100);
        assert_eq!(update.peer_count, 8);
        assert_eq!(NetworkStatusUpdate::parse_lenient(""), NetworkStatusUpdate::default());
    }

    #[test]
    fn test_block_hash_depends_on_every_input() {
        let block = Block {
            height: 1,
            hash: String::new(),
            previous_hash: "prev".into(),
            timestamp: 1000,
            transactions: Vec::new(),
            merkle_root: "root".into(),
            nonce: 9,
            difficulty: 2,
        };
        let base = block.compute_hash();
        assert_eq!(base, block.compute_hash());

        let mut other = block.clone();
        other.nonce = 10;
        assert_ne!(base, other.compute_hash());

        let mut other = block.clone();
        other.merkle_root = "root2".into();
        assert_ne!(base, other.compute_hash());

        // 32-byte digest -> 44 Base64 chars
        assert_eq!(base.len(), 44);
    }
}
