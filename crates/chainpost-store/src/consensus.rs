//! Block validation and the rolling consensus view.
//!
//! This is a single-node client: it checks the blocks it is shown and
//! remembers the last heights the node reported, nothing more.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use chainpost_shared::constants::CONSENSUS_WINDOW;
use chainpost_shared::protocol::ConsensusUpdate;
use chainpost_shared::{Block, Transaction, ValidationError};

use crate::models::ConsensusRecord;

#[derive(Clone)]
pub struct ConsensusHandler {
    records: Arc<RwLock<BTreeMap<u64, ConsensusRecord>>>,
    window: usize,
}

impl ConsensusHandler {
    pub fn new() -> Self {
        Self::with_window(CONSENSUS_WINDOW)
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            records: Arc::new(RwLock::new(BTreeMap::new())),
            window: window.max(1),
        }
    }

    /// Structural and hash checks on a block. All must pass.
    pub fn check_block(&self, block: &Block) -> Result<(), ValidationError> {
        if block.transactions.is_empty() {
            return Err(ValidationError::EmptyTransactions);
        }
        if block.compute_hash() != block.hash {
            return Err(ValidationError::HashMismatch);
        }
        for (index, tx) in block.transactions.iter().enumerate() {
            check_transaction(tx).map_err(|reason| ValidationError::InvalidTransaction { index, reason })?;
        }
        Ok(())
    }

    /// `check_block` collapsed to a boolean; rejections are logged.
    pub fn validate_block(&self, block: &Block) -> bool {
        match self.check_block(block) {
            Ok(()) => true,
            Err(e) => {
                warn!(height = block.height, error = %e, "Rejected block");
                false
            }
        }
    }

    /// Record a consensus update from the node. Malformed input is stored
    /// with zeroed fields rather than rejected.
    pub async fn on_consensus_update(&self, raw: &str) -> ConsensusRecord {
        let update = ConsensusUpdate::parse_lenient(raw);
        let record = ConsensusRecord {
            height: update.height,
            hash: update.hash,
            peer_count: update.peer_count,
            timestamp: update.timestamp,
            confirmations: 1,
            received_at: Utc::now(),
        };

        let mut records = self.records.write().await;
        records.insert(record.height, record.clone());
        while records.len() > self.window {
            records.pop_first();
        }

        debug!(height = record.height, peers = record.peer_count, "Consensus updated");
        record
    }

    /// Copy of the rolling view, keyed `block_<height>`.
    pub async fn consensus_state(&self) -> HashMap<String, ConsensusRecord> {
        self.records
            .read()
            .await
            .iter()
            .map(|(height, record)| (format!("block_{height}"), record.clone()))
            .collect()
    }

    pub async fn latest_height(&self) -> Option<u64> {
        self.records.read().await.keys().next_back().copied()
    }
}

impl Default for ConsensusHandler {
    fn default() -> Self {
        Self::new()
    }
}

fn check_transaction(tx: &Transaction) -> Result<(), &'static str> {
    if tx.id.is_empty() {
        return Err("empty id");
    }
    if tx.sender_id.is_empty() {
        return Err("empty sender");
    }
    if tx.recipient_id.is_empty() {
        return Err("empty recipient");
    }
    if tx.signature.is_empty() {
        return Err("empty signature");
    }
    if tx.created_at <= 0 {
        return Err("non-positive timestamp");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainpost_shared::TransactionRequest;

    fn signed_tx(id: &str) -> Transaction {
        let mut tx = Transaction::from_request(
            TransactionRequest::new("u2", b"c1".to_vec(), "text").with_id(id),
            "u1",
        );
        tx.signature = "c2ln".to_string();
        tx
    }

    fn block(transactions: Vec<Transaction>) -> Block {
        let mut block = Block {
            height: 10,
            hash: String::new(),
            previous_hash: "prev".into(),
            timestamp: 1_700_000_000_000,
            transactions,
            merkle_root: "root".into(),
            nonce: 77,
            difficulty: 4,
        };
        block.hash = block.compute_hash();
        block
    }

    #[test]
    fn test_valid_block() {
        let handler = ConsensusHandler::new();
        assert!(handler.validate_block(&block(vec![signed_tx("t1")])));
    }

    #[test]
    fn test_empty_block_rejected() {
        let handler = ConsensusHandler::new();
        assert_eq!(
            handler.check_block(&block(Vec::new())),
            Err(ValidationError::EmptyTransactions)
        );
        assert!(!handler.validate_block(&block(Vec::new())));
    }

    #[test]
    fn test_tampered_hash_rejected() {
        let handler = ConsensusHandler::new();
        let mut b = block(vec![signed_tx("t1")]);
        b.hash = "AAAA".into();
        assert_eq!(handler.check_block(&b), Err(ValidationError::HashMismatch));

        let mut b = block(vec![signed_tx("t1")]);
        b.nonce += 1;
        assert!(!handler.validate_block(&b));
    }

    #[test]
    fn test_unsigned_transaction_rejected() {
        let handler = ConsensusHandler::new();
        let mut unsigned = signed_tx("t2");
        unsigned.signature.clear();
        let b = block(vec![signed_tx("t1"), unsigned]);
        assert_eq!(
            handler.check_block(&b),
            Err(ValidationError::InvalidTransaction {
                index: 1,
                reason: "empty signature"
            })
        );
    }

    #[test]
    fn test_structural_checks() {
        let handler = ConsensusHandler::new();
        let mut tx = signed_tx("t1");
        tx.created_at = 0;
        assert!(!handler.validate_block(&block(vec![tx])));

        let mut tx = signed_tx("t1");
        tx.recipient_id.clear();
        assert!(!handler.validate_block(&block(vec![tx])));
    }

    #[tokio::test]
    async fn test_consensus_update_overwrites_by_height() {
        let handler = ConsensusHandler::new();
        handler
            .on_consensus_update(r#"{"height":5,"hash":"a","peers":3}"#)
            .await;
        handler
            .on_consensus_update(r#"{"height":5,"hash":"b","peers":4}"#)
            .await;

        let state = handler.consensus_state().await;
        assert_eq!(state.len(), 1);
        let record = &state["block_5"];
        assert_eq!(record.hash, "b");
        assert_eq!(record.peer_count, 4);
        assert_eq!(record.confirmations, 1);
    }

    #[tokio::test]
    async fn test_malformed_update_degrades_to_defaults() {
        let handler = ConsensusHandler::new();
        let record = handler.on_consensus_update("<<not json>>").await;
        assert_eq!(record.height, 0);
        assert!(record.hash.is_empty());
        assert!(handler.consensus_state().await.contains_key("block_0"));
    }

    #[tokio::test]
    async fn test_window_evicts_lowest_heights() {
        let handler = ConsensusHandler::with_window(3);
        for height in 1..=5 {
            handler
                .on_consensus_update(&format!(r#"{{"height":{height},"hash":"h"}}"#))
                .await;
        }
        let state = handler.consensus_state().await;
        assert_eq!(state.len(), 3);
        assert!(!state.contains_key("block_2"));
        assert!(state.contains_key("block_3"));
        assert_eq!(handler.latest_height().await, Some(5));
    }
}
