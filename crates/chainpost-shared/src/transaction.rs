use chrono::{DateTime, TimeZone, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// One outbound encrypted message. Immutable once signed: the signer returns
/// a new value instead of mutating in place.
///
/// The serde field names are the wire names used by the node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    pub id: String,
    #[serde(rename = "from")]
    pub sender_id: String,
    #[serde(rename = "to")]
    pub recipient_id: String,
    /// Ciphertext from the upstream encryption layer, Base64 on the wire
    #[serde(rename = "encryptedContent", with = "base64_bytes")]
    pub encrypted_content: Vec<u8>,
    #[serde(rename = "messageType")]
    pub content_type: String,
    /// Creation time in epoch milliseconds
    #[serde(rename = "timestamp")]
    pub created_at: i64,
    pub nonce: u64,
    #[serde(default)]
    pub signature: String,
    #[serde(rename = "gasUsed", default)]
    pub gas_used: u64,
    #[serde(rename = "blockNumber", default)]
    pub confirmed_block_height: u64,
    #[serde(rename = "transactionHash", default)]
    pub transaction_hash: String,
}

impl Transaction {
    /// Build an unsigned transaction from a send request.
    pub fn from_request(request: TransactionRequest, sender_id: impl Into<String>) -> Self {
        Self {
            id: request.id,
            sender_id: sender_id.into(),
            recipient_id: request.recipient_id,
            encrypted_content: request.encrypted_content,
            content_type: request.content_type,
            created_at: Utc::now().timestamp_millis(),
            nonce: rand::rngs::OsRng.next_u64(),
            signature: String::new(),
            gas_used: 0,
            confirmed_block_height: 0,
            transaction_hash: String::new(),
        }
    }

    pub fn is_signed(&self) -> bool {
        !self.signature.is_empty() && !self.transaction_hash.is_empty()
    }

    pub fn created_at_time(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.created_at)
            .single()
            .unwrap_or_default()
    }

    /// Serialize to the JSON object carried inside `SEND_TRANSACTION` and
    /// `NEW_MESSAGE` frames.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }
}

/// What the presentation layer hands over when it wants to send a message.
/// The recipient is always explicit; this layer never inspects the
/// ciphertext to find it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRequest {
    pub id: String,
    pub recipient_id: String,
    pub encrypted_content: Vec<u8>,
    pub content_type: String,
}

impl TransactionRequest {
    pub fn new(
        recipient_id: impl Into<String>,
        encrypted_content: impl Into<Vec<u8>>,
        content_type: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            recipient_id: recipient_id.into(),
            encrypted_content: encrypted_content.into(),
            content_type: content_type.into(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
