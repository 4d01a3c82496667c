//! Transaction signing and verification.
//!
//! The canonical payload is the plain concatenation of id, sender,
//! recipient, ciphertext, content type, timestamp and nonce (numbers in
//! decimal). It is signed with ECDSA over SHA-256 on secp256k1; the DER
//! signature is stored Base64-encoded. The transaction hash is
//! Base64(SHA-256(payload || signature)), where the signature is taken in
//! its Base64 form.

use base64::{engine::general_purpose::STANDARD, Engine};
use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::error::SigningError;
use crate::identity::IdentityProvider;
use crate::transaction::Transaction;

/// Stateless signer. Every call takes the key explicitly so that the caller
/// decides where keys come from.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransactionSigner;

impl TransactionSigner {
    pub fn new() -> Self {
        Self
    }

    /// Return a signed copy of `tx` with `signature` and `transaction_hash` set.
    pub fn sign(&self, tx: &Transaction, key: &SigningKey) -> Result<Transaction, SigningError> {
        let payload = canonical_payload(tx);
        let signature: Signature = key
            .try_sign(&payload)
            .map_err(|e| SigningError::SignatureFailed(e.to_string()))?;
        let signature_b64 = STANDARD.encode(signature.to_der().as_bytes());

        let mut signed = tx.clone();
        signed.transaction_hash = transaction_hash(&payload, &signature_b64);
        signed.signature = signature_b64;
        Ok(signed)
    }

    /// Sign with the key currently exposed by an identity provider.
    pub fn sign_with(
        &self,
        tx: &Transaction,
        identity: &dyn IdentityProvider,
    ) -> Result<Transaction, SigningError> {
        let key = identity.signing_key()?;
        self.sign(tx, &key)
    }

    /// Check the signature of `tx` against a SEC1-encoded public key.
    ///
    /// Any failure (bad key bytes, bad Base64, bad DER, wrong key) is `false`.
    pub fn verify(&self, tx: &Transaction, public_key: &[u8]) -> bool {
        let Ok(verifying_key) = VerifyingKey::from_sec1_bytes(public_key) else {
            return false;
        };
        let Ok(raw) = STANDARD.decode(tx.signature.as_bytes()) else {
            return false;
        };
        let Ok(signature) = Signature::from_der(&raw).or_else(|_| Signature::from_slice(&raw))
        else {
            return false;
        };

        let mut unsigned = tx.clone();
        unsigned.signature.clear();
        verifying_key
            .verify(&canonical_payload(&unsigned), &signature)
            .is_ok()
    }
}

/// Ordered concatenation of the signed fields
pub fn canonical_payload(tx: &Transaction) -> Vec<u8> {
    let created_at = tx.created_at.to_string();
    let nonce = tx.nonce.to_string();

    let mut payload = Vec::with_capacity(
        tx.id.len()
            + tx.sender_id.len()
            + tx.recipient_id.len()
            + tx.encrypted_content.len()
            + tx.content_type.len()
            + created_at.len()
            + nonce.len(),
    );
    payload.extend_from_slice(tx.id.as_bytes());
    payload.extend_from_slice(tx.sender_id.as_bytes());
    payload.extend_from_slice(tx.recipient_id.as_bytes());
    payload.extend_from_slice(&tx.encrypted_content);
    payload.extend_from_slice(tx.content_type.as_bytes());
    payload.extend_from_slice(created_at.as_bytes());
    payload.extend_from_slice(nonce.as_bytes());
    payload
}

fn transaction_hash(payload: &[u8], signature_b64: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.update(signature_b64.as_bytes());
    STANDARD.encode(hasher.finalize())
}
