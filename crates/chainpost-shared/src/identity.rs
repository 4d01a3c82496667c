use k256::ecdsa::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::error::IdentityError;

/// Source of the local user's identity and signing material.
///
/// The transaction layer asks for the key on every send, so implementations
/// backed by a keystore can rotate keys without restarting the client.
pub trait IdentityProvider: Send + Sync {
    /// Identifier used as `from` on outbound transactions and as the
    /// subscription key for inbound ones
    fn user_id(&self) -> String;

    /// secp256k1 key used for ECDSA/SHA-256 transaction signatures
    fn signing_key(&self) -> Result<SigningKey, IdentityError>;

    /// Node this user is homed on, if any
    fn node_address(&self) -> Option<String> {
        None
    }
}

/// An identity held entirely in memory.
#[derive(Clone)]
pub struct LocalIdentity {
    signing_key: SigningKey,
    user_id: String,
    node_address: Option<String>,
}

impl LocalIdentity {
    /// Generate a new random identity
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::random(&mut OsRng))
    }

    /// Restore identity from secret scalar bytes
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Result<Self, IdentityError> {
        let signing_key =
            SigningKey::from_slice(secret).map_err(|_| IdentityError::InvalidKeyBytes)?;
        Ok(Self::from_signing_key(signing_key))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let user_id = derive_user_id(signing_key.verifying_key());
        Self {
            signing_key,
            user_id,
            node_address: None,
        }
    }

    /// Override the derived user id (e.g. with an account id from the app)
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    pub fn with_node_address(mut self, address: impl Into<String>) -> Self {
        self.node_address = Some(address.into());
        self
    }

    /// SEC1 compressed public key
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.signing_key
            .verifying_key()
            .to_encoded_point(true)
            .as_bytes()
            .to_vec()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        *self.signing_key.verifying_key()
    }
}

impl IdentityProvider for LocalIdentity {
    fn user_id(&self) -> String {
        self.user_id.clone()
    }

    fn signing_key(&self) -> Result<SigningKey, IdentityError> {
        Ok(self.signing_key.clone())
    }

    fn node_address(&self) -> Option<String> {
        self.node_address.clone()
    }
}

/// Hex of the first 16 bytes of SHA-256 over the compressed public key
fn derive_user_id(key: &VerifyingKey) -> String {
    let digest = Sha256::digest(key.to_encoded_point(true).as_bytes());
    hex::encode(&digest[..16])
}
