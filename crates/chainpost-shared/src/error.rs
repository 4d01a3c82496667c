use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Connection handshake timed out")]
    HandshakeTimeout,

    #[error("Not connected to a node")]
    NotConnected,

    #[error("No previously known node address")]
    NoKnownNode,

    #[error("Signing error: {0}")]
    Signing(#[from] SigningError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

#[derive(Error, Debug)]
pub enum SigningError {
    #[error("Invalid signing key: {0}")]
    InvalidKey(String),

    #[error("Signature generation failed: {0}")]
    SignatureFailed(String),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),
}

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Invalid key bytes")]
    InvalidKeyBytes,

    #[error("No node address configured for this identity")]
    NoNodeAddress,
}

/// Errors raised while handling a single inbound frame. They never escape
/// the dispatch loop.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Invalid {frame} payload: {reason}")]
    InvalidPayload { frame: &'static str, reason: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Block contains no transactions")]
    EmptyTransactions,

    #[error("Block hash does not match its contents")]
    HashMismatch,

    #[error("Transaction {index} is invalid: {reason}")]
    InvalidTransaction { index: usize, reason: &'static str },
}
