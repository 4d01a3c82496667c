// Shared types, wire protocol and signing for the chainpost transaction layer.

pub mod constants;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod signing;
pub mod transaction;
pub mod types;

pub use error::{ChainError, FrameError, IdentityError, SigningError, ValidationError};
pub use identity::{IdentityProvider, LocalIdentity};
pub use protocol::{Block, Frame, FrameType};
pub use signing::TransactionSigner;
pub use transaction::{Transaction, TransactionRequest};
pub use types::{ConnectionState, NetworkStatus};
