//! Error types for Li24 operations

use crate::PartyId;
use thiserror::Error;

/// Result type alias for Li24 operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during protocol execution
///
/// Every error raised while a session is running is terminal for that
/// session; retrying means starting a new session with fresh randomness.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Invalid parameters at protocol start (threshold, party or signer set)
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// Malformed or misaddressed inbound message
    #[error("Invalid message from party {from}: {reason}")]
    MessageValidation { from: PartyId, reason: String },

    /// A secret share does not match its Feldman commitment
    #[error("Share from party {from} does not match its commitment")]
    ShareVerification { from: PartyId },

    /// The jointly computed signature does not verify
    #[error("Signature verification failed")]
    SignatureVerification,

    /// Encoding or decoding failure
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Cryptographic operation failed
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Key derivation error
    #[error("Key derivation error: {0}")]
    Derivation(String),

    /// Network/relay error
    #[error("Relay error: {0}")]
    Relay(String),

    /// Timeout waiting for a peer
    #[error("Timeout waiting for {0}")]
    Timeout(String),

    /// Input delivered to a session that already produced an output or aborted
    #[error("Session already terminated")]
    SessionTerminated,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub(crate) fn invalid_message(from: PartyId, reason: impl Into<String>) -> Self {
        Error::MessageValidation {
            from,
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::error::EncodeError> for Error {
    fn from(e: bincode::error::EncodeError) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for Error {
    fn from(e: bincode::error::DecodeError) -> Self {
        Error::Serialization(e.to_string())
    }
}
