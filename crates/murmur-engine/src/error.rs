use murmur_crypto::CryptoError;
use thiserror::Error;

/// Engine-level failures, wrapping the cryptographic taxonomy and adding the
/// session-table and boundary concerns the crypto crate knows nothing about.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("key directory: {0}")]
    Directory(String),

    #[error("no session with {0}")]
    NoSession(String),

    #[error("session with {0} is invalidated")]
    SessionInvalidated(String),

    #[error("malformed envelope: {0}")]
    Envelope(String),

    #[error("persistence: {0}")]
    Persistence(String),
}
