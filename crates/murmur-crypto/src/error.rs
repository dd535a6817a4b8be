use thiserror::Error;

/// Errors produced by the cryptographic core.
///
/// Every failure is typed and returned to the caller; nothing is logged and
/// swallowed inside this crate.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("signing failed: {0}")]
    Signing(String),

    /// Missing or invalid bundle material, or signed-prekey signature failure.
    /// The handshake aborts and no session state is created.
    ///
    /// An exhausted one-time prekey pool is not an error: the handshake
    /// degrades to the three-DH variant and the engine surfaces the event
    /// through its session status and a warning log.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Ratchet cannot advance (no chain for this direction, skip window
    /// exceeded). The session itself is left intact.
    #[error("ratchet error: {0}")]
    Ratchet(String),

    /// A message counter moved backwards on a live chain with no cached key.
    /// Indicates replay or desynchronization; the session must be rebuilt.
    #[error("message counter regression detected")]
    CounterRegression,

    /// Authentication tag verification failed. No plaintext was produced and
    /// no session state was mutated.
    #[error("message authentication failed")]
    Authentication,

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
}
