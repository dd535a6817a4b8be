//! Authenticated message sealing.
//!
//! One construction, used everywhere: AES-256-GCM with the message header
//! bound as associated data. The GCM tag is the sole authenticator — there
//! is deliberately no second MAC over the ciphertext.
//!
//! The nonce is derived deterministically from the message counter. Each
//! message key is used exactly once by construction of the ratchet, so a
//! counter nonce is unique per key and carries no birthday-collision risk,
//! unlike a random nonce.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};

use crate::error::CryptoError;
use crate::secret::SecretKey;

/// AES-GCM authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

/// Encrypt `plaintext` under a single-use message key.
///
/// Returns the ciphertext and the detached authentication tag.
pub fn seal(
    key: &SecretKey,
    counter: u32,
    aad: &[u8],
    plaintext: &[u8],
) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

    let nonce_bytes = nonce_for(counter);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let mut combined = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| CryptoError::KeyDerivation(format!("encryption failed: {e}")))?;

    let tag = combined.split_off(combined.len() - TAG_LEN);
    Ok((combined, tag))
}

/// Verify and decrypt. Tag verification happens (in constant time, inside
/// GCM) before any plaintext is returned; failure yields
/// [`CryptoError::Authentication`] and nothing else.
pub fn open(
    key: &SecretKey,
    counter: u32,
    aad: &[u8],
    ciphertext: &[u8],
    tag: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if tag.len() != TAG_LEN {
        return Err(CryptoError::Authentication);
    }

    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

    let nonce_bytes = nonce_for(counter);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let mut combined = Vec::with_capacity(ciphertext.len() + TAG_LEN);
    combined.extend_from_slice(ciphertext);
    combined.extend_from_slice(tag);

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: &combined,
                aad,
            },
        )
        .map_err(|_| CryptoError::Authentication)
}

fn nonce_for(counter: u32) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&u64::from(counter).to_le_bytes());
    nonce
}
