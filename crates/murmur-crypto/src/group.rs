//! Symmetric group encryption.
//!
//! A group shares one AES-256-GCM key, distributed to each member over their
//! 1:1 ratchet session. Unlike per-message ratchet keys, the group key is
//! long-lived and used by every sender, so nonces are random rather than
//! counter-derived. The `generation` counter orders re-keys: after membership
//! changes the group owner mints a new generation and redistributes it.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng as AeadOsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::codec::TAG_LEN;
use crate::error::CryptoError;

const NONCE_LEN: usize = 12;

/// Wire form of a group key as carried inside a group invite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupKeyExport {
    pub generation: u64,
    pub key: [u8; 32],
}

/// A shared symmetric key for one group at one generation.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct GroupKey {
    generation: u64,
    key: [u8; 32],
}

impl GroupKey {
    /// Mint a fresh key at generation zero (new group).
    pub fn generate() -> Self {
        Self::next_generation(0)
    }

    /// Mint a fresh key at the given generation (re-key after membership
    /// change).
    pub fn next_generation(generation: u64) -> Self {
        let key = Aes256Gcm::generate_key(AeadOsRng);
        Self {
            generation,
            key: key.into(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Export for distribution through a 1:1 session.
    pub fn export(&self) -> GroupKeyExport {
        GroupKeyExport {
            generation: self.generation,
            key: self.key,
        }
    }

    /// Import a key received in a group invite.
    pub fn import(export: &GroupKeyExport) -> Self {
        Self {
            generation: export.generation,
            key: export.key,
        }
    }

    /// Encrypt a group message. The random nonce is prepended to the
    /// returned ciphertext; the tag is detached.
    pub fn seal(&self, aad: &[u8], plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

        let nonce = Aes256Gcm::generate_nonce(AeadOsRng);
        let mut sealed = cipher
            .encrypt(
                &nonce,
                aes_gcm::aead::Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|e| CryptoError::KeyDerivation(format!("encryption failed: {e}")))?;

        let tag = sealed.split_off(sealed.len() - TAG_LEN);
        let mut ciphertext = Vec::with_capacity(NONCE_LEN + sealed.len());
        ciphertext.extend_from_slice(&nonce);
        ciphertext.extend_from_slice(&sealed);
        Ok((ciphertext, tag))
    }

    /// Verify and decrypt a group message produced by [`Self::seal`].
    pub fn open(&self, aad: &[u8], ciphertext: &[u8], tag: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < NONCE_LEN || tag.len() != TAG_LEN {
            return Err(CryptoError::Authentication);
        }

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

        let nonce = Nonce::from_slice(&ciphertext[..NONCE_LEN]);
        let mut combined = Vec::with_capacity(ciphertext.len() - NONCE_LEN + TAG_LEN);
        combined.extend_from_slice(&ciphertext[NONCE_LEN..]);
        combined.extend_from_slice(tag);

        cipher
            .decrypt(
                nonce,
                aes_gcm::aead::Payload {
                    msg: &combined,
                    aad,
                },
            )
            .map_err(|_| CryptoError::Authentication)
    }
}

impl std::fmt::Debug for GroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupKey")
            .field("generation", &self.generation)
            .field("key", &"[redacted]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_holder_can_open() {
        let key = GroupKey::generate();
        let copy = GroupKey::import(&key.export());

        let (ct, tag) = key.seal(b"group-1", b"hello group").unwrap();
        assert_eq!(copy.open(b"group-1", &ct, &tag).unwrap(), b"hello group");
    }

    #[test]
    fn repeated_plaintext_differs_on_the_wire() {
        let key = GroupKey::generate();
        let (c1, _) = key.seal(b"g", b"same words").unwrap();
        let (c2, _) = key.seal(b"g", b"same words").unwrap();
        assert_ne!(c1, c2);
    }

    #[test]
    fn old_generation_cannot_open_new_messages() {
        let old = GroupKey::generate();
        let new = GroupKey::next_generation(old.generation() + 1);

        let (ct, tag) = new.seal(b"g", b"post-rekey").unwrap();
        assert!(matches!(
            old.open(b"g", &ct, &tag),
            Err(CryptoError::Authentication)
        ));
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let key = GroupKey::generate();
        let (mut ct, tag) = key.seal(b"g", b"payload").unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0x01;
        assert!(key.open(b"g", &ct, &tag).is_err());
    }

    #[test]
    fn mismatched_group_aad_is_rejected() {
        let key = GroupKey::generate();
        let (ct, tag) = key.seal(b"group-a", b"payload").unwrap();
        assert!(key.open(b"group-b", &ct, &tag).is_err());
    }
}
