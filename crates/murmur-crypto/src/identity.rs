use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;

/// A device's long-term identity key pair.
///
/// Created once at registration and never rotated; destroyed only when the
/// account is deleted. The Ed25519 public key is the device's address and the
/// key that signs published prekeys. The same key material, converted to
/// X25519, performs the identity legs of the X3DH handshake.
#[derive(ZeroizeOnDrop)]
pub struct IdentityKeyPair {
    signing_key: SigningKey,
}

impl IdentityKeyPair {
    /// Generate a fresh identity.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Restore an identity from its 32-byte secret seed.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    /// The secret seed, for persistence by the caller's key store.
    pub fn secret_bytes(&self) -> &[u8; 32] {
        self.signing_key.as_bytes()
    }

    /// Public identity key (Ed25519), as published in bundles.
    pub fn public_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Public identity key as a hex address for display and lookup.
    pub fn address(&self) -> String {
        hex::encode(self.public_bytes())
    }

    /// Sign arbitrary bytes (used to sign prekey public keys).
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Verify an Ed25519 signature against a raw public key.
    pub fn verify(
        public_key_bytes: &[u8; 32],
        message: &[u8],
        signature: &Signature,
    ) -> Result<(), CryptoError> {
        let key = VerifyingKey::from_bytes(public_key_bytes)
            .map_err(|e| CryptoError::InvalidKey(format!("bad Ed25519 public key: {e}")))?;
        key.verify(message, signature)
            .map_err(|e| CryptoError::Handshake(format!("signature verification failed: {e}")))
    }

    /// X25519 static secret for Diffie-Hellman.
    ///
    /// Uses the SHA-512-expanded scalar (the scalar Ed25519 signs with) so
    /// that [`Self::dh_public`] agrees with [`Self::peer_dh_public`] through
    /// the standard Edwards→Montgomery map.
    pub fn to_dh_secret(&self) -> x25519_dalek::StaticSecret {
        x25519_dalek::StaticSecret::from(self.signing_key.to_scalar_bytes())
    }

    /// Our X25519 public key.
    pub fn dh_public(&self) -> x25519_dalek::PublicKey {
        x25519_dalek::PublicKey::from(&self.to_dh_secret())
    }

    /// Convert a peer's published Ed25519 identity key to its X25519 form
    /// (RFC 7748 birational map).
    pub fn peer_dh_public(
        ed25519_public: &[u8; 32],
    ) -> Result<x25519_dalek::PublicKey, CryptoError> {
        let verifying = VerifyingKey::from_bytes(ed25519_public)
            .map_err(|e| CryptoError::InvalidKey(format!("bad Ed25519 public key: {e}")))?;
        Ok(x25519_dalek::PublicKey::from(
            verifying.to_montgomery().to_bytes(),
        ))
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("address", &self.address())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let id = IdentityKeyPair::generate();
        let sig = id.sign(b"prekey bytes");
        assert!(IdentityKeyPair::verify(&id.public_bytes(), b"prekey bytes", &sig).is_ok());
        assert!(IdentityKeyPair::verify(&id.public_bytes(), b"other bytes", &sig).is_err());
    }

    #[test]
    fn secret_roundtrip() {
        let id = IdentityKeyPair::generate();
        let restored = IdentityKeyPair::from_secret_bytes(&id.secret_bytes().to_owned());
        assert_eq!(id.public_bytes(), restored.public_bytes());
    }

    #[test]
    fn peer_conversion_matches_own_derivation() {
        let id = IdentityKeyPair::generate();
        let from_secret = id.dh_public();
        let from_public = IdentityKeyPair::peer_dh_public(&id.public_bytes()).unwrap();
        assert_eq!(from_secret.as_bytes(), from_public.as_bytes());
    }

    #[test]
    fn dh_agreement_through_published_keys() {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();

        let a_shared = alice
            .to_dh_secret()
            .diffie_hellman(&IdentityKeyPair::peer_dh_public(&bob.public_bytes()).unwrap());
        let b_shared = bob
            .to_dh_secret()
            .diffie_hellman(&IdentityKeyPair::peer_dh_public(&alice.public_bytes()).unwrap());

        assert_eq!(a_shared.as_bytes(), b_shared.as_bytes());
    }
}
