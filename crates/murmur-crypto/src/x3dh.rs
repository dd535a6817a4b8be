//! X3DH key agreement.
//!
//! Derives a shared secret between two parties who have never been online
//! together, from the initiator's identity + a fresh ephemeral key against
//! the responder's published bundle. Up to four Diffie-Hellman legs are
//! computed in a fixed order:
//!
//! 1. initiator identity × responder signed prekey
//! 2. initiator ephemeral × responder identity
//! 3. initiator ephemeral × responder signed prekey
//! 4. initiator ephemeral × responder one-time prekey (if the bundle has one)
//!
//! When the bundle carries no one-time prekey the fourth leg is omitted from
//! the KDF input entirely — the input is 96 bytes instead of 128, a declared
//! protocol variant rather than implicit zero padding.

use ed25519_dalek::Signature;
use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::identity::IdentityKeyPair;
use crate::prekeys::PublicBundle;
use crate::secret::SecretKey;

const INFO_ROOT: &[u8] = b"murmur-x3dh-root-v1";
const INFO_CHAIN: &[u8] = b"murmur-x3dh-chain-v1";

/// Initial session secrets derived by both sides of the handshake.
///
/// `chain_key` seeds the initiator→responder message chain; the reverse
/// direction gets its chain from the first DH ratchet step.
pub struct SessionKeys {
    pub root_key: SecretKey,
    pub chain_key: SecretKey,
}

/// Initiator-side handshake result.
pub struct InitiatorHandshake {
    pub keys: SessionKeys,
    /// Our ephemeral key pair — becomes the initial DH ratchet key, and its
    /// public half rides on the first envelope so the responder can derive
    /// the same secret.
    pub ephemeral_secret: StaticSecret,
    pub ephemeral_public: X25519Public,
    /// Which one-time prekey the bundle carried, if any. `None` means the
    /// handshake ran in the degraded three-DH variant.
    pub used_one_time_id: Option<u32>,
}

/// Run X3DH as the initiator against a fetched bundle.
///
/// The signed prekey's signature is verified against the bundle's identity
/// key before any DH is computed; a bad signature aborts the handshake with
/// [`CryptoError::Handshake`] and no session material is produced.
pub fn initiate(
    identity: &IdentityKeyPair,
    bundle: &PublicBundle,
) -> Result<InitiatorHandshake, CryptoError> {
    let their_identity_ed = to_array32(&bundle.identity_key, "identity key")?;
    let spk_bytes = to_array32(&bundle.signed_prekey.public_key, "signed prekey")?;

    let signature = Signature::from_slice(&bundle.signed_prekey.signature)
        .map_err(|e| CryptoError::Handshake(format!("malformed prekey signature: {e}")))?;
    IdentityKeyPair::verify(&their_identity_ed, &spk_bytes, &signature)?;

    let ephemeral_secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
    let ephemeral_public = X25519Public::from(&ephemeral_secret);

    let their_identity = IdentityKeyPair::peer_dh_public(&their_identity_ed)?;
    let their_spk = X25519Public::from(spk_bytes);

    let dh1 = identity.to_dh_secret().diffie_hellman(&their_spk);
    let dh2 = ephemeral_secret.diffie_hellman(&their_identity);
    let dh3 = ephemeral_secret.diffie_hellman(&their_spk);

    let mut ikm = Vec::with_capacity(128);
    ikm.extend_from_slice(dh1.as_bytes());
    ikm.extend_from_slice(dh2.as_bytes());
    ikm.extend_from_slice(dh3.as_bytes());

    let used_one_time_id = match &bundle.one_time_prekey {
        Some(otpk) => {
            let their_otpk = X25519Public::from(to_array32(&otpk.public_key, "one-time prekey")?);
            let dh4 = ephemeral_secret.diffie_hellman(&their_otpk);
            ikm.extend_from_slice(dh4.as_bytes());
            Some(otpk.id)
        }
        None => None,
    };

    let keys = derive_session_keys(&mut ikm)?;
    Ok(InitiatorHandshake {
        keys,
        ephemeral_secret,
        ephemeral_public,
        used_one_time_id,
    })
}

/// Run X3DH as the responder, mirroring the initiator's DH pairing with our
/// private halves against their identity and embedded ephemeral keys.
pub fn respond(
    identity: &IdentityKeyPair,
    signed_prekey_secret: &StaticSecret,
    one_time_secret: Option<&StaticSecret>,
    their_identity_ed: &[u8; 32],
    their_ephemeral: &[u8; 32],
) -> Result<SessionKeys, CryptoError> {
    let their_identity = IdentityKeyPair::peer_dh_public(their_identity_ed)?;
    let their_ephemeral = X25519Public::from(*their_ephemeral);

    let dh1 = signed_prekey_secret.diffie_hellman(&their_identity);
    let dh2 = identity.to_dh_secret().diffie_hellman(&their_ephemeral);
    let dh3 = signed_prekey_secret.diffie_hellman(&their_ephemeral);

    let mut ikm = Vec::with_capacity(128);
    ikm.extend_from_slice(dh1.as_bytes());
    ikm.extend_from_slice(dh2.as_bytes());
    ikm.extend_from_slice(dh3.as_bytes());

    if let Some(otpk) = one_time_secret {
        let dh4 = otpk.diffie_hellman(&their_ephemeral);
        ikm.extend_from_slice(dh4.as_bytes());
    }

    derive_session_keys(&mut ikm)
}

fn derive_session_keys(ikm: &mut Vec<u8>) -> Result<SessionKeys, CryptoError> {
    let hk = Hkdf::<Sha256>::new(None, ikm);

    let mut root = [0u8; 32];
    hk.expand(INFO_ROOT, &mut root)
        .map_err(|e| CryptoError::KeyDerivation(format!("HKDF expand failed: {e}")))?;

    let mut chain = [0u8; 32];
    hk.expand(INFO_CHAIN, &mut chain)
        .map_err(|e| CryptoError::KeyDerivation(format!("HKDF expand failed: {e}")))?;

    ikm.zeroize();
    Ok(SessionKeys {
        root_key: SecretKey::new(root),
        chain_key: SecretKey::new(chain),
    })
}

fn to_array32(bytes: &[u8], what: &str) -> Result<[u8; 32], CryptoError> {
    <[u8; 32]>::try_from(bytes)
        .map_err(|_| CryptoError::Handshake(format!("{what} has wrong length ({})", bytes.len())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prekeys::PrekeyManager;

    fn bundle_for(mgr: &PrekeyManager, take_one_time: bool) -> PublicBundle {
        let publication = mgr.publication().unwrap();
        PublicBundle {
            identity_key: publication.identity_key,
            signed_prekey: publication.signed_prekey,
            one_time_prekey: if take_one_time {
                publication.one_time_prekeys.first().cloned()
            } else {
                None
            },
        }
    }

    #[test]
    fn both_sides_derive_the_same_keys() {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();
        let mut bob_prekeys = PrekeyManager::new(&bob).unwrap();
        bob_prekeys.generate_pool(2);

        let bundle = bundle_for(&bob_prekeys, true);
        let handshake = initiate(&alice, &bundle).unwrap();
        let otpk_id = handshake.used_one_time_id.unwrap();

        let spk_secret = bob_prekeys
            .signed_prekey_secret(bundle.signed_prekey.id)
            .unwrap()
            .clone();
        let otpk_secret = bob_prekeys.take_one_time_secret(otpk_id).unwrap();
        let keys = respond(
            &bob,
            &spk_secret,
            Some(&otpk_secret),
            &alice.public_bytes(),
            handshake.ephemeral_public.as_bytes(),
        )
        .unwrap();

        assert_eq!(handshake.keys.root_key, keys.root_key);
        assert_eq!(handshake.keys.chain_key, keys.chain_key);
    }

    #[test]
    fn degraded_handshake_without_one_time_prekey() {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();
        let bob_prekeys = PrekeyManager::new(&bob).unwrap();

        let bundle = bundle_for(&bob_prekeys, false);
        let handshake = initiate(&alice, &bundle).unwrap();
        assert!(handshake.used_one_time_id.is_none());

        let spk_secret = bob_prekeys
            .signed_prekey_secret(bundle.signed_prekey.id)
            .unwrap();
        let keys = respond(
            &bob,
            spk_secret,
            None,
            &alice.public_bytes(),
            handshake.ephemeral_public.as_bytes(),
        )
        .unwrap();

        assert_eq!(handshake.keys.root_key, keys.root_key);
    }

    #[test]
    fn omitted_fourth_leg_changes_the_secret() {
        // The three-DH and four-DH variants must never collide, so the
        // one-time term cannot be silently dropped by one side only.
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();
        let mut bob_prekeys = PrekeyManager::new(&bob).unwrap();
        bob_prekeys.generate_pool(1);

        let with = bundle_for(&bob_prekeys, true);
        let spk_secret = bob_prekeys
            .signed_prekey_secret(with.signed_prekey.id)
            .unwrap()
            .clone();
        let otpk_secret = bob_prekeys
            .take_one_time_secret(with.one_time_prekey.as_ref().unwrap().id)
            .unwrap();

        let handshake = initiate(&alice, &with).unwrap();
        let four = respond(
            &bob,
            &spk_secret,
            Some(&otpk_secret),
            &alice.public_bytes(),
            handshake.ephemeral_public.as_bytes(),
        )
        .unwrap();
        let three = respond(
            &bob,
            &spk_secret,
            None,
            &alice.public_bytes(),
            handshake.ephemeral_public.as_bytes(),
        )
        .unwrap();

        assert_eq!(handshake.keys.root_key, four.root_key);
        assert_ne!(four.root_key, three.root_key);
    }

    #[test]
    fn forged_signed_prekey_aborts_handshake() {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();
        let bob_prekeys = PrekeyManager::new(&bob).unwrap();

        let mut bundle = bundle_for(&bob_prekeys, false);
        bundle.signed_prekey.signature[0] ^= 0x01;

        let result = initiate(&alice, &bundle);
        assert!(matches!(result, Err(CryptoError::Handshake(_))));
    }

    #[test]
    fn substituted_signed_prekey_fails_verification() {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();
        let bob_prekeys = PrekeyManager::new(&bob).unwrap();

        let mut bundle = bundle_for(&bob_prekeys, false);
        // Attacker swaps in their own prekey but cannot re-sign it.
        let mallory = StaticSecret::random_from_rng(rand::rngs::OsRng);
        bundle.signed_prekey.public_key = X25519Public::from(&mallory).as_bytes().to_vec();

        assert!(matches!(
            initiate(&alice, &bundle),
            Err(CryptoError::Handshake(_))
        ));
    }
}
