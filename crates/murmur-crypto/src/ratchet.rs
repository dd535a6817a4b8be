//! Double Ratchet session state.
//!
//! Two mechanisms advance the keys:
//!
//! - **Symmetric step**, on every message: the chain key yields a single-use
//!   message key and its own successor through two domain-separated one-way
//!   derivations. Knowing a message key never yields the next chain key, and
//!   a chain key only moves forward.
//! - **DH step**, on observing a remote ratchet key we have not seen: the DH
//!   result is mixed into the root key and a fresh receive chain is derived;
//!   our own send chain is discarded so the next outgoing message rotates our
//!   ratchet key too. Counters reset per chain. The root key changes only
//!   here.
//!
//! Messages that arrive out of order are served from a bounded cache of
//! skipped message keys; a successful decrypt commits state atomically —
//! a failed one leaves the session exactly as it was.

use std::collections::HashMap;

use hkdf::Hkdf;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::codec;
use crate::error::CryptoError;
use crate::secret::SecretKey;
use crate::x3dh::SessionKeys;

/// Default bound on cached skipped message keys per session.
pub const DEFAULT_MAX_SKIP: u32 = 1000;

const INFO_ROOT_NEXT: &[u8] = b"murmur-ratchet-root-v1";
const INFO_ROOT_CHAIN: &[u8] = b"murmur-ratchet-chain-v1";
const INFO_CHAIN_NEXT: &[u8] = b"murmur-chain-key-v1";
const INFO_CHAIN_MSG: &[u8] = b"murmur-message-key-v1";

/// Cleartext header carried by every ratcheted message and bound to the
/// ciphertext as AEAD associated data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Sender's current DH ratchet public key.
    pub ratchet_key: [u8; 32],
    /// Number of messages in the sender's previous sending chain.
    pub previous_counter: u32,
    /// Message index in the sender's current sending chain.
    pub counter: u32,
}

impl MessageHeader {
    /// Canonical byte form used as associated data.
    pub fn aad(&self) -> [u8; 40] {
        let mut out = [0u8; 40];
        out[..32].copy_from_slice(&self.ratchet_key);
        out[32..36].copy_from_slice(&self.previous_counter.to_le_bytes());
        out[36..].copy_from_slice(&self.counter.to_le_bytes());
        out
    }
}

/// One sealed message as produced by the ratchet.
#[derive(Debug, Clone)]
pub struct RatchetMessage {
    pub header: MessageHeader,
    pub ciphertext: Vec<u8>,
    pub auth_tag: Vec<u8>,
}

/// Serializable form of a session's ratchet state.
///
/// Contains live secrets; callers persist it only through an encrypting
/// storage backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatchetSnapshot {
    pub dh_secret: [u8; 32],
    pub dh_remote: Option<[u8; 32]>,
    pub root_key: [u8; 32],
    pub send_chain: Option<[u8; 32]>,
    pub recv_chain: Option<[u8; 32]>,
    pub send_counter: u32,
    pub recv_counter: u32,
    pub previous_counter: u32,
    pub skipped: Vec<SkippedKeyRecord>,
    pub max_skip: u32,
}

/// A cached message key for a message that has not arrived yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedKeyRecord {
    pub ratchet_key: [u8; 32],
    pub counter: u32,
    pub message_key: [u8; 32],
}

/// Double Ratchet state for one peer session.
#[derive(Clone)]
pub struct RatchetState {
    dh_secret: StaticSecret,
    dh_public: X25519Public,
    dh_remote: Option<X25519Public>,
    root_key: SecretKey,
    send_chain: Option<SecretKey>,
    recv_chain: Option<SecretKey>,
    send_counter: u32,
    recv_counter: u32,
    previous_counter: u32,
    skipped: HashMap<([u8; 32], u32), SecretKey>,
    max_skip: u32,
}

impl RatchetState {
    /// Initiator-side construction from a completed X3DH handshake.
    ///
    /// The handshake ephemeral becomes our first ratchet key; the peer's
    /// signed prekey is the remote ratchet key until they rotate.
    pub fn init_initiator(
        keys: SessionKeys,
        ephemeral_secret: StaticSecret,
        remote_signed_prekey: [u8; 32],
        max_skip: u32,
    ) -> Self {
        let dh_public = X25519Public::from(&ephemeral_secret);
        Self {
            dh_secret: ephemeral_secret,
            dh_public,
            dh_remote: Some(X25519Public::from(remote_signed_prekey)),
            root_key: keys.root_key,
            send_chain: Some(keys.chain_key),
            recv_chain: None,
            send_counter: 0,
            recv_counter: 0,
            previous_counter: 0,
            skipped: HashMap::new(),
            max_skip,
        }
    }

    /// Responder-side construction. Our signed prekey doubles as the initial
    /// ratchet key pair; the send chain starts empty so our first reply
    /// performs a DH step and rotates away from the long-lived prekey.
    pub fn init_responder(
        keys: SessionKeys,
        signed_prekey_secret: StaticSecret,
        their_ephemeral: [u8; 32],
        max_skip: u32,
    ) -> Self {
        let dh_public = X25519Public::from(&signed_prekey_secret);
        Self {
            dh_secret: signed_prekey_secret,
            dh_public,
            dh_remote: Some(X25519Public::from(their_ephemeral)),
            root_key: keys.root_key,
            send_chain: None,
            recv_chain: Some(keys.chain_key),
            send_counter: 0,
            recv_counter: 0,
            previous_counter: 0,
            skipped: HashMap::new(),
            max_skip,
        }
    }

    /// Our current ratchet public key, as it appears in outgoing headers.
    pub fn ratchet_key(&self) -> [u8; 32] {
        self.dh_public.to_bytes()
    }

    /// Seal a message, advancing the send chain by one step.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<RatchetMessage, CryptoError> {
        let mut next = self.clone();
        let message = next.encrypt_uncommitted(plaintext)?;
        *self = next;
        Ok(message)
    }

    /// Open a message, advancing or re-keying the receive chain as the
    /// header demands. No state survives a failed attempt.
    pub fn decrypt(
        &mut self,
        header: &MessageHeader,
        ciphertext: &[u8],
        auth_tag: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        // A cached key means this counter was skipped earlier; consume it
        // only on success.
        let cache_slot = (header.ratchet_key, header.counter);
        if let Some(message_key) = self.skipped.get(&cache_slot) {
            let plaintext =
                codec::open(message_key, header.counter, &header.aad(), ciphertext, auth_tag)?;
            self.skipped.remove(&cache_slot);
            return Ok(plaintext);
        }

        let mut next = self.clone();
        let plaintext = next.decrypt_uncommitted(header, ciphertext, auth_tag)?;
        *self = next;
        Ok(plaintext)
    }

    /// Export the full state for persistence.
    pub fn snapshot(&self) -> RatchetSnapshot {
        RatchetSnapshot {
            dh_secret: self.dh_secret.to_bytes(),
            dh_remote: self.dh_remote.map(|k| k.to_bytes()),
            root_key: *self.root_key.as_bytes(),
            send_chain: self.send_chain.as_ref().map(|k| *k.as_bytes()),
            recv_chain: self.recv_chain.as_ref().map(|k| *k.as_bytes()),
            send_counter: self.send_counter,
            recv_counter: self.recv_counter,
            previous_counter: self.previous_counter,
            skipped: self
                .skipped
                .iter()
                .map(|((ratchet_key, counter), mk)| SkippedKeyRecord {
                    ratchet_key: *ratchet_key,
                    counter: *counter,
                    message_key: *mk.as_bytes(),
                })
                .collect(),
            max_skip: self.max_skip,
        }
    }

    /// Rebuild a session from a snapshot.
    pub fn restore(snapshot: RatchetSnapshot) -> Self {
        let dh_secret = StaticSecret::from(snapshot.dh_secret);
        let dh_public = X25519Public::from(&dh_secret);
        Self {
            dh_secret,
            dh_public,
            dh_remote: snapshot.dh_remote.map(X25519Public::from),
            root_key: SecretKey::new(snapshot.root_key),
            send_chain: snapshot.send_chain.map(SecretKey::new),
            recv_chain: snapshot.recv_chain.map(SecretKey::new),
            send_counter: snapshot.send_counter,
            recv_counter: snapshot.recv_counter,
            previous_counter: snapshot.previous_counter,
            skipped: snapshot
                .skipped
                .into_iter()
                .map(|rec| {
                    (
                        (rec.ratchet_key, rec.counter),
                        SecretKey::new(rec.message_key),
                    )
                })
                .collect(),
            max_skip: snapshot.max_skip,
        }
    }

    fn encrypt_uncommitted(&mut self, plaintext: &[u8]) -> Result<RatchetMessage, CryptoError> {
        if self.send_chain.is_none() {
            self.dh_step_send()?;
        }
        let chain = self
            .send_chain
            .as_ref()
            .ok_or_else(|| CryptoError::Ratchet("no sending chain".into()))?;

        let (next_chain, message_key) = kdf_chain(chain);
        let header = MessageHeader {
            ratchet_key: self.dh_public.to_bytes(),
            previous_counter: self.previous_counter,
            counter: self.send_counter,
        };

        let (ciphertext, auth_tag) =
            codec::seal(&message_key, header.counter, &header.aad(), plaintext)?;

        self.send_chain = Some(next_chain);
        self.send_counter += 1;

        Ok(RatchetMessage {
            header,
            ciphertext,
            auth_tag,
        })
    }

    fn decrypt_uncommitted(
        &mut self,
        header: &MessageHeader,
        ciphertext: &[u8],
        auth_tag: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let new_remote = match self.dh_remote {
            Some(current) => current.to_bytes() != header.ratchet_key,
            None => true,
        };

        if new_remote {
            // Cache the tail of the old chain before re-keying.
            if self.recv_chain.is_some() {
                self.skip_to(header.previous_counter)?;
            }
            self.dh_step_recv(header.ratchet_key)?;
        } else if header.counter < self.recv_counter {
            // Already consumed on the live chain and absent from the skipped
            // cache: replay or desynchronization.
            return Err(CryptoError::CounterRegression);
        }

        self.skip_to(header.counter)?;

        let chain = self
            .recv_chain
            .as_ref()
            .ok_or_else(|| CryptoError::Ratchet("no receiving chain".into()))?;
        let (next_chain, message_key) = kdf_chain(chain);

        let plaintext =
            codec::open(&message_key, header.counter, &header.aad(), ciphertext, auth_tag)?;

        self.recv_chain = Some(next_chain);
        self.recv_counter = header.counter + 1;
        Ok(plaintext)
    }

    /// DH step for the sending direction: fresh ratchet pair, root mix-in,
    /// new send chain, counter reset.
    fn dh_step_send(&mut self) -> Result<(), CryptoError> {
        let remote = self
            .dh_remote
            .ok_or_else(|| CryptoError::Ratchet("no remote ratchet key".into()))?;

        let new_secret = StaticSecret::random_from_rng(OsRng);
        let new_public = X25519Public::from(&new_secret);
        let dh = new_secret.diffie_hellman(&remote);

        let (new_root, new_chain) = kdf_root(&self.root_key, dh.as_bytes());
        self.root_key = new_root;
        self.send_chain = Some(new_chain);
        self.previous_counter = self.send_counter;
        self.send_counter = 0;
        self.dh_secret = new_secret;
        self.dh_public = new_public;

        tracing::debug!("dh ratchet step (send)");
        Ok(())
    }

    /// DH step for the receiving direction, triggered by a new remote key.
    /// Discards our send chain so the next outgoing message rotates too —
    /// this is what gives break-in recovery.
    fn dh_step_recv(&mut self, remote: [u8; 32]) -> Result<(), CryptoError> {
        let remote = X25519Public::from(remote);
        let dh = self.dh_secret.diffie_hellman(&remote);

        let (new_root, new_chain) = kdf_root(&self.root_key, dh.as_bytes());
        self.root_key = new_root;
        self.recv_chain = Some(new_chain);
        self.dh_remote = Some(remote);
        self.recv_counter = 0;
        self.send_chain = None;

        tracing::debug!("dh ratchet step (recv)");
        Ok(())
    }

    /// Advance the receive chain to `until`, caching each skipped message
    /// key for later out-of-order delivery.
    fn skip_to(&mut self, until: u32) -> Result<(), CryptoError> {
        if self.recv_counter >= until {
            return Ok(());
        }
        let Some(mut chain) = self.recv_chain.clone() else {
            return Err(CryptoError::Ratchet("no receiving chain to skip".into()));
        };
        if until - self.recv_counter > self.max_skip {
            return Err(CryptoError::Ratchet(format!(
                "skip window exceeded ({} > {})",
                until - self.recv_counter,
                self.max_skip
            )));
        }
        let remote = self
            .dh_remote
            .ok_or_else(|| CryptoError::Ratchet("no remote ratchet key".into()))?
            .to_bytes();

        while self.recv_counter < until {
            let (next_chain, message_key) = kdf_chain(&chain);
            self.skipped.insert((remote, self.recv_counter), message_key);
            chain = next_chain;
            self.recv_counter += 1;
        }
        self.recv_chain = Some(chain);

        // Bound the cache: lowest counters are discarded first once over the
        // limit.
        while self.skipped.len() > self.max_skip as usize {
            let Some(slot) = self
                .skipped
                .keys()
                .min_by_key(|&&(key, counter)| (counter, key))
                .copied()
            else {
                break;
            };
            self.skipped.remove(&slot);
        }
        Ok(())
    }
}

impl std::fmt::Debug for RatchetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RatchetState")
            .field("send_counter", &self.send_counter)
            .field("recv_counter", &self.recv_counter)
            .field("skipped", &self.skipped.len())
            .finish_non_exhaustive()
    }
}

/// Root KDF: mix a DH result into the root key, yielding the next root key
/// and a fresh chain key.
fn kdf_root(root_key: &SecretKey, dh_output: &[u8]) -> (SecretKey, SecretKey) {
    let hk = Hkdf::<Sha256>::new(Some(root_key.as_bytes()), dh_output);
    let mut next_root = [0u8; 32];
    let mut chain = [0u8; 32];
    hk.expand(INFO_ROOT_NEXT, &mut next_root)
        .expect("32-byte output is a valid HKDF-SHA256 length");
    hk.expand(INFO_ROOT_CHAIN, &mut chain)
        .expect("32-byte output is a valid HKDF-SHA256 length");
    (SecretKey::new(next_root), SecretKey::new(chain))
}

/// Chain KDF: one-way advance producing the successor chain key and the
/// single-use message key, under distinct domain separators.
fn kdf_chain(chain_key: &SecretKey) -> (SecretKey, SecretKey) {
    let hk = Hkdf::<Sha256>::new(None, chain_key.as_bytes());
    let mut next_chain = [0u8; 32];
    let mut message_key = [0u8; 32];
    hk.expand(INFO_CHAIN_NEXT, &mut next_chain)
        .expect("32-byte output is a valid HKDF-SHA256 length");
    hk.expand(INFO_CHAIN_MSG, &mut message_key)
        .expect("32-byte output is a valid HKDF-SHA256 length");
    (SecretKey::new(next_chain), SecretKey::new(message_key))
}
