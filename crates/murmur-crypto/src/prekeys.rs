//! Prekey generation and bundle management.
//!
//! A device publishes one signed prekey (rotated on an interval, with the
//! previous one kept loadable during the overlap) and a pool of one-time
//! prekeys. Each one-time prekey is handed out by the key directory at most
//! once and its private half here is consumed at most once — a hard
//! invariant, not a best-effort one.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::error::CryptoError;
use crate::identity::IdentityKeyPair;

/// Reference one-time prekey pool size.
pub const DEFAULT_POOL_SIZE: usize = 100;

/// How many superseded signed prekeys stay loadable for in-flight handshakes.
const SIGNED_PREKEY_OVERLAP: usize = 2;

/// Public half of a signed prekey, as published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPrekeyPublic {
    pub id: u32,
    /// X25519 public key (32 bytes).
    pub public_key: Vec<u8>,
    /// Ed25519 signature over `public_key` by the identity key.
    pub signature: Vec<u8>,
}

/// Public half of a one-time prekey.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneTimePrekeyPublic {
    pub id: u32,
    pub public_key: Vec<u8>,
}

/// The bundle a key directory serves to one fetcher.
///
/// `one_time_prekey` is absent once the directory's pool for this user is
/// exhausted; absence is a valid response, not an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicBundle {
    /// Ed25519 identity public key (32 bytes).
    pub identity_key: Vec<u8>,
    pub signed_prekey: SignedPrekeyPublic,
    pub one_time_prekey: Option<OneTimePrekeyPublic>,
}

/// Everything a device uploads to the key directory: the current signed
/// prekey plus the full one-time pool the directory will hand out one by one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundlePublication {
    pub identity_key: Vec<u8>,
    pub signed_prekey: SignedPrekeyPublic,
    pub one_time_prekeys: Vec<OneTimePrekeyPublic>,
}

struct SignedPrekey {
    id: u32,
    secret: StaticSecret,
    public: X25519Public,
    signature: Vec<u8>,
    created_at: u64,
}

struct OneTimePrekey {
    secret: StaticSecret,
    public: X25519Public,
}

/// Owns the private halves of a device's prekeys.
///
/// Generation is in-memory only; persistence is the caller's concern.
pub struct PrekeyManager {
    identity_public: [u8; 32],
    signed: Vec<SignedPrekey>,
    pool: BTreeMap<u32, OneTimePrekey>,
    next_signed_id: u32,
    next_prekey_id: u32,
}

impl PrekeyManager {
    /// Create a manager with an initial signed prekey and an empty pool.
    pub fn new(identity: &IdentityKeyPair) -> Result<Self, CryptoError> {
        let mut manager = Self {
            identity_public: identity.public_bytes(),
            signed: Vec::new(),
            pool: BTreeMap::new(),
            next_signed_id: 1,
            next_prekey_id: 1,
        };
        manager.rotate_signed_prekey(identity)?;
        Ok(manager)
    }

    /// Generate a new signed prekey, signed by the identity key, and make it
    /// current. Superseded prekeys remain loadable for the overlap window.
    pub fn rotate_signed_prekey(&mut self, identity: &IdentityKeyPair) -> Result<u32, CryptoError> {
        if identity.public_bytes() != self.identity_public {
            return Err(CryptoError::Signing(
                "identity does not match this prekey manager".into(),
            ));
        }

        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);
        let signature = identity.sign(public.as_bytes()).to_bytes().to_vec();

        let id = self.next_signed_id;
        self.next_signed_id += 1;
        self.signed.push(SignedPrekey {
            id,
            secret,
            public,
            signature,
            created_at: unix_now(),
        });

        // Drop prekeys that have fallen out of the overlap window.
        while self.signed.len() > SIGNED_PREKEY_OVERLAP {
            self.signed.remove(0);
        }

        Ok(id)
    }

    /// Generate `n` fresh one-time prekeys into the pool.
    pub fn generate_pool(&mut self, n: usize) -> Vec<u32> {
        let mut ids = Vec::with_capacity(n);
        for _ in 0..n {
            let id = self.next_prekey_id;
            self.next_prekey_id += 1;
            let secret = StaticSecret::random_from_rng(OsRng);
            let public = X25519Public::from(&secret);
            self.pool.insert(id, OneTimePrekey { secret, public });
            ids.push(id);
        }
        ids
    }

    /// Export everything the key directory needs.
    pub fn publication(&self) -> Result<BundlePublication, CryptoError> {
        let current = self
            .signed
            .last()
            .ok_or_else(|| CryptoError::KeyGeneration("no signed prekey".into()))?;

        Ok(BundlePublication {
            identity_key: self.identity_public.to_vec(),
            signed_prekey: SignedPrekeyPublic {
                id: current.id,
                public_key: current.public.as_bytes().to_vec(),
                signature: current.signature.clone(),
            },
            one_time_prekeys: self
                .pool
                .iter()
                .map(|(id, pk)| OneTimePrekeyPublic {
                    id: *id,
                    public_key: pk.public.as_bytes().to_vec(),
                })
                .collect(),
        })
    }

    /// Private half of a signed prekey, by id (current or overlap).
    pub fn signed_prekey_secret(&self, id: u32) -> Option<&StaticSecret> {
        self.signed.iter().find(|sp| sp.id == id).map(|sp| &sp.secret)
    }

    /// When the current signed prekey was created (unix seconds), for
    /// rotation scheduling.
    pub fn signed_prekey_created_at(&self) -> Option<u64> {
        self.signed.last().map(|sp| sp.created_at)
    }

    /// Consume the private half of a one-time prekey. Each id succeeds at
    /// most once; a second call returns `None`.
    pub fn take_one_time_secret(&mut self, id: u32) -> Option<StaticSecret> {
        self.pool.remove(&id).map(|pk| pk.secret)
    }

    /// Number of unconsumed one-time prekeys still held locally.
    pub fn remaining_one_time(&self) -> usize {
        self.pool.len()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
