//! Key directory boundary.
//!
//! The directory is the one honest-but-curious server-side component the
//! engine talks to: it stores public bundles and hands out one-time prekeys.
//! The contract that matters is atomicity of the handout — two concurrent
//! fetches for the same user must never receive the same one-time prekey.

use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::Mutex;

use murmur_crypto::prekeys::{OneTimePrekeyPublic, SignedPrekeyPublic};
use murmur_crypto::{BundlePublication, PublicBundle};

use crate::error::EngineError;

/// Storage contract for published key bundles.
pub trait KeyDirectory: Send + Sync {
    /// Upsert a user's published keys. Replaces any previous publication,
    /// except that one-time prekey ids already handed out for the same
    /// identity are never re-offered, republished or not. A publication
    /// under a new identity key starts from a clean slate.
    fn publish(&self, user_id: &str, publication: BundlePublication) -> Result<(), EngineError>;

    /// Fetch a bundle for session establishment. A one-time prekey, when the
    /// pool still has one, is removed from the pool in the same operation.
    /// An exhausted pool yields a bundle with `one_time_prekey: None`, not an
    /// error.
    fn fetch_bundle(&self, user_id: &str) -> Result<PublicBundle, EngineError>;

    /// Unconsumed one-time prekeys remaining for a user.
    fn remaining_prekeys(&self, user_id: &str) -> Result<usize, EngineError>;
}

struct DirectoryEntry {
    identity_key: Vec<u8>,
    signed_prekey: SignedPrekeyPublic,
    one_time: VecDeque<OneTimePrekeyPublic>,
    /// Ids ever handed out to a fetcher. Republication filters against this
    /// so no id is offered twice.
    issued: HashSet<u32>,
}

/// In-memory directory. One mutex guards the whole table, so prekey handout
/// is atomic by construction.
#[derive(Default)]
pub struct MemoryKeyDirectory {
    entries: Mutex<HashMap<String, DirectoryEntry>>,
}

impl MemoryKeyDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyDirectory for MemoryKeyDirectory {
    fn publish(&self, user_id: &str, publication: BundlePublication) -> Result<(), EngineError> {
        let mut entries = self.entries.lock();
        let issued = match entries.get(user_id) {
            Some(entry) if entry.identity_key == publication.identity_key => entry.issued.clone(),
            _ => HashSet::new(),
        };
        let one_time = publication
            .one_time_prekeys
            .into_iter()
            .filter(|pk| !issued.contains(&pk.id))
            .collect();
        entries.insert(
            user_id.to_owned(),
            DirectoryEntry {
                identity_key: publication.identity_key,
                signed_prekey: publication.signed_prekey,
                one_time,
                issued,
            },
        );
        Ok(())
    }

    fn fetch_bundle(&self, user_id: &str) -> Result<PublicBundle, EngineError> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(user_id)
            .ok_or_else(|| EngineError::Directory(format!("no bundle published for {user_id}")))?;

        let one_time_prekey = entry.one_time.pop_front();
        match &one_time_prekey {
            Some(pk) => {
                entry.issued.insert(pk.id);
            }
            None => {
                tracing::warn!(user = user_id, "one-time prekey pool exhausted");
            }
        }

        Ok(PublicBundle {
            identity_key: entry.identity_key.clone(),
            signed_prekey: entry.signed_prekey.clone(),
            one_time_prekey,
        })
    }

    fn remaining_prekeys(&self, user_id: &str) -> Result<usize, EngineError> {
        let entries = self.entries.lock();
        entries
            .get(user_id)
            .map(|e| e.one_time.len())
            .ok_or_else(|| EngineError::Directory(format!("no bundle published for {user_id}")))
    }
}
