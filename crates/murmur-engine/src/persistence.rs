//! Session persistence boundary.
//!
//! The engine never owns storage. It exports and imports [`SessionRecord`]s;
//! a caller-side [`SessionPersistence`] implementation decides where the
//! bytes live. Records contain live ratchet secrets, so real backends are
//! expected to encrypt at rest.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use murmur_crypto::ratchet::RatchetSnapshot;

use crate::envelope::HandshakeInfo;
use crate::error::EngineError;

/// Everything needed to rebuild an established session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub peer_id: String,
    pub peer_identity: [u8; 32],
    pub ratchet: RatchetSnapshot,
    pub degraded: bool,
    pub auth_failures: u32,
    /// Pending handshake material, still attached to outgoing envelopes if
    /// the peer has not replied yet.
    pub handshake: Option<HandshakeInfo>,
}

impl SessionRecord {
    pub fn to_bytes(&self) -> Result<Vec<u8>, EngineError> {
        serde_json::to_vec(self).map_err(|e| EngineError::Persistence(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EngineError> {
        serde_json::from_slice(bytes).map_err(|e| EngineError::Persistence(e.to_string()))
    }
}

/// Opaque-bytes storage contract for session records.
pub trait SessionPersistence: Send + Sync {
    fn load(&self, peer_id: &str) -> Result<Option<Vec<u8>>, EngineError>;
    fn save(&self, peer_id: &str, record: &[u8]) -> Result<(), EngineError>;
    fn delete(&self, peer_id: &str) -> Result<(), EngineError>;
}

/// In-memory store, for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemorySessionPersistence {
    records: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemorySessionPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionPersistence for MemorySessionPersistence {
    fn load(&self, peer_id: &str) -> Result<Option<Vec<u8>>, EngineError> {
        Ok(self.records.lock().get(peer_id).cloned())
    }

    fn save(&self, peer_id: &str, record: &[u8]) -> Result<(), EngineError> {
        self.records.lock().insert(peer_id.to_owned(), record.to_vec());
        Ok(())
    }

    fn delete(&self, peer_id: &str) -> Result<(), EngineError> {
        self.records.lock().remove(peer_id);
        Ok(())
    }
}
