//! The session engine: one identity, one prekey store, a table of per-peer
//! ratchet sessions.
//!
//! Locking discipline: the table mutex is held only long enough to resolve or
//! insert an entry — or, for an inbound handshake, across the responder X3DH
//! so a peer's concurrent first envelopes cannot double-consume a one-time
//! prekey. Each session then has its own mutex, so all ratchet work for one
//! peer is serialized while distinct peers proceed concurrently.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use murmur_crypto::ratchet::RatchetState;
use murmur_crypto::{
    safety_number, x3dh, CryptoError, GroupKey, IdentityKeyPair, MessageHeader, PrekeyManager,
};

use crate::config::EngineConfig;
use crate::directory::KeyDirectory;
use crate::envelope::{Envelope, HandshakeInfo};
use crate::error::EngineError;
use crate::persistence::SessionRecord;

/// Observable state of a peer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// No session exists; the next encrypt or inbound handshake creates one.
    Uninitiated,
    Established {
        /// Established without a one-time prekey (exhausted pool).
        degraded: bool,
    },
    /// Refuses all traffic until deleted and re-established.
    Invalidated,
}

struct EstablishedSession {
    ratchet: RatchetState,
    peer_identity: [u8; 32],
    degraded: bool,
    auth_failures: u32,
    /// Attached to outgoing envelopes until the peer proves the session by
    /// sending something we can decrypt.
    handshake: Option<HandshakeInfo>,
}

enum SessionPhase {
    Established(EstablishedSession),
    Invalidated,
}

type SessionHandle = Arc<Mutex<SessionPhase>>;

/// Messaging engine for one device.
pub struct SessionEngine {
    user_id: String,
    identity: IdentityKeyPair,
    prekeys: Mutex<PrekeyManager>,
    directory: Arc<dyn KeyDirectory>,
    sessions: Mutex<HashMap<String, SessionHandle>>,
    config: EngineConfig,
}

impl SessionEngine {
    pub fn new(
        user_id: impl Into<String>,
        identity: IdentityKeyPair,
        directory: Arc<dyn KeyDirectory>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let prekeys = PrekeyManager::new(&identity)?;
        Ok(Self {
            user_id: user_id.into(),
            identity,
            prekeys: Mutex::new(prekeys),
            directory,
            sessions: Mutex::new(HashMap::new()),
            config,
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Our Ed25519 identity public key.
    pub fn identity_public(&self) -> [u8; 32] {
        self.identity.public_bytes()
    }

    /// Fill the one-time prekey pool and publish our bundle to the directory.
    pub fn register(&self) -> Result<(), EngineError> {
        let publication = {
            let mut prekeys = self.prekeys.lock();
            let missing = self
                .config
                .prekey_pool_size
                .saturating_sub(prekeys.remaining_one_time());
            prekeys.generate_pool(missing);
            prekeys.publication()?
        };
        self.directory.publish(&self.user_id, publication)?;
        tracing::debug!(user = %self.user_id, "published key bundle");
        Ok(())
    }

    /// Periodic upkeep: rotate the signed prekey when it has aged out, top up
    /// the one-time pool, republish.
    pub fn maintain(&self) -> Result<(), EngineError> {
        let publication = {
            let mut prekeys = self.prekeys.lock();
            if let Some(created_at) = prekeys.signed_prekey_created_at() {
                let age = unix_now().saturating_sub(created_at);
                if age >= self.config.signed_prekey_rotation_secs {
                    let id = prekeys.rotate_signed_prekey(&self.identity)?;
                    tracing::debug!(user = %self.user_id, id, "rotated signed prekey");
                }
            }
            let missing = self
                .config
                .prekey_pool_size
                .saturating_sub(prekeys.remaining_one_time());
            prekeys.generate_pool(missing);
            prekeys.publication()?
        };
        self.directory.publish(&self.user_id, publication)?;
        Ok(())
    }

    /// Encrypt a 1:1 message, establishing a session through the directory
    /// if none exists yet.
    pub fn encrypt_for_peer(
        &self,
        peer_id: &str,
        plaintext: &[u8],
    ) -> Result<Envelope, EngineError> {
        let handle = self.session_or_initiate(peer_id)?;
        let mut phase = handle.lock();
        let session = match &mut *phase {
            SessionPhase::Invalidated => {
                return Err(EngineError::SessionInvalidated(peer_id.to_owned()))
            }
            SessionPhase::Established(session) => session,
        };

        let message = session.ratchet.encrypt(plaintext)?;
        Ok(Envelope {
            sender_id: self.user_id.clone(),
            recipient_id: Some(peer_id.to_owned()),
            group_id: None,
            ciphertext: message.ciphertext,
            auth_tag: message.auth_tag,
            ratchet_key: Some(message.header.ratchet_key.to_vec()),
            previous_counter: message.header.previous_counter,
            counter: message.header.counter,
            timestamp: unix_now(),
            handshake: session.handshake.clone(),
        })
    }

    /// Decrypt a 1:1 envelope, running the responder handshake first if the
    /// sender is establishing a session.
    pub fn decrypt_from_peer(&self, envelope: &Envelope) -> Result<Vec<u8>, EngineError> {
        let peer_id = envelope.sender_id.as_str();
        let header = envelope.header()?;

        let existing = self.sessions.lock().get(peer_id).map(Arc::clone);
        let handle = match existing {
            Some(handle) => handle,
            None => self.respond_session(peer_id, envelope, &header)?,
        };

        let mut phase = handle.lock();
        let session = match &mut *phase {
            SessionPhase::Invalidated => {
                return Err(EngineError::SessionInvalidated(peer_id.to_owned()))
            }
            SessionPhase::Established(session) => session,
        };

        let mut invalidate = false;
        let result = match session
            .ratchet
            .decrypt(&header, &envelope.ciphertext, &envelope.auth_tag)
        {
            Ok(plaintext) => {
                session.auth_failures = 0;
                // A successful decrypt proves the peer holds the session;
                // stop attaching handshake material to outgoing envelopes.
                session.handshake = None;
                Ok(plaintext)
            }
            Err(CryptoError::Authentication) => {
                session.auth_failures += 1;
                tracing::warn!(
                    peer = peer_id,
                    failures = session.auth_failures,
                    "message failed authentication"
                );
                if session.auth_failures >= self.config.auth_failure_threshold {
                    invalidate = true;
                }
                Err(EngineError::Crypto(CryptoError::Authentication))
            }
            Err(CryptoError::CounterRegression) => {
                invalidate = true;
                Err(EngineError::Crypto(CryptoError::CounterRegression))
            }
            Err(other) => Err(EngineError::Crypto(other)),
        };

        if invalidate {
            tracing::warn!(peer = peer_id, "session invalidated");
            *phase = SessionPhase::Invalidated;
        }
        result
    }

    /// Encrypt for a group under a caller-held shared key. The group id is
    /// bound as associated data.
    pub fn encrypt_for_group(
        &self,
        group_id: &str,
        key: &GroupKey,
        plaintext: &[u8],
    ) -> Result<Envelope, EngineError> {
        let (ciphertext, auth_tag) = key.seal(group_id.as_bytes(), plaintext)?;
        Ok(Envelope {
            sender_id: self.user_id.clone(),
            recipient_id: None,
            group_id: Some(group_id.to_owned()),
            ciphertext,
            auth_tag,
            ratchet_key: None,
            previous_counter: 0,
            counter: 0,
            timestamp: unix_now(),
            handshake: None,
        })
    }

    pub fn decrypt_from_group(
        &self,
        envelope: &Envelope,
        key: &GroupKey,
    ) -> Result<Vec<u8>, EngineError> {
        let group_id = envelope
            .group_id
            .as_deref()
            .ok_or_else(|| EngineError::Envelope("not a group envelope".into()))?;
        Ok(key.open(group_id.as_bytes(), &envelope.ciphertext, &envelope.auth_tag)?)
    }

    /// Safety number for out-of-band verification with an established peer.
    pub fn safety_number_with(&self, peer_id: &str) -> Result<String, EngineError> {
        let handle = self
            .sessions
            .lock()
            .get(peer_id)
            .map(Arc::clone)
            .ok_or_else(|| EngineError::NoSession(peer_id.to_owned()))?;
        let phase = handle.lock();
        match &*phase {
            SessionPhase::Established(session) => Ok(safety_number::compute(
                &self.identity.public_bytes(),
                &session.peer_identity,
            )),
            SessionPhase::Invalidated => Err(EngineError::SessionInvalidated(peer_id.to_owned())),
        }
    }

    pub fn session_status(&self, peer_id: &str) -> SessionStatus {
        let handle = self.sessions.lock().get(peer_id).map(Arc::clone);
        match handle {
            None => SessionStatus::Uninitiated,
            Some(handle) => match &*handle.lock() {
                SessionPhase::Established(session) => SessionStatus::Established {
                    degraded: session.degraded,
                },
                SessionPhase::Invalidated => SessionStatus::Invalidated,
            },
        }
    }

    /// Drop a session. The next message in either direction establishes a
    /// fresh one.
    pub fn delete_session(&self, peer_id: &str) -> bool {
        self.sessions.lock().remove(peer_id).is_some()
    }

    /// Export an established session for a [`crate::persistence`] backend.
    pub fn export_session(&self, peer_id: &str) -> Result<SessionRecord, EngineError> {
        let handle = self
            .sessions
            .lock()
            .get(peer_id)
            .map(Arc::clone)
            .ok_or_else(|| EngineError::NoSession(peer_id.to_owned()))?;
        let phase = handle.lock();
        match &*phase {
            SessionPhase::Established(session) => Ok(SessionRecord {
                peer_id: peer_id.to_owned(),
                peer_identity: session.peer_identity,
                ratchet: session.ratchet.snapshot(),
                degraded: session.degraded,
                auth_failures: session.auth_failures,
                handshake: session.handshake.clone(),
            }),
            SessionPhase::Invalidated => Err(EngineError::SessionInvalidated(peer_id.to_owned())),
        }
    }

    /// Restore a previously exported session, replacing any current one.
    pub fn import_session(&self, record: SessionRecord) -> Result<(), EngineError> {
        let phase = SessionPhase::Established(EstablishedSession {
            ratchet: RatchetState::restore(record.ratchet),
            peer_identity: record.peer_identity,
            degraded: record.degraded,
            auth_failures: record.auth_failures,
            handshake: record.handshake,
        });
        self.sessions
            .lock()
            .insert(record.peer_id, Arc::new(Mutex::new(phase)));
        Ok(())
    }

    fn session_or_initiate(&self, peer_id: &str) -> Result<SessionHandle, EngineError> {
        if let Some(handle) = self.sessions.lock().get(peer_id) {
            return Ok(Arc::clone(handle));
        }
        // Establish outside the table lock; the directory call may block.
        let phase = self.initiate_session(peer_id)?;
        Ok(self.insert_if_vacant(peer_id, phase))
    }

    fn initiate_session(&self, peer_id: &str) -> Result<SessionPhase, EngineError> {
        let bundle = self.directory.fetch_bundle(peer_id)?;
        let peer_identity: [u8; 32] = bundle.identity_key.as_slice().try_into().map_err(|_| {
            EngineError::Directory(format!("identity key for {peer_id} has wrong length"))
        })?;
        let signed_prekey: [u8; 32] =
            bundle.signed_prekey.public_key.as_slice().try_into().map_err(|_| {
                EngineError::Directory(format!("signed prekey for {peer_id} has wrong length"))
            })?;

        let handshake = x3dh::initiate(&self.identity, &bundle)?;
        let degraded = handshake.used_one_time_id.is_none();
        if degraded {
            tracing::warn!(peer = peer_id, "no one-time prekey in bundle; degraded handshake");
        }

        let info = HandshakeInfo {
            identity_key: self.identity.public_bytes().to_vec(),
            signed_prekey_id: bundle.signed_prekey.id,
            one_time_prekey_id: handshake.used_one_time_id,
        };
        let ratchet = RatchetState::init_initiator(
            handshake.keys,
            handshake.ephemeral_secret,
            signed_prekey,
            self.config.max_skip,
        );

        tracing::debug!(peer = peer_id, degraded, "session established (initiator)");
        Ok(SessionPhase::Established(EstablishedSession {
            ratchet,
            peer_identity,
            degraded,
            auth_failures: 0,
            handshake: Some(info),
        }))
    }

    fn respond_session(
        &self,
        peer_id: &str,
        envelope: &Envelope,
        header: &MessageHeader,
    ) -> Result<SessionHandle, EngineError> {
        // Hold the table lock across the handshake; a concurrent decrypt of
        // the same peer's next envelope must find this session rather than
        // try to consume the one-time prekey a second time.
        let mut sessions = self.sessions.lock();
        if let Some(handle) = sessions.get(peer_id) {
            return Ok(Arc::clone(handle));
        }

        let info = envelope
            .handshake
            .as_ref()
            .ok_or_else(|| EngineError::NoSession(peer_id.to_owned()))?;
        let peer_identity: [u8; 32] = info.identity_key.as_slice().try_into().map_err(|_| {
            EngineError::Envelope("handshake identity key has wrong length".into())
        })?;

        let degraded = info.one_time_prekey_id.is_none();
        let (signed_secret, one_time_secret) = {
            let mut prekeys = self.prekeys.lock();
            let signed = prekeys
                .signed_prekey_secret(info.signed_prekey_id)
                .ok_or_else(|| {
                    EngineError::Crypto(CryptoError::Handshake(format!(
                        "unknown signed prekey id {}",
                        info.signed_prekey_id
                    )))
                })?
                .clone();
            let one_time = match info.one_time_prekey_id {
                Some(id) => Some(prekeys.take_one_time_secret(id).ok_or_else(|| {
                    EngineError::Crypto(CryptoError::Handshake(format!(
                        "one-time prekey {id} already consumed"
                    )))
                })?),
                None => {
                    tracing::warn!(peer = peer_id, "inbound handshake without one-time prekey");
                    None
                }
            };
            (signed, one_time)
        };

        let keys = x3dh::respond(
            &self.identity,
            &signed_secret,
            one_time_secret.as_ref(),
            &peer_identity,
            &header.ratchet_key,
        )?;
        let ratchet = RatchetState::init_responder(
            keys,
            signed_secret,
            header.ratchet_key,
            self.config.max_skip,
        );

        tracing::debug!(peer = peer_id, degraded, "session established (responder)");
        let phase = SessionPhase::Established(EstablishedSession {
            ratchet,
            peer_identity,
            degraded,
            auth_failures: 0,
            handshake: None,
        });
        let handle = Arc::new(Mutex::new(phase));
        sessions.insert(peer_id.to_owned(), Arc::clone(&handle));
        Ok(handle)
    }

    /// Insert a freshly initiated session unless another thread won the
    /// race, in which case theirs stands and our handshake is discarded.
    fn insert_if_vacant(&self, peer_id: &str, phase: SessionPhase) -> SessionHandle {
        let mut sessions = self.sessions.lock();
        match sessions.entry(peer_id.to_owned()) {
            Entry::Occupied(existing) => Arc::clone(existing.get()),
            Entry::Vacant(slot) => Arc::clone(slot.insert(Arc::new(Mutex::new(phase)))),
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
