//! Session engine for Murmur.
//!
//! Owns the mutable state the crypto crate refuses to: the per-peer session
//! table, the prekey pool lifecycle, and the trait boundaries to the key
//! directory and session storage. All cryptographic computation lives in
//! `murmur-crypto`.

pub mod config;
pub mod directory;
pub mod envelope;
pub mod error;
pub mod persistence;
pub mod session;

pub use config::EngineConfig;
pub use directory::{KeyDirectory, MemoryKeyDirectory};
pub use envelope::{Envelope, HandshakeInfo};
pub use error::EngineError;
pub use persistence::{MemorySessionPersistence, SessionPersistence, SessionRecord};
pub use session::{SessionEngine, SessionStatus};
