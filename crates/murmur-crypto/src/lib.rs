//! Cryptographic core for Murmur: X3DH session establishment, Double Ratchet
//! message keys, authenticated message sealing, and group encryption.
//!
//! This crate is pure computation — no I/O, no async, no session bookkeeping.
//! The engine crate owns mutable state and calls in through these types.

pub mod codec;
pub mod error;
pub mod group;
pub mod identity;
pub mod prekeys;
pub mod ratchet;
pub mod safety_number;
pub mod secret;
pub mod x3dh;

pub use error::CryptoError;
pub use group::GroupKey;
pub use identity::IdentityKeyPair;
pub use prekeys::{BundlePublication, PrekeyManager, PublicBundle};
pub use ratchet::{MessageHeader, RatchetState};
pub use secret::SecretKey;
