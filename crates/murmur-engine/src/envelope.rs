//! Wire envelope.
//!
//! The envelope is everything that crosses the (untrusted) transport: routing
//! ids, the ratchet header fields, ciphertext and tag, and — until the
//! initiator has heard back — the handshake material the responder needs to
//! run its side of X3DH. Byte fields travel as base64 strings in JSON.

use serde::{Deserialize, Serialize};

use murmur_crypto::MessageHeader;

use crate::error::EngineError;

/// Handshake material attached to envelopes the initiator sends before the
/// first successful inbound decrypt. The ephemeral public key is not repeated
/// here: it is the envelope's `ratchet_key`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeInfo {
    /// Initiator's Ed25519 identity public key.
    #[serde(with = "serde_b64")]
    pub identity_key: Vec<u8>,
    /// Which of the responder's signed prekeys the bundle carried.
    pub signed_prekey_id: u32,
    /// Which one-time prekey was consumed, absent for a degraded handshake.
    pub one_time_prekey_id: Option<u32>,
}

/// One transportable message. Exactly one of `recipient_id` / `group_id` is
/// set; group envelopes carry no ratchet fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(with = "serde_b64")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "serde_b64")]
    pub auth_tag: Vec<u8>,
    /// Sender's current DH ratchet public key; absent on group envelopes.
    #[serde(with = "serde_b64::opt", default, skip_serializing_if = "Option::is_none")]
    pub ratchet_key: Option<Vec<u8>>,
    pub previous_counter: u32,
    pub counter: u32,
    /// Sender's wall clock, unix seconds. Informational only.
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handshake: Option<HandshakeInfo>,
}

impl Envelope {
    /// Reconstruct the ratchet header this envelope carries.
    pub fn header(&self) -> Result<MessageHeader, EngineError> {
        let key = self
            .ratchet_key
            .as_deref()
            .ok_or_else(|| EngineError::Envelope("missing ratchet key".into()))?;
        let ratchet_key: [u8; 32] = key
            .try_into()
            .map_err(|_| EngineError::Envelope(format!("ratchet key has {} bytes", key.len())))?;
        Ok(MessageHeader {
            ratchet_key,
            previous_counter: self.previous_counter,
            counter: self.counter,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EngineError> {
        serde_json::to_vec(self).map_err(|e| EngineError::Envelope(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EngineError> {
        serde_json::from_slice(bytes).map_err(|e| EngineError::Envelope(e.to_string()))
    }
}

/// Base64 (de)serialization for byte fields inside JSON envelopes.
pub(crate) mod serde_b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(de)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }

    pub mod opt {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine as _;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<Vec<u8>>,
            ser: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(bytes) => ser.serialize_some(&STANDARD.encode(bytes)),
                None => ser.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            de: D,
        ) -> Result<Option<Vec<u8>>, D::Error> {
            let encoded: Option<String> = Option::deserialize(de)?;
            encoded
                .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
