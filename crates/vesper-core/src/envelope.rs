use crate::error::CoreError;
use blake3::Hasher;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vesper_api::types::MessageKind;

mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

/// Wire unit for one (task, recipient) pair. Immutable once
/// transmitted; a fresh envelope is built per send attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecureEnvelope {
    pub sender: String,
    pub recipient: String,
    pub kind: MessageKind,
    #[serde(with = "b64")]
    pub encrypted_symmetric_key: Vec<u8>,
    #[serde(with = "b64")]
    pub encrypted_data: Vec<u8>,
    #[serde(with = "b64")]
    pub signature: Vec<u8>,
    pub timestamp: u64,
}

impl SecureEnvelope {
    /// Digest covered by the detached signature: everything except the
    /// signature itself, domain-separated.
    pub fn signing_digest(&self) -> [u8; 32] {
        let mut hasher = Hasher::new();
        hasher.update(b"vesper:envelope:v1");
        hasher.update(self.sender.as_bytes());
        hasher.update(self.recipient.as_bytes());
        hasher.update(&self.encrypted_symmetric_key);
        hasher.update(&self.encrypted_data);
        hasher.update(&self.timestamp.to_be_bytes());
        *hasher.finalize().as_bytes()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueuedMessage {
    pub id: Uuid,
    pub envelope: SecureEnvelope,
}

pub fn serialize_envelope(envelope: &SecureEnvelope) -> Result<Vec<u8>, CoreError> {
    serde_json::to_vec(envelope).map_err(|_| CoreError::Crypto)
}

pub fn deserialize_envelope(bytes: &[u8]) -> Result<SecureEnvelope, CoreError> {
    serde_json::from_slice(bytes).map_err(|_| CoreError::Crypto)
}
