use crate::error::CoreError;
use serde::{Deserialize, Serialize};

/// One-byte format discriminator in front of metadata envelopes. Raw
/// content is passed through without it, so lean signals (typing
/// indicators) pay no framing overhead.
pub const ENVELOPE_MARKER: u8 = 0xC5;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
struct MetaEnvelope {
    conversation_id: Option<String>,
    tags: Vec<String>,
    content: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnwrappedMessage {
    pub conversation_id: Option<String>,
    pub tags: Vec<String>,
    pub content: Vec<u8>,
}

pub fn wrap(
    content: &[u8],
    conversation_id: Option<&str>,
    tags: &[String],
) -> Result<Vec<u8>, CoreError> {
    if conversation_id.is_none() && tags.is_empty() {
        return Ok(content.to_vec());
    }
    let envelope = MetaEnvelope {
        conversation_id: conversation_id.map(|v| v.to_string()),
        tags: tags.to_vec(),
        content: content.to_vec(),
    };
    let body = serde_json::to_vec(&envelope).map_err(|_| CoreError::Storage)?;
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(ENVELOPE_MARKER);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Marker plus a parsable envelope means structured metadata; anything
/// else is raw content. Malformed marker payloads fall back to raw
/// rather than failing.
pub fn unwrap(bytes: &[u8]) -> UnwrappedMessage {
    if let Some((&ENVELOPE_MARKER, body)) = bytes.split_first() {
        if let Ok(envelope) = serde_json::from_slice::<MetaEnvelope>(body) {
            return UnwrappedMessage {
                conversation_id: envelope.conversation_id,
                tags: envelope.tags,
                content: envelope.content,
            };
        }
    }
    UnwrappedMessage {
        conversation_id: None,
        tags: Vec::new(),
        content: bytes.to_vec(),
    }
}
