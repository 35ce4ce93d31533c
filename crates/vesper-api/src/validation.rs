use crate::types::*;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("empty field {0}")]
    Empty(&'static str),
    #[error("too long {0}")]
    TooLong(&'static str),
    #[error("invalid {0}")]
    Invalid(&'static str),
}

pub fn validate_handle(handle: &UserHandle) -> Result<(), ValidationError> {
    let value = handle.value.trim();
    if value.is_empty() {
        return Err(ValidationError::Empty("handle"));
    }
    if !value.starts_with('@') {
        return Err(ValidationError::Invalid("handle"));
    }
    if !(2..=64).contains(&value.len()) {
        return Err(ValidationError::Invalid("handle"));
    }
    Ok(())
}

pub fn validate_outbound_request(
    req: &OutboundRequest,
    limits: &ValidationLimits,
) -> Result<(), ValidationError> {
    validate_handle(&req.sender)?;
    let target_id = match &req.target {
        SendTarget::User { id } => id,
        SendTarget::LocalGroup { id } => id,
        SendTarget::NetworkGroup { id } => id,
    };
    if target_id.trim().is_empty() {
        return Err(ValidationError::Empty("target"));
    }
    if req.payload.is_empty() && !matches!(req.kind, MessageKind::Typing) {
        return Err(ValidationError::Empty("payload"));
    }
    if req.payload.len() > limits.max_payload_bytes {
        return Err(ValidationError::TooLong("payload"));
    }
    if req.tags.len() > limits.max_tags {
        return Err(ValidationError::TooLong("tags"));
    }
    for tag in req.tags.iter() {
        if tag.trim().is_empty() {
            return Err(ValidationError::Empty("tag"));
        }
        if tag.len() > limits.max_tag_len {
            return Err(ValidationError::TooLong("tag"));
        }
    }
    Ok(())
}
