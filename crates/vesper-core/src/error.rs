use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("storage")]
    Storage,
    #[error("validation {0}")]
    Validation(String),
    #[error("transport {0}")]
    Transport(String),
    #[error("crypto")]
    Crypto,
    #[error("not found")]
    NotFound,
}

/// Per-recipient delivery outcome classification. Transient failures
/// consume one retry; permanent and crypto failures exhaust the
/// recipient's budget in one step.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("transient {0}")]
    Transient(String),
    #[error("permanent {0}")]
    Permanent(String),
    #[error("crypto")]
    Crypto,
}

impl DeliveryError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeliveryError::Transient(_))
    }
}
