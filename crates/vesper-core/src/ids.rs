use blake3::Hasher;
use chrono::{DateTime, Datelike, Utc};

/// Routable handles carry a leading `@`; anything else is a local
/// contact identifier. This is the format discriminator the resolver
/// dispatches on.
pub fn is_handle(value: &str) -> bool {
    value.trim_start().starts_with('@')
}

pub fn canonical_handle(handle: &str) -> String {
    let trimmed = handle.trim();
    let body = trimmed.strip_prefix('@').unwrap_or(trimmed);
    format!("@{}", body.to_lowercase())
}

/// Deterministic pseudo-identity for a handle the address book does
/// not know yet. Stable across sessions so history keyed by it stays
/// in one partition.
pub fn pseudo_contact_id(handle: &str) -> String {
    let canonical = canonical_handle(handle);
    let mut hasher = Hasher::new();
    hasher.update(b"vesper:contact:pseudo:v1");
    hasher.update(canonical.as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Month partition key for vault files, e.g. `2024_01`.
pub fn vault_id_for_ms(ts_ms: u64) -> String {
    let secs = (ts_ms / 1000) as i64;
    let dt: DateTime<Utc> = DateTime::from_timestamp(secs, 0).unwrap_or_default();
    format!("{:04}_{:02}", dt.year(), dt.month())
}
