use crate::directory::{Contact, ContactDirectory, Directory};
use crate::error::CoreError;
use crate::ids::{canonical_handle, is_handle, pseudo_contact_id};
use crate::time::now_ms;
use std::sync::Arc;

/// Maps between private contact identifiers and routable network
/// handles, and picks the canonical identity history is keyed under.
#[derive(Clone)]
pub struct IdentityResolver {
    contacts: ContactDirectory,
    directory: Arc<dyn Directory>,
    ttl_ms: u64,
}

impl IdentityResolver {
    pub fn new(contacts: ContactDirectory, directory: Arc<dyn Directory>, ttl_secs: u64) -> Self {
        Self {
            contacts,
            directory,
            ttl_ms: ttl_secs.saturating_mul(1000),
        }
    }

    /// Local id -> routable handle. Passthrough when the input already
    /// carries the handle discriminator.
    pub async fn resolve_to_handle(&self, local_id: &str) -> Result<String, CoreError> {
        if is_handle(local_id) {
            return Ok(canonical_handle(local_id));
        }
        match self.contacts.get_by_contact_id(local_id).await {
            Some(contact) => Ok(canonical_handle(&contact.handle)),
            None => Err(CoreError::NotFound),
        }
    }

    /// Handle -> local contact. A handle the address book knows comes
    /// back as the stored contact; an unknown one synthesizes a
    /// deterministic pseudo-identity. Only directory-confirmed
    /// identities are persisted into the address book.
    pub async fn resolve_to_contact(&self, handle: &str) -> Result<Contact, CoreError> {
        let canonical = canonical_handle(handle);
        let now = now_ms();
        if let Some(contact) = self.contacts.get_by_handle(&canonical).await {
            if now.saturating_sub(contact.last_resolved_ms) <= self.ttl_ms {
                return Ok(contact);
            }
        }
        let resolved = self.directory.resolve_identity(&canonical).await;
        if let Ok(Some(_summary)) = resolved {
            let contact_id = self
                .contacts
                .get_by_handle(&canonical)
                .await
                .map(|c| c.contact_id)
                .unwrap_or_else(|| pseudo_contact_id(&canonical));
            return self
                .contacts
                .add_or_update_contact(&canonical, &contact_id, None, now)
                .await;
        }
        // Unresolved identities are usable but never promoted into the
        // address book.
        if let Some(contact) = self.contacts.get_by_handle(&canonical).await {
            return Ok(contact);
        }
        Ok(Contact {
            handle: canonical.clone(),
            contact_id: pseudo_contact_id(&canonical),
            alias: None,
            added_at_ms: 0,
            last_resolved_ms: 0,
        })
    }

    /// Canonical identity under which local history for `id` is keyed.
    /// Every handle of one contact lands on the same partition.
    pub async fn storage_urn(&self, id: &str) -> Result<String, CoreError> {
        if is_handle(id) {
            let contact = self.resolve_to_contact(id).await?;
            return Ok(contact.contact_id);
        }
        Ok(id.to_string())
    }
}
