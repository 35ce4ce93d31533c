use crate::error::CoreError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use vesper_api::types::{BlockScope, IdentitySummary, UserHandle};
use vesper_store::EncryptedStore;

/// Directory collaborator: network-side identity and roster lookups.
/// Reads fail open (empty/None); trust decisions are made by callers
/// and always fail closed.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn resolve_identity(&self, id: &str) -> Result<Option<IdentitySummary>, CoreError>;
    async fn group_participants(&self, group_id: &str) -> Result<Vec<IdentitySummary>, CoreError>;
    async fn is_blocked(&self, id: &str, scope: BlockScope) -> Result<bool, CoreError>;
}

#[derive(Default)]
struct InMemoryDirectoryState {
    identities: HashMap<String, IdentitySummary>,
    groups: HashMap<String, Vec<String>>,
    blocked: HashSet<(String, BlockScope)>,
}

#[derive(Clone, Default)]
pub struct InMemoryDirectory {
    inner: Arc<Mutex<InMemoryDirectoryState>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_identity(&self, id: &str, handle: &str) {
        self.inner.lock().await.identities.insert(
            id.to_string(),
            IdentitySummary {
                handle: UserHandle {
                    value: handle.to_string(),
                },
                display_name: None,
            },
        );
    }

    pub async fn set_group(&self, group_id: &str, members: Vec<String>) {
        self.inner
            .lock()
            .await
            .groups
            .insert(group_id.to_string(), members);
    }

    pub async fn block(&self, id: &str, scope: BlockScope) {
        self.inner
            .lock()
            .await
            .blocked
            .insert((id.to_string(), scope));
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn resolve_identity(&self, id: &str) -> Result<Option<IdentitySummary>, CoreError> {
        Ok(self.inner.lock().await.identities.get(id).cloned())
    }

    async fn group_participants(&self, group_id: &str) -> Result<Vec<IdentitySummary>, CoreError> {
        let guard = self.inner.lock().await;
        let members = guard.groups.get(group_id).cloned().unwrap_or_default();
        let mut out = Vec::new();
        for member in members {
            if let Some(summary) = guard.identities.get(&member) {
                out.push(summary.clone());
            }
        }
        Ok(out)
    }

    async fn is_blocked(&self, id: &str, scope: BlockScope) -> Result<bool, CoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .blocked
            .contains(&(id.to_string(), scope)))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub handle: String,
    pub contact_id: String,
    pub alias: Option<String>,
    pub added_at_ms: u64,
    pub last_resolved_ms: u64,
}

/// Persisted address-book cache: handle <-> contact id, plus locally
/// defined broadcast groups. Keys follow the store index pattern.
#[derive(Clone)]
pub struct ContactDirectory {
    store: Arc<Mutex<EncryptedStore>>,
}

impl ContactDirectory {
    pub fn new(store: Arc<Mutex<EncryptedStore>>) -> Self {
        Self { store }
    }

    pub async fn add_or_update_contact(
        &self,
        handle: &str,
        contact_id: &str,
        alias: Option<String>,
        now_ms: u64,
    ) -> Result<Contact, CoreError> {
        let mut guard = self.store.lock().await;
        let mut index = self.index(&guard)?;
        index.insert(handle.to_string());
        let mut contact = self.load_contact(&guard, handle).unwrap_or(Contact {
            handle: handle.to_string(),
            contact_id: contact_id.to_string(),
            alias: alias.clone(),
            added_at_ms: now_ms,
            last_resolved_ms: now_ms,
        });
        contact.contact_id = contact_id.to_string();
        if alias.is_some() {
            contact.alias = alias;
        }
        contact.last_resolved_ms = now_ms;
        let data = serde_json::to_vec(&contact).map_err(|_| CoreError::Storage)?;
        guard
            .put(&Self::handle_key(handle), &data)
            .map_err(|_| CoreError::Storage)?;
        guard
            .put(&Self::contact_key(contact_id), &data)
            .map_err(|_| CoreError::Storage)?;
        self.persist_index(&mut guard, &index)?;
        Ok(contact)
    }

    pub async fn get_by_handle(&self, handle: &str) -> Option<Contact> {
        let guard = self.store.lock().await;
        self.load_contact(&guard, handle)
    }

    pub async fn get_by_contact_id(&self, contact_id: &str) -> Option<Contact> {
        let guard = self.store.lock().await;
        guard
            .get(&Self::contact_key(contact_id))
            .ok()
            .flatten()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
    }

    pub async fn list(&self) -> Vec<Contact> {
        let guard = self.store.lock().await;
        let index = self.index(&guard).unwrap_or_default();
        let mut contacts = Vec::new();
        for handle in index.iter() {
            if let Some(contact) = self.load_contact(&guard, handle) {
                contacts.push(contact);
            }
        }
        contacts
    }

    pub async fn set_local_group(
        &self,
        group_id: &str,
        members: Vec<String>,
    ) -> Result<(), CoreError> {
        let mut guard = self.store.lock().await;
        let bytes = serde_json::to_vec(&members).map_err(|_| CoreError::Storage)?;
        guard
            .put(&Self::local_group_key(group_id), &bytes)
            .map_err(|_| CoreError::Storage)
    }

    pub async fn local_group(&self, group_id: &str) -> Option<Vec<String>> {
        let guard = self.store.lock().await;
        guard
            .get(&Self::local_group_key(group_id))
            .ok()
            .flatten()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
    }

    fn index(&self, store: &EncryptedStore) -> Result<HashSet<String>, CoreError> {
        if let Ok(Some(bytes)) = store.get("dir:index") {
            serde_json::from_slice(&bytes).map_err(|_| CoreError::Storage)
        } else {
            Ok(HashSet::new())
        }
    }

    fn persist_index(
        &self,
        store: &mut EncryptedStore,
        index: &HashSet<String>,
    ) -> Result<(), CoreError> {
        let bytes = serde_json::to_vec(index).map_err(|_| CoreError::Storage)?;
        store
            .put("dir:index", &bytes)
            .map_err(|_| CoreError::Storage)
    }

    fn load_contact(&self, store: &EncryptedStore, handle: &str) -> Option<Contact> {
        store
            .get(&Self::handle_key(handle))
            .ok()
            .flatten()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
    }

    fn handle_key(handle: &str) -> String {
        format!("dir:handle:{}", handle)
    }

    fn contact_key(contact_id: &str) -> String {
        format!("dir:contact:{}", contact_id)
    }

    fn local_group_key(group_id: &str) -> String {
        format!("dir:localgroup:{}", group_id)
    }
}
