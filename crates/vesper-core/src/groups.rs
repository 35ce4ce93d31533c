use crate::error::CoreError;
use crate::time::now_ms;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use vesper_api::types::MemberStatus;
use vesper_store::EncryptedStore;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemberStatusEntry {
    pub status: MemberStatus,
    pub updated_at_ms: u64,
}

/// Consensus source of truth for group membership, asserted by
/// protocol exchange. Distinct from any locally cached display roster.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirectoryGroup {
    pub id: String,
    pub name: String,
    pub members: Vec<String>,
    pub member_status: HashMap<String, MemberStatusEntry>,
}

impl DirectoryGroup {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            members: Vec::new(),
            member_status: HashMap::new(),
        }
    }
}

/// Atomic consensus status writes. The store mutex makes each update a
/// single read-modify-write; UI-driven edits to the same aggregate go
/// through the same lock.
#[derive(Clone)]
pub struct GroupNetworkStorage {
    store: Arc<Mutex<EncryptedStore>>,
}

impl GroupNetworkStorage {
    pub fn new(store: Arc<Mutex<EncryptedStore>>) -> Self {
        Self { store }
    }

    pub async fn upsert_group(&self, group: &DirectoryGroup) -> Result<(), CoreError> {
        let mut guard = self.store.lock().await;
        let bytes = serde_json::to_vec(group).map_err(|_| CoreError::Storage)?;
        guard
            .put(&Self::group_key(&group.id), &bytes)
            .map_err(|_| CoreError::Storage)
    }

    pub async fn group(&self, id: &str) -> Option<DirectoryGroup> {
        let guard = self.store.lock().await;
        self.load_group(&guard, id)
    }

    /// Applies one (member, status) fact. Idempotent: re-applying the
    /// same pair is a no-op. Conflicts resolve last-writer-wins on
    /// `observed_at_ms` (the protocol's ordering field when supplied,
    /// arrival time otherwise). Returns whether the write took effect.
    pub async fn update_member_status(
        &self,
        group_id: &str,
        member: &str,
        status: MemberStatus,
        observed_at_ms: Option<u64>,
    ) -> Result<bool, CoreError> {
        let mut guard = self.store.lock().await;
        let mut group = self.load_group(&guard, group_id).ok_or(CoreError::NotFound)?;
        let observed = observed_at_ms.unwrap_or_else(now_ms);
        if let Some(existing) = group.member_status.get(member) {
            if existing.status == status {
                return Ok(false);
            }
            if existing.updated_at_ms > observed {
                return Ok(false);
            }
        }
        group.member_status.insert(
            member.to_string(),
            MemberStatusEntry {
                status,
                updated_at_ms: observed,
            },
        );
        if status == MemberStatus::Joined && !group.members.iter().any(|m| m == member) {
            group.members.push(member.to_string());
        }
        let bytes = serde_json::to_vec(&group).map_err(|_| CoreError::Storage)?;
        guard
            .put(&Self::group_key(group_id), &bytes)
            .map_err(|_| CoreError::Storage)?;
        Ok(true)
    }

    fn load_group(&self, store: &EncryptedStore, id: &str) -> Option<DirectoryGroup> {
        store
            .get(&Self::group_key(id))
            .ok()
            .flatten()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
    }

    fn group_key(id: &str) -> String {
        format!("group:{}", id)
    }
}
