use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;
use vesper_api::types::MessageKind;
use vesper_store::EncryptedStore;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuarantineRecord {
    pub sender: String,
    pub message_id: Uuid,
    pub timestamp: u64,
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

/// Trust gate for inbound traffic from unapproved senders. Content
/// held here has not entered durable history; promotion on accept is
/// the caller's job and `take` hands the records over at most once.
#[derive(Clone)]
pub struct QuarantineService {
    store: Arc<Mutex<EncryptedStore>>,
}

impl QuarantineService {
    pub fn new(store: Arc<Mutex<EncryptedStore>>) -> Self {
        Self { store }
    }

    /// Blocked senders are dropped with no storage and no trace;
    /// everyone else is persisted keyed by sender. Returns whether the
    /// record was kept.
    pub async fn process(
        &self,
        record: QuarantineRecord,
        blocked: &HashSet<String>,
    ) -> Result<bool, CoreError> {
        if blocked.contains(&record.sender) {
            return Ok(false);
        }
        let mut guard = self.store.lock().await;
        let mut index = self.index(&guard)?;
        index.insert(record.sender.clone());
        let mut records = self.load_records(&guard, &record.sender);
        records.push(record.clone());
        let bytes = serde_json::to_vec(&records).map_err(|_| CoreError::Storage)?;
        guard
            .put(&Self::sender_key(&record.sender), &bytes)
            .map_err(|_| CoreError::Storage)?;
        self.persist_index(&mut guard, &index)?;
        Ok(true)
    }

    /// Distinct senders currently holding quarantined content.
    pub async fn pending_requests(&self) -> Vec<String> {
        let guard = self.store.lock().await;
        let mut senders: Vec<String> = self.index(&guard).unwrap_or_default().into_iter().collect();
        senders.sort();
        senders
    }

    /// Preview-safe view; nothing is committed or removed.
    pub async fn retrieve_for_inspection(&self, sender: &str) -> Vec<QuarantineRecord> {
        let guard = self.store.lock().await;
        self.load_records(&guard, sender)
    }

    /// Purges everything from `sender` (block or explicit decline).
    pub async fn reject(&self, sender: &str) -> Result<(), CoreError> {
        let mut guard = self.store.lock().await;
        let mut index = self.index(&guard)?;
        index.remove(sender);
        guard
            .delete(&Self::sender_key(sender))
            .map_err(|_| CoreError::Storage)?;
        self.persist_index(&mut guard, &index)
    }

    /// Removes and returns a sender's records for accept-promotion.
    /// A second call yields nothing, which keeps promotion at-most-once.
    pub async fn take(&self, sender: &str) -> Result<Vec<QuarantineRecord>, CoreError> {
        let mut guard = self.store.lock().await;
        let records = self.load_records(&guard, sender);
        let mut index = self.index(&guard)?;
        index.remove(sender);
        guard
            .delete(&Self::sender_key(sender))
            .map_err(|_| CoreError::Storage)?;
        self.persist_index(&mut guard, &index)?;
        Ok(records)
    }

    fn index(&self, store: &EncryptedStore) -> Result<HashSet<String>, CoreError> {
        if let Ok(Some(bytes)) = store.get("quarantine:index") {
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
            .put("quarantine:index", &bytes)
            .map_err(|_| CoreError::Storage)
    }

    fn load_records(&self, store: &EncryptedStore, sender: &str) -> Vec<QuarantineRecord> {
        store
            .get(&Self::sender_key(sender))
            .ok()
            .flatten()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default()
    }

    fn sender_key(sender: &str) -> String {
        format!("quarantine:{}", sender)
    }
}
