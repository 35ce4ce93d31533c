use crate::error::CoreError;
use crate::ids::vault_id_for_ms;
use crate::policy::Policy;
use crate::time::now_ms;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;
use vesper_api::types::MessageKind;
use vesper_store::EncryptedStore;

/// Serialized history record inside a snapshot or delta file.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct VaultMessage {
    pub id: Uuid,
    pub conversation_id: String,
    pub sender: String,
    pub kind: MessageKind,
    pub content: Vec<u8>,
    pub timestamp: u64,
}

/// One vault file. A snapshot is the compacted full state
/// (sequence 0); a delta is an incremental append under the same
/// vault id.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct VaultFile {
    pub vault_id: String,
    pub sequence: u64,
    pub range_start_ms: u64,
    pub range_end_ms: u64,
    pub messages: Vec<VaultMessage>,
    pub tombstones: Vec<Uuid>,
    pub participants: Vec<String>,
    pub message_count: usize,
}

/// Pluggable cloud storage driver.
#[async_trait]
pub trait VaultProvider: Send + Sync {
    async fn link(&self) -> Result<(), CoreError>;
    async fn unlink(&self) -> Result<(), CoreError>;
    async fn is_authenticated(&self) -> bool;
    async fn write_json(&self, path: &str, data: &serde_json::Value) -> Result<(), CoreError>;
    async fn read_json(&self, path: &str) -> Result<Option<serde_json::Value>, CoreError>;
    async fn list_files(&self, dir: &str) -> Result<Vec<String>, CoreError>;
    async fn upload_public_asset(&self, blob: &[u8], name: &str) -> Result<String, CoreError>;
}

/// Source of local history the engine backs up.
#[async_trait]
pub trait LocalHistory: Send + Sync {
    async fn messages_after(&self, cursor_ms: u64) -> Result<Vec<VaultMessage>, CoreError>;
    async fn tombstones(&self) -> Result<Vec<Uuid>, CoreError>;
}

#[derive(Default)]
struct InMemoryProviderState {
    files: BTreeMap<String, serde_json::Value>,
    authenticated: bool,
}

#[derive(Clone)]
pub struct InMemoryVaultProvider {
    inner: Arc<Mutex<InMemoryProviderState>>,
}

impl Default for InMemoryVaultProvider {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(InMemoryProviderState {
                files: BTreeMap::new(),
                authenticated: true,
            })),
        }
    }
}

impl InMemoryVaultProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites a stored file with unparsable content.
    pub async fn corrupt(&self, path: &str) {
        self.inner
            .lock()
            .await
            .files
            .insert(path.to_string(), serde_json::Value::String("garbage".to_string()));
    }

    pub async fn file_count(&self, dir: &str) -> usize {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        self.inner
            .lock()
            .await
            .files
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .count()
    }
}

#[async_trait]
impl VaultProvider for InMemoryVaultProvider {
    async fn link(&self) -> Result<(), CoreError> {
        self.inner.lock().await.authenticated = true;
        Ok(())
    }

    async fn unlink(&self) -> Result<(), CoreError> {
        self.inner.lock().await.authenticated = false;
        Ok(())
    }

    async fn is_authenticated(&self) -> bool {
        self.inner.lock().await.authenticated
    }

    async fn write_json(&self, path: &str, data: &serde_json::Value) -> Result<(), CoreError> {
        self.inner
            .lock()
            .await
            .files
            .insert(path.to_string(), data.clone());
        Ok(())
    }

    async fn read_json(&self, path: &str) -> Result<Option<serde_json::Value>, CoreError> {
        Ok(self.inner.lock().await.files.get(path).cloned())
    }

    async fn list_files(&self, dir: &str) -> Result<Vec<String>, CoreError> {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        Ok(self
            .inner
            .lock()
            .await
            .files
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect())
    }

    async fn upload_public_asset(&self, _blob: &[u8], name: &str) -> Result<String, CoreError> {
        Ok(format!("https://assets.invalid/{}", name))
    }
}

#[derive(Clone, Default)]
pub struct InMemoryHistory {
    inner: Arc<Mutex<(Vec<VaultMessage>, Vec<Uuid>)>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, message: VaultMessage) {
        self.inner.lock().await.0.push(message);
    }

    pub async fn tombstone(&self, id: Uuid) {
        self.inner.lock().await.1.push(id);
    }
}

#[async_trait]
impl LocalHistory for InMemoryHistory {
    async fn messages_after(&self, cursor_ms: u64) -> Result<Vec<VaultMessage>, CoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .0
            .iter()
            .filter(|m| m.timestamp > cursor_ms)
            .cloned()
            .collect())
    }

    async fn tombstones(&self) -> Result<Vec<Uuid>, CoreError> {
        Ok(self.inner.lock().await.1.clone())
    }
}

/// Snapshot+delta backup of message history against a storage driver.
/// Backup/restore for one vault id is serialized by a per-key lock;
/// the sync cursor never moves backwards.
#[derive(Clone)]
pub struct ChatVaultEngine {
    provider: Arc<dyn VaultProvider>,
    history: Arc<dyn LocalHistory>,
    store: Arc<Mutex<EncryptedStore>>,
    policy: Policy,
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl ChatVaultEngine {
    pub fn new(
        provider: Arc<dyn VaultProvider>,
        history: Arc<dyn LocalHistory>,
        store: Arc<Mutex<EncryptedStore>>,
        policy: Policy,
    ) -> Self {
        Self {
            provider,
            history,
            store,
            policy,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Writes one delta per month that has messages newer than that
    /// month's cursor, then advances the cursors. Nothing new, no
    /// files. Returns the (vault id, sequence) pairs written.
    pub async fn backup(&self) -> Result<Vec<(String, u64)>, CoreError> {
        if !self.provider.is_authenticated().await {
            return Err(CoreError::Transport("vault not linked".to_string()));
        }
        let mut by_vault: BTreeMap<String, Vec<VaultMessage>> = BTreeMap::new();
        for message in self.history.messages_after(0).await? {
            by_vault
                .entry(vault_id_for_ms(message.timestamp))
                .or_default()
                .push(message);
        }
        let tombstones = self.history.tombstones().await?;
        let mut written = Vec::new();
        for (vault_id, candidates) in by_vault {
            if let Some(sequence) = self
                .backup_vault(&vault_id, candidates, &tombstones)
                .await?
            {
                written.push((vault_id, sequence));
            }
        }
        Ok(written)
    }

    async fn backup_vault(
        &self,
        vault_id: &str,
        candidates: Vec<VaultMessage>,
        tombstones: &[Uuid],
    ) -> Result<Option<u64>, CoreError> {
        let lock = self.vault_lock(vault_id).await;
        let _serial = lock.lock().await;

        let cursor = self.read_counter(&Self::cursor_key(vault_id)).await?;
        let messages: Vec<VaultMessage> = candidates
            .into_iter()
            .filter(|m| m.timestamp > cursor)
            .collect();
        if messages.is_empty() {
            return Ok(None);
        }
        let sequence = self.read_counter(&Self::seq_key(vault_id)).await? + 1;
        let newest = messages.iter().map(|m| m.timestamp).max().unwrap_or(cursor);
        let oldest = messages.iter().map(|m| m.timestamp).min().unwrap_or(cursor);
        let delta = VaultFile {
            vault_id: vault_id.to_string(),
            sequence,
            range_start_ms: oldest,
            range_end_ms: newest,
            participants: Self::participants(&messages),
            message_count: messages.len(),
            messages,
            tombstones: tombstones.to_vec(),
        };
        let value = serde_json::to_value(&delta).map_err(|_| CoreError::Storage)?;
        self.provider
            .write_json(&Self::delta_path(vault_id, sequence), &value)
            .await?;

        self.write_counter(&Self::seq_key(vault_id), sequence).await?;
        if newest > cursor {
            self.write_counter(&Self::cursor_key(vault_id), newest)
                .await?;
        }
        Ok(Some(sequence))
    }

    /// Merged view of the current month: snapshot plus every readable
    /// delta, deduplicated by message id (last-write-wins by
    /// timestamp), tombstoned ids removed. Triggers compaction when the
    /// delta count exceeds the policy threshold.
    pub async fn restore(&self) -> Result<Vec<VaultMessage>, CoreError> {
        self.restore_vault(&vault_id_for_ms(now_ms())).await
    }

    pub async fn restore_vault(&self, vault_id: &str) -> Result<Vec<VaultMessage>, CoreError> {
        if !self.provider.is_authenticated().await {
            return Err(CoreError::Transport("vault not linked".to_string()));
        }
        let lock = self.vault_lock(vault_id).await;
        let _serial = lock.lock().await;
        self.restore_locked(vault_id).await
    }

    async fn restore_locked(&self, vault_id: &str) -> Result<Vec<VaultMessage>, CoreError> {
        let dir = Self::vault_dir(vault_id);
        let files = self.provider.list_files(&dir).await?;
        let mut merged: HashMap<Uuid, VaultMessage> = HashMap::new();
        let mut tombstones: HashSet<Uuid> = HashSet::new();
        let mut delta_count = 0usize;

        let snapshot_path = Self::snapshot_path(vault_id);
        for path in files.iter() {
            let is_snapshot = *path == snapshot_path;
            if !is_snapshot {
                delta_count += 1;
            }
            match self.read_vault_file(path).await {
                Some(file) => {
                    for message in file.messages {
                        Self::merge_message(&mut merged, message);
                    }
                    tombstones.extend(file.tombstones);
                }
                None => {
                    // A corrupt file never aborts the restore.
                    tracing::warn!(path = %path, "skipping unreadable vault file");
                }
            }
        }
        for id in tombstones.iter() {
            merged.remove(id);
        }
        let mut result: Vec<VaultMessage> = merged.into_values().collect();
        result.sort_by_key(|m| (m.timestamp, m.id));

        if delta_count > self.policy.vault_compaction_threshold {
            self.compact(vault_id, &result, &tombstones).await?;
        }
        Ok(result)
    }

    /// Writes the merged state as the month's snapshot. Old deltas are
    /// deliberately kept: merge is idempotent and dedup-safe, so a
    /// half-finished compaction can never corrupt state.
    async fn compact(
        &self,
        vault_id: &str,
        messages: &[VaultMessage],
        tombstones: &HashSet<Uuid>,
    ) -> Result<(), CoreError> {
        let newest = messages.iter().map(|m| m.timestamp).max().unwrap_or(0);
        let oldest = messages.iter().map(|m| m.timestamp).min().unwrap_or(0);
        let snapshot = VaultFile {
            vault_id: vault_id.to_string(),
            sequence: 0,
            range_start_ms: oldest,
            range_end_ms: newest,
            participants: Self::participants(messages),
            message_count: messages.len(),
            messages: messages.to_vec(),
            tombstones: tombstones.iter().copied().collect(),
        };
        let value = serde_json::to_value(&snapshot).map_err(|_| CoreError::Storage)?;
        self.provider
            .write_json(&Self::snapshot_path(vault_id), &value)
            .await?;
        tracing::info!(vault_id = %vault_id, messages = messages.len(), "vault compacted");
        Ok(())
    }

    async fn read_vault_file(&self, path: &str) -> Option<VaultFile> {
        match self.provider.read_json(path).await {
            Ok(Some(value)) => serde_json::from_value(value).ok(),
            Ok(None) => None,
            Err(_) => None,
        }
    }

    fn merge_message(merged: &mut HashMap<Uuid, VaultMessage>, message: VaultMessage) {
        match merged.get(&message.id) {
            Some(existing) if existing.timestamp >= message.timestamp => {}
            _ => {
                merged.insert(message.id, message);
            }
        }
    }

    fn participants(messages: &[VaultMessage]) -> Vec<String> {
        let mut set: Vec<String> = messages
            .iter()
            .map(|m| m.sender.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        set.sort();
        set
    }

    async fn vault_lock(&self, vault_id: &str) -> Arc<Mutex<()>> {
        let mut guard = self.locks.lock().await;
        guard
            .entry(vault_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn read_counter(&self, key: &str) -> Result<u64, CoreError> {
        let guard = self.store.lock().await;
        match guard.get(key).map_err(|_| CoreError::Storage)? {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|_| CoreError::Storage),
            None => Ok(0),
        }
    }

    async fn write_counter(&self, key: &str, value: u64) -> Result<(), CoreError> {
        let mut guard = self.store.lock().await;
        let bytes = serde_json::to_vec(&value).map_err(|_| CoreError::Storage)?;
        guard.put(key, &bytes).map_err(|_| CoreError::Storage)
    }

    pub async fn cursor(&self, vault_id: &str) -> Result<u64, CoreError> {
        self.read_counter(&Self::cursor_key(vault_id)).await
    }

    fn vault_dir(vault_id: &str) -> String {
        format!("vault/{}", vault_id)
    }

    fn delta_path(vault_id: &str, sequence: u64) -> String {
        format!("vault/{}/delta_{:06}.json", vault_id, sequence)
    }

    fn snapshot_path(vault_id: &str) -> String {
        format!("vault/{}/snapshot.json", vault_id)
    }

    fn cursor_key(vault_id: &str) -> String {
        format!("vault:cursor:{}", vault_id)
    }

    fn seq_key(vault_id: &str) -> String {
        format!("vault:seq:{}", vault_id)
    }
}
