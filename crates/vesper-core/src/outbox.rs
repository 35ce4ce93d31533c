use crate::error::CoreError;
use crate::time::now_ms;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;
use vesper_api::types::{MessageKind, RecipientStatus, TaskStatus};
use vesper_store::EncryptedStore;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecipientProgress {
    pub recipient: String,
    pub status: RecipientStatus,
    pub attempts: u32,
    pub last_attempt_ms: u64,
    pub last_error: Option<String>,
}

impl RecipientProgress {
    pub fn pending(recipient: &str) -> Self {
        Self {
            recipient: recipient.to_string(),
            status: RecipientStatus::Pending,
            attempts: 0,
            last_attempt_ms: 0,
            last_error: None,
        }
    }
}

/// Persisted fan-out unit. The recipient list is fixed at creation;
/// only the worker mutates progress.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutboundTask {
    pub id: Uuid,
    pub message_id: Uuid,
    pub sender: String,
    pub conversation_id: Option<String>,
    pub kind: MessageKind,
    pub payload: Vec<u8>,
    pub tags: Vec<String>,
    pub recipients: Vec<RecipientProgress>,
    pub status: TaskStatus,
    pub created_at_ms: u64,
}

#[derive(Clone, Debug)]
pub struct EnqueueRequest {
    pub message_id: Uuid,
    pub sender: String,
    pub conversation_id: Option<String>,
    pub kind: MessageKind,
    pub payload: Vec<u8>,
    pub tags: Vec<String>,
    pub recipients: Vec<String>,
}

/// Persisted task queue contract consumed by the worker.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<Uuid, CoreError>;
    async fn pending_tasks(&self) -> Result<Vec<OutboundTask>, CoreError>;
    async fn all_tasks(&self) -> Result<Vec<OutboundTask>, CoreError>;
    async fn task(&self, id: &Uuid) -> Result<Option<OutboundTask>, CoreError>;
    async fn update_task_status(&self, id: &Uuid, status: TaskStatus) -> Result<(), CoreError>;
    async fn update_recipient_progress(
        &self,
        id: &Uuid,
        progress: &RecipientProgress,
    ) -> Result<(), CoreError>;
    async fn delete_task(&self, id: &Uuid) -> Result<(), CoreError>;
    async fn clear_all(&self) -> Result<(), CoreError>;
}

#[derive(Clone)]
pub struct StoreTaskQueue {
    store: Arc<Mutex<EncryptedStore>>,
}

impl StoreTaskQueue {
    pub fn new(store: Arc<Mutex<EncryptedStore>>) -> Self {
        Self { store }
    }

    fn index(&self, store: &EncryptedStore) -> Result<HashSet<Uuid>, CoreError> {
        if let Ok(Some(bytes)) = store.get("outbox:index") {
            serde_json::from_slice(&bytes).map_err(|_| CoreError::Storage)
        } else {
            Ok(HashSet::new())
        }
    }

    fn persist_index(
        &self,
        store: &mut EncryptedStore,
        index: &HashSet<Uuid>,
    ) -> Result<(), CoreError> {
        let bytes = serde_json::to_vec(index).map_err(|_| CoreError::Storage)?;
        store
            .put("outbox:index", &bytes)
            .map_err(|_| CoreError::Storage)
    }

    fn load_task(&self, store: &EncryptedStore, id: &Uuid) -> Option<OutboundTask> {
        store
            .get(&Self::task_key(id))
            .ok()
            .flatten()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
    }

    fn save_task(&self, store: &mut EncryptedStore, task: &OutboundTask) -> Result<(), CoreError> {
        let bytes = serde_json::to_vec(task).map_err(|_| CoreError::Storage)?;
        store
            .put(&Self::task_key(&task.id), &bytes)
            .map_err(|_| CoreError::Storage)
    }

    fn task_key(id: &Uuid) -> String {
        format!("outbox:{}", id)
    }
}

#[async_trait]
impl TaskQueue for StoreTaskQueue {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<Uuid, CoreError> {
        if request.recipients.is_empty() {
            return Err(CoreError::Validation("recipients".to_string()));
        }
        let task = OutboundTask {
            id: Uuid::new_v4(),
            message_id: request.message_id,
            sender: request.sender,
            conversation_id: request.conversation_id,
            kind: request.kind,
            payload: request.payload,
            tags: request.tags,
            recipients: request
                .recipients
                .iter()
                .map(|r| RecipientProgress::pending(r))
                .collect(),
            status: TaskStatus::Queued,
            created_at_ms: now_ms(),
        };
        let mut guard = self.store.lock().await;
        let mut index = self.index(&guard)?;
        index.insert(task.id);
        self.save_task(&mut guard, &task)?;
        self.persist_index(&mut guard, &index)?;
        Ok(task.id)
    }

    async fn pending_tasks(&self) -> Result<Vec<OutboundTask>, CoreError> {
        let guard = self.store.lock().await;
        let index = self.index(&guard)?;
        let mut tasks: Vec<OutboundTask> = index
            .iter()
            .filter_map(|id| self.load_task(&guard, id))
            .filter(|task| {
                matches!(task.status, TaskStatus::Queued | TaskStatus::Processing)
            })
            .collect();
        tasks.sort_by_key(|task| (task.created_at_ms, task.id));
        Ok(tasks)
    }

    async fn all_tasks(&self) -> Result<Vec<OutboundTask>, CoreError> {
        let guard = self.store.lock().await;
        let index = self.index(&guard)?;
        let mut tasks: Vec<OutboundTask> = index
            .iter()
            .filter_map(|id| self.load_task(&guard, id))
            .collect();
        tasks.sort_by_key(|task| (task.created_at_ms, task.id));
        Ok(tasks)
    }

    async fn task(&self, id: &Uuid) -> Result<Option<OutboundTask>, CoreError> {
        let guard = self.store.lock().await;
        Ok(self.load_task(&guard, id))
    }

    async fn update_task_status(&self, id: &Uuid, status: TaskStatus) -> Result<(), CoreError> {
        let mut guard = self.store.lock().await;
        let Some(mut task) = self.load_task(&guard, id) else {
            return Ok(());
        };
        task.status = status;
        self.save_task(&mut guard, &task)
    }

    async fn update_recipient_progress(
        &self,
        id: &Uuid,
        progress: &RecipientProgress,
    ) -> Result<(), CoreError> {
        let mut guard = self.store.lock().await;
        let Some(mut task) = self.load_task(&guard, id) else {
            return Ok(());
        };
        match task
            .recipients
            .iter_mut()
            .find(|r| r.recipient == progress.recipient)
        {
            Some(entry) => *entry = progress.clone(),
            None => return Err(CoreError::NotFound),
        }
        self.save_task(&mut guard, &task)
    }

    async fn delete_task(&self, id: &Uuid) -> Result<(), CoreError> {
        let mut guard = self.store.lock().await;
        let mut index = self.index(&guard)?;
        index.remove(id);
        guard
            .delete(&Self::task_key(id))
            .map_err(|_| CoreError::Storage)?;
        self.persist_index(&mut guard, &index)
    }

    async fn clear_all(&self) -> Result<(), CoreError> {
        let mut guard = self.store.lock().await;
        let index = self.index(&guard)?;
        for id in index.iter() {
            guard
                .delete(&Self::task_key(id))
                .map_err(|_| CoreError::Storage)?;
        }
        self.persist_index(&mut guard, &HashSet::new())
    }
}
