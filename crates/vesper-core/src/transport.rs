use crate::envelope::{QueuedMessage, SecureEnvelope};
use crate::error::CoreError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Transport collaborator. Timeouts and wire framing live behind this
/// seam; the core only sees acks and batches.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_message(&self, envelope: SecureEnvelope) -> Result<(), CoreError>;
    async fn message_batch(&self, recipient: &str, limit: u32)
        -> Result<Vec<QueuedMessage>, CoreError>;
    async fn acknowledge(&self, ids: &[Uuid]) -> Result<(), CoreError>;
}

#[derive(Default)]
struct MockState {
    mailboxes: HashMap<String, Vec<QueuedMessage>>,
    fail_next: usize,
    sent: usize,
}

#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` sends fail with a transport error.
    pub async fn fail_next(&self, count: usize) {
        self.inner.lock().await.fail_next = count;
    }

    pub async fn sent_count(&self) -> usize {
        self.inner.lock().await.sent
    }

    pub async fn inject(&self, recipient: &str, envelope: SecureEnvelope) {
        let mut guard = self.inner.lock().await;
        guard
            .mailboxes
            .entry(recipient.to_string())
            .or_default()
            .push(QueuedMessage {
                id: Uuid::new_v4(),
                envelope,
            });
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_message(&self, envelope: SecureEnvelope) -> Result<(), CoreError> {
        let mut guard = self.inner.lock().await;
        if guard.fail_next > 0 {
            guard.fail_next -= 1;
            return Err(CoreError::Transport("mock".to_string()));
        }
        guard.sent += 1;
        let recipient = envelope.recipient.clone();
        guard
            .mailboxes
            .entry(recipient)
            .or_default()
            .push(QueuedMessage {
                id: Uuid::new_v4(),
                envelope,
            });
        Ok(())
    }

    async fn message_batch(
        &self,
        recipient: &str,
        limit: u32,
    ) -> Result<Vec<QueuedMessage>, CoreError> {
        let guard = self.inner.lock().await;
        let out = guard
            .mailboxes
            .get(recipient)
            .map(|queue| queue.iter().take(limit as usize).cloned().collect())
            .unwrap_or_default();
        Ok(out)
    }

    async fn acknowledge(&self, ids: &[Uuid]) -> Result<(), CoreError> {
        let mut guard = self.inner.lock().await;
        for queue in guard.mailboxes.values_mut() {
            queue.retain(|msg| !ids.contains(&msg.id));
        }
        Ok(())
    }
}
