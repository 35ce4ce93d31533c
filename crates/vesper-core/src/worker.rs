use crate::crypto::{self, SigningKeypair};
use crate::envelope::SecureEnvelope;
use crate::error::{CoreError, DeliveryError};
use crate::event::{CoreEvent, DeliveryEvent, EventBus};
use crate::keys::KeyService;
use crate::outbox::{OutboundTask, RecipientProgress, TaskQueue};
use crate::policy::Policy;
use crate::time::now_ms;
use crate::transport::Transport;
use std::sync::Arc;
use tokio::sync::Mutex;
use vesper_api::types::{MessageKind, RecipientStatus, TaskStatus};

#[derive(Debug, PartialEq, Eq)]
pub enum DrainOutcome {
    /// One full pass over pending tasks ran.
    Drained { tasks: usize },
    /// Another pass was already in flight; this trigger folded into it.
    Coalesced,
}

/// Drains the persisted task queue. One attempt per eligible recipient
/// per pass; tasks settle across passes. A single-flight guard
/// serializes passes for this sender - overlapping triggers coalesce
/// instead of double-sending.
#[derive(Clone)]
pub struct OutboxWorker {
    queue: Arc<dyn TaskQueue>,
    transport: Arc<dyn Transport>,
    keys: Arc<dyn KeyService>,
    events: EventBus,
    policy: Policy,
    guard: Arc<Mutex<()>>,
}

impl OutboxWorker {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        transport: Arc<dyn Transport>,
        keys: Arc<dyn KeyService>,
        events: EventBus,
        policy: Policy,
    ) -> Self {
        Self {
            queue,
            transport,
            keys,
            events,
            policy,
            guard: Arc::new(Mutex::new(())),
        }
    }

    pub fn key_service(&self) -> Arc<dyn KeyService> {
        self.keys.clone()
    }

    pub async fn process_queue(
        &self,
        sender: &str,
        signing: &SigningKeypair,
    ) -> Result<DrainOutcome, CoreError> {
        let Ok(_pass) = self.guard.try_lock() else {
            return Ok(DrainOutcome::Coalesced);
        };
        let tasks = self.queue.pending_tasks().await?;
        let mut drained = 0usize;
        for task in tasks {
            if task.sender != sender {
                continue;
            }
            self.queue
                .update_task_status(&task.id, TaskStatus::Processing)
                .await?;
            self.drain_task(&task, signing).await?;
            drained += 1;
        }
        Ok(DrainOutcome::Drained { tasks: drained })
    }

    /// One attempt per unsettled recipient, each independent of its
    /// siblings, then terminal-state bookkeeping.
    async fn drain_task(
        &self,
        task: &OutboundTask,
        signing: &SigningKeypair,
    ) -> Result<(), CoreError> {
        for progress in task.recipients.iter() {
            if !self.eligible(progress) {
                continue;
            }
            let updated = self.deliver_recipient(task, progress, signing).await;
            self.queue
                .update_recipient_progress(&task.id, &updated)
                .await?;
            self.events.publish(CoreEvent::Delivery(DeliveryEvent {
                message_id: task.message_id,
                recipient: updated.recipient.clone(),
                status: updated.status,
                attempts: updated.attempts,
                error: updated.last_error.clone(),
            }));
        }
        let Some(current) = self.queue.task(&task.id).await? else {
            return Ok(());
        };
        let all_sent = current
            .recipients
            .iter()
            .all(|r| r.status == RecipientStatus::Sent);
        let all_settled = current.recipients.iter().all(|r| self.settled(r));
        let status = if all_sent {
            TaskStatus::Completed
        } else if all_settled {
            TaskStatus::Failed
        } else {
            TaskStatus::Queued
        };
        self.queue.update_task_status(&task.id, status).await
    }

    fn eligible(&self, progress: &RecipientProgress) -> bool {
        progress.status != RecipientStatus::Sent && progress.attempts < self.policy.retry_budget
    }

    fn settled(&self, progress: &RecipientProgress) -> bool {
        progress.status == RecipientStatus::Sent || progress.attempts >= self.policy.retry_budget
    }

    async fn deliver_recipient(
        &self,
        task: &OutboundTask,
        progress: &RecipientProgress,
        signing: &SigningKeypair,
    ) -> RecipientProgress {
        let mut updated = progress.clone();
        updated.last_attempt_ms = now_ms();
        match self.attempt(task, &progress.recipient, signing).await {
            Ok(()) => {
                updated.attempts += 1;
                updated.status = RecipientStatus::Sent;
                updated.last_error = None;
            }
            Err(err) => {
                if err.is_retryable() {
                    updated.attempts += 1;
                } else {
                    // Permanent outcomes exhaust the budget in one step.
                    updated.attempts = self.policy.retry_budget;
                }
                updated.status = RecipientStatus::Failed;
                updated.last_error = Some(err.to_string());
                tracing::debug!(
                    recipient = %progress.recipient,
                    attempts = updated.attempts,
                    error = %err,
                    "delivery attempt failed"
                );
            }
        }
        updated
    }

    async fn attempt(
        &self,
        task: &OutboundTask,
        recipient: &str,
        signing: &SigningKeypair,
    ) -> Result<(), DeliveryError> {
        let envelope = self
            .build_envelope(&task.sender, recipient, task.kind.clone(), &task.payload, signing)
            .await?;
        self.transport
            .send_message(envelope)
            .await
            .map_err(|err| DeliveryError::Transient(err.to_string()))
    }

    async fn build_envelope(
        &self,
        sender: &str,
        recipient: &str,
        kind: MessageKind,
        payload: &[u8],
        signing: &SigningKeypair,
    ) -> Result<SecureEnvelope, DeliveryError> {
        let keys = self
            .keys
            .public_keys(recipient)
            .await
            .map_err(|err| DeliveryError::Transient(err.to_string()))?
            .ok_or_else(|| DeliveryError::Permanent("missing public keys".to_string()))?;
        let sealed =
            crypto::encrypt(&keys.encryption, payload).map_err(|_| DeliveryError::Crypto)?;
        let mut envelope = SecureEnvelope {
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            kind,
            encrypted_symmetric_key: sealed.encrypted_symmetric_key,
            encrypted_data: sealed.encrypted_data,
            signature: Vec::new(),
            timestamp: now_ms(),
        };
        envelope.signature = crypto::sign(signing, &envelope.signing_digest());
        Ok(envelope)
    }

    /// Best-effort fan-out for short-lived signals. No persistence, no
    /// retry; per-recipient failures are dropped on the floor.
    pub async fn send_ephemeral_batch(
        &self,
        recipients: &[String],
        kind: MessageKind,
        payload: &[u8],
        sender: &str,
        signing: &SigningKeypair,
    ) {
        for recipient in recipients {
            match self
                .build_envelope(sender, recipient, kind.clone(), payload, signing)
                .await
            {
                Ok(envelope) => {
                    if let Err(err) = self.transport.send_message(envelope).await {
                        tracing::debug!(recipient = %recipient, error = %err, "ephemeral send dropped");
                    }
                }
                Err(err) => {
                    tracing::debug!(recipient = %recipient, error = %err, "ephemeral envelope dropped");
                }
            }
        }
    }

    /// Administrative purge: removes every persisted task regardless of
    /// status. In-flight network calls are not preempted.
    pub async fn clear_all_tasks(&self) -> Result<(), CoreError> {
        self.queue.clear_all().await
    }

    /// Completion-cleanup: drops terminal completed tasks from the
    /// queue store.
    pub async fn cleanup_completed(&self) -> Result<usize, CoreError> {
        let mut removed = 0usize;
        for task in self.queue.all_tasks().await? {
            if task.status == TaskStatus::Completed {
                self.queue.delete_task(&task.id).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
