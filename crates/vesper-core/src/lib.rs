//! Device-local messaging core: outbound delivery pipeline, inbound
//! trust gate, encrypted persistence and cloud vault sync. Network and
//! platform concerns stay behind the `Transport`, `Directory`,
//! `KeyService` and `VaultProvider` seams.

pub mod config;
pub mod crypto;
pub mod directory;
pub mod envelope;
pub mod error;
pub mod event;
pub mod groups;
pub mod ids;
pub mod keys;
pub mod metadata;
pub mod outbox;
pub mod policy;
pub mod quarantine;
pub mod resolver;
pub mod strategy;
pub mod time;
pub mod transport;
pub mod vault;
pub mod worker;

#[cfg(test)]
mod tests;

use crate::config::CoreConfig;
use crate::crypto::{EncryptionKeypair, SigningKeypair};
use crate::directory::{ContactDirectory, Directory};
use crate::error::CoreError;
use crate::event::{CoreEvent, EventBus, EventReceiver, InboundEvent};
use crate::groups::GroupNetworkStorage;
use crate::keys::{CachedKeyService, KeyService};
use crate::outbox::{StoreTaskQueue, TaskQueue};
use crate::policy::Policy;
use crate::quarantine::{QuarantineRecord, QuarantineService};
use crate::resolver::IdentityResolver;
use crate::strategy::{SendContext, SendServices};
use crate::transport::Transport;
use crate::vault::{ChatVaultEngine, LocalHistory, VaultProvider};
use crate::worker::{DrainOutcome, OutboxWorker};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use vesper_api::types::{
    BlockScope, MessageKind, OutboundRequest, OutboundResult, PublicKeys, SendTarget,
    ValidationLimits,
};
use vesper_api::validation::validate_outbound_request;
use vesper_store::{EncryptedStore, KeyProvider};

const ENCRYPTION_SECRET_KEY: &str = "identity:encryption";
const SIGNING_SECRET_KEY: &str = "identity:signing";
const APPROVED_KEY: &str = "trust:approved";
const BLOCKED_KEY: &str = "trust:blocked";

/// Long-lived facade over the whole core. Cheap to clone; all state is
/// behind shared handles.
#[derive(Clone)]
pub struct Core {
    config: CoreConfig,
    policy: Policy,
    store: Arc<Mutex<EncryptedStore>>,
    contacts: ContactDirectory,
    resolver: IdentityResolver,
    directory: Arc<dyn Directory>,
    transport: Arc<dyn Transport>,
    queue: Arc<dyn TaskQueue>,
    worker: OutboxWorker,
    quarantine: QuarantineService,
    vault: ChatVaultEngine,
    groups: GroupNetworkStorage,
    events: EventBus,
    encryption: EncryptionKeypair,
    signing: SigningKeypair,
}

impl Core {
    /// Opens the encrypted store, loads or mints the device identity
    /// and wires every subsystem. The collaborator seams are the only
    /// injection points.
    pub fn init(
        config: CoreConfig,
        policy: Policy,
        key_provider: &dyn KeyProvider,
        directory: Arc<dyn Directory>,
        key_service: Arc<dyn KeyService>,
        transport: Arc<dyn Transport>,
        vault_provider: Arc<dyn VaultProvider>,
        history: Arc<dyn LocalHistory>,
    ) -> Result<Self, CoreError> {
        let mut store = EncryptedStore::open(&config.storage_path, &config.namespace, key_provider)
            .map_err(|_| CoreError::Storage)?;
        let encryption = load_or_create_encryption(&mut store)?;
        let signing = load_or_create_signing(&mut store)?;
        let store = Arc::new(Mutex::new(store));

        let contacts = ContactDirectory::new(store.clone());
        let resolver = IdentityResolver::new(
            contacts.clone(),
            directory.clone(),
            policy.directory_ttl_secs,
        );
        let cached_keys: Arc<dyn KeyService> =
            Arc::new(CachedKeyService::new(key_service, policy.key_ttl_secs));
        let queue: Arc<dyn TaskQueue> = Arc::new(StoreTaskQueue::new(store.clone()));
        let events = EventBus::new(256);
        let worker = OutboxWorker::new(
            queue.clone(),
            transport.clone(),
            cached_keys,
            events.clone(),
            policy.clone(),
        );
        let quarantine = QuarantineService::new(store.clone());
        let vault = ChatVaultEngine::new(vault_provider, history, store.clone(), policy.clone());
        let groups = GroupNetworkStorage::new(store.clone());

        tracing::info!(namespace = %config.namespace, "core initialized");
        Ok(Self {
            config,
            policy,
            store,
            contacts,
            resolver,
            directory,
            transport,
            queue,
            worker,
            quarantine,
            vault,
            groups,
            events,
            encryption,
            signing,
        })
    }

    pub fn identity_keys(&self) -> PublicKeys {
        PublicKeys {
            encryption: self.encryption.public,
            verifying: self.signing.public,
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    pub fn contacts(&self) -> &ContactDirectory {
        &self.contacts
    }

    pub fn resolver(&self) -> &IdentityResolver {
        &self.resolver
    }

    pub fn vault(&self) -> &ChatVaultEngine {
        &self.vault
    }

    pub fn group_storage(&self) -> &GroupNetworkStorage {
        &self.groups
    }

    pub fn quarantine(&self) -> &QuarantineService {
        &self.quarantine
    }

    fn limits(&self) -> ValidationLimits {
        ValidationLimits {
            max_payload_bytes: self.policy.max_payload_bytes,
            max_tag_len: self.policy.max_tag_len,
            max_tags: self.policy.max_tags,
        }
    }

    /// Entry point of the outbound pipeline: validate, pick the
    /// strategy from the target, persist the task(s), trigger a drain.
    /// Typing signals bypass the queue entirely when the config allows.
    pub async fn send(&self, request: OutboundRequest) -> Result<OutboundResult, CoreError> {
        validate_outbound_request(&request, &self.limits())
            .map_err(|err| CoreError::Validation(err.to_string()))?;
        if request.kind == MessageKind::Typing && self.config.allow_ephemeral {
            return self.send_ephemeral(request).await;
        }
        let services = SendServices {
            resolver: self.resolver.clone(),
            contacts: self.contacts.clone(),
            directory: self.directory.clone(),
            queue: self.queue.clone(),
            worker: self.worker.clone(),
        };
        let ctx = SendContext {
            request,
            signing: self.signing.clone(),
        };
        strategy::dispatch(&services, &ctx).await
    }

    async fn send_ephemeral(&self, request: OutboundRequest) -> Result<OutboundResult, CoreError> {
        let recipients = self.ephemeral_recipients(&request.target).await?;
        self.worker
            .send_ephemeral_batch(
                &recipients,
                request.kind.clone(),
                &request.payload,
                &request.sender.value,
                &self.signing,
            )
            .await;
        Ok(OutboundResult {
            message_id: request.client_message_id,
            task_ids: Vec::new(),
            recipients,
            skipped: Vec::new(),
        })
    }

    async fn ephemeral_recipients(&self, target: &SendTarget) -> Result<Vec<String>, CoreError> {
        match target {
            SendTarget::User { id } => Ok(vec![self.resolver.resolve_to_handle(id).await?]),
            SendTarget::LocalGroup { id } => {
                let members = self.contacts.local_group(id).await.ok_or(CoreError::NotFound)?;
                let mut out = Vec::new();
                for member in members {
                    if let Ok(handle) = self.resolver.resolve_to_handle(&member).await {
                        out.push(handle);
                    }
                }
                Ok(out)
            }
            SendTarget::NetworkGroup { id } => {
                let roster = self.directory.group_participants(id).await?;
                Ok(roster
                    .into_iter()
                    .map(|s| s.handle.value)
                    .filter(|h| *h != self.config.user_handle)
                    .collect())
            }
        }
    }

    /// Re-drives the persisted outbox. Safe to call from timers or
    /// connectivity-change hooks; overlapping calls coalesce.
    pub async fn process_outbox(&self) -> Result<DrainOutcome, CoreError> {
        self.worker
            .process_queue(&self.config.user_handle, &self.signing)
            .await
    }

    pub async fn outbox_tasks(&self) -> Result<Vec<outbox::OutboundTask>, CoreError> {
        self.queue.all_tasks().await
    }

    pub async fn cleanup_completed(&self) -> Result<usize, CoreError> {
        self.worker.cleanup_completed().await
    }

    pub async fn clear_outbox(&self) -> Result<(), CoreError> {
        self.worker.clear_all_tasks().await
    }

    /// One inbound poll: fetch a batch, gate each message through
    /// verify/decrypt/trust, acknowledge everything that was examined.
    /// Returns how many messages reached history or quarantine.
    pub async fn poll_once(&self) -> Result<usize, CoreError> {
        let batch = self
            .transport
            .message_batch(&self.config.user_handle, self.policy.inbound_batch_size)
            .await?;
        if batch.is_empty() {
            return Ok(0);
        }
        let approved = self.load_set(APPROVED_KEY).await?;
        let blocked = self.load_set(BLOCKED_KEY).await?;
        let mut accepted = 0usize;
        let mut acked = Vec::with_capacity(batch.len());
        for message in batch {
            acked.push(message.id);
            let envelope = message.envelope;
            if blocked.contains(&envelope.sender) {
                continue;
            }
            let Ok(Some(sender_keys)) = self.key_lookup(&envelope.sender).await else {
                tracing::debug!(sender = %envelope.sender, "inbound from unknown identity dropped");
                continue;
            };
            if !crypto::verify(
                &sender_keys.verifying,
                &envelope.signing_digest(),
                &envelope.signature,
            ) {
                tracing::warn!(sender = %envelope.sender, "inbound signature rejected");
                continue;
            }
            let Ok(plaintext) = crypto::decrypt(
                self.encryption.secret_bytes(),
                &envelope.encrypted_symmetric_key,
                &envelope.encrypted_data,
            ) else {
                tracing::warn!(sender = %envelope.sender, "inbound decrypt failed");
                continue;
            };
            if approved.contains(&envelope.sender) {
                self.publish_inbound(&envelope.sender, message.id, envelope.kind, &plaintext, envelope.timestamp);
            } else {
                self.quarantine
                    .process(
                        QuarantineRecord {
                            sender: envelope.sender.clone(),
                            message_id: message.id,
                            timestamp: envelope.timestamp,
                            kind: envelope.kind,
                            payload: plaintext,
                        },
                        &blocked,
                    )
                    .await?;
            }
            accepted += 1;
        }
        self.transport.acknowledge(&acked).await?;
        Ok(accepted)
    }

    async fn key_lookup(&self, sender: &str) -> Result<Option<PublicKeys>, CoreError> {
        // Worker holds the cached service; inbound verification reuses
        // the same cache through it.
        self.worker_keys().public_keys(sender).await
    }

    fn worker_keys(&self) -> Arc<dyn KeyService> {
        self.worker.key_service()
    }

    fn publish_inbound(
        &self,
        sender: &str,
        message_id: uuid::Uuid,
        kind: MessageKind,
        plaintext: &[u8],
        timestamp: u64,
    ) {
        let unwrapped = metadata::unwrap(plaintext);
        self.events.publish(CoreEvent::Inbound(InboundEvent {
            message_id,
            sender: sender.to_string(),
            conversation_id: unwrapped.conversation_id,
            kind,
            tags: unwrapped.tags,
            content: unwrapped.content,
            timestamp,
        }));
    }

    /// Promotes a quarantined sender: all held records surface as
    /// inbound events exactly once, and future traffic flows straight
    /// through.
    pub async fn accept_sender(&self, sender: &str) -> Result<usize, CoreError> {
        self.update_set(APPROVED_KEY, |set| {
            set.insert(sender.to_string());
        })
        .await?;
        let records = self.quarantine.take(sender).await?;
        let released = records.len();
        for record in records {
            self.publish_inbound(
                &record.sender,
                record.message_id,
                record.kind,
                &record.payload,
                record.timestamp,
            );
        }
        Ok(released)
    }

    /// Discards a sender's quarantined content without a trace.
    pub async fn reject_sender(&self, sender: &str) -> Result<(), CoreError> {
        self.quarantine.reject(sender).await
    }

    pub async fn pending_senders(&self) -> Vec<String> {
        self.quarantine.pending_requests().await
    }

    /// Blocks an identity and purges anything it already parked in
    /// quarantine.
    pub async fn block_sender(&self, sender: &str) -> Result<(), CoreError> {
        self.update_set(BLOCKED_KEY, |set| {
            set.insert(sender.to_string());
        })
        .await?;
        self.update_set(APPROVED_KEY, |set| {
            set.remove(sender);
        })
        .await?;
        self.quarantine.reject(sender).await
    }

    pub async fn unblock_sender(&self, sender: &str) -> Result<(), CoreError> {
        self.update_set(BLOCKED_KEY, |set| {
            set.remove(sender);
        })
        .await
    }

    pub async fn is_blocked(&self, sender: &str, scope: BlockScope) -> Result<bool, CoreError> {
        let local = self.load_set(BLOCKED_KEY).await?.contains(sender);
        if local {
            return Ok(true);
        }
        self.directory.is_blocked(sender, scope).await
    }

    /// Wipes every locally persisted record: outbox, quarantine,
    /// contacts, trust sets and identity keys. Logout semantics.
    pub async fn purge_local_state(&self) -> Result<(), CoreError> {
        let mut guard = self.store.lock().await;
        guard.clear().map_err(|_| CoreError::Storage)
    }

    async fn load_set(&self, key: &str) -> Result<HashSet<String>, CoreError> {
        let guard = self.store.lock().await;
        match guard.get(key).map_err(|_| CoreError::Storage)? {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|_| CoreError::Storage),
            None => Ok(HashSet::new()),
        }
    }

    async fn update_set(
        &self,
        key: &str,
        apply: impl FnOnce(&mut HashSet<String>),
    ) -> Result<(), CoreError> {
        let mut guard = self.store.lock().await;
        let mut set: HashSet<String> = match guard.get(key).map_err(|_| CoreError::Storage)? {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|_| CoreError::Storage)?,
            None => HashSet::new(),
        };
        apply(&mut set);
        let bytes = serde_json::to_vec(&set).map_err(|_| CoreError::Storage)?;
        guard.put(key, &bytes).map_err(|_| CoreError::Storage)
    }
}

fn load_or_create_encryption(store: &mut EncryptedStore) -> Result<EncryptionKeypair, CoreError> {
    if let Ok(Some(bytes)) = store.get(ENCRYPTION_SECRET_KEY) {
        let secret: [u8; 32] = bytes.try_into().map_err(|_| CoreError::Storage)?;
        return Ok(EncryptionKeypair::from_secret_bytes(secret));
    }
    let keys = crypto::generate_encryption_keys();
    store
        .put(ENCRYPTION_SECRET_KEY, keys.secret_bytes())
        .map_err(|_| CoreError::Storage)?;
    Ok(keys)
}

fn load_or_create_signing(store: &mut EncryptedStore) -> Result<SigningKeypair, CoreError> {
    if let Ok(Some(bytes)) = store.get(SIGNING_SECRET_KEY) {
        let secret: [u8; 32] = bytes.try_into().map_err(|_| CoreError::Storage)?;
        return Ok(SigningKeypair::from_secret_bytes(secret));
    }
    let keys = crypto::generate_signing_keys();
    store
        .put(SIGNING_SECRET_KEY, keys.secret_bytes())
        .map_err(|_| CoreError::Storage)?;
    Ok(keys)
}
