pub mod resolver_tests;
pub mod vault_tests;
pub mod worker_tests;

use crate::config::CoreConfig;
use crate::crypto::{self, SigningKeypair};
use crate::directory::InMemoryDirectory;
use crate::envelope::SecureEnvelope;
use crate::keys::InMemoryKeyService;
use crate::policy::Policy;
use crate::time::now_ms;
use crate::transport::MockTransport;
use crate::vault::{InMemoryHistory, InMemoryVaultProvider};
use crate::Core;
use std::sync::Arc;
use uuid::Uuid;
use vesper_api::types::MessageKind;
use vesper_store::{EncryptedStore, KeyProvider, MasterKey, StoreError};

#[derive(Clone)]
pub struct TestKeyProvider;

impl KeyProvider for TestKeyProvider {
    fn get_or_create_master_key(&self) -> Result<MasterKey, StoreError> {
        Ok(MasterKey::new([7u8; 32]))
    }
}

pub fn temp_path(label: &str) -> String {
    format!("/tmp/{}-{}", label, Uuid::new_v4())
}

pub fn base_config(path: String, handle: &str) -> CoreConfig {
    CoreConfig {
        storage_path: path,
        namespace: "test".to_string(),
        user_handle: handle.to_string(),
        allow_ephemeral: true,
    }
}

pub struct TestEnv {
    pub core: Core,
    pub transport: MockTransport,
    pub directory: InMemoryDirectory,
    pub key_service: Arc<InMemoryKeyService>,
}

pub fn build_env(label: &str, handle: &str, policy: Policy) -> TestEnv {
    let transport = MockTransport::new();
    let directory = InMemoryDirectory::new();
    let key_service = Arc::new(InMemoryKeyService::new());
    let core = Core::init(
        base_config(temp_path(label), handle),
        policy,
        &TestKeyProvider,
        Arc::new(directory.clone()),
        key_service.clone(),
        Arc::new(transport.clone()),
        Arc::new(InMemoryVaultProvider::new()),
        Arc::new(InMemoryHistory::new()),
    )
    .expect("core init");
    TestEnv {
        core,
        transport,
        directory,
        key_service,
    }
}

/// Registers public keys for `handle` and returns the matching
/// signing keypair so tests can forge valid inbound traffic.
pub async fn register_peer(
    key_service: &InMemoryKeyService,
    handle: &str,
) -> (crypto::EncryptionKeypair, SigningKeypair) {
    let enc = crypto::generate_encryption_keys();
    let sig = crypto::generate_signing_keys();
    key_service
        .register(
            handle,
            vesper_api::types::PublicKeys {
                encryption: enc.public,
                verifying: sig.public,
            },
        )
        .await;
    (enc, sig)
}

/// Builds a wire-valid envelope from `sender` to `recipient`.
pub fn sealed_envelope(
    sender: &str,
    recipient: &str,
    recipient_encryption: &[u8; 32],
    signing: &SigningKeypair,
    kind: MessageKind,
    payload: &[u8],
) -> SecureEnvelope {
    let sealed = crypto::encrypt(recipient_encryption, payload).expect("encrypt");
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
    envelope
}

pub fn text_request(
    sender: &str,
    target: vesper_api::types::SendTarget,
    payload: &[u8],
) -> vesper_api::types::OutboundRequest {
    vesper_api::types::OutboundRequest {
        client_message_id: vesper_api::types::MessageId::random(),
        conversation_id: None,
        sender: vesper_api::types::UserHandle {
            value: sender.to_string(),
        },
        target,
        kind: MessageKind::Text,
        payload: payload.to_vec(),
        tags: Vec::new(),
    }
}

pub fn shared_store(label: &str) -> Arc<tokio::sync::Mutex<EncryptedStore>> {
    let store =
        EncryptedStore::open(temp_path(label), "test", &TestKeyProvider).expect("open store");
    Arc::new(tokio::sync::Mutex::new(store))
}
