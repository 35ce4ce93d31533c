use super::shared_store;
use crate::policy::Policy;
use crate::vault::{ChatVaultEngine, InMemoryHistory, InMemoryVaultProvider, VaultMessage, VaultProvider};
use std::sync::Arc;
use uuid::Uuid;
use vesper_api::types::MessageKind;

// 2024-01-01T00:00:00Z
const JAN_2024_MS: u64 = 1_704_067_200_000;
// 2024-02-01T00:00:00Z
const FEB_2024_MS: u64 = 1_706_745_600_000;

struct Fixture {
    engine: ChatVaultEngine,
    provider: InMemoryVaultProvider,
    history: InMemoryHistory,
}

fn fixture(label: &str, policy: Policy) -> Fixture {
    let provider = InMemoryVaultProvider::new();
    let history = InMemoryHistory::new();
    let engine = ChatVaultEngine::new(
        Arc::new(provider.clone()),
        Arc::new(history.clone()),
        shared_store(label),
        policy,
    );
    Fixture {
        engine,
        provider,
        history,
    }
}

fn message(timestamp: u64, body: &str) -> VaultMessage {
    VaultMessage {
        id: Uuid::new_v4(),
        conversation_id: "conv-1".to_string(),
        sender: "@alice".to_string(),
        kind: MessageKind::Text,
        content: body.as_bytes().to_vec(),
        timestamp,
    }
}

#[tokio::test]
async fn epoch_batching_writes_one_delta_and_advances_cursor() {
    let fx = fixture("vault-epoch", Policy::default());
    for i in 0..5u64 {
        fx.history.push(message(JAN_2024_MS + i * 1000, "msg")).await;
    }

    let written = fx.engine.backup().await.expect("backup");
    assert_eq!(written, vec![("2024_01".to_string(), 1)]);
    assert_eq!(fx.provider.file_count("vault/2024_01").await, 1);
    assert_eq!(
        fx.engine.cursor("2024_01").await.expect("cursor"),
        JAN_2024_MS + 4000
    );
}

#[tokio::test]
async fn backup_without_new_messages_writes_nothing() {
    let fx = fixture("vault-noop", Policy::default());
    fx.history.push(message(JAN_2024_MS, "only")).await;
    fx.engine.backup().await.expect("first");

    let written = fx.engine.backup().await.expect("second");
    assert!(written.is_empty());
    assert_eq!(fx.provider.file_count("vault/2024_01").await, 1);
    assert_eq!(fx.engine.cursor("2024_01").await.expect("cursor"), JAN_2024_MS);
}

#[tokio::test]
async fn messages_partition_into_monthly_vaults() {
    let fx = fixture("vault-months", Policy::default());
    fx.history.push(message(JAN_2024_MS + 500, "january")).await;
    fx.history.push(message(FEB_2024_MS + 500, "february")).await;

    let written = fx.engine.backup().await.expect("backup");
    assert_eq!(
        written,
        vec![("2024_01".to_string(), 1), ("2024_02".to_string(), 1)]
    );
    assert_eq!(fx.provider.file_count("vault/2024_01").await, 1);
    assert_eq!(fx.provider.file_count("vault/2024_02").await, 1);
}

#[tokio::test]
async fn restore_merges_deltas_and_is_repeatable() {
    let fx = fixture("vault-restore", Policy::default());
    for i in 0..3u64 {
        fx.history.push(message(JAN_2024_MS + i * 1000, "early")).await;
    }
    fx.engine.backup().await.expect("backup 1");
    for i in 3..5u64 {
        fx.history.push(message(JAN_2024_MS + i * 1000, "late")).await;
    }
    fx.engine.backup().await.expect("backup 2");

    let first = fx.engine.restore_vault("2024_01").await.expect("restore");
    assert_eq!(first.len(), 5);
    assert!(first.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

    let second = fx.engine.restore_vault("2024_01").await.expect("restore again");
    assert_eq!(first, second);
}

#[tokio::test]
async fn tombstoned_messages_never_come_back() {
    let fx = fixture("vault-tombstone", Policy::default());
    let victim = message(JAN_2024_MS + 1000, "delete me");
    let victim_id = victim.id;
    fx.history.push(victim).await;
    fx.history.push(message(JAN_2024_MS + 2000, "keep me")).await;
    fx.engine.backup().await.expect("backup 1");

    fx.history.tombstone(victim_id).await;
    fx.history.push(message(JAN_2024_MS + 3000, "newer")).await;
    fx.engine.backup().await.expect("backup 2");

    let restored = fx.engine.restore_vault("2024_01").await.expect("restore");
    assert_eq!(restored.len(), 2);
    assert!(restored.iter().all(|m| m.id != victim_id));
}

#[tokio::test]
async fn corrupt_delta_is_skipped_not_fatal() {
    let fx = fixture("vault-corrupt", Policy::default());
    fx.history.push(message(JAN_2024_MS + 1000, "lost")).await;
    fx.engine.backup().await.expect("backup 1");
    fx.history.push(message(JAN_2024_MS + 2000, "survives")).await;
    fx.engine.backup().await.expect("backup 2");

    fx.provider.corrupt("vault/2024_01/delta_000001.json").await;

    let restored = fx.engine.restore_vault("2024_01").await.expect("restore");
    assert_eq!(restored.len(), 1);
    assert_eq!(restored[0].content, b"survives");
}

#[tokio::test]
async fn compaction_snapshots_past_the_delta_threshold() {
    let policy = Policy {
        vault_compaction_threshold: 2,
        ..Policy::default()
    };
    let fx = fixture("vault-compact", policy);
    for i in 0..3u64 {
        fx.history.push(message(JAN_2024_MS + i * 1000, "msg")).await;
        fx.engine.backup().await.expect("backup");
    }

    let before = fx.engine.restore_vault("2024_01").await.expect("restore");
    assert_eq!(before.len(), 3);
    let snapshot = fx
        .provider
        .read_json("vault/2024_01/snapshot.json")
        .await
        .expect("read");
    assert!(snapshot.is_some());

    // Snapshot plus surviving deltas still merge to the same state.
    let after = fx.engine.restore_vault("2024_01").await.expect("restore again");
    assert_eq!(before, after);
}

#[tokio::test]
async fn unlinked_provider_refuses_sync() {
    let fx = fixture("vault-unlinked", Policy::default());
    fx.provider.unlink().await.expect("unlink");
    assert!(fx.engine.backup().await.is_err());
    assert!(fx.engine.restore_vault("2024_01").await.is_err());
}
