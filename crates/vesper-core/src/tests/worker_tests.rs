use super::{register_peer, shared_store};
use crate::crypto;
use crate::envelope::{QueuedMessage, SecureEnvelope};
use crate::error::CoreError;
use crate::event::{CoreEvent, EventBus};
use crate::keys::InMemoryKeyService;
use crate::outbox::{EnqueueRequest, StoreTaskQueue, TaskQueue};
use crate::policy::Policy;
use crate::transport::{MockTransport, Transport};
use crate::worker::{DrainOutcome, OutboxWorker};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Semaphore;
use uuid::Uuid;
use vesper_api::types::{MessageKind, RecipientStatus, TaskStatus};

struct Fixture {
    queue: Arc<StoreTaskQueue>,
    worker: OutboxWorker,
    transport: MockTransport,
    keys: Arc<InMemoryKeyService>,
    events: EventBus,
    signing: crypto::SigningKeypair,
}

fn fixture(label: &str, policy: Policy) -> Fixture {
    let queue = Arc::new(StoreTaskQueue::new(shared_store(label)));
    let transport = MockTransport::new();
    let keys = Arc::new(InMemoryKeyService::new());
    let events = EventBus::new(64);
    let worker = OutboxWorker::new(
        queue.clone(),
        Arc::new(transport.clone()),
        keys.clone(),
        events.clone(),
        policy,
    );
    Fixture {
        queue,
        worker,
        transport,
        keys,
        events,
        signing: crypto::generate_signing_keys(),
    }
}

async fn enqueue(fixture: &Fixture, recipients: Vec<&str>) -> Uuid {
    fixture
        .queue
        .enqueue(EnqueueRequest {
            message_id: Uuid::new_v4(),
            sender: "@alice".to_string(),
            conversation_id: None,
            kind: MessageKind::Text,
            payload: b"payload".to_vec(),
            tags: Vec::new(),
            recipients: recipients.into_iter().map(|r| r.to_string()).collect(),
        })
        .await
        .expect("enqueue")
}

#[tokio::test]
async fn fan_out_completes_when_every_recipient_sends() {
    let fx = fixture("worker-fanout", Policy::default());
    register_peer(&fx.keys, "@bob").await;
    register_peer(&fx.keys, "@carol").await;
    let id = enqueue(&fx, vec!["@bob", "@carol"]).await;

    let outcome = fx.worker.process_queue("@alice", &fx.signing).await.expect("drain");
    assert_eq!(outcome, DrainOutcome::Drained { tasks: 1 });

    let task = fx.queue.task(&id).await.expect("load").expect("present");
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task
        .recipients
        .iter()
        .all(|r| r.status == RecipientStatus::Sent && r.attempts == 1));
    assert_eq!(fx.transport.sent_count().await, 2);
}

#[tokio::test]
async fn transient_failure_retries_on_later_passes() {
    let fx = fixture("worker-transient", Policy::default());
    register_peer(&fx.keys, "@bob").await;
    fx.transport.fail_next(2).await;
    let id = enqueue(&fx, vec!["@bob"]).await;

    fx.worker.process_queue("@alice", &fx.signing).await.expect("pass 1");
    let task = fx.queue.task(&id).await.expect("load").expect("present");
    assert_eq!(task.status, TaskStatus::Queued);
    assert_eq!(task.recipients[0].status, RecipientStatus::Failed);
    assert_eq!(task.recipients[0].attempts, 1);

    fx.worker.process_queue("@alice", &fx.signing).await.expect("pass 2");
    let task = fx.queue.task(&id).await.expect("load").expect("present");
    assert_eq!(task.recipients[0].attempts, 2);

    fx.worker.process_queue("@alice", &fx.signing).await.expect("pass 3");
    let task = fx.queue.task(&id).await.expect("load").expect("present");
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.recipients[0].status, RecipientStatus::Sent);
    assert_eq!(task.recipients[0].attempts, 3);
    assert_eq!(fx.transport.sent_count().await, 1);
}

#[tokio::test]
async fn missing_keys_exhausts_the_budget_in_one_pass() {
    let fx = fixture("worker-permanent", Policy::default());
    let id = enqueue(&fx, vec!["@nobody"]).await;

    fx.worker.process_queue("@alice", &fx.signing).await.expect("drain");
    let task = fx.queue.task(&id).await.expect("load").expect("present");
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.recipients[0].status, RecipientStatus::Failed);
    assert_eq!(task.recipients[0].attempts, Policy::default().retry_budget);
    assert!(task.recipients[0]
        .last_error
        .as_deref()
        .unwrap_or_default()
        .contains("missing public keys"));
    assert_eq!(fx.transport.sent_count().await, 0);
}

#[tokio::test]
async fn mixed_outcomes_settle_as_failed() {
    let policy = Policy {
        retry_budget: 1,
        ..Policy::default()
    };
    let fx = fixture("worker-mixed", policy);
    register_peer(&fx.keys, "@bob").await;
    let id = enqueue(&fx, vec!["@bob", "@nobody"]).await;

    fx.worker.process_queue("@alice", &fx.signing).await.expect("drain");
    let task = fx.queue.task(&id).await.expect("load").expect("present");
    assert_eq!(task.status, TaskStatus::Failed);
    let bob = task.recipients.iter().find(|r| r.recipient == "@bob").expect("bob");
    let nobody = task
        .recipients
        .iter()
        .find(|r| r.recipient == "@nobody")
        .expect("nobody");
    assert_eq!(bob.status, RecipientStatus::Sent);
    assert_eq!(nobody.status, RecipientStatus::Failed);
}

#[tokio::test]
async fn completed_tasks_are_not_redelivered() {
    let fx = fixture("worker-idempotent", Policy::default());
    register_peer(&fx.keys, "@bob").await;
    enqueue(&fx, vec!["@bob"]).await;

    fx.worker.process_queue("@alice", &fx.signing).await.expect("drain");
    assert_eq!(fx.transport.sent_count().await, 1);

    let outcome = fx.worker.process_queue("@alice", &fx.signing).await.expect("redrain");
    assert_eq!(outcome, DrainOutcome::Drained { tasks: 0 });
    assert_eq!(fx.transport.sent_count().await, 1);
}

#[tokio::test]
async fn other_senders_tasks_stay_untouched() {
    let fx = fixture("worker-sender-scope", Policy::default());
    register_peer(&fx.keys, "@bob").await;
    let id = enqueue(&fx, vec!["@bob"]).await;

    let outcome = fx.worker.process_queue("@mallory", &fx.signing).await.expect("drain");
    assert_eq!(outcome, DrainOutcome::Drained { tasks: 0 });
    let task = fx.queue.task(&id).await.expect("load").expect("present");
    assert_eq!(task.status, TaskStatus::Queued);
}

#[tokio::test]
async fn delivery_events_mirror_recipient_progress() {
    let fx = fixture("worker-events", Policy::default());
    register_peer(&fx.keys, "@bob").await;
    let mut rx = fx.events.subscribe();
    enqueue(&fx, vec!["@bob"]).await;

    fx.worker.process_queue("@alice", &fx.signing).await.expect("drain");
    let CoreEvent::Delivery(event) = rx.try_recv().expect("event") else {
        panic!("expected delivery event");
    };
    assert_eq!(event.recipient, "@bob");
    assert_eq!(event.status, RecipientStatus::Sent);
    assert_eq!(event.attempts, 1);
    assert!(event.error.is_none());
}

#[tokio::test]
async fn ephemeral_batch_bypasses_persistence() {
    let fx = fixture("worker-ephemeral", Policy::default());
    register_peer(&fx.keys, "@bob").await;
    register_peer(&fx.keys, "@carol").await;

    fx.worker
        .send_ephemeral_batch(
            &["@bob".to_string(), "@carol".to_string(), "@nobody".to_string()],
            MessageKind::Typing,
            b"",
            "@alice",
            &fx.signing,
        )
        .await;
    assert_eq!(fx.transport.sent_count().await, 2);
    assert!(fx.queue.all_tasks().await.expect("all").is_empty());
}

#[tokio::test]
async fn cleanup_drops_only_completed_tasks() {
    let fx = fixture("worker-cleanup", Policy::default());
    register_peer(&fx.keys, "@bob").await;
    enqueue(&fx, vec!["@bob"]).await;
    let stuck = enqueue(&fx, vec!["@nobody"]).await;

    fx.worker.process_queue("@alice", &fx.signing).await.expect("drain");
    let removed = fx.worker.cleanup_completed().await.expect("cleanup");
    assert_eq!(removed, 1);
    let remaining = fx.queue.all_tasks().await.expect("all");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, stuck);
}

/// Transport double that parks each send until released, so a test
/// can overlap two drain triggers deterministically.
#[derive(Clone)]
struct HeldTransport {
    inner: MockTransport,
    entered: Arc<Semaphore>,
    release: Arc<Semaphore>,
}

#[async_trait]
impl Transport for HeldTransport {
    async fn send_message(&self, envelope: SecureEnvelope) -> Result<(), CoreError> {
        self.entered.add_permits(1);
        let _go = self
            .release
            .acquire()
            .await
            .map_err(|_| CoreError::Transport("held".to_string()))?;
        self.inner.send_message(envelope).await
    }

    async fn message_batch(
        &self,
        recipient: &str,
        limit: u32,
    ) -> Result<Vec<QueuedMessage>, CoreError> {
        self.inner.message_batch(recipient, limit).await
    }

    async fn acknowledge(&self, ids: &[Uuid]) -> Result<(), CoreError> {
        self.inner.acknowledge(ids).await
    }
}

#[tokio::test]
async fn overlapping_triggers_coalesce_into_one_pass() {
    let queue = Arc::new(StoreTaskQueue::new(shared_store("worker-coalesce")));
    let transport = HeldTransport {
        inner: MockTransport::new(),
        entered: Arc::new(Semaphore::new(0)),
        release: Arc::new(Semaphore::new(0)),
    };
    let keys = Arc::new(InMemoryKeyService::new());
    let worker = OutboxWorker::new(
        queue.clone(),
        Arc::new(transport.clone()),
        keys.clone(),
        EventBus::new(64),
        Policy::default(),
    );
    register_peer(&keys, "@bob").await;
    let signing = crypto::generate_signing_keys();
    queue
        .enqueue(EnqueueRequest {
            message_id: Uuid::new_v4(),
            sender: "@alice".to_string(),
            conversation_id: None,
            kind: MessageKind::Text,
            payload: b"payload".to_vec(),
            tags: Vec::new(),
            recipients: vec!["@bob".to_string()],
        })
        .await
        .expect("enqueue");

    let first_worker = worker.clone();
    let first_signing = signing.clone();
    let first =
        tokio::spawn(async move { first_worker.process_queue("@alice", &first_signing).await });

    // Wait until the first pass is parked inside the transport, then
    // trigger again while it still holds the drain guard.
    let _held = transport.entered.acquire().await.expect("first pass in flight");
    let second = worker.process_queue("@alice", &signing).await.expect("second trigger");
    assert_eq!(second, DrainOutcome::Coalesced);

    transport.release.add_permits(1);
    let outcome = first.await.expect("join").expect("first pass");
    assert_eq!(outcome, DrainOutcome::Drained { tasks: 1 });
    assert_eq!(transport.inner.sent_count().await, 1);
}
