use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;
use vesper_api::types::{MessageKind, RecipientStatus};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeliveryEvent {
    pub message_id: Uuid,
    pub recipient: String,
    pub status: RecipientStatus,
    pub attempts: u32,
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InboundEvent {
    pub message_id: Uuid,
    pub sender: String,
    pub conversation_id: Option<String>,
    pub kind: MessageKind,
    pub tags: Vec<String>,
    pub content: Vec<u8>,
    pub timestamp: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CoreEvent {
    Delivery(DeliveryEvent),
    Inbound(InboundEvent),
}

pub type EventReceiver = broadcast::Receiver<CoreEvent>;

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new(size: usize) -> Self {
        let (tx, _) = broadcast::channel(size);
        Self { tx }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: CoreEvent) {
        let _ = self.tx.send(event);
    }
}
