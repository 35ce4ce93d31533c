use crate::crypto::SigningKeypair;
use crate::directory::{ContactDirectory, Directory};
use crate::error::CoreError;
use crate::metadata;
use crate::outbox::{EnqueueRequest, TaskQueue};
use crate::resolver::IdentityResolver;
use crate::worker::OutboxWorker;
use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;
use vesper_api::types::{BlockScope, OutboundRequest, OutboundResult, SendTarget};

/// Explicit tagged dispatch over strategy kinds; selection comes from
/// the target variant, not from wiring.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StrategyKind {
    Direct,
    LocalBroadcast,
    NetworkGroup,
}

impl StrategyKind {
    pub fn for_target(target: &SendTarget) -> Self {
        match target {
            SendTarget::User { .. } => StrategyKind::Direct,
            SendTarget::LocalGroup { .. } => StrategyKind::LocalBroadcast,
            SendTarget::NetworkGroup { .. } => StrategyKind::NetworkGroup,
        }
    }
}

#[derive(Clone)]
pub struct SendContext {
    pub request: OutboundRequest,
    pub signing: SigningKeypair,
}

/// Shared collaborators every strategy draws on.
#[derive(Clone)]
pub struct SendServices {
    pub resolver: IdentityResolver,
    pub contacts: ContactDirectory,
    pub directory: Arc<dyn Directory>,
    pub queue: Arc<dyn TaskQueue>,
    pub worker: OutboxWorker,
}

#[async_trait]
pub trait SendStrategy: Send + Sync {
    async fn send(&self, ctx: &SendContext) -> Result<OutboundResult, CoreError>;
}

pub async fn dispatch(
    services: &SendServices,
    ctx: &SendContext,
) -> Result<OutboundResult, CoreError> {
    match StrategyKind::for_target(&ctx.request.target) {
        StrategyKind::Direct => DirectStrategy { services }.send(ctx).await,
        StrategyKind::LocalBroadcast => LocalBroadcastStrategy { services }.send(ctx).await,
        StrategyKind::NetworkGroup => NetworkGroupStrategy { services }.send(ctx).await,
    }
}

fn target_id(request: &OutboundRequest) -> &str {
    match &request.target {
        SendTarget::User { id } => id,
        SendTarget::LocalGroup { id } => id,
        SendTarget::NetworkGroup { id } => id,
    }
}

fn wrapped_payload(request: &OutboundRequest, extra_tags: &[String]) -> Result<Vec<u8>, CoreError> {
    let mut tags = request.tags.clone();
    tags.extend_from_slice(extra_tags);
    metadata::wrap(
        &request.payload,
        request.conversation_id.as_ref().map(|c| c.value.as_str()),
        &tags,
    )
}

async fn enqueue_and_drain(
    services: &SendServices,
    ctx: &SendContext,
    payload: Vec<u8>,
    tags: Vec<String>,
    recipients: Vec<String>,
) -> Result<Uuid, CoreError> {
    let task_id = services
        .queue
        .enqueue(EnqueueRequest {
            message_id: ctx.request.client_message_id.value,
            sender: ctx.request.sender.value.clone(),
            conversation_id: ctx.request.conversation_id.as_ref().map(|c| c.value.clone()),
            kind: ctx.request.kind.clone(),
            payload,
            tags,
            recipients,
        })
        .await?;
    services
        .worker
        .process_queue(&ctx.request.sender.value, &ctx.signing)
        .await?;
    Ok(task_id)
}

/// Single recipient: resolve, enqueue one task, trigger the worker.
pub struct DirectStrategy<'a> {
    pub services: &'a SendServices,
}

#[async_trait]
impl SendStrategy for DirectStrategy<'_> {
    async fn send(&self, ctx: &SendContext) -> Result<OutboundResult, CoreError> {
        let handle = self
            .services
            .resolver
            .resolve_to_handle(target_id(&ctx.request))
            .await?;
        if self
            .services
            .directory
            .is_blocked(&handle, BlockScope::Direct)
            .await?
        {
            return Err(CoreError::Validation("recipient blocked".to_string()));
        }
        let payload = wrapped_payload(&ctx.request, &[])?;
        let task_id = enqueue_and_drain(
            self.services,
            ctx,
            payload,
            ctx.request.tags.clone(),
            vec![handle.clone()],
        )
        .await?;
        Ok(OutboundResult {
            message_id: ctx.request.client_message_id,
            task_ids: vec![task_id],
            recipients: vec![handle],
            skipped: Vec::new(),
        })
    }
}

/// Locally defined group: expand through the contacts layer and fan
/// out as independent direct deliveries. Never touches consensus
/// state; an unresolvable member is skipped, not fatal.
pub struct LocalBroadcastStrategy<'a> {
    pub services: &'a SendServices,
}

#[async_trait]
impl SendStrategy for LocalBroadcastStrategy<'_> {
    async fn send(&self, ctx: &SendContext) -> Result<OutboundResult, CoreError> {
        let group_id = target_id(&ctx.request);
        let members = self
            .services
            .contacts
            .local_group(group_id)
            .await
            .ok_or(CoreError::NotFound)?;
        let payload = wrapped_payload(&ctx.request, &[])?;
        let mut task_ids = Vec::new();
        let mut recipients = Vec::new();
        let mut skipped = Vec::new();
        for member in members {
            let handle = match self.services.resolver.resolve_to_handle(&member).await {
                Ok(handle) => handle,
                Err(_) => {
                    skipped.push(member);
                    continue;
                }
            };
            // Trust lookups fail closed: an unanswerable blocklist
            // skips the member rather than delivering. Skipped
            // entries always carry the group-definition form.
            match self
                .services
                .directory
                .is_blocked(&handle, BlockScope::Direct)
                .await
            {
                Ok(false) => {}
                Ok(true) | Err(_) => {
                    skipped.push(member);
                    continue;
                }
            }
            let task_id = self
                .services
                .queue
                .enqueue(EnqueueRequest {
                    message_id: ctx.request.client_message_id.value,
                    sender: ctx.request.sender.value.clone(),
                    conversation_id: ctx
                        .request
                        .conversation_id
                        .as_ref()
                        .map(|c| c.value.clone()),
                    kind: ctx.request.kind.clone(),
                    payload: payload.clone(),
                    tags: ctx.request.tags.clone(),
                    recipients: vec![handle.clone()],
                })
                .await?;
            task_ids.push(task_id);
            recipients.push(handle);
        }
        if !task_ids.is_empty() {
            self.services
                .worker
                .process_queue(&ctx.request.sender.value, &ctx.signing)
                .await?;
        }
        Ok(OutboundResult {
            message_id: ctx.request.client_message_id,
            task_ids,
            recipients,
            skipped,
        })
    }
}

/// Network-backed group: roster from the directory, group-protocol
/// tags attached, one fan-out task for the whole roster.
pub struct NetworkGroupStrategy<'a> {
    pub services: &'a SendServices,
}

#[async_trait]
impl SendStrategy for NetworkGroupStrategy<'_> {
    async fn send(&self, ctx: &SendContext) -> Result<OutboundResult, CoreError> {
        let group_id = target_id(&ctx.request);
        let roster = self
            .services
            .directory
            .group_participants(group_id)
            .await?;
        let group_tag = format!("grp:{}", group_id);
        let mut recipients = Vec::new();
        let mut skipped = Vec::new();
        for summary in roster {
            let handle = summary.handle.value;
            if handle == ctx.request.sender.value {
                continue;
            }
            match self
                .services
                .directory
                .is_blocked(&handle, BlockScope::Group)
                .await
            {
                Ok(false) => {}
                Ok(true) | Err(_) => {
                    skipped.push(handle);
                    continue;
                }
            }
            recipients.push(handle);
        }
        if recipients.is_empty() {
            return Err(CoreError::Validation("empty roster".to_string()));
        }
        let mut tags = ctx.request.tags.clone();
        tags.push(group_tag.clone());
        let payload = wrapped_payload(&ctx.request, &[group_tag])?;
        let task_id =
            enqueue_and_drain(self.services, ctx, payload, tags, recipients.clone()).await?;
        Ok(OutboundResult {
            message_id: ctx.request.client_message_id,
            task_ids: vec![task_id],
            recipients,
            skipped,
        })
    }
}
