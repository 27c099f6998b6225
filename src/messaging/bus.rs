use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::StoreResult;

// ============================================================================
// Message Bus Store contract
// ============================================================================
//
// Each (topic, subscription) pair owns an ordered queue. `send` copies the
// body into every subscription registered at that moment. `receive_single`
// hands the oldest pending message to the handler and removes it only when
// the handler succeeds; any failure leaves it at the head of the queue for
// redelivery. At most one receive is in flight per subscription; receives
// on different subscriptions never wait on each other.
//
// ============================================================================

/// What a handler sees for one delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    pub message_id: Uuid,
    pub body: String,
    /// 1 on first delivery, incremented on every redelivery.
    pub delivery_count: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The handler rejected the message on domain grounds.
    #[error("{0}")]
    RuleViolation(String),

    /// Any other failure inside the handler.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

pub type HandlerResult = Result<(), HandlerError>;

pub type MessageHandler = Box<dyn FnOnce(ReceivedMessage) -> BoxFuture<'static, HandlerResult> + Send>;

/// Boxes an async closure into a `MessageHandler`.
pub fn handler<F, Fut>(f: F) -> MessageHandler
where
    F: FnOnce(ReceivedMessage) -> Fut + Send + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Box::new(move |message| Box::pin(f(message)))
}

#[async_trait]
pub trait MessageBusStore: Send + Sync {
    /// Registers a subscription; calling it again is a no-op.
    async fn subscribe(&self, topic: &str, subscription: &str, cancel: &CancellationToken) -> StoreResult<()>;

    /// Appends `body` to every subscription currently registered on `topic`.
    async fn send(&self, topic: &str, body: &str, cancel: &CancellationToken) -> StoreResult<()>;

    /// `Ok(false)` without calling the handler when nothing is pending.
    /// `Ok(true)` once the handler succeeded and the message is removed.
    /// A handler failure is returned as the error and the message stays.
    async fn receive_single(
        &self,
        topic: &str,
        subscription: &str,
        handler: MessageHandler,
        cancel: &CancellationToken,
    ) -> StoreResult<bool>;

    async fn pending_count(&self, topic: &str, subscription: &str, cancel: &CancellationToken) -> StoreResult<usize>;

    /// Drops the topic with all its subscriptions. Requires the destructive capability.
    async fn destroy_topic(&self, topic: &str, cancel: &CancellationToken) -> StoreResult<()>;
}
