use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use uuid::Uuid;

use super::bus::{HandlerError, MessageHandler, ReceivedMessage};
use crate::error::{StoreError, StoreResult};

/// A queued message as both backends persist it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PendingMessage {
    pub message_id: Uuid,
    pub body: String,
    pub sent_at: DateTime<Utc>,
    /// Deliveries handed out so far.
    pub delivery_count: u32,
}

impl PendingMessage {
    pub fn new(body: &str) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            body: body.to_string(),
            sent_at: Utc::now(),
            delivery_count: 0,
        }
    }
}

/// Runs `handler` for one delivery of `message`.
///
/// Handler errors and panics are translated here so that nothing unwinds
/// across the store boundary: a rule violation keeps its message, anything
/// else becomes `Unexpected`.
pub async fn deliver(message: &PendingMessage, handler: MessageHandler) -> StoreResult<()> {
    let received = ReceivedMessage {
        message_id: message.message_id,
        body: message.body.clone(),
        delivery_count: message.delivery_count,
    };

    let future = std::panic::catch_unwind(AssertUnwindSafe(move || handler(received)))
        .map_err(|payload| panicked(payload.as_ref()))?;

    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(HandlerError::RuleViolation(reason))) => Err(StoreError::RuleViolation(reason)),
        Ok(Err(HandlerError::Failed(err))) => Err(StoreError::Unexpected(format!(
            "message handler failed: {:#}",
            err
        ))),
        Err(payload) => Err(panicked(payload.as_ref())),
    }
}

/// Metric label for a failed delivery.
pub fn failure_reason(err: &StoreError) -> &'static str {
    match err {
        StoreError::RuleViolation(_) => "rule_violation",
        _ => "unexpected",
    }
}

fn panicked(payload: &(dyn Any + Send)) -> StoreError {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    StoreError::Unexpected(format!("message handler panicked: {}", detail))
}
