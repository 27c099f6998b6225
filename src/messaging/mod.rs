// ============================================================================
// Message Bus - topics, subscriptions, at-least-once delivery
// ============================================================================

pub mod bus;
pub mod delivery;

pub use bus::{handler, HandlerError, HandlerResult, MessageBusStore, MessageHandler, ReceivedMessage};
pub use delivery::{deliver, failure_reason, PendingMessage};
