// ============================================================================
// Event Sourcing Store - stream persistence contract and append guard
// ============================================================================

pub mod event_store;

pub use event_store::{check_append, EventStore};
