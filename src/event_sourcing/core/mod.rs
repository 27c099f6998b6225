// ============================================================================
// Event Sourcing Core - envelopes, payload traits, aggregates
// ============================================================================

pub mod aggregate;
pub mod event;

pub use aggregate::{Aggregate, Versioned};
pub use event::{deserialize_event, serialize_event, DomainEvent, EventEnvelope, EventMetadata};
