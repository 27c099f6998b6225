use super::event::{DomainEvent, EventEnvelope};
use crate::error::{StoreError, StoreResult};

// ============================================================================
// Aggregate Root Pattern
// ============================================================================
//
// State is derived by replaying a stream; commands are validated against
// that state and produce new events. The stream version lives beside the
// state in `Versioned`, not inside it.
//
// ============================================================================

pub trait Aggregate: Sized + Send + Sync {
    type Event: DomainEvent;
    type Command: Send + Sync;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Container holding this aggregate's streams.
    const CONTAINER: &'static str;

    /// Create new aggregate from first event
    fn apply_first_event(id: &str, event: &Self::Event) -> Result<Self, Self::Error>;

    /// Apply subsequent events to update state
    fn apply_event(&mut self, event: &Self::Event) -> Result<(), Self::Error>;

    /// Decide which events a command produces. `state` is `None` for a
    /// stream that has never been written.
    fn handle_command(
        state: Option<&Self>,
        command: &Self::Command,
    ) -> Result<Vec<Self::Event>, Self::Error>;

    /// Rebuild from a stream read oldest-to-newest.
    fn load_from_events(id: &str, events: &[EventEnvelope]) -> StoreResult<Option<Versioned<Self>>> {
        let (first, rest) = match events.split_first() {
            Some(split) => split,
            None => return Ok(None),
        };

        let mut aggregate = Self::apply_first_event(id, &first.decode::<Self::Event>()?)
            .map_err(|e| StoreError::Unexpected(format!("failed to apply first event: {}", e)))?;

        for envelope in rest {
            aggregate
                .apply_event(&envelope.decode::<Self::Event>()?)
                .map_err(|e| {
                    StoreError::Unexpected(format!("failed to apply event {}: {}", envelope.version, e))
                })?;
        }

        let version = events.last().map(|e| e.version).unwrap_or(0);
        Ok(Some(Versioned { state: aggregate, version }))
    }
}

/// Aggregate state together with the highest stream version folded into it.
#[derive(Debug, Clone)]
pub struct Versioned<A> {
    pub state: A,
    pub version: u64,
}
