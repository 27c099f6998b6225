use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{ConcurrencyError, StoreError, StoreResult};
use crate::event_sourcing::core::EventEnvelope;

// ============================================================================
// Event Store - append-only versioned streams
// ============================================================================
//
// A stream is identified by (container, entity id) and starts empty with
// next expected version 1. Appends are checked by `check_append` before
// anything is written; a rejected batch leaves the stream untouched and an
// accepted batch is persisted as one contiguous run.
//
// Callers are expected to reload and retry on a concurrency error. The
// store never merges or queues conflicting writers.
//
// ============================================================================

#[async_trait]
pub trait EventStore: Send + Sync {
    /// All events of the stream, oldest first. Empty for unknown streams.
    async fn get_event_stream(
        &self,
        container: &str,
        id: &str,
        cancel: &CancellationToken,
    ) -> StoreResult<Vec<EventEnvelope>>;

    /// Appends a non-empty batch whose versions continue the stream.
    async fn add_events(
        &self,
        container: &str,
        id: &str,
        events: Vec<EventEnvelope>,
        cancel: &CancellationToken,
    ) -> StoreResult<()>;

    /// Drops every stream in the container. Requires the destructive capability.
    async fn destroy_all_streams(&self, container: &str, cancel: &CancellationToken) -> StoreResult<()>;
}

/// Validates a batch against the stream's current highest version
/// (`0` for an empty stream).
pub fn check_append(
    container: &str,
    id: &str,
    current_version: u64,
    batch: &[EventEnvelope],
) -> StoreResult<()> {
    let first = match batch.first() {
        Some(event) => event.version,
        None => return Err(StoreError::invalid_argument("event batch must not be empty")),
    };

    if first == 0 {
        return Err(StoreError::invalid_argument("event versions start at 1"));
    }

    if let Some(pair) = batch
        .windows(2)
        .find(|pair| pair[0].version.checked_add(1) != Some(pair[1].version))
    {
        return Err(StoreError::InvalidArgument(format!(
            "event versions must be contiguous, found {} after {}",
            pair[1].version, pair[0].version
        )));
    }

    if current_version == 0 && first != 1 {
        return Err(ConcurrencyError::StreamReset {
            container: container.to_string(),
            id: id.to_string(),
            version: first,
        }
        .into());
    }

    if first <= current_version {
        return Err(ConcurrencyError::StreamAlreadyUpdated {
            container: container.to_string(),
            id: id.to_string(),
            version: first,
        }
        .into());
    }

    if first > current_version + 1 {
        return Err(ConcurrencyError::MissingUpdates {
            container: container.to_string(),
            id: id.to_string(),
            expected: current_version + 1,
            attempted: first,
        }
        .into());
    }

    Ok(())
}
