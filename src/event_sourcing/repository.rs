use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::core::{Aggregate, EventEnvelope, Versioned};
use super::store::EventStore;
use crate::error::{StoreError, StoreResult};
use crate::utils::{retry_on_transient, RetryConfig};

// ============================================================================
// Aggregate Repository
// ============================================================================
//
// Loads aggregates by replaying their stream and appends the events a
// command produces at the versions following the loaded state. A writer
// that lost the race gets the store's concurrency error; `execute` turns
// that into reload-and-retry.
//
// ============================================================================

pub struct AggregateRepository<S: EventStore> {
    store: Arc<S>,
    retry: RetryConfig,
}

impl<S: EventStore> AggregateRepository<S> {
    pub fn new(store: Arc<S>, retry: RetryConfig) -> Self {
        Self { store, retry }
    }

    pub async fn load<A: Aggregate>(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> StoreResult<Option<Versioned<A>>> {
        let events = self.store.get_event_stream(A::CONTAINER, id, cancel).await?;
        A::load_from_events(id, &events)
    }

    /// Appends `events` after `expected_version`. Returns the new version.
    pub async fn save<A: Aggregate>(
        &self,
        id: &str,
        expected_version: u64,
        events: &[A::Event],
        cancel: &CancellationToken,
    ) -> StoreResult<u64> {
        if events.is_empty() {
            return Ok(expected_version);
        }

        let envelopes = events
            .iter()
            .enumerate()
            .map(|(offset, event)| EventEnvelope::from_event(expected_version + 1 + offset as u64, event))
            .collect::<StoreResult<Vec<_>>>()?;
        let new_version = expected_version + envelopes.len() as u64;

        self.store.add_events(A::CONTAINER, id, envelopes, cancel).await?;
        Ok(new_version)
    }

    /// Load, decide, save; retried on concurrency conflicts. A domain error
    /// from the command handler surfaces as `RuleViolation`.
    pub async fn execute<A: Aggregate>(
        &self,
        id: &str,
        command: &A::Command,
        cancel: &CancellationToken,
    ) -> StoreResult<u64> {
        retry_on_transient(&self.retry, |attempt| async move {
            let loaded = self.load::<A>(id, cancel).await?;
            let (state, version) = match &loaded {
                Some(versioned) => (Some(&versioned.state), versioned.version),
                None => (None, 0),
            };

            let events = A::handle_command(state, command)
                .map_err(|e| StoreError::RuleViolation(e.to_string()))?;

            tracing::debug!(
                container = A::CONTAINER,
                id = %id,
                attempt,
                expected_version = version,
                event_count = events.len(),
                "Saving aggregate events"
            );
            self.save::<A>(id, version, &events, cancel).await
        })
        .await
        .into_result()
    }
}
