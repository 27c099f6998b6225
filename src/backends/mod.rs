// ============================================================================
// Reference Backends
// ============================================================================
//
// Both backends implement `DataStore`, `EventStore` and `MessageBusStore`
// on one type. Query evaluation and append checks are shared; a backend
// only decides where bags, streams and queues live and how writes are
// made atomic.
//
// ============================================================================

pub mod file;
pub mod memory;
pub mod naming;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use naming::physical_name;

use crate::entity::{PropertyBag, Value};
use crate::error::{require_name, StoreError, StoreResult};
use crate::event_sourcing::EventEnvelope;
use crate::metrics::StoreMetrics;
use crate::query::Query;

/// Argument checks shared by `add` and `replace`.
pub(crate) fn check_entity(container: &str, entity: &PropertyBag) -> StoreResult<()> {
    require_name("container name", container)?;
    require_name("entity id", &entity.id)?;
    check_values(entity)
}

/// NaN and infinities have no JSON form; both backends refuse them.
fn check_values(entity: &PropertyBag) -> StoreResult<()> {
    for (name, value) in &entity.properties {
        if let Value::Double(number) = value {
            if !number.is_finite() {
                return Err(StoreError::InvalidArgument(format!(
                    "property '{}' holds non-finite double {}",
                    name, number
                )));
            }
        }
    }
    Ok(())
}

/// Binds a replacement bag to `id`. An empty bag id adopts `id`; any other
/// mismatch is refused.
pub(crate) fn bind_replacement(container: &str, id: &str, mut entity: PropertyBag) -> StoreResult<PropertyBag> {
    require_name("container name", container)?;
    require_name("entity id", id)?;
    if entity.id.is_empty() {
        entity.id = id.to_string();
    } else if entity.id != id {
        return Err(StoreError::InvalidArgument(format!(
            "replacement entity id '{}' does not match '{}'",
            entity.id, id
        )));
    }
    check_values(&entity)?;
    Ok(entity)
}

pub(crate) fn check_query(container: &str, query: &Query) -> StoreResult<()> {
    require_name("container name", container)?;
    for join in query.joins() {
        require_name("joined container name", &join.container)?;
    }
    Ok(())
}

/// Stamps a validated batch with its stream owner and append time.
pub(crate) fn stamp_events(id: &str, events: &mut [EventEnvelope]) {
    let recorded_at = chrono::Utc::now();
    for event in events.iter_mut() {
        event.entity_id = id.to_string();
        event.recorded_at = Some(recorded_at);
    }
}

/// Logs and counts a rejected append; passes the error through.
pub(crate) fn record_rejection(
    metrics: &StoreMetrics,
    backend: &str,
    container: &str,
    id: &str,
    err: StoreError,
) -> StoreError {
    if let StoreError::Concurrency(conflict) = &err {
        metrics.record_conflict(backend, conflict.kind());
        tracing::warn!(
            backend,
            container = %container,
            id = %id,
            kind = conflict.kind(),
            "Event append rejected: {}",
            conflict
        );
    }
    err
}
