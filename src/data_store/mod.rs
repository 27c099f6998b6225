use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::entity::{EntityMetadata, PropertyBag};
use crate::error::StoreResult;
use crate::query::Query;

// ============================================================================
// Data Store - CRUD and query contract
// ============================================================================
//
// Every backend implements this trait with identical observable behaviour.
// Query evaluation always goes through `query::evaluate`; a backend only
// supplies the stored property bags in insertion order.
//
// Arguments are validated before any I/O: empty container names, empty ids
// and missing entities fail with `StoreError::InvalidArgument`.
//
// ============================================================================

#[async_trait]
pub trait DataStore: Send + Sync {
    /// Persists a new entity and returns it with `last_persisted_at` set.
    async fn add(
        &self,
        container: &str,
        entity: PropertyBag,
        cancel: &CancellationToken,
    ) -> StoreResult<PropertyBag>;

    /// Number of entities in the container; zero when it does not exist.
    async fn count(&self, container: &str, cancel: &CancellationToken) -> StoreResult<usize>;

    async fn query(
        &self,
        container: &str,
        query: &Query,
        metadata: &EntityMetadata,
        cancel: &CancellationToken,
    ) -> StoreResult<Vec<PropertyBag>>;

    /// `Ok(None)` when no entity has this id.
    async fn retrieve(
        &self,
        container: &str,
        id: &str,
        metadata: &EntityMetadata,
        cancel: &CancellationToken,
    ) -> StoreResult<Option<PropertyBag>>;

    /// Full overwrite of an existing entity. Omitted fields are dropped and
    /// read back as their declared defaults.
    async fn replace(
        &self,
        container: &str,
        id: &str,
        entity: PropertyBag,
        cancel: &CancellationToken,
    ) -> StoreResult<PropertyBag>;

    /// Removing an id that does not exist is a no-op.
    async fn remove(&self, container: &str, id: &str, cancel: &CancellationToken) -> StoreResult<()>;

    /// Deletes the whole container. Requires the destructive capability.
    async fn destroy_all(&self, container: &str, cancel: &CancellationToken) -> StoreResult<()>;
}
