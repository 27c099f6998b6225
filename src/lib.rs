// ============================================================================
// polystore - one storage contract, interchangeable backends
// ============================================================================
//
// - `entity`:         property bags, typed values, schema metadata
// - `query`:          query model and the shared evaluator
// - `data_store`:     CRUD + query contract
// - `event_sourcing`: append-only versioned streams and aggregates
// - `messaging`:      topic/subscription at-least-once delivery
// - `backends`:       in-memory and durable local file implementations
//
// ============================================================================

pub mod backends;
pub mod config;
pub mod data_store;
pub mod entity;
pub mod error;
pub mod event_sourcing;
pub mod messaging;
pub mod metrics;
pub mod query;
pub mod utils;

pub use backends::{FileStore, MemoryStore};
pub use config::{Capabilities, FileStoreConfig, StoreConfig};
pub use data_store::DataStore;
pub use entity::{EntityMetadata, Optional, PropertyBag, Value, ValueKind};
pub use error::{ConcurrencyError, StoreError, StoreResult};
pub use event_sourcing::{Aggregate, AggregateRepository, DomainEvent, EventEnvelope, EventStore};
pub use messaging::{handler, HandlerError, MessageBusStore, ReceivedMessage};
pub use query::{OrderDirection, Query};
