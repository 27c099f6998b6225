// ============================================================================
// Event Sourcing
// ============================================================================
//
// Append-only, gapless, versioned streams keyed by (container, entity id),
// plus the aggregate repository that loads and saves through them.
//
// ============================================================================

mod core;
mod repository;
mod store;

pub use self::core::*;
pub use self::repository::AggregateRepository;
pub use self::store::*;
