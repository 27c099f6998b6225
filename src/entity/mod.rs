// ============================================================================
// Entity Model - property bags, typed values, schema metadata
// ============================================================================

pub mod identifier;
pub mod property_bag;
pub mod value;
pub mod value_object;

pub use identifier::{GuidIdentifierFactory, IdentifierFactory};
pub use property_bag::{EntityMetadata, PropertyBag, PropertyType};
pub use value::{Optional, Value, ValueKind};
pub use value_object::ValueObject;
