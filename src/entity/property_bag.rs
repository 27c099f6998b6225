use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::identifier::IdentifierFactory;
use super::value::{Optional, Value, ValueKind};
use super::value_object::{self, ValueObject};
use crate::error::StoreResult;

// ============================================================================
// Property Bag - one persisted record
// ============================================================================

/// Typed, name-keyed field container for one entity.
///
/// `id` is assigned once at creation. `last_persisted_at` is owned by the
/// store and refreshed on every write; values set by callers are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyBag {
    pub id: String,
    pub last_persisted_at: Option<DateTime<Utc>>,
    pub properties: BTreeMap<String, Value>,
}

impl PropertyBag {
    /// Creates an empty bag with a fresh identifier.
    pub fn new(ids: &dyn IdentifierFactory) -> Self {
        Self::with_id(ids.create())
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            last_persisted_at: None,
            properties: BTreeMap::new(),
        }
    }

    /// Builder-style setter.
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        self.properties.insert(name.to_string(), value.into());
    }

    /// Sets a three-state field; `Absent` removes the key entirely.
    pub fn set_optional<T: Into<Value>>(&mut self, name: &str, value: Optional<T>) {
        match value {
            Optional::Absent => {
                self.properties.remove(name);
            }
            Optional::Null => {
                self.properties.insert(name.to_string(), Value::Null);
            }
            Optional::Value(v) => {
                self.properties.insert(name.to_string(), v.into());
            }
        }
    }

    pub fn set_value_object<V: ValueObject>(&mut self, name: &str, value: &V) {
        self.properties
            .insert(name.to_string(), Value::ValueObject(value_object::encode(value)));
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    pub fn get_optional(&self, name: &str) -> Optional<&Value> {
        match self.properties.get(name) {
            None => Optional::Absent,
            Some(Value::Null) => Optional::Null,
            Some(v) => Optional::Value(v),
        }
    }

    pub fn get_value_object<V: ValueObject>(&self, name: &str) -> StoreResult<Option<V>> {
        match self.properties.get(name) {
            Some(Value::ValueObject(encoded)) => value_object::decode(encoded).map(Some),
            _ => Ok(None),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.properties.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.properties.contains_key(name)
    }
}

// ============================================================================
// Entity Metadata - declared schema for one container
// ============================================================================

/// Declared type of one property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyType {
    pub kind: ValueKind,
    /// Three-state optional fields default to absent instead of a zero value.
    pub optional: bool,
}

impl PropertyType {
    pub fn zero(&self) -> Option<Value> {
        if self.optional {
            None
        } else {
            Some(self.kind.zero())
        }
    }
}

/// Property-to-type mapping handed to Query and Retrieve.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityMetadata {
    pub properties: BTreeMap<String, PropertyType>,
}

impl EntityMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn property(mut self, name: &str, kind: ValueKind) -> Self {
        self.properties
            .insert(name.to_string(), PropertyType { kind, optional: false });
        self
    }

    pub fn optional(mut self, name: &str, kind: ValueKind) -> Self {
        self.properties
            .insert(name.to_string(), PropertyType { kind, optional: true });
        self
    }

    pub fn get(&self, name: &str) -> Option<&PropertyType> {
        self.properties.get(name)
    }

    /// Zero value of a declared field; `None` when undeclared or optional.
    pub fn zero_of(&self, name: &str) -> Option<Value> {
        self.properties.get(name).and_then(PropertyType::zero)
    }

    /// Shapes a stored bag for the caller: declared fields that were never
    /// written take their zero value and stored values are coerced to the
    /// declared kind.
    pub fn materialize(&self, mut bag: PropertyBag) -> PropertyBag {
        for (name, declared) in &self.properties {
            match bag.properties.remove(name) {
                Some(Value::Null) => {
                    bag.properties.insert(name.clone(), Value::Null);
                }
                Some(value) => {
                    bag.properties.insert(name.clone(), value.coerce(declared.kind));
                }
                None => {
                    if let Some(zero) = declared.zero() {
                        bag.properties.insert(name.clone(), zero);
                    }
                }
            }
        }
        bag
    }
}
