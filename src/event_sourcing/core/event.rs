use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};

// ============================================================================
// Event Envelope - one persisted event of a stream
// ============================================================================
//
// The payload is kept in its serialized form so a stream can be read back
// without knowing every event type. `metadata.schema` names the payload's
// schema so readers can pick the right type to decode into.
//
// ============================================================================

/// Describes the payload of an event.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EventMetadata {
    /// Fully qualified name of the payload type.
    pub schema: String,
    pub schema_version: i32,

    // Causation & Correlation
    pub causation_id: Option<Uuid>,
    pub correlation_id: Option<Uuid>,

    pub extra: HashMap<String, String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    /// Stream owner; set by the store on append.
    pub entity_id: String,
    /// Strictly positive, gapless within a stream.
    pub version: u64,
    pub event_type: String,
    /// Serialized payload.
    pub data: String,
    pub metadata: EventMetadata,
    /// Set by the store on append.
    pub recorded_at: Option<DateTime<Utc>>,
}

impl EventEnvelope {
    /// Wraps an already-serialized payload.
    pub fn new(version: u64, event_type: impl Into<String>, data: impl Into<String>, schema: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            entity_id: String::new(),
            version,
            event_type: event_type.into(),
            data: data.into(),
            metadata: EventMetadata {
                schema: schema.into(),
                schema_version: 1,
                causation_id: None,
                correlation_id: None,
                extra: HashMap::new(),
            },
            recorded_at: None,
        }
    }

    /// Serializes a domain event into an envelope at `version`.
    pub fn from_event<E: DomainEvent>(version: u64, event: &E) -> StoreResult<Self> {
        let mut envelope = Self::new(version, event.event_type(), serialize_event(event)?, E::schema());
        envelope.metadata.schema_version = E::event_version();
        Ok(envelope)
    }

    /// Decodes the payload as `E`, refusing payloads of another schema.
    pub fn decode<E: DomainEvent>(&self) -> StoreResult<E> {
        if self.metadata.schema != E::schema() {
            return Err(StoreError::InvalidArgument(format!(
                "event {} has schema '{}', not '{}'",
                self.version,
                self.metadata.schema,
                E::schema()
            )));
        }
        deserialize_event(&self.data)
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.metadata.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_causation(mut self, causation_id: Uuid) -> Self {
        self.metadata.causation_id = Some(causation_id);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.extra.insert(key.into(), value.into());
        self
    }
}

// ============================================================================
// Domain Event Trait
// ============================================================================

/// Implemented by every payload type appended through an aggregate.
pub trait DomainEvent: Serialize + for<'de> Deserialize<'de> + Clone + Send + Sync {
    /// Tag of this particular event, e.g. `"Deposited"`.
    fn event_type(&self) -> &str;

    fn schema() -> String
    where
        Self: Sized,
    {
        std::any::type_name::<Self>().to_string()
    }

    fn event_version() -> i32
    where
        Self: Sized,
    {
        1
    }
}

pub fn serialize_event<E: Serialize>(event: &E) -> StoreResult<String> {
    Ok(serde_json::to_string(event)?)
}

pub fn deserialize_event<E: for<'de> Deserialize<'de>>(json: &str) -> StoreResult<E> {
    Ok(serde_json::from_str(json)?)
}
