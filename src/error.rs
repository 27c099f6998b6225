// ============================================================================
// Store Errors
// ============================================================================
//
// Every public operation returns `Result<T, StoreError>`. Not-found is never
// an error for Retrieve or Query; those return `None` or an empty list.
//
// ============================================================================

/// Optimistic-concurrency rejections raised by an event store append.
///
/// The formatted messages are part of the contract: callers and tests match
/// on them to learn which version was expected and which was attempted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConcurrencyError {
    #[error("event stream reset: stream '{container}/{id}' is empty but the batch starts at version {version}")]
    StreamReset {
        container: String,
        id: String,
        version: u64,
    },

    #[error("event stream already updated: version {version} of stream '{container}/{id}' already exists")]
    StreamAlreadyUpdated {
        container: String,
        id: String,
        version: u64,
    },

    #[error("event stream missing updates: stream '{container}/{id}' expected version {expected} but received version {attempted}")]
    MissingUpdates {
        container: String,
        id: String,
        expected: u64,
        attempted: u64,
    },
}

impl ConcurrencyError {
    /// Short label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            ConcurrencyError::StreamReset { .. } => "stream_reset",
            ConcurrencyError::StreamAlreadyUpdated { .. } => "stream_already_updated",
            ConcurrencyError::MissingUpdates { .. } => "missing_updates",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("entity '{id}' already exists in container '{container}'")]
    DuplicateEntity { container: String, id: String },

    #[error("entity '{id}' does not exist in container '{container}'")]
    EntityNotFound { container: String, id: String },

    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),

    #[error("rule violation: {0}")]
    RuleViolation(String),

    #[error("unexpected error: {0}")]
    Unexpected(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation '{0}' requires the testing-only destructive capability")]
    CapabilityDisabled(&'static str),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        StoreError::InvalidArgument(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        StoreError::Unexpected(message.into())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Unexpected(format!("I/O failure: {}", err))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Unexpected(format!("serialization failure: {}", err))
    }
}

// ============================================================================
// Argument guards
// ============================================================================

/// Rejects a missing or empty name before any I/O happens.
pub fn require_name(kind: &str, value: &str) -> StoreResult<()> {
    if value.trim().is_empty() {
        return Err(StoreError::InvalidArgument(format!("{} must not be empty", kind)));
    }
    Ok(())
}
