use std::path::PathBuf;

use crate::error::{StoreError, StoreResult};
use crate::utils::RetryConfig;

// ============================================================================
// Store Configuration
// ============================================================================

/// Switches for functionality that must stay off in production wiring.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Enables `destroy_all` on every store. Off unless explicitly requested.
    pub destructive_operations: bool,
}

impl Capabilities {
    /// Capability set for test fixtures and administrative tooling.
    pub fn testing() -> Self {
        Self {
            destructive_operations: true,
        }
    }

    /// Gate checked before any destructive operation touches storage.
    pub fn require_destructive(&self, operation: &'static str) -> StoreResult<()> {
        if self.destructive_operations {
            Ok(())
        } else {
            tracing::warn!(operation, "Destructive operation refused: capability disabled");
            Err(StoreError::CapabilityDisabled(operation))
        }
    }
}

/// Settings shared by every backend.
#[derive(Clone, Debug, Default)]
pub struct StoreConfig {
    pub capabilities: Capabilities,
    /// Policy used by `AggregateRepository::execute` on concurrency conflicts.
    pub retry: RetryConfig,
}

impl StoreConfig {
    pub fn testing() -> Self {
        Self {
            capabilities: Capabilities::testing(),
            retry: RetryConfig::default(),
        }
    }
}

/// Settings for the durable local file backend.
#[derive(Clone, Debug)]
pub struct FileStoreConfig {
    /// Directory under which every container, stream and queue is stored.
    pub root: PathBuf,
    pub store: StoreConfig,
}

impl FileStoreConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            store: StoreConfig::default(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.store.capabilities = capabilities;
        self
    }
}
