//! Source registry
//!
//! In-memory registry mapping a service kind to its source implementation.
//! Built once at startup and handed to the syncer explicitly; there is no
//! process-global registry.

use std::collections::HashMap;
use std::sync::Arc;

use super::Source;

/// Error type for registry operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("no source registered for kind '{kind}'")]
    KindNotFound { kind: String },
}

/// Registry of sources keyed by service kind.
#[derive(Default, Clone)]
pub struct SourceRegistry {
    sources: HashMap<String, Arc<dyn Source>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the source used for every external service of `kind`.
    /// Replaces any previous registration for the same kind.
    pub fn register<S: Into<String>>(&mut self, kind: S, source: Arc<dyn Source>) {
        self.sources.insert(kind.into(), source);
    }

    pub fn get(&self, kind: &str) -> Result<Arc<dyn Source>, RegistryError> {
        self.sources
            .get(kind)
            .cloned()
            .ok_or_else(|| RegistryError::KindNotFound {
                kind: kind.to_string(),
            })
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }
}
