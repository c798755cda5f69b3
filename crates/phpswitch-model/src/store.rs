use std::sync::Mutex;

use thiserror::Error;

use crate::registry::Registry;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to encode registry: {0}")]
    Encode(String),
}

impl StoreError {
    pub fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }
}

/// Persistence seam for the registry.
///
/// `load` never fails: a missing or unreadable store yields a default registry.
pub trait RegistryStore: Send + Sync {
    fn load(&self) -> Registry;

    /// # Errors
    /// Returns an error when the registry cannot be written.
    fn save(&self, registry: &Registry) -> Result<(), StoreError>;
}

/// Store that keeps the registry in memory only.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Registry>,
    saves: Mutex<usize>,
}

impl MemoryStore {
    #[must_use]
    pub fn new(registry: Registry) -> Self {
        Self {
            inner: Mutex::new(registry),
            saves: Mutex::new(0),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> Registry {
        self.inner
            .lock()
            .map(|registry| registry.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn save_count(&self) -> usize {
        self.saves.lock().map(|count| *count).unwrap_or_default()
    }
}

impl RegistryStore for MemoryStore {
    fn load(&self) -> Registry {
        self.snapshot()
    }

    fn save(&self, registry: &Registry) -> Result<(), StoreError> {
        if let Ok(mut inner) = self.inner.lock() {
            *inner = registry.clone();
        }
        if let Ok(mut count) = self.saves.lock() {
            *count += 1;
        }
        Ok(())
    }
}
