//! Verifier registry: thread-safe mapping of category to verifier handle.
//!
//! The registry is read-mostly. Writers publish a new map atomically;
//! every decision captures one [`RegistrySnapshot`] at planning time and
//! uses only that snapshot, so in-flight decisions never observe drift.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use crate::error::{Error, Result};
use crate::verifier::VerifierHandle;

/// Immutable view of the registry captured at decision start.
#[derive(Clone, Debug)]
pub struct RegistrySnapshot {
    inner: Arc<HashMap<String, VerifierHandle>>,
}

impl RegistrySnapshot {
    /// Handle for a category, if registered.
    pub fn get(&self, category: &str) -> Option<&VerifierHandle> {
        self.inner.get(category)
    }

    pub fn contains(&self, category: &str) -> bool {
        self.inner.contains_key(category)
    }

    /// Registered categories in ascending order.
    pub fn categories(&self) -> Vec<String> {
        let mut categories: Vec<String> = self.inner.keys().cloned().collect();
        categories.sort();
        categories
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Thread-safe verifier registry with copy-on-write updates.
#[derive(Default)]
pub struct VerifierRegistry {
    handles: RwLock<Arc<HashMap<String, VerifierHandle>>>,
}

impl VerifierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle. Duplicate categories and zero weights are
    /// rejected; registration is atomic.
    pub async fn register(&self, handle: VerifierHandle) -> Result<()> {
        if handle.weight() == 0 {
            return Err(Error::config(format!(
                "verifier {} declared zero weight",
                handle.category()
            )));
        }

        let mut guard = self.handles.write().await;
        if guard.contains_key(handle.category()) {
            return Err(Error::conflict(handle.category()));
        }

        let mut next = HashMap::clone(&guard);
        info!(category = %handle.category(), weight = handle.weight(), "verifier registered");
        next.insert(handle.category().to_string(), handle);
        *guard = Arc::new(next);
        Ok(())
    }

    /// Remove a category. Returns whether it was present.
    pub async fn deregister(&self, category: &str) -> bool {
        let mut guard = self.handles.write().await;
        if !guard.contains_key(category) {
            return false;
        }

        let mut next = HashMap::clone(&guard);
        next.remove(category);
        info!(category, "verifier deregistered");
        *guard = Arc::new(next);
        true
    }

    /// Capture an immutable view for one decision.
    pub async fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            inner: Arc::clone(&*self.handles.read().await),
        }
    }
}
