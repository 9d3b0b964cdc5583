//! Backend pool.
//!
//! Ordered collection of [`Backend`] records. Read paths hand out snapshot
//! vectors of `Arc<Backend>` so callers never hold the pool lock while doing
//! I/O; each backend guards its own fields.

use std::sync::Arc;

use parking_lot::RwLock;

use super::Backend;

/// Collection of upstream proxies.
#[derive(Default)]
pub struct Pool {
    backends: RwLock<Vec<Arc<Backend>>>,
}

impl Pool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self {
            backends: RwLock::new(Vec::new()),
        }
    }

    /// Append a backend.
    pub fn add(&self, backend: Arc<Backend>) {
        self.backends.write().push(backend);
    }

    /// Remove a backend by address. Returns true if one was removed.
    pub fn remove(&self, address: &str) -> bool {
        let mut backends = self.backends.write();
        let before = backends.len();
        backends.retain(|b| b.address() != address);
        backends.len() != before
    }

    /// Snapshot of every backend.
    pub fn get_all(&self) -> Vec<Arc<Backend>> {
        self.backends.read().clone()
    }

    /// Snapshot of the backends that are currently available for selection.
    pub fn get_healthy(&self) -> Vec<Arc<Backend>> {
        self.backends
            .read()
            .iter()
            .filter(|b| b.is_available())
            .cloned()
            .collect()
    }

    /// Find a backend by address.
    pub fn get_by_address(&self, address: &str) -> Option<Arc<Backend>> {
        self.backends
            .read()
            .iter()
            .find(|b| b.address() == address)
            .cloned()
    }

    /// Total number of backends.
    pub fn count(&self) -> usize {
        self.backends.read().len()
    }

    /// Number of backends currently available for selection.
    pub fn count_healthy(&self) -> usize {
        self.backends
            .read()
            .iter()
            .filter(|b| b.is_available())
            .count()
    }

    /// Available backends sorted by latency, fastest first.
    pub fn sort_by_latency(&self) -> Vec<Arc<Backend>> {
        let mut healthy = self.get_healthy();
        healthy.sort_by_key(|b| b.latency());
        healthy
    }
}
