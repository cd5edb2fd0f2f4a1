//! In-memory bundle store backend

use crate::{Bundle, BundleId, BundleStore, StorageError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Capacity-bounded in-memory bundle store.
///
/// Ids are assigned from a monotonic counter and never reused, so a stale
/// id held by a routing record can only miss, never alias a newer bundle.
pub struct MemoryStore {
    bundles: Arc<DashMap<BundleId, Bundle>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl MemoryStore {
    /// Create a store holding at most `capacity` bundles.
    pub fn new(capacity: usize) -> Self {
        Self {
            bundles: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            capacity,
        }
    }
}

#[async_trait]
impl BundleStore for MemoryStore {
    async fn add(&self, mut bundle: Bundle) -> Result<BundleId, StorageError> {
        if self.bundles.len() >= self.capacity {
            return Err(StorageError::Depleted(self.capacity));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        bundle.id = id;
        debug!(
            "store add id={} dst={} len={}",
            id,
            bundle.destination,
            bundle.payload.len()
        );
        self.bundles.insert(id, bundle);
        Ok(id)
    }

    async fn get(&self, id: BundleId) -> Result<Bundle, StorageError> {
        self.bundles
            .get(&id)
            .map(|b| b.clone())
            .ok_or(StorageError::NotFound(id))
    }

    async fn delete(&self, id: BundleId) -> Result<(), StorageError> {
        debug!("store delete id={}", id);
        self.bundles
            .remove(&id)
            .map(|_| ())
            .ok_or(StorageError::NotFound(id))
    }

    async fn len(&self) -> usize {
        self.bundles.len()
    }
}
