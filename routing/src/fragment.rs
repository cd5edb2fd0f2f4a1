//! Fragmentation engine: split an oversized bundle into a chain of
//! fragments and register them atomically, or roll everything back.

use crate::dispatcher::ContactResolver;
use crate::signal::{OutboundBundle, RoutedBundle};
use crate::RouteError;
use bytes::Bytes;
use dtn_storage::{Bundle, BundleFlags, BundleId, BundleStore};
use std::sync::Arc;
use tracing::{debug, warn};

/// Fragment construction seam.
///
/// The production allocator is infallible; tests inject failures at a
/// chosen step to exercise the all-or-nothing rollback.
pub trait FragmentAlloc: Send + Sync {
    /// Build one fragment of `parent` carrying `payload` at the given
    /// offset within the parent's payload.
    fn alloc(
        &self,
        parent: &Bundle,
        offset_in_parent: u64,
        payload: Bytes,
    ) -> Result<Bundle, RouteError>;
}

/// Default fragment allocator.
#[derive(Debug, Default)]
pub struct DefaultFragmentAlloc;

impl FragmentAlloc for DefaultFragmentAlloc {
    fn alloc(
        &self,
        parent: &Bundle,
        offset_in_parent: u64,
        payload: Bytes,
    ) -> Result<Bundle, RouteError> {
        // Re-fragmenting a fragment keeps the original ADU coordinates.
        let total_adu_length = if parent.flags.contains(BundleFlags::IS_FRAGMENT) {
            parent.total_adu_length
        } else {
            parent.payload.len() as u64
        };
        Ok(Bundle {
            id: 0,
            version: parent.version,
            source: parent.source.clone(),
            destination: parent.destination.clone(),
            creation_timestamp_s: parent.creation_timestamp_s,
            lifetime_s: parent.lifetime_s,
            flags: parent.flags | BundleFlags::IS_FRAGMENT,
            hop_count: parent.hop_count,
            fragment_offset: parent.fragment_offset + offset_in_parent,
            total_adu_length,
            payload,
        })
    }
}

/// Split the payload into fragments, first fragment derived from the
/// bundle, each next one derived from what remains of the previous.
fn build_fragments(
    alloc: &dyn FragmentAlloc,
    original: &Bundle,
    max_bundle_size: usize,
) -> Result<Vec<Bundle>, RouteError> {
    let first_cap = max_bundle_size
        .checked_sub(original.first_fragment_min_size())
        .filter(|c| *c > 0)
        .ok_or(RouteError::FragmentTooSmall(max_bundle_size))?;
    let middle_cap = max_bundle_size
        .checked_sub(original.middle_fragment_min_size())
        .filter(|c| *c > 0)
        .ok_or(RouteError::FragmentTooSmall(max_bundle_size))?;

    let mut fragments = Vec::new();
    let mut rest = original.payload.clone();
    let mut offset = 0u64;
    while !rest.is_empty() {
        let cap = if fragments.is_empty() { first_cap } else { middle_cap };
        let take = cap.min(rest.len());
        let chunk = rest.split_to(take);
        let fragment = alloc.alloc(original, offset, chunk)?;
        offset += take as u64;
        fragments.push(fragment);
    }
    Ok(fragments)
}

/// Fragment `original` and hand every fragment to every contact.
///
/// All-or-nothing: an allocation failure releases every fragment built so
/// far; a storage or handover failure partway through unbinds the
/// already-bound fragments, deletes the persisted ones, and leaves the
/// original untouched in storage. Only full success deletes the original.
///
/// Returns one `(fragment id, replication record)` pair per fragment.
pub async fn fragment_and_route(
    store: &dyn BundleStore,
    resolver: &dyn ContactResolver,
    alloc: &dyn FragmentAlloc,
    original: &Bundle,
    contacts: &[String],
    max_bundle_size: usize,
) -> Result<Vec<(BundleId, Arc<RoutedBundle>)>, RouteError> {
    let fragments = build_fragments(alloc, original, max_bundle_size)?;
    debug!(
        "fragmenting bundle {} into {} fragments (max size {})",
        original.id,
        fragments.len(),
        max_bundle_size
    );

    let mut bound: Vec<(BundleId, Arc<RoutedBundle>)> = Vec::with_capacity(fragments.len());
    for mut fragment in fragments {
        let destination = fragment.destination.clone();
        let id = match store.add(fragment.clone()).await {
            Ok(id) => id,
            Err(e) => {
                rollback(store, &bound).await;
                return Err(e.into());
            }
        };
        fragment.id = id;

        let routed = RoutedBundle::new(id, destination, contacts.to_vec());
        for addr in contacts {
            let outbound = OutboundBundle {
                bundle: fragment.clone(),
                routed: routed.clone(),
            };
            if let Err(e) = resolver.enqueue(addr, outbound).await {
                warn!("fragment {} handover to {} failed: {}", id, addr, e);
                routed.cancel();
                bound.push((id, routed));
                rollback(store, &bound).await;
                return Err(e);
            }
        }
        bound.push((id, routed));
    }

    // Every fragment is persisted and bound; the original leaves storage.
    if let Err(e) = store.delete(original.id).await {
        warn!("original bundle {} already gone: {}", original.id, e);
    }
    Ok(bound)
}

/// Unbind and delete every fragment bound so far.
async fn rollback(store: &dyn BundleStore, bound: &[(BundleId, Arc<RoutedBundle>)]) {
    for (id, routed) in bound {
        routed.cancel();
        if let Err(e) = store.delete(*id).await {
            warn!("rollback delete of fragment {} failed: {}", id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dtn_storage::MemoryStore;
    use dtn_wire::BundleVersion;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    fn bundle_with_payload(len: usize) -> Bundle {
        Bundle {
            id: 0,
            version: BundleVersion::V7,
            source: "dtn://alpha/app".into(),
            destination: "dtn://beta/app".into(),
            creation_timestamp_s: 1_700_000_000,
            lifetime_s: 300,
            flags: BundleFlags::empty(),
            hop_count: 0,
            fragment_offset: 0,
            total_adu_length: len as u64,
            payload: Bytes::from(vec![0x5Au8; len]),
        }
    }

    /// Records handovers; optionally fails from the n-th enqueue on.
    struct RecordingResolver {
        enqueued: Mutex<Vec<(String, BundleId)>>,
        fail_from: Option<usize>,
        calls: AtomicUsize,
    }

    impl RecordingResolver {
        fn new(fail_from: Option<usize>) -> Self {
            Self {
                enqueued: Mutex::new(Vec::new()),
                fail_from,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ContactResolver for RecordingResolver {
        async fn max_bundle_size(&self, _cla_addr: &str) -> Option<usize> {
            Some(usize::MAX)
        }

        async fn enqueue(&self, cla_addr: &str, outbound: OutboundBundle) -> Result<(), RouteError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(fail_from) = self.fail_from {
                if n >= fail_from {
                    return Err(RouteError::QueueUnavailable(cla_addr.to_string()));
                }
            }
            self.enqueued
                .lock()
                .await
                .push((cla_addr.to_string(), outbound.bundle.id));
            Ok(())
        }
    }

    /// Fails fragment construction at a chosen step.
    struct FailingAlloc {
        fail_at: usize,
        inner: DefaultFragmentAlloc,
        calls: AtomicUsize,
    }

    impl FragmentAlloc for FailingAlloc {
        fn alloc(
            &self,
            parent: &Bundle,
            offset: u64,
            payload: Bytes,
        ) -> Result<Bundle, RouteError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == self.fail_at {
                return Err(RouteError::NoMemory);
            }
            self.inner.alloc(parent, offset, payload)
        }
    }

    #[tokio::test]
    async fn test_fragments_cover_payload_in_order() {
        let store = MemoryStore::new(16);
        let resolver = RecordingResolver::new(None);
        let alloc = DefaultFragmentAlloc;

        let mut original = bundle_with_payload(1000);
        original.id = store.add(original.clone()).await.unwrap();
        let max = original.header_size() + 400;

        let bound = fragment_and_route(
            &store,
            &resolver,
            &alloc,
            &original,
            &["mtcp://peer".to_string()],
            max,
        )
        .await
        .unwrap();

        assert_eq!(bound.len(), 3);
        // original replaced by its fragments
        assert!(store.get(original.id).await.is_err());
        assert_eq!(store.len().await, 3);

        let mut offset = 0u64;
        for (id, routed) in &bound {
            let frag = store.get(*id).await.unwrap();
            assert!(frag.flags.contains(BundleFlags::IS_FRAGMENT));
            assert_eq!(frag.fragment_offset, offset);
            assert_eq!(frag.total_adu_length, 1000);
            assert!(frag.serialized_size() <= max);
            assert_eq!(routed.contact_count(), 1);
            offset += frag.payload.len() as u64;
        }
        assert_eq!(offset, 1000);
        assert_eq!(resolver.enqueued.lock().await.len(), 3);
    }

    #[tokio::test]
    async fn test_alloc_failure_is_all_or_nothing() {
        let store = MemoryStore::new(16);
        let resolver = RecordingResolver::new(None);
        let alloc = FailingAlloc {
            fail_at: 1,
            inner: DefaultFragmentAlloc,
            calls: AtomicUsize::new(0),
        };

        let mut original = bundle_with_payload(1000);
        original.id = store.add(original.clone()).await.unwrap();
        let max = original.header_size() + 400;

        let err = fragment_and_route(
            &store,
            &resolver,
            &alloc,
            &original,
            &["mtcp://peer".to_string()],
            max,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, RouteError::NoMemory));
        // zero fragments persisted, original untouched
        assert_eq!(store.len().await, 1);
        assert!(store.get(original.id).await.is_ok());
        assert!(resolver.enqueued.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_handover_failure_rolls_back_bound_fragments() {
        let store = MemoryStore::new(16);
        // first two fragment handovers succeed, third fails
        let resolver = RecordingResolver::new(Some(2));
        let alloc = DefaultFragmentAlloc;

        let mut original = bundle_with_payload(1000);
        original.id = store.add(original.clone()).await.unwrap();
        let max = original.header_size() + 400;

        let err = fragment_and_route(
            &store,
            &resolver,
            &alloc,
            &original,
            &["mtcp://peer".to_string()],
            max,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, RouteError::QueueUnavailable(_)));
        assert_eq!(store.len().await, 1);
        assert!(store.get(original.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_mtu_too_small_for_any_payload() {
        let store = MemoryStore::new(16);
        let resolver = RecordingResolver::new(None);
        let original = bundle_with_payload(100);

        let err = fragment_and_route(
            &store,
            &resolver,
            &DefaultFragmentAlloc,
            &original,
            &["mtcp://peer".to_string()],
            original.header_size(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RouteError::FragmentTooSmall(_)));
    }
}
