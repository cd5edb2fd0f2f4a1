//! Address-keyed table of active links.

use crate::link::Link;
use crate::ClaError;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Bounded mapping from CLA address to live link.
///
/// All mutation happens while the owning instance's mutex is held; the
/// registry itself carries no lock. Callers release the instance mutex
/// before touching link internals.
pub struct LinkRegistry {
    links: HashMap<String, Arc<Link>>,
    capacity: usize,
}

impl LinkRegistry {
    /// Create a registry bounded to `capacity` concurrent links.
    pub fn new(capacity: usize) -> Self {
        Self {
            links: HashMap::with_capacity(capacity),
            capacity,
        }
    }

    /// Insert a link keyed by its CLA address.
    ///
    /// Fails on a duplicate address (a protocol violation handled by the
    /// caller) or when the registry is full.
    pub fn register(&mut self, link: Arc<Link>) -> Result<(), ClaError> {
        let addr = link.cla_addr().to_string();
        if self.links.contains_key(&addr) {
            return Err(ClaError::DuplicateAddress(addr));
        }
        if self.links.len() >= self.capacity {
            return Err(ClaError::RegistryFull(self.capacity));
        }
        debug!("registered link {}", addr);
        self.links.insert(addr, link);
        Ok(())
    }

    /// Copy out the link for an address, if present.
    pub fn lookup(&self, cla_addr: &str) -> Option<Arc<Link>> {
        self.links.get(cla_addr).cloned()
    }

    /// Remove an address without destroying the link object.
    pub fn unregister(&mut self, cla_addr: &str) -> Option<Arc<Link>> {
        let link = self.links.remove(cla_addr);
        if link.is_some() {
            debug!("unregistered link {}", cla_addr);
        }
        link
    }

    /// Number of registered links.
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// Whether no links are registered.
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(addr: &str) -> Arc<Link> {
        Link::new(addr.into(), 16, 4)
    }

    #[test]
    fn test_lookup_tracks_register_unregister() {
        let mut registry = LinkRegistry::new(4);
        assert!(registry.lookup("mtcp://a").is_none());

        registry.register(link("mtcp://a")).unwrap();
        assert!(registry.lookup("mtcp://a").is_some());

        let removed = registry.unregister("mtcp://a").unwrap();
        assert_eq!(removed.cla_addr(), "mtcp://a");
        assert!(registry.lookup("mtcp://a").is_none());
        assert!(registry.unregister("mtcp://a").is_none());
    }

    #[test]
    fn test_double_register_fails_second_call() {
        let mut registry = LinkRegistry::new(4);
        registry.register(link("mtcp://a")).unwrap();
        assert!(matches!(
            registry.register(link("mtcp://a")),
            Err(ClaError::DuplicateAddress(_))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_capacity_bound() {
        let mut registry = LinkRegistry::new(2);
        registry.register(link("mtcp://a")).unwrap();
        registry.register(link("mtcp://b")).unwrap();
        assert!(matches!(
            registry.register(link("mtcp://c")),
            Err(ClaError::RegistryFull(2))
        ));

        registry.unregister("mtcp://a");
        registry.register(link("mtcp://c")).unwrap();
    }
}
