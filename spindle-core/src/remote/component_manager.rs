//! Single-instance remote component cache

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::component::Component;
use crate::error::{SpindleError, SpindleResult};
use crate::registry::{DirectoryListener, Query, RegistryEntry, ServiceDirectory, WatchHandle};

/// Caches one resolved instance of a remote component.
///
/// The first matching instance seen by the watch is adopted if nothing is
/// cached; a removal matching the cached instance clears the cache; the
/// next `get_component` after a clear performs a fresh directory lookup.
/// The cached reference is swapped under a lock, so no caller ever observes
/// a half-updated value.
pub struct RemoteComponentManager {
    directory: Arc<dyn ServiceDirectory>,
    query: Query,
    cached: Mutex<Option<Arc<dyn Component>>>,
    watch: Mutex<Option<WatchHandle>>,
}

impl RemoteComponentManager {
    pub fn new(directory: Arc<dyn ServiceDirectory>, query: Query) -> Arc<Self> {
        let manager = Arc::new(Self {
            directory: directory.clone(),
            query: query.clone(),
            cached: Mutex::new(None),
            watch: Mutex::new(None),
        });
        let listener = Arc::new(CacheMaintenance {
            manager: Arc::downgrade(&manager),
        });
        *manager.watch.lock() = Some(directory.watch(query, listener));
        manager
    }

    /// The cached instance, or a fresh directory lookup if the cache is
    /// empty. Fails with `LookupFailure` when the directory has no match.
    pub fn get_component(&self) -> SpindleResult<Arc<dyn Component>> {
        if let Some(component) = self.cached.lock().clone() {
            return Ok(component);
        }

        // Query outside the cache lock: directory calls may block.
        let matches = self.directory.query(&self.query);
        let mut cached = self.cached.lock();
        if let Some(component) = cached.as_ref() {
            // The watch adopted something while we were querying.
            return Ok(component.clone());
        }
        match matches.into_iter().next() {
            Some(entry) => {
                info!(
                    provider = %entry.component_name,
                    type_name = %self.query.type_name,
                    "adopted remote component"
                );
                *cached = Some(entry.instance.clone());
                Ok(entry.instance)
            }
            None => Err(SpindleError::LookupFailure {
                type_name: self.query.type_name.clone(),
            }),
        }
    }

    /// Whether an instance is currently cached.
    pub fn is_cached(&self) -> bool {
        self.cached.lock().is_some()
    }

    fn on_added(&self, entry: &RegistryEntry) {
        let mut cached = self.cached.lock();
        if cached.is_none() {
            debug!(provider = %entry.component_name, "watch adopted first matching instance");
            *cached = Some(entry.instance.clone());
        }
    }

    fn on_removed(&self, entry: &RegistryEntry) {
        let mut cached = self.cached.lock();
        let matches = cached
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, &entry.instance));
        if matches {
            debug!(provider = %entry.component_name, "cached instance withdrawn");
            *cached = None;
        }
    }
}

impl Drop for RemoteComponentManager {
    fn drop(&mut self) {
        if let Some(watch) = self.watch.lock().take() {
            self.directory.unwatch(&watch);
        }
    }
}

/// Watch adapter holding a weak handle, so dropping the manager drops the
/// watch instead of the watch pinning the manager alive.
struct CacheMaintenance {
    manager: Weak<RemoteComponentManager>,
}

impl DirectoryListener for CacheMaintenance {
    fn entry_added(&self, entry: &RegistryEntry) {
        if let Some(manager) = self.manager.upgrade() {
            manager.on_added(entry);
        }
    }

    fn entry_removed(&self, entry: &RegistryEntry) {
        if let Some(manager) = self.manager.upgrade() {
            manager.on_removed(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Lease, LocalDirectory};
    use indexmap::IndexMap;
    use std::any::Any;

    struct Dummy;

    impl Component for Dummy {
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    fn entry(name: &str) -> RegistryEntry {
        RegistryEntry {
            component_name: name.to_string(),
            provided_types: vec!["test.Service".to_string()],
            attributes: IndexMap::new(),
            instance: Arc::new(Dummy),
            lease: Lease::Unbounded,
        }
    }

    #[test]
    fn lookup_failure_when_nothing_matches() {
        let directory = Arc::new(LocalDirectory::new());
        let manager = RemoteComponentManager::new(directory, Query::of_type("test.Service"));
        let err = manager.get_component().unwrap_err();
        assert!(matches!(err, SpindleError::LookupFailure { .. }));
    }

    #[test]
    fn adopts_on_registration_and_clears_on_removal() {
        let directory = Arc::new(LocalDirectory::new());
        let manager =
            RemoteComponentManager::new(directory.clone(), Query::of_type("test.Service"));

        let handle = directory.register(entry("svc")).unwrap();
        // The watch adopted it before anyone asked.
        assert!(manager.is_cached());
        let first = manager.get_component().unwrap();

        directory.unregister(&handle).unwrap();
        assert!(!manager.is_cached());

        // Next call after the clear triggers a fresh lookup.
        assert!(manager.get_component().is_err());
        directory.register(entry("svc-replacement")).unwrap();
        let second = manager.get_component().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn removal_of_a_different_instance_keeps_the_cache() {
        let directory = Arc::new(LocalDirectory::new());
        let manager =
            RemoteComponentManager::new(directory.clone(), Query::of_type("test.Service"));

        directory.register(entry("kept")).unwrap();
        let other = directory.register(entry("other")).unwrap();
        let cached = manager.get_component().unwrap();

        directory.unregister(&other).unwrap();
        assert!(manager.is_cached());
        assert!(Arc::ptr_eq(&cached, &manager.get_component().unwrap()));
    }
}
