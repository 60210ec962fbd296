//! Round-robin remote component cache

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::component::Component;
use crate::error::{SpindleError, SpindleResult};
use crate::registry::{DirectoryListener, Query, RegistryEntry, ServiceDirectory, WatchHandle};

struct MultiState {
    components: Vec<Arc<dyn Component>>,
    cursor: usize,
    fetched: bool,
}

/// Caches the full matching provider set and vends it round-robin.
///
/// `get_component` picks `cursor % len` and advances the cursor on every
/// call, so N providers are each returned exactly once across N consecutive
/// calls, in stable cyclic order. Any membership change observed by the
/// watch triggers a full re-fetch of the set. An empty set fails with
/// `LookupFailure` rather than returning a null or indexing out of range.
pub struct RemoteMultiComponentManager {
    directory: Arc<dyn ServiceDirectory>,
    query: Query,
    state: Mutex<MultiState>,
    watch: Mutex<Option<WatchHandle>>,
}

impl RemoteMultiComponentManager {
    pub fn new(directory: Arc<dyn ServiceDirectory>, query: Query) -> Arc<Self> {
        let manager = Arc::new(Self {
            directory: directory.clone(),
            query: query.clone(),
            state: Mutex::new(MultiState {
                components: Vec::new(),
                cursor: 0,
                fetched: false,
            }),
            watch: Mutex::new(None),
        });
        let listener = Arc::new(SetMaintenance {
            manager: Arc::downgrade(&manager),
        });
        *manager.watch.lock() = Some(directory.watch(query, listener));
        manager
    }

    pub fn get_component(&self) -> SpindleResult<Arc<dyn Component>> {
        {
            let state = self.state.lock();
            if state.fetched {
                return self.vend(state);
            }
        }
        // First use: fetch outside the lock, then vend.
        self.refetch();
        self.vend(self.state.lock())
    }

    /// Number of providers currently cached.
    pub fn provider_count(&self) -> usize {
        let state = self.state.lock();
        if state.fetched {
            state.components.len()
        } else {
            0
        }
    }

    fn vend(
        &self,
        mut state: parking_lot::MutexGuard<'_, MultiState>,
    ) -> SpindleResult<Arc<dyn Component>> {
        if state.components.is_empty() {
            return Err(SpindleError::LookupFailure {
                type_name: self.query.type_name.clone(),
            });
        }
        let index = state.cursor % state.components.len();
        state.cursor = state.cursor.wrapping_add(1);
        Ok(state.components[index].clone())
    }

    /// Replace the cached set with the directory's current view.
    fn refetch(&self) {
        let entries = self.directory.query(&self.query);
        let mut state = self.state.lock();
        debug!(
            type_name = %self.query.type_name,
            providers = entries.len(),
            "provider set refreshed"
        );
        state.components = entries.into_iter().map(|entry| entry.instance).collect();
        state.fetched = true;
    }
}

impl Drop for RemoteMultiComponentManager {
    fn drop(&mut self) {
        if let Some(watch) = self.watch.lock().take() {
            self.directory.unwatch(&watch);
        }
    }
}

struct SetMaintenance {
    manager: Weak<RemoteMultiComponentManager>,
}

impl DirectoryListener for SetMaintenance {
    fn entry_added(&self, _entry: &RegistryEntry) {
        if let Some(manager) = self.manager.upgrade() {
            manager.refetch();
        }
    }

    fn entry_removed(&self, _entry: &RegistryEntry) {
        if let Some(manager) = self.manager.upgrade() {
            manager.refetch();
        }
    }
}
