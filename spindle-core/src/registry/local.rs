//! In-memory service directory
//!
//! Single-process implementation of [`ServiceDirectory`] used by tests and
//! by deployments that keep every component local. Watch callbacks fire
//! synchronously on the thread that mutates the directory, after the
//! mutation is visible to queries.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{SpindleError, SpindleResult};
use crate::tasks::TaskHandle;

use super::{
    DirectoryListener, Lease, Query, RegistrationHandle, RegistryEntry, ServiceDirectory,
    WatchHandle,
};

struct Registered {
    entry: RegistryEntry,
    deadline: Option<Instant>,
    seq: u64,
}

struct WatchRegistration {
    id: Uuid,
    query: Query,
    listener: Arc<dyn DirectoryListener>,
}

/// In-memory directory with lease-aware queries and synchronous watches.
#[derive(Default)]
pub struct LocalDirectory {
    entries: DashMap<Uuid, Registered>,
    watches: RwLock<Vec<WatchRegistration>>,
    next_seq: AtomicU64,
}

impl LocalDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove every entry whose lease has elapsed, firing removal watches.
    /// Returns the number of entries removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<Uuid> = self
            .entries
            .iter()
            .filter(|item| matches!(item.deadline, Some(deadline) if deadline <= now))
            .map(|item| *item.key())
            .collect();

        let mut removed = 0;
        for id in expired {
            if let Some((_, registered)) = self.entries.remove(&id) {
                info!(
                    component = %registered.entry.component_name,
                    "directory entry expired"
                );
                self.notify_removed(&registered.entry);
                removed += 1;
            }
        }
        removed
    }

    /// Spawn a background task sweeping expired leases on an interval.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> TaskHandle {
        let directory = Arc::clone(self);
        TaskHandle::spawn("directory-sweeper", move |mut shutdown| async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = ticker.tick() => {
                        directory.sweep_expired();
                    }
                }
            }
        })
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    fn matching_listeners(&self, entry: &RegistryEntry) -> Vec<Arc<dyn DirectoryListener>> {
        self.watches
            .read()
            .iter()
            .filter(|watch| watch.query.matches(entry))
            .map(|watch| watch.listener.clone())
            .collect()
    }

    fn notify_added(&self, entry: &RegistryEntry) {
        // Listener list is snapshotted first so callbacks may add or drop
        // watches without deadlocking.
        for listener in self.matching_listeners(entry) {
            listener.entry_added(entry);
        }
    }

    fn notify_removed(&self, entry: &RegistryEntry) {
        for listener in self.matching_listeners(entry) {
            listener.entry_removed(entry);
        }
    }
}

impl ServiceDirectory for LocalDirectory {
    fn register(&self, entry: RegistryEntry) -> SpindleResult<RegistrationHandle> {
        let id = Uuid::new_v4();
        let deadline = entry.lease.deadline(Instant::now());
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        info!(
            component = %entry.component_name,
            types = ?entry.provided_types,
            lease = ?entry.lease,
            "registering directory entry"
        );
        let published = entry.clone();
        self.entries.insert(
            id,
            Registered {
                entry,
                deadline,
                seq,
            },
        );
        self.notify_added(&published);
        Ok(RegistrationHandle { id })
    }

    fn renew(&self, handle: &RegistrationHandle, lease: Lease) -> SpindleResult<()> {
        let mut registered =
            self.entries
                .get_mut(&handle.id)
                .ok_or_else(|| SpindleError::StaleRegistration {
                    handle: handle.to_string(),
                })?;
        registered.deadline = lease.deadline(Instant::now());
        registered.entry.lease = lease;
        debug!(component = %registered.entry.component_name, lease = ?lease, "lease renewed");
        Ok(())
    }

    fn unregister(&self, handle: &RegistrationHandle) -> SpindleResult<()> {
        let (_, registered) =
            self.entries
                .remove(&handle.id)
                .ok_or_else(|| SpindleError::StaleRegistration {
                    handle: handle.to_string(),
                })?;
        info!(component = %registered.entry.component_name, "directory entry revoked");
        self.notify_removed(&registered.entry);
        Ok(())
    }

    fn query(&self, query: &Query) -> Vec<RegistryEntry> {
        let now = Instant::now();
        let mut matches: Vec<(u64, RegistryEntry)> = self
            .entries
            .iter()
            .filter(|item| !matches!(item.deadline, Some(deadline) if deadline <= now))
            .filter(|item| query.matches(&item.entry))
            .map(|item| (item.seq, item.entry.clone()))
            .collect();
        // Registration order keeps result ordering stable across re-fetches.
        matches.sort_by_key(|(seq, _)| *seq);
        matches.into_iter().map(|(_, entry)| entry).collect()
    }

    fn watch(&self, query: Query, listener: Arc<dyn DirectoryListener>) -> WatchHandle {
        let id = Uuid::new_v4();
        self.watches.write().push(WatchRegistration {
            id,
            query,
            listener,
        });
        WatchHandle { id }
    }

    fn unwatch(&self, handle: &WatchHandle) {
        self.watches.write().retain(|watch| watch.id != handle.id);
    }
}
