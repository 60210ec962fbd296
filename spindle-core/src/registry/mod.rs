//! Service directory capability for the distributed extension
//!
//! The core never talks to a concrete transport. It programs against the
//! [`ServiceDirectory`] trait: register a component descriptor under a
//! lease, query by type and attributes, and watch for membership changes.
//! Any RPC substrate can implement the trait; [`local::LocalDirectory`] is
//! the in-memory implementation used in tests and single-process setups.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::component::Component;
use crate::error::SpindleResult;

pub mod local;

pub use local::LocalDirectory;

/// Validity window for a directory registration.
///
/// A timed lease keeps the entry discoverable for its duration absent
/// renewal; expiry is the directory's responsibility and the core only
/// reacts to the resulting lookup misses and removal events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lease {
    /// Never expires; discoverable until explicitly unregistered
    Unbounded,
    /// Expires this long after registration or the latest renewal
    Timed(#[serde(with = "humantime_serde")] Duration),
}

impl Lease {
    /// Absolute deadline for a lease granted at `granted`.
    pub fn deadline(&self, granted: Instant) -> Option<Instant> {
        match self {
            Lease::Unbounded => None,
            Lease::Timed(duration) => Some(granted + *duration),
        }
    }
}

impl Default for Lease {
    fn default() -> Self {
        Lease::Unbounded
    }
}

/// A published component: its name, the type names it can be discovered
/// under, attribute tags for filtering, the shared live instance, and the
/// lease governing how long it stays discoverable.
#[derive(Clone)]
pub struct RegistryEntry {
    pub component_name: String,
    pub provided_types: Vec<String>,
    pub attributes: IndexMap<String, String>,
    pub instance: Arc<dyn Component>,
    pub lease: Lease,
}

impl fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("component_name", &self.component_name)
            .field("provided_types", &self.provided_types)
            .field("attributes", &self.attributes)
            .field("lease", &self.lease)
            .finish_non_exhaustive()
    }
}

/// Type-plus-attributes filter used for queries and watches.
///
/// An entry matches when it provides the requested type and carries every
/// requested attribute with the same value. An empty attribute map matches
/// any entry of the type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub type_name: String,
    pub attributes: IndexMap<String, String>,
}

impl Query {
    pub fn of_type(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            attributes: IndexMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, entry: &RegistryEntry) -> bool {
        entry.provided_types.iter().any(|t| t == &self.type_name)
            && self
                .attributes
                .iter()
                .all(|(k, v)| entry.attributes.get(k) == Some(v))
    }
}

/// Opaque handle to a live registration; required for renewal and
/// revocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegistrationHandle {
    pub(crate) id: Uuid,
}

impl fmt::Display for RegistrationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "registration-{}", self.id)
    }
}

/// Opaque handle to an active watch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WatchHandle {
    pub(crate) id: Uuid,
}

/// Callback interface for watches. Invoked synchronously on whatever thread
/// observes the membership change; implementations must be safe to run
/// concurrently with in-flight queries.
pub trait DirectoryListener: Send + Sync {
    fn entry_added(&self, entry: &RegistryEntry);
    fn entry_removed(&self, entry: &RegistryEntry);
}

/// The directory capability the core requires from its environment.
///
/// Calls may block on network I/O in remote implementations; the manager
/// therefore never holds a sheet lock for an unrelated component while
/// calling into the directory.
pub trait ServiceDirectory: Send + Sync {
    /// Publish an entry under its lease. The returned handle is required
    /// for renewal and revocation.
    fn register(&self, entry: RegistryEntry) -> SpindleResult<RegistrationHandle>;

    /// Extend (or shorten) the lease on a live registration.
    fn renew(&self, handle: &RegistrationHandle, lease: Lease) -> SpindleResult<()>;

    /// Revoke a registration, firing removal watches.
    fn unregister(&self, handle: &RegistrationHandle) -> SpindleResult<()>;

    /// All live, unexpired entries matching the query, in stable
    /// registration order.
    fn query(&self, query: &Query) -> Vec<RegistryEntry>;

    /// Subscribe to membership changes matching the query.
    fn watch(&self, query: Query, listener: Arc<dyn DirectoryListener>) -> WatchHandle;

    /// Drop a watch. Unknown handles are ignored.
    fn unwatch(&self, handle: &WatchHandle);
}
