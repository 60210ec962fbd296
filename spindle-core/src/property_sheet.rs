//! Per-component resolver and instance cache
//!
//! A [`PropertySheet`] sits between one raw property record and the live
//! component built from it. The first resolve builds the instance inside an
//! exclusive critical section (concurrent callers block, then observe the
//! cached result); later resolves return the cached owner unchanged until
//! the sheet is reconfigured. Sheets whose policy marks them importable and
//! that declare no local properties are satisfied from the service
//! directory instead of being constructed locally, and invalidate their
//! cache when the adopted entry disappears.

use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::component::{
    BuildContext, Component, ComponentListener, NamedComponent, PropertySchema, ResolvedValue,
};
use crate::error::{SpindleError, SpindleResult};
use crate::manager::{ConfigurationManager, ResolveCtx};
use crate::raw_config::{GlobalProperties, RawPropertyRecord, RawValue};
use crate::registry::{
    DirectoryListener, Query, RegistrationHandle, RegistryEntry, WatchHandle,
};

struct SheetState {
    record: RawPropertyRecord,
    owner: Option<Arc<dyn Component>>,
    resolved: Option<IndexMap<String, ResolvedValue>>,
    registration: Option<RegistrationHandle>,
    import_watch: Option<WatchHandle>,
    imported: bool,
}

/// Deferred listener notification, fired after the sheet lock is released
/// so callbacks can call back into the manager.
enum Notification {
    Removed(Arc<dyn Component>),
    Added(Arc<dyn Component>),
}

/// Resolver/cache for exactly one component name.
pub struct PropertySheet {
    name: String,
    state: Mutex<SheetState>,
    listeners: Mutex<Vec<Arc<dyn ComponentListener>>>,
}

impl PropertySheet {
    pub(crate) fn new(record: RawPropertyRecord) -> Self {
        let name = record.name.clone();
        Self {
            name,
            state: Mutex::new(SheetState {
                record,
                owner: None,
                resolved: None,
                registration: None,
                import_watch: None,
                imported: false,
            }),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn impl_type(&self) -> String {
        self.state.lock().record.impl_type.clone()
    }

    /// Whether an instance is currently cached.
    pub fn is_built(&self) -> bool {
        self.state.lock().owner.is_some()
    }

    /// Whether the cached instance came from the directory rather than a
    /// local build.
    pub fn is_imported(&self) -> bool {
        self.state.lock().imported
    }

    pub(crate) fn add_listener(&self, listener: Arc<dyn ComponentListener>) {
        self.listeners.lock().push(listener);
    }

    /// Replace the raw record ahead of a rebuild. Used by reconfigure to
    /// pick up configuration that changed since the last build.
    pub(crate) fn refresh_record(&self, record: RawPropertyRecord) {
        self.state.lock().record = record;
    }

    /// The resolved property values of the cached instance, if built
    /// locally. Imported instances have no local resolution.
    pub(crate) fn resolved_snapshot(&self) -> Option<(String, IndexMap<String, ResolvedValue>)> {
        let state = self.state.lock();
        state
            .resolved
            .as_ref()
            .map(|resolved| (state.record.impl_type.clone(), resolved.clone()))
    }

    /// Resolve to a live instance.
    ///
    /// With `reuse`, a cached owner is returned unchanged. Without it, the
    /// cached owner is discarded first: its directory registration is
    /// proactively revoked, listeners see removal-then-addition, and the
    /// post-construction hook of the replacement runs exactly once.
    pub(crate) fn resolve(
        self: &Arc<Self>,
        manager: &ConfigurationManager,
        ctx: &mut ResolveCtx,
        listener: Option<Arc<dyn ComponentListener>>,
        reuse: bool,
    ) -> SpindleResult<Arc<dyn Component>> {
        if ctx.contains(&self.name) {
            return Err(SpindleError::CircularDependency {
                component: self.name.clone(),
                path: ctx.path_through(&self.name),
            });
        }
        if let Some(listener) = listener {
            self.add_listener(listener);
        }

        // Exclusive build section: concurrent callers for the same sheet
        // block here and observe the cached result afterwards.
        let mut state = self.state.lock();
        let mut notifications: Vec<Notification> = Vec::new();

        if reuse {
            if let Some(owner) = state.owner.as_ref() {
                return Ok(owner.clone());
            }
        } else if let Some(old) = state.owner.take() {
            state.resolved = None;
            self.revoke_registration(manager, &mut state);
            state.imported = false;
            notifications.push(Notification::Removed(old));
            info!(component = %self.name, "discarded cached instance for rebuild");
        }

        let built = self.build_locked(manager, ctx, &mut state);
        let owner = match built {
            Ok(owner) => owner,
            Err(err) => {
                drop(state);
                // A replacement that failed to build still removed the old
                // instance; dependents must hear about it.
                self.dispatch(notifications);
                return Err(err);
            }
        };

        if !notifications.is_empty() {
            notifications.push(Notification::Added(owner.clone()));
        }
        drop(state);
        self.dispatch(notifications);
        Ok(owner)
    }

    /// Build under the held state lock. Import is attempted first for pure
    /// import sheets; everything else constructs locally.
    fn build_locked(
        self: &Arc<Self>,
        manager: &ConfigurationManager,
        ctx: &mut ResolveCtx,
        state: &mut SheetState,
    ) -> SpindleResult<Arc<dyn Component>> {
        let record = state.record.clone();
        let pure_import = record.policy.importable && record.properties.is_empty();

        if pure_import {
            return self.import_locked(manager, state, &record);
        }

        let factory = manager
            .type_registry()
            .get(&record.impl_type)
            .ok_or_else(|| SpindleError::UnknownType {
                type_name: record.impl_type.clone(),
            })?;

        ctx.push(&self.name);
        let resolved = self.resolve_properties(manager, ctx, &record, factory.schema());
        ctx.pop();
        let resolved = resolved?;

        let build_ctx = BuildContext::new(self.name.clone(), resolved.clone(), manager.weak_handle());
        let instance = factory.build(&build_ctx)?;
        instance.start().map_err(|err| {
            warn!(component = %self.name, error = %err, "post-construction hook failed");
            SpindleError::StartFailed {
                component: self.name.clone(),
                source: Box::new(err),
            }
        })?;
        debug!(component = %self.name, impl_type = %record.impl_type, "component built");

        state.owner = Some(instance.clone());
        state.resolved = Some(resolved);
        state.imported = false;
        manager.record_built(&self.name);

        // Opportunistic export: explicitly exportable sheets always publish;
        // importable sheets that ended up constructing locally publish too.
        if record.policy.exportable || record.policy.importable {
            if let Some(directory) = manager.directory() {
                let entry = RegistryEntry {
                    component_name: self.name.clone(),
                    provided_types: vec![record.impl_type.clone()],
                    attributes: record.policy.attributes.clone(),
                    instance: instance.clone(),
                    lease: record.policy.lease,
                };
                match directory.register(entry) {
                    Ok(handle) => {
                        info!(component = %self.name, "exported to directory");
                        state.registration = Some(handle);
                    }
                    Err(err) => {
                        warn!(component = %self.name, error = %err, "directory export failed");
                    }
                }
            }
        }

        Ok(instance)
    }

    /// Pure import: satisfy the sheet from the directory, adopting the
    /// first match and subscribing for invalidation.
    fn import_locked(
        self: &Arc<Self>,
        manager: &ConfigurationManager,
        state: &mut SheetState,
        record: &RawPropertyRecord,
    ) -> SpindleResult<Arc<dyn Component>> {
        let directory = manager
            .directory()
            .ok_or_else(|| SpindleError::LookupFailure {
                type_name: record.impl_type.clone(),
            })?;

        let query = Query {
            type_name: record.impl_type.clone(),
            attributes: record.policy.attributes.clone(),
        };
        let matches = directory.query(&query);
        let Some(adopted) = matches.into_iter().next() else {
            debug!(component = %self.name, type_name = %record.impl_type, "import query found nothing");
            return Err(SpindleError::LookupFailure {
                type_name: record.impl_type.clone(),
            });
        };
        info!(
            component = %self.name,
            provider = %adopted.component_name,
            "imported from directory"
        );

        if state.import_watch.is_none() {
            let invalidation = Arc::new(ImportInvalidation {
                sheet: Arc::downgrade(self),
            });
            state.import_watch = Some(directory.watch(query, invalidation));
        }
        state.owner = Some(adopted.instance.clone());
        state.imported = true;
        Ok(adopted.instance)
    }

    fn resolve_properties(
        &self,
        manager: &ConfigurationManager,
        ctx: &mut ResolveCtx,
        record: &RawPropertyRecord,
        schema: &PropertySchema,
    ) -> SpindleResult<IndexMap<String, ResolvedValue>> {
        // Undeclared properties are rejected before anything resolves so a
        // typo cannot silently drop configuration.
        for property in record.properties.keys() {
            if schema.get(property).is_none() {
                return Err(SpindleError::UnknownProperty {
                    component: self.name.clone(),
                    property: property.clone(),
                });
            }
        }

        let globals = manager.global_properties();
        let mut resolved = IndexMap::new();
        for (property, spec) in schema.iter() {
            let raw = match record.properties.get(property) {
                Some(value) => substitute_raw(value, &globals),
                None if spec.required => {
                    return Err(SpindleError::MissingRequiredProperty {
                        component: self.name.clone(),
                        property: property.clone(),
                    });
                }
                None => match &spec.default {
                    Some(default) => substitute_raw(default, &globals),
                    None => continue,
                },
            };

            if !spec.kind.accepts(&raw) {
                return Err(SpindleError::TypeMismatch {
                    component: self.name.clone(),
                    property: property.clone(),
                    expected: spec.kind.to_string(),
                    found: raw.shape().to_string(),
                });
            }

            let value = self.resolve_value(manager, ctx, property, &raw)?;
            resolved.insert(property.clone(), value);
        }
        Ok(resolved)
    }

    fn resolve_value(
        &self,
        manager: &ConfigurationManager,
        ctx: &mut ResolveCtx,
        property: &str,
        raw: &RawValue,
    ) -> SpindleResult<ResolvedValue> {
        match raw {
            RawValue::Scalar(s) => Ok(ResolvedValue::Scalar(s.clone())),
            RawValue::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.resolve_plain(manager, ctx, property, item)?);
                }
                Ok(ResolvedValue::List(out))
            }
            RawValue::Map(entries) => {
                let mut out = IndexMap::with_capacity(entries.len());
                for (key, item) in entries {
                    out.insert(key.clone(), self.resolve_plain(manager, ctx, property, item)?);
                }
                Ok(ResolvedValue::Map(out))
            }
            RawValue::ComponentRef(target) => {
                let handle = self.resolve_reference(manager, ctx, target)?;
                Ok(ResolvedValue::Component(handle))
            }
            RawValue::ComponentRefList(targets) => {
                let mut out = Vec::with_capacity(targets.len());
                for target in targets {
                    out.push(self.resolve_reference(manager, ctx, target)?);
                }
                Ok(ResolvedValue::ComponentList(out))
            }
        }
    }

    /// Containers hold plain data only; a reference nested inside a list or
    /// map has no declared kind to resolve against.
    fn resolve_plain(
        &self,
        manager: &ConfigurationManager,
        ctx: &mut ResolveCtx,
        property: &str,
        raw: &RawValue,
    ) -> SpindleResult<ResolvedValue> {
        match raw {
            RawValue::ComponentRef(_) | RawValue::ComponentRefList(_) => {
                Err(SpindleError::TypeMismatch {
                    component: self.name.clone(),
                    property: property.to_string(),
                    expected: "plain value inside container".to_string(),
                    found: raw.shape().to_string(),
                })
            }
            other => self.resolve_value(manager, ctx, property, other),
        }
    }

    fn resolve_reference(
        &self,
        manager: &ConfigurationManager,
        ctx: &mut ResolveCtx,
        target: &str,
    ) -> SpindleResult<NamedComponent> {
        manager.record_dependency(&self.name, target);
        let instance = manager.resolve_internal(target, ctx)?;
        Ok(NamedComponent {
            name: target.to_string(),
            instance,
        })
    }

    fn revoke_registration(&self, manager: &ConfigurationManager, state: &mut SheetState) {
        if let Some(handle) = state.registration.take() {
            if let Some(directory) = manager.directory() {
                // The lease may already have expired; a stale handle is fine.
                if let Err(err) = directory.unregister(&handle) {
                    debug!(component = %self.name, error = %err, "revocation skipped");
                }
            }
        }
    }

    /// Invalidation callback target: the adopted directory entry vanished.
    fn on_import_removed(&self, entry: &RegistryEntry) {
        let mut state = self.state.lock();
        let matches = state.imported
            && state
                .owner
                .as_ref()
                .is_some_and(|owner| Arc::ptr_eq(owner, &entry.instance));
        if !matches {
            return;
        }
        let Some(old) = state.owner.take() else {
            return;
        };
        state.imported = false;
        drop(state);
        info!(component = %self.name, "imported instance withdrawn, cache cleared");
        self.dispatch(vec![Notification::Removed(old)]);
    }

    /// Tear-down used by manager shutdown: stop the locally built owner,
    /// revoke any registration, drop any import watch. Imported instances
    /// are not stopped; their exporter owns their lifecycle.
    pub(crate) fn teardown(&self, manager: &ConfigurationManager) {
        let mut state = self.state.lock();
        self.revoke_registration(manager, &mut state);
        if let Some(watch) = state.import_watch.take() {
            if let Some(directory) = manager.directory() {
                directory.unwatch(&watch);
            }
        }
        let owner = state.owner.take();
        let imported = state.imported;
        state.resolved = None;
        state.imported = false;
        drop(state);

        if let Some(owner) = owner {
            if !imported {
                debug!(component = %self.name, "stopping component");
                owner.stop();
            }
        }
    }

    fn dispatch(&self, notifications: Vec<Notification>) {
        if notifications.is_empty() {
            return;
        }
        let listeners: Vec<Arc<dyn ComponentListener>> = self.listeners.lock().clone();
        for notification in &notifications {
            for listener in &listeners {
                match notification {
                    Notification::Removed(old) => listener.component_removed(&self.name, old),
                    Notification::Added(new) => listener.component_added(&self.name, new),
                }
            }
        }
    }
}

/// Applies `${name}` substitution to scalars and reference names, deeply.
fn substitute_raw(value: &RawValue, globals: &GlobalProperties) -> RawValue {
    match value {
        RawValue::Scalar(s) => RawValue::Scalar(globals.substitute(s)),
        RawValue::List(items) => {
            RawValue::List(items.iter().map(|v| substitute_raw(v, globals)).collect())
        }
        RawValue::Map(entries) => RawValue::Map(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), substitute_raw(v, globals)))
                .collect(),
        ),
        RawValue::ComponentRef(name) => RawValue::ComponentRef(globals.substitute(name)),
        RawValue::ComponentRefList(names) => RawValue::ComponentRefList(
            names.iter().map(|name| globals.substitute(name)).collect(),
        ),
    }
}

struct ImportInvalidation {
    sheet: Weak<PropertySheet>,
}

impl DirectoryListener for ImportInvalidation {
    fn entry_added(&self, _entry: &RegistryEntry) {}

    fn entry_removed(&self, entry: &RegistryEntry) {
        if let Some(sheet) = self.sheet.upgrade() {
            sheet.on_import_removed(entry);
        }
    }
}
