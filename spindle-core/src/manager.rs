//! Configuration manager
//!
//! Owns every property sheet plus the global substitution properties,
//! orchestrates lookup and reconfiguration, records the dependency edges
//! discovered during resolution, and tears the graph down in reverse
//! dependency order on shutdown.

use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::component::{Component, ComponentListener, TypeRegistry};
use crate::error::{SpindleError, SpindleResult};
use crate::property_sheet::PropertySheet;
use crate::provenance::{self, ObjectProvenance};
use crate::raw_config::{GlobalProperties, RawPropertyRecord};
use crate::registry::ServiceDirectory;
use crate::tasks::TaskHandle;

/// Per-resolution state: the stack of sheets currently being resolved on
/// this call path. A reference back into the stack is a cycle.
pub struct ResolveCtx {
    path: Vec<String>,
}

impl ResolveCtx {
    pub(crate) fn new() -> Self {
        Self { path: Vec::new() }
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.path.iter().any(|entry| entry == name)
    }

    pub(crate) fn push(&mut self, name: &str) {
        self.path.push(name.to_string());
    }

    pub(crate) fn pop(&mut self) {
        self.path.pop();
    }

    /// The resolution path closed back through `name`, for error messages.
    pub(crate) fn path_through(&self, name: &str) -> String {
        let mut segments: Vec<&str> = self.path.iter().map(String::as_str).collect();
        segments.push(name);
        segments.join(" -> ")
    }
}

/// Owns all sheets plus global properties; hands out live components.
///
/// Managers are shared behind `Arc`; multiple threads may look up, add
/// configuration, and reconfigure concurrently. Each sheet's first build is
/// an exclusive critical section, so fan-in from several dependents still
/// produces exactly one instance per name.
pub struct ConfigurationManager {
    types: Arc<TypeRegistry>,
    directory: Option<Arc<dyn ServiceDirectory>>,
    records: RwLock<IndexMap<String, RawPropertyRecord>>,
    sheets: RwLock<HashMap<String, Arc<PropertySheet>>>,
    globals: RwLock<GlobalProperties>,
    /// dependency name -> names of sheets that resolved a reference to it
    dependents: Mutex<HashMap<String, HashSet<String>>>,
    /// build completion order; later entries depend on earlier ones
    built_order: Mutex<Vec<String>>,
    tasks: Mutex<Vec<TaskHandle>>,
    shut_down: AtomicBool,
    weak_self: Weak<ConfigurationManager>,
}

impl ConfigurationManager {
    /// Manager without a service directory: every sheet resolves locally.
    pub fn new(types: Arc<TypeRegistry>) -> Arc<Self> {
        Self::build(types, None)
    }

    /// Manager wired to a service directory for import/export policies.
    pub fn with_directory(
        types: Arc<TypeRegistry>,
        directory: Arc<dyn ServiceDirectory>,
    ) -> Arc<Self> {
        Self::build(types, Some(directory))
    }

    fn build(types: Arc<TypeRegistry>, directory: Option<Arc<dyn ServiceDirectory>>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            types,
            directory,
            records: RwLock::new(IndexMap::new()),
            sheets: RwLock::new(HashMap::new()),
            globals: RwLock::new(GlobalProperties::new()),
            dependents: Mutex::new(HashMap::new()),
            built_order: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
            weak_self: weak_self.clone(),
        })
    }

    pub fn type_registry(&self) -> &TypeRegistry {
        &self.types
    }

    pub fn directory(&self) -> Option<Arc<dyn ServiceDirectory>> {
        self.directory.clone()
    }

    /// Weak handle suitable for embedding in built components.
    pub fn weak_handle(&self) -> Weak<ConfigurationManager> {
        self.weak_self.clone()
    }

    fn ensure_live(&self) -> SpindleResult<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(SpindleError::ShutDown);
        }
        Ok(())
    }

    /// Merge raw records into the store.
    ///
    /// The whole batch is validated before anything is merged: a name that
    /// already exists (in the store or earlier in the batch) with a
    /// different implementation type rejects the batch. Re-adding a name
    /// with the same type replaces its property map; the change takes
    /// effect on the next reconfigure of that sheet.
    pub fn add_configuration<I>(&self, records: I) -> SpindleResult<()>
    where
        I: IntoIterator<Item = RawPropertyRecord>,
    {
        self.ensure_live()?;
        let incoming: Vec<RawPropertyRecord> = records.into_iter().collect();

        let mut store = self.records.write();
        {
            let mut batch_types: HashMap<&str, &str> = HashMap::new();
            for record in &incoming {
                let existing_type = store
                    .get(&record.name)
                    .map(|existing| existing.impl_type.as_str())
                    .or_else(|| batch_types.get(record.name.as_str()).copied());
                if let Some(existing_type) = existing_type {
                    if existing_type != record.impl_type {
                        return Err(SpindleError::DuplicateName {
                            name: record.name.clone(),
                            existing_type: existing_type.to_string(),
                            new_type: record.impl_type.clone(),
                        });
                    }
                }
                batch_types.insert(&record.name, &record.impl_type);
            }
        }

        for record in incoming {
            debug!(component = %record.name, impl_type = %record.impl_type, "configuration added");
            store.insert(record.name.clone(), record);
        }
        Ok(())
    }

    /// Import global substitution properties, silently dropping malformed
    /// keys.
    pub fn add_global_properties<I, K, V>(&self, pairs: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.globals.write().import(pairs);
    }

    pub fn set_global_property(&self, key: impl Into<String>, value: impl Into<String>) -> bool {
        self.globals.write().set(key, value)
    }

    pub fn global_properties(&self) -> GlobalProperties {
        self.globals.read().clone()
    }

    pub fn component_names(&self) -> Vec<String> {
        self.records.read().keys().cloned().collect()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.records.read().contains_key(name)
    }

    /// Build-or-return-cached lookup by name.
    pub fn lookup(&self, name: &str) -> SpindleResult<Arc<dyn Component>> {
        self.lookup_with_listener(name, None)
    }

    /// Lookup that also registers a listener for future add/remove
    /// notifications on the sheet.
    pub fn lookup_with_listener(
        &self,
        name: &str,
        listener: Option<Arc<dyn ComponentListener>>,
    ) -> SpindleResult<Arc<dyn Component>> {
        self.ensure_live()?;
        let sheet = self.sheet_for(name)?;
        let mut ctx = ResolveCtx::new();
        sheet.resolve(self, &mut ctx, listener, true)
    }

    /// Typed lookup and downcast in one step.
    pub fn lookup_as<T: Component>(&self, name: &str) -> SpindleResult<Arc<T>> {
        let instance = self.lookup(name)?;
        instance
            .as_any_arc()
            .downcast::<T>()
            .map_err(|_| SpindleError::TypeMismatch {
                component: name.to_string(),
                property: "<instance>".to_string(),
                expected: std::any::type_name::<T>().to_string(),
                found: "component of another type".to_string(),
            })
    }

    /// Every component whose factory produces `T`, pre-built, each sheet
    /// registering the listener. Sheets of other instance types are not
    /// built at all.
    pub fn lookup_all<T: Component>(
        &self,
        listener: Option<Arc<dyn ComponentListener>>,
    ) -> SpindleResult<Vec<Arc<T>>> {
        self.ensure_live()?;
        let wanted = TypeId::of::<T>();
        let candidates: Vec<String> = {
            let records = self.records.read();
            records
                .values()
                .filter(|record| {
                    self.types
                        .get(&record.impl_type)
                        .map(|factory| factory.instance_type_id() == wanted)
                        .unwrap_or(false)
                })
                .map(|record| record.name.clone())
                .collect()
        };

        let mut found = Vec::with_capacity(candidates.len());
        for name in candidates {
            let sheet = self.sheet_for(&name)?;
            let mut ctx = ResolveCtx::new();
            let instance = sheet.resolve(self, &mut ctx, listener.clone(), true)?;
            if let Ok(typed) = instance.as_any_arc().downcast::<T>() {
                found.push(typed);
            }
        }
        Ok(found)
    }

    /// Every component declared with the given implementation type name,
    /// pre-built. This is the string-keyed shape a directory query uses.
    pub fn lookup_all_of_type(
        &self,
        type_name: &str,
        listener: Option<Arc<dyn ComponentListener>>,
    ) -> SpindleResult<Vec<Arc<dyn Component>>> {
        self.ensure_live()?;
        let candidates: Vec<String> = {
            let records = self.records.read();
            records
                .values()
                .filter(|record| record.impl_type == type_name)
                .map(|record| record.name.clone())
                .collect()
        };

        let mut found = Vec::with_capacity(candidates.len());
        for name in candidates {
            let sheet = self.sheet_for(&name)?;
            let mut ctx = ResolveCtx::new();
            found.push(sheet.resolve(self, &mut ctx, listener.clone(), true)?);
        }
        Ok(found)
    }

    /// Discard a sheet's cached instance, re-pull its (possibly changed)
    /// raw record, rebuild, and notify listeners removed-then-added. A live
    /// directory registration is proactively revoked before the rebuild and
    /// re-established after it.
    pub fn reconfigure(&self, name: &str) -> SpindleResult<Arc<dyn Component>> {
        self.ensure_live()?;
        let sheet = self.sheet_for(name)?;
        if let Some(record) = self.records.read().get(name).cloned() {
            sheet.refresh_record(record);
        }
        info!(component = %name, "reconfiguring");
        let mut ctx = ResolveCtx::new();
        sheet.resolve(self, &mut ctx, None, false)
    }

    /// Capture the actual resolved configuration of a live component as a
    /// provenance tree, building the component first if necessary.
    pub fn capture_provenance(&self, name: &str) -> SpindleResult<Arc<ObjectProvenance>> {
        self.ensure_live()?;
        provenance::capture(self, name)
    }

    /// Hand a background task to the manager; shutdown requests its stop.
    pub fn adopt_task(&self, task: TaskHandle) {
        self.tasks.lock().push(task);
    }

    /// Tear down all sheets in reverse dependency order (dependents before
    /// dependencies), invoking each locally built component's stop hook and
    /// revoking directory registrations. Idempotent: a second call is a
    /// no-op.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("configuration manager shutting down");

        for task in self.tasks.lock().drain(..) {
            task.request_stop();
        }

        let order = self.teardown_order();
        for name in &order {
            let sheet = self.sheets.read().get(name).cloned();
            if let Some(sheet) = sheet {
                sheet.teardown(self);
            }
        }
        // Sheets that never completed a build still may hold import watches.
        let remaining: Vec<Arc<PropertySheet>> = {
            let sheets = self.sheets.read();
            sheets
                .iter()
                .filter(|(name, _)| !order.contains(*name))
                .map(|(_, sheet)| sheet.clone())
                .collect()
        };
        for sheet in remaining {
            sheet.teardown(self);
        }
        self.sheets.write().clear();
        self.built_order.lock().clear();
    }

    /// Dependents-first teardown order over the sheets that completed a
    /// build, derived from the dependency edges recorded during resolution.
    fn teardown_order(&self) -> Vec<String> {
        let built: Vec<String> = self.built_order.lock().clone();
        let dependents = self.dependents.lock().clone();

        let mut remaining: HashSet<String> = built.iter().cloned().collect();
        let mut order = Vec::with_capacity(built.len());
        while !remaining.is_empty() {
            // A sheet may be torn down once no other remaining sheet
            // depends on it. Later-built sheets go first within a wave.
            let mut wave: Vec<String> = remaining
                .iter()
                .filter(|name| {
                    dependents
                        .get(*name)
                        .map(|deps| deps.is_disjoint(&remaining))
                        .unwrap_or(true)
                })
                .cloned()
                .collect();
            if wave.is_empty() {
                // Only possible with a dependency cycle, which resolution
                // rejects; drain what is left in reverse build order.
                wave = built
                    .iter()
                    .rev()
                    .filter(|name| remaining.contains(*name))
                    .cloned()
                    .collect();
            } else {
                wave.sort_by_key(|name| {
                    std::cmp::Reverse(built.iter().position(|built_name| built_name == name))
                });
            }
            for name in wave {
                remaining.remove(&name);
                order.push(name);
            }
        }
        order
    }

    pub(crate) fn sheet_for(&self, name: &str) -> SpindleResult<Arc<PropertySheet>> {
        if let Some(sheet) = self.sheets.read().get(name) {
            return Ok(sheet.clone());
        }
        let record = self
            .records
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| SpindleError::UnknownComponent {
                name: name.to_string(),
            })?;
        let mut sheets = self.sheets.write();
        let sheet = sheets
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(PropertySheet::new(record)))
            .clone();
        Ok(sheet)
    }

    pub(crate) fn resolve_internal(
        &self,
        name: &str,
        ctx: &mut ResolveCtx,
    ) -> SpindleResult<Arc<dyn Component>> {
        let sheet = self.sheet_for(name)?;
        sheet.resolve(self, ctx, None, true)
    }

    pub(crate) fn record_dependency(&self, dependent: &str, dependency: &str) {
        self.dependents
            .lock()
            .entry(dependency.to_string())
            .or_default()
            .insert(dependent.to_string());
    }

    pub(crate) fn record_built(&self, name: &str) {
        let mut order = self.built_order.lock();
        if let Some(position) = order.iter().position(|entry| entry == name) {
            order.remove(position);
        }
        order.push(name.to_string());
    }
}
