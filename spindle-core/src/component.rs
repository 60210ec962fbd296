//! Component contract, property schemas, and the implementation type registry
//!
//! Every configured object implements [`Component`]: a post-construction
//! hook invoked exactly once after property resolution, and an optional stop
//! hook invoked during manager shutdown. Construction itself goes through a
//! [`ComponentFactory`] registered per implementation type in a
//! [`TypeRegistry`]; the factory carries an explicit per-type
//! [`PropertySchema`] consulted by the resolver, so no runtime type
//! introspection is involved.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::error::{SpindleError, SpindleResult};
use crate::manager::ConfigurationManager;
use crate::raw_config::RawValue;

/// A named, configured object instance owned by a manager.
///
/// Implementations must be shareable across threads; managers hand the same
/// `Arc` to every dependent. The two `as_any` methods exist so typed lookup
/// can downcast trait objects without runtime introspection elsewhere.
pub trait Component: Send + Sync + 'static {
    /// Post-construction hook, invoked exactly once after all properties are
    /// set. A failure here aborts construction; the instance is never cached
    /// and the error propagates to the caller.
    fn start(&self) -> SpindleResult<()> {
        Ok(())
    }

    /// Stop hook, invoked during manager shutdown in reverse dependency
    /// order (dependents before dependencies).
    fn stop(&self) {}

    fn as_any(&self) -> &dyn Any;

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl fmt::Debug for dyn Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<component>")
    }
}

/// Listener notified when a sheet's instance is replaced.
///
/// Callbacks fire synchronously on the thread performing the change and must
/// be safe to run concurrently with in-flight lookups.
pub trait ComponentListener: Send + Sync {
    fn component_added(&self, name: &str, component: &Arc<dyn Component>);
    fn component_removed(&self, name: &str, component: &Arc<dyn Component>);
}

/// The shape a declared property must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    Scalar,
    List,
    Map,
    ComponentRef,
    ComponentRefList,
}

impl PropertyKind {
    /// Whether a raw value has the shape this kind requires.
    pub fn accepts(&self, value: &RawValue) -> bool {
        matches!(
            (self, value),
            (PropertyKind::Scalar, RawValue::Scalar(_))
                | (PropertyKind::List, RawValue::List(_))
                | (PropertyKind::Map, RawValue::Map(_))
                | (PropertyKind::ComponentRef, RawValue::ComponentRef(_))
                | (PropertyKind::ComponentRefList, RawValue::ComponentRefList(_))
        )
    }
}

impl fmt::Display for PropertyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            PropertyKind::Scalar => "scalar",
            PropertyKind::List => "list",
            PropertyKind::Map => "map",
            PropertyKind::ComponentRef => "component reference",
            PropertyKind::ComponentRefList => "component reference list",
        };
        f.write_str(text)
    }
}

/// One declared property: its kind, whether it must be present, and the
/// default applied when an optional property is absent.
#[derive(Debug, Clone)]
pub struct PropertySpec {
    pub kind: PropertyKind,
    pub required: bool,
    pub default: Option<RawValue>,
}

/// Per-implementation-type property table, built once and consulted by the
/// resolver for every build of that type.
#[derive(Debug, Clone, Default)]
pub struct PropertySchema {
    specs: IndexMap<String, PropertySpec>,
}

impl PropertySchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, name: impl Into<String>, kind: PropertyKind) -> Self {
        self.specs.insert(
            name.into(),
            PropertySpec {
                kind,
                required: true,
                default: None,
            },
        );
        self
    }

    pub fn optional(mut self, name: impl Into<String>, kind: PropertyKind) -> Self {
        self.specs.insert(
            name.into(),
            PropertySpec {
                kind,
                required: false,
                default: None,
            },
        );
        self
    }

    pub fn defaulted(mut self, name: impl Into<String>, kind: PropertyKind, default: RawValue) -> Self {
        self.specs.insert(
            name.into(),
            PropertySpec {
                kind,
                required: false,
                default: Some(default),
            },
        );
        self
    }

    pub fn get(&self, name: &str) -> Option<&PropertySpec> {
        self.specs.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PropertySpec)> {
        self.specs.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

/// A resolved component reference: the referenced component's name alongside
/// the shared live instance. The name is retained for provenance capture.
#[derive(Clone)]
pub struct NamedComponent {
    pub name: String,
    pub instance: Arc<dyn Component>,
}

impl NamedComponent {
    pub fn ptr_eq(&self, other: &Arc<dyn Component>) -> bool {
        Arc::ptr_eq(&self.instance, other)
    }
}

impl fmt::Debug for NamedComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedComponent")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// A property value after resolution: scalars and containers are materialized
/// directly, references are replaced with live shared instances.
#[derive(Clone)]
pub enum ResolvedValue {
    Scalar(String),
    List(Vec<ResolvedValue>),
    Map(IndexMap<String, ResolvedValue>),
    Component(NamedComponent),
    ComponentList(Vec<NamedComponent>),
}

impl ResolvedValue {
    pub fn shape(&self) -> &'static str {
        match self {
            ResolvedValue::Scalar(_) => "scalar",
            ResolvedValue::List(_) => "list",
            ResolvedValue::Map(_) => "map",
            ResolvedValue::Component(_) => "component reference",
            ResolvedValue::ComponentList(_) => "component reference list",
        }
    }
}

impl fmt::Debug for ResolvedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolvedValue::Scalar(s) => f.debug_tuple("Scalar").field(s).finish(),
            ResolvedValue::List(items) => f.debug_tuple("List").field(items).finish(),
            ResolvedValue::Map(map) => f.debug_tuple("Map").field(map).finish(),
            ResolvedValue::Component(c) => f.debug_tuple("Component").field(&c.name).finish(),
            ResolvedValue::ComponentList(cs) => {
                let names: Vec<&str> = cs.iter().map(|c| c.name.as_str()).collect();
                f.debug_tuple("ComponentList").field(&names).finish()
            }
        }
    }
}

/// Everything a factory needs to build one component: the component's name,
/// its fully resolved properties, and a weak handle back to the owning
/// manager so built components can request their own reconfiguration.
pub struct BuildContext {
    name: String,
    properties: IndexMap<String, ResolvedValue>,
    manager: Weak<ConfigurationManager>,
}

impl BuildContext {
    pub(crate) fn new(
        name: String,
        properties: IndexMap<String, ResolvedValue>,
        manager: Weak<ConfigurationManager>,
    ) -> Self {
        Self {
            name,
            properties,
            manager,
        }
    }

    /// The name of the component being built.
    pub fn component_name(&self) -> &str {
        &self.name
    }

    /// Weak handle to the owning manager; upgrade fails once the manager has
    /// been released.
    pub fn manager(&self) -> Weak<ConfigurationManager> {
        self.manager.clone()
    }

    pub fn properties(&self) -> &IndexMap<String, ResolvedValue> {
        &self.properties
    }

    pub fn property(&self, name: &str) -> Option<&ResolvedValue> {
        self.properties.get(name)
    }

    fn required(&self, name: &str) -> SpindleResult<&ResolvedValue> {
        self.properties
            .get(name)
            .ok_or_else(|| SpindleError::MissingRequiredProperty {
                component: self.name.clone(),
                property: name.to_string(),
            })
    }

    fn mismatch(&self, name: &str, expected: &str, found: &ResolvedValue) -> SpindleError {
        SpindleError::TypeMismatch {
            component: self.name.clone(),
            property: name.to_string(),
            expected: expected.to_string(),
            found: found.shape().to_string(),
        }
    }

    /// The scalar value of a property.
    pub fn scalar(&self, name: &str) -> SpindleResult<&str> {
        match self.required(name)? {
            ResolvedValue::Scalar(s) => Ok(s),
            other => Err(self.mismatch(name, "scalar", other)),
        }
    }

    /// A scalar property parsed into `T`, surfacing parse failures as type
    /// mismatches naming the property.
    pub fn parse<T>(&self, name: &str) -> SpindleResult<T>
    where
        T: FromStr,
    {
        let text = self.scalar(name)?;
        text.parse().map_err(|_| SpindleError::TypeMismatch {
            component: self.name.clone(),
            property: name.to_string(),
            expected: std::any::type_name::<T>().to_string(),
            found: format!("'{text}'"),
        })
    }

    pub fn list(&self, name: &str) -> SpindleResult<&[ResolvedValue]> {
        match self.required(name)? {
            ResolvedValue::List(items) => Ok(items),
            other => Err(self.mismatch(name, "list", other)),
        }
    }

    pub fn map(&self, name: &str) -> SpindleResult<&IndexMap<String, ResolvedValue>> {
        match self.required(name)? {
            ResolvedValue::Map(map) => Ok(map),
            other => Err(self.mismatch(name, "map", other)),
        }
    }

    /// The live instance behind a component reference property.
    pub fn component(&self, name: &str) -> SpindleResult<Arc<dyn Component>> {
        match self.required(name)? {
            ResolvedValue::Component(c) => Ok(c.instance.clone()),
            other => Err(self.mismatch(name, "component reference", other)),
        }
    }

    /// A component reference downcast to its concrete type.
    pub fn component_as<T: Component>(&self, name: &str) -> SpindleResult<Arc<T>> {
        let instance = self.component(name)?;
        instance
            .as_any_arc()
            .downcast::<T>()
            .map_err(|_| SpindleError::TypeMismatch {
                component: self.name.clone(),
                property: name.to_string(),
                expected: std::any::type_name::<T>().to_string(),
                found: "component of another type".to_string(),
            })
    }

    /// The live instances behind a component reference list property.
    pub fn components(&self, name: &str) -> SpindleResult<Vec<Arc<dyn Component>>> {
        match self.required(name)? {
            ResolvedValue::ComponentList(cs) => {
                Ok(cs.iter().map(|c| c.instance.clone()).collect())
            }
            other => Err(self.mismatch(name, "component reference list", other)),
        }
    }
}

/// Factory for one implementation type: supplies the type's property schema
/// and constructs instances from resolved properties.
pub trait ComponentFactory: Send + Sync {
    /// The property table the resolver consults for this type.
    fn schema(&self) -> &PropertySchema;

    /// Construct an instance. The post-construction hook is invoked by the
    /// resolver afterwards, not by the factory.
    fn build(&self, ctx: &BuildContext) -> SpindleResult<Arc<dyn Component>>;

    /// TypeId of the concrete instance type this factory produces, used by
    /// typed lookup to skip non-candidates without building them.
    fn instance_type_id(&self) -> TypeId;
}

/// Registry of implementation types, keyed by type name.
///
/// Registration of an already-registered type name is an error rather than a
/// silent replacement.
#[derive(Default)]
pub struct TypeRegistry {
    factories: RwLock<HashMap<String, Arc<dyn ComponentFactory>>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        type_name: impl Into<String>,
        factory: Arc<dyn ComponentFactory>,
    ) -> SpindleResult<()> {
        let type_name = type_name.into();
        let mut factories = self.factories.write();
        if factories.contains_key(&type_name) {
            return Err(SpindleError::TypeAlreadyRegistered { type_name });
        }
        factories.insert(type_name, factory);
        Ok(())
    }

    pub fn get(&self, type_name: &str) -> Option<Arc<dyn ComponentFactory>> {
        self.factories.read().get(type_name).cloned()
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.read().contains_key(type_name)
    }

    pub fn type_names(&self) -> Vec<String> {
        self.factories.read().keys().cloned().collect()
    }
}
