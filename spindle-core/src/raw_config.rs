//! Raw configuration records and global properties
//!
//! This module contains the format-agnostic configuration model that format
//! loaders produce and the configuration manager consumes: raw property
//! records, the values they may hold, per-sheet directory policy, and the
//! global (substitution) properties applied to values before type-checking.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::registry::Lease;

/// A single raw property value as produced by a format loader.
///
/// Values are self-describing: scalars stay strings until the owning
/// component's schema gives them a concrete interpretation. References name
/// other components in the same manager and are resolved recursively during
/// sheet resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawValue {
    /// A scalar, kept as text until the schema interprets it
    Scalar(String),
    /// An ordered list of nested values (no component references inside)
    List(Vec<RawValue>),
    /// An ordered map of nested values (no component references inside)
    Map(IndexMap<String, RawValue>),
    /// A reference to another component by name
    ComponentRef(String),
    /// An ordered list of component references
    ComponentRefList(Vec<String>),
}

impl RawValue {
    /// Human-readable shape name, used in type mismatch errors.
    pub fn shape(&self) -> &'static str {
        match self {
            RawValue::Scalar(_) => "scalar",
            RawValue::List(_) => "list",
            RawValue::Map(_) => "map",
            RawValue::ComponentRef(_) => "component reference",
            RawValue::ComponentRefList(_) => "component reference list",
        }
    }
}

/// Directory policy attached to a raw record.
///
/// Controls whether the built component is published to the service
/// directory and whether resolution may satisfy the record from the
/// directory instead of constructing locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SheetPolicy {
    /// Publish the built component to the directory after construction
    pub exportable: bool,
    /// Allow resolution through a directory query instead of local build
    pub importable: bool,
    /// Lease attached to the directory registration, if exported
    pub lease: Lease,
    /// Attribute tags attached to the registration and used in queries
    pub attributes: IndexMap<String, String>,
}

impl Default for SheetPolicy {
    fn default() -> Self {
        Self {
            exportable: false,
            importable: false,
            lease: Lease::Unbounded,
            attributes: IndexMap::new(),
        }
    }
}

/// One component's raw configuration: name, implementation type, and an
/// ordered property map. Produced by format loaders, merged into the
/// manager with `add_configuration`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPropertyRecord {
    /// Unique component name within one manager
    pub name: String,
    /// Implementation type, resolved against the type registry
    pub impl_type: String,
    /// Ordered property map
    #[serde(default)]
    pub properties: IndexMap<String, RawValue>,
    /// Directory export/import policy
    #[serde(default)]
    pub policy: SheetPolicy,
}

impl RawPropertyRecord {
    pub fn new(name: impl Into<String>, impl_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            impl_type: impl_type.into(),
            properties: IndexMap::new(),
            policy: SheetPolicy::default(),
        }
    }

    /// Add a property, preserving insertion order.
    pub fn with_property(mut self, name: impl Into<String>, value: RawValue) -> Self {
        self.properties.insert(name.into(), value);
        self
    }

    pub fn with_policy(mut self, policy: SheetPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Whether a key is acceptable as a global property name.
///
/// The pattern is deliberately conservative: letters, digits, `.`, `_`
/// and `-`. Anything else is dropped on import without an error so that an
/// arbitrary ambient key/value source can be imported wholesale.
fn is_valid_global_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
}

/// Global substitution properties owned by a manager.
///
/// Values are substituted into scalar values and reference names via
/// `${name}` syntax before type-checking.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalProperties {
    values: IndexMap<String, String>,
}

impl GlobalProperties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a single property. Returns false if the key does not conform to
    /// the identifier pattern; the property is dropped in that case.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> bool {
        let key = key.into();
        if !is_valid_global_key(&key) {
            tracing::debug!(key = %key, "dropping malformed global property key");
            return false;
        }
        self.values.insert(key, value.into());
        true
    }

    /// Import a batch of key/value pairs, silently dropping keys that do
    /// not conform to the identifier pattern.
    pub fn import<I, K, V>(&mut self, pairs: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (key, value) in pairs {
            self.set(key, value);
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Substitute every `${name}` occurrence whose name is a known global
    /// property. Unknown names are left verbatim; a typo then surfaces
    /// downstream as a type-check or unknown-component error carrying the
    /// literal text.
    pub fn substitute(&self, input: &str) -> String {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find('}') {
                Some(end) => {
                    let key = &after[..end];
                    match self.values.get(key) {
                        Some(value) => out.push_str(value),
                        None => {
                            out.push_str("${");
                            out.push_str(key);
                            out.push('}');
                        }
                    }
                    rest = &after[end + 1..];
                }
                None => {
                    // Unterminated marker, keep the tail as-is
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }
}
