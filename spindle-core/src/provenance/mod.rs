//! Provenance capture
//!
//! A provenance tree records what actually configured a live component: the
//! resolved property values, not the raw record they came from, so applied
//! defaults and substitutions are reflected. A child component referenced
//! from several places appears as one shared node; equality is content
//! equality, so a reconstructed graph compares equal to the original even
//! though every allocation differs.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::component::ResolvedValue;
use crate::error::SpindleResult;
use crate::manager::ConfigurationManager;

pub mod extract;
pub mod marshal;

pub use extract::{extract_configuration, ConfigurationData};
pub use marshal::{marshal, unmarshal, MarshalledField, MarshalledProvenance, MarshalledValue};

/// One captured property value.
#[derive(Debug, Clone, PartialEq)]
pub enum Provenance {
    /// A scalar value
    Primitive(String),
    /// Ordered children
    List(Vec<Provenance>),
    /// Keyed children
    Map(IndexMap<String, Provenance>),
    /// A nested component, shared wherever the same instance recurs
    Object(Arc<ObjectProvenance>),
}

/// Provenance of one component: its implementation type and the ordered
/// list of captured property values.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectProvenance {
    pub impl_type: String,
    pub fields: Vec<(String, Provenance)>,
}

impl ObjectProvenance {
    pub fn new(impl_type: impl Into<String>, fields: Vec<(String, Provenance)>) -> Self {
        Self {
            impl_type: impl_type.into(),
            fields,
        }
    }

    pub fn field(&self, key: &str) -> Option<&Provenance> {
        self.fields
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value)
    }
}

/// Capture the provenance of a live component, building it first if needed.
///
/// Capture is deterministic: the same live graph always yields a
/// structurally identical tree. Sharing is preserved per component name:
/// a dependency referenced by several dependents captures to one shared
/// node.
pub(crate) fn capture(
    manager: &ConfigurationManager,
    name: &str,
) -> SpindleResult<Arc<ObjectProvenance>> {
    let mut memo = HashMap::new();
    capture_component(manager, name, &mut memo)
}

fn capture_component(
    manager: &ConfigurationManager,
    name: &str,
    memo: &mut HashMap<String, Arc<ObjectProvenance>>,
) -> SpindleResult<Arc<ObjectProvenance>> {
    if let Some(existing) = memo.get(name) {
        return Ok(existing.clone());
    }
    manager.lookup(name)?;
    let sheet = manager.sheet_for(name)?;

    let object = match sheet.resolved_snapshot() {
        Some((impl_type, resolved)) => {
            let mut fields = Vec::with_capacity(resolved.len());
            for (property, value) in &resolved {
                fields.push((property.clone(), capture_value(manager, value, memo)?));
            }
            Arc::new(ObjectProvenance { impl_type, fields })
        }
        // Imported instances resolved no local properties; their provenance
        // is an opaque node carrying the declared type.
        None => Arc::new(ObjectProvenance {
            impl_type: sheet.impl_type(),
            fields: Vec::new(),
        }),
    };
    memo.insert(name.to_string(), object.clone());
    Ok(object)
}

fn capture_value(
    manager: &ConfigurationManager,
    value: &ResolvedValue,
    memo: &mut HashMap<String, Arc<ObjectProvenance>>,
) -> SpindleResult<Provenance> {
    Ok(match value {
        ResolvedValue::Scalar(s) => Provenance::Primitive(s.clone()),
        ResolvedValue::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(capture_value(manager, item, memo)?);
            }
            Provenance::List(out)
        }
        ResolvedValue::Map(entries) => {
            let mut out = IndexMap::with_capacity(entries.len());
            for (key, item) in entries {
                out.insert(key.clone(), capture_value(manager, item, memo)?);
            }
            Provenance::Map(out)
        }
        ResolvedValue::Component(reference) => {
            Provenance::Object(capture_component(manager, &reference.name, memo)?)
        }
        ResolvedValue::ComponentList(references) => {
            let mut out = Vec::with_capacity(references.len());
            for reference in references {
                out.push(Provenance::Object(capture_component(
                    manager,
                    &reference.name,
                    memo,
                )?));
            }
            Provenance::List(out)
        }
    })
}

/// Distinct object nodes reachable from `root`, dependencies before
/// dependents, deduplicated by pointer identity. Uses an explicit stack so
/// graph depth is bounded only by memory.
pub(crate) fn object_post_order(root: &Arc<ObjectProvenance>) -> Vec<Arc<ObjectProvenance>> {
    enum Frame {
        Enter(Arc<ObjectProvenance>),
        Exit(Arc<ObjectProvenance>),
    }

    let mut order = Vec::new();
    let mut done: std::collections::HashSet<*const ObjectProvenance> =
        std::collections::HashSet::new();
    let mut entered: std::collections::HashSet<*const ObjectProvenance> =
        std::collections::HashSet::new();
    let mut stack = vec![Frame::Enter(root.clone())];

    while let Some(frame) = stack.pop() {
        match frame {
            Frame::Enter(object) => {
                let ptr = Arc::as_ptr(&object);
                if entered.contains(&ptr) {
                    continue;
                }
                entered.insert(ptr);
                stack.push(Frame::Exit(object.clone()));
                let mut children = Vec::new();
                for (_, value) in &object.fields {
                    collect_child_objects(value, &mut children);
                }
                for child in children.into_iter().rev() {
                    stack.push(Frame::Enter(child));
                }
            }
            Frame::Exit(object) => {
                let ptr = Arc::as_ptr(&object);
                if done.insert(ptr) {
                    order.push(object);
                }
            }
        }
    }
    order
}

/// Object nodes directly reachable from one value, in encounter order.
/// Lists and maps may nest arbitrarily deep, so this walks with its own
/// stack as well.
fn collect_child_objects(value: &Provenance, out: &mut Vec<Arc<ObjectProvenance>>) {
    let mut work = vec![value];
    let mut ordered = Vec::new();
    while let Some(current) = work.pop() {
        match current {
            Provenance::Primitive(_) => {}
            Provenance::Object(object) => ordered.push(object.clone()),
            Provenance::List(items) => {
                for item in items.iter().rev() {
                    work.push(item);
                }
            }
            Provenance::Map(entries) => {
                for (_, item) in entries.iter().rev() {
                    work.push(item);
                }
            }
        }
    }
    out.extend(ordered);
}

/// Synthetic name for the next occurrence of a type:
/// `<lowercased-type>-<index>` with a per-type counter.
pub(crate) fn synthetic_name(
    impl_type: &str,
    counters: &mut HashMap<String, usize>,
) -> String {
    let lowered = impl_type.to_lowercase();
    let counter = counters.entry(lowered.clone()).or_insert(0);
    let name = format!("{lowered}-{counter}");
    *counter += 1;
    name
}
