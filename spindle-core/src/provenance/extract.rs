//! Flat configuration extraction from provenance trees
//!
//! Turns a captured provenance tree back into re-loadable raw-record-shaped
//! data: one record per distinct nested component, dependencies first, so a
//! fresh manager can replay the list in a single linear pass and rebuild an
//! equal graph.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::raw_config::{RawPropertyRecord, RawValue};

use super::{object_post_order, synthetic_name, ObjectProvenance, Provenance};

/// Raw-record shape extracted back out of a provenance tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationData {
    pub name: String,
    pub impl_type: String,
    pub properties: IndexMap<String, RawValue>,
}

impl From<ConfigurationData> for RawPropertyRecord {
    fn from(data: ConfigurationData) -> Self {
        RawPropertyRecord {
            name: data.name,
            impl_type: data.impl_type,
            properties: data.properties,
            policy: Default::default(),
        }
    }
}

/// Extract one record per distinct component in the tree.
///
/// A node referenced from two places is emitted once and referenced twice.
/// Records come out dependencies-first; the root is the final record, so
/// reloading the list and looking up the last record's name reconstructs
/// the whole graph.
pub fn extract_configuration(root: &Arc<ObjectProvenance>) -> Vec<ConfigurationData> {
    let order = object_post_order(root);

    let mut names: HashMap<*const ObjectProvenance, String> = HashMap::new();
    let mut counters: HashMap<String, usize> = HashMap::new();
    for object in &order {
        names.insert(
            Arc::as_ptr(object),
            synthetic_name(&object.impl_type, &mut counters),
        );
    }

    order
        .iter()
        .map(|object| {
            let properties = object
                .fields
                .iter()
                .map(|(key, value)| (key.clone(), raw_from(value, &names)))
                .collect();
            ConfigurationData {
                name: names[&Arc::as_ptr(object)].clone(),
                impl_type: object.impl_type.clone(),
                properties,
            }
        })
        .collect()
}

/// Convert extracted records straight into loadable raw records.
pub fn configuration_records(data: Vec<ConfigurationData>) -> Vec<RawPropertyRecord> {
    data.into_iter().map(RawPropertyRecord::from).collect()
}

fn raw_from(value: &Provenance, names: &HashMap<*const ObjectProvenance, String>) -> RawValue {
    match value {
        Provenance::Primitive(text) => RawValue::Scalar(text.clone()),
        Provenance::Object(object) => RawValue::ComponentRef(names[&Arc::as_ptr(object)].clone()),
        Provenance::List(items) => {
            let all_objects = !items.is_empty()
                && items
                    .iter()
                    .all(|item| matches!(item, Provenance::Object(_)));
            if all_objects {
                RawValue::ComponentRefList(
                    items
                        .iter()
                        .filter_map(|item| match item {
                            Provenance::Object(object) => {
                                Some(names[&Arc::as_ptr(object)].clone())
                            }
                            _ => None,
                        })
                        .collect(),
                )
            } else {
                RawValue::List(items.iter().map(|item| raw_from(item, names)).collect())
            }
        }
        Provenance::Map(entries) => RawValue::Map(
            entries
                .iter()
                .map(|(key, item)| (key.clone(), raw_from(item, names)))
                .collect(),
        ),
    }
}
