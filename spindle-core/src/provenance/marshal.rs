//! Marshalling provenance graphs to flat, identity-preserving records
//!
//! Provenance is graph-shaped: the same child node may be referenced from
//! several places. The marshalled form gives every distinct object node a
//! synthetic identity and encodes child references by identity, so a shared
//! node serializes once no matter its fan-in. Unmarshalling builds the full
//! identity table before resolving any reference, which makes forward
//! references free. Both directions traverse with explicit work lists;
//! depth is limited only by available memory.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{SpindleError, SpindleResult};

use super::{object_post_order, synthetic_name, ObjectProvenance, Provenance};

/// A marshalled field value. The serde tag doubles as the field kind, so
/// the form is self-describing: no external schema is needed to unmarshal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarshalledValue {
    Primitive(String),
    List(Vec<MarshalledValue>),
    Map(IndexMap<String, MarshalledValue>),
    /// Reference to another record by identity
    ObjectRef(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarshalledField {
    pub key: String,
    pub value: MarshalledValue,
}

/// One flattened object node. Records are emitted dependencies-first; the
/// root is the final record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarshalledProvenance {
    pub identity: String,
    pub impl_type: String,
    pub fields: Vec<MarshalledField>,
}

/// Flatten a provenance graph into identity records.
pub fn marshal(root: &Arc<ObjectProvenance>) -> Vec<MarshalledProvenance> {
    let order = object_post_order(root);

    let mut identities: HashMap<*const ObjectProvenance, String> = HashMap::new();
    let mut counters: HashMap<String, usize> = HashMap::new();
    for object in &order {
        identities.insert(
            Arc::as_ptr(object),
            synthetic_name(&object.impl_type, &mut counters),
        );
    }

    order
        .iter()
        .map(|object| MarshalledProvenance {
            identity: identities[&Arc::as_ptr(object)].clone(),
            impl_type: object.impl_type.clone(),
            fields: object
                .fields
                .iter()
                .map(|(key, value)| MarshalledField {
                    key: key.clone(),
                    value: marshal_value(value, &identities),
                })
                .collect(),
        })
        .collect()
}

/// Convert one value tree without recursion.
fn marshal_value(
    value: &Provenance,
    identities: &HashMap<*const ObjectProvenance, String>,
) -> MarshalledValue {
    enum Frame<'a> {
        Visit(&'a Provenance),
        BuildList(usize),
        BuildMap(Vec<String>),
    }

    let mut work = vec![Frame::Visit(value)];
    let mut results: Vec<MarshalledValue> = Vec::new();
    while let Some(frame) = work.pop() {
        match frame {
            Frame::Visit(Provenance::Primitive(text)) => {
                results.push(MarshalledValue::Primitive(text.clone()));
            }
            Frame::Visit(Provenance::Object(object)) => {
                results.push(MarshalledValue::ObjectRef(
                    identities[&Arc::as_ptr(object)].clone(),
                ));
            }
            Frame::Visit(Provenance::List(items)) => {
                work.push(Frame::BuildList(items.len()));
                for item in items.iter().rev() {
                    work.push(Frame::Visit(item));
                }
            }
            Frame::Visit(Provenance::Map(entries)) => {
                work.push(Frame::BuildMap(entries.keys().cloned().collect()));
                for (_, item) in entries.iter().rev() {
                    work.push(Frame::Visit(item));
                }
            }
            Frame::BuildList(len) => {
                let items = results.split_off(results.len() - len);
                results.push(MarshalledValue::List(items));
            }
            Frame::BuildMap(keys) => {
                let values = results.split_off(results.len() - keys.len());
                results.push(MarshalledValue::Map(keys.into_iter().zip(values).collect()));
            }
        }
    }
    // Every Visit pushes exactly one result and every Build consumes its
    // children, so exactly one value remains.
    results.pop().expect("value conversion left one result")
}

/// Rebuild a provenance graph from identity records.
///
/// The identity table is complete before any reference resolves, so record
/// order does not matter. An unknown identity, a duplicated identity, or a
/// reference cycle among records fails with `MarshalIntegrity` rather than
/// looping.
pub fn unmarshal(records: &[MarshalledProvenance]) -> SpindleResult<Arc<ObjectProvenance>> {
    let root_identity = records
        .last()
        .map(|record| record.identity.clone())
        .ok_or_else(|| SpindleError::MarshalIntegrity {
            identity: "<empty record list>".to_string(),
        })?;

    let mut table: HashMap<&str, &MarshalledProvenance> = HashMap::new();
    for record in records {
        if table.insert(record.identity.as_str(), record).is_some() {
            return Err(SpindleError::MarshalIntegrity {
                identity: record.identity.clone(),
            });
        }
    }

    let mut resolved: HashMap<String, Arc<ObjectProvenance>> = HashMap::new();
    let mut in_progress: HashSet<String> = HashSet::new();
    let mut stack = vec![root_identity.clone()];

    while let Some(identity) = stack.last().cloned() {
        if resolved.contains_key(&identity) {
            stack.pop();
            in_progress.remove(&identity);
            continue;
        }
        let record = table
            .get(identity.as_str())
            .ok_or_else(|| SpindleError::MarshalIntegrity {
                identity: identity.clone(),
            })?;

        let missing: Vec<String> = referenced_identities(record)
            .into_iter()
            .filter(|reference| !resolved.contains_key(reference))
            .collect();

        if missing.is_empty() {
            let mut fields = Vec::with_capacity(record.fields.len());
            for field in &record.fields {
                fields.push((field.key.clone(), unmarshal_value(&field.value, &resolved)?));
            }
            resolved.insert(
                identity.clone(),
                Arc::new(ObjectProvenance {
                    impl_type: record.impl_type.clone(),
                    fields,
                }),
            );
            stack.pop();
            in_progress.remove(&identity);
        } else {
            in_progress.insert(identity.clone());
            for reference in missing {
                if in_progress.contains(&reference) {
                    // A record depending on one of its own ancestors can
                    // never resolve.
                    return Err(SpindleError::MarshalIntegrity {
                        identity: reference,
                    });
                }
                if !table.contains_key(reference.as_str()) {
                    return Err(SpindleError::MarshalIntegrity {
                        identity: reference,
                    });
                }
                stack.push(reference);
            }
        }
    }

    resolved
        .get(&root_identity)
        .cloned()
        .ok_or_else(|| SpindleError::MarshalIntegrity {
            identity: root_identity,
        })
}

/// All identities referenced anywhere in a record's fields.
fn referenced_identities(record: &MarshalledProvenance) -> Vec<String> {
    let mut references = Vec::new();
    let mut work: Vec<&MarshalledValue> = record.fields.iter().map(|f| &f.value).rev().collect();
    while let Some(value) = work.pop() {
        match value {
            MarshalledValue::Primitive(_) => {}
            MarshalledValue::ObjectRef(identity) => references.push(identity.clone()),
            MarshalledValue::List(items) => {
                for item in items.iter().rev() {
                    work.push(item);
                }
            }
            MarshalledValue::Map(entries) => {
                for (_, item) in entries.iter().rev() {
                    work.push(item);
                }
            }
        }
    }
    references
}

/// Resolve one marshalled value tree without recursion.
fn unmarshal_value(
    value: &MarshalledValue,
    resolved: &HashMap<String, Arc<ObjectProvenance>>,
) -> SpindleResult<Provenance> {
    enum Frame<'a> {
        Visit(&'a MarshalledValue),
        BuildList(usize),
        BuildMap(Vec<String>),
    }

    let mut work = vec![Frame::Visit(value)];
    let mut results: Vec<Provenance> = Vec::new();
    while let Some(frame) = work.pop() {
        match frame {
            Frame::Visit(MarshalledValue::Primitive(text)) => {
                results.push(Provenance::Primitive(text.clone()));
            }
            Frame::Visit(MarshalledValue::ObjectRef(identity)) => {
                let object =
                    resolved
                        .get(identity)
                        .ok_or_else(|| SpindleError::MarshalIntegrity {
                            identity: identity.clone(),
                        })?;
                results.push(Provenance::Object(object.clone()));
            }
            Frame::Visit(MarshalledValue::List(items)) => {
                work.push(Frame::BuildList(items.len()));
                for item in items.iter().rev() {
                    work.push(Frame::Visit(item));
                }
            }
            Frame::Visit(MarshalledValue::Map(entries)) => {
                work.push(Frame::BuildMap(entries.keys().cloned().collect()));
                for (_, item) in entries.iter().rev() {
                    work.push(Frame::Visit(item));
                }
            }
            Frame::BuildList(len) => {
                let items = results.split_off(results.len() - len);
                results.push(Provenance::List(items));
            }
            Frame::BuildMap(keys) => {
                let values = results.split_off(results.len() - keys.len());
                results.push(Provenance::Map(keys.into_iter().zip(values).collect()));
            }
        }
    }
    Ok(results.pop().expect("value conversion left one result"))
}
