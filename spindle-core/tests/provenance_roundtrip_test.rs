//! End-to-end provenance tests: capture, extraction, reload, marshalling

mod common;

use std::sync::Arc;

use pretty_assertions::assert_eq;

use common::*;
use spindle_core::manager::ConfigurationManager;
use spindle_core::provenance::extract::configuration_records;
use spindle_core::provenance::{
    extract_configuration, marshal, unmarshal, ObjectProvenance, Provenance,
};
use spindle_core::raw_config::{RawPropertyRecord, RawValue};

fn scalar(text: &str) -> RawValue {
    RawValue::Scalar(text.to_string())
}

fn reference(name: &str) -> RawValue {
    RawValue::ComponentRef(name.to_string())
}

fn reference_list(names: &[&str]) -> RawValue {
    RawValue::ComponentRefList(names.iter().map(|n| n.to_string()).collect())
}

/// Eight distinct components with fan-in: two sources, four filters (two
/// sharing one source), two mixers (one sharing a filter with the root).
fn nested_pipeline() -> Vec<RawPropertyRecord> {
    vec![
        RawPropertyRecord::new("mic", "test.Source").with_property("rate", scalar("8000")),
        RawPropertyRecord::new("line", "test.Source").with_property("rate", scalar("44100")),
        RawPropertyRecord::new("f1", "test.Filter").with_property("input", reference("mic")),
        RawPropertyRecord::new("f2", "test.Filter").with_property("input", reference("line")),
        RawPropertyRecord::new("f3", "test.Filter").with_property("input", reference("mic")),
        RawPropertyRecord::new("m1", "test.Mixer")
            .with_property("inputs", reference_list(&["f1", "f2", "f3"])),
        RawPropertyRecord::new("f4", "test.Filter").with_property("input", reference("m1")),
        RawPropertyRecord::new("root", "test.Mixer")
            .with_property("inputs", reference_list(&["f4", "f1"])),
    ]
}

/// Fourteen distinct components exercising every property kind: scalars,
/// a list, a map, references, and reference lists.
fn all_kinds_pipeline() -> Vec<RawPropertyRecord> {
    let mut records = Vec::new();
    for index in 0..4 {
        records.push(
            RawPropertyRecord::new(format!("s{index}"), "test.Source")
                .with_property("rate", scalar(&format!("{}", 8000 * (index + 1)))),
        );
    }
    for (index, source) in ["s0", "s1", "s2", "s3", "s0", "s1"].iter().enumerate() {
        records.push(
            RawPropertyRecord::new(format!("f{index}"), "test.Filter")
                .with_property("input", reference(source))
                .with_property("gain", scalar(&format!("0.{index}"))),
        );
    }
    records.push(
        RawPropertyRecord::new("m0", "test.Mixer")
            .with_property("inputs", reference_list(&["f0", "f1"]))
            .with_property(
                "labels",
                RawValue::List(vec![scalar("left"), scalar("right")]),
            ),
    );
    records.push(
        RawPropertyRecord::new("m1", "test.Mixer")
            .with_property("inputs", reference_list(&["f2", "f3"]))
            .with_property(
                "bands",
                RawValue::Map(
                    vec![
                        ("low".to_string(), scalar("80")),
                        ("high".to_string(), scalar("12000")),
                    ]
                    .into_iter()
                    .collect(),
                ),
            ),
    );
    records.push(
        RawPropertyRecord::new("m2", "test.Mixer")
            .with_property("inputs", reference_list(&["f4", "f5"])),
    );
    records.push(
        RawPropertyRecord::new("root", "test.Mixer")
            .with_property("inputs", reference_list(&["m0", "m1", "m2"]))
            .with_property("labels", RawValue::List(vec![scalar("master")]))
            .with_property(
                "bands",
                RawValue::Map(
                    vec![("mid".to_string(), scalar("2500"))].into_iter().collect(),
                ),
            ),
    );
    records
}

#[test]
fn capture_reflects_resolved_values_not_the_raw_record() {
    let manager = ConfigurationManager::new(pipeline_registry());
    manager
        .add_configuration(vec![RawPropertyRecord::new("mic", "test.Source")])
        .unwrap();

    let provenance = manager.capture_provenance("mic").unwrap();
    assert_eq!(provenance.impl_type, "test.Source");
    // Declared defaults were applied during resolution and show up here.
    assert_eq!(
        provenance.field("rate"),
        Some(&Provenance::Primitive("16000".into()))
    );
    assert_eq!(
        provenance.field("channels"),
        Some(&Provenance::Primitive("1".into()))
    );

    // Determinism: capturing the same live object twice yields identical trees.
    let again = manager.capture_provenance("mic").unwrap();
    assert_eq!(provenance, again);
}

#[test]
fn nested_pipeline_extracts_exactly_eight_records_and_reloads_equal() {
    let manager = ConfigurationManager::new(pipeline_registry());
    manager.add_configuration(nested_pipeline()).unwrap();

    let provenance = manager.capture_provenance("root").unwrap();
    let extracted = extract_configuration(&provenance);
    assert_eq!(extracted.len(), 8);

    // Dependencies come before dependents, so a fresh manager can replay
    // the list linearly and look up the synthesized root name.
    let root_name = extracted.last().unwrap().name.clone();
    let fresh = ConfigurationManager::new(pipeline_registry());
    fresh
        .add_configuration(configuration_records(extracted))
        .unwrap();
    fresh.lookup(&root_name).unwrap();

    let reloaded = fresh.capture_provenance(&root_name).unwrap();
    assert_eq!(reloaded, provenance);
}

#[test]
fn all_property_kinds_extract_exactly_fourteen_records_and_reload_equal() {
    let manager = ConfigurationManager::new(pipeline_registry());
    manager.add_configuration(all_kinds_pipeline()).unwrap();

    let provenance = manager.capture_provenance("root").unwrap();
    let extracted = extract_configuration(&provenance);
    assert_eq!(extracted.len(), 14);

    let root_name = extracted.last().unwrap().name.clone();
    let fresh = ConfigurationManager::new(pipeline_registry());
    fresh
        .add_configuration(configuration_records(extracted))
        .unwrap();

    let reloaded = fresh.capture_provenance(&root_name).unwrap();
    assert_eq!(reloaded, provenance);
}

#[test]
fn shared_instances_extract_once_and_reload_shared() {
    let manager = ConfigurationManager::new(pipeline_registry());
    manager.add_configuration(nested_pipeline()).unwrap();

    let provenance = manager.capture_provenance("root").unwrap();
    let extracted = extract_configuration(&provenance);

    // "mic" feeds f1 and f3 but is emitted once.
    let source_records: Vec<_> = extracted
        .iter()
        .filter(|record| record.impl_type == "test.Source")
        .collect();
    assert_eq!(source_records.len(), 2);

    let root_name = extracted.last().unwrap().name.clone();
    let fresh = ConfigurationManager::new(pipeline_registry());
    fresh
        .add_configuration(configuration_records(extracted))
        .unwrap();
    fresh.lookup(&root_name).unwrap();

    // The reloaded graph shares nodes the same way the original did. The
    // root's second input is f1, which also feeds the inner mixer through
    // f4 -> m1; both paths must land on the very same node.
    let reloaded = fresh.capture_provenance(&root_name).unwrap();
    let inputs = match reloaded.field("inputs") {
        Some(Provenance::List(items)) => items.clone(),
        other => panic!("unexpected inputs field: {other:?}"),
    };
    let (f4, f1_direct) = match (&inputs[0], &inputs[1]) {
        (Provenance::Object(a), Provenance::Object(b)) => (a.clone(), b.clone()),
        other => panic!("unexpected input shapes: {other:?}"),
    };
    let m1 = match f4.field("input") {
        Some(Provenance::Object(object)) => object.clone(),
        other => panic!("unexpected f4 input: {other:?}"),
    };
    let f1_via_mixer = match m1.field("inputs") {
        Some(Provenance::List(items)) => match &items[0] {
            Provenance::Object(object) => object.clone(),
            other => panic!("unexpected mixer input: {other:?}"),
        },
        other => panic!("unexpected mixer inputs: {other:?}"),
    };
    assert!(Arc::ptr_eq(&f1_direct, &f1_via_mixer));
}

/// Depth-limited generator: a list tree of the given depth and branch
/// factor 3 where all three branches share one child value.
fn shared_list_tree(depth: usize) -> Provenance {
    if depth == 0 {
        return Provenance::Primitive("leaf".to_string());
    }
    let child = shared_list_tree(depth - 1);
    Provenance::List(vec![child.clone(), child.clone(), child])
}

#[test]
fn generated_tree_marshals_to_a_single_record_and_round_trips() {
    let root = Arc::new(ObjectProvenance::new(
        "test.Generated",
        vec![("payload".to_string(), shared_list_tree(5))],
    ));

    let records = marshal(&root);
    // No nested object nodes anywhere: the whole depth-5 branch-3 tree
    // collapses into the root's own record.
    assert_eq!(records.len(), 1);

    let back = unmarshal(&records).unwrap();
    assert_eq!(back, root);
}

#[test]
fn object_fan_in_marshals_each_shared_node_once() {
    let leaf = Arc::new(ObjectProvenance::new(
        "test.Leaf",
        vec![("id".to_string(), Provenance::Primitive("shared".into()))],
    ));

    fn tree(depth: usize, leaf: &Arc<ObjectProvenance>) -> Provenance {
        if depth == 0 {
            return Provenance::Object(leaf.clone());
        }
        let child = tree(depth - 1, leaf);
        Provenance::List(vec![child.clone(), child.clone(), child])
    }

    let root = Arc::new(ObjectProvenance::new(
        "test.Generated",
        vec![("payload".to_string(), tree(5, &leaf))],
    ));

    // 3^5 references to the leaf, but exactly two records: no growth with
    // fan-in.
    let records = marshal(&root);
    assert_eq!(records.len(), 2);

    let back = unmarshal(&records).unwrap();
    assert_eq!(back, root);
}

#[test]
fn captured_graph_survives_marshalling() {
    let manager = ConfigurationManager::new(pipeline_registry());
    manager.add_configuration(nested_pipeline()).unwrap();
    let provenance = manager.capture_provenance("root").unwrap();

    let records = marshal(&provenance);
    assert_eq!(records.len(), 8);

    // Self-describing: a JSON hop needs no external schema.
    let json = serde_json::to_string(&records).unwrap();
    let parsed: Vec<spindle_core::MarshalledProvenance> = serde_json::from_str(&json).unwrap();
    let back = unmarshal(&parsed).unwrap();
    assert_eq!(back, provenance);
}
