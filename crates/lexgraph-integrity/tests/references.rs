//! Incoming reference index, reference validation, replace and the
//! deletion cascade.

mod common;

use common::Lexicon;
use lexgraph_store::EntityStore;
use lexgraph_integrity::{
    DerivedProperty, DerivedValue, ErrorKind, IncomingIndex, IntegrityError, RefEdge, UndoAction,
};

// ---------------------------------------------------------------------------
// Incoming index
// ---------------------------------------------------------------------------

#[test]
fn index_is_not_ready_until_completed() {
    let mut lex = Lexicon::new();
    let a = lex.entry("a");
    let b = lex.entry("b");
    let r = lex.entry_ref(a, &[b]);
    let ids = lex.ids;

    let mut index = IncomingIndex::new();
    let err = index
        .edges_to(lex.engine.store(), b, ids.components)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IndexNotReady);

    index
        .ensure_complete(lex.engine.store(), ids.entry, ids.components)
        .unwrap();
    let edges = index.edges_to(lex.engine.store(), b, ids.components).unwrap();
    assert_eq!(
        edges,
        vec![RefEdge {
            source: r,
            field: ids.components,
            position: Some(0),
            target: b,
        }]
    );
}

#[test]
fn engine_completes_the_index_on_first_query() {
    let mut lex = Lexicon::new();
    let a = lex.entry("a");
    let b = lex.entry("b");
    let r = lex.entry_ref(a, &[b, b]);
    let ids = lex.ids;

    let schema = lex.engine.store().schema().clone();
    assert!(!lex.engine.index().is_complete(&schema, ids.entry, ids.components));

    let mut edges = lex.engine.edges_to(b, ids.components).unwrap();
    edges.sort_by_key(|e| e.position);
    let positions: Vec<Option<usize>> = edges.iter().map(|e| e.position).collect();
    assert_eq!(positions, vec![Some(0), Some(1)]);
    assert!(edges.iter().all(|e| e.source == r));
    assert!(lex.engine.index().is_complete(&schema, ids.entry, ids.components));

    // Later edits keep the completed index in step.
    lex.engine.remove_at(r, ids.components, 0).unwrap();
    let edges = lex.engine.edges_to(b, ids.components).unwrap();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].position, Some(0));
    lex.assert_clean();
}

#[test]
fn edges_can_be_ordered_by_the_caller() {
    let mut lex = Lexicon::new();
    let target = lex.entry("target");
    let first = lex.entry("first");
    let second = lex.entry("second");
    let r2 = lex.entry_ref(second, &[target]);
    let r1 = lex.entry_ref(first, &[target]);
    let ids = lex.ids;

    let edges = lex
        .engine
        .edges_to_sorted_by(target, ids.components, |x, y| x.source.cmp(&y.source))
        .unwrap();
    let sources: Vec<_> = edges.iter().map(|e| e.source).collect();
    let mut expected = vec![r1, r2];
    expected.sort();
    assert_eq!(sources, expected);
}

#[test]
fn referrers_derived_value_lists_every_field() {
    let mut lex = Lexicon::new();
    let a = lex.entry("a");
    let b = lex.entry("b");
    let r = lex.entry_ref(a, &[b]);
    lex.engine.push(r, lex.ids.primaries, b).unwrap();

    match lex
        .engine
        .derived_value(b, DerivedProperty::Referrers)
        .unwrap()
    {
        DerivedValue::Referrers(edges) => assert_eq!(edges.len(), 2),
        other => panic!("expected referrers, got {other:?}"),
    }
    assert!(lex.engine.boundary().changed(b, DerivedProperty::Referrers));
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[test]
fn reference_to_own_owner_is_rejected() {
    let mut lex = Lexicon::new();
    let a = lex.entry("a");
    let r = lex.entry_ref(a, &[]);

    let err = lex.engine.push(r, lex.ids.components, a).unwrap_err();
    match err {
        IntegrityError::CyclicReference { path, .. } => assert_eq!(path, vec![r, a]),
        other => panic!("expected a cycle, got {other:?}"),
    }
    assert!(lex.seq(r, lex.ids.components).is_empty());
}

#[test]
fn self_reference_in_plain_field_is_rejected() {
    let mut lex = Lexicon::new();
    let a = lex.entry("a");
    let s = lex.sense(a, "gloss");
    let err = lex
        .engine
        .add_to_collection(s, lex.ids.see_also, s)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CyclicReference);
}

#[test]
fn component_cycle_is_rejected_and_graph_unchanged() {
    let mut lex = Lexicon::new();
    let a = lex.entry("a");
    let b = lex.entry("b");
    lex.entry_ref(a, &[b]);
    let rb = lex.entry_ref(b, &[]);

    let err = lex.engine.push(rb, lex.ids.components, a).unwrap_err();
    match err {
        IntegrityError::CyclicReference { path, .. } => assert_eq!(path, vec![a, b]),
        other => panic!("expected a cycle, got {other:?}"),
    }
    assert!(lex.seq(rb, lex.ids.components).is_empty());
    assert!(lex.engine.referrers(a).unwrap().is_empty());
    lex.assert_clean();
}

#[test]
fn subset_member_must_be_in_superset() {
    let mut lex = Lexicon::new();
    let a = lex.entry("a");
    let b = lex.entry("b");
    let c = lex.entry("c");
    let r = lex.entry_ref(a, &[b]);

    let err = lex.engine.push(r, lex.ids.primaries, c).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CoupledFieldViolation);
    lex.engine.push(r, lex.ids.primaries, b).unwrap();
    assert_eq!(lex.seq(r, lex.ids.primaries), vec![b]);
}

#[test]
fn wrong_target_kind_is_rejected() {
    let mut lex = Lexicon::new();
    let a = lex.entry("a");
    let s = lex.sense(a, "gloss");
    let r = lex.entry_ref(a, &[]);
    let err = lex.engine.push(r, lex.ids.components, s).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidTarget);
}

// ---------------------------------------------------------------------------
// Replace
// ---------------------------------------------------------------------------

#[test]
fn replace_keeps_positions_in_coupled_fields() {
    let mut lex = Lexicon::new();
    let a = lex.entry("a");
    let b = lex.entry("b");
    let c = lex.entry("c");
    let d = lex.entry("d");
    let r = lex.entry_ref(a, &[b, c, b]);
    lex.engine.push(r, lex.ids.primaries, b).unwrap();

    let report = lex.engine.replace_all(b, d).unwrap();
    assert_eq!(report.replaced.len(), 3);
    assert!(report.skipped.is_empty());

    assert!(lex.alive(r));
    assert_eq!(lex.seq(r, lex.ids.components), vec![d, c, d]);
    assert_eq!(lex.seq(r, lex.ids.primaries), vec![d]);
    assert!(lex.engine.referrers(b).unwrap().is_empty());
    assert_eq!(lex.engine.referrers(d).unwrap().len(), 3);
    lex.assert_clean();
}

#[test]
fn replace_with_sole_component_does_not_empty_the_owner() {
    let mut lex = Lexicon::new();
    let a = lex.entry("a");
    let b = lex.entry("b");
    let d = lex.entry("d");
    let r = lex.entry_ref(a, &[b]);

    lex.engine.replace_all(b, d).unwrap();
    assert!(lex.alive(r));
    assert_eq!(lex.seq(r, lex.ids.components), vec![d]);
}

#[test]
fn rejected_replace_leaves_graph_untouched() {
    let mut lex = Lexicon::new();
    let a = lex.entry("a");
    let b = lex.entry("b");
    let s = lex.sense(a, "gloss");
    let r = lex.entry_ref(a, &[b]);

    let err = lex.engine.replace_all(b, a).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CyclicReference);
    let err = lex.engine.replace_all(b, s).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidTarget);

    assert_eq!(lex.seq(r, lex.ids.components), vec![b]);
    lex.assert_clean();
}

#[test]
fn replace_with_itself_is_a_no_op() {
    let mut lex = Lexicon::new();
    let a = lex.entry("a");
    let b = lex.entry("b");
    let r = lex.entry_ref(a, &[b]);
    let report = lex.engine.replace_all(b, b).unwrap();
    assert!(report.replaced.is_empty());
    assert_eq!(lex.seq(r, lex.ids.components), vec![b]);
}

// ---------------------------------------------------------------------------
// Deletion cascade
// ---------------------------------------------------------------------------

#[test]
fn delete_prunes_references_and_empty_owners() {
    let mut lex = Lexicon::new();
    let a = lex.entry("a");
    let b = lex.entry("b");
    let c = lex.entry("c");
    let r = lex.entry_ref(a, &[b]);
    lex.engine.push(r, lex.ids.primaries, b).unwrap();
    let sb = lex.sense(b, "of b");
    let sc = lex.sense(c, "of c");
    lex.engine.add_to_collection(sc, lex.ids.see_also, sb).unwrap();

    lex.engine.delete(b).unwrap();

    assert!(!lex.alive(b));
    assert!(!lex.alive(sb));
    assert!(!lex.alive(r), "entry ref left without components is deleted");
    assert!(lex.seq(a, lex.ids.entry_refs).is_empty());
    assert!(lex.targets(sc, lex.ids.see_also).is_empty());
    assert!(lex.alive(a) && lex.alive(c));
    lex.assert_clean();
}

#[test]
fn removing_from_superset_prunes_subset() {
    let mut lex = Lexicon::new();
    let a = lex.entry("a");
    let b = lex.entry("b");
    let c = lex.entry("c");
    let r = lex.entry_ref(a, &[b, c]);
    lex.engine.push(r, lex.ids.primaries, b).unwrap();

    assert!(lex.engine.remove(r, lex.ids.components, b).unwrap());
    assert_eq!(lex.seq(r, lex.ids.components), vec![c]);
    assert!(lex.seq(r, lex.ids.primaries).is_empty());
    lex.assert_clean();
}

#[test]
fn deleted_entities_are_reported_for_undo() {
    let mut lex = Lexicon::new();
    let a = lex.entry("a");
    let s = lex.sense(a, "gloss");
    lex.engine.delete(a).unwrap();

    let deleted: Vec<_> = lex
        .engine
        .boundary()
        .undo_actions()
        .iter()
        .filter_map(|action| match action {
            UndoAction::Deleted { entity, .. } => Some(*entity),
            _ => None,
        })
        .collect();
    assert_eq!(deleted, vec![s, a]);
}

#[test]
fn undo_batch_inverts_in_reverse_order() {
    let mut lex = Lexicon::new();
    let a = lex.entry("a");
    let b = lex.entry("b");
    let c = lex.entry("c");
    let r = lex.entry_ref(a, &[]);
    let field = lex.ids.components;
    lex.engine.boundary_mut().take_undo("setup");

    lex.engine.push(r, field, b).unwrap();
    lex.engine.push(r, field, c).unwrap();
    let batch = lex.engine.boundary_mut().take_undo("link components");

    let UndoAction::Batch {
        actions,
        description,
    } = batch.inverse()
    else {
        panic!("batch inverts to a batch");
    };
    assert_eq!(description, "Undo: link components");
    assert_eq!(
        actions,
        vec![
            UndoAction::Removed {
                entity: r,
                field,
                position: Some(1),
                target: c,
            },
            UndoAction::Removed {
                entity: r,
                field,
                position: Some(0),
                target: b,
            },
        ]
    );
}
