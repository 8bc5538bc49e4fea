//! Incoming reference index.
//!
//! Reference values are stored only on their source. [`IncomingIndex`]
//! derives the reverse view lazily: the first [`ensure_complete`] for a
//! `(kind, field)` pair scans every live owner of `field` once, and from
//! then on the engine keeps the map current by reporting each added or
//! removed edge synchronously.
//!
//! The index records, per `(target, field)`, which sources hold the target
//! and how many times. Positions inside sequences are read from the source
//! at query time, so inserting or removing earlier elements never leaves a
//! stale position behind.
//!
//! [`ensure_complete`]: IncomingIndex::ensure_complete

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use lexgraph_core::{Entity, EntityId, FieldId, KindId, Schema};
use lexgraph_store::EntityStore;

use crate::error::IntegrityError;

/// One reference edge, as seen from its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RefEdge {
    pub source: EntityId,
    pub field: FieldId,
    /// Index within a sequence field; `None` for atomic and collection fields.
    pub position: Option<usize>,
    pub target: EntityId,
}

/// Sources holding a target through one field, with multiplicity.
type Holders = SmallVec<[(EntityId, u32); 2]>;

/// Disagreement between the maintained index and a fresh scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMismatch {
    pub target: EntityId,
    pub field: FieldId,
    /// Holders according to a fresh scan, sorted.
    pub expected: Vec<(EntityId, u32)>,
    /// Holders according to the index, sorted.
    pub actual: Vec<(EntityId, u32)>,
}

/// Lazily completed map from target to incoming edges.
#[derive(Debug, Clone, Default)]
pub struct IncomingIndex {
    completed: HashSet<(KindId, FieldId)>,
    scanned: HashSet<FieldId>,
    incoming: HashMap<(EntityId, FieldId), Holders>,
}

impl IncomingIndex {
    pub fn new() -> Self {
        Self::default()
    }

    // -----------------------------------------------------------------------
    // Completion
    // -----------------------------------------------------------------------

    /// Makes [`edges_to`](Self::edges_to) answerable for targets of `kind`
    /// (and kinds derived from it) through `field`.
    ///
    /// The scan runs once per field; completing another kind for an already
    /// scanned field only records the pair.
    pub fn ensure_complete(
        &mut self,
        store: &dyn EntityStore,
        kind: KindId,
        field: FieldId,
    ) -> Result<(), IntegrityError> {
        let schema = store.schema();
        schema.require_kind(kind)?;
        let def = schema.require_field(field)?;
        if !def.is_reference() {
            return Err(IntegrityError::FieldRole {
                field,
                expected: "reference",
            });
        }
        if self.completed.contains(&(kind, field)) {
            return Ok(());
        }
        if self.scanned.insert(field) {
            let mut edges = 0usize;
            for source in store.all_instances_of(def.owner) {
                let entity = store.get(source)?;
                for target in entity.targets(field)? {
                    self.bump(target, field, source);
                    edges += 1;
                }
            }
            tracing::debug!(field = %field, name = %def.name, edges, "incoming index scanned field");
        }
        self.completed.insert((kind, field));
        Ok(())
    }

    /// Completes every reference field able to hold an instance of `kind`.
    pub fn ensure_complete_for(
        &mut self,
        store: &dyn EntityStore,
        kind: KindId,
    ) -> Result<(), IntegrityError> {
        for field in store.schema().reference_fields_targeting(kind) {
            self.ensure_complete(store, kind, field)?;
        }
        Ok(())
    }

    /// Returns `true` if `field` was completed for `kind` or one of its bases.
    pub fn is_complete(&self, schema: &Schema, kind: KindId, field: FieldId) -> bool {
        schema
            .ancestors(kind)
            .into_iter()
            .any(|k| self.completed.contains(&(k, field)))
    }

    /// Drops all completion state and edges.
    pub fn invalidate(&mut self) {
        self.completed.clear();
        self.scanned.clear();
        self.incoming.clear();
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Edges pointing at `target` through `field`, in no particular order.
    ///
    /// Returns [`IntegrityError::IndexNotReady`] unless the index was
    /// completed for the target's kind and `field`.
    pub fn edges_to(
        &self,
        store: &dyn EntityStore,
        target: EntityId,
        field: FieldId,
    ) -> Result<Vec<RefEdge>, IntegrityError> {
        let kind = store.get(target)?.kind();
        if !self.is_complete(store.schema(), kind, field) {
            return Err(IntegrityError::IndexNotReady { kind, field });
        }
        let mut edges = Vec::new();
        let Some(holders) = self.incoming.get(&(target, field)) else {
            return Ok(edges);
        };
        for &(source, _) in holders {
            let value = store.get(source)?.value(field)?;
            edges.extend(value.positions_of(target).into_iter().map(|position| RefEdge {
                source,
                field,
                position,
                target,
            }));
        }
        Ok(edges)
    }

    /// Like [`edges_to`](Self::edges_to), ordered by a caller comparator.
    pub fn edges_to_sorted_by<F>(
        &self,
        store: &dyn EntityStore,
        target: EntityId,
        field: FieldId,
        compare: F,
    ) -> Result<Vec<RefEdge>, IntegrityError>
    where
        F: FnMut(&RefEdge, &RefEdge) -> Ordering,
    {
        let mut edges = self.edges_to(store, target, field)?;
        edges.sort_by(compare);
        Ok(edges)
    }

    /// Edges pointing at `target` through every reference field able to hold
    /// it. Every such field must be complete.
    pub fn all_edges_to(
        &self,
        store: &dyn EntityStore,
        target: EntityId,
    ) -> Result<Vec<RefEdge>, IntegrityError> {
        let kind = store.get(target)?.kind();
        let mut edges = Vec::new();
        for field in store.schema().reference_fields_targeting(kind) {
            edges.extend(self.edges_to(store, target, field)?);
        }
        Ok(edges)
    }

    // -----------------------------------------------------------------------
    // Incremental maintenance
    // -----------------------------------------------------------------------

    /// Records one new occurrence of `target` in `source.field`.
    ///
    /// Ignored for fields that were never scanned; their first scan will
    /// pick the edge up.
    pub fn note_added(&mut self, source: EntityId, field: FieldId, target: EntityId) {
        if self.scanned.contains(&field) {
            self.bump(target, field, source);
        }
    }

    /// Records the removal of one occurrence of `target` from `source.field`.
    pub fn note_removed(&mut self, source: EntityId, field: FieldId, target: EntityId) {
        if !self.scanned.contains(&field) {
            return;
        }
        let Some(holders) = self.incoming.get_mut(&(target, field)) else {
            return;
        };
        if let Some(i) = holders.iter().position(|&(s, _)| s == source) {
            holders[i].1 -= 1;
            if holders[i].1 == 0 {
                holders.remove(i);
            }
        }
        if holders.is_empty() {
            self.incoming.remove(&(target, field));
        }
    }

    /// Removes every outgoing edge of a deleted entity.
    pub fn forget_source(&mut self, schema: &Schema, entity: &Entity) {
        for (field, value) in entity.fields() {
            if !schema.field(field).is_some_and(|def| def.is_reference()) {
                continue;
            }
            for target in value.targets() {
                self.note_removed(entity.id(), field, target);
            }
        }
    }

    /// Removes every incoming edge of a deleted entity. Only the reference
    /// fields that can target its kind are looked up.
    pub fn forget_target(&mut self, schema: &Schema, entity: &Entity) {
        for field in schema.reference_fields_targeting(entity.kind()) {
            self.incoming.remove(&(entity.id(), field));
        }
    }

    fn bump(&mut self, target: EntityId, field: FieldId, source: EntityId) {
        let holders = self.incoming.entry((target, field)).or_default();
        match holders.iter_mut().find(|(s, _)| *s == source) {
            Some((_, count)) => *count += 1,
            None => holders.push((source, 1)),
        }
    }

    // -----------------------------------------------------------------------
    // Verification
    // -----------------------------------------------------------------------

    /// Compares every scanned field against a fresh scan of the store.
    pub fn verify(&self, store: &dyn EntityStore) -> Result<Vec<IndexMismatch>, IntegrityError> {
        let schema = store.schema();
        let mut fresh: HashMap<(EntityId, FieldId), Vec<(EntityId, u32)>> = HashMap::new();
        for &field in &self.scanned {
            let def = schema.require_field(field)?;
            for source in store.all_instances_of(def.owner) {
                let value = store.get(source)?.value(field)?;
                for target in value.targets() {
                    let holders = fresh.entry((target, field)).or_default();
                    match holders.iter_mut().find(|(s, _)| *s == source) {
                        Some((_, count)) => *count += 1,
                        None => holders.push((source, 1)),
                    }
                }
            }
        }

        let keys: HashSet<(EntityId, FieldId)> = fresh
            .keys()
            .chain(self.incoming.keys())
            .copied()
            .collect();
        let mut mismatches: Vec<IndexMismatch> = keys
            .into_iter()
            .filter_map(|(target, field)| {
                let mut expected = fresh.get(&(target, field)).cloned().unwrap_or_default();
                let mut actual: Vec<(EntityId, u32)> = self
                    .incoming
                    .get(&(target, field))
                    .map(|h| h.to_vec())
                    .unwrap_or_default();
                expected.sort_unstable();
                actual.sort_unstable();
                (expected != actual).then_some(IndexMismatch {
                    target,
                    field,
                    expected,
                    actual,
                })
            })
            .collect();
        mismatches.sort_by_key(|m| (m.target, m.field));
        Ok(mismatches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lexgraph_core::{Cardinality, FieldSpec};
    use lexgraph_store::InMemoryStore;

    struct Fixture {
        store: InMemoryStore,
        object: KindId,
        entry: KindId,
        sense: KindId,
        components: FieldId,
        see_also: FieldId,
        title: FieldId,
    }

    fn fixture() -> Fixture {
        let mut schema = Schema::new();
        let object = schema.add_kind("CmObject", None).unwrap();
        let entry = schema.add_kind("LexEntry", Some(object)).unwrap();
        let sense = schema.add_kind("LexSense", Some(object)).unwrap();
        let title = schema.add_field(FieldSpec::text(entry, "Title")).unwrap();
        let components = schema
            .add_field(FieldSpec::reference(entry, "Components", Cardinality::Sequence, object))
            .unwrap();
        let see_also = schema
            .add_field(FieldSpec::reference(sense, "SeeAlso", Cardinality::Collection, entry))
            .unwrap();
        Fixture {
            store: InMemoryStore::new(schema),
            object,
            entry,
            sense,
            components,
            see_also,
            title,
        }
    }

    fn push(store: &mut InMemoryStore, source: EntityId, field: FieldId, target: EntityId) {
        let entity = store.get_mut(source).unwrap();
        let len = entity.sequence(field).unwrap().len();
        entity.insert_at(field, len, target).unwrap();
    }

    #[test]
    fn query_before_completion_is_a_defect() {
        let mut f = fixture();
        let a = f.store.insert_entity(f.entry).unwrap();
        let index = IncomingIndex::new();
        let err = index.edges_to(&f.store, a, f.components).unwrap_err();
        assert!(matches!(
            err,
            IntegrityError::IndexNotReady { kind, field } if kind == f.entry && field == f.components
        ));
    }

    #[test]
    fn non_reference_field_cannot_be_completed() {
        let f = fixture();
        let mut index = IncomingIndex::new();
        assert!(matches!(
            index.ensure_complete(&f.store, f.entry, f.title),
            Err(IntegrityError::FieldRole { .. })
        ));
    }

    #[test]
    fn scan_reports_every_sequence_position() {
        let mut f = fixture();
        let a = f.store.insert_entity(f.entry).unwrap();
        let b = f.store.insert_entity(f.entry).unwrap();
        let c = f.store.insert_entity(f.entry).unwrap();
        push(&mut f.store, a, f.components, c);
        push(&mut f.store, a, f.components, b);
        push(&mut f.store, a, f.components, c);

        let mut index = IncomingIndex::new();
        index.ensure_complete(&f.store, f.entry, f.components).unwrap();
        let edges = index.edges_to(&f.store, c, f.components).unwrap();
        let positions: Vec<Option<usize>> = edges.iter().map(|e| e.position).collect();
        assert_eq!(positions, vec![Some(0), Some(2)]);
        assert!(edges.iter().all(|e| e.source == a && e.target == c));
    }

    #[test]
    fn completion_for_base_kind_covers_derived_targets() {
        let mut f = fixture();
        let a = f.store.insert_entity(f.entry).unwrap();
        let s = f.store.insert_entity(f.sense).unwrap();
        push(&mut f.store, a, f.components, s);

        let mut index = IncomingIndex::new();
        index.ensure_complete(&f.store, f.object, f.components).unwrap();
        assert!(index.is_complete(f.store.schema(), f.sense, f.components));
        assert_eq!(index.edges_to(&f.store, s, f.components).unwrap().len(), 1);
    }

    #[test]
    fn positions_follow_later_edits() {
        let mut f = fixture();
        let a = f.store.insert_entity(f.entry).unwrap();
        let b = f.store.insert_entity(f.entry).unwrap();
        let c = f.store.insert_entity(f.entry).unwrap();
        push(&mut f.store, a, f.components, c);

        let mut index = IncomingIndex::new();
        index.ensure_complete(&f.store, f.entry, f.components).unwrap();

        f.store.get_mut(a).unwrap().insert_at(f.components, 0, b).unwrap();
        index.note_added(a, f.components, b);

        let edges = index.edges_to(&f.store, c, f.components).unwrap();
        assert_eq!(edges[0].position, Some(1));
        assert!(index.verify(&f.store).unwrap().is_empty());
    }

    #[test]
    fn incremental_removal_matches_fresh_scan() {
        let mut f = fixture();
        let a = f.store.insert_entity(f.entry).unwrap();
        let s = f.store.insert_entity(f.sense).unwrap();
        f.store.get_mut(s).unwrap().add_member(f.see_also, a).unwrap();

        let mut index = IncomingIndex::new();
        index.ensure_complete_for(&f.store, f.entry).unwrap();
        assert_eq!(index.all_edges_to(&f.store, a).unwrap().len(), 1);

        f.store.get_mut(s).unwrap().remove_member(f.see_also, a).unwrap();
        index.note_removed(s, f.see_also, a);
        assert!(index.all_edges_to(&f.store, a).unwrap().is_empty());
        assert!(index.verify(&f.store).unwrap().is_empty());
    }

    #[test]
    fn forgetting_a_target_leaves_other_targets_alone() {
        let mut f = fixture();
        let a = f.store.insert_entity(f.entry).unwrap();
        let b = f.store.insert_entity(f.entry).unwrap();
        let c = f.store.insert_entity(f.entry).unwrap();
        let s = f.store.insert_entity(f.sense).unwrap();
        push(&mut f.store, a, f.components, b);
        push(&mut f.store, a, f.components, c);
        f.store.get_mut(s).unwrap().add_member(f.see_also, b).unwrap();

        let mut index = IncomingIndex::new();
        index.ensure_complete_for(&f.store, f.entry).unwrap();
        assert_eq!(index.all_edges_to(&f.store, b).unwrap().len(), 2);

        let removed = f.store.remove_entity(b).unwrap();
        index.forget_target(f.store.schema(), &removed);
        assert!(!index.incoming.keys().any(|&(t, _)| t == b));
        assert_eq!(index.all_edges_to(&f.store, c).unwrap().len(), 1);
    }

    #[test]
    fn verify_detects_unreported_edit() {
        let mut f = fixture();
        let a = f.store.insert_entity(f.entry).unwrap();
        let b = f.store.insert_entity(f.entry).unwrap();
        let mut index = IncomingIndex::new();
        index.ensure_complete(&f.store, f.entry, f.components).unwrap();

        push(&mut f.store, a, f.components, b);
        let mismatches = index.verify(&f.store).unwrap();
        assert_eq!(
            mismatches,
            vec![IndexMismatch {
                target: b,
                field: f.components,
                expected: vec![(a, 1)],
                actual: vec![],
            }]
        );
    }

    #[test]
    fn sorted_query_uses_caller_order() {
        let mut f = fixture();
        let a = f.store.insert_entity(f.entry).unwrap();
        let b = f.store.insert_entity(f.entry).unwrap();
        let c = f.store.insert_entity(f.entry).unwrap();
        push(&mut f.store, a, f.components, c);
        push(&mut f.store, b, f.components, c);

        let mut index = IncomingIndex::new();
        index.ensure_complete(&f.store, f.entry, f.components).unwrap();
        let edges = index
            .edges_to_sorted_by(&f.store, c, f.components, |x, y| y.source.cmp(&x.source))
            .unwrap();
        let sources: Vec<EntityId> = edges.iter().map(|e| e.source).collect();
        assert_eq!(sources, vec![b, a]);
    }

    #[test]
    fn forgetting_a_deleted_source_drops_its_edges() {
        let mut f = fixture();
        let a = f.store.insert_entity(f.entry).unwrap();
        let b = f.store.insert_entity(f.entry).unwrap();
        push(&mut f.store, a, f.components, b);
        let mut index = IncomingIndex::new();
        index.ensure_complete(&f.store, f.entry, f.components).unwrap();

        let removed = f.store.remove_entity(a).unwrap();
        index.forget_source(f.store.schema(), &removed);
        assert!(index.edges_to(&f.store, b, f.components).unwrap().is_empty());
    }
}
