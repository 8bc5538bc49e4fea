//! Merging two equivalent entities.
//!
//! `merge(primary, secondary)` folds `secondary` into `primary` and deletes
//! it:
//!
//! 1. Reference edges linking the two sides that would turn into
//!    self references (or component cycles) are dropped.
//! 2. Scalar fields and outgoing references are merged into the primary,
//!    owned sub-objects are moved over or, when the host's
//!    [`SubKeyFunction`] says two of them are the same thing, merged
//!    recursively.
//! 3. Every remaining reference to the secondary (and to sub-objects merged
//!    away) is redirected with [`IntegrityEngine::replace_all`].
//! 4. The secondary is deleted and its former homograph group renumbered.
//! 5. The primary's homograph group is renumbered exactly once, starting
//!    from the key captured before anything moved. When the merge moves the
//!    primary into the secondary's group, that group is left to this step.
//!
//! Cycle and kind checks run before step 1; a rejected merge leaves the
//! graph untouched.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use lexgraph_core::{Cardinality, EntityId, FieldDef, FieldRole};
use lexgraph_store::EntityStore;

use crate::backref::RefEdge;
use crate::cycle::{ComponentGraph, Redirect};
use crate::engine::IntegrityEngine;
use crate::error::IntegrityError;
use crate::replace::rank;
use crate::txn::TransactionBoundary;

/// Host callback naming the identity of an owned sub-object (for example
/// the gloss of a sense). Sub-objects of the same kind with equal sub-keys
/// are merged; `None` never matches.
pub trait SubKeyFunction {
    fn sub_key(&self, store: &dyn EntityStore, entity: EntityId) -> Option<String>;
}

impl<F> SubKeyFunction for F
where
    F: Fn(&dyn EntityStore, EntityId) -> Option<String>,
{
    fn sub_key(&self, store: &dyn EntityStore, entity: EntityId) -> Option<String> {
        self(store, entity)
    }
}

/// Outcome of [`IntegrityEngine::merge`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    /// Edges removed because they would have become self referential.
    pub dropped: Vec<RefEdge>,
    /// Sub-objects moved from the secondary to the primary.
    pub moved: Vec<EntityId>,
    /// `(absorbed, survivor)` pairs, the top-level pair first.
    pub merged: Vec<(EntityId, EntityId)>,
    /// Sub-objects with no place on the primary, deleted with the secondary.
    pub discarded: Vec<EntityId>,
    /// Number of references redirected to survivors.
    pub replaced: usize,
}

impl<S: EntityStore, B: TransactionBoundary> IntegrityEngine<S, B> {
    /// Absorbs `secondary` into `primary` and deletes it.
    pub fn merge(
        &mut self,
        primary: EntityId,
        secondary: EntityId,
    ) -> Result<MergeReport, IntegrityError> {
        let mut report = MergeReport::default();
        if primary == secondary {
            return Ok(report);
        }
        for entity in [primary, secondary] {
            if self.deleting.contains(&entity) {
                return Err(IntegrityError::ConcurrentStructuralChange { entity });
            }
        }
        let primary_kind = self.store.get(primary)?.kind();
        let secondary_kind = self.store.get(secondary)?.kind();
        if primary_kind != secondary_kind {
            return Err(IntegrityError::IncompatibleMerge {
                primary,
                secondary,
                primary_kind,
                secondary_kind,
            });
        }
        for (inner, outer) in [(primary, secondary), (secondary, primary)] {
            if self.store.is_owned_by(inner, outer)? {
                return Err(IntegrityError::CyclicReference {
                    referrer: primary,
                    target: secondary,
                    path: vec![inner, outer],
                });
            }
        }
        let redirect = Redirect::for_merge(&self.store, primary, secondary)?;
        let graph = ComponentGraph::explore(&self.store, redirect.into_node, Some(&redirect))?;
        if let Some(path) = graph.cycle_through(redirect.into_node) {
            return Err(IntegrityError::CyclicReference {
                referrer: primary,
                target: secondary,
                path,
            });
        }

        let _span = tracing::debug_span!("merge", %primary, %secondary).entered();

        let primary_scope = self.homograph_scope(primary)?;
        let secondary_scope = self.homograph_scope(secondary)?;
        let primary_key = primary_scope.and_then(|s| self.capture_key(s));
        let secondary_key = match secondary_scope {
            Some(s) if Some(s) != primary_scope => self.capture_key(s),
            _ => None,
        };
        let deferred: Vec<EntityId> = [primary_scope, secondary_scope]
            .into_iter()
            .flatten()
            .filter(|&s| self.deferred.insert(s))
            .collect();

        let result = self.merge_deferred(primary, secondary, &redirect, &mut report);
        for scope in deferred {
            self.deferred.remove(&scope);
        }
        result?;

        // The primary's settle below covers the group it left and the one it
        // entered; the secondary's group is planned here only if it is neither.
        let primary_now = primary_key
            .as_ref()
            .filter(|(scope, _)| self.store.contains(*scope))
            .map(|(scope, _)| self.homographs.key_of(&self.store, *scope));
        if let Some((scope, key)) = secondary_key {
            let same_group = primary_key.as_ref().is_some_and(|(_, k)| *k == key)
                || primary_now.as_ref() == Some(&key);
            if !same_group {
                if self.store.contains(scope) {
                    self.settle_key(Some((scope, key)))?;
                } else {
                    let plan = self
                        .homographs
                        .plan_group(&self.store, &key, &self.deleting, None);
                    self.apply_numbers(plan)?;
                }
            }
        }
        self.settle_key(primary_key)?;

        tracing::debug!(
            dropped = report.dropped.len(),
            moved = report.moved.len(),
            replaced = report.replaced,
            "merged"
        );
        Ok(report)
    }

    fn merge_deferred(
        &mut self,
        primary: EntityId,
        secondary: EntityId,
        redirect: &Redirect,
        report: &mut MergeReport,
    ) -> Result<(), IntegrityError> {
        self.drop_crossing_edges(redirect, report)?;

        report.merged.push((secondary, primary));
        self.merge_into(primary, secondary, report)?;

        for (absorbed, survivor) in report.merged.clone() {
            if self.store.contains(absorbed) && self.store.contains(survivor) {
                self.drop_cyclic_edges(absorbed, survivor, report)?;
                report.replaced += self.replace_all(absorbed, survivor)?.replaced.len();
            }
        }

        self.delete(secondary)
    }

    /// Step 1: removes edges between the two sides that the merge would
    /// turn into self references.
    fn drop_crossing_edges(
        &mut self,
        redirect: &Redirect,
        report: &mut MergeReport,
    ) -> Result<(), IntegrityError> {
        let mut targets: Vec<EntityId> = redirect
            .absorbed
            .iter()
            .chain(&redirect.primary_subtree)
            .chain(&redirect.upper)
            .copied()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        targets.sort_unstable();

        for target in targets {
            if !self.store.contains(target) {
                continue;
            }
            let kind = self.store.get(target)?.kind();
            self.index.ensure_complete_for(&self.store, kind)?;
            let mut doomed: Vec<RefEdge> = Vec::new();
            for edge in self.index.all_edges_to(&self.store, target)? {
                let def = self.field_def(edge.field)?;
                if redirect.drops(edge.source, &def, target)
                    && !doomed
                        .iter()
                        .any(|d| d.source == edge.source && d.field == edge.field)
                {
                    doomed.push(edge);
                }
            }
            for edge in doomed {
                let def = self.field_def(edge.field)?;
                let count = self.remove_all_from(edge.source, &def, target)?;
                tracing::trace!(source = %edge.source, %target, count, "dropped crossing reference");
                report.dropped.push(edge);
            }
        }
        Ok(())
    }

    /// Removes references to `absorbed` that would point at their own
    /// source or one of its owners once redirected to `survivor`. Sub-objects
    /// moved under the survivor in step 2 can hold such references.
    fn drop_cyclic_edges(
        &mut self,
        absorbed: EntityId,
        survivor: EntityId,
        report: &mut MergeReport,
    ) -> Result<(), IntegrityError> {
        let kind = self.store.get(absorbed)?.kind();
        self.index.ensure_complete_for(&self.store, kind)?;
        for edge in self.index.all_edges_to(&self.store, absorbed)? {
            if self.deleting.contains(&edge.source) {
                continue;
            }
            let def = self.field_def(edge.field)?;
            if let Err(IntegrityError::CyclicReference { .. }) =
                self.check_target(edge.source, &def, survivor)
            {
                if self.remove_all_from(edge.source, &def, absorbed)? > 0 {
                    report.dropped.push(edge);
                }
            }
        }
        Ok(())
    }

    /// Step 2: folds the fields and owned sub-objects of `secondary` into
    /// `primary`.
    fn merge_into(
        &mut self,
        primary: EntityId,
        secondary: EntityId,
        report: &mut MergeReport,
    ) -> Result<(), IntegrityError> {
        let kind = self.store.get(primary)?.kind();
        let mut fields: Vec<FieldDef> = self
            .store
            .schema()
            .fields_of(kind)
            .into_iter()
            .cloned()
            .collect();
        fields.sort_by_key(|def| (def.role != FieldRole::Reference, rank(def)));

        for def in &fields {
            if !self.store.contains(secondary) {
                break;
            }
            match def.role {
                FieldRole::Text => self.merge_text(primary, secondary, def)?,
                // Integers keep the primary's value.
                FieldRole::Integer => {}
                FieldRole::Reference => self.merge_references(primary, secondary, def)?,
                FieldRole::Owning => self.merge_owned(primary, secondary, def, report)?,
            }
        }
        Ok(())
    }

    fn merge_text(
        &mut self,
        primary: EntityId,
        secondary: EntityId,
        def: &FieldDef,
    ) -> Result<(), IntegrityError> {
        let theirs = self.store.get(secondary)?.text(def.id)?.to_string();
        if theirs.is_empty() {
            return Ok(());
        }
        let ours = self.store.get(primary)?.text(def.id)?.to_string();
        let merged = if ours.is_empty() {
            theirs
        } else if ours != theirs && self.config.lose_no_text_on_merge {
            format!("{}{}{}", ours, self.config.merge_text_separator, theirs)
        } else {
            return Ok(());
        };
        self.set_text(primary, def.id, merged)?;
        Ok(())
    }

    /// Unions the secondary's outgoing references into the primary.
    fn merge_references(
        &mut self,
        primary: EntityId,
        secondary: EntityId,
        def: &FieldDef,
    ) -> Result<(), IntegrityError> {
        let theirs = self.store.get(secondary)?.targets(def.id)?;
        for target in theirs {
            if target == primary || target == secondary || !self.store.contains(target) {
                continue;
            }
            let ours = self.store.get(primary)?.value(def.id)?;
            let skip = match def.cardinality {
                Cardinality::Atomic => !ours.is_empty(),
                Cardinality::Collection => ours.contains(target),
                Cardinality::Sequence => !def.allow_duplicates && ours.contains(target),
            };
            if !skip {
                self.link(primary, def, None, target)?;
            }
        }
        Ok(())
    }

    /// Moves or merges the secondary's children owned through `def`.
    fn merge_owned(
        &mut self,
        primary: EntityId,
        secondary: EntityId,
        def: &FieldDef,
        report: &mut MergeReport,
    ) -> Result<(), IntegrityError> {
        let children = self.store.get(secondary)?.targets(def.id)?;
        for child in children {
            if let Some(survivor) = self.matching_child(primary, def, child, report)? {
                tracing::trace!(%child, %survivor, "merging matched sub-object");
                report.merged.push((child, survivor));
                self.merge_into(survivor, child, report)?;
                continue;
            }

            let destination = match def.cardinality {
                Cardinality::Atomic if self.store.get(primary)?.atomic(def.id)?.is_some() => {
                    match def.alternates {
                        Some(alternates) => Some(self.field_def(alternates)?),
                        None => None,
                    }
                }
                _ => Some(def.clone()),
            };
            match destination {
                Some(destination) => {
                    self.detach(child)?;
                    self.attach(primary, &destination, child, None)?;
                    report.moved.push(child);
                }
                None => {
                    tracing::debug!(%child, field = %def.id, "no slot for sub-object, discarding");
                    report.discarded.push(child);
                }
            }
        }
        Ok(())
    }

    /// A child of `primary` in `def` with the same kind and sub-key as
    /// `child` that has not been matched yet.
    fn matching_child(
        &self,
        primary: EntityId,
        def: &FieldDef,
        child: EntityId,
        report: &MergeReport,
    ) -> Result<Option<EntityId>, IntegrityError> {
        let Some(sub_key) = self.sub_key.as_ref() else {
            return Ok(None);
        };
        let Some(wanted) = sub_key.sub_key(&self.store, child) else {
            return Ok(None);
        };
        let kind = self.store.get(child)?.kind();
        for candidate in self.store.get(primary)?.targets(def.id)? {
            if report.merged.iter().any(|&(_, s)| s == candidate) {
                continue;
            }
            if self.store.get(candidate)?.kind() == kind
                && sub_key.sub_key(&self.store, candidate).as_deref() == Some(wanted.as_str())
            {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }
}
