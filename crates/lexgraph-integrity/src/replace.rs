//! Replacing every reference to one entity with references to another.
//!
//! All incoming edges of `old` are captured before anything is written.
//! Each source is then rewritten in two passes:
//!
//! 1. **Insert** `new` next to every occurrence of `old`, superset fields of
//!    coupled pairs first, subset fields last.
//! 2. **Remove** `old`, subset fields first, superset fields last.
//!
//! Inserting first keeps a field from ever becoming empty, so no
//! delete-owner-when-empty cascade can free the source while its edges are
//! still being processed. Removing from the subset before the superset
//! means the superset removal never prunes anything from the subset.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use lexgraph_core::{Cardinality, CoupledSide, Coupling, EntityId, FieldDef, FieldId};
use lexgraph_store::EntityStore;

use crate::backref::RefEdge;
use crate::engine::IntegrityEngine;
use crate::error::IntegrityError;
use crate::txn::TransactionBoundary;

/// Outcome of [`IntegrityEngine::replace_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplaceReport {
    /// Edges that pointed at the old entity and now point at the new one
    /// (as captured before the replace).
    pub replaced: Vec<RefEdge>,
    /// Edges left alone because their source is being deleted.
    pub skipped: Vec<RefEdge>,
}

/// Processing rank of a field: superset halves first, subset halves last.
pub(crate) fn rank(def: &FieldDef) -> u8 {
    match def.coupling {
        Some(Coupling {
            side: CoupledSide::Superset,
            ..
        }) => 0,
        None => 1,
        Some(Coupling {
            side: CoupledSide::Subset,
            ..
        }) => 2,
    }
}

impl<S: EntityStore, B: TransactionBoundary> IntegrityEngine<S, B> {
    /// Makes every reference to `old` point at `new` instead, keeping each
    /// reference at its position.
    ///
    /// The whole operation is validated before the first write: a target
    /// kind mismatch, a coupled-field violation or a cycle leaves the graph
    /// untouched.
    pub fn replace_all(
        &mut self,
        old: EntityId,
        new: EntityId,
    ) -> Result<ReplaceReport, IntegrityError> {
        let mut report = ReplaceReport::default();
        if old == new {
            return Ok(report);
        }
        if self.deleting.contains(&new) {
            return Err(IntegrityError::ConcurrentStructuralChange { entity: new });
        }
        let kind = self.store.get(old)?.kind();
        self.store.get(new)?;
        let _span = tracing::debug_span!("replace_all", %old, %new).entered();

        self.index.ensure_complete_for(&self.store, kind)?;
        let mut by_source: IndexMap<EntityId, IndexMap<FieldId, Vec<Option<usize>>>> =
            IndexMap::new();
        for edge in self.index.all_edges_to(&self.store, old)? {
            if self.deleting.contains(&edge.source) {
                tracing::trace!(source = %edge.source, "skipping edge from entity being deleted");
                report.skipped.push(edge);
                continue;
            }
            by_source
                .entry(edge.source)
                .or_default()
                .entry(edge.field)
                .or_default()
                .push(edge.position);
            report.replaced.push(edge);
        }

        // Validate everything up front.
        for (&source, fields) in &by_source {
            for &field in fields.keys() {
                let def = self.field_def(field)?;
                self.check_target(source, &def, new)?;
                if let Some(Coupling {
                    partner,
                    side: CoupledSide::Subset,
                }) = def.coupling
                {
                    let superset = self.store.get(source)?.value(partner)?;
                    if !superset.contains(old) && !superset.contains(new) {
                        return Err(IntegrityError::CoupledFieldViolation {
                            subset: field,
                            superset: partner,
                            target: new,
                        });
                    }
                }
            }
        }

        for (source, fields) in by_source {
            self.replace_in_source(source, old, new, fields)?;
        }
        tracing::debug!(
            replaced = report.replaced.len(),
            skipped = report.skipped.len(),
            "references replaced"
        );
        Ok(report)
    }

    fn replace_in_source(
        &mut self,
        source: EntityId,
        old: EntityId,
        new: EntityId,
        fields: IndexMap<FieldId, Vec<Option<usize>>>,
    ) -> Result<(), IntegrityError> {
        let mut plan: Vec<(FieldDef, Vec<Option<usize>>)> = Vec::with_capacity(fields.len());
        for (field, mut positions) in fields {
            positions.sort_unstable();
            plan.push((self.field_def(field)?, positions));
        }
        plan.sort_by_key(|(def, _)| rank(def));

        let captured = self.capture_scope(source)?;

        // Pass 1: insert. Records which fields actually received `new`.
        let mut inserted = vec![false; plan.len()];
        for (slot, (def, positions)) in plan.iter().enumerate() {
            match def.cardinality {
                Cardinality::Atomic => {
                    self.link(source, def, None, new)?;
                }
                Cardinality::Collection => {
                    self.link(source, def, None, new)?;
                }
                Cardinality::Sequence => {
                    let present = self.store.get(source)?.value(def.id)?.contains(new);
                    if !def.allow_duplicates && present {
                        continue;
                    }
                    for (i, position) in positions.iter().enumerate() {
                        let at = position.map(|p| p + i);
                        self.link(source, def, at, new)?;
                    }
                    inserted[slot] = true;
                }
            }
        }

        // Pass 2: remove, in reverse field order.
        for (slot, (def, positions)) in plan.iter().enumerate().rev() {
            if !self.store.contains(source) || self.deleting.contains(&source) {
                break;
            }
            match def.cardinality {
                // The atomic slot was overwritten in pass 1.
                Cardinality::Atomic => {}
                Cardinality::Collection => {
                    self.unlink(source, def, None, old)?;
                }
                Cardinality::Sequence => {
                    for (i, position) in positions.iter().enumerate().rev() {
                        let at = match (position, inserted[slot]) {
                            (Some(p), true) => Some(p + i + 1),
                            (p, _) => *p,
                        };
                        self.unlink(source, def, at, old)?;
                    }
                }
            }
        }

        self.settle_key(captured)
    }
}
