//! The integrity engine: the single entry point for graph mutations.
//!
//! [`IntegrityEngine`] wraps an [`EntityStore`] and keeps the derived
//! structures in step with it:
//!
//! - the [`IncomingIndex`] learns about every reference added or removed;
//! - the [`HomographRegistry`] renumbers the groups an edit can affect;
//! - the [`TransactionBoundary`] hears about every derived-value change and
//!   receives an [`UndoAction`] for every primitive write.
//!
//! Every mutation captures the homograph key of the affected scope (the
//! entity itself or its nearest owner of the homograph kind) before it
//! touches anything and settles the numbering once it is done. Entities
//! being deleted are tracked in a guard set; derived state is never
//! recomputed for them.
//!
//! Replace and merge live in [`crate::replace`] and [`crate::merge`].

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use lexgraph_core::{
    Cardinality, CoupledSide, Coupling, EntityId, FieldDef, FieldId, FieldRole, HomographKey,
    KindId, OwnerLink,
};
use lexgraph_store::EntityStore;

use crate::backref::{IncomingIndex, IndexMismatch, RefEdge};
use crate::config::EngineConfig;
use crate::cycle;
use crate::derived::{DerivedProperty, DerivedValue};
use crate::error::IntegrityError;
use crate::homograph::{GroupViolation, HomographConfig, HomographRegistry, KeyFunction, NumberChange};
use crate::merge::SubKeyFunction;
use crate::txn::{NullBoundary, TransactionBoundary, UndoAction};

/// A homograph scope and its key as captured before a mutation.
pub(crate) type CapturedKey = Option<(EntityId, HomographKey)>;

/// Result of [`IntegrityEngine::audit`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditReport {
    pub homographs: Vec<GroupViolation>,
    pub index: Vec<IndexMismatch>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.homographs.is_empty() && self.index.is_empty()
    }
}

/// Consistency engine over an entity store.
pub struct IntegrityEngine<S: EntityStore, B: TransactionBoundary = NullBoundary> {
    pub(crate) store: S,
    pub(crate) index: IncomingIndex,
    pub(crate) homographs: HomographRegistry,
    pub(crate) boundary: B,
    pub(crate) config: EngineConfig,
    pub(crate) sub_key: Option<Box<dyn SubKeyFunction>>,
    /// Entities whose deletion is in progress somewhere on the call stack.
    pub(crate) deleting: HashSet<EntityId>,
    /// Homograph scopes whose renumbering a merge will do itself.
    pub(crate) deferred: HashSet<EntityId>,
}

impl<S: EntityStore + fmt::Debug, B: TransactionBoundary + fmt::Debug> fmt::Debug
    for IntegrityEngine<S, B>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntegrityEngine")
            .field("store", &self.store)
            .field("homographs", &self.homographs)
            .field("boundary", &self.boundary)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S: EntityStore> IntegrityEngine<S, NullBoundary> {
    /// Creates an engine with the default configuration.
    pub fn new(
        store: S,
        homographs: HomographConfig,
        key_fn: impl KeyFunction + 'static,
    ) -> Result<Self, IntegrityError> {
        Self::with_config(store, homographs, key_fn, EngineConfig::default())
    }

    pub fn with_config(
        store: S,
        homographs: HomographConfig,
        key_fn: impl KeyFunction + 'static,
        config: EngineConfig,
    ) -> Result<Self, IntegrityError> {
        let registry = HomographRegistry::new(
            &store,
            homographs,
            Box::new(key_fn),
            config.missing_form_marker.clone(),
        )?;
        Ok(IntegrityEngine {
            store,
            index: IncomingIndex::new(),
            homographs: registry,
            boundary: NullBoundary,
            config,
            sub_key: None,
            deleting: HashSet::new(),
            deferred: HashSet::new(),
        })
    }
}

impl<S: EntityStore, B: TransactionBoundary> IntegrityEngine<S, B> {
    /// Replaces the transaction boundary.
    pub fn with_boundary<B2: TransactionBoundary>(self, boundary: B2) -> IntegrityEngine<S, B2> {
        IntegrityEngine {
            store: self.store,
            index: self.index,
            homographs: self.homographs,
            boundary,
            config: self.config,
            sub_key: self.sub_key,
            deleting: self.deleting,
            deferred: self.deferred,
        }
    }

    /// Installs the callback identifying owned sub-objects during merge.
    pub fn with_sub_key(mut self, sub_key: impl SubKeyFunction + 'static) -> Self {
        self.sub_key = Some(Box::new(sub_key));
        self
    }

    /// Replaces the configuration. A new missing-form marker moves entries
    /// into or out of the sentinel group, so every group is renumbered.
    pub fn set_config(&mut self, config: EngineConfig) -> Result<(), IntegrityError> {
        let marker_changed = config.missing_form_marker != self.config.missing_form_marker;
        self.homographs
            .set_missing_marker(config.missing_form_marker.clone());
        self.config = config;
        if marker_changed {
            self.renumber_all()?;
        }
        Ok(())
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn boundary(&self) -> &B {
        &self.boundary
    }

    pub fn boundary_mut(&mut self) -> &mut B {
        &mut self.boundary
    }

    pub fn index(&self) -> &IncomingIndex {
        &self.index
    }

    pub fn registry(&self) -> &HomographRegistry {
        &self.homographs
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns `true` while `entity` is being deleted.
    pub fn is_deleting(&self, entity: EntityId) -> bool {
        self.deleting.contains(&entity)
    }

    pub fn into_parts(self) -> (S, B) {
        (self.store, self.boundary)
    }

    // -----------------------------------------------------------------------
    // Creation and ownership
    // -----------------------------------------------------------------------

    /// Creates an unowned entity of `kind`.
    pub fn create(&mut self, kind: KindId) -> Result<EntityId, IntegrityError> {
        let id = self.store.insert_entity(kind)?;
        self.boundary
            .register_undo(UndoAction::Created { entity: id, kind });
        tracing::trace!(entity = %id, kind = %kind, "created entity");
        self.enter_group(id)?;
        Ok(id)
    }

    /// Creates an entity of `kind` owned by `owner` through `field`.
    ///
    /// Sequences insert at `index` (append when `None`); an occupied atomic
    /// slot has its previous occupant deleted.
    pub fn create_owned(
        &mut self,
        kind: KindId,
        owner: EntityId,
        field: FieldId,
        index: Option<usize>,
    ) -> Result<EntityId, IntegrityError> {
        self.ensure_alive(owner)?;
        let def = self.owning_def(owner, field)?;
        self.check_kind(&def, kind)?;

        let captured = self.capture_scope(owner)?;
        let id = self.store.insert_entity(kind)?;
        self.boundary
            .register_undo(UndoAction::Created { entity: id, kind });
        self.attach(owner, &def, id, index)?;
        self.enter_group(id)?;
        self.settle_key(captured)?;
        Ok(id)
    }

    /// Moves an owned entity to a new owner and field.
    pub fn move_owned(
        &mut self,
        child: EntityId,
        new_owner: EntityId,
        field: FieldId,
        index: Option<usize>,
    ) -> Result<(), IntegrityError> {
        self.ensure_alive(child)?;
        self.ensure_alive(new_owner)?;
        let def = self.owning_def(new_owner, field)?;
        self.check_kind(&def, self.store.get(child)?.kind())?;
        if new_owner == child || self.store.is_owned_by(new_owner, child)? {
            let mut path = vec![new_owner];
            path.extend(
                self.store
                    .owner_chain(new_owner)?
                    .into_iter()
                    .take_while(|&o| o != child),
            );
            path.push(child);
            return Err(IntegrityError::CyclicReference {
                referrer: new_owner,
                target: child,
                path,
            });
        }

        let old_scope = self.capture_scope(child)?;
        let new_scope = self.capture_scope(new_owner)?;
        self.detach(child)?;
        self.attach(new_owner, &def, child, index)?;

        let same_scope = match (&old_scope, &new_scope) {
            (Some((a, _)), Some((b, _))) => a == b,
            _ => false,
        };
        self.settle_key(old_scope)?;
        if !same_scope {
            self.settle_key(new_scope)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reference fields
    // -----------------------------------------------------------------------

    /// Sets an atomic reference field, returning the previous target.
    pub fn set_atomic(
        &mut self,
        source: EntityId,
        field: FieldId,
        target: Option<EntityId>,
    ) -> Result<Option<EntityId>, IntegrityError> {
        self.ensure_alive(source)?;
        let def = self.reference_def(field, Cardinality::Atomic)?;
        if let Some(target) = target {
            self.check_target(source, &def, target)?;
        }
        let old = self.store.get(source)?.atomic(field)?;
        if old == target {
            return Ok(old);
        }

        let captured = self.capture_scope(source)?;
        match target {
            Some(target) => self.link(source, &def, None, target)?,
            None => {
                if let Some(old) = old {
                    self.unlink(source, &def, None, old)?;
                }
            }
        }
        self.settle_key(captured)?;
        Ok(old)
    }

    /// Inserts `target` at `index` in a reference sequence.
    pub fn insert(
        &mut self,
        source: EntityId,
        field: FieldId,
        index: usize,
        target: EntityId,
    ) -> Result<(), IntegrityError> {
        self.ensure_alive(source)?;
        let def = self.reference_def(field, Cardinality::Sequence)?;
        self.check_target(source, &def, target)?;
        self.check_coupling(source, &def, target)?;
        let value = self.store.get(source)?.value(field)?;
        if !def.allow_duplicates && value.contains(target) {
            return Err(IntegrityError::InvalidTarget {
                field,
                target,
                reason: "already present in a duplicate-free sequence".into(),
            });
        }

        let captured = self.capture_scope(source)?;
        self.link(source, &def, Some(index), target)?;
        self.settle_key(captured)
    }

    /// Appends `target` to a reference sequence.
    pub fn push(
        &mut self,
        source: EntityId,
        field: FieldId,
        target: EntityId,
    ) -> Result<(), IntegrityError> {
        let len = self.store.get(source)?.value(field)?.len();
        self.insert(source, field, len, target)
    }

    /// Adds `target` to a reference collection. Returns `false` if it was
    /// already a member.
    pub fn add_to_collection(
        &mut self,
        source: EntityId,
        field: FieldId,
        target: EntityId,
    ) -> Result<bool, IntegrityError> {
        self.ensure_alive(source)?;
        let def = self.reference_def(field, Cardinality::Collection)?;
        self.check_target(source, &def, target)?;
        if self.store.get(source)?.value(field)?.contains(target) {
            return Ok(false);
        }

        let captured = self.capture_scope(source)?;
        self.link(source, &def, None, target)?;
        self.settle_key(captured)?;
        Ok(true)
    }

    /// Removes the element at `index` of a reference sequence.
    pub fn remove_at(
        &mut self,
        source: EntityId,
        field: FieldId,
        index: usize,
    ) -> Result<EntityId, IntegrityError> {
        self.ensure_alive(source)?;
        let def = self.reference_def(field, Cardinality::Sequence)?;
        let seq = self.store.get(source)?.sequence(field)?;
        let target = *seq.get(index).ok_or(lexgraph_core::CoreError::IndexOutOfRange {
            field,
            index,
            len: seq.len(),
        })?;

        let captured = self.capture_scope(source)?;
        self.unlink(source, &def, Some(index), target)?;
        self.settle_key(captured)?;
        Ok(target)
    }

    /// Removes the first occurrence of `target` from any reference field.
    /// Returns `false` if it was not present.
    pub fn remove(
        &mut self,
        source: EntityId,
        field: FieldId,
        target: EntityId,
    ) -> Result<bool, IntegrityError> {
        self.ensure_alive(source)?;
        let def = self.field_def(field)?;
        if !def.is_reference() {
            return Err(IntegrityError::FieldRole {
                field,
                expected: "reference",
            });
        }
        let Some(position) = self
            .store
            .get(source)?
            .value(field)?
            .positions_of(target)
            .into_iter()
            .next()
        else {
            return Ok(false);
        };

        let captured = self.capture_scope(source)?;
        self.unlink(source, &def, position, target)?;
        self.settle_key(captured)?;
        Ok(true)
    }

    /// Removes `target` from a reference collection.
    pub fn remove_from_collection(
        &mut self,
        source: EntityId,
        field: FieldId,
        target: EntityId,
    ) -> Result<bool, IntegrityError> {
        self.reference_def(field, Cardinality::Collection)?;
        self.remove(source, field, target)
    }

    // -----------------------------------------------------------------------
    // Scalar fields
    // -----------------------------------------------------------------------

    /// Sets a text field, returning the previous text.
    pub fn set_text(
        &mut self,
        entity: EntityId,
        field: FieldId,
        text: impl Into<String>,
    ) -> Result<String, IntegrityError> {
        self.ensure_alive(entity)?;
        let text = text.into();
        let captured = self.capture_scope(entity)?;
        let old = self.store.get_mut(entity)?.set_text(field, text.clone())?;
        if old != text {
            self.boundary.register_undo(UndoAction::SetText {
                entity,
                field,
                old: old.clone(),
                new: text,
            });
        }
        self.settle_key(captured)?;
        Ok(old)
    }

    /// Sets an integer field, returning the previous value.
    ///
    /// Writing the homograph number field directly is allowed; the group is
    /// renumbered right after, so an illegal value never survives the call.
    pub fn set_integer(
        &mut self,
        entity: EntityId,
        field: FieldId,
        value: i64,
    ) -> Result<i64, IntegrityError> {
        self.ensure_alive(entity)?;
        let captured = self.capture_scope(entity)?;
        let old = self.store.get_mut(entity)?.set_integer(field, value)?;
        if old != value {
            self.boundary.register_undo(UndoAction::SetInteger {
                entity,
                field,
                old,
                new: value,
            });
        }
        self.settle_key(captured)?;
        Ok(old)
    }

    // -----------------------------------------------------------------------
    // Deletion
    // -----------------------------------------------------------------------

    /// Deletes `entity` and everything it owns.
    ///
    /// Incoming references from outside the subtree are removed first (which
    /// may cascade into coupled-field pruning and delete-owner-when-empty
    /// deletions), then the entities are freed children first, and finally
    /// the affected homograph groups are renumbered. Deleting an entity
    /// that is already being deleted is a no-op.
    pub fn delete(&mut self, entity: EntityId) -> Result<(), IntegrityError> {
        if self.deleting.contains(&entity) {
            tracing::trace!(%entity, "already being deleted");
            return Ok(());
        }
        self.store.get(entity)?;
        let _span = tracing::debug_span!("delete", %entity).entered();

        let subtree = self.store.subtree(entity)?;
        let marked: Vec<EntityId> = subtree
            .iter()
            .copied()
            .filter(|&id| self.deleting.insert(id))
            .collect();
        let result = self.delete_marked(entity, &subtree);
        for id in marked {
            self.deleting.remove(&id);
        }
        result
    }

    fn delete_marked(
        &mut self,
        entity: EntityId,
        subtree: &[EntityId],
    ) -> Result<(), IntegrityError> {
        let owner_scope = match self.store.get(entity)?.owner() {
            Some(link) if !self.deleting.contains(&link.owner) => {
                self.capture_scope(link.owner)?
            }
            _ => None,
        };
        let mut member_keys: Vec<HomographKey> = Vec::new();
        for &member in subtree {
            if self.deferred.contains(&member) || !self.homographs.is_numbered(&self.store, member) {
                continue;
            }
            let key = self.homographs.key_of(&self.store, member);
            if !member_keys.contains(&key) {
                member_keys.push(key);
            }
        }

        for &member in subtree {
            self.remove_incoming(member)?;
        }
        if self.store.contains(entity) {
            self.detach(entity)?;
        }

        let schema_fields: Vec<FieldDef> = self.store.schema().all_fields().cloned().collect();
        for &member in subtree.iter().rev() {
            if !self.store.contains(member) {
                continue;
            }
            let removed = self.store.remove_entity(member)?;
            self.index.forget_source(self.store.schema(), &removed);
            self.index.forget_target(self.store.schema(), &removed);
            for def in schema_fields.iter().filter(|d| d.is_reference()) {
                let Ok(value) = removed.value(def.id) else {
                    continue;
                };
                for target in value.targets() {
                    if self.store.contains(target) && !self.deleting.contains(&target) {
                        self.boundary
                            .record_changed(target, DerivedProperty::Referrers);
                    }
                }
            }
            self.boundary.register_undo(UndoAction::Deleted {
                entity: member,
                kind: removed.kind(),
                owner: removed.owner(),
            });
            tracing::trace!(entity = %member, "freed");
        }

        for key in member_keys {
            let plan = self
                .homographs
                .plan_group(&self.store, &key, &self.deleting, None);
            self.apply_numbers(plan)?;
        }
        self.settle_key(owner_scope)?;
        tracing::debug!(%entity, freed = subtree.len(), "deleted");
        Ok(())
    }

    /// Removes every reference to `target` held by entities not being deleted.
    fn remove_incoming(&mut self, target: EntityId) -> Result<(), IntegrityError> {
        if !self.store.contains(target) {
            return Ok(());
        }
        let kind = self.store.get(target)?.kind();
        self.index.ensure_complete_for(&self.store, kind)?;
        let mut holders: Vec<(EntityId, FieldId)> = Vec::new();
        for edge in self.index.all_edges_to(&self.store, target)? {
            if self.deleting.contains(&edge.source) {
                tracing::trace!(source = %edge.source, %target, "skipping edge from entity being deleted");
                continue;
            }
            if !holders.contains(&(edge.source, edge.field)) {
                holders.push((edge.source, edge.field));
            }
        }
        for (source, field) in holders {
            let def = self.field_def(field)?;
            self.remove_all_from(source, &def, target)?;
        }
        Ok(())
    }

    /// Removes every occurrence of `target` from `source.field`, re-reading
    /// positions after each removal.
    pub(crate) fn remove_all_from(
        &mut self,
        source: EntityId,
        def: &FieldDef,
        target: EntityId,
    ) -> Result<usize, IntegrityError> {
        let mut removed = 0;
        loop {
            if !self.store.contains(source) || self.deleting.contains(&source) {
                break;
            }
            let Some(position) = self
                .store
                .get(source)?
                .value(def.id)?
                .positions_of(target)
                .into_iter()
                .next()
            else {
                break;
            };
            if !self.unlink(source, def, position, target)? {
                break;
            }
            removed += 1;
        }
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn homograph_number(&self, entity: EntityId) -> Result<u32, IntegrityError> {
        self.store.get(entity)?;
        Ok(self.homographs.number_of(&self.store, entity))
    }

    pub fn homograph_key(&self, entity: EntityId) -> Result<HomographKey, IntegrityError> {
        self.store.get(entity)?;
        Ok(self.homographs.key_of(&self.store, entity))
    }

    /// All members of `entity`'s homograph group, itself included, in
    /// creation order.
    pub fn homographs_of(&self, entity: EntityId) -> Result<Vec<EntityId>, IntegrityError> {
        let key = self.homograph_key(entity)?;
        Ok(self.homographs.group(&self.store, &key, &self.deleting))
    }

    /// Recomputes every homograph group. Returns the number of writes.
    pub fn renumber_all(&mut self) -> Result<usize, IntegrityError> {
        let plan = self.homographs.plan_all(&self.store, &self.deleting);
        let writes = plan.len();
        self.apply_numbers(plan)?;
        if writes > 0 {
            tracing::info!(writes, "homograph numbers repaired");
        }
        Ok(writes)
    }

    /// Checks numbering density and index consistency without mutating.
    pub fn audit(&self) -> Result<AuditReport, IntegrityError> {
        Ok(AuditReport {
            homographs: self.homographs.audit(&self.store),
            index: self.index.verify(&self.store)?,
        })
    }

    /// Incoming edges of `target` through `field`, completing the index
    /// for that pair first.
    pub fn edges_to(
        &mut self,
        target: EntityId,
        field: FieldId,
    ) -> Result<Vec<RefEdge>, IntegrityError> {
        let kind = self.store.get(target)?.kind();
        self.index.ensure_complete(&self.store, kind, field)?;
        self.index.edges_to(&self.store, target, field)
    }

    /// Like [`edges_to`](Self::edges_to), ordered by `compare`.
    pub fn edges_to_sorted_by<F>(
        &mut self,
        target: EntityId,
        field: FieldId,
        compare: F,
    ) -> Result<Vec<RefEdge>, IntegrityError>
    where
        F: FnMut(&RefEdge, &RefEdge) -> std::cmp::Ordering,
    {
        let kind = self.store.get(target)?.kind();
        self.index.ensure_complete(&self.store, kind, field)?;
        self.index
            .edges_to_sorted_by(&self.store, target, field, compare)
    }

    /// Every incoming edge of `target`.
    pub fn referrers(&mut self, target: EntityId) -> Result<Vec<RefEdge>, IntegrityError> {
        let kind = self.store.get(target)?.kind();
        self.index.ensure_complete_for(&self.store, kind)?;
        self.index.all_edges_to(&self.store, target)
    }

    /// Recomputes a derived property of `entity`.
    pub fn derived_value(
        &mut self,
        entity: EntityId,
        property: DerivedProperty,
    ) -> Result<DerivedValue, IntegrityError> {
        if self.deleting.contains(&entity) {
            return Err(IntegrityError::ConcurrentStructuralChange { entity });
        }
        match property {
            DerivedProperty::HomographNumber => {
                Ok(DerivedValue::Number(self.homograph_number(entity)?))
            }
            DerivedProperty::Referrers => Ok(DerivedValue::Referrers(self.referrers(entity)?)),
        }
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub(crate) fn field_def(&self, field: FieldId) -> Result<FieldDef, IntegrityError> {
        Ok(self.store.schema().require_field(field)?.clone())
    }

    fn reference_def(
        &self,
        field: FieldId,
        cardinality: Cardinality,
    ) -> Result<FieldDef, IntegrityError> {
        let def = self.field_def(field)?;
        if !def.is_reference() {
            return Err(IntegrityError::FieldRole {
                field,
                expected: "reference",
            });
        }
        if def.cardinality != cardinality {
            return Err(IntegrityError::FieldRole {
                field,
                expected: match cardinality {
                    Cardinality::Atomic => "atomic",
                    Cardinality::Collection => "collection",
                    Cardinality::Sequence => "sequence",
                },
            });
        }
        Ok(def)
    }

    fn owning_def(&self, owner: EntityId, field: FieldId) -> Result<FieldDef, IntegrityError> {
        let def = self.field_def(field)?;
        if def.role != FieldRole::Owning {
            return Err(IntegrityError::FieldRole {
                field,
                expected: "owning",
            });
        }
        // Fails with FieldNotOnEntity when the owner's kind lacks the field.
        self.store.get(owner)?.value(field)?;
        Ok(def)
    }

    pub(crate) fn ensure_alive(&self, entity: EntityId) -> Result<(), IntegrityError> {
        if self.deleting.contains(&entity) {
            return Err(IntegrityError::ConcurrentStructuralChange { entity });
        }
        self.store.get(entity)?;
        Ok(())
    }

    fn check_kind(&self, def: &FieldDef, kind: KindId) -> Result<(), IntegrityError> {
        match def.target {
            Some(expected) if !self.store.schema().is_a(kind, expected) => {
                Err(IntegrityError::KindMismatch {
                    field: def.id,
                    kind,
                    expected,
                })
            }
            _ => Ok(()),
        }
    }

    /// Checks that `source.field` may hold `target`: alive, right kind, no
    /// cycle.
    pub(crate) fn check_target(
        &self,
        source: EntityId,
        def: &FieldDef,
        target: EntityId,
    ) -> Result<(), IntegrityError> {
        self.ensure_alive(target)?;
        self.check_kind(def, self.store.get(target)?.kind())?;
        cycle::check_reference(&self.store, source, def, target)
    }

    /// A subset field may only gain members already in its superset.
    fn check_coupling(
        &self,
        source: EntityId,
        def: &FieldDef,
        target: EntityId,
    ) -> Result<(), IntegrityError> {
        if let Some(Coupling {
            partner,
            side: CoupledSide::Subset,
        }) = def.coupling
        {
            if !self.store.get(source)?.value(partner)?.contains(target) {
                return Err(IntegrityError::CoupledFieldViolation {
                    subset: def.id,
                    superset: partner,
                    target,
                });
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Primitive writes
    // -----------------------------------------------------------------------

    /// Stores `target` in `source.field` and reports the new edge.
    pub(crate) fn link(
        &mut self,
        source: EntityId,
        def: &FieldDef,
        position: Option<usize>,
        target: EntityId,
    ) -> Result<(), IntegrityError> {
        let field = def.id;
        let entity = self.store.get_mut(source)?;
        let undo = match def.cardinality {
            Cardinality::Atomic => {
                let old = entity.set_atomic(field, Some(target))?;
                if let Some(old) = old {
                    self.index.note_removed(source, field, old);
                    self.boundary
                        .record_changed(old, DerivedProperty::Referrers);
                }
                UndoAction::SetAtomic {
                    entity: source,
                    field,
                    old,
                    new: Some(target),
                }
            }
            Cardinality::Collection => {
                if !entity.add_member(field, target)? {
                    return Ok(());
                }
                UndoAction::Inserted {
                    entity: source,
                    field,
                    position: None,
                    target,
                }
            }
            Cardinality::Sequence => {
                let at = match position {
                    Some(at) => at,
                    None => entity.sequence(field)?.len(),
                };
                entity.insert_at(field, at, target)?;
                UndoAction::Inserted {
                    entity: source,
                    field,
                    position: Some(at),
                    target,
                }
            }
        };
        self.index.note_added(source, field, target);
        self.boundary.register_undo(undo);
        self.boundary
            .record_changed(target, DerivedProperty::Referrers);
        Ok(())
    }

    /// Removes one occurrence of `target` from `source.field` (preferring
    /// `position`), then runs the coupled-field and delete-owner-when-empty
    /// cascades. Returns `false` if `target` was not present.
    pub(crate) fn unlink(
        &mut self,
        source: EntityId,
        def: &FieldDef,
        position: Option<usize>,
        target: EntityId,
    ) -> Result<bool, IntegrityError> {
        let field = def.id;
        let entity = self.store.get_mut(source)?;
        let undo = match def.cardinality {
            Cardinality::Atomic => {
                if entity.atomic(field)? != Some(target) {
                    return Ok(false);
                }
                entity.set_atomic(field, None)?;
                UndoAction::SetAtomic {
                    entity: source,
                    field,
                    old: Some(target),
                    new: None,
                }
            }
            Cardinality::Collection => {
                if !entity.remove_member(field, target)? {
                    return Ok(false);
                }
                UndoAction::Removed {
                    entity: source,
                    field,
                    position: None,
                    target,
                }
            }
            Cardinality::Sequence => {
                let seq = entity.sequence(field)?;
                let at = match position {
                    Some(p) if seq.get(p) == Some(&target) => p,
                    _ => match seq.iter().position(|&t| t == target) {
                        Some(p) => p,
                        None => return Ok(false),
                    },
                };
                entity.remove_at(field, at)?;
                UndoAction::Removed {
                    entity: source,
                    field,
                    position: Some(at),
                    target,
                }
            }
        };
        self.index.note_removed(source, field, target);
        self.boundary.register_undo(undo);
        self.boundary
            .record_changed(target, DerivedProperty::Referrers);
        self.after_unlink(source, def, target)?;
        Ok(true)
    }

    fn after_unlink(
        &mut self,
        source: EntityId,
        def: &FieldDef,
        target: EntityId,
    ) -> Result<(), IntegrityError> {
        if let Some(Coupling {
            partner,
            side: CoupledSide::Superset,
        }) = def.coupling
        {
            if !self.store.get(source)?.value(def.id)?.contains(target) {
                let subset = self.field_def(partner)?;
                let pruned = self.remove_all_from(source, &subset, target)?;
                if pruned > 0 {
                    tracing::debug!(%source, %target, pruned, "pruned coupled subset");
                }
            }
        }
        if def.delete_owner_when_empty
            && !self.deleting.contains(&source)
            && self.store.contains(source)
            && self.store.get(source)?.value(def.id)?.is_empty()
        {
            tracing::debug!(%source, field = %def.id, "last value removed, deleting owner");
            self.delete(source)?;
        }
        Ok(())
    }

    /// Places `child` into `owner.field` and sets its owner link.
    pub(crate) fn attach(
        &mut self,
        owner: EntityId,
        def: &FieldDef,
        child: EntityId,
        index: Option<usize>,
    ) -> Result<(), IntegrityError> {
        let field = def.id;
        match def.cardinality {
            Cardinality::Atomic => {
                if let Some(previous) = self.store.get(owner)?.atomic(field)? {
                    if previous != child {
                        self.delete(previous)?;
                    }
                }
                let old = self
                    .store
                    .get_mut(owner)?
                    .set_atomic(field, Some(child))?;
                self.boundary.register_undo(UndoAction::SetAtomic {
                    entity: owner,
                    field,
                    old,
                    new: Some(child),
                });
            }
            Cardinality::Collection => {
                self.store.get_mut(owner)?.add_member(field, child)?;
                self.boundary.register_undo(UndoAction::Inserted {
                    entity: owner,
                    field,
                    position: None,
                    target: child,
                });
            }
            Cardinality::Sequence => {
                let entity = self.store.get_mut(owner)?;
                let at = match index {
                    Some(at) => at,
                    None => entity.sequence(field)?.len(),
                };
                entity.insert_at(field, at, child)?;
                self.boundary.register_undo(UndoAction::Inserted {
                    entity: owner,
                    field,
                    position: Some(at),
                    target: child,
                });
            }
        }
        let to = Some(OwnerLink { owner, field });
        let from = self.store.get(child)?.owner();
        self.store.get_mut(child)?.set_owner(to);
        self.boundary.register_undo(UndoAction::Moved {
            entity: child,
            from,
            to,
        });
        Ok(())
    }

    /// Takes `child` out of its owner's field and clears its owner link.
    pub(crate) fn detach(&mut self, child: EntityId) -> Result<Option<OwnerLink>, IntegrityError> {
        let Some(link) = self.store.get(child)?.owner() else {
            return Ok(None);
        };
        if self.store.contains(link.owner) {
            let def = self.field_def(link.field)?;
            let owner = self.store.get_mut(link.owner)?;
            let undo = match def.cardinality {
                Cardinality::Atomic => {
                    let old = owner.set_atomic(link.field, None)?;
                    Some(UndoAction::SetAtomic {
                        entity: link.owner,
                        field: link.field,
                        old,
                        new: None,
                    })
                }
                Cardinality::Collection => owner
                    .remove_member(link.field, child)?
                    .then_some(UndoAction::Removed {
                        entity: link.owner,
                        field: link.field,
                        position: None,
                        target: child,
                    }),
                Cardinality::Sequence => {
                    let found = owner.sequence(link.field)?.iter().position(|&c| c == child);
                    match found {
                        Some(at) => {
                            owner.remove_at(link.field, at)?;
                            Some(UndoAction::Removed {
                                entity: link.owner,
                                field: link.field,
                                position: Some(at),
                                target: child,
                            })
                        }
                        None => None,
                    }
                }
            };
            if let Some(undo) = undo {
                self.boundary.register_undo(undo);
            }
        }
        self.store.get_mut(child)?.set_owner(None);
        self.boundary.register_undo(UndoAction::Moved {
            entity: child,
            from: Some(link),
            to: None,
        });
        Ok(Some(link))
    }

    // -----------------------------------------------------------------------
    // Homograph bookkeeping
    // -----------------------------------------------------------------------

    /// `entity` itself if it is numbered, else its nearest numbered owner.
    pub(crate) fn homograph_scope(
        &self,
        entity: EntityId,
    ) -> Result<Option<EntityId>, IntegrityError> {
        if self.homographs.is_numbered(&self.store, entity) {
            return Ok(Some(entity));
        }
        Ok(self
            .store
            .owner_chain(entity)?
            .into_iter()
            .find(|&owner| self.homographs.is_numbered(&self.store, owner)))
    }

    /// The key of `scope`, unless its renumbering is suppressed.
    pub(crate) fn capture_key(&self, scope: EntityId) -> CapturedKey {
        if self.deleting.contains(&scope) || self.deferred.contains(&scope) {
            return None;
        }
        Some((scope, self.homographs.key_of(&self.store, scope)))
    }

    pub(crate) fn capture_scope(&self, entity: EntityId) -> Result<CapturedKey, IntegrityError> {
        Ok(self
            .homograph_scope(entity)?
            .and_then(|scope| self.capture_key(scope)))
    }

    /// Renumbers the groups a captured scope left and entered.
    pub(crate) fn settle_key(&mut self, captured: CapturedKey) -> Result<(), IntegrityError> {
        let Some((scope, old)) = captured else {
            return Ok(());
        };
        if self.deleting.contains(&scope)
            || self.deferred.contains(&scope)
            || !self.store.contains(scope)
        {
            return Ok(());
        }
        let new = self.homographs.key_of(&self.store, scope);
        let plan =
            self.homographs
                .plan_update(&self.store, scope, Some(&old), Some(&new), &self.deleting);
        self.apply_numbers(plan)
    }

    /// Numbers a newly created entity.
    fn enter_group(&mut self, entity: EntityId) -> Result<(), IntegrityError> {
        if !self.homographs.is_numbered(&self.store, entity) || self.deferred.contains(&entity) {
            return Ok(());
        }
        let key = self.homographs.key_of(&self.store, entity);
        let plan = self
            .homographs
            .plan_update(&self.store, entity, None, Some(&key), &self.deleting);
        self.apply_numbers(plan)
    }

    pub(crate) fn apply_numbers(&mut self, plan: Vec<NumberChange>) -> Result<(), IntegrityError> {
        let field = self.homographs.config().number_field;
        for change in plan {
            let new = i64::from(change.new);
            let old = self.store.get_mut(change.entity)?.set_integer(field, new)?;
            self.boundary.register_undo(UndoAction::SetInteger {
                entity: change.entity,
                field,
                old,
                new,
            });
            self.boundary
                .record_changed(change.entity, DerivedProperty::HomographNumber);
            tracing::trace!(entity = %change.entity, old = change.old, new = change.new, "homograph number");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use lexgraph_core::{FieldSpec, Schema};
    use lexgraph_store::InMemoryStore;

    struct Fixture {
        engine: IntegrityEngine<InMemoryStore>,
        entry: KindId,
        form: FieldId,
        children: FieldId,
        slot: FieldId,
        main: FieldId,
    }

    fn fixture() -> Fixture {
        let mut schema = Schema::new();
        let entry = schema.add_kind("Entry", None).unwrap();
        let form = schema.add_field(FieldSpec::text(entry, "Form")).unwrap();
        let number = schema.add_field(FieldSpec::integer(entry, "Number")).unwrap();
        let children = schema
            .add_field(FieldSpec::owning(entry, "Children", Cardinality::Sequence, entry))
            .unwrap();
        let slot = schema
            .add_field(FieldSpec::owning(entry, "Slot", Cardinality::Atomic, entry))
            .unwrap();
        let main = schema
            .add_field(FieldSpec::reference(entry, "Main", Cardinality::Atomic, entry))
            .unwrap();
        let key_fn = move |store: &dyn EntityStore, id: EntityId| {
            let text = store
                .get(id)
                .ok()
                .and_then(|e| e.text(form).ok())
                .unwrap_or_default();
            HomographKey::new(text, 0)
        };
        let engine = IntegrityEngine::new(
            InMemoryStore::new(schema),
            HomographConfig {
                kind: entry,
                number_field: number,
            },
            key_fn,
        )
        .unwrap();
        Fixture {
            engine,
            entry,
            form,
            children,
            slot,
            main,
        }
    }

    #[test]
    fn dying_entities_reject_mutation_and_queries() {
        let mut f = fixture();
        let a = f.engine.create(f.entry).unwrap();
        f.engine.deleting.insert(a);

        let err = f
            .engine
            .derived_value(a, DerivedProperty::HomographNumber)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConcurrentStructuralChange);
        let err = f.engine.set_text(a, f.form, "x").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConcurrentStructuralChange);
        // A second delete while the first is in flight is ignored.
        f.engine.delete(a).unwrap();
        assert!(f.engine.store().contains(a));
    }

    #[test]
    fn moving_into_own_descendant_is_rejected() {
        let mut f = fixture();
        let a = f.engine.create(f.entry).unwrap();
        let b = f
            .engine
            .create_owned(f.entry, a, f.children, None)
            .unwrap();

        let err = f.engine.move_owned(a, b, f.children, None).unwrap_err();
        match err {
            IntegrityError::CyclicReference { path, .. } => assert_eq!(path, vec![b, a]),
            other => panic!("expected a cycle, got {other:?}"),
        }
        assert_eq!(f.engine.store().get(a).unwrap().owner(), None);
    }

    #[test]
    fn move_owned_updates_both_owners() {
        let mut f = fixture();
        let a = f.engine.create(f.entry).unwrap();
        let b = f.engine.create(f.entry).unwrap();
        let child = f
            .engine
            .create_owned(f.entry, a, f.children, None)
            .unwrap();

        f.engine.move_owned(child, b, f.children, None).unwrap();
        let store = f.engine.store();
        assert!(store.get(a).unwrap().sequence(f.children).unwrap().is_empty());
        assert_eq!(store.get(b).unwrap().sequence(f.children).unwrap(), &[child]);
        assert_eq!(
            store.get(child).unwrap().owner(),
            Some(OwnerLink {
                owner: b,
                field: f.children
            })
        );
    }

    #[test]
    fn occupied_atomic_slot_frees_previous_occupant() {
        let mut f = fixture();
        let a = f.engine.create(f.entry).unwrap();
        let first = f.engine.create_owned(f.entry, a, f.slot, None).unwrap();
        let second = f.engine.create_owned(f.entry, a, f.slot, None).unwrap();

        assert!(!f.engine.store().contains(first));
        assert_eq!(
            f.engine.store().get(a).unwrap().atomic(f.slot).unwrap(),
            Some(second)
        );
    }

    #[test]
    fn set_atomic_moves_the_incoming_edge() {
        let mut f = fixture();
        let a = f.engine.create(f.entry).unwrap();
        let b = f.engine.create(f.entry).unwrap();
        let c = f.engine.create(f.entry).unwrap();

        assert_eq!(f.engine.set_atomic(a, f.main, Some(b)).unwrap(), None);
        assert_eq!(f.engine.referrers(b).unwrap().len(), 1);
        assert_eq!(f.engine.set_atomic(a, f.main, Some(c)).unwrap(), Some(b));
        assert!(f.engine.referrers(b).unwrap().is_empty());
        assert_eq!(f.engine.referrers(c).unwrap().len(), 1);

        f.engine.delete(c).unwrap();
        assert_eq!(f.engine.store().get(a).unwrap().atomic(f.main).unwrap(), None);
        assert!(f.engine.audit().unwrap().is_clean());
    }

    #[test]
    fn wrong_field_role_is_a_schema_error() {
        let mut f = fixture();
        let a = f.engine.create(f.entry).unwrap();
        let b = f.engine.create(f.entry).unwrap();
        let err = f.engine.push(a, f.children, b).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Schema);
    }
}
