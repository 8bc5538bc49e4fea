//! The [`EntityStore`] trait defining the storage contract for lexicon
//! objects.
//!
//! Two-layer API design:
//! - **Required** methods are raw slot operations: allocate, free, fetch,
//!   enumerate. Each touches exactly one entity.
//! - **Provided** methods (`owned_children`, `owner_chain`, `root_of`,
//!   `subtree`) answer ownership-tree questions on top of the required ones.
//!
//! All backends implement this trait, so the integrity engine works the same
//! over the in-memory arena and over a host's persistent repository.

use lexgraph_core::{Entity, EntityId, KindId, Schema};

use crate::error::StoreError;

/// The storage contract for lexicon object graphs.
///
/// The trait is synchronous and object safe; the integrity engine hands
/// `&dyn EntityStore` to host callbacks.
pub trait EntityStore {
    /// The schema every stored entity conforms to.
    fn schema(&self) -> &Schema;

    // -------------------------------------------------------------------
    // Slot operations
    // -------------------------------------------------------------------

    /// Allocates a new, unowned entity of `kind` with empty fields.
    fn insert_entity(&mut self, kind: KindId) -> Result<EntityId, StoreError>;

    /// Frees the entity's slot and returns its final state.
    ///
    /// Does not touch owned children or referrers.
    fn remove_entity(&mut self, id: EntityId) -> Result<Entity, StoreError>;

    /// Fetches a live entity.
    fn get(&self, id: EntityId) -> Result<&Entity, StoreError>;

    /// Fetches a live entity for mutation.
    fn get_mut(&mut self, id: EntityId) -> Result<&mut Entity, StoreError>;

    /// Returns `true` if `id` names a live entity.
    fn contains(&self, id: EntityId) -> bool;

    /// All live instances of `kind` or any kind derived from it, in creation
    /// order.
    fn all_instances_of(&self, kind: KindId) -> Vec<EntityId>;

    /// Number of live entities.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // -------------------------------------------------------------------
    // Ownership tree queries
    // -------------------------------------------------------------------

    /// Entities directly owned by `id`, in field declaration order.
    fn owned_children(&self, id: EntityId) -> Result<Vec<EntityId>, StoreError> {
        let entity = self.get(id)?;
        let schema = self.schema();
        let mut children = Vec::new();
        for (field, value) in entity.fields() {
            if schema.field(field).is_some_and(|def| def.is_owning()) {
                children.extend(value.targets());
            }
        }
        Ok(children)
    }

    /// Owners of `id` from the immediate owner up to the root (excluding `id`).
    fn owner_chain(&self, id: EntityId) -> Result<Vec<EntityId>, StoreError> {
        let mut chain = Vec::new();
        let mut current = self.get(id)?.owner();
        while let Some(link) = current {
            if chain.contains(&link.owner) || link.owner == id {
                break;
            }
            chain.push(link.owner);
            current = self.get(link.owner)?.owner();
        }
        Ok(chain)
    }

    /// The top-level owner of `id` (itself when unowned).
    fn root_of(&self, id: EntityId) -> Result<EntityId, StoreError> {
        Ok(self.owner_chain(id)?.last().copied().unwrap_or(id))
    }

    /// Returns `true` if `ancestor` owns `id` directly or transitively.
    fn is_owned_by(&self, id: EntityId, ancestor: EntityId) -> Result<bool, StoreError> {
        Ok(self.owner_chain(id)?.contains(&ancestor))
    }

    /// `id` and every entity it owns transitively, parents before children.
    fn subtree(&self, id: EntityId) -> Result<Vec<EntityId>, StoreError> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if out.contains(&next) {
                continue;
            }
            out.push(next);
            let mut children = self.owned_children(next)?;
            children.reverse();
            stack.extend(children);
        }
        Ok(out)
    }
}
