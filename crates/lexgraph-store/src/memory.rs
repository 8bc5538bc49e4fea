//! In-memory implementation of [`EntityStore`].
//!
//! [`InMemoryStore`] is a first-class backend for tests, scratch lexicons,
//! and hosts that keep their repository elsewhere. Entities live in a
//! generational arena: freed slots are recycled, and every recycle bumps the
//! slot's generation so old handles stop resolving.

use lexgraph_core::{Entity, EntityId, KindId, Schema};

use crate::error::StoreError;
use crate::traits::EntityStore;

/// One arena slot.
#[derive(Debug, Clone)]
struct Slot {
    generation: u32,
    entity: Option<Entity>,
}

/// In-memory implementation of [`EntityStore`].
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    schema: Schema,
    slots: Vec<Slot>,
    /// Vacant slot indices, reused LIFO.
    free: Vec<u32>,
    next_serial: u64,
    live: usize,
}

impl InMemoryStore {
    /// Creates an empty store over `schema`.
    pub fn new(schema: Schema) -> Self {
        InMemoryStore {
            schema,
            slots: Vec::new(),
            free: Vec::new(),
            next_serial: 0,
            live: 0,
        }
    }

    /// Iterates over all live entities in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.slots.iter().filter_map(|slot| slot.entity.as_ref())
    }

    /// Resolves a handle to its slot, checking the generation.
    fn slot_of(&self, id: EntityId) -> Result<&Slot, StoreError> {
        let slot = self
            .slots
            .get(id.index as usize)
            .ok_or(StoreError::EntityNotFound { id })?;
        check_generation(slot, id)?;
        Ok(slot)
    }
}

fn check_generation(slot: &Slot, id: EntityId) -> Result<(), StoreError> {
    if slot.generation != id.generation {
        if slot.entity.is_some() {
            return Err(StoreError::StaleHandle {
                id,
                current: slot.generation,
            });
        }
        return Err(StoreError::EntityNotFound { id });
    }
    if slot.entity.is_none() {
        return Err(StoreError::EntityNotFound { id });
    }
    Ok(())
}

impl EntityStore for InMemoryStore {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn insert_entity(&mut self, kind: KindId) -> Result<EntityId, StoreError> {
        if self.schema.kind(kind).is_none() {
            return Err(StoreError::UnknownKind { kind });
        }

        let serial = self.next_serial;
        self.next_serial += 1;

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entity: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        let id = EntityId::new(index, slot.generation);
        slot.entity = Some(Entity::new(id, kind, serial, &self.schema));
        self.live += 1;
        Ok(id)
    }

    fn remove_entity(&mut self, id: EntityId) -> Result<Entity, StoreError> {
        self.slot_of(id)?;
        let slot = &mut self.slots[id.index as usize];
        let entity = slot.entity.take().ok_or(StoreError::EntityNotFound { id })?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        Ok(entity)
    }

    fn get(&self, id: EntityId) -> Result<&Entity, StoreError> {
        self.slot_of(id)?
            .entity
            .as_ref()
            .ok_or(StoreError::EntityNotFound { id })
    }

    fn get_mut(&mut self, id: EntityId) -> Result<&mut Entity, StoreError> {
        self.slot_of(id)?;
        self.slots[id.index as usize]
            .entity
            .as_mut()
            .ok_or(StoreError::EntityNotFound { id })
    }

    fn contains(&self, id: EntityId) -> bool {
        self.slot_of(id).is_ok()
    }

    fn all_instances_of(&self, kind: KindId) -> Vec<EntityId> {
        let mut found: Vec<&Entity> = self
            .iter()
            .filter(|e| self.schema.is_a(e.kind(), kind))
            .collect();
        found.sort_by_key(|e| e.serial());
        found.into_iter().map(|e| e.id()).collect()
    }

    fn len(&self) -> usize {
        self.live
    }
}
