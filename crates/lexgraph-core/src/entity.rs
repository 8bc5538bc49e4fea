//! Entities: typed bags of fields with an optional owner.
//!
//! An [`Entity`] stores every field declared on its kind (including inherited
//! ones), initialised to the empty value. Accessors check the value shape and
//! return [`CoreError`] on misuse; they do not enforce cross-entity invariants
//! (ownership, coupled pairs, back references), which belong to the
//! integrity engine.

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::id::{EntityId, FieldId, KindId};
use crate::schema::Schema;
use crate::value::FieldValue;

/// Where an owned entity lives: which object owns it and through which field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerLink {
    pub owner: EntityId,
    pub field: FieldId,
}

/// A lexicon object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    id: EntityId,
    kind: KindId,
    /// Creation sequence number. Unlike slot indices, never reused.
    serial: u64,
    owner: Option<OwnerLink>,
    fields: IndexMap<FieldId, FieldValue>,
}

impl Entity {
    /// Creates an entity with every field of `kind` set to its empty value.
    pub fn new(id: EntityId, kind: KindId, serial: u64, schema: &Schema) -> Self {
        let fields = schema
            .fields_of(kind)
            .into_iter()
            .map(|def| (def.id, FieldValue::empty_for(def)))
            .collect();
        Entity {
            id,
            kind,
            serial,
            owner: None,
            fields,
        }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn kind(&self) -> KindId {
        self.kind
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn owner(&self) -> Option<OwnerLink> {
        self.owner
    }

    pub fn set_owner(&mut self, owner: Option<OwnerLink>) {
        self.owner = owner;
    }

    /// Iterates over all fields in declaration order.
    pub fn fields(&self) -> impl Iterator<Item = (FieldId, &FieldValue)> {
        self.fields.iter().map(|(&id, value)| (id, value))
    }

    // -----------------------------------------------------------------------
    // Generic access
    // -----------------------------------------------------------------------

    pub fn value(&self, field: FieldId) -> Result<&FieldValue, CoreError> {
        self.fields.get(&field).ok_or(CoreError::FieldNotOnEntity {
            entity: self.id,
            field,
        })
    }

    fn value_mut(&mut self, field: FieldId) -> Result<&mut FieldValue, CoreError> {
        let entity = self.id;
        self.fields
            .get_mut(&field)
            .ok_or(CoreError::FieldNotOnEntity { entity, field })
    }

    /// Object ids held by `field`, in storage order.
    pub fn targets(&self, field: FieldId) -> Result<Vec<EntityId>, CoreError> {
        Ok(self.value(field)?.targets())
    }

    // -----------------------------------------------------------------------
    // Atomic
    // -----------------------------------------------------------------------

    pub fn atomic(&self, field: FieldId) -> Result<Option<EntityId>, CoreError> {
        match self.value(field)? {
            FieldValue::Atomic(value) => Ok(*value),
            _ => Err(mismatch(field, "atomic")),
        }
    }

    /// Sets an atomic object field, returning the previous value.
    pub fn set_atomic(
        &mut self,
        field: FieldId,
        value: Option<EntityId>,
    ) -> Result<Option<EntityId>, CoreError> {
        match self.value_mut(field)? {
            FieldValue::Atomic(slot) => Ok(std::mem::replace(slot, value)),
            _ => Err(mismatch(field, "atomic")),
        }
    }

    // -----------------------------------------------------------------------
    // Sequence
    // -----------------------------------------------------------------------

    pub fn sequence(&self, field: FieldId) -> Result<&[EntityId], CoreError> {
        match self.value(field)? {
            FieldValue::Sequence(seq) => Ok(seq.as_slice()),
            _ => Err(mismatch(field, "sequence")),
        }
    }

    /// Inserts `target` at `index` (`index == len` appends).
    pub fn insert_at(
        &mut self,
        field: FieldId,
        index: usize,
        target: EntityId,
    ) -> Result<(), CoreError> {
        match self.value_mut(field)? {
            FieldValue::Sequence(seq) => {
                if index > seq.len() {
                    return Err(CoreError::IndexOutOfRange {
                        field,
                        index,
                        len: seq.len(),
                    });
                }
                seq.insert(index, target);
                Ok(())
            }
            _ => Err(mismatch(field, "sequence")),
        }
    }

    /// Removes and returns the element at `index`.
    pub fn remove_at(&mut self, field: FieldId, index: usize) -> Result<EntityId, CoreError> {
        match self.value_mut(field)? {
            FieldValue::Sequence(seq) => {
                if index >= seq.len() {
                    return Err(CoreError::IndexOutOfRange {
                        field,
                        index,
                        len: seq.len(),
                    });
                }
                Ok(seq.remove(index))
            }
            _ => Err(mismatch(field, "sequence")),
        }
    }

    // -----------------------------------------------------------------------
    // Collection
    // -----------------------------------------------------------------------

    pub fn collection(&self, field: FieldId) -> Result<&IndexSet<EntityId>, CoreError> {
        match self.value(field)? {
            FieldValue::Collection(set) => Ok(set),
            _ => Err(mismatch(field, "collection")),
        }
    }

    /// Adds `target`; returns `false` if it was already a member.
    pub fn add_member(&mut self, field: FieldId, target: EntityId) -> Result<bool, CoreError> {
        match self.value_mut(field)? {
            FieldValue::Collection(set) => Ok(set.insert(target)),
            _ => Err(mismatch(field, "collection")),
        }
    }

    /// Removes `target`, keeping the order of the remaining members.
    pub fn remove_member(&mut self, field: FieldId, target: EntityId) -> Result<bool, CoreError> {
        match self.value_mut(field)? {
            FieldValue::Collection(set) => Ok(set.shift_remove(&target)),
            _ => Err(mismatch(field, "collection")),
        }
    }

    // -----------------------------------------------------------------------
    // Scalars
    // -----------------------------------------------------------------------

    pub fn text(&self, field: FieldId) -> Result<&str, CoreError> {
        match self.value(field)? {
            FieldValue::Text(text) => Ok(text.as_str()),
            _ => Err(mismatch(field, "text")),
        }
    }

    /// Replaces a text field, returning the previous text.
    pub fn set_text(&mut self, field: FieldId, text: String) -> Result<String, CoreError> {
        match self.value_mut(field)? {
            FieldValue::Text(slot) => Ok(std::mem::replace(slot, text)),
            _ => Err(mismatch(field, "text")),
        }
    }

    pub fn integer(&self, field: FieldId) -> Result<i64, CoreError> {
        match self.value(field)? {
            FieldValue::Integer(n) => Ok(*n),
            _ => Err(mismatch(field, "integer")),
        }
    }

    /// Replaces an integer field, returning the previous value.
    pub fn set_integer(&mut self, field: FieldId, value: i64) -> Result<i64, CoreError> {
        match self.value_mut(field)? {
            FieldValue::Integer(slot) => Ok(std::mem::replace(slot, value)),
            _ => Err(mismatch(field, "integer")),
        }
    }
}

fn mismatch(field: FieldId, expected: &'static str) -> CoreError {
    CoreError::FieldMismatch { field, expected }
}
