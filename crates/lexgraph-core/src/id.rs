//! Stable ID newtypes for lexicon objects and their schema.
//!
//! [`EntityId`] is a generational handle into the entity arena: the slot
//! index may be reused after a delete, the generation never is, so a stale
//! handle can never alias a newer object. [`KindId`] and [`FieldId`] are plain
//! indices into the [`Schema`](crate::schema::Schema).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Generational handle of a live (or formerly live) entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId {
    /// Arena slot.
    pub index: u32,
    /// Incremented every time the slot is vacated.
    pub generation: u32,
}

impl EntityId {
    pub fn new(index: u32, generation: u32) -> Self {
        EntityId { index, generation }
    }
}

/// Object class identity (e.g. "LexEntry", "LexSense").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KindId(pub u32);

/// Field identity. Unique across the whole schema, not just within a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FieldId(pub u32);

// Display implementations -- just print the inner value.

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

impl fmt::Display for KindId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
