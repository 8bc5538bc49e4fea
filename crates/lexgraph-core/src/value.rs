//! Stored field values.
//!
//! A [`FieldValue`] is the source-side storage of one field. Object-valued
//! fields (owning or reference) hold [`EntityId`]s in one of three shapes
//! matching the field's [`Cardinality`]; scalar fields hold text or an
//! integer. Incoming edges are never stored here: they are derived by the
//! integrity layer's index.

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

use crate::id::EntityId;
use crate::schema::{Cardinality, FieldDef, FieldRole};

/// The value of a single field on a single entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldValue {
    /// Zero or one object.
    Atomic(Option<EntityId>),
    /// Unordered, unique objects. Insertion order is kept for determinism.
    Collection(IndexSet<EntityId>),
    /// Ordered objects; duplicates allowed unless the field forbids them.
    Sequence(Vec<EntityId>),
    Text(String),
    Integer(i64),
}

impl FieldValue {
    /// The empty value for a freshly created entity.
    pub fn empty_for(def: &FieldDef) -> Self {
        match (def.role, def.cardinality) {
            (FieldRole::Text, _) => FieldValue::Text(String::new()),
            (FieldRole::Integer, _) => FieldValue::Integer(0),
            (_, Cardinality::Atomic) => FieldValue::Atomic(None),
            (_, Cardinality::Collection) => FieldValue::Collection(IndexSet::new()),
            (_, Cardinality::Sequence) => FieldValue::Sequence(Vec::new()),
        }
    }

    /// Name of the value shape, used in mismatch errors.
    pub fn shape(&self) -> &'static str {
        match self {
            FieldValue::Atomic(_) => "atomic",
            FieldValue::Collection(_) => "collection",
            FieldValue::Sequence(_) => "sequence",
            FieldValue::Text(_) => "text",
            FieldValue::Integer(_) => "integer",
        }
    }

    /// Object ids held by this value, in storage order. Empty for scalars.
    pub fn targets(&self) -> Vec<EntityId> {
        match self {
            FieldValue::Atomic(value) => value.iter().copied().collect(),
            FieldValue::Collection(set) => set.iter().copied().collect(),
            FieldValue::Sequence(seq) => seq.clone(),
            FieldValue::Text(_) | FieldValue::Integer(_) => Vec::new(),
        }
    }

    /// Returns `true` if `id` is held at least once.
    pub fn contains(&self, id: EntityId) -> bool {
        match self {
            FieldValue::Atomic(value) => *value == Some(id),
            FieldValue::Collection(set) => set.contains(&id),
            FieldValue::Sequence(seq) => seq.contains(&id),
            FieldValue::Text(_) | FieldValue::Integer(_) => false,
        }
    }

    /// How many times `id` is held (more than one only in sequences).
    pub fn count_of(&self, id: EntityId) -> usize {
        match self {
            FieldValue::Sequence(seq) => seq.iter().filter(|&&t| t == id).count(),
            other => usize::from(other.contains(id)),
        }
    }

    /// Positions of `id`. Sequences report `Some(index)` for every
    /// occurrence; atomic and collection fields report a single `None`.
    pub fn positions_of(&self, id: EntityId) -> Vec<Option<usize>> {
        match self {
            FieldValue::Sequence(seq) => seq
                .iter()
                .enumerate()
                .filter(|(_, &t)| t == id)
                .map(|(i, _)| Some(i))
                .collect(),
            other if other.contains(id) => vec![None],
            _ => Vec::new(),
        }
    }

    /// Number of held objects; scalars count as one when non-empty.
    pub fn len(&self) -> usize {
        match self {
            FieldValue::Atomic(value) => usize::from(value.is_some()),
            FieldValue::Collection(set) => set.len(),
            FieldValue::Sequence(seq) => seq.len(),
            FieldValue::Text(text) => usize::from(!text.is_empty()),
            FieldValue::Integer(n) => usize::from(*n != 0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u32) -> EntityId {
        EntityId::new(n, 0)
    }

    #[test]
    fn sequence_positions_report_every_occurrence() {
        let value = FieldValue::Sequence(vec![id(1), id(2), id(1)]);
        assert_eq!(value.positions_of(id(1)), vec![Some(0), Some(2)]);
        assert_eq!(value.count_of(id(1)), 2);
        assert!(value.positions_of(id(3)).is_empty());
    }

    #[test]
    fn atomic_and_collection_positions_are_unordered() {
        let atomic = FieldValue::Atomic(Some(id(5)));
        assert_eq!(atomic.positions_of(id(5)), vec![None]);
        assert_eq!(atomic.count_of(id(5)), 1);

        let coll = FieldValue::Collection([id(1), id(2)].into_iter().collect());
        assert_eq!(coll.positions_of(id(2)), vec![None]);
        assert_eq!(coll.targets(), vec![id(1), id(2)]);
    }

    #[test]
    fn scalars_hold_no_targets() {
        assert!(FieldValue::Text("run".into()).targets().is_empty());
        assert!(FieldValue::Integer(3).targets().is_empty());
        assert!(FieldValue::Text(String::new()).is_empty());
        assert!(!FieldValue::Integer(2).is_empty());
    }

    #[test]
    fn serde_roundtrip_collection() {
        let value = FieldValue::Collection([id(3), id(1)].into_iter().collect());
        let json = serde_json::to_string(&value).unwrap();
        let back: FieldValue = serde_json::from_str(&json).unwrap();
        assert_eq!(value, back);
    }
}
