//! Transaction boundary: change notification and undo registration.
//!
//! The engine never owns a transaction. It reports every derived-property
//! change and every primitive mutation to a [`TransactionBoundary`]
//! supplied by the host, which decides how to batch notifications and how
//! to persist undo history.
//!
//! [`UndoAction`] mirrors the reversible-command model: each variant carries
//! enough state to compute its own [`inverse`](UndoAction::inverse).

use serde::{Deserialize, Serialize};

use lexgraph_core::{EntityId, FieldId, KindId, OwnerLink};

use crate::derived::DerivedProperty;

/// Host-side sink for change notifications and undo actions.
pub trait TransactionBoundary {
    /// A derived property of `entity` changed and observers should refresh.
    fn record_changed(&mut self, entity: EntityId, property: DerivedProperty);

    /// A primitive mutation was applied; the host may keep it for undo.
    fn register_undo(&mut self, _action: UndoAction) {}
}

/// Boundary that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullBoundary;

impl TransactionBoundary for NullBoundary {
    fn record_changed(&mut self, _entity: EntityId, _property: DerivedProperty) {}
}

/// Boundary that keeps every notification and undo action in memory.
#[derive(Debug, Default, Clone)]
pub struct RecordingBoundary {
    changes: Vec<(EntityId, DerivedProperty)>,
    undo: Vec<UndoAction>,
}

impl RecordingBoundary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications received so far, in order.
    pub fn changes(&self) -> &[(EntityId, DerivedProperty)] {
        &self.changes
    }

    /// Returns `true` if `property` of `entity` was reported at least once.
    pub fn changed(&self, entity: EntityId, property: DerivedProperty) -> bool {
        self.changes.contains(&(entity, property))
    }

    pub fn undo_actions(&self) -> &[UndoAction] {
        &self.undo
    }

    pub fn take_changes(&mut self) -> Vec<(EntityId, DerivedProperty)> {
        std::mem::take(&mut self.changes)
    }

    /// Drains the undo actions, wrapped in a single batch.
    pub fn take_undo(&mut self, description: &str) -> UndoAction {
        UndoAction::Batch {
            actions: std::mem::take(&mut self.undo),
            description: description.to_string(),
        }
    }
}

impl TransactionBoundary for RecordingBoundary {
    fn record_changed(&mut self, entity: EntityId, property: DerivedProperty) {
        self.changes.push((entity, property));
    }

    fn register_undo(&mut self, action: UndoAction) {
        self.undo.push(action);
    }
}

/// A reversible primitive mutation of the object graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum UndoAction {
    /// An entity was allocated.
    Created { entity: EntityId, kind: KindId },
    /// An entity was freed (captures its owner for re-attachment).
    Deleted {
        entity: EntityId,
        kind: KindId,
        owner: Option<OwnerLink>,
    },
    /// An atomic object field changed.
    SetAtomic {
        entity: EntityId,
        field: FieldId,
        old: Option<EntityId>,
        new: Option<EntityId>,
    },
    /// `target` was added to a sequence (at `position`) or collection.
    Inserted {
        entity: EntityId,
        field: FieldId,
        position: Option<usize>,
        target: EntityId,
    },
    /// `target` was removed from a sequence (at `position`) or collection.
    Removed {
        entity: EntityId,
        field: FieldId,
        position: Option<usize>,
        target: EntityId,
    },
    SetText {
        entity: EntityId,
        field: FieldId,
        old: String,
        new: String,
    },
    SetInteger {
        entity: EntityId,
        field: FieldId,
        old: i64,
        new: i64,
    },
    /// An owned entity changed owner.
    Moved {
        entity: EntityId,
        from: Option<OwnerLink>,
        to: Option<OwnerLink>,
    },
    /// A group of actions undone together.
    Batch {
        actions: Vec<UndoAction>,
        description: String,
    },
}

impl UndoAction {
    /// Returns the action that undoes this one.
    ///
    /// Batches invert each inner action and reverse their order.
    pub fn inverse(&self) -> UndoAction {
        match self {
            UndoAction::Created { entity, kind } => UndoAction::Deleted {
                entity: *entity,
                kind: *kind,
                owner: None,
            },
            UndoAction::Deleted { entity, kind, .. } => UndoAction::Created {
                entity: *entity,
                kind: *kind,
            },
            UndoAction::SetAtomic {
                entity,
                field,
                old,
                new,
            } => UndoAction::SetAtomic {
                entity: *entity,
                field: *field,
                old: *new,
                new: *old,
            },
            UndoAction::Inserted {
                entity,
                field,
                position,
                target,
            } => UndoAction::Removed {
                entity: *entity,
                field: *field,
                position: *position,
                target: *target,
            },
            UndoAction::Removed {
                entity,
                field,
                position,
                target,
            } => UndoAction::Inserted {
                entity: *entity,
                field: *field,
                position: *position,
                target: *target,
            },
            UndoAction::SetText {
                entity,
                field,
                old,
                new,
            } => UndoAction::SetText {
                entity: *entity,
                field: *field,
                old: new.clone(),
                new: old.clone(),
            },
            UndoAction::SetInteger {
                entity,
                field,
                old,
                new,
            } => UndoAction::SetInteger {
                entity: *entity,
                field: *field,
                old: *new,
                new: *old,
            },
            UndoAction::Moved { entity, from, to } => UndoAction::Moved {
                entity: *entity,
                from: *to,
                to: *from,
            },
            UndoAction::Batch {
                actions,
                description,
            } => UndoAction::Batch {
                actions: actions.iter().rev().map(|a| a.inverse()).collect(),
                description: format!("Undo: {}", description),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u32) -> EntityId {
        EntityId::new(n, 0)
    }

    #[test]
    fn insert_inverts_to_remove_at_same_position() {
        let action = UndoAction::Inserted {
            entity: id(1),
            field: FieldId(4),
            position: Some(2),
            target: id(9),
        };
        assert_eq!(
            action.inverse(),
            UndoAction::Removed {
                entity: id(1),
                field: FieldId(4),
                position: Some(2),
                target: id(9),
            }
        );
        assert_eq!(action.inverse().inverse(), action);
    }

    #[test]
    fn batch_inverse_reverses_order() {
        let a = UndoAction::SetInteger {
            entity: id(1),
            field: FieldId(0),
            old: 0,
            new: 2,
        };
        let b = UndoAction::SetText {
            entity: id(1),
            field: FieldId(1),
            old: "run".into(),
            new: "walk".into(),
        };
        let batch = UndoAction::Batch {
            actions: vec![a.clone(), b.clone()],
            description: "edit".into(),
        };
        match batch.inverse() {
            UndoAction::Batch {
                actions,
                description,
            } => {
                assert_eq!(actions, vec![b.inverse(), a.inverse()]);
                assert_eq!(description, "Undo: edit");
            }
            other => panic!("expected batch, got {:?}", other),
        }
    }

    #[test]
    fn undo_action_serde_is_tagged() {
        let action = UndoAction::Created {
            entity: id(3),
            kind: KindId(0),
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["type"], "Created");
        let back: UndoAction = serde_json::from_value(json).unwrap();
        assert_eq!(back, action);
    }

    #[test]
    fn recording_boundary_collects() {
        let mut boundary = RecordingBoundary::new();
        boundary.record_changed(id(1), DerivedProperty::HomographNumber);
        boundary.register_undo(UndoAction::Created {
            entity: id(1),
            kind: KindId(0),
        });
        assert!(boundary.changed(id(1), DerivedProperty::HomographNumber));
        assert!(!boundary.changed(id(1), DerivedProperty::Referrers));

        let batch = boundary.take_undo("create");
        assert!(matches!(batch, UndoAction::Batch { ref actions, .. } if actions.len() == 1));
        assert!(boundary.undo_actions().is_empty());
        assert_eq!(boundary.take_changes().len(), 1);
        assert!(boundary.changes().is_empty());
    }
}
