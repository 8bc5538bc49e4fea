//! Error taxonomy of the integrity engine.
//!
//! Every variant maps onto an [`ErrorKind`] so callers can decide between
//! rolling back the unit of work and treating the failure as a defect
//! without matching on variant payloads.

use lexgraph_core::{CoreError, EntityId, FieldId, KindId};
use lexgraph_store::StoreError;
use thiserror::Error;

/// Coarse classification of [`IntegrityError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A proposed edge would make an entity its own ancestor or component.
    CyclicReference,
    /// Merge of entities of different kinds.
    IncompatibleMerge,
    /// Query against an incomplete incoming-reference index. A defect.
    IndexNotReady,
    /// The entity is already being deleted by an operation further up the
    /// call stack.
    ConcurrentStructuralChange,
    /// The value does not fit the field (wrong kind, duplicate in a
    /// duplicate-free sequence).
    InvalidTarget,
    /// A subset field would gain a member missing from its superset.
    CoupledFieldViolation,
    /// Schema misuse: wrong field role or shape, unknown field.
    Schema,
    /// The store rejected the operation (dead or stale handle).
    Store,
}

/// Errors produced by the integrity engine.
#[derive(Debug, Error)]
pub enum IntegrityError {
    /// `referrer` pointing at `target` would close a cycle. `path` lists the
    /// top-level objects already connecting `target` back to `referrer`.
    #[error("cyclic reference: {referrer} -> {target} closes cycle {path:?}")]
    CyclicReference {
        referrer: EntityId,
        target: EntityId,
        path: Vec<EntityId>,
    },

    #[error(
        "cannot merge {secondary} (kind {secondary_kind}) into {primary} (kind {primary_kind})"
    )]
    IncompatibleMerge {
        primary: EntityId,
        secondary: EntityId,
        primary_kind: KindId,
        secondary_kind: KindId,
    },

    #[error("incoming reference index not complete for kind {kind}, field {field}")]
    IndexNotReady { kind: KindId, field: FieldId },

    #[error("entity {entity} is already being deleted")]
    ConcurrentStructuralChange { entity: EntityId },

    #[error("invalid target {target} for field {field}: {reason}")]
    InvalidTarget {
        field: FieldId,
        target: EntityId,
        reason: String,
    },

    /// An entity of `kind` cannot be stored in `field`.
    #[error("kind {kind} cannot be stored in field {field} (expects kind {expected})")]
    KindMismatch {
        field: FieldId,
        kind: KindId,
        expected: KindId,
    },

    #[error("{target} is not in superset field {superset} required by subset field {subset}")]
    CoupledFieldViolation {
        subset: FieldId,
        superset: FieldId,
        target: EntityId,
    },

    #[error("field {field} is not a {expected} field")]
    FieldRole {
        field: FieldId,
        expected: &'static str,
    },

    #[error("invalid homograph configuration: {reason}")]
    HomographConfig { reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl IntegrityError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IntegrityError::CyclicReference { .. } => ErrorKind::CyclicReference,
            IntegrityError::IncompatibleMerge { .. } => ErrorKind::IncompatibleMerge,
            IntegrityError::IndexNotReady { .. } => ErrorKind::IndexNotReady,
            IntegrityError::ConcurrentStructuralChange { .. } => {
                ErrorKind::ConcurrentStructuralChange
            }
            IntegrityError::InvalidTarget { .. } | IntegrityError::KindMismatch { .. } => {
                ErrorKind::InvalidTarget
            }
            IntegrityError::CoupledFieldViolation { .. } => ErrorKind::CoupledFieldViolation,
            IntegrityError::FieldRole { .. }
            | IntegrityError::HomographConfig { .. }
            | IntegrityError::Core(_) => ErrorKind::Schema,
            IntegrityError::Store(StoreError::Core(_)) => ErrorKind::Schema,
            IntegrityError::Store(_) => ErrorKind::Store,
        }
    }
}
