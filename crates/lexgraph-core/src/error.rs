//! Core error types for lexgraph-core.
//!
//! Uses `thiserror` for structured, matchable variants covering schema
//! declaration mistakes and misuse of entity field accessors.

use crate::id::{EntityId, FieldId, KindId};
use thiserror::Error;

/// Core errors produced by the lexgraph-core crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Attempting to declare a kind name that already exists.
    #[error("duplicate kind name: '{name}'")]
    DuplicateKindName { name: String },

    /// Attempting to declare a field name twice on the same kind.
    #[error("duplicate field name '{name}' on kind {kind}")]
    DuplicateFieldName { kind: KindId, name: String },

    /// A KindId was not found in the schema.
    #[error("kind not found: KindId({id})")]
    KindNotFound { id: KindId },

    /// A FieldId was not found in the schema.
    #[error("field not found: FieldId({id})")]
    FieldNotFound { id: FieldId },

    /// The field exists but is not declared on the entity's kind.
    #[error("field {field} is not declared on entity {entity}")]
    FieldNotOnEntity { entity: EntityId, field: FieldId },

    /// The field holds a different shape of value than the accessor expects.
    #[error("field {field} is not a {expected} field")]
    FieldMismatch {
        field: FieldId,
        expected: &'static str,
    },

    /// A sequence position was outside the current length.
    #[error("index {index} out of range for field {field} (len {len})")]
    IndexOutOfRange {
        field: FieldId,
        index: usize,
        len: usize,
    },

    /// A field declaration is internally inconsistent.
    #[error("invalid field declaration '{name}': {reason}")]
    InvalidField { name: String, reason: String },

    /// Two fields cannot be coupled.
    #[error("invalid coupling: {reason}")]
    InvalidCoupling { reason: String },
}
