//! Storage error types for lexgraph-store.
//!
//! [`StoreError`] covers lookups of dead or unknown handles and wraps
//! [`CoreError`] from entity field accessors.

use lexgraph_core::{CoreError, EntityId, KindId};
use thiserror::Error;

/// Errors produced by storage operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No live entity has this handle.
    #[error("entity not found: {id}")]
    EntityNotFound { id: EntityId },

    /// The handle's slot is live but was reallocated since the handle was
    /// issued.
    #[error("stale entity handle {id}: slot now at generation {current}")]
    StaleHandle { id: EntityId, current: u32 },

    /// The kind is not declared in the store's schema.
    #[error("unknown kind: {kind}")]
    UnknownKind { kind: KindId },

    /// Field access on an entity failed.
    #[error(transparent)]
    Core(#[from] CoreError),
}
