//! Consistency engine for lexicon object graphs.
//!
//! Wraps an [`EntityStore`](lexgraph_store::EntityStore) and keeps three
//! kinds of derived state correct across every mutation:
//!
//! - **Homograph numbers**: entries sharing a normalized headword are
//!   numbered `1..N` with gaps filled in preference to renumbering; a lone
//!   entry carries `0` ([`homograph`]).
//! - **Incoming references**: a lazily completed back-reference index that
//!   answers "who points at this entity" once a field has been scanned
//!   ([`backref`]).
//! - **Replace and merge**: redirecting every reference from one entity to
//!   another without losing positions or breaking coupled field pairs, and
//!   merging two equivalent entities without creating cycles ([`replace`],
//!   [`merge`], [`cycle`]).
//!
//! All mutations go through [`IntegrityEngine`], which reports each changed
//! derived property and each reversible action to a host-supplied
//! [`TransactionBoundary`].
//!
//! # Modules
//!
//! - [`engine`]: the mutation surface and deletion cascade
//! - [`homograph`]: registry and the pure renumbering rule
//! - [`backref`]: incoming reference index
//! - [`cycle`]: owner and component cycle detection
//! - [`replace`]: ordered-safe reference replacement
//! - [`merge`]: entity merge with sub-object matching
//! - [`txn`]: change notifications and undo actions
//! - [`derived`]: derived property identifiers and values
//! - [`config`]: engine configuration
//! - [`error`]: IntegrityError and its stable kinds

pub mod backref;
pub mod config;
pub mod cycle;
pub mod derived;
pub mod engine;
pub mod error;
pub mod homograph;
pub mod merge;
pub mod replace;
pub mod txn;

// Re-export key types for ergonomic use.
pub use backref::{IncomingIndex, IndexMismatch, RefEdge};
pub use config::EngineConfig;
pub use cycle::{ComponentGraph, Redirect};
pub use derived::{DerivedProperty, DerivedValue};
pub use engine::{AuditReport, IntegrityEngine};
pub use error::{ErrorKind, IntegrityError};
pub use homograph::{
    renumber, GroupViolation, HomographConfig, HomographRegistry, KeyFunction, NumberChange,
    RenumberOutcome,
};
pub use merge::{MergeReport, SubKeyFunction};
pub use replace::ReplaceReport;
pub use txn::{NullBoundary, RecordingBoundary, TransactionBoundary, UndoAction};
