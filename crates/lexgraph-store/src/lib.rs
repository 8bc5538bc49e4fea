//! Storage abstraction for lexicon object graphs.
//!
//! Provides the [`EntityStore`] trait defining the contract the integrity
//! engine consumes, plus [`InMemoryStore`] as a first-class backend.
//!
//! # Architecture
//!
//! The store is deliberately low level: it allocates, fetches, mutates and
//! frees entities, and enumerates instances of a kind. It performs no
//! cascading and maintains no derived state. Ownership cascades, back
//! references and homograph numbers are the integrity engine's job, which
//! lets hosts plug in their own persistence behind the same trait.
//!
//! # Modules
//!
//! - [`error`]: StoreError enum with all failure modes
//! - [`traits`]: EntityStore trait definition
//! - [`memory`]: InMemoryStore implementation

pub mod error;
pub mod memory;
pub mod traits;

// Re-export key types for ergonomic use.
pub use error::StoreError;
pub use memory::InMemoryStore;
pub use traits::EntityStore;
