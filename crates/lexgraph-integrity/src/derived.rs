//! Derived properties: values computed from the graph rather than stored
//! by the host.
//!
//! The set is closed; [`IntegrityEngine::derived_value`](crate::IntegrityEngine::derived_value)
//! maps each tag to its recomputation.

use serde::{Deserialize, Serialize};

use crate::backref::RefEdge;

/// Tag naming a derived property in change notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DerivedProperty {
    /// The entity's homograph number.
    HomographNumber,
    /// The set of incoming reference edges.
    Referrers,
}

/// A recomputed derived property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DerivedValue {
    Number(u32),
    Referrers(Vec<RefEdge>),
}
