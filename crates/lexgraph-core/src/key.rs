//! Homograph comparison keys.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Placeholder form shown for entries whose form has not been entered yet.
pub const DEFAULT_MISSING_FORM: &str = "***";

/// The `(normalized form, order class)` pair that decides which entries
/// compete for homograph numbers.
///
/// The key is computed by the host (see the integrity crate's
/// `KeyFunction`); this type only carries it and knows what the sentinel
/// "no form" key looks like.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HomographKey {
    pub form: String,
    pub order_class: i32,
}

impl HomographKey {
    pub fn new(form: impl Into<String>, order_class: i32) -> Self {
        HomographKey {
            form: form.into(),
            order_class,
        }
    }

    /// The key shared by every entity without a form.
    pub fn sentinel() -> Self {
        HomographKey::new(String::new(), 0)
    }

    /// Returns `true` for keys exempt from numbering: an empty form, or the
    /// host's missing-form marker.
    pub fn is_sentinel(&self, missing_marker: &str) -> bool {
        let form = self.form.trim();
        form.is_empty() || form == missing_marker
    }
}

impl fmt::Display for HomographKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.form, self.order_class)
    }
}
