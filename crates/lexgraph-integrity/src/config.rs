//! Engine configuration.
//!
//! Reads configuration from environment variables:
//! - `LEXGRAPH_MISSING_FORM`: placeholder form treated as "no form" (default: "***")
//! - `LEXGRAPH_LOSE_NO_TEXT`: keep both texts when merging differing text fields (default: "true")
//! - `LEXGRAPH_MERGE_SEPARATOR`: separator used when keeping both texts (default: "; ")

use lexgraph_core::DEFAULT_MISSING_FORM;
use serde::{Deserialize, Serialize};

/// Tunables of the integrity engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Form that counts as "no form yet"; entities with it are never numbered.
    pub missing_form_marker: String,
    /// When merging two differing non-empty texts, concatenate instead of
    /// keeping only the primary's.
    pub lose_no_text_on_merge: bool,
    pub merge_text_separator: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            missing_form_marker: DEFAULT_MISSING_FORM.to_string(),
            lose_no_text_on_merge: true,
            merge_text_separator: "; ".to_string(),
        }
    }
}

impl EngineConfig {
    /// Builds a configuration from `LEXGRAPH_*` environment variables,
    /// falling back to defaults for unset or unparsable values.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Parses a JSON document; missing keys take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = EngineConfig::default();
        EngineConfig {
            missing_form_marker: lookup("LEXGRAPH_MISSING_FORM")
                .unwrap_or(defaults.missing_form_marker),
            lose_no_text_on_merge: lookup("LEXGRAPH_LOSE_NO_TEXT")
                .and_then(|v| parse_flag(&v))
                .unwrap_or(defaults.lose_no_text_on_merge),
            merge_text_separator: lookup("LEXGRAPH_MERGE_SEPARATOR")
                .unwrap_or(defaults.merge_text_separator),
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
