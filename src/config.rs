//! Engine configuration and per-pass options.
//!
//! Every field has a serde default, so a partial JSON document (or `{}`)
//! yields a usable configuration.

use serde::{Deserialize, Serialize};

/// Session-wide tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Bound on cascade events per drain. Remaining keys stay pending.
    #[serde(default = "EngineConfig::default_max_cascade_steps")]
    pub max_cascade_steps: usize,
    /// Bound on intersection checks per evaluate pass.
    #[serde(default = "EngineConfig::default_max_map_checks")]
    pub max_map_checks: usize,
    /// Attribute families concepts may attach commands to.
    #[serde(default = "EngineConfig::default_attribute_types")]
    pub attribute_types: Vec<String>,
    /// Operator precedence groups, tightest first.
    #[serde(default = "EngineConfig::default_symbol_precedence")]
    pub symbol_precedence: Vec<Vec<String>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_cascade_steps: Self::default_max_cascade_steps(),
            max_map_checks: Self::default_max_map_checks(),
            attribute_types: Self::default_attribute_types(),
            symbol_precedence: Self::default_symbol_precedence(),
        }
    }
}

impl EngineConfig {
    pub fn from_json(src: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(src)
    }

    fn default_max_cascade_steps() -> usize {
        1_000_000
    }

    fn default_max_map_checks() -> usize {
        100_000
    }

    fn default_attribute_types() -> Vec<String> {
        ["symbol", "visual", "value"].map(String::from).to_vec()
    }

    fn default_symbol_precedence() -> Vec<Vec<String>> {
        vec![
            vec!["power".to_string()],
            vec!["product".to_string(), "ratio".to_string()],
            vec!["sum".to_string(), "difference".to_string()],
        ]
    }

    /// Whether `attribute` is a configured attribute family.
    pub fn is_attribute(&self, attribute: &str) -> bool {
        self.attribute_types.iter().any(|a| a == attribute)
    }
}

/// Options of one evaluate pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluateOptions {
    /// Appended structure is flagged tentative.
    #[serde(default)]
    pub tentative: bool,
    /// Drop every map and the checked-entity memo first.
    #[serde(default)]
    pub reset: bool,
    /// Entities already checked under the same tag are skipped unless dirty.
    #[serde(default = "EvaluateOptions::default_tag")]
    pub tag: String,
}

impl Default for EvaluateOptions {
    fn default() -> Self {
        Self {
            tentative: false,
            reset: false,
            tag: Self::default_tag(),
        }
    }
}

impl EvaluateOptions {
    fn default_tag() -> String {
        "evaluate".to_string()
    }

    /// Options of a suggestion pass.
    pub fn suggest() -> Self {
        Self {
            tentative: true,
            reset: false,
            tag: "suggest".to_string(),
        }
    }
}

/// Counters returned by an evaluate pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EvaluateStats {
    pub nodes_checked: usize,
    pub maps_created: usize,
    pub maps_satisfied: usize,
    pub nodes_appended: usize,
    pub commands_inferred: usize,
}

impl std::ops::AddAssign for EvaluateStats {
    fn add_assign(&mut self, other: Self) {
        self.nodes_checked += other.nodes_checked;
        self.maps_created += other.maps_created;
        self.maps_satisfied += other.maps_satisfied;
        self.nodes_appended += other.nodes_appended;
        self.commands_inferred += other.commands_inferred;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = EngineConfig::from_json("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert!(config.is_attribute("visual"));
        assert!(!config.is_attribute("sound"));
    }

    #[test]
    fn partial_documents_override_named_fields() {
        let config = EngineConfig::from_json(r#"{"max_cascade_steps": 10, "attribute_types": ["symbol"]}"#)
            .unwrap();
        assert_eq!(config.max_cascade_steps, 10);
        assert_eq!(config.attribute_types, vec!["symbol".to_string()]);
        assert_eq!(config.max_map_checks, 100_000);
        assert_eq!(config.symbol_precedence.len(), 3);
    }

    #[test]
    fn evaluate_options_default_tag() {
        let opts: EvaluateOptions = serde_json::from_str(r#"{"tentative": true}"#).unwrap();
        assert!(opts.tentative);
        assert_eq!(opts.tag, "evaluate");
        assert_eq!(EvaluateOptions::suggest().tag, "suggest");
    }
}
