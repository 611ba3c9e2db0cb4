// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Preference types, their default documents and merge rule tables.
//!
//! The engine does not enforce a schema on payloads, but every preference
//! type it knows about supplies:
//! - a default document (returned when nothing is stored yet)
//! - a [`MergeRules`] table naming the structured sub-fields the merge
//!   engine treats specially, and the fields validation checks
//!
//! # Example
//!
//! ```
//! use pref_sync_engine::PreferenceType;
//!
//! let defaults = PreferenceType::Grid.defaults();
//! assert_eq!(defaults["pageSize"], 50);
//!
//! let rules = PreferenceType::Grid.rules();
//! assert_eq!(rules.structured.unwrap().ordered_list, "columnOrder");
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::str::FromStr;

/// Closed set of preference document types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreferenceType {
    /// Data grid layout: column order, visibility, widths, sort and filter state
    Grid,
    /// Side panel / dock layout
    Panel,
    /// Number, date and currency formatting defaults
    Formatting,
}

impl PreferenceType {
    pub const ALL: [PreferenceType; 3] = [Self::Grid, Self::Panel, Self::Formatting];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Grid => "grid",
            Self::Panel => "panel",
            Self::Formatting => "formatting",
        }
    }

    /// Default document for this type.
    #[must_use]
    pub fn defaults(&self) -> Value {
        match self {
            Self::Grid => json!({
                "columnOrder": [],
                "hiddenColumns": [],
                "columnWidths": {},
                "pinnedColumns": {},
                "sortModel": [],
                "filterModel": {},
                "pageSize": 50,
                "density": "standard",
                "showFilters": false,
            }),
            Self::Panel => json!({
                "panelOrder": [],
                "hiddenPanels": [],
                "panelSizes": {},
                "collapsed": false,
                "width": 320,
                "activeTab": null,
            }),
            Self::Formatting => json!({
                "dateFormat": "yyyy-MM-dd",
                "numberLocale": "en-US",
                "decimalPlaces": 2,
                "currency": "USD",
                "useThousandsSeparator": true,
                "negativeInRed": false,
            }),
        }
    }

    /// Merge rule table for this type.
    #[must_use]
    pub fn rules(&self) -> &'static MergeRules {
        match self {
            Self::Grid => &GRID_RULES,
            Self::Panel => &PANEL_RULES,
            Self::Formatting => &FORMATTING_RULES,
        }
    }
}

impl std::fmt::Display for PreferenceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PreferenceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown preference type '{}'", s))
    }
}

/// The three structured sub-fields reconciled against each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StructuredFields {
    /// Ordered membership list (e.g. column order)
    pub ordered_list: &'static str,
    /// Identifiers hidden from view; expected to be members of `ordered_list`
    pub hidden_set: &'static str,
    /// Per-member values keyed by `ordered_list` membership (e.g. widths)
    pub keyed_map: &'static str,
}

/// Per-type rule table consumed by the merge engine.
#[derive(Debug, Clone, Copy)]
pub struct MergeRules {
    pub structured: Option<StructuredFields>,
    /// Touching two or more of these in one update means "full state"
    pub significant: &'static [&'static str],
    pub boolean_fields: &'static [&'static str],
    /// Must be finite and non-negative
    pub numeric_fields: &'static [&'static str],
    pub list_fields: &'static [&'static str],
    pub map_fields: &'static [&'static str],
    /// Fields that may be applied over defaults when validation fails
    pub safe_fields: &'static [&'static str],
    /// Updates touching these persist immediately instead of debouncing
    pub critical_fields: &'static [&'static str],
}

impl MergeRules {
    /// Whether an update object touches any critical field.
    #[must_use]
    pub fn touches_critical(&self, update: &Value) -> bool {
        update
            .as_object()
            .is_some_and(|obj| self.critical_fields.iter().any(|f| obj.contains_key(*f)))
    }
}

static GRID_RULES: MergeRules = MergeRules {
    structured: Some(StructuredFields {
        ordered_list: "columnOrder",
        hidden_set: "hiddenColumns",
        keyed_map: "columnWidths",
    }),
    significant: &["columnOrder", "hiddenColumns", "columnWidths", "pinnedColumns"],
    boolean_fields: &["showFilters"],
    numeric_fields: &["pageSize"],
    list_fields: &["columnOrder", "hiddenColumns", "sortModel"],
    map_fields: &["columnWidths", "filterModel", "pinnedColumns"],
    safe_fields: &["pageSize", "density", "showFilters", "sortModel", "filterModel"],
    critical_fields: &["sortModel", "filterModel"],
};

static PANEL_RULES: MergeRules = MergeRules {
    structured: Some(StructuredFields {
        ordered_list: "panelOrder",
        hidden_set: "hiddenPanels",
        keyed_map: "panelSizes",
    }),
    significant: &["panelOrder", "hiddenPanels", "panelSizes"],
    boolean_fields: &["collapsed"],
    numeric_fields: &["width"],
    list_fields: &["panelOrder", "hiddenPanels"],
    map_fields: &["panelSizes"],
    safe_fields: &["collapsed", "width", "activeTab"],
    critical_fields: &[],
};

static FORMATTING_RULES: MergeRules = MergeRules {
    structured: None,
    significant: &[],
    boolean_fields: &["useThousandsSeparator", "negativeInRed"],
    numeric_fields: &["decimalPlaces"],
    list_fields: &[],
    map_fields: &[],
    safe_fields: &["dateFormat", "numberLocale", "decimalPlaces", "currency"],
    critical_fields: &[],
};

/// A preference payload plus its last-modified timestamp (epoch millis).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreferenceDocument {
    pub payload: Value,
    pub updated_at: i64,
}

impl PreferenceDocument {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            updated_at: epoch_millis(),
        }
    }

    /// The default document for `pref_type`, stamped now.
    pub fn defaults(pref_type: PreferenceType) -> Self {
        Self::new(pref_type.defaults())
    }

    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.payload.get(field)
    }
}

pub(crate) fn epoch_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_round_trips_through_str() {
        for t in PreferenceType::ALL {
            assert_eq!(t.as_str().parse::<PreferenceType>().unwrap(), t);
        }
        assert!("nope".parse::<PreferenceType>().is_err());
    }

    #[test]
    fn test_defaults_cover_rule_fields() {
        for t in PreferenceType::ALL {
            let defaults = t.defaults();
            let rules = t.rules();
            for field in rules
                .boolean_fields
                .iter()
                .chain(rules.numeric_fields)
                .chain(rules.list_fields)
                .chain(rules.map_fields)
            {
                assert!(defaults.get(*field).is_some(), "{} missing default for {}", t, field);
            }
        }
    }

    #[test]
    fn test_touches_critical() {
        let rules = PreferenceType::Grid.rules();
        assert!(rules.touches_critical(&json!({"sortModel": []})));
        assert!(!rules.touches_critical(&json!({"pageSize": 25})));
        assert!(!PreferenceType::Formatting.rules().touches_critical(&json!({"currency": "EUR"})));
    }

    #[test]
    fn test_serde_uses_snake_case() {
        assert_eq!(serde_json::to_string(&PreferenceType::Formatting).unwrap(), "\"formatting\"");
    }
}
