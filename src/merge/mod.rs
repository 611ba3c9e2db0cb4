// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Merge engine: reconcile a partial update against the current document.
//!
//! Two modes:
//!
//! - **Replace**: defaults, then the current document's plain fields, then
//!   the update (both shallow). The three structured fields (ordered list,
//!   hidden set, keyed map) come from the update verbatim when present, else
//!   from current, else defaults. A hidden set the update did not supply is
//!   filtered to members of the resulting ordered list.
//! - **Merge**: defaults, deep-merged with current, deep-merged with the
//!   update (objects merge recursively, arrays are replaced). The keyed map
//!   starts from the update's map and carries a current entry forward only
//!   if the update did not specify it and its key is still in the active
//!   ordered list (an empty list means no restriction).
//!
//! In [`ReconcileMode::Auto`] an update is a replacement if it carries
//! `"$replace": true`, supplies a non-empty ordered list, touches two or more
//! significant fields, or clears a map field to `{}`.
//!
//! Every result is validated. A document that fails falls back to defaults
//! plus whichever safe fields of the update are individually valid.
//!
//! # Example
//!
//! ```
//! use pref_sync_engine::merge::{reconcile, MergeMode, ReconcileMode};
//! use pref_sync_engine::PreferenceType;
//! use serde_json::json;
//!
//! let current = json!({"columnOrder": ["a", "b"], "columnWidths": {"a": 100, "b": 80}});
//! let update = json!({"columnOrder": ["b"]});
//!
//! let result = reconcile(PreferenceType::Grid, Some(&current), &update, ReconcileMode::Auto);
//! assert_eq!(result.mode, MergeMode::Replace);
//! assert_eq!(result.document["columnOrder"], json!(["b"]));
//! ```

pub mod validate;

use serde_json::{Map, Value};
use std::collections::HashSet;
use tracing::{debug, warn};

use crate::preference::{MergeRules, PreferenceType, StructuredFields};

pub use validate::{field_is_valid, safe_fallback, validate, FieldShape, FieldViolation};

/// Update key that forces (or, when `false`, forbids) replace mode.
pub const REPLACE_MARKER: &str = "$replace";

/// How the caller wants an update applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconcileMode {
    /// Detect from the shape of the update
    #[default]
    Auto,
    Merge,
    Replace,
}

/// The mode that was actually applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    Merge,
    Replace,
}

impl MergeMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Merge => "merge",
            Self::Replace => "replace",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    pub document: Value,
    pub mode: MergeMode,
    /// False when validation failed and the safe fallback was used
    pub validated: bool,
}

/// Decide the mode for `update` (marker already stripped) under `rules`.
#[must_use]
pub fn detect_mode(rules: &MergeRules, update: &Map<String, Value>) -> MergeMode {
    if let Some(structured) = rules.structured {
        let full_order = update
            .get(structured.ordered_list)
            .and_then(Value::as_array)
            .is_some_and(|list| !list.is_empty());
        if full_order {
            return MergeMode::Replace;
        }
    }

    let significant = rules
        .significant
        .iter()
        .filter(|f| update.contains_key(**f))
        .count();
    if significant >= 2 {
        return MergeMode::Replace;
    }

    let clears_map = rules.map_fields.iter().any(|f| {
        update
            .get(*f)
            .and_then(Value::as_object)
            .is_some_and(Map::is_empty)
    });
    if clears_map {
        return MergeMode::Replace;
    }

    MergeMode::Merge
}

/// Reconcile `update` against `current` (or defaults when absent).
///
/// Non-object updates are treated as empty.
#[must_use]
pub fn reconcile(
    pref_type: PreferenceType,
    current: Option<&Value>,
    update: &Value,
    mode: ReconcileMode,
) -> Reconciled {
    let rules = pref_type.rules();
    let defaults = pref_type.defaults();
    let empty = Map::new();
    let current = current.and_then(Value::as_object).unwrap_or(&empty);

    let mut update = match update.as_object() {
        Some(obj) => obj.clone(),
        None => {
            warn!(pref_type = %pref_type, "Ignoring non-object update");
            Map::new()
        }
    };
    let marker = update.remove(REPLACE_MARKER).and_then(|v| v.as_bool());

    let mode = match (mode, marker) {
        (ReconcileMode::Merge, _) => MergeMode::Merge,
        (ReconcileMode::Replace, _) => MergeMode::Replace,
        (ReconcileMode::Auto, Some(true)) => MergeMode::Replace,
        (ReconcileMode::Auto, Some(false)) => MergeMode::Merge,
        (ReconcileMode::Auto, None) => detect_mode(rules, &update),
    };

    let document = match mode {
        MergeMode::Replace => replace(rules, defaults, current, &update),
        MergeMode::Merge => merge(rules, defaults, current, &update),
    };

    match validate(pref_type, &document) {
        Ok(()) => {
            debug!(pref_type = %pref_type, mode = mode.as_str(), "Update reconciled");
            Reconciled {
                document,
                mode,
                validated: true,
            }
        }
        Err(violations) => {
            let fields: Vec<String> = violations.iter().map(ToString::to_string).collect();
            warn!(pref_type = %pref_type, violations = ?fields, "Reconciled document invalid, using safe fallback");
            Reconciled {
                document: safe_fallback(pref_type, &update),
                mode,
                validated: false,
            }
        }
    }
}

fn structured_names(rules: &MergeRules) -> [&'static str; 3] {
    match rules.structured {
        Some(s) => [s.ordered_list, s.hidden_set, s.keyed_map],
        None => [""; 3],
    }
}

fn replace(rules: &MergeRules, defaults: Value, current: &Map<String, Value>, update: &Map<String, Value>) -> Value {
    let mut doc = into_object(defaults);
    let structured = structured_names(rules);

    for (field, value) in current {
        if !structured.contains(&field.as_str()) {
            doc.insert(field.clone(), value.clone());
        }
    }
    for (field, value) in update {
        doc.insert(field.clone(), value.clone());
    }

    if let Some(s) = rules.structured {
        for field in [s.ordered_list, s.hidden_set, s.keyed_map] {
            if let Some(value) = update.get(field).or_else(|| current.get(field)) {
                doc.insert(field.to_string(), value.clone());
            }
        }
        if !update.contains_key(s.hidden_set) {
            filter_hidden(&mut doc, s);
        }
    }

    Value::Object(doc)
}

/// Keep only hidden ids that are members of a non-empty ordered list.
fn filter_hidden(doc: &mut Map<String, Value>, s: StructuredFields) {
    let Some(order) = doc.get(s.ordered_list).and_then(Value::as_array) else {
        return;
    };
    if order.is_empty() {
        return;
    }
    let Some(hidden) = doc.get(s.hidden_set).and_then(Value::as_array) else {
        return;
    };
    let kept: Vec<Value> = hidden.iter().filter(|id| order.contains(id)).cloned().collect();
    doc.insert(s.hidden_set.to_string(), Value::Array(kept));
}

fn merge(rules: &MergeRules, defaults: Value, current: &Map<String, Value>, update: &Map<String, Value>) -> Value {
    let mut doc = into_object(defaults);
    for (field, value) in current {
        deep_merge_field(&mut doc, field, value);
    }
    for (field, value) in update {
        deep_merge_field(&mut doc, field, value);
    }

    if let Some(s) = rules.structured {
        if let Some(map) = reconcile_keyed_map(&doc, current, update, s) {
            doc.insert(s.keyed_map.to_string(), Value::Object(map));
        }
    }

    Value::Object(doc)
}

/// The update's map plus current entries it did not mention whose keys are
/// still in the active ordered list. `None` when either side is not a map.
fn reconcile_keyed_map(
    doc: &Map<String, Value>,
    current: &Map<String, Value>,
    update: &Map<String, Value>,
    s: StructuredFields,
) -> Option<Map<String, Value>> {
    let mut result = match update.get(s.keyed_map) {
        Some(Value::Object(map)) => map.clone(),
        Some(_) => return None,
        None => Map::new(),
    };

    let current_map = match current.get(s.keyed_map) {
        Some(Value::Object(map)) => map,
        Some(_) => return None,
        None => return Some(result),
    };

    let active: Option<HashSet<&str>> = doc
        .get(s.ordered_list)
        .and_then(Value::as_array)
        .filter(|list| !list.is_empty())
        .map(|list| list.iter().filter_map(Value::as_str).collect());

    for (k, v) in current_map {
        if result.contains_key(k) {
            continue;
        }
        let is_member = active.as_ref().map_or(true, |members| members.contains(k.as_str()));
        if is_member {
            result.insert(k.clone(), v.clone());
        }
    }
    Some(result)
}

fn into_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn deep_merge_field(doc: &mut Map<String, Value>, field: &str, overlay: &Value) {
    match doc.get_mut(field) {
        Some(existing) => deep_merge(existing, overlay),
        None => {
            doc.insert(field.to_string(), overlay.clone());
        }
    }
}

/// Recursively merge `overlay` into `base`. Objects merge key by key;
/// anything else (arrays included) is replaced.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                deep_merge_field(base_map, key, value);
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Field-by-field equality over the union of top-level keys. A missing
/// field equals an explicit `null`.
#[must_use]
pub fn documents_equal(a: &Value, b: &Value) -> bool {
    match (a.as_object(), b.as_object()) {
        (Some(a), Some(b)) => a
            .keys()
            .chain(b.keys())
            .all(|k| a.get(k).unwrap_or(&Value::Null) == b.get(k).unwrap_or(&Value::Null)),
        _ => a == b,
    }
}
