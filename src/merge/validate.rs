//! Structural validation of reconciled documents.

use serde_json::{Map, Value};

use crate::preference::{MergeRules, PreferenceType};

/// Shape a typed field must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldShape {
    Boolean,
    /// Finite and non-negative
    Number,
    List,
    Map,
    /// The document itself
    Object,
}

impl FieldShape {
    fn of(rules: &MergeRules, field: &str) -> Option<Self> {
        if rules.boolean_fields.contains(&field) {
            Some(Self::Boolean)
        } else if rules.numeric_fields.contains(&field) {
            Some(Self::Number)
        } else if rules.list_fields.contains(&field) {
            Some(Self::List)
        } else if rules.map_fields.contains(&field) {
            Some(Self::Map)
        } else {
            None
        }
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            Self::Boolean => value.is_boolean(),
            Self::Number => value.as_f64().is_some_and(|n| n.is_finite() && n >= 0.0),
            Self::List => value.is_array(),
            Self::Map | Self::Object => value.is_object(),
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Boolean => "a boolean",
            Self::Number => "a finite non-negative number",
            Self::List => "a list",
            Self::Map => "a map",
            Self::Object => "an object",
        }
    }
}

/// One field that failed its structural check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldViolation {
    pub field: String,
    pub expected: FieldShape,
}

impl std::fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "'{}' must be {}", self.field, self.expected.as_str())
    }
}

/// Whether a single field value passes its check. Untyped fields always pass.
#[must_use]
pub fn field_is_valid(rules: &MergeRules, field: &str, value: &Value) -> bool {
    FieldShape::of(rules, field).map_or(true, |shape| shape.matches(value))
}

/// Check every typed field present in `document`.
pub fn validate(pref_type: PreferenceType, document: &Value) -> Result<(), Vec<FieldViolation>> {
    let rules = pref_type.rules();
    let Some(obj) = document.as_object() else {
        return Err(vec![FieldViolation {
            field: String::new(),
            expected: FieldShape::Object,
        }]);
    };

    let violations: Vec<FieldViolation> = obj
        .iter()
        .filter_map(|(field, value)| {
            let expected = FieldShape::of(rules, field)?;
            (!expected.matches(value)).then(|| FieldViolation {
                field: field.clone(),
                expected,
            })
        })
        .collect();

    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}

/// Defaults overlaid with the safe fields of `update` that validate on their own.
#[must_use]
pub fn safe_fallback(pref_type: PreferenceType, update: &Map<String, Value>) -> Value {
    let rules = pref_type.rules();
    let mut document = pref_type.defaults();
    if let Some(obj) = document.as_object_mut() {
        for field in rules.safe_fields {
            if let Some(value) = update.get(*field) {
                if field_is_valid(rules, field, value) {
                    obj.insert((*field).to_string(), value.clone());
                }
            }
        }
    }
    document
}
