//! Composite preference key.
//!
//! A [`PreferenceKey`] names one logical document: `(user, type, scope)`.
//! Its string form is used as the cache / durable key and supports prefix
//! invalidation at the user and user+type level:
//!
//! ```text
//! {user}:{type}:{scope}      scoped document
//! {user}:{type}:~            global (scope = None)
//! ```
//!
//! `%`, `:` and `~` inside user ids and scopes are percent-escaped so that
//! prefixes never collide.

use serde::{Deserialize, Serialize};

use crate::preference::PreferenceType;

const GLOBAL_SCOPE: &str = "~";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PreferenceKey {
    pub user_id: String,
    pub pref_type: PreferenceType,
    /// Table / view name; `None` for a user-wide document
    pub scope: Option<String>,
}

impl PreferenceKey {
    pub fn new(user_id: impl Into<String>, pref_type: PreferenceType, scope: Option<&str>) -> Self {
        Self {
            user_id: user_id.into(),
            pref_type,
            scope: scope.map(str::to_string),
        }
    }

    /// Key for a user-wide document of this type.
    pub fn global(user_id: impl Into<String>, pref_type: PreferenceType) -> Self {
        Self::new(user_id, pref_type, None)
    }

    #[must_use]
    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    /// Canonical string form.
    #[must_use]
    pub fn cache_key(&self) -> String {
        let scope = match &self.scope {
            Some(s) => escape(s),
            None => GLOBAL_SCOPE.to_string(),
        };
        format!("{}{}", self.type_prefix(), scope)
    }

    /// Prefix matching every scope of this key's type for this user.
    #[must_use]
    pub fn type_prefix(&self) -> String {
        format!("{}{}:", Self::user_prefix(&self.user_id), self.pref_type.as_str())
    }

    /// Prefix matching every document belonging to `user_id`.
    #[must_use]
    pub fn user_prefix(user_id: &str) -> String {
        format!("{}:", escape(user_id))
    }
}

impl std::fmt::Display for PreferenceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.cache_key())
    }
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '%' => out.push_str("%25"),
            ':' => out.push_str("%3A"),
            '~' => out.push_str("%7E"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_layout() {
        let scoped = PreferenceKey::new("u1", PreferenceType::Grid, Some("orders"));
        assert_eq!(scoped.cache_key(), "u1:grid:orders");

        let global = PreferenceKey::global("u1", PreferenceType::Formatting);
        assert_eq!(global.cache_key(), "u1:formatting:~");
    }

    #[test]
    fn test_prefixes_nest() {
        let key = PreferenceKey::new("u1", PreferenceType::Grid, Some("orders"));
        assert!(key.cache_key().starts_with(&key.type_prefix()));
        assert!(key.type_prefix().starts_with(&PreferenceKey::user_prefix("u1")));
    }

    #[test]
    fn test_escaping_prevents_prefix_collisions() {
        let a = PreferenceKey::new("a", PreferenceType::Grid, None);
        let b = PreferenceKey::new("a:grid", PreferenceType::Grid, None);
        assert!(!b.cache_key().starts_with(&a.type_prefix()));

        let tilde = PreferenceKey::new("u", PreferenceType::Grid, Some("~"));
        let global = PreferenceKey::global("u", PreferenceType::Grid);
        assert_ne!(tilde.cache_key(), global.cache_key());
    }
}
