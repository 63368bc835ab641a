//! Literal → placeholder substitutions that scrub secrets from captured output.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const USERNAME_PLACEHOLDER: &str = "USERNAME_REMOVED";
pub const PASSWORD_PLACEHOLDER: &str = "PASSWORD_REMOVED";

/// Redaction map shipped alongside a job.
///
/// Matching is by exact literal. Callers registering credentials that end up
/// inside URLs must register the encoded form they actually used.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RedactionMap(BTreeMap<String, String>);

impl RedactionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a literal. Empty literals are ignored (they would match everywhere).
    pub fn insert(&mut self, literal: impl Into<String>, placeholder: impl Into<String>) {
        let literal = literal.into();
        if literal.is_empty() {
            return;
        }
        self.0.insert(literal, placeholder.into());
    }

    pub fn with(mut self, literal: impl Into<String>, placeholder: impl Into<String>) -> Self {
        self.insert(literal, placeholder);
        self
    }

    pub fn get(&self, literal: &str) -> Option<&str> {
        self.0.get(literal).map(String::as_str)
    }

    pub fn contains(&self, literal: &str) -> bool {
        self.0.contains_key(literal)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Scrub every registered literal out of `text`.
    ///
    /// Longer literals are replaced first so a full URL wins over the password
    /// embedded in it.
    pub fn apply(&self, text: &str) -> String {
        let mut literals: Vec<(&String, &String)> = self.0.iter().collect();
        literals.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(b.0)));

        let mut out = text.to_string();
        for (literal, placeholder) in literals {
            if out.contains(literal.as_str()) {
                out = out.replace(literal.as_str(), placeholder);
            }
        }
        out
    }
}

impl FromIterator<(String, String)> for RedactionMap {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (literal, placeholder) in iter {
            map.insert(literal, placeholder);
        }
        map
    }
}
