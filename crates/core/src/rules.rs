//! Data-quality rule model.
//!
//! The wire shape is stable across persistence and job boundaries:
//!
//! ```json
//! { "check": { "function": "is_not_null", "arguments": { "column": "id" } },
//!   "name": "id_is_not_null", "criticality": "error" }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// How a violated rule is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Criticality {
    #[serde(alias = "ERROR", alias = "Error")]
    Error,
    #[serde(alias = "WARN", alias = "Warn", alias = "warning", alias = "WARNING")]
    Warn,
}

impl Default for Criticality {
    fn default() -> Self {
        Criticality::Error
    }
}

impl Criticality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Criticality::Error => "error",
            Criticality::Warn => "warn",
        }
    }
}

impl fmt::Display for Criticality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The check a rule runs: a named function plus its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Check {
    pub function: String,
    #[serde(default)]
    pub arguments: BTreeMap<String, serde_json::Value>,
}

/// A single named rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawRule")]
pub struct Rule {
    pub check: Check,
    pub name: String,
    pub criticality: Criticality,
}

/// Lenient input form: generated rules may omit `name` and `criticality`.
#[derive(Deserialize)]
struct RawRule {
    check: Check,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    criticality: Criticality,
}

impl TryFrom<RawRule> for Rule {
    type Error = String;

    fn try_from(raw: RawRule) -> Result<Self, Self::Error> {
        if raw.check.function.trim().is_empty() {
            return Err("rule check function must not be empty".to_string());
        }
        let name = raw
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| raw.check.function.clone());
        Ok(Rule {
            check: raw.check,
            name,
            criticality: raw.criticality,
        })
    }
}

impl Rule {
    pub fn new(
        name: impl Into<String>,
        function: impl Into<String>,
        arguments: BTreeMap<String, serde_json::Value>,
        criticality: Criticality,
    ) -> Self {
        Rule {
            check: Check {
                function: function.into(),
                arguments,
            },
            name: name.into(),
            criticality,
        }
    }

    /// The column this rule applies to, or `"-"` when the arguments name none.
    ///
    /// Looks at `column`, `col_name`, then the first entry of `columns` or
    /// `col_names`.
    pub fn target_column(&self) -> String {
        let args = &self.check.arguments;
        let scalar = |key: &str| args.get(key).and_then(|v| v.as_str()).map(str::to_string);
        let first = |key: &str| {
            args.get(key)
                .and_then(|v| v.as_array())
                .and_then(|a| a.first())
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };
        scalar("column")
            .or_else(|| scalar("col_name"))
            .or_else(|| first("columns"))
            .or_else(|| first("col_names"))
            .unwrap_or_else(|| "-".to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleSetError {
    #[error("rule set is empty")]
    Empty,
    #[error("duplicate rule name '{0}'")]
    DuplicateName(String),
    #[error("rule at index {index} has an empty check function")]
    EmptyFunction { index: usize },
    #[error("could not parse rule set: {0}")]
    Parse(String),
}

/// An ordered, non-empty sequence of rules with unique names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Rule>", into = "Vec<Rule>")]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new(rules: Vec<Rule>) -> Result<Self, RuleSetError> {
        if rules.is_empty() {
            return Err(RuleSetError::Empty);
        }
        let mut seen = HashSet::new();
        for (index, rule) in rules.iter().enumerate() {
            if rule.check.function.trim().is_empty() {
                return Err(RuleSetError::EmptyFunction { index });
            }
            if !seen.insert(rule.name.as_str()) {
                return Err(RuleSetError::DuplicateName(rule.name.clone()));
            }
        }
        Ok(RuleSet { rules })
    }

    /// Parse a rule set from job or request payloads.
    ///
    /// Accepts a bare array, an object with a `rules` array, or a JSON
    /// string holding either of those.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, RuleSetError> {
        match value {
            serde_json::Value::String(text) => {
                let inner: serde_json::Value = serde_json::from_str(text)
                    .map_err(|e| RuleSetError::Parse(e.to_string()))?;
                if inner.is_string() {
                    return Err(RuleSetError::Parse("doubly encoded string".to_string()));
                }
                RuleSet::from_json(&inner)
            }
            serde_json::Value::Object(obj) => match obj.get("rules") {
                Some(rules) => RuleSet::from_json(rules),
                None => Err(RuleSetError::Parse(
                    "expected an array of rules or an object with a 'rules' field".to_string(),
                )),
            },
            serde_json::Value::Array(_) => {
                let rules: Vec<Rule> = serde_json::from_value(value.clone())
                    .map_err(|e| RuleSetError::Parse(e.to_string()))?;
                RuleSet::new(rules)
            }
            other => Err(RuleSetError::Parse(format!(
                "expected an array of rules, got {}",
                json_kind(other)
            ))),
        }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Rule> {
        self.rules.iter()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.rules).unwrap_or(serde_json::Value::Null)
    }

    /// Compact JSON text, as passed to the validation job.
    pub fn to_json_string(&self) -> String {
        self.to_json().to_string()
    }

    /// Hex SHA-256 of the canonical JSON encoding.
    ///
    /// Argument keys are stored sorted, so structurally equal sets hash equal.
    pub fn digest(&self) -> String {
        let bytes = self.to_json_string();
        let hash = Sha256::digest(bytes.as_bytes());
        hash.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl TryFrom<Vec<Rule>> for RuleSet {
    type Error = RuleSetError;

    fn try_from(rules: Vec<Rule>) -> Result<Self, Self::Error> {
        RuleSet::new(rules)
    }
}

impl From<RuleSet> for Vec<Rule> {
    fn from(set: RuleSet) -> Self {
        set.rules
    }
}

impl<'a> IntoIterator for &'a RuleSet {
    type Item = &'a Rule;
    type IntoIter = std::slice::Iter<'a, Rule>;

    fn into_iter(self) -> Self::IntoIter {
        self.rules.iter()
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}
