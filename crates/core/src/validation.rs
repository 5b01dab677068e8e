//! Validation-job output model.
//!
//! A validation job runs a rule set against a table and reports row counts
//! plus one [`RuleResult`] per rule. [`ValidationReport::from_job_output`]
//! accepts the job's JSON payload; [`ValidationReport::from_counts`] derives
//! statuses and summary counters from raw per-rule violation counts.

use serde::{Deserialize, Serialize};

use crate::rules::{Criticality, RuleSet};

/// Outcome of a single rule against the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    Pass,
    Fail,
    Warn,
}

impl RuleStatus {
    /// Status for a rule of the given criticality with `violations` bad rows.
    pub fn derive(criticality: Criticality, violations: u64) -> Self {
        match (violations, criticality) {
            (0, _) => RuleStatus::Pass,
            (_, Criticality::Error) => RuleStatus::Fail,
            (_, Criticality::Warn) => RuleStatus::Warn,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleResult {
    pub rule_name: String,
    pub column: String,
    pub criticality: Criticality,
    pub status: RuleStatus,
    pub violation_count: u64,
    #[serde(default)]
    pub details: String,
}

/// Summary statistics returned by a validation job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub table_name: String,
    /// RFC 3339 timestamp of the run.
    pub validated_at: String,
    pub total_rules: usize,
    pub passed: usize,
    pub failed: usize,
    pub warnings: usize,
    pub total_rows: u64,
    pub valid_rows: u64,
    pub invalid_rows: u64,
    pub pass_rate: f64,
    pub rule_results: Vec<RuleResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReportError {
    /// The job reported `success: false`.
    #[error("validation failed: {0}")]
    Remote(String),
    #[error("malformed validation output: {0}")]
    Malformed(String),
}

/// Raw row counts for a validation run, before statuses are derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RowCounts {
    pub total_rows: u64,
    pub valid_rows: u64,
    pub invalid_rows: u64,
}

impl ValidationReport {
    /// Parse a validation job payload.
    ///
    /// Accepts the payload as an object or as JSON text. A payload with
    /// `"success": false` is reported as [`ReportError::Remote`].
    pub fn from_job_output(payload: &serde_json::Value) -> Result<Self, ReportError> {
        let owned;
        let payload = match payload {
            serde_json::Value::String(text) => {
                owned = serde_json::from_str::<serde_json::Value>(text)
                    .map_err(|e| ReportError::Malformed(e.to_string()))?;
                &owned
            }
            other => other,
        };

        if let Some(message) = remote_failure(payload) {
            return Err(ReportError::Remote(message));
        }

        serde_json::from_value(payload.clone()).map_err(|e| ReportError::Malformed(e.to_string()))
    }

    /// Build a report from per-rule violation counts.
    ///
    /// `violations[i]` belongs to `rules[i]`. When rows are invalid but no
    /// rule was attributed any violation, the invalid count is attributed to
    /// every rule.
    pub fn from_counts(
        table_name: &str,
        validated_at: &str,
        rules: &RuleSet,
        violations: &[u64],
        counts: RowCounts,
    ) -> Self {
        let mut rule_results: Vec<RuleResult> = rules
            .iter()
            .enumerate()
            .map(|(i, rule)| {
                let violation_count = violations.get(i).copied().unwrap_or(0);
                let column = rule.target_column();
                RuleResult {
                    rule_name: rule.name.clone(),
                    details: format!("Checked {} on column '{}'", rule.check.function, column),
                    column,
                    criticality: rule.criticality,
                    status: RuleStatus::derive(rule.criticality, violation_count),
                    violation_count,
                }
            })
            .collect();

        let attributed = rule_results.iter().any(|r| r.violation_count > 0);
        if counts.invalid_rows > 0 && !attributed {
            for result in &mut rule_results {
                result.violation_count = counts.invalid_rows;
                result.status = RuleStatus::derive(result.criticality, counts.invalid_rows);
            }
        }

        let count = |status: RuleStatus| rule_results.iter().filter(|r| r.status == status).count();
        ValidationReport {
            table_name: table_name.to_string(),
            validated_at: validated_at.to_string(),
            total_rules: rule_results.len(),
            passed: count(RuleStatus::Pass),
            failed: count(RuleStatus::Fail),
            warnings: count(RuleStatus::Warn),
            total_rows: counts.total_rows,
            valid_rows: counts.valid_rows,
            invalid_rows: counts.invalid_rows,
            pass_rate: pass_rate(counts.valid_rows, counts.total_rows),
            rule_results,
        }
    }

    /// Whether every error-criticality rule passed.
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

/// Percentage of valid rows, rounded to two decimals; 0 for an empty table.
pub fn pass_rate(valid_rows: u64, total_rows: u64) -> f64 {
    if total_rows == 0 {
        return 0.0;
    }
    let rate = valid_rows as f64 / total_rows as f64 * 100.0;
    (rate * 100.0).round() / 100.0
}

/// The `error` message of a `{"success": false, ...}` job payload.
pub fn remote_failure(payload: &serde_json::Value) -> Option<String> {
    match payload.get("success").and_then(|s| s.as_bool()) {
        Some(false) => Some(
            payload
                .get("error")
                .and_then(|e| e.as_str())
                .unwrap_or("job reported failure without details")
                .to_string(),
        ),
        _ => None,
    }
}
