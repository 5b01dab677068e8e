//! Service configuration.
//!
//! Loaded from a TOML file and overlaid with `DQSTUDIO_*` environment
//! variables. Every section is optional and falls back to defaults.
//! `workspace.environment` defaults to `deployed`, so the static fallback
//! token is ignored unless `environment = "local"` is set.
//!
//! # Example
//!
//! ```toml
//! [workspace]
//! host = "https://example.cloud.databricks.com"
//! environment = "deployed"
//!
//! [credentials]
//! service_token = "dapi-service"
//!
//! [warehouse]
//! warehouse_id = "abc123"
//!
//! [jobs]
//! generation_job_id = 101
//! validation_job_id = 102
//! request_timeout_secs = 30
//!
//! [summary]
//! endpoint_name = "rules-analyst"
//! timeout_secs = 90
//!
//! [ledger]
//! database_path = "/var/lib/dqstudio/ledger.db"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::credential::Environment;

/// Default number of attempts `propose` makes before surfacing a conflict.
pub const DEFAULT_MAX_PROPOSE_ATTEMPTS: u32 = 3;

/// Default number of jobs the orchestrator remembers.
pub const DEFAULT_MAX_TRACKED_JOBS: usize = 1000;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StudioConfig {
    #[serde(default)]
    pub workspace: WorkspaceSettings,
    #[serde(default)]
    pub credentials: CredentialSettings,
    #[serde(default)]
    pub warehouse: WarehouseSettings,
    #[serde(default)]
    pub jobs: JobSettings,
    #[serde(default)]
    pub summary: SummarySettings,
    #[serde(default)]
    pub ledger: LedgerSettings,
}

/// `[workspace]`: where the remote platform lives.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceSettings {
    /// Base URL of the workspace, e.g. `https://example.cloud.databricks.com`.
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub environment: Environment,
}

/// `[credentials]`: tokens the service holds on its own behalf.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct CredentialSettings {
    /// Service-principal token used to trigger and poll jobs.
    pub service_token: Option<String>,
    /// Static token for user-scoped calls when no caller token is present.
    /// Only honored when `workspace.environment = "local"`.
    pub fallback_token: Option<String>,
}

impl std::fmt::Debug for CredentialSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialSettings")
            .field("service_token", &self.service_token.as_ref().map(|_| "<redacted>"))
            .field("fallback_token", &self.fallback_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// `[warehouse]`: statement execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarehouseSettings {
    #[serde(default)]
    pub warehouse_id: String,
    /// Server-side wait before a statement result is returned (5..=50).
    #[serde(default = "default_wait_timeout_secs")]
    pub wait_timeout_secs: u64,
    /// Client-side HTTP timeout.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for WarehouseSettings {
    fn default() -> Self {
        WarehouseSettings {
            warehouse_id: String::new(),
            wait_timeout_secs: default_wait_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_wait_timeout_secs() -> u64 {
    30
}

fn default_request_timeout_secs() -> u64 {
    60
}

/// `[jobs]`: remote job definitions for generation and validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSettings {
    #[serde(default)]
    pub generation_job_id: Option<u64>,
    #[serde(default)]
    pub validation_job_id: Option<u64>,
    /// HTTP timeout for submit and status calls.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Jobs remembered before the oldest finished ones are dropped.
    #[serde(default = "default_max_tracked_jobs")]
    pub max_tracked_jobs: usize,
}

impl Default for JobSettings {
    fn default() -> Self {
        JobSettings {
            generation_job_id: None,
            validation_job_id: None,
            request_timeout_secs: default_request_timeout_secs(),
            max_tracked_jobs: DEFAULT_MAX_TRACKED_JOBS,
        }
    }
}

fn default_max_tracked_jobs() -> usize {
    DEFAULT_MAX_TRACKED_JOBS
}

/// `[summary]`: AI summarization endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummarySettings {
    #[serde(default)]
    pub endpoint_name: Option<String>,
    /// Longest wait for a summary before the relay degrades.
    #[serde(default = "default_summary_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SummarySettings {
    fn default() -> Self {
        SummarySettings {
            endpoint_name: None,
            timeout_secs: default_summary_timeout_secs(),
        }
    }
}

fn default_summary_timeout_secs() -> u64 {
    60
}

/// `[ledger]`: version ledger persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSettings {
    #[serde(default = "default_max_propose_attempts")]
    pub max_propose_attempts: u32,
    /// SQLite file. `None` keeps the ledger in memory.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        LedgerSettings {
            max_propose_attempts: DEFAULT_MAX_PROPOSE_ATTEMPTS,
            database_path: None,
        }
    }
}

fn default_max_propose_attempts() -> u32 {
    DEFAULT_MAX_PROPOSE_ATTEMPTS
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read '{path}': {message}")]
    Read { path: String, message: String },
    #[error("could not parse configuration: {0}")]
    Parse(String),
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

impl StudioConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Read a TOML file, apply environment overrides, and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let mut config = StudioConfig::from_toml_str(&content)?;
        config.apply_env();
        config.validate().map_err(ConfigError::Invalid)?;
        Ok(config)
    }

    /// Overlay `DQSTUDIO_*` variables from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Overlay variables from an arbitrary lookup. Empty values are ignored.
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(host) = get("DQSTUDIO_HOST") {
            self.workspace.host = host;
        }
        if let Some(env) = get("DQSTUDIO_ENVIRONMENT") {
            match env.to_ascii_lowercase().as_str() {
                "local" => self.workspace.environment = Environment::Local,
                "deployed" => self.workspace.environment = Environment::Deployed,
                other => tracing::warn!(value = other, "ignoring unknown DQSTUDIO_ENVIRONMENT"),
            }
        }
        if let Some(token) = get("DQSTUDIO_SERVICE_TOKEN") {
            self.credentials.service_token = Some(token);
        }
        if let Some(token) = get("DQSTUDIO_FALLBACK_TOKEN") {
            self.credentials.fallback_token = Some(token);
        }
        if let Some(id) = get("DQSTUDIO_WAREHOUSE_ID") {
            self.warehouse.warehouse_id = id;
        }
        if let Some(id) = get("DQSTUDIO_GENERATION_JOB_ID").and_then(|v| v.parse().ok()) {
            self.jobs.generation_job_id = Some(id);
        }
        if let Some(id) = get("DQSTUDIO_VALIDATION_JOB_ID").and_then(|v| v.parse().ok()) {
            self.jobs.validation_job_id = Some(id);
        }
        if let Some(name) = get("DQSTUDIO_SUMMARY_ENDPOINT") {
            self.summary.endpoint_name = Some(name);
        }
        if let Some(path) = get("DQSTUDIO_LEDGER_DB") {
            self.ledger.database_path = Some(PathBuf::from(path));
        }
    }

    /// Check the configuration, collecting every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        let host = self.workspace.host.trim();
        let needs_host = !self.warehouse.warehouse_id.is_empty()
            || self.jobs.generation_job_id.is_some()
            || self.jobs.validation_job_id.is_some()
            || self.summary.endpoint_name.is_some();
        if needs_host && host.is_empty() {
            errors.push("workspace.host is required when remote services are configured".into());
        }
        if !host.is_empty() && !(host.starts_with("https://") || host.starts_with("http://")) {
            errors.push(format!(
                "workspace.host must start with http:// or https://, got '{}'",
                host
            ));
        }

        if !(5..=50).contains(&self.warehouse.wait_timeout_secs) {
            errors.push(format!(
                "warehouse.wait_timeout_secs must be between 5 and 50, got {}",
                self.warehouse.wait_timeout_secs
            ));
        }
        if self.warehouse.request_timeout_secs == 0 {
            errors.push("warehouse.request_timeout_secs must be positive".into());
        }
        if self.jobs.request_timeout_secs == 0 {
            errors.push("jobs.request_timeout_secs must be positive".into());
        }
        if self.jobs.max_tracked_jobs == 0 {
            errors.push("jobs.max_tracked_jobs must be positive".into());
        }
        if self.summary.timeout_secs == 0 {
            errors.push("summary.timeout_secs must be positive".into());
        }

        let jobs_configured =
            self.jobs.generation_job_id.is_some() || self.jobs.validation_job_id.is_some();
        let has_service_token = self
            .credentials
            .service_token
            .as_deref()
            .is_some_and(|t| !t.trim().is_empty());
        if jobs_configured && !has_service_token {
            errors.push(
                "credentials.service_token is required to trigger jobs (no fallback applies)"
                    .into(),
            );
        }

        if self.ledger.max_propose_attempts < 2 {
            errors.push(format!(
                "ledger.max_propose_attempts must be at least 2, got {}",
                self.ledger.max_propose_attempts
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Workspace host without a trailing slash.
    pub fn host(&self) -> &str {
        self.workspace.host.trim().trim_end_matches('/')
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    const FULL: &str = r#"
[workspace]
host = "https://example.cloud.databricks.com/"
environment = "deployed"

[credentials]
service_token = "svc"

[warehouse]
warehouse_id = "wh-1"
wait_timeout_secs = 20

[jobs]
generation_job_id = 101
validation_job_id = 102

[summary]
endpoint_name = "rules-analyst"

[ledger]
max_propose_attempts = 5
database_path = "/tmp/ledger.db"
"#;

    #[test]
    fn parses_full_file() {
        let config = StudioConfig::from_toml_str(FULL).unwrap();
        assert_eq!(config.host(), "https://example.cloud.databricks.com");
        assert_eq!(config.workspace.environment, Environment::Deployed);
        assert_eq!(config.warehouse.wait_timeout_secs, 20);
        assert_eq!(config.warehouse.request_timeout_secs, 60);
        assert_eq!(config.jobs.validation_job_id, Some(102));
        assert_eq!(config.ledger.max_propose_attempts, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config = StudioConfig::from_toml_str("").unwrap();
        assert_eq!(config.workspace.environment, Environment::Deployed);
        assert_eq!(config.ledger.max_propose_attempts, DEFAULT_MAX_PROPOSE_ATTEMPTS);
        assert_eq!(config.jobs.request_timeout_secs, 60);
        assert_eq!(config.jobs.max_tracked_jobs, DEFAULT_MAX_TRACKED_JOBS);
        assert_eq!(config.summary.timeout_secs, 60);
        assert!(config.ledger.database_path.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = StudioConfig::from_toml_str(FULL).unwrap();
        let vars: HashMap<&str, &str> = [
            ("DQSTUDIO_HOST", "http://localhost:8080"),
            ("DQSTUDIO_ENVIRONMENT", "LOCAL"),
            ("DQSTUDIO_FALLBACK_TOKEN", "dev"),
            ("DQSTUDIO_VALIDATION_JOB_ID", "not-a-number"),
            ("DQSTUDIO_GENERATION_JOB_ID", "777"),
            ("DQSTUDIO_WAREHOUSE_ID", ""),
        ]
        .into_iter()
        .collect();
        config.apply_env_from(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.host(), "http://localhost:8080");
        assert_eq!(config.workspace.environment, Environment::Local);
        assert_eq!(config.credentials.fallback_token.as_deref(), Some("dev"));
        assert_eq!(config.jobs.generation_job_id, Some(777));
        // unparseable and empty values leave the file value in place
        assert_eq!(config.jobs.validation_job_id, Some(102));
        assert_eq!(config.warehouse.warehouse_id, "wh-1");
    }

    #[test]
    fn validate_collects_all_problems() {
        let config = StudioConfig::from_toml_str(
            r#"
[warehouse]
warehouse_id = "wh"
wait_timeout_secs = 90

[jobs]
validation_job_id = 1

[ledger]
max_propose_attempts = 1
"#,
        )
        .unwrap();
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 4, "{:?}", errors);
        assert!(errors.iter().any(|e| e.contains("workspace.host")));
        assert!(errors.iter().any(|e| e.contains("wait_timeout_secs")));
        assert!(errors.iter().any(|e| e.contains("service_token")));
        assert!(errors.iter().any(|e| e.contains("max_propose_attempts")));
    }

    #[test]
    fn job_and_summary_timeouts_are_independent_of_warehouse() {
        let config = StudioConfig::from_toml_str(
            r#"
[warehouse]
request_timeout_secs = 15

[jobs]
request_timeout_secs = 40
max_tracked_jobs = 25

[summary]
timeout_secs = 120
"#,
        )
        .unwrap();
        assert_eq!(config.warehouse.request_timeout_secs, 15);
        assert_eq!(config.jobs.request_timeout_secs, 40);
        assert_eq!(config.jobs.max_tracked_jobs, 25);
        assert_eq!(config.summary.timeout_secs, 120);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        let config = StudioConfig::from_toml_str(
            r#"
[jobs]
request_timeout_secs = 0
max_tracked_jobs = 0

[summary]
timeout_secs = 0
"#,
        )
        .unwrap();
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3, "{:?}", errors);
        assert!(errors.iter().any(|e| e.contains("jobs.request_timeout_secs")));
        assert!(errors.iter().any(|e| e.contains("jobs.max_tracked_jobs")));
        assert!(errors.iter().any(|e| e.contains("summary.timeout_secs")));
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(FULL.as_bytes()).unwrap();
        let config = StudioConfig::load(file.path()).unwrap();
        assert_eq!(config.summary.endpoint_name.as_deref(), Some("rules-analyst"));
    }

    #[test]
    fn load_missing_file_reports_path() {
        let err = StudioConfig::load(Path::new("/nonexistent/dqstudio.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { ref path, .. } if path.contains("dqstudio.toml")));
    }

    #[test]
    fn debug_redacts_tokens() {
        let config = StudioConfig::from_toml_str(FULL).unwrap();
        assert!(!format!("{:?}", config).contains("svc"));
    }
}
