//! dqstudio-core: shared model for the dqstudio rule service.
//!
//! Holds everything that does not perform I/O:
//!
//! - [`rules`] -- the rule / rule-set model and its stable wire shape
//! - [`credential`] -- per-call credential selection ([`CredentialSelector`])
//! - [`validation`] -- validation-job output model
//! - [`config`] -- TOML + environment configuration
//! - [`error`] -- the caller-facing [`StudioError`] taxonomy

pub mod config;
pub mod credential;
pub mod error;
pub mod rules;
pub mod validation;

pub use config::{ConfigError, StudioConfig};
pub use credential::{
    Credential, CredentialError, CredentialOrigin, CredentialScope, CredentialSelector,
    Environment, OperationClass, RequestContext,
};
pub use error::StudioError;
pub use rules::{Check, Criticality, Rule, RuleSet, RuleSetError};
pub use validation::{RuleResult, RuleStatus, ValidationReport};

/// Current UTC time as an RFC 3339 string.
pub fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "unknown".to_string())
}
