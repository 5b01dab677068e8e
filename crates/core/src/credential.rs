//! Per-call credential selection.
//!
//! Each outbound call names an [`OperationClass`]; [`CredentialSelector`]
//! maps it to the token to present, following a fixed policy table:
//!
//! | class                  | primary                   | fallback                    |
//! |------------------------|---------------------------|-----------------------------|
//! | `UserDataAccess`       | caller-forwarded token    | static token (local only)   |
//! | `UserAIQuery`          | caller-forwarded token    | static token (local only)   |
//! | `PrivilegedJobTrigger` | service-principal token   | none                        |
//! | `UserStoragePersist`   | caller OAuth token        | none                        |
//!
//! `PrivilegedJobTrigger` never looks at the caller's token, even when one
//! is present: the delegated scope cannot trigger automation.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The logical class of an outbound call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationClass {
    UserDataAccess,
    UserAIQuery,
    PrivilegedJobTrigger,
    UserStoragePersist,
}

impl OperationClass {
    pub const ALL: [OperationClass; 4] = [
        OperationClass::UserDataAccess,
        OperationClass::UserAIQuery,
        OperationClass::PrivilegedJobTrigger,
        OperationClass::UserStoragePersist,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationClass::UserDataAccess => "user_data_access",
            OperationClass::UserAIQuery => "user_ai_query",
            OperationClass::PrivilegedJobTrigger => "privileged_job_trigger",
            OperationClass::UserStoragePersist => "user_storage_persist",
        }
    }

    /// The fixed policy row for this class.
    pub fn policy(&self) -> CredentialPolicy {
        match self {
            OperationClass::UserDataAccess | OperationClass::UserAIQuery => CredentialPolicy {
                primary: PrimarySource::Caller,
                static_fallback: true,
            },
            OperationClass::PrivilegedJobTrigger => CredentialPolicy {
                primary: PrimarySource::ServicePrincipal,
                static_fallback: false,
            },
            OperationClass::UserStoragePersist => CredentialPolicy {
                primary: PrimarySource::Caller,
                static_fallback: false,
            },
        }
    }
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the primary credential for a class comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimarySource {
    Caller,
    ServicePrincipal,
}

/// One row of the policy table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CredentialPolicy {
    pub primary: PrimarySource,
    pub static_fallback: bool,
}

/// Whose authority a credential carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialScope {
    UserDelegated,
    ServicePrincipal,
}

/// Where a resolved credential was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialOrigin {
    /// The caller's delegated token forwarded with the request.
    CallerForwarded,
    /// The caller's OAuth token, used for user-scoped persistence.
    CallerOAuth,
    /// The application's own service-principal token.
    ServicePrincipal,
    /// The statically configured development token.
    StaticFallback,
}

/// An opaque bearer token plus where it came from.
///
/// Immutable once resolved. The token is never printed by `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    token: String,
    scope: CredentialScope,
    origin: CredentialOrigin,
}

impl Credential {
    pub fn new(token: impl Into<String>, scope: CredentialScope, origin: CredentialOrigin) -> Self {
        Credential {
            token: token.into(),
            scope,
            origin,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn scope(&self) -> CredentialScope {
        self.scope
    }

    pub fn origin(&self) -> CredentialOrigin {
        self.origin
    }

    /// `Authorization` header value for this credential.
    pub fn bearer_header(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("scope", &self.scope)
            .field("origin", &self.origin)
            .finish()
    }
}

/// Per-request caller identity, threaded explicitly through every call.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    forwarded_token: Option<String>,
    caller: Option<String>,
}

impl RequestContext {
    /// A context with no caller identity (background work, local testing).
    pub fn anonymous() -> Self {
        RequestContext::default()
    }

    pub fn new(forwarded_token: Option<String>, caller: Option<String>) -> Self {
        RequestContext {
            forwarded_token: forwarded_token.filter(|t| !t.trim().is_empty()),
            caller: caller.filter(|c| !c.trim().is_empty()),
        }
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        RequestContext::new(Some(token.into()), None)
    }

    pub fn forwarded_token(&self) -> Option<&str> {
        self.forwarded_token.as_deref()
    }

    pub fn caller(&self) -> Option<&str> {
        self.caller.as_deref()
    }

    /// Caller identity for audit fields, `"anonymous"` when unknown.
    pub fn caller_or_anonymous(&self) -> &str {
        self.caller.as_deref().unwrap_or("anonymous")
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field(
                "forwarded_token",
                &self.forwarded_token.as_ref().map(|_| "<redacted>"),
            )
            .field("caller", &self.caller)
            .finish()
    }
}

/// Deployment mode. The static fallback token is only honored locally.
///
/// Defaults to `Deployed`: the fallback applies only when a configuration
/// opts into `Local` explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Local,
    #[default]
    Deployed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialError {
    #[error("no credential available for {0}")]
    NoCredentialAvailable(OperationClass),
}

/// Resolves which credential to attach to an outbound call.
#[derive(Clone)]
pub struct CredentialSelector {
    service_token: Option<String>,
    fallback_token: Option<String>,
}

impl CredentialSelector {
    /// Build a selector from the configured service and fallback tokens.
    ///
    /// In [`Environment::Deployed`] a configured fallback token is dropped
    /// so user-scoped calls can never silently run as a shared identity.
    pub fn new(
        service_token: Option<String>,
        fallback_token: Option<String>,
        environment: Environment,
    ) -> Self {
        let fallback_token = fallback_token.filter(|t| !t.trim().is_empty());
        let fallback_token = match environment {
            Environment::Local => fallback_token,
            Environment::Deployed => {
                if fallback_token.is_some() {
                    tracing::warn!(
                        "static fallback token is configured in a deployed environment; ignoring it"
                    );
                }
                None
            }
        };
        CredentialSelector {
            service_token: service_token.filter(|t| !t.trim().is_empty()),
            fallback_token,
        }
    }

    pub fn from_config(config: &crate::config::StudioConfig) -> Self {
        CredentialSelector::new(
            config.credentials.service_token.clone(),
            config.credentials.fallback_token.clone(),
            config.workspace.environment,
        )
    }

    /// Resolve the credential for one outbound call.
    pub fn resolve(
        &self,
        class: OperationClass,
        ctx: &RequestContext,
    ) -> Result<Credential, CredentialError> {
        let policy = class.policy();
        let resolved = match policy.primary {
            PrimarySource::ServicePrincipal => self.service_token.as_ref().map(|token| {
                Credential::new(
                    token.clone(),
                    CredentialScope::ServicePrincipal,
                    CredentialOrigin::ServicePrincipal,
                )
            }),
            PrimarySource::Caller => {
                let origin = if class == OperationClass::UserStoragePersist {
                    CredentialOrigin::CallerOAuth
                } else {
                    CredentialOrigin::CallerForwarded
                };
                ctx.forwarded_token()
                    .map(|token| Credential::new(token, CredentialScope::UserDelegated, origin))
                    .or_else(|| {
                        if !policy.static_fallback {
                            return None;
                        }
                        self.fallback_token.as_ref().map(|token| {
                            Credential::new(
                                token.clone(),
                                CredentialScope::ServicePrincipal,
                                CredentialOrigin::StaticFallback,
                            )
                        })
                    })
            }
        };

        match resolved {
            Some(credential) => {
                tracing::debug!(
                    operation = %class,
                    scope = ?credential.scope(),
                    origin = ?credential.origin(),
                    caller = ctx.caller_or_anonymous(),
                    "resolved credential"
                );
                Ok(credential)
            }
            None => {
                tracing::warn!(
                    operation = %class,
                    caller = ctx.caller_or_anonymous(),
                    "no credential available"
                );
                Err(CredentialError::NoCredentialAvailable(class))
            }
        }
    }

    pub fn has_service_token(&self) -> bool {
        self.service_token.is_some()
    }

    pub fn has_fallback_token(&self) -> bool {
        self.fallback_token.is_some()
    }
}

impl fmt::Debug for CredentialSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialSelector")
            .field("service_token", &self.service_token.is_some())
            .field("fallback_token", &self.fallback_token.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selector(service: Option<&str>, fallback: Option<&str>) -> CredentialSelector {
        CredentialSelector::new(
            service.map(str::to_string),
            fallback.map(str::to_string),
            Environment::Local,
        )
    }

    fn contexts() -> Vec<RequestContext> {
        vec![
            RequestContext::anonymous(),
            RequestContext::with_token("user-token"),
            RequestContext::new(Some("user-token".into()), Some("ana@example.com".into())),
            RequestContext::new(None, Some("ana@example.com".into())),
        ]
    }

    #[test]
    fn user_data_access_prefers_forwarded_token() {
        let sel = selector(Some("svc"), Some("dev"));
        let cred = sel
            .resolve(
                OperationClass::UserDataAccess,
                &RequestContext::with_token("user-token"),
            )
            .unwrap();
        assert_eq!(cred.token(), "user-token");
        assert_eq!(cred.scope(), CredentialScope::UserDelegated);
        assert_eq!(cred.origin(), CredentialOrigin::CallerForwarded);
    }

    #[test]
    fn user_data_access_falls_back_to_static_token() {
        let sel = selector(Some("svc"), Some("dev"));
        let cred = sel
            .resolve(OperationClass::UserDataAccess, &RequestContext::anonymous())
            .unwrap();
        assert_eq!(cred.token(), "dev");
        assert_eq!(cred.origin(), CredentialOrigin::StaticFallback);
    }

    #[test]
    fn user_data_access_without_fallback_fails() {
        let sel = selector(Some("svc"), None);
        let err = sel
            .resolve(OperationClass::UserDataAccess, &RequestContext::anonymous())
            .unwrap_err();
        assert_eq!(
            err,
            CredentialError::NoCredentialAvailable(OperationClass::UserDataAccess)
        );
    }

    #[test]
    fn ai_query_follows_user_policy() {
        let sel = selector(None, Some("dev"));
        let with_caller = sel
            .resolve(OperationClass::UserAIQuery, &RequestContext::with_token("u"))
            .unwrap();
        assert_eq!(with_caller.token(), "u");
        let without = sel
            .resolve(OperationClass::UserAIQuery, &RequestContext::anonymous())
            .unwrap();
        assert_eq!(without.token(), "dev");
    }

    #[test]
    fn privileged_trigger_never_returns_caller_token() {
        let sel = selector(Some("svc"), Some("dev"));
        for ctx in contexts() {
            let cred = sel
                .resolve(OperationClass::PrivilegedJobTrigger, &ctx)
                .unwrap();
            assert_eq!(cred.token(), "svc");
            assert_eq!(cred.scope(), CredentialScope::ServicePrincipal);
            assert_ne!(Some(cred.token()), ctx.forwarded_token());
        }
    }

    #[test]
    fn privileged_trigger_fails_closed() {
        let sel = selector(None, Some("dev"));
        for ctx in contexts() {
            let err = sel
                .resolve(OperationClass::PrivilegedJobTrigger, &ctx)
                .unwrap_err();
            assert_eq!(
                err,
                CredentialError::NoCredentialAvailable(OperationClass::PrivilegedJobTrigger)
            );
        }
    }

    #[test]
    fn storage_persist_has_no_fallback() {
        let sel = selector(Some("svc"), Some("dev"));
        assert!(sel
            .resolve(OperationClass::UserStoragePersist, &RequestContext::anonymous())
            .is_err());
        let cred = sel
            .resolve(
                OperationClass::UserStoragePersist,
                &RequestContext::with_token("oauth"),
            )
            .unwrap();
        assert_eq!(cred.token(), "oauth");
        assert_eq!(cred.origin(), CredentialOrigin::CallerOAuth);
    }

    #[test]
    fn deployed_environment_ignores_fallback() {
        let sel = CredentialSelector::new(
            Some("svc".into()),
            Some("dev".into()),
            Environment::Deployed,
        );
        assert!(!sel.has_fallback_token());
        let err = sel
            .resolve(OperationClass::UserDataAccess, &RequestContext::anonymous())
            .unwrap_err();
        assert_eq!(
            err,
            CredentialError::NoCredentialAvailable(OperationClass::UserDataAccess)
        );
    }

    #[test]
    fn blank_tokens_count_as_absent() {
        let sel = selector(Some("  "), Some(""));
        assert!(!sel.has_service_token());
        assert!(!sel.has_fallback_token());
        let ctx = RequestContext::new(Some(" ".into()), None);
        assert_eq!(ctx.forwarded_token(), None);
    }

    #[test]
    fn debug_output_redacts_tokens() {
        let cred = Credential::new(
            "secret-value",
            CredentialScope::UserDelegated,
            CredentialOrigin::CallerForwarded,
        );
        let rendered = format!("{:?}", cred);
        assert!(!rendered.contains("secret-value"));
        let ctx = RequestContext::with_token("secret-value");
        assert!(!format!("{:?}", ctx).contains("secret-value"));
    }

    #[test]
    fn policy_table_is_fixed() {
        for class in OperationClass::ALL {
            let policy = class.policy();
            match class {
                OperationClass::PrivilegedJobTrigger => {
                    assert_eq!(policy.primary, PrimarySource::ServicePrincipal);
                    assert!(!policy.static_fallback);
                }
                OperationClass::UserStoragePersist => {
                    assert_eq!(policy.primary, PrimarySource::Caller);
                    assert!(!policy.static_fallback);
                }
                _ => {
                    assert_eq!(policy.primary, PrimarySource::Caller);
                    assert!(policy.static_fallback);
                }
            }
        }
    }
}
