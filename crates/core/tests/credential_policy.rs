//! Credential policy properties across configurations and request contexts.

use dqstudio_core::{
    CredentialError, CredentialOrigin, CredentialScope, CredentialSelector, Environment,
    OperationClass, RequestContext, StudioConfig, StudioError,
};

fn contexts() -> Vec<RequestContext> {
    let mut out = vec![RequestContext::anonymous()];
    for token in ["t1", "eyJhbGciOi.user", "svc"] {
        out.push(RequestContext::with_token(token));
        out.push(RequestContext::new(
            Some(token.to_string()),
            Some("analyst@example.com".to_string()),
        ));
    }
    out
}

fn selectors() -> Vec<CredentialSelector> {
    let mut out = Vec::new();
    for service in [None, Some("svc")] {
        for fallback in [None, Some("dev")] {
            for env in [Environment::Local, Environment::Deployed] {
                out.push(CredentialSelector::new(
                    service.map(str::to_string),
                    fallback.map(str::to_string),
                    env,
                ));
            }
        }
    }
    out
}

#[test]
fn privileged_trigger_is_always_service_scoped() {
    for selector in selectors() {
        for ctx in contexts() {
            match selector.resolve(OperationClass::PrivilegedJobTrigger, &ctx) {
                Ok(cred) => {
                    assert_eq!(cred.scope(), CredentialScope::ServicePrincipal);
                    assert_eq!(cred.origin(), CredentialOrigin::ServicePrincipal);
                    assert!(selector.has_service_token());
                }
                Err(err) => {
                    assert!(!selector.has_service_token());
                    assert_eq!(
                        err,
                        CredentialError::NoCredentialAvailable(
                            OperationClass::PrivilegedJobTrigger
                        )
                    );
                }
            }
        }
    }
}

#[test]
fn caller_token_wins_for_user_classes() {
    for selector in selectors() {
        for ctx in contexts() {
            let Some(token) = ctx.forwarded_token() else {
                continue;
            };
            for class in [
                OperationClass::UserDataAccess,
                OperationClass::UserAIQuery,
                OperationClass::UserStoragePersist,
            ] {
                let cred = selector.resolve(class, &ctx).unwrap();
                assert_eq!(cred.token(), token);
                assert_eq!(cred.scope(), CredentialScope::UserDelegated);
            }
        }
    }
}

#[test]
fn selector_built_from_config_respects_environment() {
    let config = StudioConfig::from_toml_str(
        r#"
[workspace]
host = "https://example.cloud.databricks.com"
environment = "deployed"

[credentials]
service_token = "svc"
fallback_token = "dev"
"#,
    )
    .unwrap();
    let selector = CredentialSelector::from_config(&config);
    let err: StudioError = selector
        .resolve(OperationClass::UserDataAccess, &RequestContext::anonymous())
        .unwrap_err()
        .into();
    assert_eq!(
        err,
        StudioError::NoCredentialAvailable {
            operation: "user_data_access".to_string()
        }
    );
}

#[test]
fn config_without_environment_never_uses_fallback() {
    let config = StudioConfig::from_toml_str(
        r#"
[workspace]
host = "https://example.cloud.databricks.com"

[credentials]
service_token = "svc"
fallback_token = "shared-dev"
"#,
    )
    .unwrap();
    assert_eq!(config.workspace.environment, Environment::Deployed);

    let selector = CredentialSelector::from_config(&config);
    assert!(!selector.has_fallback_token());
    for class in [OperationClass::UserDataAccess, OperationClass::UserAIQuery] {
        let err: StudioError = selector
            .resolve(class, &RequestContext::anonymous())
            .unwrap_err()
            .into();
        assert!(matches!(err, StudioError::NoCredentialAvailable { .. }), "{err:?}");
    }
}

#[test]
fn explicit_local_environment_enables_fallback() {
    let config = StudioConfig::from_toml_str(
        r#"
[workspace]
environment = "local"

[credentials]
fallback_token = "shared-dev"
"#,
    )
    .unwrap();
    let cred = CredentialSelector::from_config(&config)
        .resolve(OperationClass::UserDataAccess, &RequestContext::anonymous())
        .unwrap();
    assert_eq!(cred.token(), "shared-dev");
    assert_eq!(cred.origin(), CredentialOrigin::StaticFallback);
}
