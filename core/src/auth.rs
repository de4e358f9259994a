//! Credentials for the Web API and authentication profiles for the query tool.

use crate::error::AuditError;
use crate::runner::QueryRunner;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

pub trait TokenProvider {
    fn get_token(&self, resource_url: &str) -> Result<String, AuditError>;
}

impl<T: TokenProvider + ?Sized> TokenProvider for &T {
    fn get_token(&self, resource_url: &str) -> Result<String, AuditError> {
        (**self).get_token(resource_url)
    }
}

impl<T: TokenProvider + ?Sized> TokenProvider for Box<T> {
    fn get_token(&self, resource_url: &str) -> Result<String, AuditError> {
        (**self).get_token(resource_url)
    }
}

/// A token handed over by the caller, e.g. from a pipeline variable.
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl fmt::Debug for StaticTokenProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticTokenProvider")
            .field("token", &"***")
            .finish()
    }
}

impl TokenProvider for StaticTokenProvider {
    fn get_token(&self, _resource_url: &str) -> Result<String, AuditError> {
        if self.token.trim().is_empty() {
            return Err(AuditError::AuthenticationUnavailable(
                "provided access token is empty".to_string(),
            ));
        }
        Ok(self.token.clone())
    }
}

#[derive(Debug, Clone)]
pub struct AzureCliTokenProvider<R> {
    runner: R,
}

impl<R: QueryRunner> AzureCliTokenProvider<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }
}

impl<R: QueryRunner> TokenProvider for AzureCliTokenProvider<R> {
    fn get_token(&self, resource_url: &str) -> Result<String, AuditError> {
        let argv: Vec<String> = [
            "az",
            "account",
            "get-access-token",
            "--resource",
            resource_url,
            "--query",
            "accessToken",
            "--output",
            "tsv",
        ]
        .iter()
        .map(|s| (*s).to_string())
        .collect();
        let token = self.runner.execute(&argv)?.trim().to_string();
        if token.is_empty() {
            return Err(AuditError::AuthenticationUnavailable(
                "az returned an empty access token".to_string(),
            ));
        }
        Ok(token)
    }
}

/// Tries each provider in order and returns the first token obtained.
#[derive(Default)]
pub struct ChainedTokenProvider {
    providers: Vec<(String, Box<dyn TokenProvider>)>,
}

impl ChainedTokenProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, label: impl Into<String>, provider: impl TokenProvider + 'static) -> Self {
        self.providers.push((label.into(), Box::new(provider)));
        self
    }
}

impl TokenProvider for ChainedTokenProvider {
    fn get_token(&self, resource_url: &str) -> Result<String, AuditError> {
        let mut failures = Vec::new();
        for (label, provider) in &self.providers {
            match provider.get_token(resource_url) {
                Ok(token) => {
                    info!(source = %label, "access token obtained");
                    return Ok(token);
                }
                Err(err) => {
                    warn!(source = %label, "failed to obtain access token: {err}");
                    failures.push(format!("{label}: {err}"));
                }
            }
        }
        if failures.is_empty() {
            failures.push("no credential source configured".to_string());
        }
        Err(AuditError::AuthenticationUnavailable(failures.join("; ")))
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    #[default]
    Standard,
    Federated,
}

impl AuthMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthMode::Standard => "standard",
            AuthMode::Federated => "federated",
        }
    }
}

pub trait AuthSessionEnsurer {
    fn ensure_authenticated(
        &self,
        target_environment: &str,
        mode: AuthMode,
        application_id: Option<&str>,
        tenant_id: Option<&str>,
    ) -> Result<(), AuditError>;
}

/// Manages `pac auth` profiles. Already-authenticated targets are left untouched.
#[derive(Debug, Clone)]
pub struct PacAuthenticator<R> {
    runner: R,
    command: Vec<String>,
}

impl<R: QueryRunner> PacAuthenticator<R> {
    pub fn new(runner: R, command: Vec<String>) -> Self {
        Self { runner, command }
    }

    fn argv(&self, args: &[&str]) -> Vec<String> {
        self.command
            .iter()
            .cloned()
            .chain(args.iter().map(|s| (*s).to_string()))
            .collect()
    }
}

impl<R: QueryRunner> AuthSessionEnsurer for PacAuthenticator<R> {
    fn ensure_authenticated(
        &self,
        target_environment: &str,
        mode: AuthMode,
        application_id: Option<&str>,
        tenant_id: Option<&str>,
    ) -> Result<(), AuditError> {
        let current = self
            .runner
            .execute(&self.argv(&["auth", "who"]))
            .unwrap_or_default();
        if !target_environment.is_empty() && current.contains(target_environment) {
            debug!(environment = target_environment, "already authenticated");
            return Ok(());
        }

        let create = match mode {
            AuthMode::Standard => self.argv(&["auth", "create", "--name", target_environment]),
            AuthMode::Federated => {
                let (Some(application_id), Some(tenant_id)) = (application_id, tenant_id) else {
                    return Err(AuditError::InvalidAuthConfig(
                        "federated authentication requires an application id and a tenant id"
                            .to_string(),
                    ));
                };
                self.argv(&[
                    "auth",
                    "create",
                    "--name",
                    target_environment,
                    "--applicationId",
                    application_id,
                    "--tenant",
                    tenant_id,
                    "--azureDevOpsFederated",
                ])
            }
        };
        debug!(environment = target_environment, mode = mode.as_str(), "creating auth profile");
        self.runner.execute(&create)?;

        if let Err(err) = self
            .runner
            .execute(&self.argv(&["auth", "select", "--name", target_environment]))
        {
            warn!(environment = target_environment, "failed to select auth profile: {err}");
        }
        info!(environment = target_environment, "auth profile ready");
        Ok(())
    }
}

pub fn verify_azure_cli<R: QueryRunner>(runner: &R) -> Result<(), AuditError> {
    let argv: Vec<String> = ["az", "account", "show"]
        .iter()
        .map(|s| (*s).to_string())
        .collect();
    runner.execute(&argv).map(|_| ()).map_err(|err| match err {
        AuditError::ExecutableNotFound(_) | AuditError::CommandFailed { .. } => {
            AuditError::AuthenticationUnavailable(format!("Azure CLI is not signed in: {err}"))
        }
        other => other,
    })
}
