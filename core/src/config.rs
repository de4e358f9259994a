use crate::auth::AuthMode;
use crate::error::AuditError;
use crate::session_log::DEFAULT_TIMEOUT;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_QUERY_COMMAND: &str = "pac";
pub const DEFAULT_TEMPLATE_DIR: &str = "templates";

/// What to do when one workflow cannot be processed.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Stop the batch and return the error.
    #[default]
    Halt,
    /// Record the workflow as skipped and continue with the next one.
    Skip,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    pub environment_url: String,
    pub query_command: String,
    pub template_dir: PathBuf,
    #[serde(with = "seconds")]
    pub request_timeout: Duration,
    /// Overrides the publisher prefix read from `solution.xml`.
    pub prefix: Option<String>,
    pub failure_policy: FailurePolicy,
}

impl AnalysisConfig {
    pub fn new(environment_url: impl Into<String>) -> Self {
        Self {
            environment_url: environment_url.into(),
            query_command: DEFAULT_QUERY_COMMAND.to_string(),
            template_dir: PathBuf::from(DEFAULT_TEMPLATE_DIR),
            request_timeout: DEFAULT_TIMEOUT,
            prefix: None,
            failure_policy: FailurePolicy::Halt,
        }
    }

    pub fn validate(&self) -> Result<(), AuditError> {
        if self.environment_url.trim().is_empty() {
            return Err(AuditError::InvalidAuthConfig(
                "environment url cannot be empty".to_string(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(AuditError::InvalidAuthConfig(
                "request timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSettings {
    pub environment_name: String,
    pub mode: AuthMode,
    pub application_id: Option<String>,
    pub tenant_id: Option<String>,
}

impl AuthSettings {
    /// Standard profiles need an application id; federated ones also need a tenant.
    pub fn validate(&self) -> Result<(), AuditError> {
        if self.environment_name.trim().is_empty() {
            return Err(AuditError::InvalidAuthConfig(
                "environment name cannot be empty".to_string(),
            ));
        }
        match self.mode {
            AuthMode::Standard if self.application_id.is_none() => {
                Err(AuditError::InvalidAuthConfig(
                    "--application-id is required with auth mode 'standard'".to_string(),
                ))
            }
            AuthMode::Federated if self.application_id.is_none() || self.tenant_id.is_none() => {
                Err(AuditError::InvalidAuthConfig(
                    "auth mode 'federated' requires --application-id and --tenant-id".to_string(),
                ))
            }
            _ => Ok(()),
        }
    }
}

mod seconds {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
