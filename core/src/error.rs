use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("manifest not found: {0}")]
    ManifestNotFound(PathBuf),
    #[error("manifest {path} is malformed: {reason}")]
    ManifestMalformed { path: PathBuf, reason: String },
    #[error("query template not found: {0}")]
    TemplateNotFound(PathBuf),
    #[error("query template {path} is malformed: {reason}")]
    TemplateMalformed { path: PathBuf, reason: String },
    #[error("executable '{0}' not found on PATH")]
    ExecutableNotFound(String),
    #[error("command '{program}' exited with code {code:?}: {stderr}")]
    CommandFailed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("action log request to {endpoint} failed with status {status}")]
    LogRetrievalFailed { status: u16, endpoint: String },
    #[error("request to {endpoint} failed: {reason}")]
    Transport { endpoint: String, reason: String },
    #[error("no credential source succeeded: {0}")]
    AuthenticationUnavailable(String),
    #[error("invalid authentication settings: {0}")]
    InvalidAuthConfig(String),
    #[error("no run found for workflow '{0}'")]
    NoRunFound(String),
    #[error("solution archive {path} could not be extracted: {reason}")]
    Archive { path: PathBuf, reason: String },
    #[error("failed to export {path}: {reason}")]
    Export { path: PathBuf, reason: String },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl AuditError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// True for failures that only concern the workflow being processed.
    pub fn is_workflow_scoped(&self) -> bool {
        matches!(
            self,
            Self::TemplateNotFound(_)
                | Self::TemplateMalformed { .. }
                | Self::CommandFailed { .. }
                | Self::NoRunFound(_)
                | Self::LogRetrievalFailed { .. }
                | Self::Transport { .. }
        )
    }
}
