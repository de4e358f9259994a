pub mod archive;
pub mod auth;
pub mod config;
pub mod error;
pub mod manifest;
mod markup;
pub mod model;
pub mod pipeline;
pub mod query;
pub mod report;
pub mod rules;
pub mod runner;
pub mod session_log;

pub use archive::{extract_solution, SolutionLayout};
pub use auth::{
    verify_azure_cli, AuthMode, AuthSessionEnsurer, AzureCliTokenProvider, ChainedTokenProvider,
    PacAuthenticator, StaticTokenProvider, TokenProvider,
};
pub use config::{AnalysisConfig, AuthSettings, FailurePolicy};
pub use error::AuditError;
pub use manifest::{check_structure, discover_workflows, publisher_prefix, ManifestFacts};
pub use model::{
    ActionLogEntry, AnalysisBatch, AnalysisResult, FlowRun, RunRecord, SkippedWorkflow,
    WorkflowCategory, WorkflowDefinition,
};
pub use pipeline::AnalysisOrchestrator;
pub use query::{parse_runs, QueryTemplateExecutor};
pub use report::{export_actions_csv, render_markdown, summary_table, write_markdown};
pub use rules::{analyze_issues, Issue, IssueCategory, IssueGroup, ValidationOutcome};
pub use runner::{command_prefix, ProcessRunner, QueryRunner};
pub use session_log::{ActionLogSource, SessionLogClient};
