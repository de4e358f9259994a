use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use flowaudit_core::config::{DEFAULT_QUERY_COMMAND, DEFAULT_TEMPLATE_DIR};
use flowaudit_core::{
    command_prefix, export_actions_csv, extract_solution, summary_table, verify_azure_cli,
    write_markdown, ActionLogSource, AnalysisBatch, AnalysisConfig, AnalysisOrchestrator,
    AuthMode, AuthSessionEnsurer, AuthSettings, AzureCliTokenProvider, ChainedTokenProvider,
    FailurePolicy, PacAuthenticator, ProcessRunner, QueryTemplateExecutor, SessionLogClient,
    StaticTokenProvider,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Audit exported automation solutions against their latest recorded runs"
)]
struct FlowauditCli {
    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Analyse every desktop flow of a solution and write a Markdown report
    Analyze(AnalyzeArgs),
    /// Export the action log of one flow session as CSV
    Logs {
        /// Environment base URL, e.g. https://org.crm.dynamics.com
        #[arg(long, env = "FLOWAUDIT_ENVIRONMENT_URL")]
        environment_url: String,
        /// Flow session id to export
        #[arg(long)]
        flow_session_id: String,
        /// Directory receiving the CSV file
        #[arg(long, env = "FLOWAUDIT_EXPORT_PATH")]
        export_path: PathBuf,
        /// Bearer token for the Web API; the Azure CLI is used when absent
        #[arg(long, env = "FLOWAUDIT_ACCESS_TOKEN", hide_env_values = true)]
        access_token: Option<String>,
        /// Web API request timeout in seconds
        #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
        timeout_secs: u64,
    },
}

#[derive(Debug, Args)]
struct AnalyzeArgs {
    /// Environment base URL, e.g. https://org.crm.dynamics.com
    #[arg(long, env = "FLOWAUDIT_ENVIRONMENT_URL")]
    environment_url: String,
    /// Auth profile name used by the query tool
    #[arg(long, env = "FLOWAUDIT_ENVIRONMENT_NAME")]
    environment_name: String,
    /// Application (client) id for the auth profile
    #[arg(long, env = "FLOWAUDIT_APPLICATION_ID")]
    application_id: Option<String>,
    /// Tenant id for federated auth profiles
    #[arg(long, env = "FLOWAUDIT_TENANT_ID")]
    tenant_id: Option<String>,
    /// How the query tool authenticates
    #[arg(long, default_value_t = AuthModeArg::Standard, env = "FLOWAUDIT_AUTH_MODE")]
    auth_mode: AuthModeArg,
    /// Exported solution archive
    #[arg(long)]
    solution_zip: PathBuf,
    /// Where the Markdown report is written
    #[arg(long)]
    output_markdown: PathBuf,
    /// Directory receiving one CSV of actions per flow
    #[arg(long, env = "FLOWAUDIT_EXPORT_PATH")]
    export_path: Option<PathBuf>,
    /// Directory holding the last_run.xml and logs.xml query templates
    #[arg(long, default_value = DEFAULT_TEMPLATE_DIR, env = "FLOWAUDIT_TEMPLATE_DIR")]
    template_dir: PathBuf,
    /// Query tool invocation, e.g. "dotnet pac"
    #[arg(long, default_value = DEFAULT_QUERY_COMMAND, env = "FLOWAUDIT_QUERY_COMMAND")]
    query_command: String,
    /// Connection reference prefix; defaults to the solution publisher prefix
    #[arg(long)]
    prefix: Option<String>,
    /// Web API request timeout in seconds
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,
    /// Skip flows that fail instead of stopping the analysis
    #[arg(long)]
    keep_going: bool,
    /// Bearer token for the Web API; the Azure CLI is used when absent
    #[arg(long, env = "FLOWAUDIT_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,
    /// Output JSON instead of a human-readable summary
    #[arg(long)]
    json: bool,
    /// Extract the solution here instead of a temporary directory
    #[arg(long)]
    extract_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum AuthModeArg {
    Standard,
    Federated,
}

impl From<AuthModeArg> for AuthMode {
    fn from(value: AuthModeArg) -> Self {
        match value {
            AuthModeArg::Standard => AuthMode::Standard,
            AuthModeArg::Federated => AuthMode::Federated,
        }
    }
}

impl std::fmt::Display for AuthModeArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(AuthMode::from(*self).as_str())
    }
}

fn main() -> ExitCode {
    let cli = FlowauditCli::parse();
    init_tracing(cli.verbose);

    let outcome = match cli.command {
        Command::Analyze(args) => analyze(args),
        Command::Logs {
            environment_url,
            flow_session_id,
            export_path,
            access_token,
            timeout_secs,
        } => export_logs(
            environment_url,
            &flow_session_id,
            &export_path,
            access_token,
            Duration::from_secs(timeout_secs),
        ),
    };

    match outcome {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(2)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn analyze(args: AnalyzeArgs) -> anyhow::Result<ExitCode> {
    let auth = AuthSettings {
        environment_name: args.environment_name,
        mode: args.auth_mode.into(),
        application_id: args.application_id,
        tenant_id: args.tenant_id,
    };
    auth.validate()?;

    let mut config = AnalysisConfig::new(args.environment_url);
    config.query_command = args.query_command;
    config.template_dir = args.template_dir;
    config.request_timeout = Duration::from_secs(args.timeout_secs);
    config.prefix = args.prefix;
    config.failure_policy = if args.keep_going {
        FailurePolicy::Skip
    } else {
        FailurePolicy::Halt
    };
    config.validate()?;

    let command = command_prefix(&config.query_command)?;
    PacAuthenticator::new(ProcessRunner, command.clone())
        .ensure_authenticated(
            &auth.environment_name,
            auth.mode,
            auth.application_id.as_deref(),
            auth.tenant_id.as_deref(),
        )
        .context("failed to prepare the query tool auth profile")?;
    let tokens = token_chain(args.access_token)?;

    let (extract_to, _scratch) = match args.extract_dir {
        Some(dir) => (dir, None),
        None => {
            let dir = tempfile::tempdir().context("failed to create extraction directory")?;
            (dir.path().to_path_buf(), Some(dir))
        }
    };
    let layout = extract_solution(&args.solution_zip, &extract_to)?;

    let queries = QueryTemplateExecutor::new(
        ProcessRunner,
        command,
        config.environment_url.clone(),
        config.template_dir.clone(),
    );
    let logs = SessionLogClient::new(config.environment_url.clone(), tokens)
        .with_timeout(config.request_timeout);
    let batch = AnalysisOrchestrator::new(layout, queries, logs)
        .with_prefix(config.prefix.clone())?
        .with_failure_policy(config.failure_policy)
        .run()?;

    write_markdown(&args.output_markdown, &batch.results)?;
    if let Some(dir) = &args.export_path {
        for result in &batch.results {
            export_actions_csv(&result.actions, dir, &result.workflow_name)?;
        }
    }
    output_batch(&batch, args.json)?;

    let has_issues = batch.has_issues();
    info!(has_issues, "analysis finished");
    Ok(if has_issues {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    })
}

fn export_logs(
    environment_url: String,
    flow_session_id: &str,
    export_path: &Path,
    access_token: Option<String>,
    timeout: Duration,
) -> anyhow::Result<ExitCode> {
    let tokens = token_chain(access_token)?;
    let client = SessionLogClient::new(environment_url, tokens).with_timeout(timeout);
    let actions = client
        .get_action_log(flow_session_id)
        .with_context(|| format!("failed to retrieve the action log of {flow_session_id}"))?;

    match export_actions_csv(&actions, export_path, flow_session_id)? {
        Some(path) => println!("Exported {} actions to {}", actions.len(), path.display()),
        None => println!("Session {flow_session_id} has no actions to export"),
    }
    Ok(ExitCode::SUCCESS)
}

/// A given token wins; otherwise the signed-in Azure CLI account is used.
fn token_chain(access_token: Option<String>) -> anyhow::Result<ChainedTokenProvider> {
    let chain = match access_token {
        Some(token) => {
            ChainedTokenProvider::new().with("access token", StaticTokenProvider::new(token))
        }
        None => {
            verify_azure_cli(&ProcessRunner)?;
            ChainedTokenProvider::new()
        }
    };
    Ok(chain.with("azure cli", AzureCliTokenProvider::new(ProcessRunner)))
}

fn output_batch(batch: &AnalysisBatch, json: bool) -> anyhow::Result<()> {
    if json {
        let payload = json!({
            "results": batch.results,
            "skipped": batch.skipped,
            "has_issues": batch.has_issues(),
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    for result in &batch.results {
        println!("{result}");
    }
    if !batch.results.is_empty() {
        println!("{}", summary_table(&batch.results));
    }
    if !batch.skipped.is_empty() {
        println!("\nSkipped flows:");
        for skipped in &batch.skipped {
            println!("  - {}: {}", skipped.name, skipped.reason);
        }
    }
    if batch.has_issues() {
        println!("\n[warn] issues found");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        FlowauditCli::command().debug_assert();
    }

    #[test]
    fn analyze_applies_defaults() {
        let cli = FlowauditCli::try_parse_from([
            "flowaudit",
            "analyze",
            "--environment-url",
            "https://org.example.com",
            "--environment-name",
            "Contoso-Dev",
            "--solution-zip",
            "solution.zip",
            "--output-markdown",
            "report.md",
        ])
        .expect("parse");
        let Command::Analyze(args) = cli.command else {
            panic!("expected analyze");
        };
        assert_eq!(args.auth_mode, AuthModeArg::Standard);
        assert_eq!(args.query_command, "pac");
        assert_eq!(args.template_dir, PathBuf::from("templates"));
        assert_eq!(args.timeout_secs, 30);
        assert!(!args.keep_going);
    }

    #[test]
    fn logs_rejects_zero_timeout() {
        let parsed = FlowauditCli::try_parse_from([
            "flowaudit",
            "logs",
            "--environment-url",
            "u",
            "--flow-session-id",
            "s",
            "--export-path",
            "out",
            "--timeout-secs",
            "0",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn auth_mode_parses_lowercase_names() {
        let cli = FlowauditCli::try_parse_from([
            "flowaudit",
            "-v",
            "analyze",
            "--environment-url",
            "u",
            "--environment-name",
            "n",
            "--auth-mode",
            "federated",
            "--solution-zip",
            "s.zip",
            "--output-markdown",
            "r.md",
        ])
        .expect("parse");
        assert!(cli.verbose);
        let Command::Analyze(args) = cli.command else {
            panic!("expected analyze");
        };
        assert_eq!(AuthMode::from(args.auth_mode), AuthMode::Federated);
    }
}
