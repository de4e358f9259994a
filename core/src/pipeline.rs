use crate::archive::SolutionLayout;
use crate::config::FailurePolicy;
use crate::error::AuditError;
use crate::manifest;
use crate::model::{AnalysisBatch, AnalysisResult, FlowRun, SkippedWorkflow, WorkflowDefinition};
use crate::query::{
    parameters, parse_runs, QueryTemplateExecutor, FLOW_NAME_PARAM, LAST_RUN_TEMPLATE,
    LOGS_TEMPLATE, SESSION_ID_PARAM,
};
use crate::rules::analyze_issues;
use crate::runner::QueryRunner;
use crate::session_log::ActionLogSource;
use tracing::{debug, info, warn};

/// Drives discovery, data collection and validation for every desktop flow of
/// one extracted solution. Workflows are processed one after another.
pub struct AnalysisOrchestrator<R, L> {
    layout: SolutionLayout,
    queries: QueryTemplateExecutor<R>,
    logs: L,
    prefix: String,
    policy: FailurePolicy,
}

impl<R: QueryRunner, L: ActionLogSource> AnalysisOrchestrator<R, L> {
    pub fn new(layout: SolutionLayout, queries: QueryTemplateExecutor<R>, logs: L) -> Self {
        Self {
            layout,
            queries,
            logs,
            prefix: String::new(),
            policy: FailurePolicy::Halt,
        }
    }

    /// Uses `prefix` when given, otherwise the publisher prefix of `solution.xml`.
    pub fn with_prefix(mut self, prefix: Option<String>) -> Result<Self, AuditError> {
        self.prefix = match prefix {
            Some(prefix) => prefix,
            None => manifest::publisher_prefix(&self.layout.solution_path())?.unwrap_or_default(),
        };
        debug!(prefix = %self.prefix, "connection reference prefix");
        Ok(self)
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn discover(&self) -> Result<Vec<WorkflowDefinition>, AuditError> {
        manifest::discover_workflows(&self.layout.manifest_path())
    }

    /// The first parsed run is taken as the latest; `last_run` sorts newest first.
    pub fn collect(&self, flow_name: &str) -> Result<FlowRun, AuditError> {
        let raw_last = self
            .queries
            .fetch(LAST_RUN_TEMPLATE, &parameters([(FLOW_NAME_PARAM, flow_name)]))?;
        let runs = parse_runs(&raw_last);
        if runs.len() > 1 {
            debug!(flow = flow_name, runs = runs.len(), "several runs returned, using the first");
        }
        let run = runs
            .into_iter()
            .next()
            .ok_or_else(|| AuditError::NoRunFound(flow_name.to_string()))?;
        info!(flow = flow_name, session = %run.session_id, "latest run found");

        let raw_logs = self.queries.fetch(
            LOGS_TEMPLATE,
            &parameters([
                (FLOW_NAME_PARAM, flow_name),
                (SESSION_ID_PARAM, run.session_id.as_str()),
            ]),
        )?;
        let raw_log_lines = raw_logs.lines().map(str::to_string).collect();

        let actions = self.logs.get_action_log(&run.session_id)?;
        debug!(flow = flow_name, actions = actions.len(), "action log retrieved");

        Ok(FlowRun {
            workflow_name: flow_name.to_string(),
            run,
            raw_log_lines,
            actions,
        })
    }

    pub fn analyze_workflow(&self, flow_name: &str) -> Result<AnalysisResult, AuditError> {
        let flow = self.collect(flow_name)?;
        let outcome = analyze_issues(
            &flow.raw_log_lines,
            &flow.actions,
            &self.layout.manifest_path(),
            &self.prefix,
        )?;
        Ok(AnalysisResult::new(flow, outcome))
    }

    pub fn run(&self) -> Result<AnalysisBatch, AuditError> {
        let workflows = self.discover()?;
        info!(count = workflows.len(), "processing desktop flows");

        let mut batch = AnalysisBatch::default();
        for workflow in workflows {
            info!(flow = %workflow.name, "processing desktop flow");
            match self.analyze_workflow(&workflow.name) {
                Ok(result) => batch.results.push(result),
                Err(err) if self.policy == FailurePolicy::Skip && err.is_workflow_scoped() => {
                    warn!(flow = %workflow.name, "skipping desktop flow: {err}");
                    batch.skipped.push(SkippedWorkflow {
                        name: workflow.name,
                        reason: err.to_string(),
                    });
                }
                Err(err) => return Err(err),
            }
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ENVIRONMENT_VARIABLES_DIR;
    use crate::model::ActionLogEntry;
    use crate::rules::IssueCategory;
    use serde_json::json;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::fs;
    use tempfile::TempDir;

    const LAST_RUN: &str =
        r#"<fetch><entity name="flowsession"><condition attribute="name" value="" /></entity></fetch>"#;
    const LOGS: &str = r#"<fetch><entity name="flowsession"><condition attribute="name" value="" /><condition attribute="flowsessionid" value="" /></entity></fetch>"#;

    /// Answers `last_run` and `logs` queries per flow name found in the rendered template.
    #[derive(Default)]
    struct FakePac {
        last_run: HashMap<String, String>,
        logs: String,
        rendered: RefCell<Vec<String>>,
    }

    impl QueryRunner for FakePac {
        fn execute(&self, argv: &[String]) -> Result<String, AuditError> {
            let path = argv.last().expect("xml file argument");
            let rendered = fs::read_to_string(path).expect("rendered template");
            self.rendered.borrow_mut().push(rendered.clone());
            if rendered.contains("flowsessionid") {
                return Ok(self.logs.clone());
            }
            let flow = self
                .last_run
                .keys()
                .find(|name| rendered.contains(&format!(r#"value="{name}""#)));
            match flow {
                Some(name) => Ok(self.last_run[name].clone()),
                None => Err(AuditError::CommandFailed {
                    program: "pac".to_string(),
                    code: Some(1),
                    stderr: "unknown flow".to_string(),
                }),
            }
        }
    }

    struct FakeLogs {
        actions: Vec<ActionLogEntry>,
        requested: RefCell<Vec<String>>,
    }

    impl ActionLogSource for FakeLogs {
        fn get_action_log(&self, session_id: &str) -> Result<Vec<ActionLogEntry>, AuditError> {
            self.requested.borrow_mut().push(session_id.to_string());
            Ok(self.actions.clone())
        }
    }

    fn solution(workflows: &[(&str, u8)]) -> TempDir {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut manifest = String::from("<ImportExportXml><Workflows>");
        for (name, category) in workflows {
            manifest.push_str(&format!(
                r#"<Workflow Name="{name}"><Category>{category}</Category></Workflow>"#
            ));
        }
        manifest.push_str("</Workflows><workqueues><workqueue /></workqueues></ImportExportXml>");
        fs::write(dir.path().join("customizations.xml"), manifest).expect("manifest");
        fs::create_dir(dir.path().join(ENVIRONMENT_VARIABLES_DIR)).expect("env dir");
        fs::create_dir(dir.path().join("templates")).expect("template dir");
        fs::write(dir.path().join("templates/last_run.xml"), LAST_RUN).expect("last_run");
        fs::write(dir.path().join("templates/logs.xml"), LOGS).expect("logs");
        dir
    }

    fn actions(rows: Vec<serde_json::Value>) -> FakeLogs {
        FakeLogs {
            actions: rows
                .into_iter()
                .map(|row| serde_json::from_value(row).expect("row"))
                .collect(),
            requested: RefCell::new(Vec::new()),
        }
    }

    fn orchestrator<'a>(
        dir: &TempDir,
        pac: &'a FakePac,
        logs: &'a FakeLogs,
    ) -> AnalysisOrchestrator<&'a FakePac, &'a FakeLogs> {
        let queries = QueryTemplateExecutor::new(
            pac,
            vec!["pac".to_string()],
            "https://org.example.com",
            dir.path().join("templates"),
        );
        AnalysisOrchestrator::new(SolutionLayout::new(dir.path()), queries, logs)
            .with_prefix(None)
            .expect("prefix")
    }

    #[test]
    fn end_to_end_reports_subflow_and_cleanup_issues() {
        let dir = solution(&[("Invoice_Sync", 6), ("Notify_Finance", 5)]);
        let pac = FakePac {
            last_run: HashMap::from([(
                "Invoice_Sync".to_string(),
                "flowsessionid startedon\n3fa85f64-5717-4562-b3fc-2c963f66afa6 3/14/2024 2:30 PM"
                    .to_string(),
            )]),
            logs: "Succeeded\nfinished".to_string(),
            ..FakePac::default()
        };
        let logs = actions(vec![json!({
            "systemActionName": "RunSubflow",
            "functionName": "g_bad",
            "status": "Succeeded"
        })]);

        let batch = orchestrator(&dir, &pac, &logs).run().expect("run");
        assert!(batch.skipped.is_empty());
        assert_eq!(batch.results.len(), 1);

        let result = &batch.results[0];
        assert_eq!(result.workflow_name, "Invoice_Sync");
        assert_eq!(result.session_id, "3fa85f64-5717-4562-b3fc-2c963f66afa6");
        assert_eq!(result.started_at, "2024-03-14 14:30:00");
        assert_eq!(result.raw_log_lines, vec!["Succeeded", "finished"]);
        assert!(result.has_issues);
        assert_eq!(result.issue_count(), 2);

        let subflow = &result.issue_groups[0];
        assert_eq!(subflow.category(), IssueCategory::SubFlow);
        assert!(subflow.issues()[0].message.contains("'g_bad'"));
        let execution = &result.issue_groups[1];
        assert_eq!(execution.category(), IssueCategory::Execution);
        assert!(execution.issues()[0].message.contains("'Empty'"));

        assert_eq!(
            *logs.requested.borrow(),
            vec!["3fa85f64-5717-4562-b3fc-2c963f66afa6".to_string()]
        );
        let rendered = pac.rendered.borrow();
        assert!(rendered[1].contains(r#"value="3fa85f64-5717-4562-b3fc-2c963f66afa6""#));
    }

    #[test]
    fn first_parsed_run_is_used() {
        let dir = solution(&[("Invoice_Sync", 6)]);
        let pac = FakePac {
            last_run: HashMap::from([(
                "Invoice_Sync".to_string(),
                "aaaaaaaa-0000-0000-0000-000000000001 1/2/2024 8:00 AM\n\
                 aaaaaaaa-0000-0000-0000-000000000002 1/3/2024 8:00 AM"
                    .to_string(),
            )]),
            ..FakePac::default()
        };
        let logs = actions(vec![]);
        let flow = orchestrator(&dir, &pac, &logs)
            .collect("Invoice_Sync")
            .expect("collect");
        assert_eq!(flow.run.session_id, "aaaaaaaa-0000-0000-0000-000000000001");
    }

    #[test]
    fn missing_run_fails_fast() {
        let dir = solution(&[("Invoice_Sync", 6)]);
        let pac = FakePac {
            last_run: HashMap::from([("Invoice_Sync".to_string(), "no rows".to_string())]),
            ..FakePac::default()
        };
        let logs = actions(vec![]);
        let err = orchestrator(&dir, &pac, &logs).run().unwrap_err();
        assert!(matches!(err, AuditError::NoRunFound(name) if name == "Invoice_Sync"));
        assert!(logs.requested.borrow().is_empty());
    }

    #[test]
    fn skip_policy_continues_after_a_failed_workflow() {
        let dir = solution(&[("Broken", 6), ("Invoice_Sync", 6)]);
        let pac = FakePac {
            last_run: HashMap::from([(
                "Invoice_Sync".to_string(),
                "3fa85f64-5717-4562-b3fc-2c963f66afa6 3/14/2024 2:30 PM".to_string(),
            )]),
            ..FakePac::default()
        };
        let logs = actions(vec![json!({ "systemActionName": "Empty" })]);
        let batch = orchestrator(&dir, &pac, &logs)
            .with_failure_policy(FailurePolicy::Skip)
            .run()
            .expect("run");
        assert_eq!(batch.results.len(), 1);
        assert_eq!(batch.skipped.len(), 1);
        assert_eq!(batch.skipped[0].name, "Broken");
        assert!(batch.skipped[0].reason.contains("unknown flow"));
    }

    #[test]
    fn halt_policy_stops_the_batch() {
        let dir = solution(&[("Broken", 6), ("Invoice_Sync", 6)]);
        let pac = FakePac::default();
        let logs = actions(vec![]);
        let err = orchestrator(&dir, &pac, &logs).run().unwrap_err();
        assert!(matches!(err, AuditError::CommandFailed { .. }));
    }

    #[test]
    fn prefix_comes_from_publisher_unless_overridden() {
        let dir = solution(&[("Invoice_Sync", 6)]);
        fs::write(
            dir.path().join("solution.xml"),
            "<ImportExportXml><Publisher><CustomizationPrefix>cab</CustomizationPrefix></Publisher></ImportExportXml>",
        )
        .expect("solution.xml");
        let pac = FakePac::default();
        let logs = actions(vec![]);
        assert_eq!(orchestrator(&dir, &pac, &logs).prefix(), "cab");

        let queries = QueryTemplateExecutor::new(&pac, vec![], "u", dir.path().join("templates"));
        let custom = AnalysisOrchestrator::new(SolutionLayout::new(dir.path()), queries, &logs)
            .with_prefix(Some("new_".to_string()))
            .expect("prefix");
        assert_eq!(custom.prefix(), "new_");
    }
}
