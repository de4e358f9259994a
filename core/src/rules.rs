use crate::error::AuditError;
use crate::manifest;
use crate::model::ActionLogEntry;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum IssueCategory {
    Action,
    SubFlow,
    Config,
    Execution,
    Solution,
    Security,
    Validation,
}

impl IssueCategory {
    pub const ALL: [IssueCategory; 7] = [
        IssueCategory::Action,
        IssueCategory::SubFlow,
        IssueCategory::Config,
        IssueCategory::Execution,
        IssueCategory::Solution,
        IssueCategory::Security,
        IssueCategory::Validation,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            IssueCategory::Action => "Action",
            IssueCategory::SubFlow => "SubFlow",
            IssueCategory::Config => "Config",
            IssueCategory::Execution => "Execution",
            IssueCategory::Solution => "Solution",
            IssueCategory::Security => "Security",
            IssueCategory::Validation => "Validation",
        }
    }
}

impl fmt::Display for IssueCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Issue {
    pub category: IssueCategory,
    pub message: String,
}

impl Issue {
    pub fn new(category: IssueCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

/// Append-only list of issues that all share the group's category.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct IssueGroup {
    category: IssueCategory,
    issues: Vec<Issue>,
}

impl IssueGroup {
    pub fn new(category: IssueCategory) -> Self {
        Self {
            category,
            issues: Vec::new(),
        }
    }

    pub fn add(&mut self, message: impl Into<String>) {
        let issue = Issue::new(self.category, message);
        debug!(category = %self.category, message = %issue.message, "issue added");
        self.issues.push(issue);
    }

    pub fn category(&self) -> IssueCategory {
        self.category
    }

    pub fn issues(&self) -> &[Issue] {
        &self.issues
    }

    pub fn messages(&self) -> impl Iterator<Item = &str> {
        self.issues.iter().map(|issue| issue.message.as_str())
    }

    pub fn len(&self) -> usize {
        self.issues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationOutcome {
    /// Non-empty groups only.
    pub groups: Vec<IssueGroup>,
    pub has_issues: bool,
}

/// Action whose presence shows the cleanup subflow ran.
pub const CLEANUP_ACTION: &str = "Empty";

/// Runs every rule against one workflow's session data and the solution manifest.
///
/// Rules are independent: each fills its own group and none can stop another
/// from running. Only groups that received issues are returned.
pub fn analyze_issues(
    details: &[String],
    actions: &[ActionLogEntry],
    manifest_path: &Path,
    prefix: &str,
) -> Result<ValidationOutcome, AuditError> {
    info!(
        detail_lines = details.len(),
        actions = actions.len(),
        "analyzing issues"
    );

    let mut subflow = IssueGroup::new(IssueCategory::SubFlow);
    let mut execution = IssueGroup::new(IssueCategory::Execution);
    let validation = IssueGroup::new(IssueCategory::Validation);
    let mut solution = IssueGroup::new(IssueCategory::Solution);
    let mut security = IssueGroup::new(IssueCategory::Security);

    check_execution(actions, &mut execution);
    check_security(actions, &mut security);
    check_subflows(actions, &mut subflow);
    for issue in manifest::check_structure(manifest_path, prefix)? {
        solution.add(issue.message);
    }

    let groups: Vec<IssueGroup> = [subflow, execution, validation, solution, security]
        .into_iter()
        .filter(|group| !group.is_empty())
        .collect();
    let has_issues = !groups.is_empty();
    info!(groups = groups.len(), "analysis finished");

    Ok(ValidationOutcome { groups, has_issues })
}

fn check_execution(actions: &[ActionLogEntry], group: &mut IssueGroup) {
    debug!("checking execution completeness");
    if actions.is_empty() {
        group.add("No action log available.");
    }
    if !actions
        .iter()
        .any(|action| action.system_action_name() == Some(CLEANUP_ACTION))
    {
        group.add(format!("Cleanup subflow ('{CLEANUP_ACTION}') was not executed."));
    }
}

/// Stops at the first string containing `@`, so at most one issue is reported
/// however many entries leak data.
fn check_security(actions: &[ActionLogEntry], group: &mut IssueGroup) {
    debug!("checking logs for exposed data");
    let leaked = actions
        .iter()
        .flat_map(ActionLogEntry::string_values)
        .any(|value| value.contains('@'));
    if leaked {
        group.add("Sensitive data exposed in action logs.");
    }
}

fn check_subflows(actions: &[ActionLogEntry], group: &mut IssueGroup) {
    debug!("checking subflow naming");
    for function in actions.iter().filter_map(ActionLogEntry::function_name) {
        if function.is_empty() {
            continue;
        }
        let lowered = function.to_lowercase();
        if !lowered.starts_with("f_") && lowered != "main" {
            group.add(format!("SubFlow '{function}' does not follow the 'f_' prefix."));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::fs;
    use tempfile::TempDir;

    const CLEAN_MANIFEST: &str = r#"<ImportExportXml>
  <Workflows>
    <Workflow Name="Invoice_Sync"><Category>6</Category></Workflow>
    <Workflow Name="Notify"><Category>5</Category></Workflow>
  </Workflows>
  <workqueues><workqueue /></workqueues>
</ImportExportXml>"#;

    fn clean_solution() -> TempDir {
        let dir = tempfile::tempdir().expect("temp dir");
        fs::write(dir.path().join("customizations.xml"), CLEAN_MANIFEST).expect("manifest");
        fs::create_dir(dir.path().join(manifest::ENVIRONMENT_VARIABLES_DIR)).expect("env dir");
        dir
    }

    fn actions(rows: Vec<Value>) -> Vec<ActionLogEntry> {
        rows.into_iter()
            .map(|row| serde_json::from_value(row).expect("action row"))
            .collect()
    }

    fn run(actions: &[ActionLogEntry]) -> ValidationOutcome {
        let dir = clean_solution();
        analyze_issues(&[], actions, &dir.path().join("customizations.xml"), "")
            .expect("analysis")
    }

    fn group(outcome: &ValidationOutcome, category: IssueCategory) -> Option<&IssueGroup> {
        outcome.groups.iter().find(|g| g.category() == category)
    }

    #[test]
    fn clean_session_has_no_issues() {
        let outcome = run(&actions(vec![
            json!({ "systemActionName": "RunSubflow", "functionName": "Main" }),
            json!({ "systemActionName": "Empty", "functionName": "f_Cleanup" }),
        ]));
        assert!(!outcome.has_issues);
        assert!(outcome.groups.is_empty());
    }

    #[test]
    fn empty_log_reports_missing_log_and_cleanup() {
        let outcome = run(&[]);
        let execution = group(&outcome, IssueCategory::Execution).expect("execution group");
        let messages: Vec<&str> = execution.messages().collect();
        assert_eq!(
            messages,
            vec![
                "No action log available.",
                "Cleanup subflow ('Empty') was not executed."
            ]
        );
        assert!(outcome.has_issues);
    }

    #[test]
    fn missing_cleanup_is_reported_regardless_of_other_fields() {
        let outcome = run(&actions(vec![json!({
            "systemActionName": "LogMessage",
            "status": "Succeeded",
            "functionName": "main"
        })]));
        let execution = group(&outcome, IssueCategory::Execution).expect("execution group");
        assert_eq!(execution.len(), 1);
        assert!(execution.issues()[0].message.contains("'Empty'"));
    }

    #[test]
    fn security_reports_a_single_issue_for_many_leaks() {
        let outcome = run(&actions(vec![
            json!({ "systemActionName": "Empty", "input": "ana@contoso.com" }),
            json!({ "systemActionName": "SendMail", "to": "bob@contoso.com" }),
            json!({ "output": "carol@contoso.com" }),
        ]));
        let security = group(&outcome, IssueCategory::Security).expect("security group");
        assert_eq!(security.len(), 1);
    }

    #[test]
    fn security_ignores_non_string_and_nested_values() {
        let outcome = run(&actions(vec![json!({
            "systemActionName": "Empty",
            "count": 3,
            "payload": { "mail": "nested@contoso.com" }
        })]));
        assert!(group(&outcome, IssueCategory::Security).is_none());
    }

    #[test]
    fn subflow_naming_accumulates_per_offending_entry() {
        let outcome = run(&actions(vec![
            json!({ "systemActionName": "Empty", "functionName": "Helper" }),
            json!({ "functionName": "f_helper" }),
            json!({ "functionName": "MAIN" }),
            json!({ "functionName": "F_Upper" }),
            json!({ "functionName": "" }),
            json!({ "functionName": "Helper" }),
        ]));
        let subflow = group(&outcome, IssueCategory::SubFlow).expect("subflow group");
        let messages: Vec<&str> = subflow.messages().collect();
        assert_eq!(
            messages,
            vec![
                "SubFlow 'Helper' does not follow the 'f_' prefix.",
                "SubFlow 'Helper' does not follow the 'f_' prefix.",
            ]
        );
    }

    #[test]
    fn groups_keep_their_category_and_order() {
        let dir = tempfile::tempdir().expect("temp dir");
        fs::write(dir.path().join("customizations.xml"), "<ImportExportXml />")
            .expect("manifest");
        let rows = actions(vec![json!({ "functionName": "g_bad", "note": "x@y" })]);
        let outcome = analyze_issues(
            &["line".to_string()],
            &rows,
            &dir.path().join("customizations.xml"),
            "",
        )
        .expect("analysis");
        let categories: Vec<IssueCategory> =
            outcome.groups.iter().map(IssueGroup::category).collect();
        assert_eq!(
            categories,
            vec![
                IssueCategory::SubFlow,
                IssueCategory::Execution,
                IssueCategory::Solution,
                IssueCategory::Security,
            ]
        );
        for group in &outcome.groups {
            assert!(group.issues().iter().all(|i| i.category == group.category()));
        }
    }

    #[test]
    fn manifest_errors_propagate() {
        let dir = tempfile::tempdir().expect("temp dir");
        let err = analyze_issues(&[], &[], &dir.path().join("customizations.xml"), "")
            .unwrap_err();
        assert!(matches!(err, AuditError::ManifestNotFound(_)));
    }

    #[test]
    fn taxonomy_is_closed() {
        assert_eq!(IssueCategory::ALL.len(), 7);
        let names: Vec<&str> = IssueCategory::ALL.iter().map(|c| c.as_str()).collect();
        assert!(names.contains(&"Action"));
        assert!(names.contains(&"Config"));
    }
}
