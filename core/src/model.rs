use crate::rules::{IssueGroup, ValidationOutcome};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum WorkflowCategory {
    CloudFlow,
    DesktopFlow,
}

impl WorkflowCategory {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            5 => Some(Self::CloudFlow),
            6 => Some(Self::DesktopFlow),
            _ => None,
        }
    }

    pub fn code(self) -> i64 {
        match self {
            Self::CloudFlow => 5,
            Self::DesktopFlow => 6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowDefinition {
    pub name: String,
    pub category: WorkflowCategory,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunRecord {
    pub session_id: String,
    pub started_at: String,
}

/// Rows of one session do not share a key set; the raw object is kept in arrival order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct ActionLogEntry {
    fields: Map<String, Value>,
}

impl ActionLogEntry {
    pub const SYSTEM_ACTION_NAME: &'static str = "systemActionName";
    pub const STATUS: &'static str = "status";
    pub const START_TIME: &'static str = "startTime";
    pub const END_TIME: &'static str = "endTime";
    pub const FUNCTION_NAME: &'static str = "functionName";

    pub fn new(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn system_action_name(&self) -> Option<&str> {
        self.get_str(Self::SYSTEM_ACTION_NAME)
    }

    pub fn status(&self) -> Option<&str> {
        self.get_str(Self::STATUS)
    }

    pub fn start_time(&self) -> Option<&str> {
        self.get_str(Self::START_TIME)
    }

    pub fn end_time(&self) -> Option<&str> {
        self.get_str(Self::END_TIME)
    }

    pub fn function_name(&self) -> Option<&str> {
        self.get_str(Self::FUNCTION_NAME)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Top-level string values, in key order. Nested structures are not descended.
    pub fn string_values(&self) -> impl Iterator<Item = &str> {
        self.fields.values().filter_map(Value::as_str)
    }

    /// Flattens the entry into display cells; nested values become compact JSON.
    pub fn flatten(&self) -> BTreeMap<String, String> {
        self.fields
            .iter()
            .map(|(key, value)| (key.clone(), value_to_cell(value)))
            .collect()
    }
}

pub(crate) fn value_to_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

#[derive(Debug, Clone)]
pub struct FlowRun {
    pub workflow_name: String,
    pub run: RunRecord,
    pub raw_log_lines: Vec<String>,
    pub actions: Vec<ActionLogEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisResult {
    pub workflow_name: String,
    pub session_id: String,
    pub started_at: String,
    pub raw_log_lines: Vec<String>,
    pub actions: Vec<ActionLogEntry>,
    pub issue_groups: Vec<IssueGroup>,
    pub has_issues: bool,
}

impl AnalysisResult {
    pub fn new(flow: FlowRun, outcome: ValidationOutcome) -> Self {
        let ValidationOutcome { groups, has_issues } = outcome;
        Self {
            workflow_name: flow.workflow_name,
            session_id: flow.run.session_id,
            started_at: flow.run.started_at,
            raw_log_lines: flow.raw_log_lines,
            actions: flow.actions,
            issue_groups: groups,
            has_issues,
        }
    }

    pub fn issue_count(&self) -> usize {
        self.issue_groups.iter().map(IssueGroup::len).sum()
    }
}

impl fmt::Display for AnalysisResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} (session {}, started {})",
            self.workflow_name, self.session_id, self.started_at
        )?;
        if !self.has_issues {
            writeln!(f, "  no issues found")?;
            return Ok(());
        }
        for group in &self.issue_groups {
            writeln!(f, "  [{}]", group.category())?;
            for message in group.messages() {
                writeln!(f, "    - {message}")?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedWorkflow {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AnalysisBatch {
    pub results: Vec<AnalysisResult>,
    pub skipped: Vec<SkippedWorkflow>,
}

impl AnalysisBatch {
    pub fn has_issues(&self) -> bool {
        self.results.iter().any(|result| result.has_issues)
    }
}
