//! Reads the solution manifest (`customizations.xml`) and the publisher
//! metadata (`solution.xml`) of an extracted solution.

use crate::error::AuditError;
use crate::markup::ElementPath;
use crate::model::{WorkflowCategory, WorkflowDefinition};
use crate::rules::{Issue, IssueCategory};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use tracing::{debug, warn};

pub const ENVIRONMENT_VARIABLES_DIR: &str = "environmentvariabledefinitions";

const CONNECTION_REFERENCES: &str = "connectionreferences";
const CONNECTION_REFERENCE_LOGICAL_NAME: &str = "connectionreferencelogicalname";

#[derive(Debug, Clone, Default)]
pub struct ManifestFacts {
    /// Workflows with a recognised category, in document order.
    pub workflows: Vec<WorkflowDefinition>,
    /// Every `Workflow/Category` code, including workflows that are not listed.
    pub category_codes: BTreeSet<i64>,
    pub connection_reference_names: Vec<String>,
    pub work_queue_count: usize,
}

impl ManifestFacts {
    pub fn has_category(&self, category: WorkflowCategory) -> bool {
        self.category_codes.contains(&category.code())
    }
}

pub fn discover_workflows(manifest_path: &Path) -> Result<Vec<WorkflowDefinition>, AuditError> {
    let facts = read_manifest(manifest_path)?;
    let flows: Vec<WorkflowDefinition> = facts
        .workflows
        .into_iter()
        .filter(|workflow| workflow.category == WorkflowCategory::DesktopFlow)
        .collect();
    debug!(count = flows.len(), "desktop flows discovered");
    Ok(flows)
}

/// Runs the four solution structure checks. Every failed check adds exactly
/// one `Solution` issue; no check depends on another.
pub fn check_structure(manifest_path: &Path, prefix: &str) -> Result<Vec<Issue>, AuditError> {
    let facts = read_manifest(manifest_path)?;
    let mut issues = Vec::new();

    let env_dir = manifest_path
        .parent()
        .unwrap_or_else(|| Path::new(""))
        .join(ENVIRONMENT_VARIABLES_DIR);
    if !env_dir.is_dir() {
        issues.push(Issue::new(
            IssueCategory::Solution,
            "No environment variables are defined in the solution.",
        ));
    }

    let outside: Vec<&str> = facts
        .connection_reference_names
        .iter()
        .map(String::as_str)
        .filter(|name| !name.starts_with(prefix))
        .collect();
    if !outside.is_empty() {
        issues.push(Issue::new(
            IssueCategory::Solution,
            format!(
                "Connection references outside prefix '{}': {}.",
                prefix,
                outside.join(", ")
            ),
        ));
    }

    if facts.work_queue_count == 0 {
        issues.push(Issue::new(
            IssueCategory::Solution,
            "No work queue found in the solution.",
        ));
    }

    if !facts.has_category(WorkflowCategory::DesktopFlow) {
        issues.push(Issue::new(
            IssueCategory::Solution,
            "No desktop flow (Category=6) in the solution.",
        ));
    }
    if !facts.has_category(WorkflowCategory::CloudFlow) {
        issues.push(Issue::new(
            IssueCategory::Solution,
            "No cloud flow (Category=5) in the solution.",
        ));
    }

    Ok(issues)
}

pub fn read_manifest(manifest_path: &Path) -> Result<ManifestFacts, AuditError> {
    let content = read_markup(manifest_path)?;
    parse_manifest(&content).map_err(|reason| AuditError::ManifestMalformed {
        path: manifest_path.to_path_buf(),
        reason,
    })
}

/// Customization prefix of the solution publisher, when `solution.xml` declares one.
pub fn publisher_prefix(solution_xml: &Path) -> Result<Option<String>, AuditError> {
    let content = match read_markup(solution_xml) {
        Ok(content) => content,
        Err(AuditError::ManifestNotFound(_)) => return Ok(None),
        Err(err) => return Err(err),
    };

    let mut reader = Reader::from_reader(content.as_bytes());
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut tree = ElementPath::default();
    let mut prefix = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(element)) => tree
                .open(local_name(&element))
                .map_err(|reason| malformed(solution_xml, reason))?,
            Ok(Event::Empty(element)) => tree
                .empty(&local_name(&element))
                .map_err(|reason| malformed(solution_xml, reason))?,
            Ok(Event::End(_)) => {
                tree.close();
            }
            Ok(Event::Text(text)) => {
                tree.text(&text)
                    .map_err(|reason| malformed(solution_xml, reason))?;
                if ends_with(tree.path(), &["Publisher", "CustomizationPrefix"]) {
                    let value = text.unescape().map_err(|err| malformed(solution_xml, err))?;
                    let value = value.trim();
                    if !value.is_empty() {
                        prefix = Some(value.to_string());
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => return Err(malformed(solution_xml, err)),
            _ => {}
        }
        buf.clear();
    }
    tree.finish()
        .map_err(|reason| malformed(solution_xml, reason))?;

    Ok(prefix)
}

fn read_markup(path: &Path) -> Result<String, AuditError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(content),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            Err(AuditError::ManifestNotFound(path.to_path_buf()))
        }
        Err(err) => Err(AuditError::io(format!("failed to read {}", path.display()), err)),
    }
}

fn malformed(path: &Path, err: impl std::fmt::Display) -> AuditError {
    AuditError::ManifestMalformed {
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}

#[derive(Default)]
struct WorkflowBuilder {
    name: Option<String>,
    category: Option<String>,
}

impl WorkflowBuilder {
    fn finish(self) -> Option<WorkflowDefinition> {
        let Some(name) = self.name.filter(|name| !name.is_empty()) else {
            warn!("skipping workflow without a Name attribute");
            return None;
        };
        let code = self.category.as_deref().map(str::trim)?.parse::<i64>().ok()?;
        let category = WorkflowCategory::from_code(code)?;
        Some(WorkflowDefinition { name, category })
    }
}

fn parse_manifest(content: &str) -> Result<ManifestFacts, String> {
    let mut reader = Reader::from_reader(content.as_bytes());
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut tree = ElementPath::default();
    let mut facts = ManifestFacts::default();
    let mut current: Option<WorkflowBuilder> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(element)) => {
                let name = local_name(&element);
                match name.as_str() {
                    "Workflow" => {
                        current = Some(WorkflowBuilder {
                            name: attribute(&element, "Name")?.map(|n| n.trim().to_string()),
                            category: None,
                        });
                    }
                    "workqueues" => facts.work_queue_count += 1,
                    _ => {}
                }
                if let Some(logical) = attribute(&element, CONNECTION_REFERENCE_LOGICAL_NAME)? {
                    push_unique(&mut facts.connection_reference_names, logical);
                }
                tree.open(name)?;
            }
            Ok(Event::Empty(element)) => {
                let name = local_name(&element);
                tree.empty(&name)?;
                match name.as_str() {
                    "Workflow" => {
                        warn!("skipping workflow element without content");
                    }
                    "workqueues" => facts.work_queue_count += 1,
                    _ => {}
                }
                if let Some(logical) = attribute(&element, CONNECTION_REFERENCE_LOGICAL_NAME)? {
                    push_unique(&mut facts.connection_reference_names, logical);
                }
            }
            Ok(Event::Text(text)) => {
                tree.text(&text)?;
                let value = text.unescape().map_err(|err| err.to_string())?;
                let path = tree.path();
                if ends_with(path, &["Workflow", "Category"]) {
                    if let Ok(code) = value.trim().parse::<i64>() {
                        facts.category_codes.insert(code);
                    }
                    if let Some(builder) = current.as_mut() {
                        builder.category = Some(value.to_string());
                    }
                } else if path.last().map(String::as_str) == Some(CONNECTION_REFERENCE_LOGICAL_NAME)
                    && path.iter().any(|name| name == CONNECTION_REFERENCES)
                {
                    push_unique(
                        &mut facts.connection_reference_names,
                        value.trim().to_string(),
                    );
                }
            }
            Ok(Event::End(_)) => {
                if tree.close().as_deref() == Some("Workflow") {
                    if let Some(workflow) = current.take().and_then(WorkflowBuilder::finish) {
                        facts.workflows.push(workflow);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => return Err(format!("XML parsing error: {err}")),
            _ => {}
        }
        buf.clear();
    }

    tree.finish()?;
    Ok(facts)
}

fn local_name(element: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(element.local_name().as_ref()).to_string()
}

fn attribute(element: &BytesStart<'_>, key: &str) -> Result<Option<String>, String> {
    for attr in element.attributes().flatten() {
        if attr.key.as_ref() == key.as_bytes() {
            let value = attr.unescape_value().map_err(|err| err.to_string())?;
            return Ok(Some(value.to_string()));
        }
    }
    Ok(None)
}

fn ends_with(stack: &[String], tail: &[&str]) -> bool {
    stack.len() >= tail.len()
        && stack[stack.len() - tail.len()..]
            .iter()
            .zip(tail)
            .all(|(have, want)| have == want)
}

fn push_unique(names: &mut Vec<String>, name: String) {
    if !names.contains(&name) {
        names.push(name);
    }
}
