//! Markdown, CSV and terminal renderings of analysis results.

use crate::error::AuditError;
use crate::model::{value_to_cell, ActionLogEntry, AnalysisResult};
use comfy_table::{presets::ASCII_FULL, Table};
use regex::Regex;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{info, warn};

static UNSAFE_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\w\-. ]+").expect("file name pattern is valid"));
static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace pattern is valid"));

pub const REPORT_TITLE: &str = "# Solution Audit Report";

pub fn render_markdown(results: &[AnalysisResult]) -> String {
    let mut md = String::new();
    md.push_str(REPORT_TITLE);
    md.push_str("\n\n");

    for result in results {
        md.push_str(&format!("## Flow: {}\n", result.workflow_name));
        md.push_str(&format!("- Session ID: {}\n", or_na(&result.session_id)));
        md.push_str(&format!("- Started: {}\n\n", or_na(&result.started_at)));

        md.push_str("### Actions\n");
        md.push_str("| Name | Status | Start | End |\n");
        md.push_str("| --- | --- | --- | --- |\n");
        for action in &result.actions {
            let cells = [
                action.system_action_name(),
                action.status(),
                action.start_time(),
                action.end_time(),
            ];
            md.push('|');
            for cell in cells {
                md.push(' ');
                md.push_str(&sanitize_markdown_cell(cell.unwrap_or_default()));
                md.push_str(" |");
            }
            md.push('\n');
        }
        md.push('\n');

        if !result.has_issues {
            md.push_str("### No issues found\n\n");
            continue;
        }
        md.push_str("### Issues\n");
        for group in &result.issue_groups {
            md.push_str(&format!("#### {}\n", group.category()));
            for message in group.messages() {
                md.push_str(&format!("- {message}\n"));
            }
            md.push('\n');
        }
    }

    md
}

pub fn write_markdown(path: &Path, results: &[AnalysisResult]) -> Result<(), AuditError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|err| AuditError::io(format!("failed to create {}", parent.display()), err))?;
    }
    fs::write(path, render_markdown(results))
        .map_err(|err| AuditError::io(format!("failed to write {}", path.display()), err))?;
    info!(path = %path.display(), "markdown report written");
    Ok(())
}

/// Writes `actions` to `<dir>/<sanitized name>.csv`.
///
/// Columns are the sorted union of every row's keys; a row lacking a column
/// gets an empty cell. Returns `None` without touching the disk when there is
/// nothing to export.
pub fn export_actions_csv(
    actions: &[ActionLogEntry],
    dir: &Path,
    name: &str,
) -> Result<Option<PathBuf>, AuditError> {
    if actions.is_empty() {
        warn!(name, "no actions to export");
        return Ok(None);
    }

    fs::create_dir_all(dir)
        .map_err(|err| AuditError::io(format!("failed to create {}", dir.display()), err))?;
    let path = dir.join(format!("{}.csv", sanitize_file_name(name)));
    let export_error = |reason: String| AuditError::Export {
        path: path.clone(),
        reason,
    };

    let columns: BTreeSet<&str> = actions.iter().flat_map(ActionLogEntry::keys).collect();
    let mut writer = csv::Writer::from_path(&path).map_err(|err| export_error(err.to_string()))?;
    writer
        .write_record(&columns)
        .map_err(|err| export_error(err.to_string()))?;
    for action in actions {
        let row = columns
            .iter()
            .map(|column| action.get(column).map(value_to_cell).unwrap_or_default());
        writer
            .write_record(row)
            .map_err(|err| export_error(err.to_string()))?;
    }
    writer.flush().map_err(|err| export_error(err.to_string()))?;

    info!(path = %path.display(), rows = actions.len(), "actions exported");
    Ok(Some(path))
}

/// Replaces runs of characters outside `[\w\-. ]` with `_`, then whitespace
/// with `_`, and trims leading/trailing underscores.
pub fn sanitize_file_name(name: &str) -> String {
    let safe = UNSAFE_CHARS.replace_all(name, "_");
    let safe = WHITESPACE.replace_all(&safe, "_");
    let safe = safe.trim_matches('_');
    if safe.is_empty() {
        "export".to_string()
    } else {
        safe.to_string()
    }
}

pub fn summary_table(results: &[AnalysisResult]) -> String {
    let mut display = Table::new();
    display.load_preset(ASCII_FULL);
    display.set_header(vec!["Flow", "Session", "Started", "Actions", "Issues"]);

    for result in results {
        display.add_row(vec![
            result.workflow_name.clone(),
            or_na(&result.session_id).to_string(),
            or_na(&result.started_at).to_string(),
            result.actions.len().to_string(),
            result.issue_count().to_string(),
        ]);
    }

    display.to_string()
}

fn or_na(value: &str) -> &str {
    if value.is_empty() {
        "N/A"
    } else {
        value
    }
}

fn sanitize_markdown_cell(value: &str) -> String {
    value.replace('\n', "<br>").replace('|', "\\|")
}
