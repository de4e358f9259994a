//! Query templates: FetchXML documents whose `condition` elements are filled
//! with per-workflow values, executed through an external tool, and the
//! parsing of the tabular text that tool prints.

use crate::error::AuditError;
use crate::markup::ElementPath;
use crate::model::RunRecord;
use crate::runner::QueryRunner;
use quick_xml::events::{BytesStart, Event};
use quick_xml::{Reader, Writer};
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::io::{Cursor, ErrorKind, Write};
use std::path::PathBuf;
use std::sync::LazyLock;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};
use tracing::{debug, warn};

pub const LAST_RUN_TEMPLATE: &str = "last_run";
pub const LOGS_TEMPLATE: &str = "logs";

pub const FLOW_NAME_PARAM: &str = "flow_name";
pub const SESSION_ID_PARAM: &str = "session_id";

static RUN_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        \b(?P<id>[0-9A-Fa-f]{8}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{12})\b
        (?:\s+(?P<started>
            \d{1,2}/\d{1,2}/\d{4}\s+\d{1,2}:\d{2}(?::\d{2})?(?:\s*[AaPp][Mm])?
          | \d{4}-\d{2}-\d{2}[T\ ]\d{2}:\d{2}(?::\d{2})?(?:\.\d+)?(?:Z|[+-]\d{2}:\d{2})?
        ))?",
    )
    .expect("run line pattern is valid")
});

fn condition_attribute(parameter: &str) -> Option<&'static str> {
    match parameter {
        FLOW_NAME_PARAM => Some("name"),
        SESSION_ID_PARAM => Some("flowsessionid"),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct QueryTemplateExecutor<R> {
    runner: R,
    command: Vec<String>,
    environment_url: String,
    template_dir: PathBuf,
}

impl<R: QueryRunner> QueryTemplateExecutor<R> {
    pub fn new(
        runner: R,
        command: Vec<String>,
        environment_url: impl Into<String>,
        template_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            command,
            environment_url: environment_url.into(),
            template_dir: template_dir.into(),
        }
    }

    pub fn template_path(&self, template_id: &str) -> PathBuf {
        self.template_dir.join(format!("{template_id}.xml"))
    }

    /// The template on disk is never modified; each call renders into its own temp file.
    pub fn fetch(
        &self,
        template_id: &str,
        parameters: &BTreeMap<String, String>,
    ) -> Result<String, AuditError> {
        let path = self.template_path(template_id);
        let source = match fs::read_to_string(&path) {
            Ok(source) => source,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(AuditError::TemplateNotFound(path));
            }
            Err(err) => {
                return Err(AuditError::io(
                    format!("failed to read template {}", path.display()),
                    err,
                ))
            }
        };

        let rendered =
            render_template(&source, parameters).map_err(|reason| AuditError::TemplateMalformed {
                path: path.clone(),
                reason,
            })?;

        let mut file = tempfile::Builder::new()
            .prefix(&format!("{template_id}-"))
            .suffix(".xml")
            .tempfile()
            .map_err(|err| AuditError::io("failed to create rendered template", err))?;
        file.write_all(&rendered)
            .and_then(|_| file.flush())
            .map_err(|err| AuditError::io("failed to write rendered template", err))?;

        let mut argv = self.command.clone();
        argv.extend([
            "env".to_string(),
            "fetch".to_string(),
            "--environment".to_string(),
            self.environment_url.clone(),
            "--xmlFile".to_string(),
            file.path().to_string_lossy().to_string(),
        ]);
        debug!(template = template_id, "executing query template");
        self.runner.execute(&argv)
    }
}

/// Writes each known parameter into the `value` attribute of every `condition`
/// whose `attribute` matches it. Unknown parameter names are ignored.
pub fn render_template(
    source: &str,
    parameters: &BTreeMap<String, String>,
) -> Result<Vec<u8>, String> {
    let mut values: BTreeMap<&str, &str> = BTreeMap::new();
    for (key, value) in parameters {
        match condition_attribute(key) {
            Some(attribute) => {
                values.insert(attribute, value.as_str());
            }
            None => debug!(parameter = %key, "ignoring unknown template parameter"),
        }
    }

    let mut reader = Reader::from_reader(source.as_bytes());
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    let mut buf = Vec::new();
    let mut tree = ElementPath::default();

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|err| format!("XML parsing error: {err}"))?;
        let written = match event {
            Event::Start(element) => {
                tree.open(element_name(&element))?;
                Event::Start(fill_condition(element, &values)?)
            }
            Event::Empty(element) => {
                tree.empty(&element_name(&element))?;
                Event::Empty(fill_condition(element, &values)?)
            }
            Event::End(element) => {
                tree.close();
                Event::End(element)
            }
            Event::Text(text) => {
                tree.text(&text)?;
                Event::Text(text)
            }
            Event::Eof => break,
            other => other,
        };
        writer
            .write_event(written)
            .map_err(|err| format!("failed to write template: {err}"))?;
        buf.clear();
    }

    tree.finish()?;
    Ok(writer.into_inner().into_inner())
}

fn element_name(element: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(element.local_name().as_ref()).to_string()
}

fn fill_condition<'a>(
    element: BytesStart<'a>,
    values: &BTreeMap<&str, &str>,
) -> Result<BytesStart<'a>, String> {
    if element.local_name().as_ref() != b"condition" {
        return Ok(element);
    }
    let target = element
        .try_get_attribute("attribute")
        .map_err(|err| err.to_string())?
        .map(|attr| attr.unescape_value().map(|v| v.to_string()))
        .transpose()
        .map_err(|err| err.to_string())?;
    let Some(value) = target.as_deref().and_then(|attr| values.get(attr)) else {
        return Ok(element);
    };

    let name = String::from_utf8_lossy(element.name().as_ref()).to_string();
    let mut filled = BytesStart::new(name);
    let mut replaced = false;
    for attr in element.attributes() {
        let attr = attr.map_err(|err| err.to_string())?;
        if attr.key.as_ref() == b"value" {
            filled.push_attribute(("value", *value));
            replaced = true;
        } else {
            filled.push_attribute(attr);
        }
    }
    if !replaced {
        filled.push_attribute(("value", *value));
    }
    Ok(filled.into_owned())
}

/// Lines without a GUID-shaped session id are skipped.
pub fn parse_runs(raw: &str) -> Vec<RunRecord> {
    raw.lines()
        .filter_map(|line| RUN_LINE.captures(line.trim()))
        .map(|captures| {
            let session_id = captures["id"].to_string();
            let started_at = captures
                .name("started")
                .map(|m| canonical_timestamp(m.as_str()))
                .unwrap_or_default();
            RunRecord {
                session_id,
                started_at,
            }
        })
        .collect()
}

/// Best-effort conversion to `YYYY-MM-DD HH:MM:SS`; unparseable input is
/// returned unchanged.
pub fn canonical_timestamp(raw: &str) -> String {
    let normalized = normalize_timestamp(raw);
    match parse_timestamp(&normalized) {
        Some(parsed) => {
            let canonical = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
            parsed
                .format(&canonical)
                .unwrap_or_else(|_| raw.trim().to_string())
        }
        None => {
            if !normalized.is_empty() {
                warn!(value = %raw, "failed to parse timestamp");
            }
            raw.trim().to_string()
        }
    }
}

fn normalize_timestamp(raw: &str) -> String {
    let joined = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let upper = joined.to_uppercase();
    for marker in ["AM", "PM"] {
        if let Some(head) = upper.strip_suffix(marker) {
            return format!("{} {marker}", head.trim_end());
        }
    }
    joined
}

fn parse_timestamp(value: &str) -> Option<PrimitiveDateTime> {
    let us_12h = format_description!(
        "[month padding:none]/[day padding:none]/[year] [hour repr:12 padding:none]:[minute] [period]"
    );
    let us_12h_seconds = format_description!(
        "[month padding:none]/[day padding:none]/[year] [hour repr:12 padding:none]:[minute]:[second] [period]"
    );
    let us_24h = format_description!(
        "[month padding:none]/[day padding:none]/[year] [hour padding:none]:[minute]"
    );
    let us_24h_seconds = format_description!(
        "[month padding:none]/[day padding:none]/[year] [hour padding:none]:[minute]:[second]"
    );
    let iso_local = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

    PrimitiveDateTime::parse(value, &us_12h)
        .or_else(|_| PrimitiveDateTime::parse(value, &us_12h_seconds))
        .or_else(|_| PrimitiveDateTime::parse(value, &us_24h))
        .or_else(|_| PrimitiveDateTime::parse(value, &us_24h_seconds))
        .or_else(|_| PrimitiveDateTime::parse(value, &iso_local))
        .ok()
        .or_else(|| {
            OffsetDateTime::parse(value, &Rfc3339)
                .ok()
                .map(|dt| PrimitiveDateTime::new(dt.date(), dt.time()))
        })
}

pub fn parameters<const N: usize>(pairs: [(&str, &str); N]) -> BTreeMap<String, String> {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}
