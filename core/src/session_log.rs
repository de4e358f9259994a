use crate::auth::TokenProvider;
use crate::error::AuditError;
use crate::model::ActionLogEntry;
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Anything able to return the action log of a session.
pub trait ActionLogSource {
    fn get_action_log(&self, session_id: &str) -> Result<Vec<ActionLogEntry>, AuditError>;
}

impl<T: ActionLogSource + ?Sized> ActionLogSource for &T {
    fn get_action_log(&self, session_id: &str) -> Result<Vec<ActionLogEntry>, AuditError> {
        (**self).get_action_log(session_id)
    }
}

/// Reads session action logs from the environment's Web API.
pub struct SessionLogClient<T> {
    environment_url: String,
    tokens: T,
    timeout: Duration,
}

impl<T: TokenProvider> SessionLogClient<T> {
    pub fn new(environment_url: impl Into<String>, tokens: T) -> Self {
        Self {
            environment_url: environment_url.into().trim_end_matches('/').to_string(),
            tokens,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn endpoint(&self, session_id: &str) -> String {
        format!(
            "{}/api/data/v9.2/flowsessions({})/additionalcontext/$value",
            self.environment_url, session_id
        )
    }
}

impl<T: TokenProvider> ActionLogSource for SessionLogClient<T> {
    fn get_action_log(&self, session_id: &str) -> Result<Vec<ActionLogEntry>, AuditError> {
        let endpoint = self.endpoint(session_id);
        let token = self.tokens.get_token(&self.environment_url)?;
        let transport = |err: reqwest::Error| AuditError::Transport {
            endpoint: endpoint.clone(),
            reason: err.to_string(),
        };

        let client = Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(transport)?;

        debug!(endpoint = %endpoint, "requesting action log");
        let response = client
            .get(&endpoint)
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json; charset=utf-8")
            .header("OData-MaxVersion", "4.0")
            .header("OData-Version", "4.0")
            .send()
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuditError::LogRetrievalFailed {
                status: status.as_u16(),
                endpoint,
            });
        }

        let body = response.text().map_err(transport)?;
        Ok(parse_action_log(&body))
    }
}

/// Extracts the `actions` array of a log body. A body that is not JSON yields
/// an empty log instead of an error; non-object rows are dropped.
pub fn parse_action_log(body: &str) -> Vec<ActionLogEntry> {
    let document: Value = match serde_json::from_str(body) {
        Ok(document) => document,
        Err(err) => {
            warn!("failed to decode action log body: {err}");
            return Vec::new();
        }
    };

    let Some(rows) = document.get("actions").and_then(Value::as_array) else {
        debug!("action log body has no actions array");
        return Vec::new();
    };

    rows.iter()
        .enumerate()
        .filter_map(|(index, row)| match row {
            Value::Object(fields) => Some(ActionLogEntry::new(fields.clone())),
            other => {
                warn!(index, "ignoring action that is not an object: {other}");
                None
            }
        })
        .collect()
}
