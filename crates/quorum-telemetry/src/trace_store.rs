//! Client boundary for the external structured telemetry store.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::instrument;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, thiserror::Error)]
pub enum TraceStoreError {
    #[error("trace store transport error: {0}")]
    Transport(String),
    #[error("trace store returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed trace store response: {0}")]
    Malformed(String),
}

/// Spans of one operation newer than `since`, oldest first, at most
/// `row_limit` rows.
#[derive(Clone, Debug, PartialEq)]
pub struct TraceQuery {
    pub operation_id: String,
    pub since: DateTime<Utc>,
    pub row_limit: usize,
}

/// Tabular query result with named columns.
///
/// `partial_error` is set when the store answered with rows but also
/// reported a failure; the rows are still usable.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub partial_error: Option<String>,
}

impl QueryTable {
    pub fn new<I, S>(columns: I, rows: Vec<Vec<Value>>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows,
            partial_error: None,
        }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }
}

#[async_trait]
pub trait TraceStore: Send + Sync {
    async fn query(&self, query: &TraceQuery) -> Result<QueryTable, TraceStoreError>;
}

/// Azure Log Analytics query API (`/v1/workspaces/{id}/query`) over the
/// `AppTraces` and `AppDependencies` tables.
pub struct LogAnalyticsStore {
    client: Client,
    endpoint: String,
    workspace_id: String,
    token: SecretString,
}

impl LogAnalyticsStore {
    pub fn new(
        endpoint: impl Into<String>,
        workspace_id: impl Into<String>,
        token: SecretString,
    ) -> Result<Self, TraceStoreError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| TraceStoreError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            workspace_id: workspace_id.into(),
            token,
        })
    }

    fn url(&self) -> String {
        format!("{}/v1/workspaces/{}/query", self.endpoint, self.workspace_id)
    }
}

/// Render a [`TraceQuery`] as KQL projecting the column contract
/// `timestamp, name, operation_id, span_id, parent_id, duration_ms, success,
/// item_type, custom_dimensions`.
pub fn render_kql(query: &TraceQuery) -> String {
    // Operation ids are hex; anything else is dropped rather than escaped.
    let op: String = query
        .operation_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    let since = query.since.to_rfc3339_opts(SecondsFormat::Millis, true);

    format!(
        "union \
(AppTraces | extend item_type = \"trace\", name = Message, span_id = tostring(Properties[\"span_id\"]), duration_ms = real(null), success = bool(null)), \
(AppDependencies | extend item_type = \"dependency\", name = Name, span_id = Id, duration_ms = DurationMs, success = Success) \
| where OperationId == \"{op}\" and TimeGenerated > datetime({since}) \
| project timestamp = TimeGenerated, name, operation_id = OperationId, span_id, parent_id = ParentId, duration_ms, success, item_type, custom_dimensions = Properties \
| order by timestamp asc \
| take {limit}",
        limit = query.row_limit,
    )
}

#[derive(Deserialize)]
struct QueryResponse {
    #[serde(default)]
    tables: Vec<ResponseTable>,
    error: Option<Value>,
}

#[derive(Deserialize)]
struct ResponseTable {
    columns: Vec<ResponseColumn>,
    #[serde(default)]
    rows: Vec<Vec<Value>>,
}

#[derive(Deserialize)]
struct ResponseColumn {
    name: String,
}

fn describe_error(error: &Value) -> String {
    error
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string())
}

/// Parse a query API response body. An `error` alongside tables marks a
/// partial result; an `error` with no tables is a failure.
pub fn parse_response(body: &str) -> Result<QueryTable, TraceStoreError> {
    let resp: QueryResponse =
        serde_json::from_str(body).map_err(|e| TraceStoreError::Malformed(e.to_string()))?;

    let Some(table) = resp.tables.into_iter().next() else {
        return match resp.error {
            Some(error) => Err(TraceStoreError::Malformed(describe_error(&error))),
            None => Ok(QueryTable::default()),
        };
    };

    Ok(QueryTable {
        columns: table.columns.into_iter().map(|c| c.name).collect(),
        rows: table.rows,
        partial_error: resp.error.as_ref().map(describe_error),
    })
}

#[async_trait]
impl TraceStore for LogAnalyticsStore {
    #[instrument(skip(self), fields(operation_id = %query.operation_id))]
    async fn query(&self, query: &TraceQuery) -> Result<QueryTable, TraceStoreError> {
        let resp = self
            .client
            .post(self.url())
            .bearer_auth(self.token.expose_secret())
            .json(&json!({ "query": render_kql(query) }))
            .send()
            .await
            .map_err(|e| TraceStoreError::Transport(e.to_string()))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| TraceStoreError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(TraceStoreError::Status {
                status: status.as_u16(),
                body,
            });
        }
        parse_response(&body)
    }
}
