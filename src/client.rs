//! Source client for SODA (Socrata Open Data API) datasets.
//!
//! [`DatasetSource`] is the seam between the engine and the network. The
//! production implementation is [`SocrataClient`]; tests substitute an
//! in-memory source.
//!
//! # Endpoints
//!
//! | Operation | Request |
//! |-----------|---------|
//! | schema | `GET {base}/api/views/{id}.json` |
//! | count | `GET {base}/resource/{id}.json?$select=count(1) as count&$where=…` |
//! | max | `GET {base}/resource/{id}.json?$select=max(field) as max_value` |
//! | page | `GET {base}/resource/{id}.json?$select&$where&$order&$limit&$offset` |
//!
//! # Retry strategy
//!
//! - HTTP 429, 500, 502, 503, 504 → retry with exponential backoff
//! - Connect, timeout and request errors → retry
//! - `Retry-After` raises the delay to at least the server's hint
//! - HTTP 400 → [`HarvestError::SourceRejected`], surfaced to the caller
//!   (count turns it into [`CountOutcome::UnsupportedSyntax`])
//! - Other 4xx → fail immediately

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::header::RETRY_AFTER;
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::HttpConfig;
use crate::error::{HarvestError, Result};
use crate::identity::value_text;

/// One row as served by the source.
pub type RawRow = Map<String, Value>;

/// Column metadata from schema introspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub field_name: String,
    pub data_type: String,
}

impl ColumnInfo {
    pub fn new(field_name: &str, data_type: &str) -> Self {
        Self {
            field_name: field_name.to_string(),
            data_type: data_type.to_string(),
        }
    }
}

/// Result of an aggregate count whose filter may be rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CountOutcome {
    Counted(u64),
    /// The source rejected the filter expression (HTTP 400).
    UnsupportedSyntax(String),
}

/// One paged query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuerySpec {
    pub select: Option<String>,
    pub where_clause: Option<String>,
    /// Must end with a unique tie-breaker so growing offsets are stable.
    pub order_by: String,
    pub limit: u32,
    pub offset: u64,
}

#[async_trait]
pub trait DatasetSource: Send + Sync {
    /// Column names and declared types.
    async fn schema(&self, dataset_id: &str) -> Result<Vec<ColumnInfo>>;

    /// Server-side `count(1)` under `where_clause`.
    async fn count(&self, dataset_id: &str, where_clause: &str) -> Result<CountOutcome>;

    /// Server-side `max(field)`; `None` when the dataset has no value.
    async fn max_value(&self, dataset_id: &str, field: &str) -> Result<Option<String>>;

    /// One page of rows.
    async fn query(&self, dataset_id: &str, spec: &QuerySpec) -> Result<Vec<RawRow>>;
}

/// Statuses worth retrying.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
    pub retry_after_cap: Duration,
}

impl RetryPolicy {
    pub fn from_config(http: &HttpConfig) -> Self {
        Self {
            max_retries: http.max_retries,
            base_delay: Duration::from_millis(http.backoff_initial_ms),
            max_delay: Duration::from_millis(http.backoff_max_ms),
            jitter: Duration::from_millis(http.jitter_ms),
            retry_after_cap: Duration::from_secs(http.retry_after_cap_secs),
        }
    }

    /// `min(max_delay, base * 2^attempt)`, without jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Sleep before the retry that follows failed attempt `attempt`.
    pub fn sleep_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        let backoff = self.delay_for_attempt(attempt) + jitter;
        match retry_after {
            Some(hint) => backoff.max(hint.min(self.retry_after_cap)),
            None => backoff,
        }
    }
}

/// Parse a `Retry-After` header: delta-seconds or an HTTP date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

/// Extract a message from a SODA error object, if `value` is one.
fn error_object_message(value: &Value) -> Option<String> {
    let obj = value.as_object()?;
    let flagged = obj.get("error").is_some_and(|e| !matches!(e, Value::Bool(false)));
    let coded = obj.contains_key("code") && obj.contains_key("message");
    if !flagged && !coded {
        return None;
    }
    let message = obj
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| obj.get("error").and_then(Value::as_str))
        .unwrap_or("error object in response");
    Some(match obj.get("code").and_then(Value::as_str) {
        Some(code) => format!("{}: {}", code, message),
        None => message.to_string(),
    })
}

fn snippet(body: &str) -> String {
    let parsed = serde_json::from_str::<Value>(body).ok();
    if let Some(message) = parsed.as_ref().and_then(error_object_message) {
        return message;
    }
    crate::error::truncate_message(body.trim(), 300)
}

/// HTTP client for one SODA host.
pub struct SocrataClient {
    http: reqwest::Client,
    base_url: String,
    app_token: Option<String>,
    retry: RetryPolicy,
}

impl SocrataClient {
    pub fn new(base_url: &str, app_token: Option<String>, http: &HttpConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(http.timeout_secs))
            .user_agent(http.user_agent.clone())
            .build()?;
        Ok(Self {
            http: client,
            base_url: base_url.trim_end_matches('/').to_string(),
            app_token,
            retry: RetryPolicy::from_config(http),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// GET `path` with retry, returning the decoded JSON body.
    async fn get_json(&self, dataset_id: &str, path: &str, params: &[(&str, String)]) -> Result<Value> {
        let url = format!("{}/{}", self.base_url, path);
        let mut attempt: u32 = 0;

        loop {
            let mut request = self.http.get(&url).query(params);
            if let Some(token) = &self.app_token {
                request = request.header("X-App-Token", token);
            }

            let (message, retry_after) = match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        match response.text().await {
                            Ok(body) => return decode_body(&body),
                            Err(e) => (format!("reading body: {}", e), None),
                        }
                    } else if is_retryable_status(status.as_u16()) {
                        let retry_after = response
                            .headers()
                            .get(RETRY_AFTER)
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| parse_retry_after(v, Utc::now()));
                        let body = response.text().await.unwrap_or_default();
                        (format!("HTTP {}: {}", status.as_u16(), snippet(&body)), retry_after)
                    } else {
                        // Client error (not 429), don't retry
                        let body = response.text().await.unwrap_or_default();
                        return Err(HarvestError::SourceRejected {
                            status: status.as_u16(),
                            message: snippet(&body),
                        });
                    }
                }
                Err(e) if e.is_builder() => {
                    return Err(HarvestError::SourceUnavailable {
                        dataset: dataset_id.to_string(),
                        attempts: attempt + 1,
                        message: e.to_string(),
                    });
                }
                Err(e) => (e.to_string(), None),
            };

            if attempt >= self.retry.max_retries {
                return Err(HarvestError::SourceUnavailable {
                    dataset: dataset_id.to_string(),
                    attempts: attempt + 1,
                    message,
                });
            }

            let delay = self.retry.sleep_for(attempt, retry_after);
            warn!(
                dataset = dataset_id,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "transient source failure, retrying: {}",
                message
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn resource(&self, dataset_id: &str, params: &[(&str, String)]) -> Result<Vec<RawRow>> {
        let path = format!("resource/{}.json", dataset_id);
        let body = self.get_json(dataset_id, &path, params).await?;
        rows_from(body)
    }
}

/// Decode a successful body. An empty body means no rows; an error object
/// is a rejection even under a 2xx status.
fn decode_body(body: &str) -> Result<Value> {
    if body.trim().is_empty() {
        return Ok(Value::Array(Vec::new()));
    }
    let value: Value = serde_json::from_str(body)?;
    if let Some(message) = error_object_message(&value) {
        return Err(HarvestError::SourceRejected {
            status: 400,
            message,
        });
    }
    Ok(value)
}

fn rows_from(body: Value) -> Result<Vec<RawRow>> {
    match body {
        Value::Array(items) => Ok(items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect()),
        other => Err(HarvestError::SourceRejected {
            status: 200,
            message: format!("expected a JSON array of rows, got {}", json_kind(&other)),
        }),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Parse the `columns[]` array of a view metadata document.
pub fn parse_columns(metadata: &Value) -> Option<Vec<ColumnInfo>> {
    let columns = metadata.get("columns")?.as_array()?;
    Some(
        columns
            .iter()
            .filter_map(|column| {
                let field = column.get("fieldName")?.as_str()?;
                let data_type = column
                    .get("dataTypeName")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                Some(ColumnInfo::new(field, &data_type.to_lowercase()))
            })
            .collect(),
    )
}

fn first_value(rows: &[RawRow], key: &str) -> Option<String> {
    rows.first().and_then(|row| row.get(key)).and_then(value_text)
}

#[async_trait]
impl DatasetSource for SocrataClient {
    async fn schema(&self, dataset_id: &str) -> Result<Vec<ColumnInfo>> {
        let path = format!("api/views/{}.json", dataset_id);
        let metadata = self
            .get_json(dataset_id, &path, &[])
            .await
            .map_err(|e| HarvestError::SchemaUnavailable {
                dataset: dataset_id.to_string(),
                message: e.to_string(),
            })?;

        let columns = parse_columns(&metadata).ok_or_else(|| HarvestError::SchemaUnavailable {
            dataset: dataset_id.to_string(),
            message: "metadata has no columns array".to_string(),
        })?;
        debug!(dataset = dataset_id, columns = columns.len(), "schema loaded");
        Ok(columns)
    }

    async fn count(&self, dataset_id: &str, where_clause: &str) -> Result<CountOutcome> {
        let params = [
            ("$select", "count(1) as count".to_string()),
            ("$where", where_clause.to_string()),
        ];
        match self.resource(dataset_id, &params).await {
            Ok(rows) => {
                let count = first_value(&rows, "count")
                    .and_then(|text| text.parse::<u64>().ok())
                    .unwrap_or(0);
                Ok(CountOutcome::Counted(count))
            }
            Err(HarvestError::SourceRejected {
                status: 400,
                message,
            }) => Ok(CountOutcome::UnsupportedSyntax(message)),
            Err(e) => Err(e),
        }
    }

    async fn max_value(&self, dataset_id: &str, field: &str) -> Result<Option<String>> {
        let params = [("$select", format!("max({}) as max_value", field))];
        let rows = self.resource(dataset_id, &params).await?;
        Ok(first_value(&rows, "max_value"))
    }

    async fn query(&self, dataset_id: &str, spec: &QuerySpec) -> Result<Vec<RawRow>> {
        let mut params: Vec<(&str, String)> = Vec::with_capacity(5);
        if let Some(select) = &spec.select {
            params.push(("$select", select.clone()));
        }
        if let Some(where_clause) = &spec.where_clause {
            params.push(("$where", where_clause.clone()));
        }
        params.push(("$order", spec.order_by.clone()));
        params.push(("$limit", spec.limit.to_string()));
        params.push(("$offset", spec.offset.to_string()));

        let rows = self.resource(dataset_id, &params).await?;
        debug!(
            dataset = dataset_id,
            offset = spec.offset,
            rows = rows.len(),
            "page fetched"
        );
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            jitter: Duration::ZERO,
            retry_after_cap: Duration::from_secs(2),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = policy();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn retry_after_raises_delay_up_to_cap() {
        let policy = policy();
        assert_eq!(
            policy.sleep_for(0, Some(Duration::from_secs(1))),
            Duration::from_secs(1)
        );
        assert_eq!(
            policy.sleep_for(0, Some(Duration::from_secs(90))),
            Duration::from_secs(2)
        );
        assert_eq!(
            policy.sleep_for(1, Some(Duration::from_millis(10))),
            Duration::from_millis(200)
        );
    }

    #[test]
    fn jitter_stays_in_range() {
        let mut policy = policy();
        policy.jitter = Duration::from_millis(50);
        for _ in 0..50 {
            let delay = policy.sleep_for(0, None);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn retry_after_formats() {
        let now = Utc.with_ymd_and_hms(2015, 10, 21, 7, 27, 30).unwrap();
        assert_eq!(parse_retry_after("7", now), Some(Duration::from_secs(7)));
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT", now),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:00:00 GMT", now),
            Some(Duration::ZERO)
        );
        assert_eq!(parse_retry_after("soon", now), None);
    }

    #[test]
    fn retryable_statuses() {
        for status in [429, 500, 502, 503, 504] {
            assert!(is_retryable_status(status));
        }
        for status in [400, 401, 403, 404, 501] {
            assert!(!is_retryable_status(status));
        }
    }

    #[test]
    fn body_shapes() {
        assert_eq!(decode_body("").unwrap(), json!([]));
        assert_eq!(decode_body("[{\"a\":\"1\"}]").unwrap(), json!([{"a": "1"}]));

        let err = decode_body(r#"{"error": true, "message": "column not found"}"#).unwrap_err();
        assert!(err.is_filter_rejection());
        assert!(err.to_string().contains("column not found"));

        let err = decode_body(r#"{"code": "query.soql.no-such-column", "message": "No such column: foo"}"#)
            .unwrap_err();
        assert!(err.to_string().contains("query.soql.no-such-column: No such column: foo"));

        // A plain object that is not an error passes through to the caller.
        assert!(decode_body(r#"{"columns": []}"#).is_ok());
    }

    #[test]
    fn rows_require_array() {
        assert_eq!(rows_from(json!([{"a": 1}, 5])).unwrap().len(), 1);
        assert!(rows_from(json!({"a": 1})).is_err());
    }

    #[test]
    fn parses_view_columns() {
        let metadata = json!({
            "id": "ipu4-2q9a",
            "columns": [
                {"fieldName": "job__", "dataTypeName": "text"},
                {"fieldName": "issuance_date", "dataTypeName": "Calendar_Date"},
                {"name": "no field name"}
            ]
        });
        assert_eq!(
            parse_columns(&metadata).unwrap(),
            vec![
                ColumnInfo::new("job__", "text"),
                ColumnInfo::new("issuance_date", "calendar_date"),
            ]
        );
        assert!(parse_columns(&json!({})).is_none());
    }
}
