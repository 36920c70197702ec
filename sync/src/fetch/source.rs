use std::future::Future;
use std::time::Duration;

use config::shared::{PlannerSourceConfig, TrackerSourceConfig};
use serde_json::Value;

use crate::bail;
use crate::error::{ErrorKind, SyncResult};
use crate::fetch::{PageCursor, PageRequest, PageResponse};

/// Request timeout applied to every source call.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// A source of paginated records.
///
/// The seam between the retrying [`crate::fetch::Fetcher`] and the concrete
/// HTTP clients; tests implement it with scripted pages and injected
/// failures.
pub trait PagedSource: Send + Sync {
    /// Endpoint description attached to error context.
    fn endpoint(&self) -> String;

    /// Fetches a single page.
    ///
    /// Implementations classify failures through [`ErrorKind`]: transient
    /// kinds are retried by the fetcher, everything else surfaces
    /// immediately.
    fn fetch_page(
        &self,
        request: &PageRequest,
    ) -> impl Future<Output = SyncResult<PageResponse>> + Send;
}

/// How requests against a source are authenticated.
#[derive(Clone)]
enum SourceAuth {
    /// API key in the `X-Api-Key` header (tracker).
    ApiKey(String),
    /// Bearer token in the `Authorization` header (planner).
    Bearer(String),
}

/// How a source wraps its response payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseShape {
    /// A bare JSON array of records (tracker).
    Array,
    /// A `{"values": [...], "nextCursor": ...}` envelope (planner).
    ValuesEnvelope,
}

/// A concrete HTTP resource endpoint implementing [`PagedSource`].
#[derive(Clone)]
pub struct HttpSource {
    client: reqwest::Client,
    url: String,
    auth: SourceAuth,
    shape: ResponseShape,
    extra_params: Vec<(String, String)>,
}

impl HttpSource {
    /// A tracker resource: workspace-scoped URL, API-key auth, bare arrays.
    pub fn tracker(client: reqwest::Client, config: &TrackerSourceConfig, path: &str) -> Self {
        let url = format!(
            "{}/workspaces/{}{}",
            config.base_url.trim_end_matches('/'),
            config.workspace_id,
            path
        );

        Self {
            client,
            url,
            auth: SourceAuth::ApiKey(config.api_key.expose_secret().to_string()),
            shape: ResponseShape::Array,
            extra_params: Vec::new(),
        }
    }

    /// A planner resource: bearer auth, values/nextCursor envelope.
    pub fn planner(client: reqwest::Client, config: &PlannerSourceConfig, path: &str) -> Self {
        let url = format!("{}{}", config.base_url.trim_end_matches('/'), path);

        Self {
            client,
            url,
            auth: SourceAuth::Bearer(config.api_token.expose_secret().to_string()),
            shape: ResponseShape::ValuesEnvelope,
            extra_params: Vec::new(),
        }
    }

    /// Adds a fixed query parameter to every page request.
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_params.push((name.into(), value.into()));
        self
    }
}

impl PagedSource for HttpSource {
    fn endpoint(&self) -> String {
        self.url.clone()
    }

    async fn fetch_page(&self, request: &PageRequest) -> SyncResult<PageResponse> {
        let mut query: Vec<(String, String)> = match &request.cursor {
            PageCursor::Number(page) => vec![
                ("page".to_string(), page.to_string()),
                ("page-size".to_string(), request.per_page.to_string()),
            ],
            PageCursor::Token(token) => {
                let mut query = vec![("limit".to_string(), request.per_page.to_string())];
                if let Some(token) = token {
                    query.push(("cursor".to_string(), token.clone()));
                }
                query
            }
        };
        query.extend(self.extra_params.iter().cloned());

        let mut http_request = self.client.get(&self.url).query(&query);
        http_request = match &self.auth {
            SourceAuth::ApiKey(key) => http_request.header("X-Api-Key", key),
            SourceAuth::Bearer(token) => http_request.bearer_auth(token),
        };

        let response = http_request.send().await?;
        let status = response.status();
        let context = format!("{} ({})", self.url, request.describe());

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse::<u64>().ok())
                .map(Duration::from_secs);

            let mut error = crate::sync_error!(
                ErrorKind::SourceRateLimited,
                "Source rate limit hit",
                context
            );
            if let Some(retry_after) = retry_after {
                error = error.with_retry_after(retry_after);
            }
            return Err(error);
        }

        if status.is_server_error() {
            bail!(
                ErrorKind::SourceUnavailable,
                "Source returned a server error",
                format!("status {status} from {context}")
            );
        }

        if !status.is_success() {
            bail!(
                ErrorKind::SourceRequestFailed,
                "Source rejected the request",
                format!("status {status} from {context}")
            );
        }

        let body: Value = response.json().await?;
        decode_page(body, self.shape, &context)
    }
}

/// Decodes a response body into records and the continuation token.
fn decode_page(body: Value, shape: ResponseShape, context: &str) -> SyncResult<PageResponse> {
    match shape {
        ResponseShape::Array => match body {
            Value::Array(records) => Ok(PageResponse {
                records,
                next_cursor: None,
            }),
            other => bail!(
                ErrorKind::SourceResponseInvalid,
                "Expected a JSON array response",
                format!("got {} from {}", type_name(&other), context)
            ),
        },
        ResponseShape::ValuesEnvelope => match body {
            // Some planner endpoints return a bare array despite the
            // documented envelope; accept both.
            Value::Array(records) => Ok(PageResponse {
                records,
                next_cursor: None,
            }),
            Value::Object(mut envelope) => {
                let next_cursor = envelope
                    .get("nextCursor")
                    .and_then(Value::as_str)
                    .map(str::to_string);

                let records = match envelope.remove("values") {
                    Some(Value::Array(records)) => records,
                    // A single-object `values` is a one-record page.
                    Some(value @ Value::Object(_)) => vec![value],
                    Some(Value::Null) | None => Vec::new(),
                    Some(other) => bail!(
                        ErrorKind::SourceResponseInvalid,
                        "Envelope `values` is neither array nor object",
                        format!("got {} from {}", type_name(&other), context)
                    ),
                };

                Ok(PageResponse {
                    records,
                    next_cursor,
                })
            }
            other => bail!(
                ErrorKind::SourceResponseInvalid,
                "Expected an envelope object response",
                format!("got {} from {}", type_name(&other), context)
            ),
        },
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Builds the shared HTTP client used by every source in a run.
pub fn build_http_client() -> SyncResult<reqwest::Client> {
    let client = reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()?;

    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn array_shape_decodes_bare_arrays() {
        let page = decode_page(json!([{"id": 1}, {"id": 2}]), ResponseShape::Array, "test").unwrap();
        assert_eq!(page.records.len(), 2);
        assert_eq!(page.next_cursor, None);
    }

    #[test]
    fn array_shape_rejects_objects() {
        let error = decode_page(json!({"id": 1}), ResponseShape::Array, "test").unwrap_err();
        assert_eq!(error.kind(), ErrorKind::SourceResponseInvalid);
    }

    #[test]
    fn envelope_shape_extracts_values_and_cursor() {
        let page = decode_page(
            json!({"values": [{"id": 1}], "nextCursor": "abc"}),
            ResponseShape::ValuesEnvelope,
            "test",
        )
        .unwrap();

        assert_eq!(page.records.len(), 1);
        assert_eq!(page.next_cursor.as_deref(), Some("abc"));
    }

    #[test]
    fn envelope_shape_accepts_single_object_values() {
        let page = decode_page(
            json!({"values": {"id": 1}}),
            ResponseShape::ValuesEnvelope,
            "test",
        )
        .unwrap();

        assert_eq!(page.records.len(), 1);
        assert_eq!(page.next_cursor, None);
    }

    #[test]
    fn envelope_shape_accepts_bare_arrays() {
        let page = decode_page(json!([{"id": 1}]), ResponseShape::ValuesEnvelope, "test").unwrap();
        assert_eq!(page.records.len(), 1);
    }

    #[test]
    fn envelope_without_values_is_an_empty_page() {
        let page = decode_page(json!({}), ResponseShape::ValuesEnvelope, "test").unwrap();
        assert!(page.records.is_empty());
    }
}
