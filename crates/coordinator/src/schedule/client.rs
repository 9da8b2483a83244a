// HTTP client for the run API
//
// Bearer auth on every call. Background run submission is form-encoded,
// everything else that carries a payload is sent as JSON.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::{Method, StatusCode};
use serde_json::Value;
use thiserror::Error;

use runwarden_schemas::RunStatus;

const RUN_ENDPOINT_PATTERN: &str = r"^/(agents|teams|workflows)/([^/]+)/runs/?$";

#[derive(Error, Debug)]
pub enum RunApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Not found")]
    NotFound,

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("unsupported HTTP method: {0}")]
    UnsupportedMethod(String),
}

impl RunApiError {
    /// HTTP status carried by the error, if any
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            Self::NotFound => Some(404),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// An agent, team or workflow whose runs can be created and polled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunTarget {
    /// `agents`, `teams` or `workflows`
    pub kind: String,
    pub id: String,
}

impl RunTarget {
    pub fn runs_path(&self) -> String {
        format!("/{}/{}/runs", self.kind, self.id)
    }

    pub fn run_path(&self, run_id: &str) -> String {
        format!("/{}/{}/runs/{}", self.kind, self.id, run_id)
    }
}

/// Whether `(method, endpoint)` creates a run, and of what
///
/// Detection is purely syntactic; the payload is not inspected.
pub fn background_target(method: &str, endpoint: &str) -> Option<RunTarget> {
    static RUN_ENDPOINT: OnceLock<Option<Regex>> = OnceLock::new();

    if !method.trim().eq_ignore_ascii_case("POST") {
        return None;
    }
    let path = endpoint.split('?').next().unwrap_or(endpoint);
    let captures = RUN_ENDPOINT
        .get_or_init(|| Regex::new(RUN_ENDPOINT_PATTERN).ok())
        .as_ref()?
        .captures(path)?;

    Some(RunTarget {
        kind: captures.get(1)?.as_str().to_string(),
        id: captures.get(2)?.as_str().to_string(),
    })
}

/// Identifiers of a run accepted for background execution
#[derive(Debug, Clone, PartialEq)]
pub struct SubmittedRun {
    pub run_id: String,
    pub session_id: String,
    pub status_code: u16,
    pub body: Value,
}

/// Response to a plain request, judged by status only
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointResponse {
    pub status_code: u16,
    pub body: String,
}

impl EndpointResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// A parsed poll response
#[derive(Debug, Clone, PartialEq)]
pub struct RunSnapshot {
    pub status: RunStatus,
    pub content: Option<Value>,
    pub content_type: Option<String>,
    pub error: Option<String>,
    pub requirements: Option<Value>,
    pub input: Option<Value>,
}

impl RunSnapshot {
    /// `None` when the body has no recognizable `status`
    pub fn from_json(body: &Value) -> Option<Self> {
        let status = RunStatus::parse(body.get("status")?.as_str()?)?;
        let present = |key: &str| body.get(key).filter(|v| !v.is_null()).cloned();

        Some(Self {
            status,
            content: present("content"),
            content_type: body
                .get("content_type")
                .and_then(Value::as_str)
                .map(str::to_string),
            error: body
                .get("error")
                .or_else(|| body.get("error_message"))
                .and_then(Value::as_str)
                .map(str::to_string),
            requirements: present("requirements"),
            input: present("input"),
        })
    }
}

/// The run API as seen by the schedule executor
#[async_trait]
pub trait RunApi: Send + Sync + 'static {
    /// Create a background run; never streams
    async fn submit_background_run(
        &self,
        target: &RunTarget,
        payload: Option<&Value>,
        timeout: Duration,
    ) -> Result<SubmittedRun, RunApiError>;

    /// Current state of a run
    async fn get_run(
        &self,
        target: &RunTarget,
        run_id: &str,
        session_id: &str,
    ) -> Result<Value, RunApiError>;

    /// One request/response to an arbitrary endpoint
    async fn send(
        &self,
        method: &str,
        endpoint: &str,
        payload: Option<&Value>,
        timeout: Duration,
    ) -> Result<EndpointResponse, RunApiError>;
}

/// reqwest-backed [`RunApi`]
pub struct RunApiClient {
    base_url: String,
    token: Option<String>,
    request_timeout: Duration,
    http: reqwest::Client,
}

impl RunApiClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
            request_timeout: Duration::from_secs(30),
            http: reqwest::Client::new(),
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.is_empty());
        self
    }

    /// Timeout for each poll request
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let builder = self.http.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn handle_json(&self, response: reqwest::Response) -> Result<Value, RunApiError> {
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Err(RunApiError::NotFound);
        }

        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(RunApiError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| RunApiError::InvalidResponse(e.to_string()))
    }
}

/// Flatten a payload into form fields
///
/// Nested values are sent as JSON strings; `stream` and `background` are
/// always overridden.
pub fn background_form(payload: Option<&Value>) -> Vec<(String, String)> {
    let mut fields: Vec<(String, String)> = vec![];
    if let Some(Value::Object(map)) = payload {
        for (key, value) in map {
            if key == "stream" || key == "background" {
                continue;
            }
            let encoded = match value {
                Value::Null => continue,
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            fields.push((key.clone(), encoded));
        }
    }
    fields.push(("stream".to_string(), "false".to_string()));
    fields.push(("background".to_string(), "true".to_string()));
    fields
}

#[async_trait]
impl RunApi for RunApiClient {
    async fn submit_background_run(
        &self,
        target: &RunTarget,
        payload: Option<&Value>,
        timeout: Duration,
    ) -> Result<SubmittedRun, RunApiError> {
        let response = self
            .request(Method::POST, &target.runs_path())
            .form(&background_form(payload))
            .timeout(timeout)
            .send()
            .await?;
        let status_code = response.status().as_u16();
        let body = self.handle_json(response).await?;

        let field = |key: &str| {
            body.get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| RunApiError::InvalidResponse(format!("missing {key}")))
        };
        Ok(SubmittedRun {
            run_id: field("run_id")?,
            session_id: field("session_id")?,
            status_code,
            body,
        })
    }

    async fn get_run(
        &self,
        target: &RunTarget,
        run_id: &str,
        session_id: &str,
    ) -> Result<Value, RunApiError> {
        let response = self
            .request(Method::GET, &target.run_path(run_id))
            .query(&[("session_id", session_id)])
            .timeout(self.request_timeout)
            .send()
            .await?;
        self.handle_json(response).await
    }

    async fn send(
        &self,
        method: &str,
        endpoint: &str,
        payload: Option<&Value>,
        timeout: Duration,
    ) -> Result<EndpointResponse, RunApiError> {
        let method = Method::from_bytes(method.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| RunApiError::UnsupportedMethod(method.to_string()))?;

        let mut builder = self.request(method.clone(), endpoint).timeout(timeout);
        if method != Method::GET {
            if let Some(payload) = payload {
                builder = builder.json(payload);
            }
        }

        let response = builder.send().await?;
        let status_code = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Ok(EndpointResponse { status_code, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_background_target_detection() {
        let target = background_target("POST", "/agents/researcher/runs").unwrap();
        assert_eq!(target.kind, "agents");
        assert_eq!(target.id, "researcher");

        assert!(background_target("post", "/teams/t1/runs/").is_some());
        assert!(background_target("POST", "/workflows/w1/runs?x=1").is_some());
        assert!(background_target("GET", "/agents/a1/runs").is_none());
        assert!(background_target("POST", "/agents/a1/runs/r1").is_none());
        assert!(background_target("POST", "/tools/t1/runs").is_none());
        assert!(background_target("POST", "/health").is_none());
    }

    #[test]
    fn test_background_form_encoding() {
        let payload = json!({
            "message": "daily report",
            "stream": true,
            "max_tokens": 200,
            "metadata": {"source": "cron"},
            "skip": null,
        });
        let fields = background_form(Some(&payload));
        let get = |k: &str| fields.iter().find(|(key, _)| key == k).map(|(_, v)| v.as_str());

        assert_eq!(get("message"), Some("daily report"));
        assert_eq!(get("max_tokens"), Some("200"));
        assert_eq!(get("metadata"), Some(r#"{"source":"cron"}"#));
        assert_eq!(get("stream"), Some("false"));
        assert_eq!(get("background"), Some("true"));
        assert_eq!(get("skip"), None);
        assert_eq!(fields.iter().filter(|(k, _)| k == "stream").count(), 1);
    }

    #[test]
    fn test_snapshot_parsing() {
        let snap = RunSnapshot::from_json(&json!({
            "status": "completed",
            "content": "done",
            "content_type": "str",
        }))
        .unwrap();
        assert_eq!(snap.status, RunStatus::Completed);
        assert_eq!(snap.content, Some(json!("done")));

        assert!(RunSnapshot::from_json(&json!({"status": "WHATEVER"})).is_none());
        assert!(RunSnapshot::from_json(&json!("not an object")).is_none());
    }
}
