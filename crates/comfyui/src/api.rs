//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Covers the four endpoints a job needs: prompt submission, history
//! polling, output download and the `/system_stats` liveness probe.

use std::time::Duration;

use async_trait::async_trait;
use avagen_core::graph::JobGraph;
use serde_json::Value;

use crate::backend::{HealthProbe, RenderBackend};
use crate::protocol::{self, ArtifactRef, PollResult, SubmissionHandle};

/// Per-endpoint request timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpTimeouts {
    pub submit: Duration,
    pub history: Duration,
    pub fetch: Duration,
    pub health: Duration,
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self {
            submit: Duration::from_secs(30),
            history: Duration::from_secs(10),
            fetch: Duration::from_secs(30),
            health: Duration::from_secs(2),
        }
    }
}

/// HTTP client for a single ComfyUI instance.
#[derive(Debug, Clone)]
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
    timeouts: HttpTimeouts,
}

/// Errors from the ComfyUI REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// The HTTP request itself failed (connection refused, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The server refused the job graph.
    #[error("Submission rejected ({status}): {body}")]
    SubmitRejected {
        /// HTTP status code.
        status: u16,
        /// Server-provided reason or raw body.
        body: String,
    },

    /// ComfyUI returned a non-2xx status code.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError { status: u16, body: String },

    /// A 2xx response whose body could not be interpreted.
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// An artifact could not be downloaded.
    #[error("Failed to fetch {filename}: {reason}")]
    FetchFailed {
        filename: String,
        status: Option<u16>,
        reason: String,
    },

    /// The job did not reach a terminal state in time.
    #[error("Timed out waiting for completion after {}s", .elapsed.as_secs())]
    PollTimeout { elapsed: Duration },
}

impl AdapterError {
    /// Whether retrying the same request may succeed: transport failures
    /// and 5xx responses.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Request(e) => !e.is_decode() && !e.is_builder(),
            Self::ApiError { status, .. } => *status >= 500,
            Self::FetchFailed { status, .. } => status.map_or(true, |s| s >= 500),
            Self::SubmitRejected { .. } | Self::MalformedResponse(_) | Self::PollTimeout { .. } => {
                false
            }
        }
    }
}

impl ComfyUIApi {
    /// Create a new API client for a ComfyUI instance.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://127.0.0.1:8188`.
    pub fn new(api_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    /// Create an API client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        let api_url = api_url.into().trim_end_matches('/').to_string();
        Self {
            client,
            api_url,
            timeouts: HttpTimeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: HttpTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Queue a job graph for execution.
    ///
    /// Sends `POST /prompt` with a fresh client id. A 2xx body carrying
    /// `error` or `node_errors` is treated as a rejection.
    pub async fn submit_workflow(&self, graph: &JobGraph) -> Result<SubmissionHandle, AdapterError> {
        let body = serde_json::json!({
            "prompt": graph.to_wire(),
            "client_id": uuid::Uuid::new_v4().to_string(),
        });

        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .timeout(self.timeouts.submit)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(AdapterError::SubmitRejected {
                status: status.as_u16(),
                body: rejection_reason(&text),
            });
        }

        let json: Value =
            serde_json::from_str(&text).map_err(|_| AdapterError::SubmitRejected {
                status: status.as_u16(),
                body: text.clone(),
            })?;
        let prompt_id = protocol::parse_submit_response(&json).map_err(|reason| {
            AdapterError::SubmitRejected {
                status: status.as_u16(),
                body: reason,
            }
        })?;

        tracing::info!(prompt_id = %prompt_id, nodes = graph.len(), "Job submitted to ComfyUI");
        Ok(SubmissionHandle::new(prompt_id))
    }

    /// Retrieve the raw history document for a prompt.
    pub async fn get_history(&self, prompt_id: &str) -> Result<Value, AdapterError> {
        let response = self
            .client
            .get(format!("{}/history/{}", self.api_url, prompt_id))
            .timeout(self.timeouts.history)
            .send()
            .await?;

        let response = Self::ensure_success(response).await?;
        response
            .json::<Value>()
            .await
            .map_err(|e| AdapterError::MalformedResponse(format!("history response: {e}")))
    }

    /// Fetch and interpret the history entry for a submission.
    pub async fn poll_status(&self, handle: &SubmissionHandle) -> Result<PollResult, AdapterError> {
        let history = self.get_history(&handle.id).await?;
        Ok(protocol::parse_history(&history, &handle.id))
    }

    /// Download one generated file via `GET /view`.
    pub async fn fetch_image(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, AdapterError> {
        let fetch_failed = |status: Option<u16>, reason: String| AdapterError::FetchFailed {
            filename: artifact.filename.clone(),
            status,
            reason,
        };

        let response = self
            .client
            .get(format!("{}/view", self.api_url))
            .query(&[
                ("filename", artifact.filename.as_str()),
                ("subfolder", artifact.subfolder.as_str()),
                ("type", artifact.folder_type.as_str()),
            ])
            .timeout(self.timeouts.fetch)
            .send()
            .await
            .map_err(|e| fetch_failed(None, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(fetch_failed(Some(status.as_u16()), body));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| fetch_failed(None, e.to_string()))?;
        if bytes.is_empty() {
            return Err(fetch_failed(Some(status.as_u16()), "empty body".to_string()));
        }
        Ok(bytes.to_vec())
    }

    /// `GET /system_stats` answered with a 2xx inside the health timeout.
    pub async fn is_healthy(&self) -> bool {
        let result = self
            .client
            .get(format!("{}/system_stats", self.api_url))
            .timeout(self.timeouts.health)
            .send()
            .await;
        matches!(result, Ok(response) if response.status().is_success())
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or an [`AdapterError::ApiError`]
    /// containing the status and body text on failure.
    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, AdapterError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(AdapterError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

/// Prefer the structured reason in a ComfyUI error body over raw text.
fn rejection_reason(text: &str) -> String {
    match serde_json::from_str::<Value>(text) {
        Ok(json) => match protocol::parse_submit_response(&json) {
            Err(reason) => reason,
            Ok(_) => text.to_string(),
        },
        Err(_) => text.to_string(),
    }
}

#[async_trait]
impl RenderBackend for ComfyUIApi {
    async fn submit(&self, graph: &JobGraph) -> Result<SubmissionHandle, AdapterError> {
        self.submit_workflow(graph).await
    }

    async fn poll(&self, handle: &SubmissionHandle) -> Result<PollResult, AdapterError> {
        self.poll_status(handle).await
    }

    async fn fetch_artifact(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, AdapterError> {
        self.fetch_image(artifact).await
    }
}

#[async_trait]
impl HealthProbe for ComfyUIApi {
    async fn health_check(&self) -> bool {
        self.is_healthy().await
    }
}
