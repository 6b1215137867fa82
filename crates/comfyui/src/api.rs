//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Implements [`GenerationBackend`] over [`reqwest`]: capability probing,
//! workflow submission, queue and history inspection, image download,
//! cancellation and interruption.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use texforge_core::job::ArtifactRef;

use crate::backend::{
    BackendError, GenerationBackend, NodeRegistry, PromptHistory, QueueStatus, SubmitResponse,
    SystemStats,
};

/// Timeouts applied to every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiTimeouts {
    /// Whole-request timeout.
    pub request: Duration,
    /// TCP connect timeout.
    pub connect: Duration,
}

impl Default for ApiTimeouts {
    fn default() -> Self {
        Self {
            request: Duration::from_secs(15),
            connect: Duration::from_secs(5),
        }
    }
}

/// HTTP client for a single ComfyUI instance.
#[derive(Debug, Clone)]
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
}

impl ComfyUIApi {
    /// Create a client for `api_url` (e.g. `http://host:8188`).
    pub fn new(api_url: impl Into<String>, timeouts: ApiTimeouts) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(timeouts.request)
            .connect_timeout(timeouts.connect)
            .build()
            .map_err(|e| BackendError::Unreachable(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(client, api_url))
    }

    /// Create an API client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.api_url)
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or [`BackendError::Http`] with the
    /// status and body text on failure.
    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(BackendError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, BackendError> {
        let response = Self::ensure_success(response).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))
    }

    /// Assert the response has a success status code, discarding the body.
    async fn check_status(response: reqwest::Response) -> Result<(), BackendError> {
        Self::ensure_success(response).await?;
        Ok(())
    }
}

#[async_trait]
impl GenerationBackend for ComfyUIApi {
    fn base_url(&self) -> &str {
        &self.api_url
    }

    async fn system_stats(&self) -> Result<SystemStats, BackendError> {
        let response = self.client.get(self.url("/system_stats")).send().await?;
        Self::parse_response(response).await
    }

    async fn object_info(&self) -> Result<NodeRegistry, BackendError> {
        let response = self.client.get(self.url("/object_info")).send().await?;
        Self::parse_response(response).await
    }

    async fn list_models(&self, folder: &str) -> Result<Vec<String>, BackendError> {
        let response = self
            .client
            .get(self.url(&format!("/models/{folder}")))
            .send()
            .await?;
        Self::parse_response(response).await
    }

    /// Sends `POST /prompt` with the workflow and client id. A response
    /// listing node errors is treated as a refusal.
    async fn submit(
        &self,
        workflow: &Value,
        client_id: &str,
    ) -> Result<SubmitResponse, BackendError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });

        let response = self
            .client
            .post(self.url("/prompt"))
            .json(&body)
            .send()
            .await?;

        let submitted: SubmitResponse = Self::parse_response(response).await?;
        if submitted.has_node_errors() {
            return Err(BackendError::Http {
                status: 400,
                body: submitted.node_errors.to_string(),
            });
        }
        Ok(submitted)
    }

    async fn queue(&self) -> Result<QueueStatus, BackendError> {
        let response = self.client.get(self.url("/queue")).send().await?;
        Self::parse_response(response).await
    }

    /// The endpoint answers `{prompt_id: {...}}`, or `{}` while the
    /// prompt is still queued or running.
    async fn history(&self, prompt_id: &str) -> Result<Option<PromptHistory>, BackendError> {
        let response = self
            .client
            .get(self.url(&format!("/history/{prompt_id}")))
            .send()
            .await?;

        let mut body: serde_json::Map<String, Value> = Self::parse_response(response).await?;
        match body.remove(prompt_id) {
            Some(record) => serde_json::from_value(record)
                .map(Some)
                .map_err(|e| BackendError::Decode(e.to_string())),
            None => Ok(None),
        }
    }

    async fn view(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, BackendError> {
        let response = self
            .client
            .get(self.url("/view"))
            .query(&[
                ("filename", artifact.filename.as_str()),
                ("subfolder", artifact.subfolder.as_str()),
                ("type", artifact.kind.as_str()),
            ])
            .send()
            .await?;

        let response = Self::ensure_success(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    /// Sends `POST /queue` asking ComfyUI to delete the prompt.
    async fn delete_from_queue(&self, prompt_id: &str) -> Result<(), BackendError> {
        let body = serde_json::json!({
            "delete": [prompt_id],
        });

        let response = self
            .client
            .post(self.url("/queue"))
            .json(&body)
            .send()
            .await?;

        Self::check_status(response).await
    }

    /// Sends `POST /interrupt`. This does not target a specific prompt.
    async fn interrupt(&self) -> Result<(), BackendError> {
        let response = self.client.post(self.url("/interrupt")).send().await?;
        Self::check_status(response).await
    }
}
