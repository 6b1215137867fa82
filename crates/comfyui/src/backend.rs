//! The generation backend abstraction.
//!
//! [`GenerationBackend`] covers the ComfyUI HTTP endpoints the pipeline
//! needs. [`ComfyUIApi`](crate::api::ComfyUIApi) implements it over
//! `reqwest`; tests substitute an in-memory fake.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use texforge_core::job::ArtifactRef;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from a single backend call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    /// Network, DNS, TLS or timeout failure; the backend was not reached.
    #[error("Backend unreachable: {0}")]
    Unreachable(String),

    /// The backend answered with a non-2xx status.
    #[error("Backend returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// The backend answered with a body we could not interpret.
    #[error("Unexpected backend response: {0}")]
    Decode(String),
}

impl BackendError {
    pub fn status(&self) -> Option<u16> {
        match self {
            BackendError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self.status(), Some(401 | 403))
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            BackendError::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            BackendError::Http {
                status: status.as_u16(),
                body: e.to_string(),
            }
        } else {
            BackendError::Unreachable(e.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

/// `GET /system_stats`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SystemStats {
    /// Absent on servers that are not ComfyUI.
    #[serde(default)]
    pub system: Option<SystemInfo>,
    #[serde(default)]
    pub devices: Vec<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SystemInfo {
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub comfyui_version: Option<String>,
    #[serde(default)]
    pub python_version: Option<String>,
}

/// `GET /object_info`: node class type -> node definition.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct NodeRegistry(pub serde_json::Map<String, Value>);

impl NodeRegistry {
    pub fn has_node(&self, class_type: &str) -> bool {
        self.0.contains_key(class_type)
    }

    /// Options of a combo input (e.g. installed checkpoint names).
    ///
    /// Supports both the legacy `[[opt, ...], {..}]` shape and the newer
    /// `["COMBO", {"options": [...]}]` shape. `None` when the node or
    /// input is absent.
    pub fn input_options(&self, class_type: &str, input: &str) -> Option<Vec<String>> {
        let spec = self
            .0
            .get(class_type)?
            .get("input")?
            .get("required")?
            .get(input)?
            .as_array()?;

        let options = match spec.first()? {
            Value::Array(list) => list,
            Value::String(kind) if kind == "COMBO" => {
                spec.get(1)?.get("options")?.as_array()?
            }
            _ => return None,
        };
        Some(
            options
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
        )
    }
}

/// `POST /prompt` success body.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitResponse {
    pub prompt_id: String,
    #[serde(default)]
    pub number: i64,
    /// Per-node validation errors; non-empty means the job was refused.
    #[serde(default)]
    pub node_errors: Value,
}

impl SubmitResponse {
    pub fn has_node_errors(&self) -> bool {
        match &self.node_errors {
            Value::Object(map) => !map.is_empty(),
            Value::Array(list) => !list.is_empty(),
            _ => false,
        }
    }
}

/// `GET /queue`. Each entry is `[number, prompt_id, prompt, extra, outputs]`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueueStatus {
    #[serde(default)]
    pub queue_running: Vec<Value>,
    #[serde(default)]
    pub queue_pending: Vec<Value>,
}

impl QueueStatus {
    fn contains(entries: &[Value], prompt_id: &str) -> bool {
        entries
            .iter()
            .any(|entry| entry.get(1).and_then(Value::as_str) == Some(prompt_id))
    }

    pub fn is_running(&self, prompt_id: &str) -> bool {
        Self::contains(&self.queue_running, prompt_id)
    }

    pub fn is_pending(&self, prompt_id: &str) -> bool {
        Self::contains(&self.queue_pending, prompt_id)
    }
}

/// One prompt's record from `GET /history/{prompt_id}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PromptHistory {
    #[serde(default)]
    pub status: Option<HistoryStatus>,
    /// Node id -> node output.
    #[serde(default)]
    pub outputs: BTreeMap<String, NodeOutput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryStatus {
    #[serde(default)]
    pub status_str: String,
    #[serde(default)]
    pub completed: bool,
    /// `[event_name, payload]` pairs.
    #[serde(default)]
    pub messages: Vec<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeOutput {
    #[serde(default)]
    pub images: Vec<ArtifactRef>,
}

/// What a history record says about the job.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryOutcome {
    /// Not finished (or the record is incomplete).
    Pending,
    Success(Vec<ArtifactRef>),
    Error(String),
}

impl PromptHistory {
    pub fn outcome(&self) -> HistoryOutcome {
        let Some(status) = &self.status else {
            return HistoryOutcome::Pending;
        };
        match status.status_str.as_str() {
            "error" => HistoryOutcome::Error(status.error_message()),
            "success" if status.completed => HistoryOutcome::Success(self.artifacts()),
            _ => HistoryOutcome::Pending,
        }
    }

    /// Saved (`type == "output"`) images, ordered by node id then by
    /// position within the node.
    pub fn artifacts(&self) -> Vec<ArtifactRef> {
        let mut nodes: Vec<_> = self.outputs.iter().collect();
        nodes.sort_by_key(|(id, _)| id.parse::<u64>().unwrap_or(u64::MAX));

        nodes
            .into_iter()
            .flat_map(|(node_id, output)| {
                output.images.iter().filter(|a| a.kind == "output").map(move |a| ArtifactRef {
                    node_id: node_id.clone(),
                    ..a.clone()
                })
            })
            .collect()
    }
}

impl HistoryStatus {
    /// Exception message of the `execution_error` event, if recorded.
    pub fn error_message(&self) -> String {
        self.messages
            .iter()
            .filter_map(Value::as_array)
            .filter(|pair| pair.first().and_then(Value::as_str) == Some("execution_error"))
            .find_map(|pair| {
                pair.get(1)?
                    .get("exception_message")?
                    .as_str()
                    .map(|s| s.trim().to_string())
            })
            .unwrap_or_else(|| "execution failed".to_string())
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// The backend endpoints used by connection probing, submission, polling
/// and artifact retrieval.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Base HTTP URL, without trailing slash.
    fn base_url(&self) -> &str;

    async fn system_stats(&self) -> Result<SystemStats, BackendError>;

    async fn object_info(&self) -> Result<NodeRegistry, BackendError>;

    /// `GET /models/{folder}`.
    async fn list_models(&self, folder: &str) -> Result<Vec<String>, BackendError>;

    async fn submit(&self, workflow: &Value, client_id: &str)
        -> Result<SubmitResponse, BackendError>;

    async fn queue(&self) -> Result<QueueStatus, BackendError>;

    /// `None` when the backend has no record of the prompt yet.
    async fn history(&self, prompt_id: &str) -> Result<Option<PromptHistory>, BackendError>;

    /// Raw bytes of an output image.
    async fn view(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, BackendError>;

    async fn delete_from_queue(&self, prompt_id: &str) -> Result<(), BackendError>;

    /// Interrupt whatever is executing right now.
    async fn interrupt(&self) -> Result<(), BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn combo_options_both_shapes() {
        let registry: NodeRegistry = serde_json::from_value(json!({
            "CheckpointLoaderSimple": {
                "input": {"required": {"ckpt_name": [["a.safetensors", "b.ckpt"], {}]}}
            },
            "LoraLoader": {
                "input": {"required": {"lora_name": ["COMBO", {"options": ["styleA.safetensors"]}]}}
            }
        }))
        .unwrap();

        assert_eq!(
            registry.input_options("CheckpointLoaderSimple", "ckpt_name"),
            Some(vec!["a.safetensors".to_string(), "b.ckpt".to_string()])
        );
        assert_eq!(
            registry.input_options("LoraLoader", "lora_name"),
            Some(vec!["styleA.safetensors".to_string()])
        );
        assert_eq!(registry.input_options("KSampler", "seed"), None);
    }

    #[test]
    fn queue_membership() {
        let queue: QueueStatus = serde_json::from_value(json!({
            "queue_running": [[3, "run-1", {}, {}, []]],
            "queue_pending": [[4, "pend-1", {}, {}, []]]
        }))
        .unwrap();
        assert!(queue.is_running("run-1"));
        assert!(queue.is_pending("pend-1"));
        assert!(!queue.is_running("pend-1"));
        assert!(!queue.is_pending("gone"));
    }

    #[test]
    fn history_success_collects_output_images() {
        let history: PromptHistory = serde_json::from_value(json!({
            "status": {"status_str": "success", "completed": true, "messages": []},
            "outputs": {
                "9": {"images": [
                    {"filename": "a_00001_.png", "subfolder": "texforge", "type": "output"},
                    {"filename": "a_00002_.png", "subfolder": "texforge", "type": "output"}
                ]},
                "12": {"images": [{"filename": "preview.png", "subfolder": "", "type": "temp"}]}
            }
        }))
        .unwrap();

        match history.outcome() {
            HistoryOutcome::Success(artifacts) => {
                assert_eq!(artifacts.len(), 2);
                assert_eq!(artifacts[0].node_id, "9");
                assert_eq!(artifacts[1].filename, "a_00002_.png");
            }
            other => panic!("Expected Success, got {other:?}"),
        }
    }

    #[test]
    fn history_error_message_extracted() {
        let history: PromptHistory = serde_json::from_value(json!({
            "status": {
                "status_str": "error",
                "completed": false,
                "messages": [
                    ["execution_start", {"prompt_id": "p"}],
                    ["execution_error", {"prompt_id": "p", "exception_message": "CUDA out of memory\n"}]
                ]
            },
            "outputs": {}
        }))
        .unwrap();
        assert_eq!(
            history.outcome(),
            HistoryOutcome::Error("CUDA out of memory".to_string())
        );
    }

    #[test]
    fn history_without_status_is_pending() {
        let history = PromptHistory::default();
        assert_eq!(history.outcome(), HistoryOutcome::Pending);
    }

    #[test]
    fn node_errors_detected() {
        let ok: SubmitResponse =
            serde_json::from_value(json!({"prompt_id": "p", "number": 1, "node_errors": {}}))
                .unwrap();
        assert!(!ok.has_node_errors());
        let bad: SubmitResponse = serde_json::from_value(
            json!({"prompt_id": "p", "number": 1, "node_errors": {"3": {"errors": []}}}),
        )
        .unwrap();
        assert!(bad.has_node_errors());
    }
}
