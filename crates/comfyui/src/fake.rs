//! In-memory [`GenerationBackend`] for tests.
//!
//! Behaves like a single ComfyUI server: submitted prompts wait in the
//! pending queue until the test moves them along with [`FakeBackend::start`],
//! [`FakeBackend::complete`] or [`FakeBackend::fail`].

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::{json, Value};
use texforge_core::job::ArtifactRef;

use crate::backend::{
    BackendError, GenerationBackend, HistoryStatus, NodeOutput, NodeRegistry, PromptHistory,
    QueueStatus, SubmitResponse, SystemInfo, SystemStats,
};
use crate::connection::BackendConnector;

const DEFAULT_NODES: &[&str] = &[
    "CheckpointLoaderSimple",
    "KSampler",
    "CLIPTextEncode",
    "EmptyLatentImage",
    "EmptySD3LatentImage",
    "VAEDecode",
    "SaveImage",
    "FluxGuidance",
    "LoraLoader",
    "UpscaleModelLoader",
    "ImageUpscaleWithModel",
];

#[derive(Debug, Clone)]
enum Phase {
    Pending,
    Running,
    Done(PromptHistory),
}

#[derive(Debug)]
struct FakeJob {
    workflow: Value,
    client_id: String,
    phase: Phase,
}

#[derive(Debug, Default)]
struct State {
    offline: bool,
    version: Option<String>,
    nodes: Vec<String>,
    checkpoints: Vec<String>,
    loras: Vec<String>,
    upscalers: Vec<String>,
    system_stats_error: Option<BackendError>,
    submit_error: Option<BackendError>,
    /// Errors returned by the next `queue`/`history` call.
    transient: HashMap<&'static str, BackendError>,
    jobs: HashMap<String, FakeJob>,
    order: Vec<String>,
    images: HashMap<String, Vec<u8>>,
    calls: Vec<String>,
}

/// Cloning shares state, so a test keeps a handle after giving one away.
#[derive(Debug, Clone)]
pub struct FakeBackend {
    state: Arc<Mutex<State>>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBackend {
    pub fn new() -> Self {
        let state = State {
            version: Some("0.3.10".to_string()),
            nodes: DEFAULT_NODES.iter().map(|n| n.to_string()).collect(),
            ..State::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -- setup --

    pub fn with_checkpoints(self, names: &[&str]) -> Self {
        self.set_checkpoints(names);
        self
    }

    pub fn with_loras(self, names: &[&str]) -> Self {
        self.lock().loras = to_strings(names);
        self
    }

    pub fn with_upscalers(self, names: &[&str]) -> Self {
        self.lock().upscalers = to_strings(names);
        self
    }

    pub fn without_node(self, class_type: &str) -> Self {
        self.lock().nodes.retain(|n| n != class_type);
        self
    }

    pub fn set_checkpoints(&self, names: &[&str]) {
        self.lock().checkpoints = to_strings(names);
    }

    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    pub fn fail_system_stats(&self, error: BackendError) {
        self.lock().system_stats_error = Some(error);
    }

    pub fn fail_submit(&self, error: BackendError) {
        self.lock().submit_error = Some(error);
    }

    /// Make the next call to `call` (`"queue"` or `"history"`) fail.
    pub fn fail_next(&self, call: &'static str, error: BackendError) {
        self.lock().transient.insert(call, error);
    }

    // -- job control --

    pub fn last_prompt_id(&self) -> Option<String> {
        self.lock().order.last().cloned()
    }

    pub fn submitted_workflow(&self, prompt_id: &str) -> Option<Value> {
        self.lock().jobs.get(prompt_id).map(|j| j.workflow.clone())
    }

    pub fn submitted_client_id(&self, prompt_id: &str) -> Option<String> {
        self.lock().jobs.get(prompt_id).map(|j| j.client_id.clone())
    }

    /// Move a pending prompt to running.
    pub fn start(&self, prompt_id: &str) {
        if let Some(job) = self.lock().jobs.get_mut(prompt_id) {
            job.phase = Phase::Running;
        }
    }

    /// Finish a prompt with `count` PNG outputs of the given size, named
    /// after the save node's filename prefix.
    pub fn complete(&self, prompt_id: &str, count: usize, width: u32, height: u32) {
        let bytes = png(width, height);
        let images = (1..=count).map(|_| bytes.clone()).collect();
        self.complete_with(prompt_id, images);
    }

    /// Finish a prompt with the given encoded images.
    pub fn complete_with(&self, prompt_id: &str, images: Vec<Vec<u8>>) {
        let mut state = self.lock();
        let Some(job) = state.jobs.get(prompt_id) else {
            return;
        };
        let prefix = job
            .workflow
            .as_object()
            .and_then(|nodes| {
                nodes
                    .values()
                    .find(|n| n.get("class_type").and_then(Value::as_str) == Some("SaveImage"))
            })
            .and_then(|n| n.get("inputs"))
            .and_then(|i| i.get("filename_prefix"))
            .and_then(Value::as_str)
            .unwrap_or("output")
            .to_string();

        let (subfolder, stem) = match prefix.rsplit_once('/') {
            Some((dir, stem)) => (dir.to_string(), stem.to_string()),
            None => (String::new(), prefix),
        };

        let mut artifacts = Vec::new();
        for (i, bytes) in images.into_iter().enumerate() {
            let filename = format!("{stem}_{:05}_.png", i + 1);
            state.images.insert(image_key(&subfolder, &filename), bytes);
            artifacts.push(ArtifactRef {
                filename,
                subfolder: subfolder.clone(),
                kind: "output".to_string(),
                node_id: String::new(),
            });
        }

        let history = PromptHistory {
            status: Some(HistoryStatus {
                status_str: "success".to_string(),
                completed: true,
                messages: vec![],
            }),
            outputs: [("9".to_string(), NodeOutput { images: artifacts })].into(),
        };
        if let Some(job) = state.jobs.get_mut(prompt_id) {
            job.phase = Phase::Done(history);
        }
    }

    /// Finish a prompt with an execution error.
    pub fn fail(&self, prompt_id: &str, message: &str) {
        let history = error_history(message);
        if let Some(job) = self.lock().jobs.get_mut(prompt_id) {
            job.phase = Phase::Done(history);
        }
    }

    /// Drop a prompt from the queue without recording history.
    pub fn forget(&self, prompt_id: &str) {
        self.lock().jobs.remove(prompt_id);
    }

    /// Replace a stored output image (e.g. with corrupt bytes).
    pub fn replace_image(&self, artifact: &ArtifactRef, bytes: Vec<u8>) {
        self.lock()
            .images
            .insert(image_key(&artifact.subfolder, &artifact.filename), bytes);
    }

    /// Names of the backend calls made so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    fn enter(&self, call: &'static str) -> Result<MutexGuard<'_, State>, BackendError> {
        let mut state = self.lock();
        state.calls.push(call.to_string());
        if state.offline {
            return Err(BackendError::Unreachable("connection refused".to_string()));
        }
        if let Some(error) = state.transient.remove(call) {
            return Err(error);
        }
        Ok(state)
    }
}

fn image_key(subfolder: &str, filename: &str) -> String {
    format!("{subfolder}/{filename}")
}

fn to_strings(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

fn error_history(message: &str) -> PromptHistory {
    PromptHistory {
        status: Some(HistoryStatus {
            status_str: "error".to_string(),
            completed: false,
            messages: vec![json!(["execution_error", {"exception_message": message}])],
        }),
        outputs: Default::default(),
    }
}

/// Encode a blank RGB PNG.
pub fn png(width: u32, height: u32) -> Vec<u8> {
    let img = image::DynamicImage::ImageRgb8(image::RgbImage::new(width, height));
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .expect("PNG encoding into memory");
    buf
}

#[async_trait]
impl GenerationBackend for FakeBackend {
    fn base_url(&self) -> &str {
        "http://fake:8188"
    }

    async fn system_stats(&self) -> Result<SystemStats, BackendError> {
        let state = self.enter("system_stats")?;
        if let Some(error) = &state.system_stats_error {
            return Err(error.clone());
        }
        Ok(SystemStats {
            system: Some(SystemInfo {
                os: Some("linux".to_string()),
                comfyui_version: state.version.clone(),
                python_version: None,
            }),
            devices: vec![],
        })
    }

    async fn object_info(&self) -> Result<NodeRegistry, BackendError> {
        let state = self.enter("object_info")?;
        let mut registry = serde_json::Map::new();
        for node in &state.nodes {
            let options = match node.as_str() {
                "CheckpointLoaderSimple" => Some(("ckpt_name", &state.checkpoints)),
                "LoraLoader" => Some(("lora_name", &state.loras)),
                "UpscaleModelLoader" => Some(("model_name", &state.upscalers)),
                _ => None,
            };
            let definition = match options {
                Some((input, list)) => json!({"input": {"required": {input: [list, {}]}}}),
                None => json!({"input": {"required": {}}}),
            };
            registry.insert(node.clone(), definition);
        }
        Ok(NodeRegistry(registry))
    }

    async fn list_models(&self, folder: &str) -> Result<Vec<String>, BackendError> {
        let state = self.enter("list_models")?;
        Ok(match folder {
            "checkpoints" => state.checkpoints.clone(),
            "loras" => state.loras.clone(),
            "upscale_models" => state.upscalers.clone(),
            _ => vec![],
        })
    }

    async fn submit(
        &self,
        workflow: &Value,
        client_id: &str,
    ) -> Result<SubmitResponse, BackendError> {
        let mut state = self.enter("submit")?;
        if let Some(error) = state.submit_error.clone() {
            return Err(error);
        }
        let number = state.order.len() as i64;
        let prompt_id = format!("prompt-{}", number + 1);
        state.jobs.insert(
            prompt_id.clone(),
            FakeJob {
                workflow: workflow.clone(),
                client_id: client_id.to_string(),
                phase: Phase::Pending,
            },
        );
        state.order.push(prompt_id.clone());
        Ok(SubmitResponse {
            prompt_id,
            number,
            node_errors: json!({}),
        })
    }

    async fn queue(&self) -> Result<QueueStatus, BackendError> {
        let state = self.enter("queue")?;
        let mut queue = QueueStatus::default();
        for (number, id) in state.order.iter().enumerate() {
            let entry = json!([number, id, {}, {}, []]);
            match state.jobs.get(id).map(|j| &j.phase) {
                Some(Phase::Pending) => queue.queue_pending.push(entry),
                Some(Phase::Running) => queue.queue_running.push(entry),
                _ => {}
            }
        }
        Ok(queue)
    }

    async fn history(&self, prompt_id: &str) -> Result<Option<PromptHistory>, BackendError> {
        let state = self.enter("history")?;
        Ok(match state.jobs.get(prompt_id).map(|j| &j.phase) {
            Some(Phase::Done(history)) => Some(history.clone()),
            _ => None,
        })
    }

    async fn view(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, BackendError> {
        let state = self.enter("view")?;
        state
            .images
            .get(&image_key(&artifact.subfolder, &artifact.filename))
            .cloned()
            .ok_or_else(|| BackendError::Http {
                status: 404,
                body: format!("{} not found", artifact.filename),
            })
    }

    async fn delete_from_queue(&self, prompt_id: &str) -> Result<(), BackendError> {
        let mut state = self.enter("delete_from_queue")?;
        if let Some(job) = state.jobs.get(prompt_id) {
            if matches!(job.phase, Phase::Pending) {
                state.jobs.remove(prompt_id);
            }
        }
        Ok(())
    }

    async fn interrupt(&self) -> Result<(), BackendError> {
        let mut state = self.enter("interrupt")?;
        for job in state.jobs.values_mut() {
            if matches!(job.phase, Phase::Running) {
                job.phase = Phase::Done(error_history("Interrupted"));
            }
        }
        Ok(())
    }
}

/// Connector that always hands out the same fake.
#[derive(Debug, Clone)]
pub struct FakeConnector {
    backend: FakeBackend,
}

impl FakeConnector {
    pub fn new(backend: FakeBackend) -> Self {
        Self { backend }
    }
}

impl BackendConnector for FakeConnector {
    fn open(&self, _url: &str) -> Result<Arc<dyn GenerationBackend>, BackendError> {
        Ok(Arc::new(self.backend.clone()))
    }
}
