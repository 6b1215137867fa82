//! Backend connection management and capability probing.
//!
//! [`ConnectionManager`] owns the endpoint URL, the connection status and
//! the capability snapshot. State is published through a
//! [`tokio::sync::watch`] channel so a UI can render connection
//! indicators; everything that binds jobs reads the snapshot as an
//! `Arc<Capabilities>`.

use std::sync::Arc;
use std::time::Duration;

use texforge_core::capabilities::Capabilities;
use texforge_core::template::{
    CHECKPOINT_LOADER_CLASS, LORA_LOADER_CLASS, REQUIRED_CORE_NODES, UPSCALE_LOADER_CLASS,
    UPSCALE_WITH_MODEL_CLASS,
};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::api::{ApiTimeouts, ComfyUIApi};
use crate::backend::{BackendError, GenerationBackend, NodeRegistry};

/// Used when the configured URL is blank.
pub const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:8188";

/// Default age after which the capability snapshot is re-probed.
pub const DEFAULT_CAPABILITY_TTL: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConnectionError {
    #[error("Backend at {url} is unreachable: {message}")]
    Unreachable { url: String, message: String },

    #[error("Backend at {url} rejected the request (HTTP {status})")]
    AuthRejected { url: String, status: u16 },

    #[error("Backend at {url} is not compatible: {reason}")]
    IncompatibleVersion { url: String, reason: String },
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connected,
    Error(String),
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error(_) => "error",
        }
    }
}

/// Published backend state.
#[derive(Debug, Clone)]
pub struct Backend {
    pub url: String,
    pub status: ConnectionStatus,
    /// Empty unless connected.
    pub capabilities: Arc<Capabilities>,
    /// When the capabilities were last probed.
    pub probed_at: Option<Instant>,
}

impl Backend {
    fn disconnected(url: String) -> Self {
        Self {
            url,
            status: ConnectionStatus::Disconnected,
            capabilities: Arc::new(Capabilities::default()),
            probed_at: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}

// ---------------------------------------------------------------------------
// Connectors
// ---------------------------------------------------------------------------

/// Opens a backend client for a URL.
pub trait BackendConnector: Send + Sync {
    fn open(&self, url: &str) -> Result<Arc<dyn GenerationBackend>, BackendError>;
}

/// Opens [`ComfyUIApi`] clients.
#[derive(Debug, Clone, Default)]
pub struct HttpConnector {
    pub timeouts: ApiTimeouts,
}

impl BackendConnector for HttpConnector {
    fn open(&self, url: &str) -> Result<Arc<dyn GenerationBackend>, BackendError> {
        Ok(Arc::new(ComfyUIApi::new(url, self.timeouts)?))
    }
}

/// Blank -> default URL; missing scheme -> `http://`; trailing `/` removed.
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return DEFAULT_BACKEND_URL.to_string();
    }
    let with_scheme = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };
    with_scheme.trim_end_matches('/').to_string()
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct ConnectionManager {
    connector: Arc<dyn BackendConnector>,
    state: watch::Sender<Backend>,
    client: Option<Arc<dyn GenerationBackend>>,
    min_version: Option<String>,
}

impl ConnectionManager {
    /// Starts disconnected from the default URL.
    pub fn new(connector: Arc<dyn BackendConnector>) -> Self {
        let (state, _) = watch::channel(Backend::disconnected(DEFAULT_BACKEND_URL.to_string()));
        Self {
            connector,
            state,
            client: None,
            min_version: None,
        }
    }

    /// Reject backends reporting a `comfyui_version` below `version`.
    pub fn with_min_version(mut self, version: impl Into<String>) -> Self {
        self.min_version = Some(version.into());
        self
    }

    /// Receive every state change.
    pub fn subscribe(&self) -> watch::Receiver<Backend> {
        self.state.subscribe()
    }

    pub fn backend(&self) -> Backend {
        self.state.borrow().clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.borrow().status.clone()
    }

    /// Current capability snapshot (empty unless connected).
    pub fn capabilities(&self) -> Arc<Capabilities> {
        Arc::clone(&self.state.borrow().capabilities)
    }

    /// Client for the connected backend.
    pub fn client(&self) -> Option<Arc<dyn GenerationBackend>> {
        self.client.clone()
    }

    /// Handshake with the backend at `url` and probe its capabilities.
    ///
    /// On failure the status becomes `Error` and capabilities are cleared.
    pub async fn connect(&mut self, url: &str) -> Result<Backend, ConnectionError> {
        let url = normalize_url(url);
        tracing::info!(url = %url, "Connecting to backend");

        match self.probe(&url).await {
            Ok((client, capabilities)) => {
                let backend = Backend {
                    url: url.clone(),
                    status: ConnectionStatus::Connected,
                    capabilities: Arc::new(capabilities),
                    probed_at: Some(Instant::now()),
                };
                tracing::info!(
                    url = %url,
                    version = ?backend.capabilities.backend_version,
                    families = backend.capabilities.families.len(),
                    loras = backend.capabilities.loras.len(),
                    upscalers = backend.capabilities.upscalers.len(),
                    "Backend connected",
                );
                self.client = Some(client);
                self.state.send_replace(backend.clone());
                Ok(backend)
            }
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "Backend connection failed");
                self.client = None;
                self.state.send_replace(Backend {
                    status: ConnectionStatus::Error(e.to_string()),
                    ..Backend::disconnected(url)
                });
                Err(e)
            }
        }
    }

    /// Forget the backend; capabilities are cleared.
    pub fn disconnect(&mut self) {
        self.client = None;
        let url = self.state.borrow().url.clone();
        tracing::info!(url = %url, "Backend disconnected");
        self.state.send_replace(Backend::disconnected(url));
    }

    /// Re-probe the current URL.
    pub async fn refresh(&mut self) -> Result<Backend, ConnectionError> {
        let url = self.state.borrow().url.clone();
        self.connect(&url).await
    }

    /// Re-probe when connected and the snapshot is older than `ttl`.
    /// Returns whether a probe ran.
    pub async fn refresh_if_stale(&mut self, ttl: Duration) -> Result<bool, ConnectionError> {
        let stale = {
            let backend = self.state.borrow();
            backend.is_connected()
                && backend.probed_at.map_or(true, |at| at.elapsed() >= ttl)
        };
        if !stale {
            return Ok(false);
        }
        tracing::debug!(ttl_secs = ttl.as_secs(), "Capability snapshot stale, re-probing");
        self.refresh().await.map(|_| true)
    }

    // ---- private helpers ----

    async fn probe(
        &self,
        url: &str,
    ) -> Result<(Arc<dyn GenerationBackend>, Capabilities), ConnectionError> {
        let client = self
            .connector
            .open(url)
            .map_err(|e| classify(url, e))?;

        let stats = client.system_stats().await.map_err(|e| classify(url, e))?;
        let incompatible = |reason: String| ConnectionError::IncompatibleVersion {
            url: url.to_string(),
            reason,
        };

        let system = stats
            .system
            .ok_or_else(|| incompatible("no system block in /system_stats".to_string()))?;
        if let Some(min) = &self.min_version {
            match &system.comfyui_version {
                Some(v) if version_at_least(v, min) => {}
                Some(v) => return Err(incompatible(format!("version {v} is older than {min}"))),
                None => return Err(incompatible(format!("no version reported, {min} required"))),
            }
        }

        let registry = client.object_info().await.map_err(|e| classify(url, e))?;
        if let Some(missing) = REQUIRED_CORE_NODES.iter().find(|n| !registry.has_node(n)) {
            return Err(incompatible(format!("node type {missing} is not registered")));
        }

        let backend = client.as_ref();
        let checkpoints = model_list(backend, &registry, CHECKPOINT_LOADER_CLASS, "ckpt_name", "checkpoints")
            .await
            .map_err(|e| classify(url, e))?;
        let loras = optional_list(backend, &registry, LORA_LOADER_CLASS, "lora_name", "loras").await;
        let upscalers = optional_list(
            backend,
            &registry,
            UPSCALE_LOADER_CLASS,
            "model_name",
            "upscale_models",
        )
        .await;

        let mut capabilities = Capabilities::from_models(
            &checkpoints,
            loras,
            upscalers,
            registry.has_node(LORA_LOADER_CLASS),
            registry.has_node(UPSCALE_LOADER_CLASS) && registry.has_node(UPSCALE_WITH_MODEL_CLASS),
        );
        capabilities.backend_version = system.comfyui_version;

        Ok((client, capabilities))
    }
}

/// Map a backend error during the handshake onto the connection taxonomy.
fn classify(url: &str, e: BackendError) -> ConnectionError {
    match e {
        e if e.is_auth() => ConnectionError::AuthRejected {
            url: url.to_string(),
            status: e.status().unwrap_or_default(),
        },
        BackendError::Unreachable(message) => ConnectionError::Unreachable {
            url: url.to_string(),
            message,
        },
        BackendError::Http { status, body } if status >= 500 => ConnectionError::Unreachable {
            url: url.to_string(),
            message: format!("HTTP {status}: {body}"),
        },
        other => ConnectionError::IncompatibleVersion {
            url: url.to_string(),
            reason: other.to_string(),
        },
    }
}

/// Model names from the registry's combo options, else `/models/{folder}`.
async fn model_list(
    client: &dyn GenerationBackend,
    registry: &NodeRegistry,
    class_type: &str,
    input: &str,
    folder: &str,
) -> Result<Vec<String>, BackendError> {
    match registry.input_options(class_type, input) {
        Some(list) => Ok(list),
        None => client.list_models(folder).await,
    }
}

/// Like [`model_list`] but a failed fallback yields an empty list.
async fn optional_list(
    client: &dyn GenerationBackend,
    registry: &NodeRegistry,
    class_type: &str,
    input: &str,
    folder: &str,
) -> Vec<String> {
    model_list(client, registry, class_type, input, folder)
        .await
        .unwrap_or_else(|e| {
            tracing::warn!(folder, error = %e, "Could not list models, treating as none");
            Vec::new()
        })
}

/// Compare dotted numeric versions (`0.3.10` >= `0.3.9`). A leading `v`
/// and non-numeric suffixes are ignored.
pub fn version_at_least(version: &str, min: &str) -> bool {
    fn parts(v: &str) -> Vec<u64> {
        v.trim()
            .trim_start_matches('v')
            .split('.')
            .map(|p| {
                p.chars()
                    .take_while(char::is_ascii_digit)
                    .collect::<String>()
                    .parse()
                    .unwrap_or(0)
            })
            .collect()
    }
    let (mut a, mut b) = (parts(version), parts(min));
    let len = a.len().max(b.len());
    a.resize(len, 0);
    b.resize(len, 0);
    a >= b
}
