//! Session facade driving one generation workflow end to end.
//!
//! [`GenerationSession`] owns the backend connection, the template engine,
//! the history store and the job poller. The host calls it from a single
//! logical stream of actions:
//!
//! ```text
//! connect -> generate -> poll ... poll -> finish -> materialize
//! ```
//!
//! Every terminal job, successful or not, is recorded in history exactly
//! once. Lifecycle events are broadcast to subscribers.

use std::collections::HashSet;
use std::sync::Arc;

use texforge_comfyui::client::ProgressClient;
use texforge_comfyui::connection::{
    Backend, BackendConnector, ConnectionError, ConnectionManager, HttpConnector,
};
use texforge_comfyui::events::GenerationEvent;
use texforge_comfyui::poller::{FetchError, JobHandle, JobPoller, PollerConfig};
use texforge_comfyui::progress::ProgressFeed;
use texforge_comfyui::reconnect::ReconnectConfig;
use texforge_comfyui::stream::ProgressStream;
use texforge_core::capabilities::Capabilities;
use texforge_core::engine::TemplateEngine;
use texforge_core::error::BindError;
use texforge_core::history::{HistoryEntry, HistoryError, HistoryFilter, HistoryStore};
use texforge_core::job::{ImageAsset, JobRequest, JobState};
use texforge_core::materializer::{material_name, MaterializeRequest, ResultMaterializer};
use texforge_core::naming::DEFAULT_NAME_PREFIX;
use texforge_core::params::{GenerationInputs, SeedMode};
use texforge_core::template::TemplateError;
use texforge_core::types::{EntryId, RequestId};
use tokio::sync::{broadcast, watch};

use crate::config::PipelineConfig;

/// Broadcast channel capacity for generation events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Not connected to a backend")]
    NotConnected,

    #[error("Request {0} was already submitted")]
    DuplicateRequest(RequestId),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error("Materialization failed: {0}")]
    Materialize(Box<dyn std::error::Error + Send + Sync>),
}

/// A succeeded job with its decoded images, recorded in history.
#[derive(Debug, Clone)]
pub struct FinishedJob {
    pub entry_id: EntryId,
    pub assets: Vec<ImageAsset>,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

pub struct GenerationSession {
    config: PipelineConfig,
    connection: ConnectionManager,
    engine: TemplateEngine,
    history: HistoryStore,
    poller: Option<JobPoller>,
    progress: ProgressFeed,
    stream: Option<ProgressStream>,
    event_tx: broadcast::Sender<GenerationEvent>,
    client_id: String,
    name_prefix: String,
    /// Submitted requests not yet recorded in history.
    in_flight: HashSet<RequestId>,
}

impl GenerationSession {
    /// Session talking HTTP to a ComfyUI backend.
    pub fn new(config: PipelineConfig) -> Result<Self, SessionError> {
        let connector = HttpConnector {
            timeouts: config.api_timeouts(),
        };
        Self::with_connector(config, Arc::new(connector))
    }

    /// Session opening backends through `connector`.
    pub fn with_connector(
        config: PipelineConfig,
        connector: Arc<dyn BackendConnector>,
    ) -> Result<Self, SessionError> {
        let mut connection = ConnectionManager::new(connector);
        if let Some(min) = &config.min_backend_version {
            connection = connection.with_min_version(min.clone());
        }

        let engine = TemplateEngine::builtin()?.with_output_subfolder(config.output_subfolder.clone());
        let history = match &config.history_path {
            Some(path) => HistoryStore::open(path.clone())?,
            None => HistoryStore::in_memory(),
        };
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let client_id = uuid::Uuid::new_v4().to_string();

        tracing::debug!(
            client_id = %client_id,
            history = ?config.history_path,
            entries = history.len(),
            "Generation session created",
        );

        Ok(Self {
            config,
            connection,
            engine,
            history,
            poller: None,
            progress: ProgressFeed::new(),
            stream: None,
            event_tx,
            client_id,
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
            in_flight: HashSet::new(),
        })
    }

    /// Prefix for material and image names.
    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn engine(&self) -> &TemplateEngine {
        &self.engine
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Subscribe to generation events.
    pub fn subscribe(&self) -> broadcast::Receiver<GenerationEvent> {
        self.event_tx.subscribe()
    }

    /// Watch backend connection state.
    pub fn backend_state(&self) -> watch::Receiver<Backend> {
        self.connection.subscribe()
    }

    pub fn capabilities(&self) -> Arc<Capabilities> {
        self.connection.capabilities()
    }

    // -- connection --

    /// Connect to `url`, or the configured URL when `None`.
    pub async fn connect(&mut self, url: Option<&str>) -> Result<Backend, SessionError> {
        let url = url.unwrap_or(self.config.backend_url.as_str()).to_string();
        self.stop_stream().await;
        self.poller = None;

        let backend = match self.connection.connect(&url).await {
            Ok(backend) => backend,
            Err(e) => {
                let _ = self.event_tx.send(GenerationEvent::BackendDisconnected { url });
                return Err(e.into());
            }
        };
        let client = self.connection.client().ok_or(SessionError::NotConnected)?;

        let poller_config = PollerConfig {
            timeout: self.config.job_timeout(),
        };
        let mut poller = JobPoller::new(client, self.client_id.clone(), poller_config);
        if self.config.stream_progress {
            poller = poller.with_progress(self.progress.clone());
            self.stream = Some(ProgressStream::spawn(
                ProgressClient::new(&backend.url, self.client_id.clone()),
                self.progress.clone(),
                self.event_tx.clone(),
                ReconnectConfig::default(),
            ));
        }
        self.poller = Some(poller);

        let _ = self.event_tx.send(GenerationEvent::BackendConnected {
            url: backend.url.clone(),
            version: backend.capabilities.backend_version.clone(),
        });
        Ok(backend)
    }

    /// Drop the backend and stop the progress stream.
    pub async fn disconnect(&mut self) {
        self.stop_stream().await;
        self.poller = None;
        self.connection.disconnect();
        let url = self.connection.backend().url;
        let _ = self.event_tx.send(GenerationEvent::BackendDisconnected { url });
    }

    /// Re-probe capabilities now.
    pub async fn refresh(&mut self) -> Result<Arc<Capabilities>, SessionError> {
        self.require_connected()?;
        let backend = self.connection.refresh().await?;
        Ok(backend.capabilities)
    }

    async fn stop_stream(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.shutdown().await;
        }
    }

    fn require_connected(&self) -> Result<(), SessionError> {
        if self.connection.backend().is_connected() {
            Ok(())
        } else {
            Err(SessionError::NotConnected)
        }
    }

    /// Current capabilities, re-probed first when older than the TTL.
    async fn fresh_capabilities(&mut self) -> Result<Arc<Capabilities>, SessionError> {
        self.require_connected()?;
        self.connection
            .refresh_if_stale(self.config.capability_ttl())
            .await?;
        Ok(self.connection.capabilities())
    }

    // -- jobs --

    /// Validate and bind inputs into a job request. Nothing is sent.
    pub async fn bind(&mut self, inputs: &GenerationInputs) -> Result<JobRequest, SessionError> {
        let caps = self.fresh_capabilities().await?;
        let request = self.engine.prepare(inputs, &caps)?;
        tracing::debug!(
            request_id = %request.id,
            family = %request.bound.family,
            seed = request.seed(),
            "Bound job request",
        );
        Ok(request)
    }

    /// Submit a bound request.
    ///
    /// A request the backend refuses or cannot receive comes back as a
    /// failed handle and is recorded in history.
    pub async fn submit(&mut self, request: JobRequest) -> Result<JobHandle, SessionError> {
        let poller = self.poller.as_ref().ok_or(SessionError::NotConnected)?;
        if self.in_flight.contains(&request.id)
            || self.history.list().any(|e| e.request.id == request.id)
        {
            return Err(SessionError::DuplicateRequest(request.id));
        }

        let request = Arc::new(request);
        match poller.submit(Arc::clone(&request)).await {
            Ok(handle) => {
                self.in_flight.insert(request.id);
                if let Some(prompt_id) = handle.prompt_id() {
                    let _ = self.event_tx.send(GenerationEvent::JobSubmitted {
                        request_id: request.id,
                        prompt_id: prompt_id.to_string(),
                    });
                }
                Ok(handle)
            }
            Err(e) => {
                let handle = JobHandle::failed_submission(request, &e);
                self.in_flight.insert(handle.request().id);
                self.settle(&handle)?;
                Ok(handle)
            }
        }
    }

    /// Bind and submit in one step.
    pub async fn generate(&mut self, inputs: &GenerationInputs) -> Result<JobHandle, SessionError> {
        let request = self.bind(inputs).await?;
        self.submit(request).await
    }

    /// One poll step. Failures are recorded as soon as they are observed;
    /// successes are recorded by [`finish`](Self::finish).
    pub async fn poll(&mut self, handle: &mut JobHandle) -> Result<JobState, SessionError> {
        let poller = self.poller.as_ref().ok_or(SessionError::NotConnected)?;
        let state = poller.poll(handle).await;
        if state.is_terminal() && state != JobState::Succeeded {
            self.settle(handle)?;
        }
        Ok(state)
    }

    /// Poll on the configured interval until the job is terminal.
    pub async fn wait(&mut self, handle: &mut JobHandle) -> Result<JobState, SessionError> {
        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let state = self.poll(handle).await?;
            if state.is_terminal() {
                return Ok(state);
            }
        }
    }

    /// Cancel a job. Returns whether it was still running.
    pub async fn cancel(&mut self, handle: &mut JobHandle) -> Result<bool, SessionError> {
        let cancelled = match &self.poller {
            Some(poller) => poller.cancel(handle).await,
            // Without a backend the job can still be given up locally.
            None => handle.mark_cancelled(),
        };
        if cancelled {
            self.settle(handle)?;
        }
        Ok(cancelled)
    }

    /// Fetch the images of a succeeded job and record it.
    ///
    /// When the images are missing or corrupt the job is failed and
    /// recorded as such.
    pub async fn finish(&mut self, handle: &mut JobHandle) -> Result<FinishedJob, SessionError> {
        let poller = self.poller.as_ref().ok_or(SessionError::NotConnected)?;
        match poller.fetch_artifacts(handle).await {
            Ok(assets) => {
                let entry_id = self.record(handle)?;
                if let Some(prompt_id) = handle.prompt_id() {
                    let _ = self.event_tx.send(GenerationEvent::JobCompleted {
                        request_id: handle.request().id,
                        prompt_id: prompt_id.to_string(),
                        artifacts: assets.len(),
                    });
                }
                Ok(FinishedJob { entry_id, assets })
            }
            Err(e) => {
                if e.failure_kind().is_some() {
                    self.settle(handle)?;
                }
                Err(e.into())
            }
        }
    }

    /// Hand a finished job to the host's materializer.
    pub fn materialize<M: ResultMaterializer>(
        &self,
        materializer: &mut M,
        finished: &FinishedJob,
    ) -> Result<M::Output, SessionError> {
        let entry = self
            .history
            .get(finished.entry_id)
            .ok_or(HistoryError::NotFound(finished.entry_id))?;
        let name = material_name(&self.name_prefix, entry);
        tracing::info!(entry_id = entry.id, name = %name, "Materializing generation");

        materializer
            .materialize(MaterializeRequest {
                name: &name,
                assets: &finished.assets,
                controls: &entry.request.bound.controls,
                output: &entry.request.bound.output,
            })
            .map_err(|e| SessionError::Materialize(Box::new(e)))
    }

    // -- history --

    /// Rebind a recorded entry's parameters. Nothing is sent.
    pub async fn reuse(&mut self, id: EntryId, seed_mode: SeedMode) -> Result<JobRequest, SessionError> {
        let caps = self.fresh_capabilities().await?;
        Ok(self.history.reuse_parameters(id, &self.engine, &caps, seed_mode)?)
    }

    /// Rebind a failed or cancelled entry and submit it again.
    pub async fn retry(&mut self, id: EntryId, seed_mode: SeedMode) -> Result<JobHandle, SessionError> {
        let caps = self.fresh_capabilities().await?;
        let request = self.history.retry(id, &self.engine, &caps, seed_mode)?;
        tracing::info!(entry_id = id, request_id = %request.id, "Retrying generation");
        self.submit(request).await
    }

    pub fn remove_entry(&mut self, id: EntryId) -> Result<HistoryEntry, SessionError> {
        Ok(self.history.remove(id)?)
    }

    pub fn clear_history(&mut self) -> Result<(), SessionError> {
        Ok(self.history.clear()?)
    }

    /// Drop finished entries by outcome. Returns how many were dropped.
    pub fn clear_history_where(&mut self, filter: HistoryFilter) -> Result<usize, SessionError> {
        Ok(self.history.clear_where(filter)?)
    }

    /// Stop background tasks.
    pub async fn shutdown(mut self) {
        self.stop_stream().await;
    }

    // -- internals --

    /// Record a terminal handle and emit its event, once per request.
    fn settle(&mut self, handle: &JobHandle) -> Result<(), SessionError> {
        if !self.in_flight.contains(&handle.request().id) {
            return Ok(());
        }
        self.record(handle)?;

        let request_id = handle.request().id;
        let event = match handle.state() {
            JobState::Cancelled => GenerationEvent::JobCancelled { request_id },
            JobState::Failed { failure } => GenerationEvent::JobFailed {
                request_id,
                reason: failure.to_string(),
            },
            _ => return Ok(()),
        };
        let _ = self.event_tx.send(event);
        Ok(())
    }

    fn record(&mut self, handle: &JobHandle) -> Result<EntryId, SessionError> {
        let request = handle.request().as_ref().clone();
        let entry = HistoryEntry::new(request, handle.snapshot());
        let id = self.history.record(entry)?;
        self.in_flight.remove(&handle.request().id);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::time::Duration;
    use texforge_comfyui::fake::{FakeBackend, FakeConnector};
    use texforge_core::error::{CapabilityMismatchError, MismatchReason};
    use texforge_core::family::ModelFamily;
    use texforge_core::job::FailureKind;
    use texforge_core::materializer::ControlValue;
    use texforge_core::params::{LoraSelection, OutputKind, TextureMap};

    const SD15: &str = "v1-5-pruned-emaonly.safetensors";
    const FLUX_DEV: &str = "flux1-dev-fp8.safetensors";

    fn config() -> PipelineConfig {
        PipelineConfig {
            stream_progress: false,
            ..PipelineConfig::default()
        }
    }

    async fn connected(fake: &FakeBackend) -> GenerationSession {
        let mut session =
            GenerationSession::with_connector(config(), Arc::new(FakeConnector::new(fake.clone())))
                .unwrap();
        session.connect(None).await.unwrap();
        session
    }

    fn inputs(checkpoint: &str, prompt: &str) -> GenerationInputs {
        let mut inputs = GenerationInputs::default();
        inputs.params.checkpoint = checkpoint.to_string();
        inputs.params.prompt = prompt.to_string();
        inputs.params.width = 512;
        inputs.params.height = 512;
        inputs
    }

    async fn run_to_success(
        session: &mut GenerationSession,
        fake: &FakeBackend,
        handle: &mut JobHandle,
        count: usize,
    ) {
        let prompt_id = handle.prompt_id().unwrap().to_string();
        fake.start(&prompt_id);
        assert_eq!(session.poll(handle).await.unwrap(), JobState::Running);
        fake.complete(&prompt_id, count, 512, 512);
        assert_eq!(session.poll(handle).await.unwrap(), JobState::Succeeded);
    }

    #[derive(Default)]
    struct Recorder {
        names: Vec<String>,
        groups: Vec<Option<Vec<(&'static str, ControlValue)>>>,
    }

    impl ResultMaterializer for Recorder {
        type Output = usize;
        type Error = std::io::Error;

        fn materialize(&mut self, request: MaterializeRequest<'_>) -> Result<usize, Self::Error> {
            self.names.push(request.name.to_string());
            self.groups.push(request.control_group());
            Ok(request.assets.len())
        }
    }

    #[tokio::test]
    async fn operations_require_connection() {
        let fake = FakeBackend::new().with_checkpoints(&[SD15]);
        let mut session =
            GenerationSession::with_connector(config(), Arc::new(FakeConnector::new(fake))).unwrap();

        assert_matches!(
            session.generate(&inputs(SD15, "brick wall")).await,
            Err(SessionError::NotConnected)
        );
    }

    #[tokio::test]
    async fn connect_emits_event() {
        let fake = FakeBackend::new().with_checkpoints(&[SD15]);
        let mut session =
            GenerationSession::with_connector(config(), Arc::new(FakeConnector::new(fake))).unwrap();
        let mut rx = session.subscribe();

        session.connect(Some("gpu-box:8188")).await.unwrap();
        assert_matches!(
            rx.try_recv(),
            Ok(GenerationEvent::BackendConnected { url, version })
                if url == "http://gpu-box:8188" && version.as_deref() == Some("0.3.10")
        );

        session.disconnect().await;
        assert!(session.capabilities().is_empty());
        assert_matches!(rx.try_recv(), Ok(GenerationEvent::BackendDisconnected { .. }));
    }

    #[tokio::test]
    async fn sd15_material_end_to_end() {
        let fake = FakeBackend::new().with_checkpoints(&[SD15]);
        let mut session = connected(&fake).await;
        let mut rx = session.subscribe();

        let mut handle = session.generate(&inputs(SD15, "brick wall")).await.unwrap();
        assert_eq!(handle.state(), &JobState::Queued);
        assert_matches!(rx.try_recv(), Ok(GenerationEvent::JobSubmitted { .. }));

        run_to_success(&mut session, &fake, &mut handle, 1).await;
        let finished = session.finish(&mut handle).await.unwrap();
        assert_eq!(finished.assets.len(), 1);

        let entry = session.history().get(finished.entry_id).unwrap();
        assert_eq!(entry.state(), &JobState::Succeeded);
        assert_eq!(entry.job.artifacts.len(), 1);
        assert_eq!(entry.request.bound.family, ModelFamily::Sd15);
        assert_matches!(rx.try_recv(), Ok(GenerationEvent::JobCompleted { artifacts: 1, .. }));

        let mut recorder = Recorder::default();
        assert_eq!(session.materialize(&mut recorder, &finished).unwrap(), 1);
        assert_eq!(recorder.names, vec![format!("Diffusion_{:03}_brick_wall", finished.entry_id)]);
        assert!(recorder.groups[0].is_some());
    }

    #[tokio::test]
    async fn texture_only_produces_one_image_per_map() {
        let fake = FakeBackend::new().with_checkpoints(&[SD15]);
        let mut session = connected(&fake).await;

        let mut inputs = inputs(SD15, "brick wall");
        inputs.output = OutputKind::TextureOnly {
            maps: vec![TextureMap::BaseColor, TextureMap::Normal, TextureMap::Height],
        };
        let mut handle = session.generate(&inputs).await.unwrap();
        run_to_success(&mut session, &fake, &mut handle, 3).await;

        let finished = session.finish(&mut handle).await.unwrap();
        assert_eq!(finished.assets.len(), 3);
        assert_eq!(finished.assets[2].map, Some(TextureMap::Height));
        let entry = session.history().get(finished.entry_id).unwrap();
        assert_eq!(entry.job.artifacts.len(), 3);

        let mut recorder = Recorder::default();
        session.materialize(&mut recorder, &finished).unwrap();
        assert!(recorder.groups[0].is_none());
    }

    #[tokio::test]
    async fn flux_with_lora_on_backend_without_lora_fails_to_bind() {
        let fake = FakeBackend::new()
            .with_checkpoints(&[FLUX_DEV])
            .without_node("LoraLoader");
        let mut session = connected(&fake).await;

        let mut inputs = inputs(FLUX_DEV, "rusty metal");
        inputs.params.lora = Some(LoraSelection {
            name: "styleA".to_string(),
            strength: 1.0,
        });

        let err = session.generate(&inputs).await.unwrap_err();
        assert_matches!(
            err,
            SessionError::Bind(BindError::CapabilityMismatch(CapabilityMismatchError {
                reason: MismatchReason::BackendLacksFeature,
                ..
            }))
        );
        assert!(session.history().is_empty());
        assert!(fake.last_prompt_id().is_none());
    }

    #[tokio::test]
    async fn backend_failure_is_recorded_once() {
        let fake = FakeBackend::new().with_checkpoints(&[SD15]);
        let mut session = connected(&fake).await;
        let mut rx = session.subscribe();

        let mut handle = session.generate(&inputs(SD15, "brick wall")).await.unwrap();
        let prompt_id = handle.prompt_id().unwrap().to_string();
        fake.start(&prompt_id);
        session.poll(&mut handle).await.unwrap();
        fake.fail(&prompt_id, "CUDA out of memory");

        assert_matches!(session.poll(&mut handle).await.unwrap(), JobState::Failed { .. });
        session.poll(&mut handle).await.unwrap();
        assert_eq!(session.history().len(), 1);

        let _ = rx.try_recv();
        assert_matches!(
            rx.try_recv(),
            Ok(GenerationEvent::JobFailed { reason, .. }) if reason.contains("CUDA out of memory")
        );
    }

    #[tokio::test]
    async fn unreachable_submission_returns_failed_handle() {
        let fake = FakeBackend::new().with_checkpoints(&[SD15]);
        let mut session = connected(&fake).await;
        let request = session.bind(&inputs(SD15, "brick wall")).await.unwrap();

        fake.set_offline(true);
        let handle = session.submit(request.clone()).await.unwrap();
        assert_matches!(
            handle.state(),
            JobState::Failed { failure: FailureKind::SubmissionUnreachable { .. } }
        );
        assert_eq!(session.history().len(), 1);

        fake.set_offline(false);
        assert_matches!(
            session.submit(request).await,
            Err(SessionError::DuplicateRequest(_))
        );
    }

    #[tokio::test]
    async fn cancel_records_and_blocks_fetch() {
        let fake = FakeBackend::new().with_checkpoints(&[SD15]);
        let mut session = connected(&fake).await;

        let mut handle = session.generate(&inputs(SD15, "brick wall")).await.unwrap();
        assert!(session.cancel(&mut handle).await.unwrap());
        assert_eq!(handle.state(), &JobState::Cancelled);
        assert_eq!(session.history().list().next().unwrap().state(), &JobState::Cancelled);

        assert_matches!(
            session.finish(&mut handle).await,
            Err(SessionError::Fetch(FetchError::Cancelled(_)))
        );
        assert!(!session.cancel(&mut handle).await.unwrap());
        assert_eq!(session.history().len(), 1);
    }

    #[tokio::test]
    async fn corrupt_result_fails_and_records() {
        let fake = FakeBackend::new().with_checkpoints(&[SD15]);
        let mut session = connected(&fake).await;

        let mut handle = session.generate(&inputs(SD15, "brick wall")).await.unwrap();
        run_to_success(&mut session, &fake, &mut handle, 1).await;
        fake.replace_image(&handle.artifacts()[0], b"garbage".to_vec());

        assert_matches!(
            session.finish(&mut handle).await,
            Err(SessionError::Fetch(FetchError::Corrupt(_)))
        );
        let entry = session.history().list().next().unwrap();
        assert_matches!(entry.job.failure(), Some(FailureKind::FetchCorrupt { .. }));
    }

    #[tokio::test]
    async fn reuse_keeps_bound_parameters() {
        let fake = FakeBackend::new().with_checkpoints(&[SD15]);
        let mut session = connected(&fake).await;

        let mut handle = session.generate(&inputs(SD15, "brick wall")).await.unwrap();
        run_to_success(&mut session, &fake, &mut handle, 1).await;
        let finished = session.finish(&mut handle).await.unwrap();

        let reused = session.reuse(finished.entry_id, SeedMode::Fixed).await.unwrap();
        let original = &session.history().get(finished.entry_id).unwrap().request;
        assert_ne!(reused.id, original.id);
        assert_eq!(reused.bound, original.bound);
        assert_eq!(reused.workflow.len(), original.workflow.len());
    }

    #[tokio::test]
    async fn retry_only_for_failed_entries() {
        let fake = FakeBackend::new().with_checkpoints(&[SD15]);
        let mut session = connected(&fake).await;

        let mut handle = session.generate(&inputs(SD15, "brick wall")).await.unwrap();
        session.cancel(&mut handle).await.unwrap();
        let cancelled_id = session.history().list().next().unwrap().id;

        let retried = session.retry(cancelled_id, SeedMode::Fixed).await.unwrap();
        assert_eq!(retried.state(), &JobState::Queued);
        assert_eq!(retried.request().seed(), handle.request().seed());

        let mut done = retried;
        run_to_success(&mut session, &fake, &mut done, 1).await;
        let finished = session.finish(&mut done).await.unwrap();
        assert_matches!(
            session.retry(finished.entry_id, SeedMode::Fixed).await,
            Err(SessionError::History(HistoryError::NotRetryable { .. }))
        );
    }

    #[tokio::test]
    async fn remove_and_clear_history() {
        let fake = FakeBackend::new().with_checkpoints(&[SD15]);
        let mut session = connected(&fake).await;
        for _ in 0..2 {
            let mut handle = session.generate(&inputs(SD15, "brick wall")).await.unwrap();
            session.cancel(&mut handle).await.unwrap();
        }

        let first = session.history().list().last().unwrap().id;
        session.remove_entry(first).unwrap();
        assert_eq!(session.history().len(), 1);
        assert_matches!(
            session.remove_entry(first),
            Err(SessionError::History(HistoryError::NotFound(_)))
        );

        session.clear_history().unwrap();
        assert!(session.history().is_empty());
    }

    #[tokio::test]
    async fn clear_history_by_outcome() {
        let fake = FakeBackend::new().with_checkpoints(&[SD15]);
        let mut session = connected(&fake).await;

        let mut done = session.generate(&inputs(SD15, "brick wall")).await.unwrap();
        run_to_success(&mut session, &fake, &mut done, 1).await;
        let finished = session.finish(&mut done).await.unwrap();

        let mut cancelled = session.generate(&inputs(SD15, "moss")).await.unwrap();
        session.cancel(&mut cancelled).await.unwrap();
        assert_eq!(session.history().len(), 2);

        assert_eq!(session.clear_history_where(HistoryFilter::Failed).unwrap(), 1);
        let left: Vec<_> = session.history().list().map(|e| e.id).collect();
        assert_eq!(left, vec![finished.entry_id]);
        assert_eq!(session.clear_history_where(HistoryFilter::Failed).unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_capabilities_are_reprobed_before_binding() {
        let fake = FakeBackend::new().with_checkpoints(&[SD15]);
        let mut session = connected(&fake).await;

        fake.set_checkpoints(&[SD15, FLUX_DEV]);
        assert_matches!(
            session.bind(&inputs(FLUX_DEV, "rusty metal")).await,
            Err(SessionError::Bind(BindError::UnsupportedModel(_)))
        );

        tokio::time::advance(Duration::from_secs(31)).await;
        let request = session.bind(&inputs(FLUX_DEV, "rusty metal")).await.unwrap();
        assert_eq!(request.bound.family, ModelFamily::Flux1Dev);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_polls_until_terminal() {
        let fake = FakeBackend::new().with_checkpoints(&[SD15]);
        let mut session = connected(&fake).await;

        let mut handle = session.generate(&inputs(SD15, "brick wall")).await.unwrap();
        let state = session.wait(&mut handle).await.unwrap();
        assert_matches!(
            state,
            JobState::Failed { failure: FailureKind::Timeout { window_secs: 120 } }
        );
        assert_eq!(session.history().len(), 1);
    }

    #[tokio::test]
    async fn history_persists_across_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            history_path: Some(dir.path().join("history.json")),
            ..config()
        };
        let fake = FakeBackend::new().with_checkpoints(&[SD15]);

        let mut session =
            GenerationSession::with_connector(config.clone(), Arc::new(FakeConnector::new(fake.clone())))
                .unwrap();
        session.connect(None).await.unwrap();
        let mut handle = session.generate(&inputs(SD15, "brick wall")).await.unwrap();
        session.cancel(&mut handle).await.unwrap();
        session.shutdown().await;

        let reopened =
            GenerationSession::with_connector(config, Arc::new(FakeConnector::new(fake))).unwrap();
        assert_eq!(reopened.history().len(), 1);
        let entry = reopened.history().list().next().unwrap();
        assert_eq!(entry.request, *handle.request().as_ref());
    }
}
