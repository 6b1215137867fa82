//! Job submission, polling and artifact retrieval.
//!
//! Polling is a state machine advanced one step at a time by
//! [`JobPoller::poll`]. Each step issues at most one backend request, so
//! the host decides how often (and whether) to poll.
//!
//! ```text
//! submit -> Queued --/queue--> Running --/history--> Succeeded | Failed
//!              \______________ cancel ______________/-> Cancelled
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use texforge_core::error::CancelledError;
use texforge_core::job::{ArtifactRef, FailureKind, ImageAsset, JobRequest, JobSnapshot, JobState};
use texforge_core::types::Timestamp;
use tokio::time::Instant;

use crate::backend::{BackendError, GenerationBackend, HistoryOutcome};
use crate::progress::ProgressFeed;

/// Default window without a state transition before a job fails.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(120);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SubmissionError {
    #[error("Backend unreachable: {0}")]
    Unreachable(String),

    #[error("Backend rejected the job: {0}")]
    Rejected(String),
}

impl SubmissionError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            SubmissionError::Unreachable(message) => FailureKind::SubmissionUnreachable {
                message: message.clone(),
            },
            SubmissionError::Rejected(message) => FailureKind::SubmissionRejected {
                message: message.clone(),
            },
        }
    }
}

impl From<BackendError> for SubmissionError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Unreachable(message) => SubmissionError::Unreachable(message),
            other => SubmissionError::Rejected(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FetchError {
    #[error("Job is {state}, artifacts are available once it succeeds")]
    NotReady { state: &'static str },

    #[error(transparent)]
    Cancelled(#[from] CancelledError),

    #[error("Incomplete result: {0}")]
    Incomplete(String),

    #[error("Corrupt result: {0}")]
    Corrupt(String),

    #[error("Backend unreachable: {0}")]
    Unreachable(String),
}

impl FetchError {
    /// Failure recorded on the job, for errors that end it.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            FetchError::Incomplete(message) => Some(FailureKind::FetchIncomplete {
                message: message.clone(),
            }),
            FetchError::Corrupt(message) => Some(FailureKind::FetchCorrupt {
                message: message.clone(),
            }),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Local view of one submitted job. Owned by a single caller.
#[derive(Debug, Clone)]
pub struct JobHandle {
    request: Arc<JobRequest>,
    prompt_id: Option<String>,
    state: JobState,
    progress: f32,
    artifacts: Vec<ArtifactRef>,
    last_transition: Instant,
    submitted_at: Option<Timestamp>,
    finished_at: Option<Timestamp>,
}

impl JobHandle {
    fn queued(request: Arc<JobRequest>, prompt_id: String) -> Self {
        Self {
            request,
            prompt_id: Some(prompt_id),
            state: JobState::Queued,
            progress: 0.0,
            artifacts: Vec::new(),
            last_transition: Instant::now(),
            submitted_at: Some(Utc::now()),
            finished_at: None,
        }
    }

    /// Handle for a request the backend never accepted.
    pub fn failed_submission(request: Arc<JobRequest>, error: &SubmissionError) -> Self {
        let now = Utc::now();
        Self {
            request,
            prompt_id: None,
            state: JobState::failed(error.failure_kind()),
            progress: 0.0,
            artifacts: Vec::new(),
            last_transition: Instant::now(),
            submitted_at: Some(now),
            finished_at: Some(now),
        }
    }

    pub fn request(&self) -> &Arc<JobRequest> {
        &self.request
    }

    pub fn prompt_id(&self) -> Option<&str> {
        self.prompt_id.as_deref()
    }

    pub fn state(&self) -> &JobState {
        &self.state
    }

    pub fn progress(&self) -> f32 {
        self.progress
    }

    pub fn artifacts(&self) -> &[ArtifactRef] {
        &self.artifacts
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            prompt_id: self.prompt_id.clone(),
            state: self.state.clone(),
            progress: self.progress,
            artifacts: self.artifacts.clone(),
            submitted_at: self.submitted_at,
            finished_at: self.finished_at,
        }
    }

    /// Mark the job failed. Ignored once terminal.
    pub fn fail(&mut self, failure: FailureKind) {
        if !self.is_terminal() {
            self.transition(JobState::failed(failure));
        }
    }

    /// Cancel locally without contacting the backend. Returns whether
    /// the handle changed.
    pub fn mark_cancelled(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.transition(JobState::Cancelled);
        true
    }

    fn transition(&mut self, state: JobState) {
        if state.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        if state == JobState::Succeeded {
            self.progress = 1.0;
        }
        self.state = state;
        self.last_transition = Instant::now();
    }
}

// ---------------------------------------------------------------------------
// Poller
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Longest time a job may go without a state transition.
    pub timeout: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_JOB_TIMEOUT,
        }
    }
}

pub struct JobPoller {
    backend: Arc<dyn GenerationBackend>,
    config: PollerConfig,
    client_id: String,
    progress: Option<ProgressFeed>,
}

impl JobPoller {
    pub fn new(
        backend: Arc<dyn GenerationBackend>,
        client_id: impl Into<String>,
        config: PollerConfig,
    ) -> Self {
        Self {
            backend,
            config,
            client_id: client_id.into(),
            progress: None,
        }
    }

    /// Read progress fractions from `feed` while jobs run.
    pub fn with_progress(mut self, feed: ProgressFeed) -> Self {
        self.progress = Some(feed);
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    /// Enqueue the request. Never retried.
    pub async fn submit(&self, request: Arc<JobRequest>) -> Result<JobHandle, SubmissionError> {
        let response = self
            .backend
            .submit(&request.workflow.to_value(), &self.client_id)
            .await
            .map_err(|e| {
                tracing::warn!(request_id = %request.id, error = %e, "Job submission failed");
                SubmissionError::from(e)
            })?;

        tracing::info!(
            request_id = %request.id,
            prompt_id = %response.prompt_id,
            queue_number = response.number,
            "Job submitted",
        );
        if let Some(feed) = &self.progress {
            feed.register(&response.prompt_id).await;
        }
        Ok(JobHandle::queued(request, response.prompt_id))
    }

    /// Advance the handle by one step and return its state.
    pub async fn poll(&self, handle: &mut JobHandle) -> JobState {
        if handle.is_terminal() {
            return handle.state.clone();
        }
        let Some(prompt_id) = handle.prompt_id.clone() else {
            return handle.state.clone();
        };

        let next = match handle.state {
            JobState::Queued => self.step_queued(&prompt_id).await,
            JobState::Running => self.step_running(&prompt_id, handle).await,
            _ => None,
        };

        match next {
            Some(state) if state != handle.state => {
                tracing::info!(
                    prompt_id = %prompt_id,
                    from = handle.state.as_str(),
                    to = %state,
                    "Job state changed",
                );
                handle.transition(state);
            }
            _ => {
                let idle = handle.last_transition.elapsed();
                if idle >= self.config.timeout {
                    let window_secs = self.config.timeout.as_secs();
                    tracing::warn!(prompt_id = %prompt_id, window_secs, "Job timed out");
                    handle.transition(JobState::failed(FailureKind::Timeout { window_secs }));
                }
            }
        }

        self.update_progress(&prompt_id, handle).await;
        handle.state.clone()
    }

    async fn step_queued(&self, prompt_id: &str) -> Option<JobState> {
        match self.backend.queue().await {
            Ok(queue) if queue.is_pending(prompt_id) => Some(JobState::Queued),
            // Running, or already left the queue: history settles it.
            Ok(_) => Some(JobState::Running),
            Err(e) => {
                tracing::warn!(prompt_id, error = %e, "Queue poll failed, will retry");
                None
            }
        }
    }

    async fn step_running(&self, prompt_id: &str, handle: &mut JobHandle) -> Option<JobState> {
        let history = match self.backend.history(prompt_id).await {
            Ok(history) => history?,
            Err(e) => {
                tracing::warn!(prompt_id, error = %e, "History poll failed, will retry");
                return None;
            }
        };

        match history.outcome() {
            HistoryOutcome::Pending => None,
            HistoryOutcome::Success(artifacts) => {
                tracing::debug!(prompt_id, artifacts = artifacts.len(), "Job produced artifacts");
                handle.artifacts = artifacts;
                Some(JobState::Succeeded)
            }
            HistoryOutcome::Error(message) => {
                Some(JobState::failed(FailureKind::Backend { message }))
            }
        }
    }

    async fn update_progress(&self, prompt_id: &str, handle: &mut JobHandle) {
        let Some(feed) = &self.progress else {
            return;
        };
        if handle.is_terminal() {
            feed.remove(prompt_id).await;
            return;
        }
        if let Some(progress) = feed.get(prompt_id).await {
            handle.progress = handle.progress.max(progress.fraction.clamp(0.0, 1.0));
        }
    }

    /// Download and decode every artifact of a succeeded job.
    ///
    /// `Incomplete` and `Corrupt` results fail the handle.
    pub async fn fetch_artifacts(&self, handle: &mut JobHandle) -> Result<Vec<ImageAsset>, FetchError> {
        match &handle.state {
            JobState::Succeeded => {}
            JobState::Cancelled => {
                return Err(CancelledError {
                    request_id: handle.request.id,
                }
                .into())
            }
            other => return Err(FetchError::NotReady { state: other.as_str() }),
        }

        let result = self.download(handle).await;
        if let Err(e) = &result {
            if let Some(failure) = e.failure_kind() {
                tracing::warn!(prompt_id = ?handle.prompt_id, error = %e, "Artifact retrieval failed");
                handle.transition(JobState::failed(failure));
            }
        }
        result
    }

    async fn download(&self, handle: &JobHandle) -> Result<Vec<ImageAsset>, FetchError> {
        let request = &handle.request;
        let expected = request.expected_outputs();
        if handle.artifacts.len() != expected {
            return Err(FetchError::Incomplete(format!(
                "expected {expected} artifacts, backend declared {}",
                handle.artifacts.len()
            )));
        }

        let mut assets = Vec::with_capacity(expected);
        for (index, artifact) in handle.artifacts.iter().enumerate() {
            let bytes = self.backend.view(artifact).await.map_err(|e| match e {
                BackendError::Http { status, .. } => {
                    FetchError::Incomplete(format!("{}: HTTP {status}", artifact.filename))
                }
                other => FetchError::Unreachable(other.to_string()),
            })?;
            if bytes.is_empty() {
                return Err(FetchError::Incomplete(format!("{} is empty", artifact.filename)));
            }

            let image = image::load_from_memory(&bytes)
                .map_err(|e| FetchError::Corrupt(format!("{}: {e}", artifact.filename)))?;
            let (width, height) = (image.width(), image.height());
            if let Some((w, h)) = request.expected_size() {
                if (width, height) != (w, h) {
                    return Err(FetchError::Corrupt(format!(
                        "{} is {width}x{height}, expected {w}x{h}",
                        artifact.filename
                    )));
                }
            }

            assets.push(ImageAsset {
                artifact: artifact.clone(),
                map: request.bound.output.map_at(index),
                width,
                height,
                bytes,
            });
        }

        tracing::info!(prompt_id = ?handle.prompt_id, count = assets.len(), "Artifacts fetched");
        Ok(assets)
    }

    /// Cancel a non-terminal job. The handle is Cancelled immediately;
    /// remote cleanup is best-effort. Returns whether the handle changed.
    pub async fn cancel(&self, handle: &mut JobHandle) -> bool {
        let was_running = handle.state == JobState::Running;
        if !handle.mark_cancelled() {
            return false;
        }

        let Some(prompt_id) = handle.prompt_id.clone() else {
            return true;
        };
        tracing::info!(prompt_id = %prompt_id, was_running, "Cancelling job");

        if let Err(e) = self.backend.delete_from_queue(&prompt_id).await {
            tracing::warn!(prompt_id = %prompt_id, error = %e, "Failed to delete job from queue");
        }
        if was_running {
            // Interrupt is global; only send it while this job holds the executor.
            match self.backend.queue().await {
                Ok(queue) if queue.is_running(&prompt_id) => {
                    if let Err(e) = self.backend.interrupt().await {
                        tracing::warn!(prompt_id = %prompt_id, error = %e, "Failed to interrupt job");
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(prompt_id = %prompt_id, error = %e, "Queue check before interrupt failed");
                }
            }
        }
        if let Some(feed) = &self.progress {
            feed.remove(&prompt_id).await;
        }
        true
    }
}
