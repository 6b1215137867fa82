//! Bound job requests, job states, and artifact types.

use serde::{Deserialize, Serialize};

use crate::family::ModelFamily;
use crate::params::{GenerationInputs, GenerationParams, MaterialControls, OutputKind, SeedMode, TextureMap};
use crate::template::{TemplateFamily, WorkflowGraph};
use crate::types::{RequestId, Timestamp};

// ---------------------------------------------------------------------------
// Job request
// ---------------------------------------------------------------------------

/// Parameter values after binding: seed resolved, prompts rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundParameters {
    pub family: ModelFamily,
    pub template: TemplateFamily,
    /// User parameters with the resolved seed. Prompts are kept as typed.
    pub params: GenerationParams,
    /// Positive prompt as sent to the backend.
    pub effective_prompt: String,
    /// Negative prompt as sent to the backend.
    pub effective_negative: String,
    pub output: OutputKind,
    pub controls: MaterialControls,
}

/// A concrete job, immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub id: RequestId,
    pub created_at: Timestamp,
    pub bound: BoundParameters,
    /// Whether the seed was drawn at bind time.
    pub seed_randomized: bool,
    pub workflow: WorkflowGraph,
    #[serde(default)]
    pub notes: String,
}

impl JobRequest {
    pub fn seed(&self) -> u64 {
        self.bound.params.seed
    }

    /// Number of images the backend must return.
    pub fn expected_outputs(&self) -> usize {
        self.bound.output.output_count() as usize
    }

    /// Pixel size every artifact must decode to. `None` when an upscale
    /// stage changes the size by a model-dependent factor.
    pub fn expected_size(&self) -> Option<(u32, u32)> {
        if self.bound.params.upscale.is_some() {
            None
        } else {
            Some((self.bound.params.width, self.bound.params.height))
        }
    }

    /// Inputs that reproduce this request. With [`SeedMode::Fixed`] the
    /// resolved seed is kept.
    pub fn to_inputs(&self, seed_mode: SeedMode) -> GenerationInputs {
        GenerationInputs {
            params: self.bound.params.clone(),
            seed_mode,
            output: self.bound.output.clone(),
            controls: self.bound.controls.clone(),
            notes: self.notes.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Job state
// ---------------------------------------------------------------------------

/// Why a job ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    /// No state transition within the configured window.
    Timeout { window_secs: u64 },
    /// The backend reported an execution error.
    Backend { message: String },
    /// The backend could not be reached when submitting.
    SubmissionUnreachable { message: String },
    /// The backend refused the job.
    SubmissionRejected { message: String },
    /// Fewer artifacts than declared, or an empty body.
    FetchIncomplete { message: String },
    /// An artifact failed to decode or has the wrong dimensions.
    FetchCorrupt { message: String },
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Timeout { window_secs } => {
                write!(f, "no progress within {window_secs}s")
            }
            FailureKind::Backend { message } => write!(f, "backend error: {message}"),
            FailureKind::SubmissionUnreachable { message } => {
                write!(f, "backend unreachable: {message}")
            }
            FailureKind::SubmissionRejected { message } => {
                write!(f, "backend rejected job: {message}")
            }
            FailureKind::FetchIncomplete { message } => write!(f, "incomplete result: {message}"),
            FailureKind::FetchCorrupt { message } => write!(f, "corrupt result: {message}"),
        }
    }
}

/// Lifecycle of a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed { failure: FailureKind },
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed { .. } => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed { .. } | JobState::Cancelled
        )
    }

    pub fn failed(failure: FailureKind) -> Self {
        JobState::Failed { failure }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Failed { failure } => write!(f, "failed ({failure})"),
            other => f.write_str(other.as_str()),
        }
    }
}

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

/// Reference to an image the backend produced (as listed in its history).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    /// Storage kind, normally `output`.
    #[serde(rename = "type", default = "default_artifact_kind")]
    pub kind: String,
    /// Node that produced the image.
    #[serde(default)]
    pub node_id: String,
}

fn default_artifact_kind() -> String {
    "output".to_string()
}

/// A downloaded and decoded artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageAsset {
    pub artifact: ArtifactRef,
    /// Map assigned in texture-only mode.
    pub map: Option<TextureMap>,
    pub width: u32,
    pub height: u32,
    /// Encoded file bytes as served by the backend.
    pub bytes: Vec<u8>,
}

/// Terminal view of a job, stored with its history entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    /// Backend-assigned id; absent when submission failed.
    pub prompt_id: Option<String>,
    pub state: JobState,
    pub progress: f32,
    pub artifacts: Vec<ArtifactRef>,
    pub submitted_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
}

impl JobSnapshot {
    pub fn failure(&self) -> Option<&FailureKind> {
        match &self.state {
            JobState::Failed { failure } => Some(failure),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn terminal_states() {
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(JobState::Succeeded.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
        assert!(JobState::failed(FailureKind::Timeout { window_secs: 60 }).is_terminal());
    }

    #[test]
    fn failed_state_serializes_with_kind() {
        let state = JobState::failed(FailureKind::Backend {
            message: "OOM".to_string(),
        });
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(
            value,
            json!({"state": "failed", "failure": {"kind": "backend", "message": "OOM"}})
        );
        assert_eq!(state.to_string(), "failed (backend error: OOM)");
    }

    #[test]
    fn artifact_ref_reads_backend_shape() {
        let artifact: ArtifactRef = serde_json::from_value(json!({
            "filename": "texforge/abc_output_00001_.png",
            "subfolder": "",
            "type": "output"
        }))
        .unwrap();
        assert_eq!(artifact.kind, "output");
        assert!(artifact.node_id.is_empty());
    }
}
