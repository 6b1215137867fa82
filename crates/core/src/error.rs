use crate::capabilities::Feature;
use crate::family::ModelFamily;
use crate::template::TemplateError;
use crate::types::RequestId;

/// User inputs that cannot be bound into a job.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("{field} = {value} is outside the allowed range {min}..={max}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
}

/// Why a requested optional stage cannot be honoured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MismatchReason {
    /// The backend does not advertise the feature for this family.
    BackendLacksFeature,
    /// The selected workflow template has no slot for the feature.
    TemplateLacksSlot,
    /// The named model file is not installed on the backend.
    ModelNotInstalled(String),
}

impl std::fmt::Display for MismatchReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MismatchReason::BackendLacksFeature => f.write_str("backend does not advertise it"),
            MismatchReason::TemplateLacksSlot => f.write_str("workflow template has no slot for it"),
            MismatchReason::ModelNotInstalled(name) => write!(f, "model '{name}' is not installed"),
        }
    }
}

/// A LoRA or upscale stage was requested that the backend/template
/// combination cannot run.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{feature} requested for {family} but {reason}")]
pub struct CapabilityMismatchError {
    pub feature: Feature,
    pub family: ModelFamily,
    pub reason: MismatchReason,
}

/// No workflow template (exact or generic) can drive the given model.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Unsupported model: {model}")]
pub struct UnsupportedModelError {
    /// Family tag or checkpoint name that could not be served.
    pub model: String,
}

/// Artifacts were requested for a job the user cancelled.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Job {request_id} was cancelled")]
pub struct CancelledError {
    pub request_id: RequestId,
}

/// Everything that can go wrong while binding inputs into a job request.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BindError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    CapabilityMismatch(#[from] CapabilityMismatchError),

    #[error(transparent)]
    UnsupportedModel(#[from] UnsupportedModelError),

    #[error(transparent)]
    Template(#[from] TemplateError),
}
