//! Events broadcast to the host while generations run.
//!
//! Produced by the session facade (connection and job lifecycle) and by
//! the WebSocket processor (step progress).

use serde::Serialize;
use texforge_core::types::RequestId;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GenerationEvent {
    BackendConnected {
        url: String,
        version: Option<String>,
    },

    BackendDisconnected { url: String },

    /// The progress WebSocket (re)connected or dropped.
    ProgressStream { connected: bool },

    JobSubmitted {
        request_id: RequestId,
        prompt_id: String,
    },

    /// Step progress reported by the backend.
    JobProgress {
        prompt_id: String,
        /// Fraction in `0.0..=1.0`.
        fraction: f32,
        current_node: Option<String>,
    },

    JobCompleted {
        request_id: RequestId,
        prompt_id: String,
        artifacts: usize,
    },

    JobFailed {
        request_id: RequestId,
        /// Human-readable failure description.
        reason: String,
    },

    JobCancelled { request_id: RequestId },
}
