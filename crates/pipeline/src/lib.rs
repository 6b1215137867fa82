//! Generation session facade.
//!
//! Ties the backend connection, template engine, job poller and history
//! store together behind [`GenerationSession`], configured from the
//! environment through [`PipelineConfig`].

pub mod config;
pub mod session;

pub use config::{ConfigError, PipelineConfig};
pub use session::{FinishedJob, GenerationSession, SessionError};
