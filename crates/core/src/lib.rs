//! Domain core for prompt-driven material generation.
//!
//! Holds everything that does not talk to the network: model-family
//! detection, backend capability snapshots, generation parameters and
//! their validation, prompt enhancement, workflow templates and the
//! binding engine, job snapshots, the generation history, and the
//! interface the host tool implements to turn finished images into a
//! shading graph.

pub mod capabilities;
pub mod engine;
pub mod enhance;
pub mod error;
pub mod family;
pub mod history;
pub mod job;
pub mod materializer;
pub mod naming;
pub mod params;
pub mod template;
pub mod types;
