//! ComfyUI REST and WebSocket client library.
//!
//! Provides the [`backend::GenerationBackend`] abstraction and its HTTP
//! implementation, connection management with capability probing, job
//! submission and polling, and a live progress feed fed by the WebSocket
//! with reconnection.

pub mod api;
pub mod backend;
pub mod client;
pub mod connection;
pub mod events;
#[cfg(any(test, feature = "test-support"))]
pub mod fake;
pub mod messages;
pub mod poller;
pub mod processor;
pub mod progress;
pub mod reconnect;
pub mod stream;
