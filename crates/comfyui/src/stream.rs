//! Background task feeding the progress feed from the WebSocket.
//!
//! [`ProgressStream::spawn`] runs connect -> process -> reconnect until
//! stopped. Losing the socket never affects job state; the poller keeps
//! settling jobs over HTTP.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::client::ProgressClient;
use crate::events::GenerationEvent;
use crate::processor::process_messages;
use crate::progress::ProgressFeed;
use crate::reconnect::{reconnect_loop, ReconnectConfig};

/// How long [`ProgressStream::shutdown`] waits for the task.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ProgressStream {
    task_handle: Option<tokio::task::JoinHandle<()>>,
    cancel: CancellationToken,
}

impl ProgressStream {
    /// Spawn the connection task for `client`.
    pub fn spawn(
        client: ProgressClient,
        feed: ProgressFeed,
        event_tx: broadcast::Sender<GenerationEvent>,
        config: ReconnectConfig,
    ) -> Self {
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();

        let task_handle = tokio::spawn(async move {
            tracing::info!(ws_url = %client.ws_url(), "Starting progress stream");
            run_connection_loop(&client, &feed, &event_tx, &config, &task_cancel).await;
            tracing::info!(ws_url = %client.ws_url(), "Progress stream exited");
        });

        Self {
            task_handle: Some(task_handle),
            cancel,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Cancel the task and wait briefly for it to exit.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.task_handle.take() {
            let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await;
        }
    }
}

impl Drop for ProgressStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Connect -> process messages -> reconnect, until cancelled.
async fn run_connection_loop(
    client: &ProgressClient,
    feed: &ProgressFeed,
    event_tx: &broadcast::Sender<GenerationEvent>,
    config: &ReconnectConfig,
    cancel: &CancellationToken,
) {
    let mut pending = tokio::select! {
        _ = cancel.cancelled() => return,
        result = client.connect() => result.ok(),
    };

    loop {
        let conn = match pending.take() {
            Some(conn) => conn,
            None => {
                tracing::warn!(ws_url = %client.ws_url(), "Progress socket unavailable, entering reconnect loop");
                match reconnect_loop(client, config, cancel).await {
                    Some(conn) => conn,
                    None => return,
                }
            }
        };

        let _ = event_tx.send(GenerationEvent::ProgressStream { connected: true });

        let mut ws_stream = conn.ws_stream;
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = process_messages(&mut ws_stream, feed, event_tx) => {}
        }

        let _ = event_tx.send(GenerationEvent::ProgressStream { connected: false });
        if cancel.is_cancelled() {
            return;
        }
        tracing::info!(ws_url = %client.ws_url(), "Progress socket lost");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_stops_unreachable_stream() {
        let (tx, _rx) = broadcast::channel(8);
        let stream = ProgressStream::spawn(
            ProgressClient::new("http://127.0.0.1:9", "c1"),
            ProgressFeed::new(),
            tx,
            ReconnectConfig::default(),
        );
        assert!(stream.is_running());
        stream.shutdown().await;
    }
}
