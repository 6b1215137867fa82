//! WebSocket message processing loop.
//!
//! Reads frames from the progress socket, parses them into
//! [`ComfyUIMessage`]s, updates the shared [`ProgressFeed`] and emits
//! [`GenerationEvent::JobProgress`] events.

use futures::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::events::GenerationEvent;
use crate::messages::{parse_message, ComfyUIMessage};
use crate::progress::ProgressFeed;

/// Process frames until the socket closes, a receive error occurs, or
/// the stream ends.
///
/// Binary frames (sampler previews) are ignored.
pub async fn process_messages<S>(
    ws_stream: &mut S,
    feed: &ProgressFeed,
    event_tx: &broadcast::Sender<GenerationEvent>,
) where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(msg_result) = ws_stream.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                handle_text_message(&text, feed, event_tx).await;
            }
            Ok(Message::Binary(_)) => {
                tracing::trace!("Ignoring binary message (preview image)");
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => {
                // Handled automatically by tungstenite.
            }
            Ok(Message::Close(frame)) => {
                tracing::info!(?frame, "ComfyUI WebSocket closed");
                break;
            }
            Ok(Message::Frame(_)) => {}
            Err(e) => {
                tracing::error!(error = %e, "WebSocket receive error");
                break;
            }
        }
    }
}

/// Dispatch a single text frame.
pub async fn handle_text_message(
    text: &str,
    feed: &ProgressFeed,
    event_tx: &broadcast::Sender<GenerationEvent>,
) {
    let msg = match parse_message(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::debug!(error = %e, raw_message = %text, "Skipping ComfyUI message");
            return;
        }
    };

    match msg {
        ComfyUIMessage::Progress(data) => {
            let Some(prompt_id) = data.prompt_id.clone() else {
                tracing::trace!(value = data.value, max = data.max, "Progress without prompt id");
                return;
            };
            let fraction = data.fraction();
            feed.update(&prompt_id, fraction, data.node.clone()).await;
            tracing::debug!(
                prompt_id = %prompt_id,
                value = data.value,
                max = data.max,
                "Generation progress",
            );
            emit_progress(feed, event_tx, &prompt_id).await;
        }
        ComfyUIMessage::ExecutionStart(data) => {
            tracing::info!(prompt_id = %data.prompt_id, "Execution started");
            feed.update(&data.prompt_id, 0.0, None).await;
            emit_progress(feed, event_tx, &data.prompt_id).await;
        }
        ComfyUIMessage::Executing(data) => match (data.prompt_id, data.node) {
            (Some(prompt_id), Some(node)) => {
                tracing::debug!(prompt_id = %prompt_id, node = %node, "Executing node");
                feed.set_node(&prompt_id, Some(node)).await;
            }
            (Some(prompt_id), None) => {
                tracing::info!(prompt_id = %prompt_id, "Execution completed (all nodes done)");
                feed.finish(&prompt_id).await;
                emit_progress(feed, event_tx, &prompt_id).await;
            }
            (None, _) => {}
        },
        ComfyUIMessage::ExecutionSuccess(data) => {
            feed.finish(&data.prompt_id).await;
        }
        ComfyUIMessage::Executed(data) => {
            tracing::debug!(prompt_id = %data.prompt_id, node = %data.node, "Node executed with output");
        }
        ComfyUIMessage::ExecutionError(data) => {
            // The poller settles the job from history; only log here.
            tracing::warn!(
                prompt_id = %data.prompt_id,
                node_id = %data.node_id,
                error_type = %data.exception_type,
                error_message = %data.exception_message,
                "Execution error",
            );
        }
        ComfyUIMessage::ExecutionInterrupted(data) => {
            tracing::info!(prompt_id = %data.prompt_id, "Execution interrupted");
        }
        ComfyUIMessage::ExecutionCached(data) => {
            tracing::debug!(prompt_id = %data.prompt_id, nodes = data.nodes.len(), "Execution used cache");
        }
        ComfyUIMessage::Status(data) => {
            tracing::debug!(
                queue_remaining = data.status.exec_info.queue_remaining,
                "ComfyUI queue status",
            );
        }
    }
}

async fn emit_progress(
    feed: &ProgressFeed,
    event_tx: &broadcast::Sender<GenerationEvent>,
    prompt_id: &str,
) {
    if let Some(progress) = feed.get(prompt_id).await {
        let _ = event_tx.send(GenerationEvent::JobProgress {
            prompt_id: prompt_id.to_string(),
            fraction: progress.fraction,
            current_node: progress.current_node,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn frames(texts: &[&str]) -> impl Stream<Item = Result<Message, tungstenite::Error>> + Unpin {
        let items: Vec<Result<Message, tungstenite::Error>> = texts
            .iter()
            .map(|t| Ok(Message::Text(t.to_string())))
            .collect();
        futures::stream::iter(items)
    }

    #[tokio::test]
    async fn progress_updates_feed_and_emits() {
        let feed = ProgressFeed::new();
        feed.register("p1").await;
        let (tx, mut rx) = broadcast::channel(16);
        let mut stream = frames(&[
            r#"{"type":"execution_start","data":{"prompt_id":"p1"}}"#,
            r#"{"type":"progress","data":{"value":10,"max":20,"prompt_id":"p1","node":"3"}}"#,
        ]);

        process_messages(&mut stream, &feed, &tx).await;

        assert_eq!(feed.get("p1").await.unwrap().fraction, 0.5);
        assert_matches!(rx.try_recv(), Ok(GenerationEvent::JobProgress { fraction, .. }) if fraction == 0.0);
        assert_matches!(
            rx.try_recv(),
            Ok(GenerationEvent::JobProgress { prompt_id, fraction, current_node })
                if prompt_id == "p1" && fraction == 0.5 && current_node.as_deref() == Some("3")
        );
    }

    #[tokio::test]
    async fn executing_none_finishes_prompt() {
        let feed = ProgressFeed::new();
        feed.register("p2").await;
        let (tx, _rx) = broadcast::channel(16);
        let mut stream = frames(&[
            r#"{"type":"executing","data":{"node":"8","prompt_id":"p2"}}"#,
            r#"{"type":"executing","data":{"node":null,"prompt_id":"p2"}}"#,
        ]);
        process_messages(&mut stream, &feed, &tx).await;
        assert_eq!(feed.get("p2").await.unwrap().fraction, 1.0);
    }

    #[tokio::test]
    async fn malformed_frames_are_skipped() {
        let feed = ProgressFeed::new();
        feed.register("p3").await;
        let (tx, _rx) = broadcast::channel(16);
        let mut stream = frames(&[
            "garbage",
            r#"{"type":"progress","data":{"value":1,"max":4,"prompt_id":"p3"}}"#,
        ]);
        process_messages(&mut stream, &feed, &tx).await;
        assert_eq!(feed.get("p3").await.unwrap().fraction, 0.25);
    }

    #[tokio::test]
    async fn frames_for_untracked_prompts_are_dropped() {
        let feed = ProgressFeed::new();
        let (tx, mut rx) = broadcast::channel(16);
        feed.register("p4").await;
        feed.remove("p4").await;
        let mut stream = frames(&[
            r#"{"type":"executing","data":{"node":null,"prompt_id":"p4"}}"#,
            r#"{"type":"execution_success","data":{"prompt_id":"p4"}}"#,
            r#"{"type":"progress","data":{"value":3,"max":4,"prompt_id":"other"}}"#,
        ]);
        process_messages(&mut stream, &feed, &tx).await;

        assert_eq!(feed.len().await, 0);
        assert!(rx.try_recv().is_err());
    }
}
