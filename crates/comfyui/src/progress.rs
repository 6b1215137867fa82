//! Backend-reported progress, keyed by prompt id.
//!
//! Written by the WebSocket processor, read by the poller. Cloning the
//! feed shares the underlying map. Only registered prompts are tracked;
//! frames for anything else, including prompts already removed, are
//! ignored.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

/// Latest known progress of one prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptProgress {
    /// Fraction in `0.0..=1.0`.
    pub fraction: f32,
    /// Node currently executing, if reported.
    pub current_node: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ProgressFeed {
    inner: Arc<RwLock<HashMap<String, PromptProgress>>>,
}

impl ProgressFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a submitted prompt.
    pub async fn register(&self, prompt_id: &str) {
        self.inner
            .write()
            .await
            .entry(prompt_id.to_string())
            .or_insert(PromptProgress {
                fraction: 0.0,
                current_node: None,
            });
    }

    /// Record a step update. Progress for a prompt never moves backwards
    /// within one node.
    pub async fn update(&self, prompt_id: &str, fraction: f32, node: Option<String>) {
        let mut map = self.inner.write().await;
        let Some(entry) = map.get_mut(prompt_id) else {
            tracing::trace!(prompt_id, "Progress for untracked prompt");
            return;
        };
        if entry.current_node == node {
            entry.fraction = entry.fraction.max(fraction);
        } else {
            entry.fraction = fraction;
            entry.current_node = node;
        }
    }

    /// Record that a node started (without step information).
    pub async fn set_node(&self, prompt_id: &str, node: Option<String>) {
        if let Some(entry) = self.inner.write().await.get_mut(prompt_id) {
            entry.current_node = node;
        }
    }

    /// Mark a prompt as fully done.
    pub async fn finish(&self, prompt_id: &str) {
        self.update(prompt_id, 1.0, None).await;
    }

    pub async fn get(&self, prompt_id: &str) -> Option<PromptProgress> {
        self.inner.read().await.get(prompt_id).cloned()
    }

    /// Forget a prompt once its handle is terminal.
    pub async fn remove(&self, prompt_id: &str) {
        self.inner.write().await.remove(prompt_id);
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shared_between_clones() {
        let feed = ProgressFeed::new();
        let reader = feed.clone();
        feed.register("p1").await;
        feed.update("p1", 0.4, Some("3".into())).await;
        assert_eq!(reader.get("p1").await.unwrap().fraction, 0.4);
    }

    #[tokio::test]
    async fn monotonic_within_node() {
        let feed = ProgressFeed::new();
        feed.register("p1").await;
        feed.update("p1", 0.6, Some("3".into())).await;
        feed.update("p1", 0.2, Some("3".into())).await;
        assert_eq!(feed.get("p1").await.unwrap().fraction, 0.6);

        feed.update("p1", 0.1, Some("38".into())).await;
        let progress = feed.get("p1").await.unwrap();
        assert_eq!(progress.fraction, 0.1);
        assert_eq!(progress.current_node.as_deref(), Some("38"));
    }

    #[tokio::test]
    async fn finish_and_remove() {
        let feed = ProgressFeed::new();
        feed.register("p1").await;
        assert_eq!(feed.get("p1").await.unwrap().fraction, 0.0);
        feed.finish("p1").await;
        assert_eq!(feed.get("p1").await.unwrap().fraction, 1.0);
        feed.remove("p1").await;
        assert!(feed.get("p1").await.is_none());
        assert_eq!(feed.len().await, 0);
    }

    #[tokio::test]
    async fn late_frames_after_remove_are_ignored() {
        let feed = ProgressFeed::new();
        feed.register("p1").await;
        feed.remove("p1").await;

        feed.set_node("p1", Some("8".into())).await;
        feed.update("p1", 0.5, Some("8".into())).await;
        feed.finish("p1").await;
        feed.update("never-submitted", 0.5, None).await;

        assert!(feed.get("p1").await.is_none());
        assert_eq!(feed.len().await, 0);
    }
}
