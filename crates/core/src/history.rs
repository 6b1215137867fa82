//! Append-only log of finished generations.
//!
//! Entries are recorded once a job is terminal (success, failure, or
//! cancellation alike) and never change afterwards except for the
//! reused/retried marker. When opened with a path the store is persisted
//! as a versioned JSON document, rewritten atomically after every change.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::capabilities::Capabilities;
use crate::engine::TemplateEngine;
use crate::error::BindError;
use crate::job::{JobRequest, JobSnapshot, JobState};
use crate::params::SeedMode;
use crate::types::{EntryId, RequestId, Timestamp};

/// Version written into the persisted document.
pub const HISTORY_FORMAT_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("History entry {0} not found")]
    NotFound(EntryId),

    #[error("Job is still {0}; only finished jobs are recorded")]
    NotTerminal(&'static str),

    #[error("Request {0} is already recorded")]
    DuplicateRequest(RequestId),

    #[error("History entry {id} is {state}; only failed or cancelled jobs can be retried")]
    NotRetryable { id: EntryId, state: &'static str },

    #[error("Unsupported history format version {0}")]
    UnsupportedVersion(u32),

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error("History I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("History document is malformed: {0}")]
    Json(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// Set when an entry's parameters were reused or its job retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryMarker {
    Reused { at: Timestamp },
    Retried { at: Timestamp },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Assigned by the store on record.
    pub id: EntryId,
    pub recorded_at: Timestamp,
    pub request: JobRequest,
    pub job: JobSnapshot,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub marker: Option<HistoryMarker>,
}

impl HistoryEntry {
    /// Unrecorded entry; notes are taken from the request.
    pub fn new(request: JobRequest, job: JobSnapshot) -> Self {
        Self {
            id: 0,
            recorded_at: Utc::now(),
            notes: request.notes.clone(),
            request,
            job,
            marker: None,
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }

    pub fn state(&self) -> &JobState {
        &self.job.state
    }
}

/// Which finished entries a bulk clear drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryFilter {
    Succeeded,
    /// Failed or cancelled.
    Failed,
    All,
}

impl HistoryFilter {
    pub fn matches(self, state: &JobState) -> bool {
        match self {
            HistoryFilter::Succeeded => matches!(state, JobState::Succeeded),
            HistoryFilter::Failed => matches!(state, JobState::Failed { .. } | JobState::Cancelled),
            HistoryFilter::All => true,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct HistoryDocument {
    version: u32,
    next_id: EntryId,
    entries: Vec<HistoryEntry>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct HistoryStore {
    /// Oldest first.
    entries: Vec<HistoryEntry>,
    next_id: EntryId,
    path: Option<PathBuf>,
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl HistoryStore {
    pub fn in_memory() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 1,
            path: None,
        }
    }

    /// Open a persisted store. A missing file yields an empty store that
    /// will be created on the first change.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, HistoryError> {
        let path = path.into();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No history file yet, starting empty");
            return Ok(Self {
                path: Some(path),
                ..Self::in_memory()
            });
        }

        let text = std::fs::read_to_string(&path)?;
        let doc: HistoryDocument = serde_json::from_str(&text)?;
        if doc.version != HISTORY_FORMAT_VERSION {
            return Err(HistoryError::UnsupportedVersion(doc.version));
        }
        let max_id = doc.entries.iter().map(|e| e.id).max().unwrap_or(0);

        tracing::info!(
            path = %path.display(),
            entries = doc.entries.len(),
            "Loaded generation history"
        );

        Ok(Self {
            entries: doc.entries,
            next_id: doc.next_id.max(max_id + 1),
            path: Some(path),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append a terminal job. Returns the assigned id.
    pub fn record(&mut self, mut entry: HistoryEntry) -> Result<EntryId, HistoryError> {
        if !entry.job.state.is_terminal() {
            return Err(HistoryError::NotTerminal(entry.job.state.as_str()));
        }
        if self.entries.iter().any(|e| e.request.id == entry.request.id) {
            return Err(HistoryError::DuplicateRequest(entry.request.id));
        }

        let id = self.next_id;
        entry.id = id;
        entry.recorded_at = Utc::now();
        let request_id = entry.request.id;
        let state = entry.job.state.as_str();
        let artifacts = entry.job.artifacts.len();

        self.entries.push(entry);
        self.next_id += 1;
        self.save_or_undo(|store| {
            store.entries.pop();
            store.next_id -= 1;
        })?;

        tracing::info!(
            entry_id = id,
            request_id = %request_id,
            state,
            artifacts,
            "Recorded generation"
        );
        Ok(id)
    }

    /// Entries, most recent first.
    pub fn list(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter().rev()
    }

    pub fn get(&self, id: EntryId) -> Option<&HistoryEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn remove(&mut self, id: EntryId) -> Result<HistoryEntry, HistoryError> {
        let index = self
            .entries
            .iter()
            .position(|e| e.id == id)
            .ok_or(HistoryError::NotFound(id))?;
        let entry = self.entries.remove(index);
        match self.save() {
            Ok(()) => Ok(entry),
            Err(err) => {
                self.entries.insert(index, entry);
                Err(err)
            }
        }
    }

    /// Drop every entry. Ids keep counting up.
    pub fn clear(&mut self) -> Result<(), HistoryError> {
        self.clear_where(HistoryFilter::All).map(|_| ())
    }

    /// Drop the entries whose outcome matches `filter`. Returns how many
    /// were dropped.
    pub fn clear_where(&mut self, filter: HistoryFilter) -> Result<usize, HistoryError> {
        let (dropped, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|e| filter.matches(e.state()));
        self.entries = kept;
        if dropped.is_empty() {
            return Ok(0);
        }

        let count = dropped.len();
        self.save_or_undo(move |store| {
            store.entries.extend(dropped);
            store.entries.sort_by_key(|e| e.id);
        })?;
        tracing::info!(dropped = count, ?filter, "Cleared generation history");
        Ok(count)
    }

    /// Re-bind an entry's parameters through the engine against the
    /// current capabilities. The new request is not submitted.
    pub fn reuse_parameters(
        &mut self,
        id: EntryId,
        engine: &TemplateEngine,
        caps: &Capabilities,
        seed_mode: SeedMode,
    ) -> Result<JobRequest, HistoryError> {
        let entry = self.get(id).ok_or(HistoryError::NotFound(id))?;
        let request = engine.prepare(&entry.request.to_inputs(seed_mode), caps)?;
        self.mark(id, HistoryMarker::Reused { at: Utc::now() })?;
        Ok(request)
    }

    /// Like [`reuse_parameters`](Self::reuse_parameters), but only for
    /// failed or cancelled entries.
    pub fn retry(
        &mut self,
        id: EntryId,
        engine: &TemplateEngine,
        caps: &Capabilities,
        seed_mode: SeedMode,
    ) -> Result<JobRequest, HistoryError> {
        let entry = self.get(id).ok_or(HistoryError::NotFound(id))?;
        match entry.job.state {
            JobState::Failed { .. } | JobState::Cancelled => {}
            ref other => {
                return Err(HistoryError::NotRetryable {
                    id,
                    state: other.as_str(),
                })
            }
        }
        let request = engine.prepare(&entry.request.to_inputs(seed_mode), caps)?;
        self.mark(id, HistoryMarker::Retried { at: Utc::now() })?;
        Ok(request)
    }

    // -- internals --

    fn mark(&mut self, id: EntryId, marker: HistoryMarker) -> Result<(), HistoryError> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(HistoryError::NotFound(id))?;
        let previous = entry.marker.replace(marker);
        self.save_or_undo(|store| {
            if let Some(entry) = store.entries.iter_mut().find(|e| e.id == id) {
                entry.marker = previous;
            }
        })
    }

    /// Persist the current state, applying `undo` if the write fails so
    /// memory keeps matching the document on disk.
    fn save_or_undo(&mut self, undo: impl FnOnce(&mut Self)) -> Result<(), HistoryError> {
        match self.save() {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::error!(error = %err, "Failed to write generation history");
                undo(self);
                Err(err)
            }
        }
    }

    fn save(&self) -> Result<(), HistoryError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let doc = HistoryDocument {
            version: HISTORY_FORMAT_VERSION,
            next_id: self.next_id,
            entries: self.entries.clone(),
        };
        let text = serde_json::to_string_pretty(&doc)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::FailureKind;
    use crate::params::{GenerationInputs, GenerationParams, LoraSelection};
    use assert_matches::assert_matches;

    fn caps() -> Capabilities {
        Capabilities::from_models(
            &["v1-5-pruned.safetensors".to_string()],
            vec![],
            vec![],
            false,
            false,
        )
    }

    fn request(engine: &TemplateEngine, prompt: &str) -> JobRequest {
        let inputs = GenerationInputs {
            params: GenerationParams {
                checkpoint: "v1-5-pruned.safetensors".to_string(),
                prompt: prompt.to_string(),
                ..Default::default()
            },
            notes: "first try".to_string(),
            ..Default::default()
        };
        engine.prepare(&inputs, &caps()).unwrap()
    }

    fn snapshot(state: JobState) -> JobSnapshot {
        JobSnapshot {
            prompt_id: Some("p-1".to_string()),
            state,
            progress: 1.0,
            artifacts: vec![],
            submitted_at: Some(Utc::now()),
            finished_at: Some(Utc::now()),
        }
    }

    #[test]
    fn records_and_lists_most_recent_first() {
        let engine = TemplateEngine::builtin().unwrap();
        let mut store = HistoryStore::in_memory();
        let a = store
            .record(HistoryEntry::new(request(&engine, "a"), snapshot(JobState::Succeeded)))
            .unwrap();
        let b = store
            .record(HistoryEntry::new(request(&engine, "b"), snapshot(JobState::Cancelled)))
            .unwrap();
        assert_eq!((a, b), (1, 2));

        let ids: Vec<_> = store.list().map(|e| e.id).collect();
        assert_eq!(ids, vec![2, 1]);
        assert_eq!(store.get(1).unwrap().notes, "first try");
    }

    #[test]
    fn rejects_non_terminal_and_duplicates() {
        let engine = TemplateEngine::builtin().unwrap();
        let mut store = HistoryStore::in_memory();
        let req = request(&engine, "a");

        assert_matches!(
            store.record(HistoryEntry::new(req.clone(), snapshot(JobState::Running))),
            Err(HistoryError::NotTerminal("running"))
        );
        store
            .record(HistoryEntry::new(req.clone(), snapshot(JobState::Succeeded)))
            .unwrap();
        assert_matches!(
            store.record(HistoryEntry::new(req, snapshot(JobState::Succeeded))),
            Err(HistoryError::DuplicateRequest(_))
        );
    }

    #[test]
    fn reuse_round_trips_bound_parameters() {
        let engine = TemplateEngine::builtin().unwrap();
        let mut store = HistoryStore::in_memory();
        let original = request(&engine, "brick wall");
        let id = store
            .record(HistoryEntry::new(original.clone(), snapshot(JobState::Succeeded)))
            .unwrap();

        let reused = store
            .reuse_parameters(id, &engine, &caps(), SeedMode::Fixed)
            .unwrap();
        assert_ne!(reused.id, original.id);
        assert_eq!(reused.bound, original.bound);
        assert_matches!(store.get(id).unwrap().marker, Some(HistoryMarker::Reused { .. }));
    }

    #[test]
    fn retry_only_failed_or_cancelled() {
        let engine = TemplateEngine::builtin().unwrap();
        let mut store = HistoryStore::in_memory();
        let ok = store
            .record(HistoryEntry::new(request(&engine, "a"), snapshot(JobState::Succeeded)))
            .unwrap();
        let failed = store
            .record(HistoryEntry::new(
                request(&engine, "b"),
                snapshot(JobState::failed(FailureKind::Timeout { window_secs: 60 })),
            ))
            .unwrap();

        assert_matches!(
            store.retry(ok, &engine, &caps(), SeedMode::Fixed),
            Err(HistoryError::NotRetryable { state: "succeeded", .. })
        );
        let retried = store
            .retry(failed, &engine, &caps(), SeedMode::Fixed)
            .unwrap();
        assert_eq!(retried.bound.params.prompt, "b");
        assert_matches!(store.get(failed).unwrap().marker, Some(HistoryMarker::Retried { .. }));
        assert_eq!(store.get(failed).unwrap().state(), &JobState::failed(FailureKind::Timeout { window_secs: 60 }));
    }

    #[test]
    fn missing_entry() {
        let engine = TemplateEngine::builtin().unwrap();
        let mut store = HistoryStore::in_memory();
        assert_matches!(
            store.reuse_parameters(9, &engine, &caps(), SeedMode::Random),
            Err(HistoryError::NotFound(9))
        );
        assert_matches!(store.remove(9), Err(HistoryError::NotFound(9)));
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history").join("entries.json");
        let engine = TemplateEngine::builtin().unwrap();
        let original = request(&engine, "moss");

        {
            let mut store = HistoryStore::open(&path).unwrap();
            assert!(store.is_empty());
            store
                .record(HistoryEntry::new(original.clone(), snapshot(JobState::Succeeded)))
                .unwrap();
            store
                .record(HistoryEntry::new(request(&engine, "sand"), snapshot(JobState::Cancelled)))
                .unwrap();
            store.remove(2).unwrap();
        }

        let mut store = HistoryStore::open(&path).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(1).unwrap().request, original);

        // Ids are not reused after removal.
        let id = store
            .record(HistoryEntry::new(request(&engine, "clay"), snapshot(JobState::Succeeded)))
            .unwrap();
        assert_eq!(id, 3);

        store.clear().unwrap();
        assert!(HistoryStore::open(&path).unwrap().is_empty());
    }

    #[test]
    fn reopened_store_keeps_exact_float_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        let engine = TemplateEngine::builtin().unwrap();
        let caps = Capabilities::from_models(
            &["v1-5-pruned.safetensors".to_string()],
            vec!["styleA.safetensors".to_string()],
            vec![],
            true,
            false,
        );

        let mut inputs = GenerationInputs {
            params: GenerationParams {
                checkpoint: "v1-5-pruned.safetensors".to_string(),
                prompt: "polished marble".to_string(),
                cfg_scale: 7.123456789012345,
                lora: Some(LoraSelection {
                    name: "styleA.safetensors".to_string(),
                    strength: 0.9856906946328695,
                }),
                ..Default::default()
            },
            ..Default::default()
        };
        inputs.controls.roughness = 0.9856906946328695;
        inputs.controls.metallic = 0.1234567890123456;
        inputs.controls.normal_strength = 0.30000000000000004;
        inputs.controls.ior = 1.4500000000000002;
        let original = engine.prepare(&inputs, &caps).unwrap();

        HistoryStore::open(&path)
            .unwrap()
            .record(HistoryEntry::new(original.clone(), snapshot(JobState::Succeeded)))
            .unwrap();

        let mut store = HistoryStore::open(&path).unwrap();
        assert_eq!(store.get(1).unwrap().request, original);
        let reused = store
            .reuse_parameters(1, &engine, &caps, SeedMode::Fixed)
            .unwrap();
        assert_eq!(reused.bound, original.bound);
        assert_eq!(reused.bound.controls.roughness.to_bits(), 0.9856906946328695f64.to_bits());
    }

    #[test]
    fn clear_where_filters_by_outcome() {
        let engine = TemplateEngine::builtin().unwrap();
        let mut store = HistoryStore::in_memory();
        let ok = store
            .record(HistoryEntry::new(request(&engine, "a"), snapshot(JobState::Succeeded)))
            .unwrap();
        store
            .record(HistoryEntry::new(
                request(&engine, "b"),
                snapshot(JobState::failed(FailureKind::Timeout { window_secs: 120 })),
            ))
            .unwrap();
        store
            .record(HistoryEntry::new(request(&engine, "c"), snapshot(JobState::Cancelled)))
            .unwrap();
        let ok_again = store
            .record(HistoryEntry::new(request(&engine, "d"), snapshot(JobState::Succeeded)))
            .unwrap();

        assert_eq!(store.clear_where(HistoryFilter::Failed).unwrap(), 2);
        let left: Vec<_> = store.list().map(|e| e.id).collect();
        assert_eq!(left, vec![ok_again, ok]);

        assert_eq!(store.clear_where(HistoryFilter::Failed).unwrap(), 0);
        assert_eq!(store.clear_where(HistoryFilter::Succeeded).unwrap(), 2);
        assert!(store.is_empty());
    }

    #[test]
    fn failed_write_leaves_store_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "not a directory").unwrap();
        let engine = TemplateEngine::builtin().unwrap();
        let req = request(&engine, "moss");

        let mut store = HistoryStore::open(blocker.join("history.json")).unwrap();
        assert_matches!(
            store.record(HistoryEntry::new(req.clone(), snapshot(JobState::Succeeded))),
            Err(HistoryError::Io(_))
        );
        assert!(store.is_empty());

        // The same request can be recorded once the location is writable.
        store.path = Some(dir.path().join("history.json"));
        let id = store
            .record(HistoryEntry::new(req, snapshot(JobState::Succeeded)))
            .unwrap();
        assert_eq!(id, 1);

        store.path = Some(blocker.join("history.json"));
        assert_matches!(store.remove(id), Err(HistoryError::Io(_)));
        assert_matches!(store.clear_where(HistoryFilter::All), Err(HistoryError::Io(_)));
        assert_matches!(
            store.reuse_parameters(id, &engine, &caps(), SeedMode::Fixed),
            Err(HistoryError::Io(_))
        );
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(id).unwrap().marker, None);

        let reopened = HistoryStore::open(dir.path().join("history.json")).unwrap();
        assert_eq!(reopened.list().map(|e| e.id).collect::<Vec<_>>(), vec![id]);
    }

    #[test]
    fn rejects_unknown_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("h.json");
        std::fs::write(&path, r#"{"version": 99, "next_id": 1, "entries": []}"#).unwrap();
        assert_matches!(
            HistoryStore::open(&path),
            Err(HistoryError::UnsupportedVersion(99))
        );
    }
}
