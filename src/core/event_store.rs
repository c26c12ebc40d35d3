//! Append-only event store with file-based persistence.
//!
//! Events are stored as newline-delimited JSON (JSONL) for simplicity
//! and easy debugging/inspection. Each run owns one directory:
//!
//! ```text
//! <runs>/<run_id>/events.jsonl
//! <runs>/<run_id>/artifacts/<stage>/<name>
//! <runs>/<run_id>/workspaces/<stage>/
//! ```

use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::{Event, EventType};

/// File-based event store using JSONL format
pub struct EventStore {
    /// Directory containing the run
    run_dir: PathBuf,

    /// Path to the events.jsonl file
    events_path: PathBuf,

    /// Path to artifacts directory
    artifacts_dir: PathBuf,

    /// Path to per-stage working directories
    workspaces_dir: PathBuf,

    /// Stages finish concurrently; appends are serialized so lines never
    /// interleave
    write_lock: Mutex<()>,
}

impl EventStore {
    /// Create or open the event store of a run under `base_dir`
    pub async fn open_in(base_dir: &Path, run_id: Uuid) -> Result<Self> {
        let run_dir = base_dir.join(run_id.to_string());
        let artifacts_dir = run_dir.join("artifacts");
        let workspaces_dir = run_dir.join("workspaces");

        fs::create_dir_all(&artifacts_dir)
            .await
            .with_context(|| format!("Failed to create artifacts directory: {}", artifacts_dir.display()))?;

        let events_path = run_dir.join("events.jsonl");

        Ok(Self {
            run_dir,
            events_path,
            artifacts_dir,
            workspaces_dir,
            write_lock: Mutex::new(()),
        })
    }

    /// Get the path to the events file
    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    /// Get the run directory
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Get the artifacts directory
    pub fn artifacts_dir(&self) -> &Path {
        &self.artifacts_dir
    }

    /// Working directory of a stage, created on first use
    pub async fn workspace_dir(&self, stage_id: &str) -> Result<PathBuf> {
        let relative = safe_relative_path(stage_id)?;
        let dir = self.workspaces_dir.join(relative);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create workspace: {}", dir.display()))?;
        Ok(dir)
    }

    /// Persist an artifact's bytes under artifacts/<stage>/<name>
    pub async fn store_artifact(&self, stage_id: &str, name: &str, content: &[u8]) -> Result<PathBuf> {
        let artifact_path = self
            .artifacts_dir
            .join(safe_relative_path(stage_id)?)
            .join(safe_relative_path(name)?);

        if let Some(parent) = artifact_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        fs::write(&artifact_path, content)
            .await
            .with_context(|| format!("Failed to write artifact: {}", artifact_path.display()))?;

        Ok(artifact_path)
    }

    /// Load a persisted artifact
    pub async fn load_artifact(&self, stage_id: &str, name: &str) -> Result<Option<Vec<u8>>> {
        let artifact_path = self
            .artifacts_dir
            .join(safe_relative_path(stage_id)?)
            .join(safe_relative_path(name)?);

        if !artifact_path.exists() {
            return Ok(None);
        }

        let content = fs::read(&artifact_path)
            .await
            .with_context(|| format!("Failed to read artifact: {}", artifact_path.display()))?;

        Ok(Some(content))
    }

    /// Append an event to the log
    pub async fn append(&self, event: &Event) -> Result<()> {
        let json = serde_json::to_string(event).context("Failed to serialize event")?;

        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to open events file: {}",
                    self.events_path.display()
                )
            })?;

        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write event")?;
        file.flush().await.context("Failed to flush event")?;

        Ok(())
    }

    /// Replay all events in order
    pub async fn replay(&self) -> Result<Vec<Event>> {
        if !self.events_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.events_path)
            .await
            .with_context(|| format!("Failed to open events file: {}", self.events_path.display()))?;

        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: Event = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse event: {}", line))?;
            events.push(event);
        }

        Ok(events)
    }

    /// Get the last event of a specific type
    pub async fn last_event_of_type(&self, event_type: EventType) -> Result<Option<Event>> {
        let events = self.replay().await?;
        Ok(events.into_iter().rev().find(|e| e.event_type == event_type))
    }

    /// List all run IDs in a runs directory
    pub async fn list_runs(base_dir: &Path) -> Result<Vec<Uuid>> {
        if !base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        let mut entries = fs::read_dir(base_dir)
            .await
            .with_context(|| format!("Failed to read runs directory: {}", base_dir.display()))?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if let Ok(uuid) = Uuid::parse_str(name) {
                        runs.push(uuid);
                    }
                }
            }
        }

        Ok(runs)
    }
}

/// Validate a stage id or artifact name for use as a relative path. Only
/// normal components are allowed, so nothing escapes the run directory.
pub(crate) fn safe_relative_path(name: &str) -> Result<PathBuf> {
    let path = Path::new(name);
    if name.is_empty() {
        anyhow::bail!("Empty path component");
    }
    if !path.components().all(|c| matches!(c, Component::Normal(_))) {
        anyhow::bail!("Unsafe path: {}", name);
    }
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ArtifactRecord, FailureKind};
    use tempfile::TempDir;

    async fn create_test_store() -> (EventStore, TempDir, Uuid) {
        let temp_dir = TempDir::new().unwrap();
        let run_id = Uuid::new_v4();
        let store = EventStore::open_in(temp_dir.path(), run_id).await.unwrap();
        (store, temp_dir, run_id)
    }

    #[tokio::test]
    async fn test_event_append_and_replay() {
        let (store, _temp, run_id) = create_test_store().await;

        let event1 = Event::new(run_id, None, EventType::RunStarted, "Run started");
        let event2 = Event::stage(run_id, "Build", EventType::StageStarted, "Stage started")
            .with_attempt(1);

        store.append(&event1).await.unwrap();
        store.append(&event2).await.unwrap();

        let events = store.replay().await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::RunStarted);
        assert_eq!(events[1].event_type, EventType::StageStarted);
        assert_eq!(events[1].attempt, Some(1));
    }

    #[tokio::test]
    async fn test_event_replay_order() {
        let (store, _temp, run_id) = create_test_store().await;

        for i in 0..5 {
            let event = Event::stage(
                run_id,
                &format!("stage{}", i),
                EventType::StageStarted,
                format!("Stage {} started", i),
            );
            store.append(&event).await.unwrap();
        }

        let events = store.replay().await.unwrap();
        assert_eq!(events.len(), 5);

        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.stage_id, Some(format!("stage{}", i)));
        }
    }

    #[tokio::test]
    async fn test_concurrent_appends_do_not_interleave() {
        let (store, _temp, run_id) = create_test_store().await;
        let store = std::sync::Arc::new(store);

        let mut handles = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let event = Event::stage(
                    run_id,
                    &format!("stage{}", i),
                    EventType::StageFailed,
                    "x".repeat(4096),
                )
                .with_failure(FailureKind::StepExecution, "boom");
                store.append(&event).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.replay().await.unwrap().len(), 20);
    }

    #[tokio::test]
    async fn test_last_event_of_type() {
        let (store, _temp, run_id) = create_test_store().await;

        store
            .append(&Event::stage(run_id, "Build", EventType::StageStarted, "start"))
            .await
            .unwrap();
        store
            .append(&Event::stage(run_id, "Test", EventType::StageStarted, "start"))
            .await
            .unwrap();
        store
            .append(&Event::stage(run_id, "Build", EventType::StageSucceeded, "done"))
            .await
            .unwrap();

        assert_eq!(store.replay().await.unwrap().len(), 3);
        let last = store
            .last_event_of_type(EventType::StageStarted)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(last.stage_id.as_deref(), Some("Test"));
    }

    #[tokio::test]
    async fn test_artifact_roundtrip_with_nested_name() {
        let (store, _temp, run_id) = create_test_store().await;

        let path = store
            .store_artifact("Build", "target/app.jar", b"jar")
            .await
            .unwrap();
        assert!(path.ends_with("artifacts/Build/target/app.jar"));

        let loaded = store.load_artifact("Build", "target/app.jar").await.unwrap();
        assert_eq!(loaded.as_deref(), Some(&b"jar"[..]));
        assert!(store.load_artifact("Build", "missing").await.unwrap().is_none());

        let record = ArtifactRecord::new(run_id, "Build", "target/app.jar", b"jar");
        store
            .append(
                &Event::stage(run_id, "Build", EventType::ArtifactRegistered, "registered")
                    .with_artifact(record),
            )
            .await
            .unwrap();
        let events = store.replay().await.unwrap();
        assert_eq!(events[0].artifact.as_ref().unwrap().name, "target/app.jar");
    }

    #[tokio::test]
    async fn test_unsafe_names_rejected() {
        let (store, _temp, _run_id) = create_test_store().await;

        assert!(store.store_artifact("Build", "../escape", b"x").await.is_err());
        assert!(store.store_artifact("Build", "/etc/passwd", b"x").await.is_err());
        assert!(store.workspace_dir("..").await.is_err());
        assert!(safe_relative_path("").is_err());
        assert!(safe_relative_path("dist/app.tar.gz").is_ok());
    }

    #[tokio::test]
    async fn test_workspace_dir_created() {
        let (store, _temp, _run_id) = create_test_store().await;

        let dir = store.workspace_dir("Deploy").await.unwrap();
        assert!(dir.is_dir());
        assert!(dir.starts_with(store.run_dir()));
    }

    #[tokio::test]
    async fn test_list_runs() {
        let temp = TempDir::new().unwrap();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        EventStore::open_in(temp.path(), a).await.unwrap();
        EventStore::open_in(temp.path(), b).await.unwrap();
        std::fs::create_dir_all(temp.path().join("not-a-run")).unwrap();

        let mut runs = EventStore::list_runs(temp.path()).await.unwrap();
        runs.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(runs, expected);

        let missing = temp.path().join("nope");
        assert!(EventStore::list_runs(&missing).await.unwrap().is_empty());
    }
}
