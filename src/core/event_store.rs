//! Append-only run log with file-based persistence.
//!
//! Each run gets a directory under the runs root holding its events as
//! newline-delimited JSON (JSONL) and a `run.json` snapshot of the final
//! run record. Media bytes are never written.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use uuid::Uuid;

use crate::domain::{Event, EventType, PipelineRun, RunTimeline};

/// Where the orchestrator reports run activity
#[async_trait]
pub trait RunSink: Send + Sync {
    /// Append one event to the run's log
    async fn record(&self, event: &Event) -> Result<()>;

    /// Store the run record (called on every terminal transition)
    async fn persist(&self, run: &PipelineRun) -> Result<()>;
}

/// Sink that discards everything, for embedding without a filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

#[async_trait]
impl RunSink for NullSink {
    async fn record(&self, _event: &Event) -> Result<()> {
        Ok(())
    }

    async fn persist(&self, _run: &PipelineRun) -> Result<()> {
        Ok(())
    }
}

/// File-based event store using JSONL format
#[derive(Debug, Clone)]
pub struct EventStore {
    /// Directory holding one subdirectory per run
    runs_dir: PathBuf,
}

impl EventStore {
    /// Create a store rooted at `runs_dir` (created lazily)
    pub fn new(runs_dir: impl Into<PathBuf>) -> Self {
        Self {
            runs_dir: runs_dir.into(),
        }
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    /// Get the directory of a run
    pub fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.runs_dir.join(run_id.to_string())
    }

    /// Get the path to a run's events file
    pub fn events_path(&self, run_id: Uuid) -> PathBuf {
        self.run_dir(run_id).join("events.jsonl")
    }

    fn run_path(&self, run_id: Uuid) -> PathBuf {
        self.run_dir(run_id).join("run.json")
    }

    async fn ensure_run_dir(&self, run_id: Uuid) -> Result<PathBuf> {
        let run_dir = self.run_dir(run_id);
        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("Failed to create run directory: {}", run_dir.display()))?;
        Ok(run_dir)
    }

    /// Append an event to its run's log
    pub async fn append(&self, event: &Event) -> Result<()> {
        self.ensure_run_dir(event.run_id).await?;
        let events_path = self.events_path(event.run_id);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&events_path)
            .await
            .with_context(|| format!("Failed to open events file: {}", events_path.display()))?;

        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write event")?;
        file.flush().await.context("Failed to flush event")?;

        Ok(())
    }

    /// Replay all events of a run in order
    pub async fn replay(&self, run_id: Uuid) -> Result<Vec<Event>> {
        let events_path = self.events_path(run_id);
        if !events_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&events_path)
            .await
            .with_context(|| format!("Failed to open events file: {}", events_path.display()))?;

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

    /// Rebuild a run's stage timeline from its events
    pub async fn timeline(&self, run_id: Uuid) -> Result<Option<RunTimeline>> {
        let events = self.replay(run_id).await?;
        Ok(RunTimeline::from_events(&events))
    }

    /// Find events of a run matching a predicate
    pub async fn find_events<F>(&self, run_id: Uuid, predicate: F) -> Result<Vec<Event>>
    where
        F: Fn(&Event) -> bool,
    {
        let events = self.replay(run_id).await?;
        Ok(events.into_iter().filter(predicate).collect())
    }

    /// Get the last event of a specific type
    pub async fn last_event_of_type(
        &self,
        run_id: Uuid,
        event_type: EventType,
    ) -> Result<Option<Event>> {
        let events = self.replay(run_id).await?;
        Ok(events.into_iter().rev().find(|e| e.event_type == event_type))
    }

    /// Write the run record, replacing any previous snapshot
    pub async fn save_run(&self, run: &PipelineRun) -> Result<()> {
        let run_dir = self.ensure_run_dir(run.id).await?;
        let json = serde_json::to_vec_pretty(run).context("Failed to serialize run")?;

        let tmp_path = run_dir.join("run.json.tmp");
        fs::write(&tmp_path, json)
            .await
            .with_context(|| format!("Failed to write run record: {}", tmp_path.display()))?;
        fs::rename(&tmp_path, self.run_path(run.id))
            .await
            .context("Failed to move run record into place")?;

        Ok(())
    }

    /// Load a run record, if one was saved
    pub async fn load_run(&self, run_id: Uuid) -> Result<Option<PipelineRun>> {
        let path = self.run_path(run_id);
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read run record: {}", path.display()))?;
        let run = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse run record: {}", path.display()))?;

        Ok(Some(run))
    }

    /// List all run IDs under the runs root
    pub async fn list_runs(&self) -> Result<Vec<Uuid>> {
        if !self.runs_dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        let mut entries = fs::read_dir(&self.runs_dir).await?;

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

#[async_trait]
impl RunSink for EventStore {
    async fn record(&self, event: &Event) -> Result<()> {
        self.append(event).await
    }

    async fn persist(&self, run: &PipelineRun) -> Result<()> {
        self.save_run(run).await
    }
}
