// Run history store
// Persists run summaries, finalized commits and per-run event logs under
// <state_dir>/history

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use factory_types::{ChangeCounts, RunEvent, RunRecord};

use crate::error::Result;

/// One finalized proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitRecord {
    pub proposal_id: String,
    pub run_id: String,
    pub commit_sha: String,
    pub branch: String,
    pub message: String,
    pub files: Vec<String>,
    pub counts: ChangeCounts,
    pub created: bool,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// History Store
// ============================================================================

pub struct HistoryStore {
    base_dir: PathBuf,
    /// Serializes read-modify-write of the run index
    index_lock: Mutex<()>,
}

impl HistoryStore {
    pub fn new(state_dir: &Path) -> Result<Self> {
        let base_dir = state_dir.join("history");
        fs::create_dir_all(base_dir.join("runs"))?;
        Ok(Self {
            base_dir,
            index_lock: Mutex::new(()),
        })
    }

    fn index_path(&self) -> PathBuf {
        self.base_dir.join("runs.json")
    }

    fn commits_path(&self) -> PathBuf {
        self.base_dir.join("commits.jsonl")
    }

    fn events_path(&self, run_id: &str) -> PathBuf {
        self.base_dir.join("runs").join(format!("{run_id}.events.jsonl"))
    }

    fn read_index(&self) -> Result<Vec<RunRecord>> {
        let path = self.index_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path)?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    /// Insert or replace a run summary; the index stays sorted newest first.
    pub fn upsert_run(&self, record: &RunRecord) -> Result<()> {
        let _guard = self.index_lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut runs = self.read_index()?;
        match runs.iter_mut().find(|r| r.run_id == record.run_id) {
            Some(existing) => *existing = record.clone(),
            None => runs.push(record.clone()),
        }
        runs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        let content = serde_json::to_string_pretty(&runs)?;
        atomic_write(&self.index_path(), &content)
    }

    pub fn list_runs(&self) -> Result<Vec<RunRecord>> {
        let _guard = self.index_lock.lock().unwrap_or_else(|p| p.into_inner());
        self.read_index()
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        Ok(self.list_runs()?.into_iter().find(|r| r.run_id == run_id))
    }

    pub fn append_commit(&self, record: &CommitRecord) -> Result<()> {
        append_line(&self.commits_path(), &serde_json::to_string(record)?)
    }

    pub fn load_commits(&self) -> Result<Vec<CommitRecord>> {
        read_lines(&self.commits_path())
    }

    pub fn append_event(&self, event: &RunEvent) -> Result<()> {
        append_line(&self.events_path(&event.run_id), &serde_json::to_string(event)?)
    }

    pub fn load_events(&self, run_id: &str) -> Result<Vec<serde_json::Value>> {
        read_lines(&self.events_path(run_id))
    }
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", line)?;
    Ok(())
}

/// Parse a JSONL file, skipping lines that do not parse.
fn read_lines<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(fs::File::open(path)?);
    let mut out = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if let Ok(item) = serde_json::from_str(&line) {
            out.push(item);
        }
    }
    Ok(out)
}

/// Write through a uniquely named sibling temp file, then rename over `path`.
fn atomic_write(path: &Path, content: &str) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(content.as_bytes())?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
