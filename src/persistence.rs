//! File-based persistence
//!
//! Stores and retrieves:
//! - State snapshots, one per run, so a run can be resumed or re-scored
//! - Exported findings reports
//!
//! Layout under the data directory: `snapshots/<run_id>.json` and
//! `findings/<run_id>.json`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::{fs, io::AsyncWriteExt};
use uuid::Uuid;

use crate::{
    config::AppConfig,
    error::{ErrorContext, ReconError, Result},
    probe::ProfileKind,
    reporting::FindingsReport,
    state::ReconState,
};

const SNAPSHOT_DIR: &str = "snapshots";
const FINDINGS_DIR: &str = "findings";

#[async_trait]
pub trait StateStore {
    /// Persist a snapshot of the whole state, replacing any earlier
    /// snapshot of the same run
    async fn save_snapshot(&self, state: &ReconState) -> Result<PathBuf>;

    async fn load_snapshot(&self, run_id: &Uuid) -> Result<Option<ReconState>>;

    /// Known snapshots, newest first
    async fn list_snapshots(&self) -> Result<Vec<SnapshotSummary>>;

    async fn save_findings(&self, report: &FindingsReport) -> Result<PathBuf>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub run_id: Uuid,
    pub root_target: String,
    pub profile: ProfileKind,
    pub identities: usize,
    pub started_at: DateTime<Utc>,
    pub path: PathBuf,
}

pub struct FileStateStore {
    base_dir: PathBuf,
    pretty: bool,
}

impl FileStateStore {
    pub fn new(base_dir: PathBuf, pretty: bool) -> Self {
        Self { base_dir, pretty }
    }

    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(self.base_dir.join(SNAPSHOT_DIR)).await?;
        fs::create_dir_all(self.base_dir.join(FINDINGS_DIR)).await?;

        tracing::info!("State store initialized at: {}", self.base_dir.display());
        Ok(())
    }

    pub fn snapshot_path(&self, run_id: &Uuid) -> PathBuf {
        self.base_dir
            .join(SNAPSHOT_DIR)
            .join(format!("{}.json", run_id))
    }

    pub fn findings_path(&self, run_id: &Uuid) -> PathBuf {
        self.base_dir
            .join(FINDINGS_DIR)
            .join(format!("{}.json", run_id))
    }

    async fn write_file(&self, path: &Path, content: &str) -> Result<()> {
        let mut file = fs::File::create(path).await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Read a snapshot from an explicit path
pub async fn read_snapshot(path: &Path) -> Result<ReconState> {
    let json = fs::read_to_string(path).await.map_err(|e| {
        ReconError::io(format!("read snapshot {}", path.display()), e.to_string())
    })?;
    ReconState::from_json(&json).with_context(|| format!("parse snapshot {}", path.display()))
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn save_snapshot(&self, state: &ReconState) -> Result<PathBuf> {
        let path = self.snapshot_path(&state.metadata.run_id);
        let json = state.to_json(self.pretty)?;
        self.write_file(&path, &json).await?;

        tracing::info!("Stored state snapshot to: {}", path.display());
        Ok(path)
    }

    async fn load_snapshot(&self, run_id: &Uuid) -> Result<Option<ReconState>> {
        let path = self.snapshot_path(run_id);
        if !path.exists() {
            return Ok(None);
        }
        read_snapshot(&path).await.map(Some)
    }

    async fn list_snapshots(&self) -> Result<Vec<SnapshotSummary>> {
        let dir = self.base_dir.join(SNAPSHOT_DIR);
        let mut snapshots = Vec::new();
        if !dir.exists() {
            return Ok(snapshots);
        }

        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.extension().map(|ext| ext == "json").unwrap_or(false) {
                continue;
            }
            match read_snapshot(&path).await {
                Ok(state) => snapshots.push(SnapshotSummary {
                    run_id: state.metadata.run_id,
                    root_target: state.metadata.root_target.clone(),
                    profile: state.metadata.profile,
                    identities: state.len(),
                    started_at: state.metadata.started_at,
                    path,
                }),
                Err(e) => tracing::warn!("Skipping unreadable snapshot {}: {}", path.display(), e),
            }
        }

        snapshots.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(snapshots)
    }

    async fn save_findings(&self, report: &FindingsReport) -> Result<PathBuf> {
        let path = self.findings_path(&report.run_id);
        let json = if self.pretty {
            serde_json::to_string_pretty(report)?
        } else {
            serde_json::to_string(report)?
        };
        self.write_file(&path, &json).await?;

        tracing::info!("Stored findings to: {}", path.display());
        Ok(path)
    }
}

pub async fn create_state_store(config: &AppConfig) -> Result<Box<dyn StateStore + Send + Sync>> {
    let store = FileStateStore::new(config.persistence.data_dir.clone(), config.output.pretty);
    store.init().await?;
    Ok(Box::new(store))
}
