use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub game_id: String,
    pub timestamp: DateTime<Utc>,
    pub name: String,
    pub path: PathBuf,
    /// Total bytes of the captured files, fixed at creation.
    pub size: u64,
    pub file_count: usize,
}

/// Body of the sidecar file stored next to the captured files. The path is
/// implied by where the sidecar lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SnapshotMetadata {
    pub id: String,
    pub game_id: String,
    pub timestamp: DateTime<Utc>,
    pub name: String,
    pub size: u64,
    pub file_count: usize,
}

impl SnapshotMetadata {
    pub fn into_snapshot(self, path: &Path) -> Snapshot {
        Snapshot {
            id: self.id,
            game_id: self.game_id,
            timestamp: self.timestamp,
            name: self.name,
            path: path.to_path_buf(),
            size: self.size,
            file_count: self.file_count,
        }
    }
}

impl From<&Snapshot> for SnapshotMetadata {
    fn from(snapshot: &Snapshot) -> Self {
        Self {
            id: snapshot.id.clone(),
            game_id: snapshot.game_id.clone(),
            timestamp: snapshot.timestamp,
            name: snapshot.name.clone(),
            size: snapshot.size,
            file_count: snapshot.file_count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreFailure {
    ProcessRunning,
    VerificationFailed,
    BackupFailed,
    CopyFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreResult {
    pub success: bool,
    pub backed_up_current: bool,
    pub backup_snapshot_id: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RestoreFailure>,
}

impl RestoreResult {
    pub(crate) fn refused(failure: RestoreFailure, message: impl Into<String>) -> Self {
        Self {
            success: false,
            backed_up_current: false,
            backup_snapshot_id: None,
            message: message.into(),
            failure: Some(failure),
        }
    }
}
