use crate::domain::snapshots::{Snapshot, SnapshotMetadata};
use crate::error::{CheckpointError, Result};
use chrono::{DateTime, Utc};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Reserved file at the root of every snapshot directory.
pub const METADATA_FILE_NAME: &str = ".checkpoint-meta.json";
const METADATA_TMP_FILE_NAME: &str = ".checkpoint-meta.json.tmp";

/// Root-level names that belong to the store, not to the captured save.
pub(crate) const RESERVED_NAMES: [&str; 2] = [METADATA_FILE_NAME, METADATA_TMP_FILE_NAME];
const ALLOCATE_ATTEMPTS: usize = 8;

/// A freshly reserved, still empty snapshot directory.
#[derive(Debug, Clone)]
pub struct SnapshotSlot {
    pub id: String,
    pub path: PathBuf,
    pub timestamp: DateTime<Utc>,
}

/// Owns `<root>/<game_id>/<snapshot_id>/` and the sidecars inside it.
///
/// The directory tree is the only record of which snapshots exist; every
/// listing is a fresh scan.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn snapshot_dir(&self, game_id: &str) -> PathBuf {
        self.root.join(game_id)
    }

    pub fn allocate(&self, game_id: &str) -> Result<SnapshotSlot> {
        let game_dir = self.snapshot_dir(game_id);
        fs::create_dir_all(&game_dir).map_err(|e| {
            CheckpointError::io(
                format!("Failed to create snapshot directory {}", game_dir.display()),
                e,
            )
        })?;

        let mut last_err = None;
        for _ in 0..ALLOCATE_ATTEMPTS {
            let timestamp = Utc::now();
            let id = allocate_id(timestamp);
            let path = game_dir.join(&id);
            match fs::create_dir(&path) {
                Ok(()) => return Ok(SnapshotSlot { id, path, timestamp }),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    log::debug!("Snapshot id {} already taken, drawing another", id);
                    last_err = Some(e);
                }
                Err(e) => {
                    return Err(CheckpointError::io(
                        format!("Failed to create snapshot directory {}", path.display()),
                        e,
                    ))
                }
            }
        }

        Err(CheckpointError::io(
            format!("Could not allocate a snapshot directory in {}", game_dir.display()),
            last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::AlreadyExists)),
        ))
    }

    pub fn write_metadata(&self, snapshot_path: &Path, snapshot: &Snapshot) -> Result<()> {
        let json = serde_json::to_vec_pretty(&SnapshotMetadata::from(snapshot))?;
        let final_path = snapshot_path.join(METADATA_FILE_NAME);
        let tmp_path = snapshot_path.join(METADATA_TMP_FILE_NAME);

        fs::write(&tmp_path, json).map_err(|e| {
            CheckpointError::io(format!("Failed to write metadata {}", tmp_path.display()), e)
        })?;
        fs::rename(&tmp_path, &final_path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            CheckpointError::io(
                format!("Failed to write metadata {}", final_path.display()),
                e,
            )
        })
    }

    pub fn read_metadata(&self, snapshot_path: &Path) -> Result<Snapshot> {
        let metadata_path = snapshot_path.join(METADATA_FILE_NAME);
        let contents = fs::read(&metadata_path).map_err(|e| CheckpointError::CorruptMetadata {
            path: metadata_path.clone(),
            reason: e.to_string(),
        })?;
        let metadata: SnapshotMetadata =
            serde_json::from_slice(&contents).map_err(|e| CheckpointError::CorruptMetadata {
                path: metadata_path.clone(),
                reason: e.to_string(),
            })?;
        Ok(metadata.into_snapshot(snapshot_path))
    }

    /// Every readable snapshot of a game, newest first. Entries with a
    /// missing or damaged sidecar are logged and left out.
    pub fn enumerate(&self, game_id: &str) -> Result<Vec<Snapshot>> {
        let game_dir = self.snapshot_dir(game_id);
        if !game_dir.exists() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&game_dir).map_err(|e| {
            CheckpointError::io(
                format!("Failed to read snapshots directory {}", game_dir.display()),
                e,
            )
        })?;

        let mut snapshots = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    log::warn!("Skipping unreadable entry in {}: {}", game_dir.display(), e);
                    continue;
                }
            };
            let path = entry.path();
            if !path.is_dir() || is_hidden(&path) {
                continue;
            }

            match self.read_metadata(&path) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => log::warn!("Skipping snapshot directory: {}", e),
            }
        }

        snapshots.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        Ok(snapshots)
    }

    /// Finds which game directory holds `snapshot_id`.
    pub fn locate(&self, snapshot_id: &str) -> Option<(String, PathBuf)> {
        if !is_safe_component(snapshot_id) {
            return None;
        }
        let games = fs::read_dir(&self.root).ok()?;
        for game in games.flatten() {
            let candidate = game.path().join(snapshot_id);
            if candidate.is_dir() {
                let game_id = game.file_name().to_string_lossy().to_string();
                return Some((game_id, candidate));
            }
        }
        None
    }

    /// Resolves a snapshot and checks that it belongs to `game_id`.
    pub fn find(&self, game_id: &str, snapshot_id: &str) -> Result<Snapshot> {
        let (owner, path) = self
            .locate(snapshot_id)
            .ok_or_else(|| CheckpointError::snapshot_not_found(snapshot_id))?;
        let snapshot = self.read_metadata(&path)?;
        if owner != game_id || snapshot.game_id != game_id {
            return Err(CheckpointError::OwnershipMismatch {
                snapshot_id: snapshot_id.to_string(),
                game_id: game_id.to_string(),
            });
        }
        Ok(snapshot)
    }

    pub fn delete(&self, snapshot_id: &str) -> Result<()> {
        let (_, path) = self
            .locate(snapshot_id)
            .ok_or_else(|| CheckpointError::snapshot_not_found(snapshot_id))?;
        remove_tree(&path)
    }

    pub fn rename(&self, snapshot_id: &str, new_name: &str) -> Result<Snapshot> {
        let (_, path) = self
            .locate(snapshot_id)
            .ok_or_else(|| CheckpointError::snapshot_not_found(snapshot_id))?;
        let mut snapshot = self.read_metadata(&path)?;
        snapshot.name = new_name.to_string();
        self.write_metadata(&path, &snapshot)?;
        Ok(snapshot)
    }

    /// Removes a half-built snapshot. Failures are logged, not returned: the
    /// caller is already reporting the error that caused the cleanup.
    pub fn discard(&self, path: &Path) {
        if let Err(e) = remove_tree(path) {
            log::warn!("Failed to clean up partial snapshot {}: {}", path.display(), e);
        }
    }

    pub fn delete_game(&self, game_id: &str) -> Result<()> {
        let game_dir = self.snapshot_dir(game_id);
        if !game_dir.exists() {
            return Ok(());
        }
        remove_tree(&game_dir)
    }
}

fn allocate_id(timestamp: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", timestamp.format("%Y%m%d-%H%M%S%3f"), &suffix[..12])
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().starts_with('.'))
        .unwrap_or(false)
}

fn is_safe_component(id: &str) -> bool {
    !id.is_empty() && id != "." && id != ".." && !id.contains('/') && !id.contains('\\')
}

// A directory removed out from under us (another delete, a user in a file
// manager) counts as removed.
fn remove_tree(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CheckpointError::io(
            format!("Failed to delete {}", path.display()),
            e,
        )),
    }
}
