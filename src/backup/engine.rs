use crate::backup::archive;
use crate::backup::copy::{clear_directory, copy_tree, scan_tree, TaskControl, TreeListing};
use crate::backup::locks::GameLocks;
use crate::backup::store::{SnapshotSlot, SnapshotStore, RESERVED_NAMES};
use crate::domain::games::Game;
use crate::domain::snapshots::{RestoreFailure, RestoreResult, Snapshot};
use crate::error::{CheckpointError, Result};
use crate::settings::Settings;
use crate::system::{available_space, ProcessMonitor, SystemProcessMonitor};
use chrono::{DateTime, Utc};
use std::fs;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    pub copy_threads: usize,
    /// Snapshots kept per game after a capture; 0 keeps everything.
    pub max_snapshots_per_game: u32,
    pub check_free_space: bool,
}

impl EngineOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            copy_threads: settings.resolved_copy_threads(),
            max_snapshots_per_game: settings.max_snapshots_per_game,
            check_free_space: settings.check_free_space,
        }
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

// --- Engine Implementation ---

/// Creates, restores and maintains the snapshots of tracked games.
///
/// All disk access goes through [`SnapshotStore`]. Mutating operations hold
/// the game's lock for their whole duration, so a restore can never read a
/// directory that a concurrent capture or delete of the same game is
/// rewriting.
pub struct SnapshotEngine<P: ProcessMonitor = SystemProcessMonitor> {
    store: SnapshotStore,
    monitor: P,
    locks: Arc<GameLocks>,
    options: EngineOptions,
}

impl SnapshotEngine<SystemProcessMonitor> {
    pub fn new(store: SnapshotStore, options: EngineOptions) -> Self {
        Self::with_monitor(store, SystemProcessMonitor, options)
    }
}

impl<P: ProcessMonitor> SnapshotEngine<P> {
    pub fn with_monitor(store: SnapshotStore, monitor: P, options: EngineOptions) -> Self {
        Self {
            store,
            monitor,
            locks: Arc::new(GameLocks::new()),
            options,
        }
    }

    /// Shares a lock table with other engines, so operations on one game
    /// stay serialized across an engine rebuilt for new settings.
    pub fn with_locks(mut self, locks: Arc<GameLocks>) -> Self {
        self.locks = locks;
        self
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn options(&self) -> EngineOptions {
        self.options
    }

    pub fn is_process_running(&self, exe_name: &str) -> bool {
        self.monitor.is_running(exe_name)
    }

    /// Fails with `ProcessRunning` while the game's executable is alive.
    pub fn ensure_not_running(&self, game: &Game) -> Result<()> {
        match game.exe_name.as_deref().filter(|n| !n.trim().is_empty()) {
            Some(exe_name) if self.monitor.is_running(exe_name) => {
                Err(CheckpointError::ProcessRunning(exe_name.to_string()))
            }
            _ => Ok(()),
        }
    }

    pub fn list(&self, game: &Game) -> Result<Vec<Snapshot>> {
        self.store.enumerate(&game.id)
    }

    pub fn create(&self, game: &Game, name: Option<&str>) -> Result<Snapshot> {
        self.create_with_control(game, name, &TaskControl::none())
    }

    pub fn create_with_control(
        &self,
        game: &Game,
        name: Option<&str>,
        control: &TaskControl,
    ) -> Result<Snapshot> {
        self.create_resolved(&game.id, |_| Ok(game.clone()), name, control)
    }

    /// Like [`SnapshotEngine::create_with_control`], but looks the game up
    /// only once its lock is held. A game deleted in the meantime yields the
    /// resolver's error instead of a snapshot directory nobody owns.
    pub fn create_resolved<F>(
        &self,
        game_id: &str,
        resolve: F,
        name: Option<&str>,
        control: &TaskControl,
    ) -> Result<Snapshot>
    where
        F: FnOnce(&str) -> Result<Game>,
    {
        let _guard = self.locks.acquire(game_id);
        let game = &resolve(game_id)?;
        let snapshot = self.capture(game, name, control)?;

        if self.options.max_snapshots_per_game > 0 {
            let keep = self.options.max_snapshots_per_game as usize;
            if let Err(e) = self.prune_unlocked(game, keep, Some(snapshot.id.as_str())) {
                log::warn!("Failed to prune old snapshots of {}: {}", game.id, e);
            }
        }

        Ok(snapshot)
    }

    /// Copies the live save directory into a new snapshot. A failure at any
    /// point removes the half-written directory before the error is returned.
    fn capture(&self, game: &Game, name: Option<&str>, control: &TaskControl) -> Result<Snapshot> {
        let save_path = Path::new(&game.save_location);
        if !save_path.is_dir() || fs::read_dir(save_path).is_err() {
            return Err(CheckpointError::SourceNotFound(save_path.to_path_buf()));
        }

        let listing = scan_tree(save_path, &RESERVED_NAMES)?;
        self.ensure_free_space(listing.total_bytes)?;

        let slot = self.store.allocate(&game.id)?;
        match self.fill_slot(game, name, &slot, &listing, control) {
            Ok(snapshot) => {
                log::info!(
                    "Created snapshot {} for game {} ({} files, {} bytes)",
                    snapshot.id,
                    game.id,
                    snapshot.file_count,
                    snapshot.size
                );
                Ok(snapshot)
            }
            Err(e) => {
                log::warn!("Snapshot of game {} aborted: {}", game.id, e);
                self.store.discard(&slot.path);
                Err(e)
            }
        }
    }

    fn fill_slot(
        &self,
        game: &Game,
        name: Option<&str>,
        slot: &SnapshotSlot,
        listing: &TreeListing,
        control: &TaskControl,
    ) -> Result<Snapshot> {
        let summary = copy_tree(listing, &slot.path, self.options.copy_threads, "copy", control)?;

        let snapshot = Snapshot {
            id: slot.id.clone(),
            game_id: game.id.clone(),
            timestamp: slot.timestamp,
            name: snapshot_name(name, slot.timestamp),
            path: slot.path.clone(),
            size: summary.total_bytes,
            file_count: summary.file_count,
        };
        self.store.write_metadata(&slot.path, &snapshot)?;
        Ok(snapshot)
    }

    fn ensure_free_space(&self, needed: u64) -> Result<()> {
        if !self.options.check_free_space || needed == 0 {
            return Ok(());
        }
        check_space(needed, available_space(self.store.root()))
    }

    pub fn restore(&self, snapshot_id: &str, game: &Game) -> Result<RestoreResult> {
        self.restore_with_control(snapshot_id, game, &TaskControl::none())
    }

    /// Overwrites the live save directory with a snapshot.
    ///
    /// Unknown ids and foreign snapshots are errors. A running game, a
    /// damaged snapshot or a failed safety backup are reported through the
    /// result and leave the live directory untouched.
    pub fn restore_with_control(
        &self,
        snapshot_id: &str,
        game: &Game,
        control: &TaskControl,
    ) -> Result<RestoreResult> {
        let _guard = self.locks.acquire(&game.id);
        let snapshot = self.store.find(&game.id, snapshot_id)?;

        if let Err(CheckpointError::ProcessRunning(exe_name)) = self.ensure_not_running(game) {
            log::info!("Restore of {} blocked: {} is running", snapshot_id, exe_name);
            return Ok(RestoreResult::refused(
                RestoreFailure::ProcessRunning,
                format!(
                    "Cannot restore: {} is currently running. Please close the game first.",
                    exe_name
                ),
            ));
        }

        if !self.matches_recorded_contents(&snapshot)? {
            return Ok(RestoreResult::refused(
                RestoreFailure::VerificationFailed,
                "Snapshot verification failed. Files may be corrupted.",
            ));
        }

        let save_path = Path::new(&game.save_location);
        if save_path.exists() && !save_path.is_dir() {
            return Err(CheckpointError::validation(
                "save_location",
                format!("{} is not a directory", save_path.display()),
            ));
        }

        let live_has_data = save_path.is_dir() && !scan_tree(save_path, &[])?.is_empty();
        let mut backup_snapshot_id = None;
        if live_has_data {
            let label = format!(
                "Auto-backup before restore {}",
                Utc::now().format("%Y-%m-%d %H:%M:%S")
            );
            match self.capture(game, Some(label.as_str()), control) {
                Ok(backup) => backup_snapshot_id = Some(backup.id),
                Err(e) => {
                    return Ok(RestoreResult::refused(
                        RestoreFailure::BackupFailed,
                        format!("Could not back up current saves, restore aborted: {}", e),
                    ));
                }
            }
        }
        let backed_up_current = backup_snapshot_id.is_some();

        match self.copy_back(&snapshot, save_path, control) {
            Ok(()) => {
                log::info!("Restored snapshot {} into {}", snapshot.id, save_path.display());
                Ok(RestoreResult {
                    success: true,
                    backed_up_current,
                    backup_snapshot_id,
                    message: "Restore completed successfully".to_string(),
                    failure: None,
                })
            }
            Err(e) => {
                log::warn!("Restore of {} failed midway: {}", snapshot.id, e);
                let message = match &backup_snapshot_id {
                    Some(id) => format!(
                        "Restore failed: {}. Previous saves are kept in snapshot {}",
                        e, id
                    ),
                    None => format!("Restore failed: {}", e),
                };
                Ok(RestoreResult {
                    success: false,
                    backed_up_current,
                    backup_snapshot_id,
                    message,
                    failure: Some(RestoreFailure::CopyFailed),
                })
            }
        }
    }

    fn copy_back(&self, snapshot: &Snapshot, save_path: &Path, control: &TaskControl) -> Result<()> {
        if save_path.is_dir() {
            clear_directory(save_path)?;
        } else {
            fs::create_dir_all(save_path).map_err(|e| {
                CheckpointError::io(
                    format!("Failed to create save directory {}", save_path.display()),
                    e,
                )
            })?;
        }

        let listing = scan_tree(&snapshot.path, &RESERVED_NAMES)?;
        copy_tree(&listing, save_path, self.options.copy_threads, "restore", control)?;
        Ok(())
    }

    pub fn rename(&self, snapshot_id: &str, game: &Game, new_name: &str) -> Result<Snapshot> {
        if new_name.trim().is_empty() {
            return Err(CheckpointError::validation("name", "must not be empty"));
        }
        let _guard = self.locks.acquire(&game.id);
        self.store.find(&game.id, snapshot_id)?;
        self.store.rename(snapshot_id, new_name)
    }

    pub fn delete(&self, snapshot_id: &str, game: &Game) -> Result<()> {
        let _guard = self.locks.acquire(&game.id);
        self.check_owner(snapshot_id, game)?;
        self.store.delete(snapshot_id)?;
        log::info!("Deleted snapshot {} of game {}", snapshot_id, game.id);
        Ok(())
    }

    /// Removes every snapshot of a game; used when the game itself is deleted.
    pub fn delete_all(&self, game_id: &str) -> Result<()> {
        self.delete_all_with(game_id, || Ok(()))
    }

    /// Removes every snapshot of a game, then runs `finish` before the game's
    /// lock is released.
    pub fn delete_all_with<F>(&self, game_id: &str, finish: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        let _guard = self.locks.acquire(game_id);
        self.store.delete_game(game_id)?;
        finish()
    }

    /// Unlike [`SnapshotStore::find`], this tolerates a missing sidecar so a
    /// half-removed snapshot can still be cleaned up.
    fn check_owner(&self, snapshot_id: &str, game: &Game) -> Result<()> {
        let (owner, path) = self
            .store
            .locate(snapshot_id)
            .ok_or_else(|| CheckpointError::snapshot_not_found(snapshot_id))?;
        let sidecar_owner = self.store.read_metadata(&path).ok().map(|s| s.game_id);
        if owner != game.id || sidecar_owner.is_some_and(|id| id != game.id) {
            return Err(CheckpointError::OwnershipMismatch {
                snapshot_id: snapshot_id.to_string(),
                game_id: game.id.clone(),
            });
        }
        Ok(())
    }

    /// Recounts files and bytes on disk and compares them with the sidecar.
    /// A mismatch or an unreadable sidecar yields `false`.
    pub fn verify(&self, snapshot_id: &str, game: &Game) -> Result<bool> {
        let snapshot = match self.store.find(&game.id, snapshot_id) {
            Ok(snapshot) => snapshot,
            Err(CheckpointError::CorruptMetadata { path, reason }) => {
                log::warn!("Snapshot {} has unreadable metadata at {}: {}", snapshot_id, path.display(), reason);
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        self.matches_recorded_contents(&snapshot)
    }

    fn matches_recorded_contents(&self, snapshot: &Snapshot) -> Result<bool> {
        let listing = scan_tree(&snapshot.path, &RESERVED_NAMES)?;
        let count_matches = listing.files.len() == snapshot.file_count;
        let size_matches = listing.total_bytes == snapshot.size;
        if !(count_matches && size_matches) {
            log::warn!(
                "Snapshot {} differs from its metadata: {} files/{} bytes on disk, {} files/{} bytes recorded",
                snapshot.id,
                listing.files.len(),
                listing.total_bytes,
                snapshot.file_count,
                snapshot.size
            );
        }
        Ok(count_matches && size_matches)
    }

    /// Adopts an archive produced by [`SnapshotEngine::export`] (possibly on
    /// another machine) as a new snapshot of `game`.
    pub fn import(&self, game: &Game, name: &str, archive_bytes: &[u8]) -> Result<Snapshot> {
        self.import_resolved(&game.id, |_| Ok(game.clone()), name, archive_bytes)
    }

    /// [`SnapshotEngine::import`] with the game looked up under its lock.
    pub fn import_resolved<F>(
        &self,
        game_id: &str,
        resolve: F,
        name: &str,
        archive_bytes: &[u8],
    ) -> Result<Snapshot>
    where
        F: FnOnce(&str) -> Result<Game>,
    {
        let _guard = self.locks.acquire(game_id);
        let game = &resolve(game_id)?;
        let slot = self.store.allocate(&game.id)?;

        let result = archive::unpack(archive_bytes, &slot.path, &RESERVED_NAMES).and_then(|summary| {
            let snapshot = Snapshot {
                id: slot.id.clone(),
                game_id: game.id.clone(),
                timestamp: slot.timestamp,
                name: snapshot_name(Some(name), slot.timestamp),
                path: slot.path.clone(),
                size: summary.size,
                file_count: summary.file_count,
            };
            self.store.write_metadata(&slot.path, &snapshot)?;
            Ok(snapshot)
        });

        match result {
            Ok(snapshot) => {
                log::info!("Imported snapshot {} for game {}", snapshot.id, game.id);
                Ok(snapshot)
            }
            Err(e) => {
                self.store.discard(&slot.path);
                Err(e)
            }
        }
    }

    /// Packs a snapshot's files (without its sidecar) into a portable archive.
    pub fn export(&self, snapshot_id: &str, game: &Game) -> Result<Vec<u8>> {
        let _guard = self.locks.acquire(&game.id);
        let snapshot = self.store.find(&game.id, snapshot_id)?;
        archive::pack(&snapshot.path, &RESERVED_NAMES)
    }

    /// Deletes all but the `keep` newest snapshots of a game and returns the
    /// ids it removed.
    pub fn prune(&self, game: &Game, keep: usize) -> Result<Vec<String>> {
        if keep == 0 {
            return Err(CheckpointError::validation(
                "keep",
                "at least one snapshot must be kept",
            ));
        }
        let _guard = self.locks.acquire(&game.id);
        self.prune_unlocked(game, keep, None)
    }

    fn prune_unlocked(&self, game: &Game, keep: usize, protect: Option<&str>) -> Result<Vec<String>> {
        let mut snapshots = self.store.enumerate(&game.id)?;
        // The protected snapshot always occupies one of the kept places.
        if let Some(pos) = protect.and_then(|id| snapshots.iter().position(|s| s.id == id)) {
            let protected = snapshots.remove(pos);
            snapshots.insert(0, protected);
        }

        let mut removed = Vec::new();
        for snapshot in snapshots.iter().skip(keep) {
            self.store.delete(&snapshot.id)?;
            removed.push(snapshot.id.clone());
        }
        if !removed.is_empty() {
            log::info!("Pruned {} old snapshots of game {}", removed.len(), game.id);
        }
        Ok(removed)
    }
}

/// An unknown amount of free space lets the write go ahead.
fn check_space(needed: u64, available: Option<u64>) -> Result<()> {
    match available {
        Some(available) if available < needed => {
            Err(CheckpointError::InsufficientSpace { needed, available })
        }
        _ => Ok(()),
    }
}

fn snapshot_name(requested: Option<&str>, timestamp: DateTime<Utc>) -> String {
    requested
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| timestamp.format("%Y-%m-%d_%H-%M-%S").to_string())
}
