use crate::database::{get_db_path, open_database};
use crate::db::SqliteDb;
use crate::domain::games::{Game, NewGame, UpdateGame};
use crate::domain::snapshots::{RestoreResult, Snapshot};
use crate::error::{CheckpointError, Result};
use crate::remote::{remote_key, snapshot_name_from_key, RemoteEntry, RemoteStore};
use crate::services::games::GameRegistry;
use crate::settings::{load_settings, save_settings, Settings};
use chrono::Utc;
use parking_lot::RwLock;
use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[path = "backup/archive.rs"]
pub mod archive;
#[path = "backup/copy.rs"]
pub mod copy;
#[path = "backup/engine.rs"]
pub mod engine;
#[path = "backup/locks.rs"]
pub mod locks;
#[path = "backup/store.rs"]
pub mod store;

use copy::TaskControl;
use engine::{EngineOptions, SnapshotEngine};
use locks::GameLocks;
use store::SnapshotStore;

/// Async entry point tying the game registry, the snapshot engine and the
/// settings table together. Every call runs on tokio's blocking pool and
/// yields exactly one result.
pub struct Checkpoint {
    registry: Arc<GameRegistry<SqliteDb>>,
    engine: RwLock<Arc<SnapshotEngine>>,
    locks: Arc<GameLocks>,
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CheckpointError::Task(e.to_string()))?
}

fn build_engine(settings: &Settings, locks: &Arc<GameLocks>) -> Arc<SnapshotEngine> {
    let store = SnapshotStore::new(settings.resolved_backup_directory());
    Arc::new(
        SnapshotEngine::new(store, EngineOptions::from_settings(settings)).with_locks(locks.clone()),
    )
}

impl Checkpoint {
    /// Opens the database in the per-user data directory.
    pub fn open_default() -> Result<Self> {
        Self::open(&get_db_path())
    }

    pub fn open(db_path: &Path) -> Result<Self> {
        Self::from_connection(open_database(db_path)?)
    }

    /// `conn` must already carry the schema (see [`crate::database::init_schema`]).
    pub fn from_connection(conn: Connection) -> Result<Self> {
        let registry = GameRegistry::new(SqliteDb::new(conn));
        let settings = load_settings(registry.db())?;
        let locks = Arc::new(GameLocks::new());
        let engine = build_engine(&settings, &locks);
        log::info!(
            "Snapshot store at {}",
            engine.store().root().display()
        );
        Ok(Self {
            registry: Arc::new(registry),
            engine: RwLock::new(engine),
            locks,
        })
    }

    fn engine(&self) -> Arc<SnapshotEngine> {
        self.engine.read().clone()
    }

    // --- Games ---

    pub async fn add_game(&self, game: NewGame) -> Result<Game> {
        let registry = self.registry.clone();
        run_blocking(move || registry.add(game)).await
    }

    pub async fn update_game(&self, update: UpdateGame) -> Result<Game> {
        let registry = self.registry.clone();
        run_blocking(move || registry.update(update)).await
    }

    pub async fn delete_game(&self, game_id: String) -> Result<()> {
        let registry = self.registry.clone();
        let engine = self.engine();
        run_blocking(move || registry.delete(&game_id, &*engine)).await
    }

    pub async fn list_games(&self) -> Result<Vec<Game>> {
        let registry = self.registry.clone();
        run_blocking(move || registry.list()).await
    }

    pub async fn get_game(&self, game_id: String) -> Result<Option<Game>> {
        let registry = self.registry.clone();
        run_blocking(move || registry.get(&game_id)).await
    }

    // --- Snapshots ---

    pub async fn create_snapshot(&self, game_id: String, name: Option<String>) -> Result<Snapshot> {
        self.create_snapshot_with_control(game_id, name, TaskControl::none())
            .await
    }

    pub async fn create_snapshot_with_control(
        &self,
        game_id: String,
        name: Option<String>,
        control: TaskControl,
    ) -> Result<Snapshot> {
        let registry = self.registry.clone();
        let engine = self.engine();
        run_blocking(move || {
            engine.create_resolved(&game_id, |id| registry.require(id), name.as_deref(), &control)
        })
        .await
    }

    pub async fn list_snapshots(&self, game_id: String) -> Result<Vec<Snapshot>> {
        let registry = self.registry.clone();
        let engine = self.engine();
        run_blocking(move || {
            let game = registry.require(&game_id)?;
            engine.list(&game)
        })
        .await
    }

    pub async fn restore_snapshot(&self, snapshot_id: String, game_id: String) -> Result<RestoreResult> {
        self.restore_snapshot_with_control(snapshot_id, game_id, TaskControl::none())
            .await
    }

    pub async fn restore_snapshot_with_control(
        &self,
        snapshot_id: String,
        game_id: String,
        control: TaskControl,
    ) -> Result<RestoreResult> {
        let registry = self.registry.clone();
        let engine = self.engine();
        run_blocking(move || {
            let game = registry.require(&game_id)?;
            engine.restore_with_control(&snapshot_id, &game, &control)
        })
        .await
    }

    pub async fn rename_snapshot(
        &self,
        snapshot_id: String,
        game_id: String,
        new_name: String,
    ) -> Result<Snapshot> {
        let registry = self.registry.clone();
        let engine = self.engine();
        run_blocking(move || {
            let game = registry.require(&game_id)?;
            engine.rename(&snapshot_id, &game, &new_name)
        })
        .await
    }

    pub async fn delete_snapshot(&self, snapshot_id: String, game_id: String) -> Result<()> {
        let registry = self.registry.clone();
        let engine = self.engine();
        run_blocking(move || {
            let game = registry.require(&game_id)?;
            engine.delete(&snapshot_id, &game)
        })
        .await
    }

    pub async fn verify_snapshot(&self, snapshot_id: String, game_id: String) -> Result<bool> {
        let registry = self.registry.clone();
        let engine = self.engine();
        run_blocking(move || {
            let game = registry.require(&game_id)?;
            engine.verify(&snapshot_id, &game)
        })
        .await
    }

    pub async fn import_snapshot(
        &self,
        game_id: String,
        name: String,
        archive: Vec<u8>,
    ) -> Result<Snapshot> {
        let registry = self.registry.clone();
        let engine = self.engine();
        run_blocking(move || {
            engine.import_resolved(&game_id, |id| registry.require(id), &name, &archive)
        })
        .await
    }

    pub async fn export_snapshot(&self, snapshot_id: String, game_id: String) -> Result<Vec<u8>> {
        let registry = self.registry.clone();
        let engine = self.engine();
        run_blocking(move || {
            let game = registry.require(&game_id)?;
            engine.export(&snapshot_id, &game)
        })
        .await
    }

    pub async fn prune_snapshots(&self, game_id: String, keep: usize) -> Result<Vec<String>> {
        let registry = self.registry.clone();
        let engine = self.engine();
        run_blocking(move || {
            let game = registry.require(&game_id)?;
            engine.prune(&game, keep)
        })
        .await
    }

    pub async fn is_process_running(&self, exe_name: String) -> Result<bool> {
        let engine = self.engine();
        run_blocking(move || Ok(engine.is_process_running(&exe_name))).await
    }

    /// Fails with `ProcessRunning` while the game's executable is alive.
    pub async fn ensure_game_closed(&self, game_id: String) -> Result<()> {
        let registry = self.registry.clone();
        let engine = self.engine();
        run_blocking(move || {
            let game = registry.require(&game_id)?;
            engine.ensure_not_running(&game)
        })
        .await
    }

    // --- Settings ---

    pub async fn settings(&self) -> Result<Settings> {
        let registry = self.registry.clone();
        run_blocking(move || load_settings(registry.db())).await
    }

    /// Persists `settings` and rebuilds the engine so later calls see the new
    /// store root and copy options. Calls already running finish on the old
    /// one. Both engines share the per-game locks.
    pub async fn update_settings(&self, settings: Settings) -> Result<Settings> {
        let registry = self.registry.clone();
        let saved = run_blocking(move || {
            save_settings(registry.db(), &settings)?;
            load_settings(registry.db())
        })
        .await?;

        *self.engine.write() = build_engine(&saved, &self.locks);
        log::info!("Settings updated, snapshot store at {}", saved.resolved_backup_directory().display());
        Ok(saved)
    }

    pub async fn backup_directory(&self) -> Result<PathBuf> {
        Ok(self.engine().store().root().to_path_buf())
    }

    /// Points the store at `path`, creating the directory. An empty path
    /// restores the default location. Existing snapshots are not moved.
    pub async fn set_backup_directory(&self, path: String) -> Result<PathBuf> {
        let mut settings = self.settings().await?;
        settings.backup_directory = path.trim().to_string();

        let root = settings.resolved_backup_directory();
        let create_root = root.clone();
        run_blocking(move || {
            fs::create_dir_all(&create_root).map_err(|e| {
                CheckpointError::io(
                    format!("Failed to create backup directory {}", create_root.display()),
                    e,
                )
            })
        })
        .await?;

        self.update_settings(settings).await?;
        Ok(root)
    }

    // --- Cloud ---

    /// Exports a snapshot and stores it remotely under `<game_id>/<name>.zip`.
    pub async fn upload_snapshot(
        &self,
        remote: Arc<dyn RemoteStore>,
        snapshot_id: String,
        game_id: String,
    ) -> Result<String> {
        let registry = self.registry.clone();
        let engine = self.engine();
        run_blocking(move || {
            let game = registry.require(&game_id)?;
            let snapshot = engine.store().find(&game.id, &snapshot_id)?;
            let blob = engine.export(&snapshot_id, &game)?;
            remote.upload(blob, &remote_key(&game.id, &snapshot.name))
        })
        .await
    }

    pub async fn list_remote_snapshots(
        &self,
        remote: Arc<dyn RemoteStore>,
        game_id: String,
    ) -> Result<Vec<RemoteEntry>> {
        run_blocking(move || remote.list(&game_id)).await
    }

    /// Fetches a remote archive and imports it as a new local snapshot. The
    /// name defaults to the one encoded in the remote key.
    pub async fn download_snapshot(
        &self,
        remote: Arc<dyn RemoteStore>,
        game_id: String,
        remote_id: String,
        name: Option<String>,
    ) -> Result<Snapshot> {
        let registry = self.registry.clone();
        let engine = self.engine();
        run_blocking(move || {
            let game = registry.require(&game_id)?;
            let name = match name.filter(|n| !n.trim().is_empty()) {
                Some(name) => name,
                None => remote
                    .list(&game.id)?
                    .into_iter()
                    .find(|entry| entry.remote_id == remote_id)
                    .and_then(|entry| snapshot_name_from_key(&entry.logical_key).map(str::to_string))
                    .unwrap_or_else(|| {
                        format!("Cloud download {}", Utc::now().format("%Y-%m-%d %H:%M:%S"))
                    }),
            };
            let blob = remote.download(&remote_id)?;
            engine.import_resolved(&game.id, |id| registry.require(id), &name, &blob)
        })
        .await
    }

    pub async fn delete_remote_snapshot(
        &self,
        remote: Arc<dyn RemoteStore>,
        remote_id: String,
    ) -> Result<()> {
        run_blocking(move || remote.delete(&remote_id)).await
    }
}
