use crate::backup::engine::SnapshotEngine;
use crate::db::Db;
use crate::domain::games::{
    Game, NewGame, UpdateGame, MAX_EXE_NAME_LEN, MAX_NAME_LEN, MAX_SAVE_LOCATION_LEN,
};
use crate::error::{CheckpointError, Result};
use crate::system::ProcessMonitor;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

const GAME_SELECT: &str = "SELECT id, name, save_location, exe_name, cover_image, created_at FROM games";

fn map_game_row(row: &rusqlite::Row) -> rusqlite::Result<Game> {
    let created_at: String = row.get(5)?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?
        .with_timezone(&Utc);

    Ok(Game {
        id: row.get(0)?,
        name: row.get(1)?,
        save_location: row.get(2)?,
        exe_name: row.get(3)?,
        cover_image: row.get(4)?,
        created_at,
    })
}

fn fetch_game_by_id(conn: &rusqlite::Connection, id: &str) -> rusqlite::Result<Option<Game>> {
    let mut stmt = conn.prepare(&format!("{GAME_SELECT} WHERE id = ?1"))?;
    stmt.query_row(params![id], map_game_row).optional()
}

fn required_text(field: &'static str, value: &str, max_len: usize) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(CheckpointError::validation(field, "must not be empty"));
    }
    check_length(field, trimmed, max_len)?;
    Ok(trimmed.to_string())
}

// Empty input means "absent".
fn optional_text(field: &'static str, value: Option<&str>, max_len: usize) -> Result<Option<String>> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        Some(v) => {
            check_length(field, v, max_len)?;
            Ok(Some(v.to_string()))
        }
        None => Ok(None),
    }
}

fn check_length(field: &'static str, value: &str, max_len: usize) -> Result<()> {
    let len = value.chars().count();
    if len > max_len {
        return Err(CheckpointError::validation(
            field,
            format!("is {} characters long, the limit is {}", len, max_len),
        ));
    }
    Ok(())
}

/// The set of tracked games, persisted in the `games` table.
pub struct GameRegistry<D: Db> {
    db: D,
}

impl<D: Db> GameRegistry<D> {
    pub fn new(db: D) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &D {
        &self.db
    }

    /// Registers a game. The save location does not have to exist yet.
    pub fn add(&self, game: NewGame) -> Result<Game> {
        let name = required_text("name", &game.name, MAX_NAME_LEN)?;
        let save_location =
            required_text("save_location", &game.save_location, MAX_SAVE_LOCATION_LEN)?;
        let exe_name = optional_text("exe_name", game.exe_name.as_deref(), MAX_EXE_NAME_LEN)?;
        let cover_image = optional_text("cover_image", game.cover_image.as_deref(), usize::MAX)?;

        let game = Game {
            id: Uuid::new_v4().to_string(),
            name,
            save_location,
            exe_name,
            cover_image,
            created_at: Utc::now(),
        };

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO games (id, name, save_location, exe_name, cover_image, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    game.id,
                    game.name,
                    game.save_location,
                    game.exe_name,
                    game.cover_image,
                    game.created_at.to_rfc3339()
                ],
            )?;
            Ok(())
        })?;

        log::info!("Added game {} ({})", game.name, game.id);
        Ok(game)
    }

    pub fn update(&self, update: UpdateGame) -> Result<Game> {
        let mut updates = Vec::new();
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(ref name) = update.name {
            updates.push("name = ?");
            params_vec.push(Box::new(required_text("name", name, MAX_NAME_LEN)?));
        }
        if let Some(ref save_location) = update.save_location {
            updates.push("save_location = ?");
            params_vec.push(Box::new(required_text(
                "save_location",
                save_location,
                MAX_SAVE_LOCATION_LEN,
            )?));
        }
        if let Some(ref exe_name) = update.exe_name {
            updates.push("exe_name = ?");
            params_vec.push(Box::new(optional_text(
                "exe_name",
                Some(exe_name.as_str()),
                MAX_EXE_NAME_LEN,
            )?));
        }
        if let Some(ref cover) = update.cover_image {
            updates.push("cover_image = ?");
            params_vec.push(Box::new(optional_text("cover_image", Some(cover.as_str()), usize::MAX)?));
        }

        let game = self.db.with_conn(|conn| {
            if fetch_game_by_id(conn, &update.id)?.is_none() {
                return Ok(None);
            }
            if !updates.is_empty() {
                params_vec.push(Box::new(update.id.clone()));
                let sql = format!("UPDATE games SET {} WHERE id = ?", updates.join(", "));
                let params_refs: Vec<&dyn rusqlite::ToSql> =
                    params_vec.iter().map(|p| p.as_ref()).collect();
                conn.execute(&sql, params_refs.as_slice())?;
            }
            fetch_game_by_id(conn, &update.id)
        })?;

        game.ok_or_else(|| CheckpointError::game_not_found(&update.id))
    }

    /// Removes the game and every snapshot it owns. Snapshots go first so a
    /// failed removal leaves the game listed and the delete can be retried.
    /// The row is dropped before the game's lock is released, so a create
    /// waiting on that lock finds no game instead of a fresh directory.
    pub fn delete<P: ProcessMonitor>(&self, id: &str, engine: &SnapshotEngine<P>) -> Result<()> {
        if self.get(id)?.is_none() {
            return Err(CheckpointError::game_not_found(id));
        }

        engine.delete_all_with(id, || {
            self.db.with_conn(|conn| {
                conn.execute("DELETE FROM games WHERE id = ?1", params![id])?;
                Ok(())
            })?;
            Ok(())
        })?;

        log::info!("Deleted game {} and its snapshots", id);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<Game>> {
        Ok(self.db.with_conn(|conn| fetch_game_by_id(conn, id))?)
    }

    /// Resolves a game or fails with `NotFound`.
    pub fn require(&self, id: &str) -> Result<Game> {
        self.get(id)?
            .ok_or_else(|| CheckpointError::game_not_found(id))
    }

    pub fn list(&self) -> Result<Vec<Game>> {
        let games = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{GAME_SELECT} ORDER BY name COLLATE NOCASE ASC"))?;
            let games = stmt
                .query_map([], map_game_row)?
                .filter_map(|r| match r {
                    Ok(game) => Some(game),
                    Err(e) => {
                        log::warn!("Skipping unreadable game row: {}", e);
                        None
                    }
                })
                .collect();
            Ok(games)
        })?;
        Ok(games)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::copy::TaskControl;
    use crate::backup::engine::EngineOptions;
    use crate::backup::store::SnapshotStore;
    use crate::database::open_in_memory;
    use crate::db::SqliteDb;
    use crate::error::ErrorKind;
    use std::fs;

    fn registry() -> GameRegistry<SqliteDb> {
        GameRegistry::new(SqliteDb::new(open_in_memory().expect("open db")))
    }

    fn new_game(name: &str) -> NewGame {
        NewGame {
            name: name.to_string(),
            save_location: "/saves/elsewhere".to_string(),
            exe_name: Some("game.exe".to_string()),
            cover_image: None,
        }
    }

    #[test]
    fn add_then_get_round_trips() {
        let registry = registry();
        let game = registry.add(new_game("  Hollow Knight ")).expect("add");

        assert_eq!(game.name, "Hollow Knight");
        assert_eq!(registry.get(&game.id).expect("get"), Some(game.clone()));
        assert_eq!(registry.get("nope").expect("get"), None);
    }

    #[test]
    fn add_enforces_bounds() {
        let registry = registry();

        let err = registry.add(new_game("   ")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = registry.add(new_game(&"x".repeat(MAX_NAME_LEN + 1))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        registry.add(new_game(&"x".repeat(MAX_NAME_LEN))).expect("name at the limit");

        let mut long_path = new_game("Celeste");
        long_path.save_location = "/".repeat(MAX_SAVE_LOCATION_LEN + 1);
        assert_eq!(registry.add(long_path).unwrap_err().kind(), ErrorKind::Validation);

        let mut long_exe = new_game("Celeste");
        long_exe.exe_name = Some("e".repeat(MAX_EXE_NAME_LEN + 1));
        assert_eq!(registry.add(long_exe).unwrap_err().kind(), ErrorKind::Validation);

        assert_eq!(registry.list().expect("list").len(), 1);
    }

    #[test]
    fn empty_optional_fields_are_stored_as_absent() {
        let registry = registry();
        let mut game = new_game("Celeste");
        game.exe_name = Some("  ".to_string());
        let game = registry.add(game).expect("add");
        assert_eq!(game.exe_name, None);
    }

    #[test]
    fn update_is_partial_and_clears_with_empty_string() {
        let registry = registry();
        let game = registry.add(new_game("Celeste")).expect("add");

        let updated = registry
            .update(UpdateGame {
                id: game.id.clone(),
                name: Some("Celeste DX".to_string()),
                exe_name: Some(String::new()),
                ..Default::default()
            })
            .expect("update");

        assert_eq!(updated.name, "Celeste DX");
        assert_eq!(updated.save_location, game.save_location);
        assert_eq!(updated.exe_name, None);
        assert_eq!(updated.created_at, game.created_at);
    }

    #[test]
    fn update_rejects_unknown_id_and_bad_values() {
        let registry = registry();
        let err = registry
            .update(UpdateGame {
                id: "missing".to_string(),
                name: Some("x".to_string()),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let game = registry.add(new_game("Celeste")).expect("add");
        let err = registry
            .update(UpdateGame {
                id: game.id.clone(),
                save_location: Some(" ".to_string()),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(registry.require(&game.id).expect("still there"), game);
    }

    #[test]
    fn list_is_ordered_by_name() {
        let registry = registry();
        for name in ["Outer Wilds", "celeste", "Hades"] {
            registry.add(new_game(name)).expect("add");
        }
        let names: Vec<String> = registry
            .list()
            .expect("list")
            .into_iter()
            .map(|g| g.name)
            .collect();
        assert_eq!(names, vec!["celeste", "Hades", "Outer Wilds"]);
    }

    #[test]
    fn delete_cascades_to_snapshots() {
        let dir = tempfile::tempdir().expect("tempdir");
        let saves = dir.path().join("saves");
        fs::create_dir_all(&saves).expect("mkdir");
        fs::write(saves.join("slot.sav"), b"progress").expect("write");

        let registry = registry();
        let mut new = new_game("Celeste");
        new.save_location = saves.to_string_lossy().to_string();
        let game = registry.add(new).expect("add");

        let engine = SnapshotEngine::new(
            SnapshotStore::new(dir.path().join("backups")),
            EngineOptions::default(),
        );
        engine.create(&game, None).expect("snapshot");
        assert!(engine.store().snapshot_dir(&game.id).exists());

        registry.delete(&game.id, &engine).expect("delete");

        assert_eq!(registry.get(&game.id).expect("get"), None);
        assert!(!engine.store().snapshot_dir(&game.id).exists());
        assert!(saves.join("slot.sav").exists());

        let err = registry.delete(&game.id, &engine).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn create_after_delete_leaves_no_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let saves = dir.path().join("saves");
        fs::create_dir_all(&saves).expect("mkdir");
        fs::write(saves.join("slot.sav"), b"progress").expect("write");

        let registry = registry();
        let mut new = new_game("Celeste");
        new.save_location = saves.to_string_lossy().to_string();
        let game = registry.add(new).expect("add");
        let engine = SnapshotEngine::new(
            SnapshotStore::new(dir.path().join("backups")),
            EngineOptions::default(),
        );

        std::thread::scope(|scope| {
            let creator = scope.spawn(|| {
                engine.create_resolved(&game.id, |id| registry.require(id), None, &TaskControl::none())
            });
            registry.delete(&game.id, &engine).expect("delete");
            // Either the create ran first and its snapshot went with the game,
            // or it found the game gone.
            if let Err(e) = creator.join().expect("join") {
                assert_eq!(e.kind(), ErrorKind::NotFound);
            }
        });

        assert!(!engine.store().snapshot_dir(&game.id).exists());

        let err = engine
            .create_resolved(&game.id, |id| registry.require(id), None, &TaskControl::none())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(!engine.store().snapshot_dir(&game.id).exists());
    }
}
