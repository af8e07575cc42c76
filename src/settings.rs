use crate::db::Db;
use crate::error::Result;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Root of the snapshot store. Empty means the default under the home directory.
    pub backup_directory: String,
    /// Worker threads used to copy files; 0 picks a value from the CPU count.
    pub copy_threads: usize,
    /// Snapshots kept per game after each capture; 0 disables pruning.
    pub max_snapshots_per_game: u32,
    pub check_free_space: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backup_directory: String::new(),
            copy_threads: 0,
            max_snapshots_per_game: 0,
            check_free_space: true,
        }
    }
}

impl Settings {
    pub fn resolved_backup_directory(&self) -> PathBuf {
        if self.backup_directory.trim().is_empty() {
            default_backup_directory()
        } else {
            PathBuf::from(self.backup_directory.trim())
        }
    }

    pub fn resolved_copy_threads(&self) -> usize {
        if self.copy_threads == 0 {
            num_cpus::get().clamp(1, 4)
        } else {
            clamp_copy_threads(self.copy_threads)
        }
    }
}

pub fn default_backup_directory() -> PathBuf {
    let home_dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    home_dir.join("checkpoint")
}

fn clamp_copy_threads(value: usize) -> usize {
    value.clamp(1, 32)
}

fn clamp_max_snapshots(value: u32) -> u32 {
    value.min(1000)
}

fn bool_str(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

pub fn load_settings<D: Db>(db: &D) -> Result<Settings> {
    let settings = db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT key, value FROM settings")?;
        let mut rows = stmt.query([])?;

        let mut settings = Settings::default();

        while let Some(row) = rows.next()? {
            let key: String = row.get(0)?;
            let value: String = row.get(1)?;

            match key.as_str() {
                "backup_directory" => settings.backup_directory = value,
                "copy_threads" => {
                    settings.copy_threads = match value.parse::<usize>() {
                        Ok(0) | Err(_) => 0,
                        Ok(n) => clamp_copy_threads(n),
                    }
                }
                "max_snapshots_per_game" => {
                    settings.max_snapshots_per_game =
                        clamp_max_snapshots(value.parse().unwrap_or(0))
                }
                "check_free_space" => settings.check_free_space = value == "true",
                _ => {}
            }
        }

        Ok(settings)
    })?;
    Ok(settings)
}

pub fn save_settings<D: Db>(db: &D, settings: &Settings) -> Result<()> {
    db.with_conn(|conn| {
        let copy_threads = match settings.copy_threads {
            0 => 0,
            n => clamp_copy_threads(n),
        };
        let pairs = vec![
            ("backup_directory", settings.backup_directory.trim().to_string()),
            ("copy_threads", copy_threads.to_string()),
            (
                "max_snapshots_per_game",
                clamp_max_snapshots(settings.max_snapshots_per_game).to_string(),
            ),
            (
                "check_free_space",
                bool_str(settings.check_free_space).to_string(),
            ),
        ];

        for (key, value) in pairs {
            conn.execute(
                "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
                params![key, value],
            )?;
        }

        Ok(())
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::open_in_memory;
    use crate::db::SqliteDb;

    #[test]
    fn defaults_round_trip_through_table() {
        let db = SqliteDb::new(open_in_memory().expect("db"));
        let settings = load_settings(&db).expect("load");
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn values_are_clamped_on_save() {
        let db = SqliteDb::new(open_in_memory().expect("db"));
        let settings = Settings {
            backup_directory: "  /tmp/cp  ".to_string(),
            copy_threads: 500,
            max_snapshots_per_game: 5000,
            check_free_space: false,
        };
        save_settings(&db, &settings).expect("save");

        let loaded = load_settings(&db).expect("load");
        assert_eq!(loaded.backup_directory, "/tmp/cp");
        assert_eq!(loaded.copy_threads, 32);
        assert_eq!(loaded.max_snapshots_per_game, 1000);
        assert!(!loaded.check_free_space);
        assert_eq!(loaded.resolved_backup_directory(), PathBuf::from("/tmp/cp"));
    }

    #[test]
    fn automatic_thread_count_is_bounded() {
        let threads = Settings::default().resolved_copy_threads();
        assert!((1..=4).contains(&threads));
    }
}
