use rusqlite::{params, Connection, Result};
use std::path::{Path, PathBuf};

pub fn get_db_path() -> PathBuf {
    let app_data = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    let db_dir = app_data.join("checkpoint");
    std::fs::create_dir_all(&db_dir).ok();
    db_dir.join("checkpoint.db")
}

pub fn open_database(path: &Path) -> Result<Connection> {
    log::info!("Initializing database at: {:?}", path);
    let conn = Connection::open(path)?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    // Games table
    conn.execute(
        "CREATE TABLE IF NOT EXISTS games (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            save_location TEXT NOT NULL,
            exe_name TEXT,
            cover_image TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    // Settings table
    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    let default_settings = vec![
        ("backup_directory", ""),
        ("copy_threads", "0"),
        ("max_snapshots_per_game", "0"),
        ("check_free_space", "true"),
    ];

    for (key, value) in default_settings {
        conn.execute(
            "INSERT OR IGNORE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
    }

    Ok(())
}
