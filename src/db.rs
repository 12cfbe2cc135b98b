//! Durable local storage for cache slots.
//!
//! Uses rusqlite with WAL mode. Each logical cache (orders, payments,
//! inventory, ...) is persisted as one compressed blob row in `cache_slots`;
//! `local_settings` holds small durable values such as the per-day order
//! number counter. Provides schema migrations and the shared connection
//! state used by the store's flush and backup tasks.

use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

/// Shared handle to one slot database file.
pub struct SlotDb {
    pub conn: Mutex<Connection>,
    pub path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Open (or create) the slot database at `{dir}/{file_name}`.
///
/// Creates the directory if needed, opens the connection, sets pragmas, and
/// runs any pending migrations. On corruption or open failure, deletes the
/// file and retries once.
pub fn open(dir: &Path, file_name: &str) -> Result<SlotDb, String> {
    fs::create_dir_all(dir).map_err(|e| format!("Failed to create data dir: {e}"))?;

    let path = dir.join(file_name);
    info!("Opening cache database at {}", path.display());

    let conn = match open_and_configure(&path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!("Cache database open failed ({first_err}), deleting and retrying once");
            if path.exists() {
                let _ = fs::remove_file(&path);
                let _ = fs::remove_file(path.with_extension("db-wal"));
                let _ = fs::remove_file(path.with_extension("db-shm"));
            }
            open_and_configure(&path)
                .map_err(|e| format!("Cache database open failed after retry: {e}"))?
        }
    };

    run_migrations(&conn)?;

    Ok(SlotDb {
        conn: Mutex::new(conn),
        path,
    })
}

/// Open an in-memory slot database with all migrations applied. Used by
/// tests and callers that want a throwaway cache.
pub fn open_in_memory() -> Result<SlotDb, String> {
    let conn = Connection::open_in_memory().map_err(|e| format!("sqlite open: {e}"))?;
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| format!("pragma setup: {e}"))?;
    run_migrations(&conn)?;
    Ok(SlotDb {
        conn: Mutex::new(conn),
        path: PathBuf::from(":memory:"),
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, String> {
    let conn = Connection::open(path).map_err(|e| format!("sqlite open: {e}"))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| format!("pragma setup: {e}"))?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("create schema_version: {e}"))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    info!("Migrating cache database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Migration v1: the cache slot table. One compressed blob per logical cache.
fn migrate_v1(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS cache_slots (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            slot_key TEXT UNIQUE NOT NULL,
            data BLOB NOT NULL,
            updated_at TEXT DEFAULT (datetime('now'))
        );

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| format!("migration v1: {e}"))
}

/// Migration v2: local settings (category/key/value store) for durable
/// counters and small flags.
fn migrate_v2(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| format!("migration v2: {e}"))
}

impl SlotDb {
    /// Read one slot blob. `None` when the slot has never been written.
    pub fn read_slot(&self, slot_key: &str) -> Result<Option<Vec<u8>>, String> {
        let conn = self.conn.lock().map_err(|e| e.to_string())?;
        conn.query_row(
            "SELECT data FROM cache_slots WHERE slot_key = ?1",
            params![slot_key],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| format!("read slot {slot_key}: {e}"))
    }

    /// Upsert one slot blob.
    pub fn write_slot(&self, slot_key: &str, data: &[u8]) -> Result<(), String> {
        let conn = self.conn.lock().map_err(|e| e.to_string())?;
        conn.execute(
            "INSERT INTO cache_slots (slot_key, data, updated_at)
             VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(slot_key) DO UPDATE SET
                data = excluded.data,
                updated_at = excluded.updated_at",
            params![slot_key, data],
        )
        .map_err(|e| format!("write slot {slot_key}: {e}"))?;
        Ok(())
    }

    /// Read a local setting value.
    pub fn setting_get(&self, category: &str, key: &str) -> Option<String> {
        let conn = self.conn.lock().ok()?;
        conn.query_row(
            "SELECT setting_value FROM local_settings
             WHERE setting_category = ?1 AND setting_key = ?2",
            params![category, key],
            |row| row.get(0),
        )
        .ok()
    }

    /// Upsert a local setting value.
    pub fn setting_set(&self, category: &str, key: &str, value: &str) -> Result<(), String> {
        let conn = self.conn.lock().map_err(|e| e.to_string())?;
        conn.execute(
            "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
             VALUES (?1, ?2, ?3, datetime('now'))
             ON CONFLICT(setting_category, setting_key) DO UPDATE SET
                setting_value = excluded.setting_value,
                updated_at = excluded.updated_at",
            params![category, key, value],
        )
        .map_err(|e| format!("set local setting {category}/{key}: {e}"))?;
        Ok(())
    }
}
