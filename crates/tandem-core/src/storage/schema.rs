//! SQLite schema for the change log and snapshots
//!
//! Changes are stored as JSON, one row per accepted version. Snapshots hold
//! a serialized document at a given version.

use rusqlite::{Connection, Result};

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Schema version tracking
        CREATE TABLE IF NOT EXISTS schema_info (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        -- Accepted changes; version N is the N-th change of the document
        CREATE TABLE IF NOT EXISTS changes (
            doc_id TEXT NOT NULL,
            version INTEGER NOT NULL,
            change_id TEXT NOT NULL,
            change_json TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (doc_id, version)
        );

        -- Document state at a version
        CREATE TABLE IF NOT EXISTS snapshots (
            doc_id TEXT NOT NULL,
            version INTEGER NOT NULL,
            data BLOB NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (doc_id, version)
        );

        -- Duplicate resend detection looks changes up by id
        CREATE INDEX IF NOT EXISTS idx_changes_change_id ON changes(doc_id, change_id);
        "#,
    )?;

    // Set schema version
    conn.execute(
        "INSERT OR REPLACE INTO schema_info (key, value) VALUES ('version', ?)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<Option<i32>> {
    let mut stmt = conn.prepare("SELECT value FROM schema_info WHERE key = 'version'")?;
    let result: Result<String> = stmt.query_row([], |row| row.get(0));

    match result {
        Ok(version_str) => Ok(version_str.parse().ok()),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Check if schema needs initialization or migration
pub fn needs_init(conn: &Connection) -> bool {
    let table_exists: bool = conn
        .prepare("SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_info'")
        .and_then(|mut stmt| stmt.exists([]))
        .unwrap_or(false);

    if !table_exists {
        return true;
    }

    match get_schema_version(conn) {
        Ok(Some(v)) => v < SCHEMA_VERSION,
        _ => true,
    }
}
