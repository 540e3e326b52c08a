//! Database schema and migrations.

use rusqlite::Connection;

use crate::error::{Error, Result};

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema.
pub fn initialize(conn: &Connection) -> Result<()> {
    let version = get_schema_version(conn)?;

    if version > SCHEMA_VERSION {
        return Err(Error::UnsupportedSchema {
            found: version,
            supported: SCHEMA_VERSION,
        });
    }
    if version == 0 {
        create_schema_v1(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    }

    Ok(())
}

fn get_schema_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='schema_version'",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version: i32 =
        conn.query_row("SELECT version FROM schema_version", [], |row| row.get(0))?;

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?)",
        [version],
    )?;
    Ok(())
}

/// Create the initial schema (version 1).
///
/// Timestamps are unix seconds, UTC.
fn create_schema_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            version INTEGER NOT NULL
        );

        -- Calibrated station readings, one row per sample
        CREATE TABLE IF NOT EXISTS readings (
            timestamp INTEGER PRIMARY KEY,
            temp_out REAL,
            hum_out INTEGER,
            wind_ave REAL,
            wind_gust REAL,
            wind_dir INTEGER,
            rain REAL,
            rel_pressure REAL,
            abs_pressure REAL,
            illuminance REAL,
            uv INTEGER
        );

        -- Per-destination throttle, catch-up watermark and identity
        CREATE TABLE IF NOT EXISTS upload_status (
            destination TEXT PRIMARY KEY,
            last_attempt_at INTEGER,
            watermark INTEGER,
            identity TEXT,
            updated_at INTEGER NOT NULL
        );
        "#,
    )?;

    Ok(())
}
