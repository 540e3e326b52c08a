//! SQLite-backed store.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension, Row};
use time::OffsetDateTime;
use tracing::{debug, info};

use wxrelay_types::Reading;

use crate::error::{Error, Result};
use crate::models::UploadStatus;
use crate::schema;
use crate::traits::{ReadingStore, StatusStore, pick_nearest};

const READING_COLUMNS: &str = "timestamp, temp_out, hum_out, wind_ave, wind_gust, wind_dir, \
     rain, rel_pressure, abs_pressure, illuminance, uv";

/// SQLite store for station readings and upload status.
///
/// The connection sits behind a mutex so the store can be shared between
/// the aggregation engine and concurrently running upload services.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| Error::CreateDirectory {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        info!("Opening database at {}", path.display());
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;

        schema::initialize(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open the default database location.
    pub fn open_default() -> Result<Self> {
        Self::open(crate::default_db_path())
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| Error::LockPoisoned)
    }

    fn query_one(&self, sql: &str, params: impl rusqlite::Params) -> Result<Option<Reading>> {
        let conn = self.conn()?;
        let reading = conn
            .query_row(sql, params, row_to_reading)
            .optional()?;
        Ok(reading)
    }
}

// Reading operations
impl Store {
    /// Insert a reading. Returns `false` when a reading already exists at
    /// that timestamp; stored readings are never overwritten.
    pub fn insert_reading(&self, reading: &Reading) -> Result<bool> {
        let conn = self.conn()?;
        let inserted = insert_reading_with(&conn, reading)?;
        Ok(inserted == 1)
    }

    /// Insert many readings in one transaction, skipping duplicates.
    pub fn insert_readings(&self, readings: &[Reading]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut inserted = 0;
        for reading in readings {
            inserted += insert_reading_with(&tx, reading)?;
        }
        tx.commit()?;

        info!("Inserted {} new readings", inserted);
        Ok(inserted)
    }

    /// Count stored readings.
    pub fn count_readings(&self) -> Result<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM readings", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

fn insert_reading_with(conn: &Connection, reading: &Reading) -> Result<usize> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO readings (timestamp, temp_out, hum_out, wind_ave, wind_gust,
         wind_dir, rain, rel_pressure, abs_pressure, illuminance, uv)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        rusqlite::params![
            reading.timestamp.unix_timestamp(),
            reading.temp_out,
            reading.hum_out,
            reading.wind_ave,
            reading.wind_gust,
            reading.wind_dir,
            reading.rain,
            reading.rel_pressure,
            reading.abs_pressure,
            reading.illuminance,
            reading.uv,
        ],
    )?;
    Ok(inserted)
}

fn unix_to_datetime(index: usize, ts: i64) -> rusqlite::Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(ts).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Integer, Box::new(e))
    })
}

fn optional_unix(index: usize, ts: Option<i64>) -> rusqlite::Result<Option<OffsetDateTime>> {
    ts.map(|ts| unix_to_datetime(index, ts)).transpose()
}

fn row_to_reading(row: &Row<'_>) -> rusqlite::Result<Reading> {
    Ok(Reading {
        timestamp: unix_to_datetime(0, row.get(0)?)?,
        temp_out: row.get(1)?,
        hum_out: row.get(2)?,
        wind_ave: row.get(3)?,
        wind_gust: row.get(4)?,
        wind_dir: row.get(5)?,
        rain: row.get(6)?,
        rel_pressure: row.get(7)?,
        abs_pressure: row.get(8)?,
        illuminance: row.get(9)?,
        uv: row.get(10)?,
    })
}

impl ReadingStore for Store {
    fn nearest(&self, at: OffsetDateTime) -> Result<Option<Reading>> {
        let ts = at.unix_timestamp();
        let before = self.query_one(
            &format!(
                "SELECT {READING_COLUMNS} FROM readings WHERE timestamp <= ?1
                 ORDER BY timestamp DESC LIMIT 1"
            ),
            [ts],
        )?;
        let after = self.query_one(
            &format!(
                "SELECT {READING_COLUMNS} FROM readings WHERE timestamp > ?1
                 ORDER BY timestamp ASC LIMIT 1"
            ),
            [ts],
        )?;
        Ok(pick_nearest(at, before, after))
    }

    fn range(&self, start: OffsetDateTime, stop: OffsetDateTime) -> Result<Vec<Reading>> {
        if stop <= start {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {READING_COLUMNS} FROM readings
             WHERE timestamp >= ?1 AND timestamp < ?2 ORDER BY timestamp ASC"
        ))?;
        let readings = stmt
            .query_map(
                [start.unix_timestamp(), stop.unix_timestamp()],
                row_to_reading,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(readings)
    }

    fn first(&self) -> Result<Option<Reading>> {
        self.query_one(
            &format!("SELECT {READING_COLUMNS} FROM readings ORDER BY timestamp ASC LIMIT 1"),
            [],
        )
    }

    fn latest(&self) -> Result<Option<Reading>> {
        self.query_one(
            &format!("SELECT {READING_COLUMNS} FROM readings ORDER BY timestamp DESC LIMIT 1"),
            [],
        )
    }
}

impl StatusStore for Store {
    fn upload_status(&self, destination: &str) -> Result<UploadStatus> {
        let conn = self.conn()?;
        let status = conn
            .query_row(
                "SELECT destination, last_attempt_at, watermark, identity
                 FROM upload_status WHERE destination = ?",
                [destination],
                |row| {
                    Ok(UploadStatus {
                        destination: row.get(0)?,
                        last_attempt_at: optional_unix(1, row.get(1)?)?,
                        watermark: optional_unix(2, row.get(2)?)?,
                        identity: row.get(3)?,
                    })
                },
            )
            .optional()?;

        Ok(status.unwrap_or_else(|| UploadStatus::new(destination)))
    }

    fn record_attempt(&self, destination: &str, started_at: OffsetDateTime) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO upload_status (destination, last_attempt_at, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(destination) DO UPDATE SET
                last_attempt_at = ?2,
                updated_at = ?3",
            rusqlite::params![destination, started_at.unix_timestamp(), now_unix()],
        )?;
        debug!("Recorded attempt for {} at {}", destination, started_at);
        Ok(())
    }

    fn advance_watermark(&self, destination: &str, reading_at: OffsetDateTime) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO upload_status (destination, watermark, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(destination) DO UPDATE SET
                watermark = MAX(COALESCE(watermark, ?2), ?2),
                updated_at = ?3",
            rusqlite::params![destination, reading_at.unix_timestamp(), now_unix()],
        )?;
        debug!("Advanced watermark for {} to {}", destination, reading_at);
        Ok(())
    }

    fn set_identity(&self, destination: &str, identity: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO upload_status (destination, identity, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(destination) DO UPDATE SET
                identity = ?2,
                updated_at = ?3",
            rusqlite::params![destination, identity, now_unix()],
        )?;
        info!("Stored identity for {}", destination);
        Ok(())
    }
}

fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}
