//! In-memory store implementations.
//!
//! Used by tests and by callers that feed readings from elsewhere. The
//! reading map sits behind an `RwLock`, so appends are atomic with respect
//! to readers.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{Mutex, RwLock};

use time::OffsetDateTime;

use wxrelay_types::Reading;

use crate::error::{Error, Result};
use crate::models::UploadStatus;
use crate::traits::{ReadingStore, StatusStore, pick_nearest};

/// Reading store backed by an ordered map keyed on timestamp.
#[derive(Debug, Default)]
pub struct MemoryStore {
    readings: RwLock<BTreeMap<OffsetDateTime, Reading>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding `readings`.
    pub fn from_readings(readings: impl IntoIterator<Item = Reading>) -> Self {
        let store = Self::new();
        for reading in readings {
            // A fresh, private lock cannot be poisoned.
            let _ = store.insert(reading);
        }
        store
    }

    /// Append a reading. A reading already stored at the same timestamp is
    /// kept, since stored readings are immutable.
    pub fn insert(&self, reading: Reading) -> Result<bool> {
        let mut readings = self.readings.write().map_err(|_| Error::LockPoisoned)?;
        if readings.contains_key(&reading.timestamp) {
            return Ok(false);
        }
        readings.insert(reading.timestamp, reading);
        Ok(true)
    }

    /// Number of stored readings.
    pub fn len(&self) -> usize {
        self.readings.read().map(|r| r.len()).unwrap_or(0)
    }

    /// Whether the store holds no readings.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ReadingStore for MemoryStore {
    fn nearest(&self, at: OffsetDateTime) -> Result<Option<Reading>> {
        let readings = self.readings.read().map_err(|_| Error::LockPoisoned)?;
        let before = readings.range(..=at).next_back().map(|(_, r)| r.clone());
        let after = readings
            .range((Bound::Excluded(at), Bound::Unbounded))
            .next()
            .map(|(_, r)| r.clone());
        Ok(pick_nearest(at, before, after))
    }

    fn range(&self, start: OffsetDateTime, stop: OffsetDateTime) -> Result<Vec<Reading>> {
        if stop <= start {
            return Ok(Vec::new());
        }
        let readings = self.readings.read().map_err(|_| Error::LockPoisoned)?;
        Ok(readings.range(start..stop).map(|(_, r)| r.clone()).collect())
    }

    fn first(&self) -> Result<Option<Reading>> {
        let readings = self.readings.read().map_err(|_| Error::LockPoisoned)?;
        Ok(readings.values().next().cloned())
    }

    fn latest(&self) -> Result<Option<Reading>> {
        let readings = self.readings.read().map_err(|_| Error::LockPoisoned)?;
        Ok(readings.values().next_back().cloned())
    }
}

/// Upload status kept in a map. Does not survive a restart.
#[derive(Debug, Default)]
pub struct MemoryStatusStore {
    statuses: Mutex<HashMap<String, UploadStatus>>,
}

impl MemoryStatusStore {
    /// Create an empty status store.
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, destination: &str, apply: impl FnOnce(&mut UploadStatus)) -> Result<()> {
        let mut statuses = self.statuses.lock().map_err(|_| Error::LockPoisoned)?;
        let status = statuses
            .entry(destination.to_string())
            .or_insert_with(|| UploadStatus::new(destination));
        apply(status);
        Ok(())
    }
}

impl StatusStore for MemoryStatusStore {
    fn upload_status(&self, destination: &str) -> Result<UploadStatus> {
        let statuses = self.statuses.lock().map_err(|_| Error::LockPoisoned)?;
        Ok(statuses
            .get(destination)
            .cloned()
            .unwrap_or_else(|| UploadStatus::new(destination)))
    }

    fn record_attempt(&self, destination: &str, started_at: OffsetDateTime) -> Result<()> {
        self.update(destination, |s| s.last_attempt_at = Some(started_at))
    }

    fn advance_watermark(&self, destination: &str, reading_at: OffsetDateTime) -> Result<()> {
        self.update(destination, |s| {
            if s.watermark.is_none_or(|w| w < reading_at) {
                s.watermark = Some(reading_at);
            }
        })
    }

    fn set_identity(&self, destination: &str, identity: &str) -> Result<()> {
        self.update(destination, |s| s.identity = Some(identity.to_string()))
    }
}
