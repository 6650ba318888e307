// station_ingest - Rate-limited ingestion and backfill for weather station APIs
//
// Copyright 2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use crate::checkpoint::write_atomic;
use crate::client::Reading;
use serde::Serialize;
use std::collections::BTreeMap;
use std::error;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
pub enum StoreError {
    Io(io::Error),
    Encoding(serde_json::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "storage i/o error: {}", e),
            Self::Encoding(e) => write!(f, "storage encoding error: {}", e),
        }
    }
}

impl error::Error for StoreError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Encoding(e) => Some(e),
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Encoding(e)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertSummary {
    pub inserted: u64,
    pub skipped: u64,
}

/// Where readings end up. Writes are keyed by reading timestamp and idempotent:
/// a reading whose timestamp is already stored is skipped, not overwritten.
pub trait ReadingStore: Send + Sync + 'static {
    fn upsert_batch(&self, readings: &[Reading]) -> Result<UpsertSummary, StoreError>;

    fn count(&self) -> Result<u64, StoreError>;

    fn latest(&self) -> Result<Option<Reading>, StoreError>;
}

fn insert_all(map: &mut BTreeMap<i64, Reading>, readings: &[Reading]) -> UpsertSummary {
    let mut summary = UpsertSummary::default();
    for reading in readings {
        if map.contains_key(&reading.date_utc) {
            summary.skipped += 1;
        } else {
            map.insert(reading.date_utc, reading.clone());
            summary.inserted += 1;
        }
    }

    summary
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    readings: Mutex<BTreeMap<i64, Reading>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<i64, Reading>> {
        self.readings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every stored reading, oldest first.
    pub fn readings(&self) -> Vec<Reading> {
        self.lock().values().cloned().collect()
    }
}

impl ReadingStore for MemoryStore {
    fn upsert_batch(&self, readings: &[Reading]) -> Result<UpsertSummary, StoreError> {
        Ok(insert_all(&mut self.lock(), readings))
    }

    fn count(&self) -> Result<u64, StoreError> {
        Ok(self.lock().len() as u64)
    }

    fn latest(&self) -> Result<Option<Reading>, StoreError> {
        Ok(self.lock().values().next_back().cloned())
    }
}

/// Readings kept in memory and mirrored to a JSON file.
///
/// The file holds an array of readings ordered by timestamp. It is rewritten in
/// full after any batch that inserted something.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    readings: Mutex<BTreeMap<i64, Reading>>,
}

impl FileStore {
    /// Open the store at `path`, loading existing readings if the file exists.
    pub fn open<P: Into<PathBuf>>(path: P) -> Result<Self, StoreError> {
        let path = path.into();
        let mut readings = BTreeMap::new();

        match fs::read(&path) {
            Ok(bytes) => {
                let existing: Vec<Reading> = serde_json::from_slice(&bytes)?;
                for r in existing {
                    readings.insert(r.date_utc, r);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::Io(e)),
        }

        tracing::debug!(message = "opened reading store", path = %path.display(), readings = readings.len());
        Ok(FileStore {
            path,
            readings: Mutex::new(readings),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<i64, Reading>> {
        self.readings.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ReadingStore for FileStore {
    fn upsert_batch(&self, readings: &[Reading]) -> Result<UpsertSummary, StoreError> {
        let mut map = self.lock();
        let fresh: Vec<i64> = readings
            .iter()
            .map(|r| r.date_utc)
            .filter(|ts| !map.contains_key(ts))
            .collect();
        let summary = insert_all(&mut map, readings);

        if summary.inserted > 0 {
            let res = {
                let all: Vec<&Reading> = map.values().collect();
                serde_json::to_vec(&all)
                    .map_err(StoreError::from)
                    .and_then(|bytes| write_atomic(&self.path, &bytes).map_err(StoreError::from))
            };

            if let Err(e) = res {
                // Keep memory consistent with disk so a retry inserts the same batch again
                for ts in fresh {
                    map.remove(&ts);
                }
                return Err(e);
            }
        }

        Ok(summary)
    }

    fn count(&self) -> Result<u64, StoreError> {
        Ok(self.lock().len() as u64)
    }

    fn latest(&self) -> Result<Option<Reading>, StoreError> {
        Ok(self.lock().values().next_back().cloned())
    }
}
