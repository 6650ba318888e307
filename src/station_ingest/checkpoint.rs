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

use crate::progress::JobStatus;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::error;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub enum CheckpointError {
    Io(io::Error),
    Corrupt(String),
}

impl fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "checkpoint i/o error: {}", e),
            Self::Corrupt(msg) => write!(f, "checkpoint corrupt: {}", msg),
        }
    }
}

impl error::Error for CheckpointError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CheckpointError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Durable record of how far a backfill over `start_date..=end_date` got.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub last_processed_date: Option<NaiveDate>,
    pub total_inserted: u64,
    pub status: JobStatus,
    #[serde(default)]
    pub failed_dates: Vec<NaiveDate>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Checkpoint {
    pub fn new(start_date: NaiveDate, end_date: NaiveDate) -> Self {
        Checkpoint {
            start_date,
            end_date,
            last_processed_date: None,
            total_inserted: 0,
            status: JobStatus::Running,
            failed_dates: Vec::new(),
            updated_at: None,
        }
    }

    /// True when this checkpoint covers exactly the given range.
    pub fn matches(&self, start: NaiveDate, end: NaiveDate) -> bool {
        self.start_date == start && self.end_date == end
    }

    /// First day that still needs processing, `None` when the whole range is done.
    pub fn resume_from(&self) -> Option<NaiveDate> {
        let next = match self.last_processed_date {
            Some(d) => d.succ_opt()?,
            None => self.start_date,
        };

        if next > self.end_date {
            None
        } else {
            Some(next)
        }
    }

    fn validate(&self) -> Result<(), CheckpointError> {
        if self.start_date > self.end_date {
            return Err(CheckpointError::Corrupt(format!(
                "start {} is after end {}",
                self.start_date, self.end_date
            )));
        }

        if let Some(last) = self.last_processed_date {
            if last < self.start_date || last > self.end_date {
                return Err(CheckpointError::Corrupt(format!(
                    "last processed {} outside of {}..={}",
                    last, self.start_date, self.end_date
                )));
            }
        }

        Ok(())
    }
}

/// Reads and writes a single checkpoint file.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        CheckpointStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the checkpoint. A missing file is `Ok(None)`, anything that can't be
    /// read back as a consistent checkpoint is `Corrupt`.
    pub fn load(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        let bytes = match fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CheckpointError::Corrupt(format!("{}: {}", self.path.display(), e))),
        };

        let checkpoint: Checkpoint = serde_json::from_slice(&bytes)
            .map_err(|e| CheckpointError::Corrupt(format!("{}: {}", self.path.display(), e)))?;
        checkpoint.validate()?;
        Ok(Some(checkpoint))
    }

    pub fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let mut checkpoint = checkpoint.clone();
        checkpoint.updated_at = Some(Utc::now());

        let bytes = serde_json::to_vec_pretty(&checkpoint)
            .map_err(|e| CheckpointError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        write_atomic(&self.path, &bytes)?;
        Ok(())
    }

    /// Remove the checkpoint. Removing one that doesn't exist is not an error.
    pub fn reset(&self) -> Result<(), CheckpointError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CheckpointError::Io(e)),
        }
    }
}

/// Replace `path` with `bytes` such that readers see either the old or the new
/// contents, never a partial write.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut tmp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let mut file = File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp, path)
}
