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

use chrono::NaiveDate;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Idle,
    Validating,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Validating => "validating",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };

        write!(f, "{}", s)
    }
}

/// Immutable copy of a job's progress as of the moment it was taken.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub status: JobStatus,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub current_date: Option<NaiveDate>,
    pub units_total: u64,
    pub units_completed: u64,
    pub units_failed: u64,
    pub requests_made: u64,
    pub inserted_records: u64,
    pub message: Option<String>,
    #[serde(serialize_with = "as_seconds")]
    pub estimated_time_remaining: Option<Duration>,
    pub failed_dates: Vec<NaiveDate>,
}

impl ProgressSnapshot {
    pub fn units_remaining(&self) -> u64 {
        self.units_total
            .saturating_sub(self.units_completed)
            .saturating_sub(self.units_failed)
    }
}

fn as_seconds<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(d) => serializer.serialize_some(&d.as_secs_f64()),
        None => serializer.serialize_none(),
    }
}

/// A partial update. Fields left unset keep their current value.
#[derive(Debug, Clone, Default)]
pub struct ProgressUpdate {
    status: Option<JobStatus>,
    current_date: Option<NaiveDate>,
    requests_made: Option<u64>,
    inserted_records: Option<u64>,
    units_completed: Option<u64>,
    message: Option<Option<String>>,
    failed_dates: Vec<NaiveDate>,
}

impl ProgressUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn current_date(mut self, date: NaiveDate) -> Self {
        self.current_date = Some(date);
        self
    }

    pub fn requests_made(mut self, requests: u64) -> Self {
        self.requests_made = Some(requests);
        self
    }

    pub fn inserted_records(mut self, inserted: u64) -> Self {
        self.inserted_records = Some(inserted);
        self
    }

    pub fn units_completed(mut self, units: u64) -> Self {
        self.units_completed = Some(units);
        self
    }

    pub fn message<S: Into<String>>(mut self, message: S) -> Self {
        self.message = Some(Some(message.into()));
        self
    }

    pub fn clear_message(mut self) -> Self {
        self.message = Some(None);
        self
    }

    /// Add a day to the list of failed units.
    pub fn failed_date(mut self, date: NaiveDate) -> Self {
        self.failed_dates.push(date);
        self
    }

    pub fn failed_dates<I: IntoIterator<Item = NaiveDate>>(mut self, dates: I) -> Self {
        self.failed_dates.extend(dates);
        self
    }
}

#[derive(Debug)]
struct Inner {
    snapshot: ProgressSnapshot,
    durations: VecDeque<Duration>,
}

/// Progress of the current (or most recent) backfill.
///
/// A single mutex guards everything. Writers apply a whole [`ProgressUpdate`] under
/// it and readers clone the snapshot under it, so a reader never sees half an update.
#[derive(Debug)]
pub struct ProgressState {
    window: usize,
    inner: Mutex<Inner>,
}

impl ProgressState {
    pub const DEFAULT_WINDOW: usize = 10;

    /// `window` is the number of recent unit durations used for the time estimate.
    pub fn new(window: usize) -> Self {
        ProgressState {
            window: window.max(1),
            inner: Mutex::new(Inner {
                snapshot: ProgressSnapshot::default(),
                durations: VecDeque::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.lock().snapshot.clone()
    }

    /// Reset for a new job over `start..=end` with `units_total` units, of which
    /// `units_completed` were already done by an earlier run.
    pub fn begin(&self, start: NaiveDate, end: NaiveDate, units_total: u64, units_completed: u64) {
        let mut inner = self.lock();
        inner.durations.clear();
        inner.snapshot = ProgressSnapshot {
            status: JobStatus::Validating,
            start_date: Some(start),
            end_date: Some(end),
            units_total,
            units_completed,
            ..ProgressSnapshot::default()
        };
    }

    pub fn update(&self, update: ProgressUpdate) {
        let mut inner = self.lock();
        let snapshot = &mut inner.snapshot;

        if let Some(status) = update.status {
            snapshot.status = status;
            if status.is_terminal() {
                snapshot.estimated_time_remaining = None;
            }
        }
        if let Some(date) = update.current_date {
            snapshot.current_date = Some(date);
        }
        if let Some(requests) = update.requests_made {
            snapshot.requests_made = requests;
        }
        if let Some(inserted) = update.inserted_records {
            snapshot.inserted_records = inserted;
        }
        if let Some(units) = update.units_completed {
            snapshot.units_completed = units;
        }
        if let Some(message) = update.message {
            snapshot.message = message;
        }
        for date in update.failed_dates {
            if !snapshot.failed_dates.contains(&date) {
                snapshot.failed_dates.push(date);
                snapshot.units_failed += 1;
            }
        }
    }

    /// Record how long a unit took and recompute the time remaining from the last
    /// `window` durations.
    pub fn record_unit(&self, elapsed: Duration) {
        let mut inner = self.lock();
        inner.durations.push_back(elapsed);
        while inner.durations.len() > self.window {
            inner.durations.pop_front();
        }

        let total: Duration = inner.durations.iter().sum();
        let average = total / inner.durations.len() as u32;
        let remaining = inner.snapshot.units_remaining();
        inner.snapshot.estimated_time_remaining = Some(average.saturating_mul(remaining.min(u32::MAX as u64) as u32));
    }
}

impl Default for ProgressState {
    fn default() -> Self {
        Self::new(Self::DEFAULT_WINDOW)
    }
}
