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

//! Resumable historical backfill.
//!
//! A backfill walks a range of days one at a time on a dedicated thread. Each day is
//! fetched with requests submitted through the [`ThreadBridge`], so backfill traffic
//! shares the global rate limit with everything else. Readings are buffered, flushed to the
//! [`ReadingStore`] and then recorded in the checkpoint so that a restarted job picks
//! up after the last day that was durably written.

use crate::bridge::ThreadBridge;
use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointStore};
use crate::client::{ClientError, Reading, Upstream};
use crate::devices::DeviceCache;
use crate::metrics::IngestMetrics;
use crate::progress::{JobStatus, ProgressSnapshot, ProgressState, ProgressUpdate};
use crate::queue::{CallResult, QueueError};
use crate::store::ReadingStore;
use chrono::{NaiveDate, NaiveTime};
use serde::Serialize;
use std::error;
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug)]
pub enum BackfillError {
    AlreadyRunning,
    InvalidRange(String),
    Checkpoint(CheckpointError),
    Spawn(io::Error),
}

impl fmt::Display for BackfillError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyRunning => write!(f, "a backfill is already running"),
            Self::InvalidRange(msg) => write!(f, "invalid date range: {}", msg),
            Self::Checkpoint(e) => write!(f, "{}", e),
            Self::Spawn(e) => write!(f, "unable to start backfill thread: {}", e),
        }
    }
}

impl error::Error for BackfillError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Checkpoint(e) => Some(e),
            Self::Spawn(e) => Some(e),
            _ => None,
        }
    }
}

/// Inclusive range of UTC days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, BackfillError> {
        if start > end {
            return Err(BackfillError::InvalidRange(format!(
                "start {} is after end {}",
                start, end
            )));
        }

        Ok(DateRange { start, end })
    }

    /// Parse a range from two `YYYY-MM-DD` dates.
    pub fn parse(start: &str, end: &str) -> Result<Self, BackfillError> {
        let parse = |s: &str| {
            NaiveDate::parse_from_str(s.trim(), DATE_FORMAT)
                .map_err(|e| BackfillError::InvalidRange(format!("{:?} is not a YYYY-MM-DD date: {}", s, e)))
        };

        Self::new(parse(start)?, parse(end)?)
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start.iter_days().take_while(move |d| *d <= end)
    }

    /// Number of days covered, always at least one.
    pub fn num_days(&self) -> u64 {
        (self.end - self.start).num_days() as u64 + 1
    }
}

#[derive(Debug, Clone)]
pub struct BackfillConfig {
    /// MAC address of the station to backfill.
    pub device: String,
    /// How long a single request may take, including time spent waiting in the queue.
    pub call_timeout: Duration,
    /// Pause after the upstream reports that we're being rate limited.
    pub rate_limit_cooldown: Duration,
    /// Cooldowns allowed for a single day before the day is recorded as failed.
    pub max_rate_limit_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Attempts made for a day that keeps failing with transient errors.
    pub max_attempts: u32,
    /// Days processed between checkpoint writes.
    pub checkpoint_every: u32,
    /// Readings buffered before they are written to storage.
    pub batch_size: usize,
    /// Readings requested per page. Days with more readings take several pages.
    pub page_limit: usize,
    /// Number of recent days used to estimate the time remaining.
    pub eta_window: usize,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        BackfillConfig {
            device: String::new(),
            call_timeout: Duration::from_secs(30),
            rate_limit_cooldown: Duration::from_secs(60),
            max_rate_limit_retries: 5,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(30),
            max_attempts: 3,
            checkpoint_every: 1,
            batch_size: 500,
            page_limit: 288,
            eta_window: ProgressState::DEFAULT_WINDOW,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedUnit {
    pub date: NaiveDate,
    pub error: String,
}

/// Summary of a finished job. Counts cover this run only, not earlier runs that
/// were resumed from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub status: JobStatus,
    pub range: DateRange,
    pub units_processed: u64,
    pub inserted: u64,
    pub skipped: u64,
    pub requests: u64,
    pub rate_limit_pauses: u64,
    pub failed: Vec<FailedUnit>,
    pub message: Option<String>,
}

impl BackfillReport {
    fn new(range: DateRange) -> Self {
        BackfillReport {
            status: JobStatus::Running,
            range,
            units_processed: 0,
            inserted: 0,
            skipped: 0,
            requests: 0,
            rate_limit_pauses: 0,
            failed: Vec::new(),
            message: None,
        }
    }
}

struct Shared {
    config: BackfillConfig,
    bridge: ThreadBridge,
    upstream: Arc<dyn Upstream>,
    store: Arc<dyn ReadingStore>,
    checkpoints: CheckpointStore,
    devices: Arc<DeviceCache>,
    progress: ProgressState,
    metrics: IngestMetrics,
    stop: AtomicBool,
    active: AtomicBool,
    last_report: Mutex<Option<BackfillReport>>,
}

impl Shared {
    fn last_report(&self) -> MutexGuard<'_, Option<BackfillReport>> {
        self.last_report.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Clears the active flag when the worker exits, even by panic.
struct ActiveGuard(Arc<Shared>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.store(false, Ordering::Release);
    }
}

/// Runs at most one backfill at a time and reports on it.
pub struct BackfillCoordinator {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<BackfillReport>>>,
}

impl BackfillCoordinator {
    pub fn new(
        config: BackfillConfig,
        bridge: ThreadBridge,
        upstream: Arc<dyn Upstream>,
        store: Arc<dyn ReadingStore>,
        checkpoints: CheckpointStore,
    ) -> Self {
        let progress = ProgressState::new(config.eta_window);
        BackfillCoordinator {
            shared: Arc::new(Shared {
                config,
                bridge,
                upstream,
                store,
                checkpoints,
                devices: Arc::new(DeviceCache::new()),
                progress,
                metrics: IngestMetrics::default(),
                stop: AtomicBool::new(false),
                active: AtomicBool::new(false),
                last_report: Mutex::new(None),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Share a device cache with other components instead of using a private one.
    pub fn with_devices(mut self, devices: Arc<DeviceCache>) -> Self {
        // The state isn't shared with a worker until start() so this always applies
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.devices = devices;
        }
        self
    }

    pub fn with_metrics(mut self, metrics: IngestMetrics) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.metrics = metrics;
        }
        self
    }

    /// Start a backfill over `range` on a new thread.
    ///
    /// Fails with `AlreadyRunning` if a job is active. Progress is available
    /// from [`BackfillCoordinator::progress`] as soon as this returns.
    pub fn start(&self, range: DateRange) -> Result<(), BackfillError> {
        if self
            .shared
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(BackfillError::AlreadyRunning);
        }

        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = worker.take() {
            // The previous job already cleared the active flag so it's about to exit
            let _ = previous.join();
        }

        self.shared.stop.store(false, Ordering::Release);
        self.shared.progress.begin(range.start, range.end, range.num_days(), 0);

        let shared = self.shared.clone();
        let spawned = thread::Builder::new().name("backfill".to_owned()).spawn(move || {
            let _guard = ActiveGuard(shared.clone());
            let report = Job::new(shared.clone(), range).run();
            *shared.last_report() = Some(report.clone());
            report
        });

        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.active.store(false, Ordering::Release);
                Err(BackfillError::Spawn(e))
            }
        }
    }

    /// Ask the running job to stop after the day it's working on. Returns false
    /// when there was no job to stop.
    pub fn stop(&self) -> bool {
        if !self.is_active() {
            return false;
        }

        tracing::info!(message = "backfill stop requested");
        self.shared.stop.store(true, Ordering::Release);
        true
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }

    pub fn progress(&self) -> ProgressSnapshot {
        self.shared.progress.snapshot()
    }

    pub fn last_report(&self) -> Option<BackfillReport> {
        self.shared.last_report().clone()
    }

    /// Block until the current job's thread exits and return its report, or the
    /// most recent report when nothing is running.
    pub fn wait(&self) -> Option<BackfillReport> {
        let handle = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        match handle {
            Some(h) => match h.join() {
                Ok(report) => Some(report),
                Err(_) => {
                    tracing::error!(message = "backfill thread panicked");
                    self.last_report()
                }
            },
            None => self.last_report(),
        }
    }

    /// Delete the checkpoint so the next job starts from the beginning of its range.
    pub fn reset_checkpoint(&self) -> Result<(), BackfillError> {
        if self
            .shared
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(BackfillError::AlreadyRunning);
        }

        let res = self.shared.checkpoints.reset();
        self.shared.active.store(false, Ordering::Release);

        res.map_err(BackfillError::Checkpoint)?;
        tracing::info!(message = "backfill checkpoint reset", path = %self.shared.checkpoints.path().display());
        Ok(())
    }
}

impl fmt::Debug for BackfillCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackfillCoordinator")
            .field("device", &self.shared.config.device)
            .field("active", &self.is_active())
            .finish()
    }
}

enum UnitError {
    /// Give up on this day and move on to the next one.
    Skip(QueueError),
    /// Nothing further can succeed, end the job.
    Abort(QueueError),
}

/// State of one backfill run, owned by the worker thread.
struct Job {
    shared: Arc<Shared>,
    range: DateRange,
    checkpoint: Checkpoint,
    // False until the checkpoint for this range has been loaded, so that a job failing
    // validation doesn't overwrite one it never read.
    owns_checkpoint: bool,
    pending: Vec<Reading>,
    since_checkpoint: u32,
    units_completed: u64,
    unreported_failures: Vec<NaiveDate>,
    report: BackfillReport,
}

impl Job {
    fn new(shared: Arc<Shared>, range: DateRange) -> Self {
        Job {
            shared,
            range,
            checkpoint: Checkpoint::new(range.start, range.end),
            owns_checkpoint: false,
            pending: Vec::new(),
            since_checkpoint: 0,
            units_completed: 0,
            unreported_failures: Vec::new(),
            report: BackfillReport::new(range),
        }
    }

    fn run(mut self) -> BackfillReport {
        tracing::info!(
            message = "backfill started",
            device = %self.shared.config.device,
            start = %self.range.start,
            end = %self.range.end,
        );

        let (status, message) = match self.execute() {
            Ok(status) => (status, None),
            Err(msg) => (JobStatus::Failed, Some(msg)),
        };

        self.finish(status, message)
    }

    fn execute(&mut self) -> Result<JobStatus, String> {
        self.validate()?;
        self.checkpoint = self.load_checkpoint();
        self.checkpoint.status = JobStatus::Running;
        self.owns_checkpoint = true;
        self.shared
            .checkpoints
            .save(&self.checkpoint)
            .map_err(|e| format!("unable to write checkpoint: {}", e))?;

        let first = match self.checkpoint.resume_from() {
            Some(d) => d,
            None => return Ok(JobStatus::Completed),
        };

        let already_done = (first - self.range.start).num_days() as u64;
        self.units_completed = already_done.saturating_sub(self.checkpoint.failed_dates.len() as u64);

        let progress = &self.shared.progress;
        progress.begin(self.range.start, self.range.end, self.range.num_days(), self.units_completed);
        progress.update(
            ProgressUpdate::new()
                .status(JobStatus::Running)
                .requests_made(self.report.requests)
                .inserted_records(self.checkpoint.total_inserted)
                .failed_dates(self.checkpoint.failed_dates.iter().copied()),
        );

        let range = self.range;
        for day in range.days().skip_while(|d| *d < first) {
            if self.shared.stop.load(Ordering::Acquire) {
                tracing::info!(message = "backfill stopping before next day", next = %day);
                return Ok(JobStatus::Cancelled);
            }

            let started = Instant::now();
            self.shared.progress.update(ProgressUpdate::new().current_date(day));

            match self.fetch_day(day) {
                Ok(readings) => {
                    tracing::debug!(message = "fetched day", day = %day, readings = readings.len());
                    self.pending.extend(readings);
                    self.units_completed += 1;
                }
                Err(UnitError::Skip(e)) => {
                    tracing::warn!(message = "giving up on day", day = %day, error = %e);
                    self.checkpoint.failed_dates.push(day);
                    self.unreported_failures.push(day);
                    self.report.failed.push(FailedUnit {
                        date: day,
                        error: e.to_string(),
                    });
                }
                Err(UnitError::Abort(e)) => {
                    return Err(format!("backfill aborted on {}: {}", day, e));
                }
            }

            self.checkpoint.last_processed_date = Some(day);
            self.report.units_processed += 1;
            self.since_checkpoint += 1;

            if self.since_checkpoint >= self.shared.config.checkpoint_every.max(1)
                || self.pending.len() >= self.shared.config.batch_size.max(1)
            {
                self.flush_and_checkpoint()?;
            }

            self.shared.progress.record_unit(started.elapsed());
        }

        Ok(JobStatus::Completed)
    }

    /// Make sure the configured device is visible with these credentials, fetching the
    /// device list unless it's already cached.
    fn validate(&mut self) -> Result<(), String> {
        let device = self.shared.config.device.clone();
        if self.shared.devices.contains(&device) {
            tracing::debug!(message = "device list cached, skipping validation", device = %device);
            return Ok(());
        }

        self.shared
            .progress
            .update(ProgressUpdate::new().message("validating credentials"));

        let devices = match self.call_with_retry("device list", |upstream| async move { upstream.devices().await }) {
            Ok(d) => d,
            Err(UnitError::Skip(e)) | Err(UnitError::Abort(e)) => {
                return Err(format!("unable to validate credentials: {}", e));
            }
        };

        self.shared.devices.refresh(devices);
        if !self.shared.devices.contains(&device) {
            return Err(format!("device {} is not available for these credentials", device));
        }

        self.shared.progress.update(ProgressUpdate::new().clear_message());
        Ok(())
    }

    fn load_checkpoint(&self) -> Checkpoint {
        let fresh = Checkpoint::new(self.range.start, self.range.end);
        match self.shared.checkpoints.load() {
            Ok(Some(cp)) if cp.matches(self.range.start, self.range.end) && cp.status != JobStatus::Completed => {
                tracing::info!(
                    message = "resuming backfill from checkpoint",
                    last_processed = ?cp.last_processed_date,
                    total_inserted = cp.total_inserted,
                );
                cp
            }
            Ok(Some(cp)) => {
                tracing::info!(
                    message = "ignoring checkpoint for a different or finished range",
                    start = %cp.start_date,
                    end = %cp.end_date,
                    status = %cp.status,
                );
                fresh
            }
            Ok(None) => fresh,
            Err(e) => {
                tracing::warn!(message = "unusable checkpoint, starting from the beginning", error = %e);
                fresh
            }
        }
    }

    /// Fetch every reading on `day`. Pages run newest first and are bounded by `endDate`
    /// only, so a full page whose oldest reading is still on `day` is followed by another
    /// page ending at that reading.
    fn fetch_day(&mut self, day: NaiveDate) -> Result<Vec<Reading>, UnitError> {
        let mut end = day
            .succ_opt()
            .unwrap_or(day)
            .and_time(NaiveTime::MIN)
            .and_utc();
        let limit = self.shared.config.page_limit.max(1);
        let mut out = Vec::new();

        loop {
            let device = self.shared.config.device.clone();
            let page = self.call_with_retry(&day.to_string(), move |upstream| {
                let device = device.clone();
                async move { upstream.readings(&device, end, limit).await }
            })?;

            let full = page.len() >= limit;
            let oldest = page.iter().filter_map(Reading::timestamp).min();
            out.extend(page.into_iter().filter(|r| r.date() == Some(day)));

            match oldest {
                Some(ts) if full && ts < end && ts.date_naive() == day => {
                    tracing::debug!(message = "page full, fetching older readings", day = %day, end = %ts);
                    end = ts;
                }
                _ => return Ok(out),
            }
        }
    }

    fn call_with_retry<T, F, Fut>(&mut self, label: &str, op: F) -> Result<T, UnitError>
    where
        F: Fn(Arc<dyn Upstream>) -> Fut,
        Fut: Future<Output = CallResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let shared = self.shared.clone();
        let config = &shared.config;
        let mut attempts = 0;
        let mut cooldowns = 0;
        let mut backoff = config.initial_backoff;

        loop {
            let fut = op(shared.upstream.clone());
            self.report.requests += 1;
            shared
                .progress
                .update(ProgressUpdate::new().requests_made(self.report.requests));

            let err = match shared.bridge.enqueue_blocking(move || fut, config.call_timeout) {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };

            if err.is_rate_limited() {
                cooldowns += 1;
                if cooldowns > config.max_rate_limit_retries {
                    return Err(UnitError::Skip(err));
                }

                self.report.rate_limit_pauses += 1;
                tracing::warn!(
                    message = "rate limited by upstream, cooling down",
                    unit = %label,
                    cooldown_secs = config.rate_limit_cooldown.as_secs_f64(),
                );
                shared.progress.update(ProgressUpdate::new().message(format!(
                    "rate limited while fetching {}, retrying in {}s",
                    label,
                    config.rate_limit_cooldown.as_secs()
                )));
                thread::sleep(config.rate_limit_cooldown);
            } else if err.is_fatal() || is_permanent(&err) {
                return Err(UnitError::Abort(err));
            } else if err.is_transient() {
                attempts += 1;
                if attempts >= config.max_attempts {
                    return Err(UnitError::Skip(err));
                }

                tracing::warn!(
                    message = "transient error, retrying",
                    unit = %label,
                    attempt = attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                );
                shared.progress.update(ProgressUpdate::new().message(format!(
                    "retrying {} after error: {}",
                    label, err
                )));
                thread::sleep(backoff);
                backoff = next_backoff(backoff, config.max_backoff);
            } else {
                return Err(UnitError::Skip(err));
            }
        }
    }

    /// Write buffered readings, then the checkpoint, then the in-memory progress.
    fn flush_and_checkpoint(&mut self) -> Result<(), String> {
        if !self.pending.is_empty() {
            let summary = self
                .shared
                .store
                .upsert_batch(&self.pending)
                .map_err(|e| format!("unable to store readings: {}", e))?;

            self.pending.clear();
            self.shared.metrics.record_upsert(&summary);
            self.report.inserted += summary.inserted;
            self.report.skipped += summary.skipped;
            self.checkpoint.total_inserted += summary.inserted;
        }

        self.shared
            .checkpoints
            .save(&self.checkpoint)
            .map_err(|e| format!("unable to write checkpoint: {}", e))?;
        self.since_checkpoint = 0;

        self.shared.progress.update(
            ProgressUpdate::new()
                .units_completed(self.units_completed)
                .inserted_records(self.checkpoint.total_inserted)
                .failed_dates(self.unreported_failures.drain(..)),
        );

        Ok(())
    }

    fn finish(mut self, mut status: JobStatus, mut message: Option<String>) -> BackfillReport {
        self.checkpoint.status = status;
        if self.owns_checkpoint {
            if let Err(e) = self.flush_and_checkpoint() {
                tracing::error!(message = "unable to save final backfill state", error = %e);
                status = JobStatus::Failed;
                message.get_or_insert(e);
            }
        }

        let summary = match (&message, status) {
            (Some(m), _) => m.clone(),
            (None, JobStatus::Cancelled) => format!("cancelled after {} days", self.report.units_processed),
            (None, _) => format!(
                "processed {} days, {} failed, {} readings inserted",
                self.report.units_processed,
                self.report.failed.len(),
                self.report.inserted
            ),
        };

        self.shared
            .progress
            .update(ProgressUpdate::new().status(status).message(summary.clone()));

        if status == JobStatus::Failed {
            tracing::error!(message = "backfill failed", reason = %summary);
        } else {
            tracing::info!(
                message = "backfill finished",
                status = %status,
                days = self.report.units_processed,
                failed = self.report.failed.len(),
                inserted = self.report.inserted,
                skipped = self.report.skipped,
                requests = self.report.requests,
            );
        }

        self.report.status = status;
        self.report.message = Some(summary);
        self.report
    }
}

fn is_permanent(err: &QueueError) -> bool {
    matches!(
        err,
        QueueError::Upstream(ClientError::Unauthorized(_)) | QueueError::Upstream(ClientError::InvalidDevice(_))
    )
}

fn next_backoff(current: Duration, max_backoff: Duration) -> Duration {
    if current.is_zero() {
        return max_backoff.min(Duration::from_millis(1));
    }

    current.saturating_mul(2).min(max_backoff)
}

#[cfg(test)]
mod test {
    use super::{next_backoff, BackfillError, DateRange};
    use chrono::NaiveDate;
    use std::time::Duration;

    fn day(m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, m, d).unwrap()
    }

    #[test]
    fn test_range_parse() {
        let range = DateRange::parse("2024-01-30", "2024-02-02").unwrap();
        assert_eq!(4, range.num_days());
        assert_eq!(
            vec![day(1, 30), day(1, 31), day(2, 1), day(2, 2)],
            range.days().collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_range_single_day() {
        let range = DateRange::new(day(3, 1), day(3, 1)).unwrap();
        assert_eq!(1, range.num_days());
    }

    #[test]
    fn test_range_rejects_reversed() {
        assert!(matches!(
            DateRange::new(day(1, 3), day(1, 1)),
            Err(BackfillError::InvalidRange(_))
        ));
    }

    #[test]
    fn test_range_rejects_malformed() {
        assert!(matches!(
            DateRange::parse("2024-13-01", "2024-01-01"),
            Err(BackfillError::InvalidRange(_))
        ));
        assert!(matches!(
            DateRange::parse("yesterday", "2024-01-01"),
            Err(BackfillError::InvalidRange(_))
        ));
    }

    #[test]
    fn test_next_backoff_doubles_up_to_max() {
        let max = Duration::from_secs(30);
        assert_eq!(Duration::from_secs(4), next_backoff(Duration::from_secs(2), max));
        assert_eq!(max, next_backoff(Duration::from_secs(20), max));
        assert_eq!(Duration::from_millis(1), next_backoff(Duration::ZERO, max));
    }
}
