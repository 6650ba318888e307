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

use crate::bridge::ThreadBridge;
use crate::client::Upstream;
use crate::metrics::IngestMetrics;
use crate::queue::QueueError;
use crate::store::{ReadingStore, StoreError, UpsertSummary};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::error;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub enum SchedulerError {
    Disabled,
    Busy,
    Spawn(io::Error),
    Fetch(QueueError),
    Store(StoreError),
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => write!(f, "scheduler is disabled"),
            Self::Busy => write!(f, "a fetch is already in flight"),
            Self::Spawn(e) => write!(f, "unable to start scheduler thread: {}", e),
            Self::Fetch(e) => write!(f, "fetch failed: {}", e),
            Self::Store(e) => write!(f, "{}", e),
        }
    }
}

impl error::Error for SchedulerError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Spawn(e) => Some(e),
            Self::Fetch(e) => Some(e),
            Self::Store(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub device: String,
    /// Readings requested per tick.
    pub latest_limit: usize,
    pub call_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            enabled: true,
            interval: Duration::from_secs(300),
            device: String::new(),
            latest_limit: 1,
            call_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchedulerStatus {
    pub enabled: bool,
    pub running: bool,
    pub in_flight: bool,
    pub interval_secs: u64,
    pub next_run_time: Option<DateTime<Utc>>,
    pub last_run_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub ticks: u64,
    pub skipped_ticks: u64,
}

#[derive(Debug, Default)]
struct Timer {
    generation: u64,
    running: bool,
    interval: Duration,
    next_run_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct History {
    last_run_time: Option<DateTime<Utc>>,
    last_error: Option<String>,
    ticks: u64,
    skipped_ticks: u64,
}

struct Shared {
    config: SchedulerConfig,
    bridge: ThreadBridge,
    upstream: Arc<dyn Upstream>,
    store: Arc<dyn ReadingStore>,
    metrics: IngestMetrics,
    timer: Mutex<Timer>,
    wake: Condvar,
    in_flight: AtomicBool,
    history: Mutex<History>,
}

impl Shared {
    fn timer(&self) -> MutexGuard<'_, Timer> {
        self.timer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn history(&self) -> MutexGuard<'_, History> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases the in-flight flag when a fetch ends.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Periodic "fetch latest" for the configured device.
///
/// Ticks are submitted through the same [`ThreadBridge`] as backfill requests so they
/// count against the same rate limit. A tick that fires while the previous one is
/// still in flight is skipped.
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        bridge: ThreadBridge,
        upstream: Arc<dyn Upstream>,
        store: Arc<dyn ReadingStore>,
        metrics: IngestMetrics,
    ) -> Self {
        Scheduler {
            shared: Arc::new(Shared {
                timer: Mutex::new(Timer {
                    interval: config.interval,
                    ..Timer::default()
                }),
                config,
                bridge,
                upstream,
                store,
                metrics,
                wake: Condvar::new(),
                in_flight: AtomicBool::new(false),
                history: Mutex::new(History::default()),
            }),
        }
    }

    /// Start firing every `interval`, the first tick right away. Starting a running
    /// scheduler restarts it with the new interval.
    pub fn start(&self, interval: Duration) -> Result<(), SchedulerError> {
        if !self.shared.config.enabled {
            return Err(SchedulerError::Disabled);
        }

        let generation = {
            let mut timer = self.shared.timer();
            timer.generation += 1;
            timer.running = true;
            timer.interval = interval;
            timer.next_run_time = Some(Utc::now());
            timer.generation
        };
        self.shared.wake.notify_all();

        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name("scheduler".to_owned())
            .spawn(move || timer_loop(shared, generation, interval));

        if let Err(e) = spawned {
            self.halt();
            return Err(SchedulerError::Spawn(e));
        }

        tracing::info!(message = "scheduler started", interval_secs = interval.as_secs_f64());
        Ok(())
    }

    /// Cancel the timer. A fetch that is already in flight runs to completion.
    pub fn stop(&self) {
        if self.halt() {
            tracing::info!(message = "scheduler stopped");
        }
    }

    fn halt(&self) -> bool {
        let was_running = {
            let mut timer = self.shared.timer();
            let was_running = timer.running;
            timer.generation += 1;
            timer.running = false;
            timer.next_run_time = None;
            was_running
        };

        self.shared.wake.notify_all();
        was_running
    }

    pub fn status(&self) -> SchedulerStatus {
        let (running, interval, next_run_time) = {
            let timer = self.shared.timer();
            (timer.running, timer.interval, timer.next_run_time)
        };
        let history = self.shared.history();

        SchedulerStatus {
            enabled: self.shared.config.enabled,
            running,
            in_flight: self.shared.in_flight.load(Ordering::Acquire),
            interval_secs: interval.as_secs(),
            next_run_time,
            last_run_time: history.last_run_time,
            last_error: history.last_error.clone(),
            ticks: history.ticks,
            skipped_ticks: history.skipped_ticks,
        }
    }

    /// Fetch the latest readings on the calling thread. Fails with `Busy` if a tick
    /// is in flight. Must not be called from an async task.
    pub fn run_once(&self) -> Result<UpsertSummary, SchedulerError> {
        let _guard = InFlight::acquire(&self.shared.in_flight).ok_or(SchedulerError::Busy)?;
        fetch_latest(&self.shared)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.halt();
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler").field("status", &self.status()).finish()
    }
}

fn timer_loop(shared: Arc<Shared>, generation: u64, interval: Duration) {
    loop {
        if shared.timer().generation != generation {
            return;
        }

        tick(&shared);

        let deadline = Instant::now() + interval;
        let mut timer = shared.timer();
        if timer.generation != generation {
            return;
        }

        timer.next_run_time = chrono::Duration::from_std(interval)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d));

        loop {
            if timer.generation != generation {
                return;
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }

            timer = match shared.wake.wait_timeout(timer, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

fn tick(shared: &Arc<Shared>) {
    if shared.in_flight.load(Ordering::Acquire) {
        shared.history().skipped_ticks += 1;
        tracing::warn!(message = "previous fetch still in flight, skipping tick");
        return;
    }

    let worker = shared.clone();
    let spawned = thread::Builder::new().name("scheduler-tick".to_owned()).spawn(move || {
        let _guard = match InFlight::acquire(&worker.in_flight) {
            Some(g) => g,
            None => {
                worker.history().skipped_ticks += 1;
                tracing::warn!(message = "previous fetch still in flight, skipping tick");
                return;
            }
        };

        if let Err(e) = fetch_latest(&worker) {
            tracing::warn!(message = "scheduled fetch failed", error = %e);
        }
    });

    if let Err(e) = spawned {
        tracing::error!(message = "unable to start scheduled fetch", error = %e);
    }
}

fn fetch_latest(shared: &Shared) -> Result<UpsertSummary, SchedulerError> {
    let device = shared.config.device.clone();
    let limit = shared.config.latest_limit;
    let upstream = shared.upstream.clone();
    let started = Utc::now();

    let res = shared
        .bridge
        .enqueue_blocking(
            move || async move { upstream.readings(&device, Utc::now(), limit).await },
            shared.config.call_timeout,
        )
        .map_err(SchedulerError::Fetch)
        .and_then(|readings| {
            let summary = shared.store.upsert_batch(&readings).map_err(SchedulerError::Store)?;
            if let Some(newest) = readings.iter().max_by_key(|r| r.date_utc) {
                shared.metrics.observe(&shared.config.device, newest);
            }
            Ok(summary)
        });

    let mut history = shared.history();
    history.ticks += 1;
    history.last_run_time = Some(started);

    match res {
        Ok(summary) => {
            history.last_error = None;
            shared.metrics.record_upsert(&summary);
            tracing::debug!(
                message = "fetched latest readings",
                device = %shared.config.device,
                inserted = summary.inserted,
                skipped = summary.skipped,
            );
            Ok(summary)
        }
        Err(e) => {
            history.last_error = Some(e.to_string());
            Err(e)
        }
    }
}
