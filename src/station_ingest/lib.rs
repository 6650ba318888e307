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

//! Rate-limited ingestion and resumable backfill for weather station APIs
//!
//! ## Features
//!
//! `station_ingest` collects readings from a personal weather station API that allows a single
//! request per second. Every outbound request, no matter where it comes from, goes through one
//! [`queue::RequestQueue`] which executes requests one at a time in the order they were submitted
//! and never faster than the configured interval.
//!
//! Three kinds of work share the queue:
//!
//! * A periodic [`scheduler::Scheduler`] that fetches the latest readings for a device.
//! * A [`backfill::BackfillCoordinator`] that fetches history one day at a time over a date range,
//!   checkpointing after each day so that an interrupted job resumes where it left off.
//! * Ad hoc requests from the HTTP API, such as refreshing the list of devices.
//!
//! The scheduler and backfill run on plain OS threads and submit work through a
//! [`bridge::ThreadBridge`] attached to the queue's running consumer.
//!
//! The following metrics are exposed at `/metrics` when running `station_ingest serve`.
//!
//! * `station_queue_submitted_total`, `station_queue_completed_total`, `station_queue_failed_total`,
//!   `station_queue_abandoned_total` - Request counts for the queue.
//! * `station_queue_depth` - Requests waiting to execute.
//! * `station_queue_wait_seconds` - Time between submitting a request and it executing.
//! * `station_temperature_fahrenheit{device=$DEVICE}` - Most recent temperature, in fahrenheit.
//! * `station_relative_humidity{device=$DEVICE}` - Most recent relative humidity (0-100).
//! * `station_barometric_pressure_inches{device=$DEVICE}` - Most recent relative pressure, in inches of mercury.
//! * `station_wind_speed_mph{device=$DEVICE}` - Most recent wind speed, in miles per hour.
//! * `station_readings_inserted_total`, `station_readings_skipped_total` - Readings written to storage
//!   and readings that were already there.
//!
//! ## Usage
//!
//! Credentials and the device may be given as flags or from the environment.
//!
//! ```text
//! export STATION_API_KEY=...
//! export STATION_APPLICATION_KEY=...
//! export STATION_DEVICE=00:0E:C6:20:0F:7B
//! ```
//!
//! ### Serve
//!
//! Run the HTTP API and the periodic fetch until SIGTERM or SIGINT.
//!
//! ```text
//! ./station_ingest --data-dir /var/lib/station_ingest serve --bind 0.0.0.0:9782
//! ```
//!
//! A backfill can then be started, watched, and stopped over HTTP.
//!
//! ```text
//! curl -sS -X POST localhost:9782/backfill/start -d '{"start_date":"2024-01-01","end_date":"2024-01-31"}' \
//!     -H 'content-type: application/json'
//! curl -sS localhost:9782/backfill/progress
//! curl -sS -X POST localhost:9782/backfill/stop
//! ```
//!
//! ### Backfill
//!
//! Run a single backfill in the foreground. Interrupting it with Ctrl-C stops after the current
//! day and running the same command again resumes from the checkpoint.
//!
//! ```text
//! ./station_ingest --data-dir /var/lib/station_ingest backfill --start 2024-01-01 --end 2024-01-31
//! ```
//!

pub mod backfill;
pub mod bridge;
pub mod checkpoint;
pub mod client;
pub mod devices;
pub mod http;
pub mod limiter;
pub mod metrics;
pub mod progress;
pub mod queue;
pub mod scheduler;
pub mod store;
