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

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveTime, Utc};
use reqwest::{StatusCode, Url};
use station_ingest::client::{ClientError, Device, DeviceInfo, Reading, Upstream};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub const DEVICE: &str = "00:0E:C6:20:0F:7B";

#[derive(Debug, Clone, Copy)]
pub enum Failure {
    RateLimited,
    ServerError,
    Unauthorized,
}

impl Failure {
    fn to_error(self) -> ClientError {
        match self {
            Self::RateLimited => ClientError::RateLimited,
            Self::ServerError => ClientError::Unexpected(
                StatusCode::INTERNAL_SERVER_ERROR,
                Url::parse("http://fake.invalid/devices").unwrap(),
            ),
            Self::Unauthorized => ClientError::Unauthorized(StatusCode::UNAUTHORIZED),
        }
    }
}

/// Upstream returning `per_day` readings for every day it's asked about, plus one
/// reading from the end of the previous day. Pages hold readings strictly older than
/// `end`, newest first, at most `limit` of them.
pub struct FakeUpstream {
    devices: Vec<Device>,
    per_day: u32,
    delay: Duration,
    by_call: Mutex<HashMap<u64, Failure>>,
    failing_days: Mutex<HashSet<NaiveDate>>,
    requested: Mutex<Vec<NaiveDate>>,
    reading_calls: AtomicU64,
    device_calls: AtomicU64,
    in_flight: AtomicU64,
    max_in_flight: AtomicU64,
}

impl FakeUpstream {
    pub fn new(per_day: u32) -> Self {
        FakeUpstream {
            devices: vec![Device {
                mac_address: DEVICE.to_owned(),
                info: DeviceInfo {
                    name: Some("Backyard".to_owned()),
                    location: None,
                },
            }],
            per_day,
            delay: Duration::ZERO,
            by_call: Mutex::new(HashMap::new()),
            failing_days: Mutex::new(HashSet::new()),
            requested: Mutex::new(Vec::new()),
            reading_calls: AtomicU64::new(0),
            device_calls: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            max_in_flight: AtomicU64::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn without_devices(mut self) -> Self {
        self.devices.clear();
        self
    }

    /// Fail the `n`th readings call (starting at 1).
    pub fn fail_call(self, n: u64, failure: Failure) -> Self {
        self.by_call.lock().unwrap().insert(n, failure);
        self
    }

    /// Fail every readings call for `day` with a server error.
    pub fn fail_day(self, day: NaiveDate) -> Self {
        self.failing_days.lock().unwrap().insert(day);
        self
    }

    pub fn requested(&self) -> Vec<NaiveDate> {
        self.requested.lock().unwrap().clone()
    }

    pub fn reading_calls(&self) -> u64 {
        self.reading_calls.load(Ordering::SeqCst)
    }

    pub fn device_calls(&self) -> u64 {
        self.device_calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> u64 {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn readings_for(&self, day: NaiveDate) -> Vec<Reading> {
        let start = day.and_time(NaiveTime::MIN).and_utc();
        let mut out: Vec<Reading> = (0..self.per_day)
            .map(|i| {
                let offset = ChronoDuration::minutes((i as i64 + 1) * 24 * 60 / (self.per_day as i64 + 1));
                let mut r = Reading::at(start + offset);
                r.temp_f = Some(40.0 + i as f64);
                r.humidity = Some(55.0);
                r
            })
            .collect();

        // Newest first, then a reading that belongs to the previous day
        out.reverse();
        out.push(Reading::at(start - ChronoDuration::minutes(5)));
        out
    }
}

#[async_trait]
impl Upstream for FakeUpstream {
    async fn devices(&self) -> Result<Vec<Device>, ClientError> {
        self.device_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.devices.clone())
    }

    async fn readings(&self, _device: &str, end: DateTime<Utc>, limit: usize) -> Result<Vec<Reading>, ClientError> {
        let call = self.reading_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let day = (end - ChronoDuration::milliseconds(1)).date_naive();
        self.requested.lock().unwrap().push(day);

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let scripted = self.by_call.lock().unwrap().get(&call).copied();
        if let Some(failure) = scripted {
            return Err(failure.to_error());
        }

        if self.failing_days.lock().unwrap().contains(&day) {
            return Err(Failure::ServerError.to_error());
        }

        let end_millis = end.timestamp_millis();
        Ok(self
            .readings_for(day)
            .into_iter()
            .filter(|r| r.date_utc < end_millis)
            .take(limit)
            .collect())
    }
}

pub fn day(month: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, month, d).unwrap()
}
