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

use std::error;
use std::fmt;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Returned by [`RateLimiter::acquire`] when shutdown was requested while waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireCancelled;

impl fmt::Display for AcquireCancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rate limiter wait cancelled")
    }
}

impl error::Error for AcquireCancelled {}

/// Fixed interval pacing for outbound calls.
///
/// There is no burst allowance: each permit is at least `min_interval` after the
/// previous one. Waiting happens on the tokio timer, never by spinning.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

    pub fn new(min_interval: Duration) -> Self {
        RateLimiter {
            min_interval,
            last: Mutex::new(None),
        }
    }

    /// Wait until at least `min_interval` has passed since the previous permit.
    ///
    /// The internal lock is held while sleeping so concurrent callers are granted
    /// permits one at a time, each a full interval apart.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), AcquireCancelled> {
        let mut last = self.last.lock().await;
        if cancel.is_cancelled() {
            return Err(AcquireCancelled);
        }

        if let Some(prev) = *last {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AcquireCancelled),
                _ = tokio::time::sleep_until(prev + self.min_interval) => {}
            }
        }

        *last = Some(Instant::now());
        Ok(())
    }

    /// Restart the interval from now.
    ///
    /// Called when a permitted call finishes so that the next permit is measured from
    /// the end of the previous call rather than its start.
    pub async fn touch(&self) {
        let mut last = self.last.lock().await;
        *last = Some(Instant::now());
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(Self::DEFAULT_INTERVAL)
    }
}
