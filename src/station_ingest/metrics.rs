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

use crate::client::Reading;
use crate::store::UpsertSummary;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct DeviceLabels {
    device: String,
}

/// Instruments for the request queue.
///
/// Constructing via `Default` gives working but unregistered instruments, which
/// is what the queue uses when no registry is involved (tests, mostly).
#[derive(Debug, Clone)]
pub struct QueueMetrics {
    submitted: Counter,
    completed: Counter,
    failed: Counter,
    abandoned: Counter,
    depth: Gauge,
    wait_seconds: Histogram,
}

impl QueueMetrics {
    /// Create a new `QueueMetrics` and register each metric with the provided `Registry`.
    pub fn new(reg: &mut Registry) -> Self {
        let metrics = Self::default();
        reg.register(
            "station_queue_submitted",
            "Requests accepted by the queue",
            metrics.submitted.clone(),
        );
        reg.register(
            "station_queue_completed",
            "Requests that executed successfully",
            metrics.completed.clone(),
        );
        reg.register(
            "station_queue_failed",
            "Requests that failed or were cancelled",
            metrics.failed.clone(),
        );
        reg.register(
            "station_queue_abandoned",
            "Requests skipped because their caller stopped waiting",
            metrics.abandoned.clone(),
        );
        reg.register(
            "station_queue_depth",
            "Requests waiting to be executed",
            metrics.depth.clone(),
        );
        reg.register(
            "station_queue_wait_seconds",
            "Time between submission and execution",
            metrics.wait_seconds.clone(),
        );

        metrics
    }

    pub(crate) fn enqueued(&self) {
        self.depth.inc();
    }

    pub(crate) fn enqueue_failed(&self) {
        self.depth.dec();
    }

    pub(crate) fn accepted(&self) {
        self.submitted.inc();
    }

    pub(crate) fn dequeued(&self, waited: Duration) {
        self.depth.dec();
        self.wait_seconds.observe(waited.as_secs_f64());
    }

    pub(crate) fn completed(&self) {
        self.completed.inc();
    }

    pub(crate) fn failed(&self) {
        self.failed.inc();
    }

    pub(crate) fn abandoned(&self) {
        self.abandoned.inc();
    }

    pub fn submitted_total(&self) -> u64 {
        self.submitted.get()
    }

    pub fn completed_total(&self) -> u64 {
        self.completed.get()
    }

    pub fn failed_total(&self) -> u64 {
        self.failed.get()
    }

    pub fn abandoned_total(&self) -> u64 {
        self.abandoned.get()
    }

    pub fn depth(&self) -> u64 {
        self.depth.get().max(0) as u64
    }
}

impl Default for QueueMetrics {
    fn default() -> Self {
        Self {
            submitted: Counter::default(),
            completed: Counter::default(),
            failed: Counter::default(),
            abandoned: Counter::default(),
            depth: Gauge::default(),
            wait_seconds: Histogram::new(exponential_buckets(0.01, 2.0, 14)),
        }
    }
}

/// Holder for metrics that can be set from readings as they are stored.
///
/// Measurement gauges all carry a "device" label set to the device identifier and
/// are only updated when the reading has a value for them.
#[derive(Debug, Clone, Default)]
pub struct IngestMetrics {
    temperature: Family<DeviceLabels, Gauge<f64, AtomicU64>>,
    humidity: Family<DeviceLabels, Gauge<f64, AtomicU64>>,
    barometric_pressure: Family<DeviceLabels, Gauge<f64, AtomicU64>>,
    wind_speed: Family<DeviceLabels, Gauge<f64, AtomicU64>>,
    inserted: Counter,
    skipped: Counter,
}

impl IngestMetrics {
    /// Create a new `IngestMetrics` and register each metric with the provided `Registry`.
    pub fn new(reg: &mut Registry) -> Self {
        let metrics = Self::default();
        reg.register(
            "station_temperature_fahrenheit",
            "Most recent temperature in fahrenheit",
            metrics.temperature.clone(),
        );
        reg.register(
            "station_relative_humidity",
            "Most recent relative humidity (0-100)",
            metrics.humidity.clone(),
        );
        reg.register(
            "station_barometric_pressure_inches",
            "Most recent relative barometric pressure in inches of mercury",
            metrics.barometric_pressure.clone(),
        );
        reg.register(
            "station_wind_speed_mph",
            "Most recent wind speed in miles per hour",
            metrics.wind_speed.clone(),
        );
        reg.register(
            "station_readings_inserted",
            "Readings newly written to storage",
            metrics.inserted.clone(),
        );
        reg.register(
            "station_readings_skipped",
            "Readings already present in storage",
            metrics.skipped.clone(),
        );

        metrics
    }

    /// Set gauges from the provided reading if the relevant value exists.
    pub fn observe(&self, device: &str, reading: &Reading) {
        let labels = DeviceLabels {
            device: device.to_owned(),
        };

        Self::set_from_measurement(&labels, &self.temperature, reading.temp_f);
        Self::set_from_measurement(&labels, &self.humidity, reading.humidity);
        Self::set_from_measurement(&labels, &self.barometric_pressure, reading.barom_rel_in);
        Self::set_from_measurement(&labels, &self.wind_speed, reading.wind_speed_mph);
    }

    pub fn record_upsert(&self, summary: &UpsertSummary) {
        self.inserted.inc_by(summary.inserted);
        self.skipped.inc_by(summary.skipped);
    }

    fn set_from_measurement(
        labels: &DeviceLabels,
        gauge: &Family<DeviceLabels, Gauge<f64, AtomicU64>>,
        value: Option<f64>,
    ) {
        if let Some(v) = value {
            gauge.get_or_create(labels).set(v);
        }
    }
}

#[cfg(test)]
mod test {
    use super::{IngestMetrics, QueueMetrics};
    use crate::client::Reading;
    use crate::store::UpsertSummary;
    use chrono::Utc;
    use prometheus_client::encoding::text::encode;
    use prometheus_client::registry::Registry;
    use std::time::Duration;

    #[test]
    fn test_queue_depth_tracks_enqueue_and_dequeue() {
        let metrics = QueueMetrics::default();
        metrics.enqueued();
        metrics.enqueued();
        metrics.accepted();
        metrics.accepted();
        assert_eq!(2, metrics.depth());

        metrics.dequeued(Duration::from_millis(5));
        assert_eq!(1, metrics.depth());
        assert_eq!(2, metrics.submitted_total());
    }

    #[test]
    fn test_ingest_metrics_encoded() {
        let mut registry = Registry::default();
        let metrics = IngestMetrics::new(&mut registry);

        let mut reading = Reading::at(Utc::now());
        reading.temp_f = Some(42.5);
        metrics.observe("AA:BB", &reading);
        metrics.record_upsert(&UpsertSummary { inserted: 3, skipped: 1 });

        let mut buf = String::new();
        encode(&mut buf, &registry).unwrap();

        assert!(buf.contains("station_temperature_fahrenheit{device=\"AA:BB\"} 42.5"));
        assert!(buf.contains("station_readings_inserted_total 3"));
        // No humidity value was set so no series should exist for it
        assert!(!buf.contains("station_relative_humidity{"));
    }
}
