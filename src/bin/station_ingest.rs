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

use clap::{Parser, Subcommand};
use prometheus_client::registry::Registry;
use reqwest::Client;
use station_ingest::backfill::{BackfillConfig, BackfillCoordinator, BackfillReport, DateRange};
use station_ingest::bridge::ThreadBridge;
use station_ingest::checkpoint::CheckpointStore;
use station_ingest::client::{Credentials, StationClient, Upstream};
use station_ingest::devices::DeviceCache;
use station_ingest::http::{router, AppState};
use station_ingest::metrics::{IngestMetrics, QueueMetrics};
use station_ingest::progress::JobStatus;
use station_ingest::queue::{QueueConfig, RequestQueue};
use station_ingest::scheduler::{Scheduler, SchedulerConfig};
use station_ingest::store::{FileStore, ReadingStore};
use std::error::Error;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{self, SignalKind};
use tracing::Level;

const DEFAULT_LOG_LEVEL: Level = Level::INFO;
const DEFAULT_BIND_ADDR: ([u8; 4], u16) = ([0, 0, 0, 0], 9782);
const DEFAULT_REFRESH_SECS: u64 = 300;
const DEFAULT_TIMEOUT_MILLIS: u64 = 10000;
const DEFAULT_MIN_INTERVAL_MILLIS: u64 = 1000;
const DEFAULT_COOLDOWN_SECS: u64 = 60;
const DEFAULT_DRAIN_SECS: u64 = 10;
const DEFAULT_PROGRESS_SECS: u64 = 15;
const DEFAULT_API_URL: &str = "https://rt.ambientweather.net/v1/";

#[derive(Debug, Parser)]
#[clap(name = "station_ingest", version = clap::crate_version!())]
struct StationIngestApplication {
    /// API key for the weather station API
    #[clap(long, env = "STATION_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Application key for the weather station API
    #[clap(long, env = "STATION_APPLICATION_KEY", hide_env_values = true)]
    application_key: Option<String>,

    /// MAC address of the station to fetch readings for
    #[clap(long, env = "STATION_DEVICE")]
    device: Option<String>,

    /// Base URL for the weather station API
    #[clap(long, default_value_t = DEFAULT_API_URL.into())]
    api_url: String,

    /// Logging verbosity. Allowed values are 'trace', 'debug', 'info', 'warn', and 'error'
    /// (case insensitive)
    #[clap(long, default_value_t = DEFAULT_LOG_LEVEL)]
    log_level: Level,

    /// Minimum time between requests to the API, in milliseconds.
    #[clap(long, default_value_t = DEFAULT_MIN_INTERVAL_MILLIS)]
    min_interval_millis: u64,

    /// Timeout for a single request to the API, in milliseconds.
    #[clap(long, default_value_t = DEFAULT_TIMEOUT_MILLIS)]
    timeout_millis: u64,

    /// Pause after the API responds that we are being rate limited, in seconds.
    #[clap(long, default_value_t = DEFAULT_COOLDOWN_SECS)]
    rate_limit_cooldown_secs: u64,

    /// Directory for the backfill checkpoint and stored readings.
    #[clap(long, default_value = ".")]
    data_dir: PathBuf,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP API and periodically fetch the latest readings
    Serve {
        /// Address to bind to. By default, station_ingest will bind to public address since
        /// the purpose is to expose the API and metrics to external systems.
        #[clap(long, default_value_t = DEFAULT_BIND_ADDR.into())]
        bind: SocketAddr,

        /// Fetch the latest readings at this interval, in seconds.
        #[clap(long, default_value_t = DEFAULT_REFRESH_SECS)]
        refresh_secs: u64,

        /// Don't fetch the latest readings periodically.
        #[clap(long)]
        no_scheduler: bool,
    },

    /// Backfill historical readings over a range of days (YYYY-MM-DD, inclusive)
    Backfill {
        #[clap(long)]
        start: String,

        #[clap(long)]
        end: String,
    },

    /// Delete the backfill checkpoint so the next backfill starts from the beginning
    ResetCheckpoint,
}

/// Exit with an error naming the flag when a required value is missing.
fn required(value: Option<String>, flag: &str) -> String {
    value.unwrap_or_else(|| {
        tracing::error!(message = "missing required option", option = flag);
        process::exit(1)
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let opts = StationIngestApplication::parse();
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(opts.log_level)
            .finish(),
    )
    .expect("failed to set tracing subscriber");

    let checkpoints = CheckpointStore::new(opts.data_dir.join("checkpoint.json"));
    if let Command::ResetCheckpoint = opts.command {
        checkpoints.reset().unwrap_or_else(|e| {
            tracing::error!(message = "unable to reset checkpoint", error = %e);
            process::exit(1)
        });

        tracing::info!(message = "checkpoint reset", path = %checkpoints.path().display());
        return Ok(());
    }

    let device = required(opts.device, "--device");
    let credentials = Credentials {
        api_key: required(opts.api_key, "--api-key"),
        application_key: required(opts.application_key, "--application-key"),
    };

    let timeout = Duration::from_millis(opts.timeout_millis);
    let min_interval = Duration::from_millis(opts.min_interval_millis);
    // Callers also wait for their turn in the queue, allow for a few requests ahead of them
    let wait_timeout = timeout.saturating_mul(2) + min_interval.saturating_mul(4);

    let http_client = Client::builder().timeout(timeout).build().unwrap_or_else(|e| {
        tracing::error!(message = "unable to initialize HTTP client", error = %e);
        process::exit(1)
    });

    let client = StationClient::new(http_client, &opts.api_url, credentials).unwrap_or_else(|e| {
        tracing::error!(message = "unable to initialize API client", error = %e);
        process::exit(1)
    });
    let upstream: Arc<dyn Upstream> = Arc::new(client);

    let file_store = FileStore::open(opts.data_dir.join("readings.json")).unwrap_or_else(|e| {
        tracing::error!(message = "unable to open reading store", error = %e);
        process::exit(1)
    });
    let store: Arc<dyn ReadingStore> = Arc::new(file_store);

    let newest = store.latest()?.and_then(|r| r.timestamp());
    tracing::info!(
        message = "opened reading store",
        readings = store.count()?,
        newest = ?newest,
        data_dir = %opts.data_dir.display(),
    );

    let mut registry = Registry::default();
    let queue_metrics = QueueMetrics::new(&mut registry);
    let ingest_metrics = IngestMetrics::new(&mut registry);

    let queue = RequestQueue::with_metrics(
        QueueConfig {
            min_interval,
            call_timeout: timeout,
            ..QueueConfig::default()
        },
        queue_metrics,
    );
    queue.start()?;
    let bridge = ThreadBridge::start(&queue)?;

    let devices = Arc::new(DeviceCache::new());
    let backfill_config = BackfillConfig {
        device: device.clone(),
        call_timeout: wait_timeout,
        rate_limit_cooldown: Duration::from_secs(opts.rate_limit_cooldown_secs),
        ..BackfillConfig::default()
    };
    let coordinator = Arc::new(
        BackfillCoordinator::new(backfill_config, bridge.clone(), upstream.clone(), store.clone(), checkpoints)
            .with_devices(devices.clone())
            .with_metrics(ingest_metrics.clone()),
    );

    match opts.command {
        Command::Serve {
            bind,
            refresh_secs,
            no_scheduler,
        } => {
            let interval = Duration::from_secs(refresh_secs);
            let scheduler = Arc::new(Scheduler::new(
                SchedulerConfig {
                    enabled: !no_scheduler,
                    interval,
                    device: device.clone(),
                    call_timeout: wait_timeout,
                    ..SchedulerConfig::default()
                },
                bridge,
                upstream.clone(),
                store,
                ingest_metrics,
            ));

            if no_scheduler {
                tracing::info!(message = "periodic fetch disabled");
            } else if let Err(e) = scheduler.start(interval) {
                tracing::error!(message = "unable to start scheduler", error = %e);
            }

            let state = AppState {
                coordinator: coordinator.clone(),
                scheduler: scheduler.clone(),
                queue: queue.clone(),
                devices,
                upstream,
                registry: Arc::new(registry),
                call_timeout: wait_timeout,
            };

            let server = axum::Server::try_bind(&bind)
                .unwrap_or_else(|e| {
                    tracing::error!(message = "error binding to address", address = %bind, error = %e);
                    process::exit(1)
                })
                .serve(router(state).into_make_service());

            tracing::info!(message = "server started", address = %server.local_addr(), device = %device);
            server
                .with_graceful_shutdown(async {
                    // Wait for either SIGTERM or SIGINT to shutdown
                    tokio::select! {
                        _ = sigterm() => {}
                        _ = sigint() => {}
                    }
                })
                .await?;

            tracing::info!("server shutdown");
            scheduler.stop();
            if coordinator.stop() {
                let coordinator = coordinator.clone();
                tokio::task::spawn_blocking(move || coordinator.wait()).await?;
            }
        }

        Command::Backfill { start, end } => {
            let range = DateRange::parse(&start, &end).unwrap_or_else(|e| {
                tracing::error!(message = "invalid backfill range", error = %e);
                process::exit(1)
            });

            coordinator.start(range)?;
            let report = follow_backfill(&coordinator).await?;

            queue.shutdown(Duration::from_secs(DEFAULT_DRAIN_SECS)).await;
            match report {
                Some(r) if r.status == JobStatus::Failed => {
                    tracing::error!(message = "backfill failed", reason = ?r.message);
                    process::exit(1)
                }
                Some(r) => {
                    for failed in &r.failed {
                        tracing::warn!(message = "day failed", date = %failed.date, error = %failed.error);
                    }
                    tracing::info!(
                        message = "backfill done",
                        status = %r.status,
                        days = r.units_processed,
                        inserted = r.inserted,
                        skipped = r.skipped,
                        failed = r.failed.len(),
                        rate_limit_pauses = r.rate_limit_pauses,
                    );
                }
                None => {
                    tracing::error!(message = "backfill ended without a report");
                    process::exit(1)
                }
            }

            return Ok(());
        }

        Command::ResetCheckpoint => {}
    }

    queue.shutdown(Duration::from_secs(DEFAULT_DRAIN_SECS)).await;
    Ok(())
}

/// Log progress until the backfill ends. SIGTERM or SIGINT ask it to stop after the
/// current day.
async fn follow_backfill(
    coordinator: &Arc<BackfillCoordinator>,
) -> Result<Option<BackfillReport>, Box<dyn Error + Send + Sync>> {
    let mut term = unix::signal(SignalKind::terminate())?;
    let mut int = unix::signal(SignalKind::interrupt())?;
    let mut ticker = tokio::time::interval(Duration::from_secs(DEFAULT_PROGRESS_SECS));

    let waiter = {
        let coordinator = coordinator.clone();
        tokio::task::spawn_blocking(move || coordinator.wait())
    };
    tokio::pin!(waiter);

    loop {
        tokio::select! {
            res = &mut waiter => return Ok(res?),
            _ = term.recv() => {
                coordinator.stop();
            }
            _ = int.recv() => {
                coordinator.stop();
            }
            _ = ticker.tick() => {
                let snap = coordinator.progress();
                tracing::info!(
                    message = "backfill progress",
                    status = %snap.status,
                    current = ?snap.current_date,
                    completed = snap.units_completed,
                    failed = snap.units_failed,
                    total = snap.units_total,
                    inserted = snap.inserted_records,
                    eta_secs = ?snap.estimated_time_remaining.map(|d| d.as_secs()),
                );
            }
        }
    }
}

/// Return after the first SIGTERM signal received by this process
async fn sigterm() -> io::Result<()> {
    unix::signal(SignalKind::terminate())?.recv().await;
    Ok(())
}

/// Return after the first SIGINT signal received by this process
async fn sigint() -> io::Result<()> {
    unix::signal(SignalKind::interrupt())?.recv().await;
    Ok(())
}
