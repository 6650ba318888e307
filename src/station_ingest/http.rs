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

use crate::backfill::{BackfillCoordinator, BackfillError, DateRange};
use crate::client::Upstream;
use crate::devices::DeviceCache;
use crate::queue::{QueueError, RequestQueue};
use crate::scheduler::Scheduler;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

const OPENMETRICS_TEXT: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Everything the handlers need, cloned into each request.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<BackfillCoordinator>,
    pub scheduler: Arc<Scheduler>,
    pub queue: RequestQueue,
    pub devices: Arc<DeviceCache>,
    pub upstream: Arc<dyn Upstream>,
    pub registry: Arc<Registry>,
    pub call_timeout: Duration,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/backfill/start", post(start_backfill))
        .route("/backfill/stop", post(stop_backfill))
        .route("/backfill/progress", get(backfill_progress))
        .route("/backfill/checkpoint", delete(reset_checkpoint))
        .route("/scheduler/status", get(scheduler_status))
        .route("/queue/stats", get(queue_stats))
        .route("/devices", get(list_devices))
        .route("/devices/refresh", post(refresh_devices))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct StartRequest {
    start_date: String,
    end_date: String,
}

fn error_response(status: StatusCode, message: impl ToString) -> Response {
    (status, Json(json!({ "error": message.to_string() }))).into_response()
}

fn backfill_error(err: BackfillError) -> Response {
    let status = match err {
        BackfillError::AlreadyRunning => StatusCode::CONFLICT,
        BackfillError::InvalidRange(_) => StatusCode::BAD_REQUEST,
        BackfillError::Checkpoint(_) | BackfillError::Spawn(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    error_response(status, err)
}

fn queue_error(err: QueueError) -> Response {
    let status = if err.is_rate_limited() {
        StatusCode::TOO_MANY_REQUESTS
    } else {
        match err {
            QueueError::NotRunning | QueueError::NoRuntime | QueueError::Cancelled | QueueError::Full => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            QueueError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        }
    };

    error_response(status, err)
}

async fn start_backfill(State(state): State<AppState>, Json(req): Json<StartRequest>) -> Response {
    let range = match DateRange::parse(&req.start_date, &req.end_date) {
        Ok(r) => r,
        Err(e) => return backfill_error(e),
    };

    match state.coordinator.start(range) {
        Ok(()) => {
            tracing::info!(message = "backfill accepted", start = %range.start, end = %range.end);
            (StatusCode::ACCEPTED, Json(state.coordinator.progress())).into_response()
        }
        Err(e) => backfill_error(e),
    }
}

async fn stop_backfill(State(state): State<AppState>) -> Response {
    if state.coordinator.stop() {
        (StatusCode::ACCEPTED, Json(json!({ "status": "stopping" }))).into_response()
    } else {
        (StatusCode::OK, Json(json!({ "status": "not running" }))).into_response()
    }
}

async fn backfill_progress(State(state): State<AppState>) -> Response {
    Json(state.coordinator.progress()).into_response()
}

async fn reset_checkpoint(State(state): State<AppState>) -> Response {
    match state.coordinator.reset_checkpoint() {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => backfill_error(e),
    }
}

async fn scheduler_status(State(state): State<AppState>) -> Response {
    Json(state.scheduler.status()).into_response()
}

async fn queue_stats(State(state): State<AppState>) -> Response {
    Json(state.queue.stats()).into_response()
}

async fn list_devices(State(state): State<AppState>) -> Response {
    let devices = state.devices.get().map(|d| d.as_ref().clone());
    Json(devices).into_response()
}

async fn refresh_devices(State(state): State<AppState>) -> Response {
    state.devices.invalidate();

    let upstream = state.upstream.clone();
    let res = state
        .queue
        .enqueue(move || async move { upstream.devices().await }, state.call_timeout)
        .await;

    match res {
        Ok(devices) => {
            tracing::info!(message = "refreshed device list", devices = devices.len());
            state.devices.refresh(devices.clone());
            Json(devices).into_response()
        }
        Err(e) => {
            tracing::warn!(message = "unable to refresh device list", error = %e);
            queue_error(e)
        }
    }
}

async fn metrics(State(state): State<AppState>) -> Response {
    let mut buf = String::new();
    match encode(&mut buf, &state.registry) {
        Ok(()) => {
            tracing::debug!(message = "encoded prometheus metrics to text format", num_bytes = buf.len());
            (StatusCode::OK, [(CONTENT_TYPE, OPENMETRICS_TEXT)], buf).into_response()
        }
        Err(e) => {
            tracing::error!(message = "error encoding metrics", error = %e);
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}
