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

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use reqwest::header::{ACCEPT, USER_AGENT};
use reqwest::{Client, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::error;
use std::fmt;

#[derive(Debug)]
pub enum ClientError {
    Internal(reqwest::Error),
    InvalidUrl(String),
    InvalidDevice(String),
    Unauthorized(StatusCode),
    RateLimited,
    Unexpected(StatusCode, Url),
}

impl ClientError {
    /// True for failures worth retrying with backoff: transport errors and 5xx responses.
    ///
    /// Rate limit responses are not considered transient here since callers are expected
    /// to handle them with a cooldown rather than a regular backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Internal(_) => true,
            Self::Unexpected(status, _) => status.is_server_error(),
            _ => false,
        }
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Internal(e) => write!(f, "{}", e),
            Self::InvalidUrl(u) => write!(f, "invalid API url {}", u),
            Self::InvalidDevice(d) => write!(f, "invalid device {}", d),
            Self::Unauthorized(status) => write!(f, "credentials rejected with status {}", status),
            Self::RateLimited => write!(f, "rate limited by upstream API"),
            Self::Unexpected(status, url) => write!(f, "unexpected status {} for {}", status, url),
        }
    }
}

impl error::Error for ClientError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Internal(e) => Some(e),
            _ => None,
        }
    }
}

/// Source of devices and readings.
///
/// Implemented by [`StationClient`] for the real API. Everything that talks to the
/// upstream does so through this trait so that work can be routed through the
/// request queue without caring where the data comes from.
#[async_trait]
pub trait Upstream: Send + Sync + 'static {
    /// All devices visible to the configured credentials.
    async fn devices(&self) -> Result<Vec<Device>, ClientError>;

    /// Up to `limit` readings for `device` strictly older than `end`, newest first.
    async fn readings(&self, device: &str, end: DateTime<Utc>, limit: usize) -> Result<Vec<Reading>, ClientError>;
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub api_key: String,
    pub application_key: String,
}

#[derive(Debug)]
pub struct StationClient {
    client: Client,
    base_url: Url,
    credentials: Credentials,
}

impl StationClient {
    const USER_AGENT: &'static str = "station_ingest (rate-limited backfill)";
    const JSON_RESPONSE: &'static str = "application/json";

    pub fn new(client: Client, base_url: &str, credentials: Credentials) -> Result<Self, ClientError> {
        let base_url = Url::parse(base_url).map_err(|e| ClientError::InvalidUrl(format!("{}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(ClientError::InvalidUrl(base_url.to_string()));
        }

        Ok(StationClient {
            client,
            base_url,
            credentials,
        })
    }

    async fn make_request<S: Into<String>>(&self, device: S, url: Url) -> Result<Response, ClientError> {
        let res = self
            .client
            .get(url.clone())
            .header(USER_AGENT, Self::USER_AGENT)
            .header(ACCEPT, Self::JSON_RESPONSE)
            .send()
            .await
            .map_err(ClientError::Internal)?;

        let status = res.status();
        if status == StatusCode::OK {
            Ok(res)
        } else if status == StatusCode::NOT_FOUND {
            Err(ClientError::InvalidDevice(device.into()))
        } else if status == StatusCode::TOO_MANY_REQUESTS {
            Err(ClientError::RateLimited)
        } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            Err(ClientError::Unauthorized(status))
        } else {
            Err(ClientError::Unexpected(status, self.redacted(url)))
        }
    }

    fn devices_url(&self) -> Url {
        let mut url = self.base_url.clone();
        // cannot_be_a_base() was rejected in new() so path segments are always available
        if let Ok(mut p) = url.path_segments_mut() {
            p.pop_if_empty().push("devices");
        }

        self.with_credentials(url)
    }

    fn readings_url(&self, device: &str, end: DateTime<Utc>, limit: usize) -> Url {
        let mut url = self.base_url.clone();
        // push() percent-encodes the segment itself
        if let Ok(mut p) = url.path_segments_mut() {
            p.pop_if_empty().push("devices").push(device);
        }

        let mut url = self.with_credentials(url);
        url.query_pairs_mut()
            .append_pair("endDate", &end.timestamp_millis().to_string())
            .append_pair("limit", &limit.to_string());
        url
    }

    fn with_credentials(&self, mut url: Url) -> Url {
        url.query_pairs_mut()
            .append_pair("apiKey", &self.credentials.api_key)
            .append_pair("applicationKey", &self.credentials.application_key);
        url
    }

    /// Strip credentials from a URL before it ends up in an error or a log line.
    fn redacted(&self, mut url: Url) -> Url {
        url.set_query(None);
        url
    }
}

#[async_trait]
impl Upstream for StationClient {
    async fn devices(&self) -> Result<Vec<Device>, ClientError> {
        let url = self.devices_url();
        tracing::debug!(message = "making device list request", url = %self.redacted(url.clone()));

        let res = self.make_request("*", url).await?;
        res.json::<Vec<Device>>().await.map_err(ClientError::Internal)
    }

    async fn readings(&self, device: &str, end: DateTime<Utc>, limit: usize) -> Result<Vec<Reading>, ClientError> {
        let url = self.readings_url(device, end, limit);
        tracing::debug!(message = "making device readings request", url = %self.redacted(url.clone()), end = %end);

        let res = self.make_request(device, url).await?;
        res.json::<Vec<Reading>>().await.map_err(ClientError::Internal)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Device {
    #[serde(alias = "macAddress")]
    pub mac_address: String,
    #[serde(alias = "info", default)]
    pub info: DeviceInfo,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct DeviceInfo {
    #[serde(alias = "name", default)]
    pub name: Option<String>,
    #[serde(alias = "location", default)]
    pub location: Option<String>,
}

/// A single observation from a station, keyed by its UTC timestamp in milliseconds.
///
/// Fields the station reports that aren't listed here are kept in `extra` so that
/// nothing is lost on the way to storage.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Reading {
    #[serde(alias = "dateutc")]
    pub date_utc: i64,
    #[serde(alias = "tempf", default)]
    pub temp_f: Option<f64>,
    #[serde(alias = "humidity", default)]
    pub humidity: Option<f64>,
    #[serde(alias = "dewPoint", default)]
    pub dew_point: Option<f64>,
    #[serde(alias = "baromrelin", default)]
    pub barom_rel_in: Option<f64>,
    #[serde(alias = "windspeedmph", default)]
    pub wind_speed_mph: Option<f64>,
    #[serde(alias = "winddir", default)]
    pub wind_dir: Option<f64>,
    #[serde(alias = "dailyrainin", default)]
    pub daily_rain_in: Option<f64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Reading {
    /// Reading at the given time with no measurements set.
    pub fn at(timestamp: DateTime<Utc>) -> Self {
        Reading {
            date_utc: timestamp.timestamp_millis(),
            temp_f: None,
            humidity: None,
            dew_point: None,
            barom_rel_in: None,
            wind_speed_mph: None,
            wind_dir: None,
            daily_rain_in: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.date_utc).single()
    }

    /// UTC calendar day this reading falls on.
    pub fn date(&self) -> Option<NaiveDate> {
        self.timestamp().map(|ts| ts.date_naive())
    }
}
