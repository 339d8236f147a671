//! Netatmo weather-station access: password-grant token and CO2 extraction
//! from the station data document.

use crate::config::NetatmoConfig;
use crate::error::{StageError, StageResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone)]
pub struct Token {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub obtained_at: DateTime<Utc>,
}

/// At most one reading per poll. `co2_ppm` is `None` when no module matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorReading {
    pub location: String,
    pub co2_ppm: Option<i64>,
}

impl SensorReading {
    pub fn found(&self) -> bool {
        self.co2_ppm.is_some()
    }
}

#[async_trait]
pub trait StationApi: Send + Sync {
    async fn acquire_token(&self) -> StageResult<Token>;
    // The poll cycle always takes a fresh token and never refreshes.
    #[allow(dead_code)]
    async fn refresh(&self, refresh_token: &str) -> StageResult<Token>;
    async fn read_co2(&self, token: &Token, location: &str) -> StageResult<SensorReading>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StationsData {
    pub body: Option<StationsBody>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StationsBody {
    #[serde(default)]
    pub devices: Vec<Device>,
}

#[derive(Debug, Deserialize)]
pub struct Device {
    pub station_name: Option<String>,
    pub module_name: Option<String>,
    pub dashboard_data: Option<Dashboard>,
    #[serde(default)]
    pub modules: Vec<Module>,
}

#[derive(Debug, Deserialize)]
pub struct Module {
    pub module_name: Option<String>,
    pub dashboard_data: Option<Dashboard>,
}

#[derive(Debug, Deserialize)]
pub struct Dashboard {
    #[serde(rename = "CO2")]
    pub co2: Option<i64>,
}

fn co2_of(dashboard: &Option<Dashboard>) -> Option<i64> {
    dashboard.as_ref().and_then(|d| d.co2)
}

/// Find the CO2 value of `location` in the station document.
///
/// A device whose own name matches wins over its submodules. Otherwise every
/// submodule is scanned and the last exact, case-sensitive match overwrites
/// any earlier one, across devices as well. A match without a CO2 field is
/// skipped.
pub fn extract_co2(data: &StationsBody, location: &str) -> SensorReading {
    let mut co2_ppm = None;

    for device in &data.devices {
        log::debug!(
            "station_name={:?}, module_name={:?}, location={}",
            device.station_name,
            device.module_name,
            location
        );
        if device.module_name.as_deref() == Some(location) {
            if let Some(value) = co2_of(&device.dashboard_data) {
                co2_ppm = Some(value);
            }
            continue;
        }
        for module in &device.modules {
            if module.module_name.as_deref() == Some(location) {
                match co2_of(&module.dashboard_data) {
                    Some(value) => co2_ppm = Some(value),
                    None => log::warn!("Module {} has no CO2 value", location),
                }
            }
        }
    }

    SensorReading {
        location: location.to_string(),
        co2_ppm,
    }
}

pub fn parse_station_data(body: &str, location: &str) -> StageResult<SensorReading> {
    if body.trim().is_empty() {
        return Err(StageError::Parse("empty station data response".into()));
    }
    let data: StationsData = serde_json::from_str(body)
        .map_err(|e| StageError::Parse(format!("station data is not valid JSON: {}", e)))?;
    let body = data
        .body
        .ok_or_else(|| StageError::Parse("station data has no body".into()))?;
    Ok(extract_co2(&body, location))
}

fn parse_token(body: &str) -> StageResult<Token> {
    let resp: TokenResponse = serde_json::from_str(body)
        .map_err(|e| StageError::Auth(format!("token response is not valid JSON: {}", e)))?;
    let access_token = resp
        .access_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| StageError::Auth("token response has no access_token".into()))?;
    Ok(Token {
        access_token,
        refresh_token: resp.refresh_token,
        obtained_at: Utc::now(),
    })
}

fn redact(token: &str) -> String {
    let head: String = token.chars().take(6).collect();
    format!("{}...", head)
}

// The station API answers 301 on some paths; the device firmware treated it as success.
fn accepted(status: StatusCode) -> bool {
    status == StatusCode::OK || status == StatusCode::MOVED_PERMANENTLY
}

pub struct NetatmoClient {
    config: NetatmoConfig,
    user_agent: String,
    timeout: Duration,
}

impl NetatmoClient {
    pub fn new(config: NetatmoConfig, user_agent: String, timeout: Duration) -> Self {
        Self {
            config,
            user_agent,
            timeout,
        }
    }

    // New client per call: no idle connections are kept between polls or retries.
    fn http_client(&self) -> StageResult<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(&self.user_agent)
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| StageError::Network(format!("cannot build HTTP client: {}", e)))
    }

    pub fn station_data_url(&self) -> StageResult<Url> {
        let base = format!("{}/getstationsdata", self.config.api_url.trim_end_matches('/'));
        Url::parse_with_params(
            &base,
            &[
                ("device_id", self.config.device_id.as_str()),
                ("get_favorites", "false"),
            ],
        )
        .map_err(|e| StageError::Network(format!("invalid station data URL {}: {}", base, e)))
    }

    async fn post_grant(&self, params: &[(&str, &str)]) -> StageResult<Token> {
        let client = self.http_client()?;
        log::info!("Requesting token from {}", self.config.token_url);

        let response = client
            .post(&self.config.token_url)
            .header("Connection", "close")
            .form(params)
            .send()
            .await
            .map_err(|e| StageError::Auth(format!("token request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| StageError::Auth(format!("cannot read token response: {}", e)))?;
        log::debug!("token endpoint answered {}", status);

        if !accepted(status) {
            return Err(StageError::Auth(format!("token endpoint returned {}", status)));
        }

        let token = parse_token(&body)?;
        log::info!(
            "Obtained access token {} at {} (refresh token: {})",
            redact(&token.access_token),
            token.obtained_at.to_rfc3339(),
            if token.refresh_token.is_some() { "yes" } else { "no" }
        );
        Ok(token)
    }
}

#[async_trait]
impl StationApi for NetatmoClient {
    async fn acquire_token(&self) -> StageResult<Token> {
        let c = &self.config;
        self.post_grant(&[
            ("grant_type", "password"),
            ("client_id", c.client_id.as_str()),
            ("client_secret", c.client_secret.as_str()),
            ("username", c.username.as_str()),
            ("password", c.password.as_str()),
            ("scope", c.scope.as_str()),
        ])
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> StageResult<Token> {
        let c = &self.config;
        self.post_grant(&[
            ("grant_type", "refresh_token"),
            ("client_id", c.client_id.as_str()),
            ("client_secret", c.client_secret.as_str()),
            ("refresh_token", refresh_token),
        ])
        .await
    }

    async fn read_co2(&self, token: &Token, location: &str) -> StageResult<SensorReading> {
        let client = self.http_client()?;
        let url = self.station_data_url()?;
        log::info!("GET {}", url);

        let response = client
            .get(url)
            .header("Accept", "application/json")
            .bearer_auth(&token.access_token)
            .send()
            .await
            .map_err(|e| StageError::Network(format!("station data request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| StageError::Network(format!("cannot read station data: {}", e)))?;

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(StageError::Auth(format!("station data returned {}", status)));
        }
        if !accepted(status) {
            log::warn!("station data returned {}: {}", status, body);
            return Err(StageError::Network(format!("station data returned {}", status)));
        }

        let reading = parse_station_data(&body, location)?;
        match reading.co2_ppm {
            Some(value) => log::info!("{}: CO2 {} ppm", location, value),
            None => log::warn!("No module named {} in station data", location),
        }
        Ok(reading)
    }
}
