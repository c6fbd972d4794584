use super::rate_limit::{RateLimitRegistry, RateLimitTracker};
use super::{IrrigationController, ZoneRun};
use crate::config::ControllerConfig;
use crate::error::{RaincheckError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;

const HEADER_LIMIT: &str = "x-ratelimit-limit";
const HEADER_REMAINING: &str = "x-ratelimit-remaining";
const HEADER_RESET: &str = "x-ratelimit-reset";
const HEADER_RETRY_AFTER: &str = "retry-after";

/// Reset values below this are a seconds offset rather than a Unix timestamp.
const EPOCH_THRESHOLD: i64 = 1_000_000_000;

pub struct ControllerClient {
    client: reqwest::Client,
    config: ControllerConfig,
    tracker: Arc<RateLimitTracker>,
    person_id: Mutex<Option<String>>,
}

// Controller API response structures
#[derive(Debug, Deserialize)]
struct PersonInfo {
    id: String,
}

#[derive(Debug, Deserialize)]
struct PersonResponse {
    #[serde(default)]
    devices: Vec<ApiDevice>,
}

#[derive(Debug, Deserialize)]
struct ApiDevice {
    id: String,
    name: String,
    #[serde(default)]
    zones: Vec<ApiZone>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiZone {
    id: String,
    name: String,
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    zone_number: u32,
}

#[derive(Debug, Default, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: Option<serde_json::Value>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Device as reported by the controller account.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerDevice {
    pub id: String,
    pub name: String,
    pub zones: Vec<ControllerZone>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerZone {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub zone_number: u32,
}

/// Rate-limit headers found on a controller response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct RateLimitHeaders {
    pub remaining: Option<i64>,
    pub limit: Option<i64>,
    pub reset: Option<DateTime<Utc>>,
    pub retry_after_secs: Option<i64>,
}

impl ControllerClient {
    pub fn new(config: ControllerConfig, registry: &RateLimitRegistry) -> Result<Self> {
        let tracker = registry.tracker_for(&config.base_url);
        Self::with_tracker(config, tracker)
    }

    pub fn with_tracker(config: ControllerConfig, tracker: Arc<RateLimitTracker>) -> Result<Self> {
        if !config.has_credential() {
            return Err(RaincheckError::Config(
                "controller.api_key is not configured".into(),
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RaincheckError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config,
            tracker,
            person_id: Mutex::new(None),
        })
    }

    pub fn tracker(&self) -> &Arc<RateLimitTracker> {
        &self.tracker
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Send one request, keeping the shared rate-limit tracker in step with
    /// the response. `targets` names the ids an invalid-target reply refers to.
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
        targets: &[String],
    ) -> Result<reqwest::Response> {
        if self.tracker.is_limited() {
            let state = self.tracker.state();
            tracing::debug!(path, reset = ?state.reset_time, "Skipping call while rate limited");
            return Err(RaincheckError::RateLimited {
                reset_at: state.reset_time,
                remaining: state.remaining,
            });
        }

        let mut request = self
            .client
            .request(method, self.url(path))
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json");
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                RaincheckError::Transport(format!("{} timed out", path))
            } else {
                RaincheckError::Transport(format!("{}: {}", path, e))
            }
        })?;

        let now = Utc::now();
        let status = response.status();
        let headers = parse_rate_limit_headers(response.headers(), now);

        if status.is_success() {
            self.tracker
                .record_success_at(now, headers.remaining, headers.limit, headers.reset);
            if let Some(remaining) = headers.remaining {
                if remaining < self.config.low_remaining_warning {
                    tracing::warn!(
                        remaining,
                        limit = ?headers.limit,
                        reset = ?headers.reset,
                        "Controller API calls running low"
                    );
                }
            }
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_failure(
            &self.tracker,
            now,
            status,
            &headers,
            &body,
            path,
            targets,
        ))
    }

    /// Account id, looked up once per client.
    pub async fn get_person_id(&self) -> Result<String> {
        let mut cached = self.person_id.lock().await;
        if let Some(ref id) = *cached {
            return Ok(id.clone());
        }

        let response = self.send(Method::GET, "/person/info", None, &[]).await?;
        let info: PersonInfo = response.json().await?;
        *cached = Some(info.id.clone());
        Ok(info.id)
    }

    pub async fn list_devices(&self) -> Result<Vec<ControllerDevice>> {
        let person_id = self.get_person_id().await?;
        let response = self
            .send(Method::GET, &format!("/person/{}", person_id), None, &[])
            .await?;
        let person: PersonResponse = response.json().await?;

        Ok(person
            .devices
            .into_iter()
            .map(|d| ControllerDevice {
                id: d.id,
                name: d.name,
                zones: d
                    .zones
                    .into_iter()
                    .map(|z| ControllerZone {
                        id: z.id,
                        name: z.name,
                        enabled: z.enabled,
                        zone_number: z.zone_number,
                    })
                    .collect(),
            })
            .collect())
    }

    pub async fn test_connection(&self) -> Result<bool> {
        match self.get_person_id().await {
            Ok(_) => Ok(true),
            Err(RaincheckError::Transport(msg)) => {
                tracing::warn!("Controller connection failed: {}", msg);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl IrrigationController for ControllerClient {
    async fn set_rain_delay(&self, device_id: &str, hours: u32) -> Result<()> {
        let duration = u64::from(hours) * 3600;
        self.send(
            Method::PUT,
            "/device/rain_delay",
            Some(json!({ "id": device_id, "duration": duration })),
            &[device_id.to_string()],
        )
        .await?;
        tracing::info!(device_id, hours, "Rain delay set");
        Ok(())
    }

    async fn run_zone(&self, zone_id: &str, duration_sec: u32) -> Result<()> {
        self.send(
            Method::PUT,
            "/zone/start",
            Some(json!({ "id": zone_id, "duration": duration_sec })),
            &[zone_id.to_string()],
        )
        .await?;
        tracing::info!(zone_id, duration_sec, "Zone started");
        Ok(())
    }

    async fn run_zones(&self, runs: &[ZoneRun]) -> Result<()> {
        if runs.is_empty() {
            return Ok(());
        }

        let mut ordered: Vec<&ZoneRun> = runs.iter().collect();
        ordered.sort_by_key(|r| r.order);

        let zones: Vec<serde_json::Value> = ordered
            .iter()
            .map(|r| json!({ "id": r.zone_id, "duration": r.duration_sec, "sortOrder": r.order }))
            .collect();
        let ids: Vec<String> = ordered.iter().map(|r| r.zone_id.clone()).collect();

        self.send(
            Method::PUT,
            "/zone/start_multiple",
            Some(json!({ "zones": zones })),
            &ids,
        )
        .await?;
        tracing::info!(zones = ?ids, "Sequential zone run started");
        Ok(())
    }

    async fn stop(&self, device_id: &str) -> Result<()> {
        self.send(
            Method::PUT,
            "/device/stop_water",
            Some(json!({ "id": device_id })),
            &[device_id.to_string()],
        )
        .await?;
        tracing::info!(device_id, "Watering stopped");
        Ok(())
    }
}

/// Turn a non-success response into a typed error, recording rate limits.
fn classify_failure(
    tracker: &RateLimitTracker,
    now: DateTime<Utc>,
    status: StatusCode,
    headers: &RateLimitHeaders,
    body: &str,
    path: &str,
    targets: &[String],
) -> RaincheckError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        tracker.record_limited_at(now, headers.reset, headers.retry_after_secs);
        return RaincheckError::RateLimited {
            reset_at: tracker.state().reset_time,
            remaining: headers.remaining,
        };
    }

    if (status == StatusCode::BAD_REQUEST || status == StatusCode::NOT_FOUND) && !targets.is_empty()
    {
        let parsed: ApiErrorBody = serde_json::from_str(body).unwrap_or_default();
        let code = match parsed.code {
            Some(serde_json::Value::String(s)) => s,
            Some(other) => other.to_string(),
            None => status.as_u16().to_string(),
        };
        let message = parsed
            .message
            .or(parsed.error)
            .unwrap_or_else(|| body.trim().to_string());
        return RaincheckError::InvalidTarget {
            ids: targets.to_vec(),
            code,
            message,
        };
    }

    RaincheckError::Transport(format!("{} returned {}: {}", path, status, body.trim()))
}

pub(crate) fn parse_rate_limit_headers(headers: &HeaderMap, now: DateTime<Utc>) -> RateLimitHeaders {
    let text = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    let int = |name: &str| text(name).and_then(|v| v.parse::<i64>().ok());

    let reset = text(HEADER_RESET).and_then(|v| parse_reset(v, now));

    let (retry_after_secs, retry_after_date) = match text(HEADER_RETRY_AFTER) {
        Some(v) => match v.parse::<i64>() {
            Ok(secs) => (Some(secs), None),
            Err(_) => (None, parse_http_date(v)),
        },
        None => (None, None),
    };

    RateLimitHeaders {
        remaining: int(HEADER_REMAINING),
        limit: int(HEADER_LIMIT),
        reset: reset.or(retry_after_date),
        retry_after_secs,
    }
}

/// Reset header as RFC 3339, HTTP date, Unix timestamp, or seconds from now.
fn parse_reset(value: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Some(dt) = parse_http_date(value) {
        return Some(dt);
    }
    let number = value.parse::<f64>().ok()?;
    if !number.is_finite() || number < 0.0 {
        return None;
    }
    let secs = number as i64;
    if secs >= EPOCH_THRESHOLD {
        DateTime::from_timestamp(secs, 0)
    } else {
        Some(now + Duration::seconds(secs))
    }
}

fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}
