use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub id: String,
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub cooldown_period_days: i64,
    #[serde(default)]
    pub device_id: Option<String>,
}

fn default_enabled() -> bool {
    true
}

/// Cooldown settings the executor needs for one zone.
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneCooldown {
    pub cooldown_days: i64,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WateringSource {
    Automation,
    Manual,
}

impl WateringSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            WateringSource::Automation => "automation",
            WateringSource::Manual => "manual",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "automation" | "rule" => Some(WateringSource::Automation),
            "manual" => Some(WateringSource::Manual),
            _ => None,
        }
    }
}

impl std::fmt::Display for WateringSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WateringEvent {
    pub id: Option<i64>,
    pub zone_id: String,
    pub timestamp: DateTime<Utc>,
    pub duration_sec: u32,
    pub source: WateringSource,
    pub raw_payload: serde_json::Value,
}

impl WateringEvent {
    pub fn new(
        zone_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        duration_sec: u32,
        source: WateringSource,
    ) -> Self {
        Self {
            id: None,
            zone_id: zone_id.into(),
            timestamp,
            duration_sec,
            source,
            raw_payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.raw_payload = payload;
        self
    }
}
