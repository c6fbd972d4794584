use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Lowest and highest soil-moisture channel a multi-channel station reports.
pub const SOIL_CHANNEL_MIN: u8 = 1;
pub const SOIL_CHANNEL_MAX: u8 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SensorField {
    #[serde(alias = "rain_24h")]
    Rain24h,
    #[serde(alias = "rain_1h")]
    Rain1h,
    Temperature,
    Humidity,
    Pressure,
    #[serde(alias = "soil_moisture")]
    SoilMoisture,
}

impl SensorField {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorField::Rain24h => "rain24h",
            SensorField::Rain1h => "rain1h",
            SensorField::Temperature => "temperature",
            SensorField::Humidity => "humidity",
            SensorField::Pressure => "pressure",
            SensorField::SoilMoisture => "soilMoisture",
        }
    }

    pub fn all() -> &'static [SensorField] {
        &[
            SensorField::Rain24h,
            SensorField::Rain1h,
            SensorField::Temperature,
            SensorField::Humidity,
            SensorField::Pressure,
            SensorField::SoilMoisture,
        ]
    }

    /// Fields with a stored history that trend conditions may reference.
    pub fn supports_trend(&self) -> bool {
        matches!(
            self,
            SensorField::Temperature | SensorField::Humidity | SensorField::Pressure
        )
    }

    /// Column holding this field in `sensor_readings`.
    pub fn column(&self) -> &'static str {
        match self {
            SensorField::Rain24h => "rain_24h",
            SensorField::Rain1h => "rain_1h",
            SensorField::Temperature => "temperature",
            SensorField::Humidity => "humidity",
            SensorField::Pressure => "pressure",
            SensorField::SoilMoisture => "soil_moisture",
        }
    }
}

impl std::fmt::Display for SensorField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Latest normalized reading from the weather station and soil probes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorSnapshot {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub rain_24h: Option<f64>,
    #[serde(default)]
    pub rain_1h: Option<f64>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub humidity: Option<f64>,
    #[serde(default)]
    pub pressure: Option<f64>,
    #[serde(default)]
    pub soil_moisture: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soil_channels: Option<BTreeMap<u8, f64>>,
}

impl SensorSnapshot {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            rain_24h: None,
            rain_1h: None,
            temperature: None,
            humidity: None,
            pressure: None,
            soil_moisture: None,
            soil_channels: None,
        }
    }

    pub fn value(&self, field: SensorField) -> Option<f64> {
        match field {
            SensorField::Rain24h => self.rain_24h,
            SensorField::Rain1h => self.rain_1h,
            SensorField::Temperature => self.temperature,
            SensorField::Humidity => self.humidity,
            SensorField::Pressure => self.pressure,
            SensorField::SoilMoisture => self.soil_moisture,
        }
    }

    pub fn soil_channel(&self, channel: u8) -> Option<f64> {
        self.soil_channels.as_ref()?.get(&channel).copied()
    }

    /// Known values only, keyed by field name. Stored with watering events.
    pub fn known_values(&self) -> serde_json::Value {
        let mut values = serde_json::Map::new();
        for field in SensorField::all() {
            if let Some(v) = self.value(*field) {
                values.insert(field.as_str().to_string(), serde_json::json!(v));
            }
        }
        if let Some(ref channels) = self.soil_channels {
            let channels: serde_json::Map<String, serde_json::Value> = channels
                .iter()
                .map(|(ch, v)| (ch.to_string(), serde_json::json!(v)))
                .collect();
            values.insert("soilChannels".into(), serde_json::Value::Object(channels));
        }
        values.insert(
            "timestamp".into(),
            serde_json::Value::String(self.timestamp.to_rfc3339()),
        );
        serde_json::Value::Object(values)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

impl Sample {
    pub fn new(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// Per-field samples over the trend lookback window.
#[derive(Debug, Clone, Default)]
pub struct HistoricalSeries {
    series: HashMap<SensorField, Vec<Sample>>,
}

impl HistoricalSeries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, field: SensorField, sample: Sample) {
        self.series.entry(field).or_default().push(sample);
    }

    pub fn samples(&self, field: SensorField) -> &[Sample] {
        self.series.get(&field).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.series.values().all(Vec::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn field_names_round_trip_through_serde() {
        let parsed: SensorField = serde_json::from_str("\"rain24h\"").unwrap();
        assert_eq!(parsed, SensorField::Rain24h);
        let alias: SensorField = serde_json::from_str("\"soil_moisture\"").unwrap();
        assert_eq!(alias, SensorField::SoilMoisture);
        assert_eq!(
            serde_json::to_string(&SensorField::SoilMoisture).unwrap(),
            "\"soilMoisture\""
        );
    }

    #[test]
    fn only_history_fields_support_trend() {
        assert!(SensorField::Temperature.supports_trend());
        assert!(SensorField::Pressure.supports_trend());
        assert!(!SensorField::Rain24h.supports_trend());
        assert!(!SensorField::SoilMoisture.supports_trend());
    }

    #[test]
    fn snapshot_value_lookup() {
        let mut snapshot = SensorSnapshot::new(Utc::now());
        assert!(snapshot.value(SensorField::Humidity).is_none());

        snapshot.humidity = Some(72.0);
        snapshot.soil_channels = Some(BTreeMap::from([(3, 41.5)]));
        assert_eq!(snapshot.value(SensorField::Humidity), Some(72.0));
        assert_eq!(snapshot.soil_channel(3), Some(41.5));
        assert_eq!(snapshot.soil_channel(4), None);
    }

    #[test]
    fn known_values_skips_missing_fields() {
        let mut snapshot = SensorSnapshot::new(Utc.with_ymd_and_hms(2026, 6, 1, 6, 0, 0).unwrap());
        snapshot.rain_24h = Some(0.2);
        let values = snapshot.known_values();
        assert_eq!(values["rain24h"], serde_json::json!(0.2));
        assert!(values.get("temperature").is_none());
    }

    #[test]
    fn series_returns_empty_slice_for_unknown_field() {
        let mut history = HistoricalSeries::new();
        assert!(history.is_empty());
        history.push(SensorField::Pressure, Sample::new(Utc::now(), 1012.0));
        assert_eq!(history.samples(SensorField::Pressure).len(), 1);
        assert!(history.samples(SensorField::Humidity).is_empty());
    }
}
