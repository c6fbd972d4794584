use super::snapshot::{SensorField, SOIL_CHANNEL_MAX, SOIL_CHANNEL_MIN};
use crate::error::{RaincheckError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonOp {
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "==")]
    Eq,
}

impl ComparisonOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComparisonOp::Gte => ">=",
            ComparisonOp::Lte => "<=",
            ComparisonOp::Gt => ">",
            ComparisonOp::Lt => "<",
            ComparisonOp::Eq => "==",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim() {
            ">=" => Some(ComparisonOp::Gte),
            "<=" => Some(ComparisonOp::Lte),
            ">" => Some(ComparisonOp::Gt),
            "<" => Some(ComparisonOp::Lt),
            "==" => Some(ComparisonOp::Eq),
            _ => None,
        }
    }

    pub fn compare(&self, actual: f64, threshold: f64) -> bool {
        match self {
            ComparisonOp::Gte => actual >= threshold,
            ComparisonOp::Lte => actual <= threshold,
            ComparisonOp::Gt => actual > threshold,
            ComparisonOp::Lt => actual < threshold,
            ComparisonOp::Eq => actual == threshold,
        }
    }
}

impl std::fmt::Display for ComparisonOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Increasing,
    Decreasing,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Logic {
    #[default]
    #[serde(rename = "AND", alias = "and")]
    And,
    #[serde(rename = "OR", alias = "or")]
    Or,
}

/// One probe comparison inside a multi-channel soil moisture condition.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorCondition {
    pub channel: u8,
    pub operator: ComparisonOp,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCondition", into = "RawCondition")]
pub enum Condition {
    Threshold { operator: ComparisonOp, value: f64 },
    Trend(TrendDirection),
    MultiSensor {
        sensors: Vec<SensorCondition>,
        logic: Logic,
    },
}

impl Condition {
    pub fn threshold(operator: ComparisonOp, value: f64) -> Self {
        Condition::Threshold { operator, value }
    }

    pub fn is_trend(&self) -> bool {
        matches!(self, Condition::Trend(_))
    }
}

/// Wire shape shared by every condition kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RawCondition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    operator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    trend: Option<TrendDirection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sensors: Option<Vec<SensorCondition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    logic: Option<Logic>,
}

impl TryFrom<RawCondition> for Condition {
    type Error = String;

    fn try_from(raw: RawCondition) -> std::result::Result<Self, Self::Error> {
        if let Some(sensors) = raw.sensors {
            if let Some(bad) = sensors
                .iter()
                .find(|s| !(SOIL_CHANNEL_MIN..=SOIL_CHANNEL_MAX).contains(&s.channel))
            {
                return Err(format!(
                    "soil channel {} out of range {}..={}",
                    bad.channel, SOIL_CHANNEL_MIN, SOIL_CHANNEL_MAX
                ));
            }
            return Ok(Condition::MultiSensor {
                sensors,
                logic: raw.logic.unwrap_or_default(),
            });
        }

        let operator = raw
            .operator
            .ok_or_else(|| "condition is missing 'operator'".to_string())?;

        if operator.trim() == "trend" {
            let direction = raw
                .trend
                .ok_or_else(|| "trend condition is missing 'trend'".to_string())?;
            return Ok(Condition::Trend(direction));
        }

        let op = ComparisonOp::from_str(&operator)
            .ok_or_else(|| format!("unknown operator '{}'", operator))?;
        let value = raw
            .value
            .ok_or_else(|| format!("condition '{}' is missing 'value'", operator))?;
        if !value.is_finite() {
            return Err(format!("condition '{}' has a non-finite value", operator));
        }
        Ok(Condition::Threshold {
            operator: op,
            value,
        })
    }
}

impl From<Condition> for RawCondition {
    fn from(condition: Condition) -> Self {
        match condition {
            Condition::Threshold { operator, value } => RawCondition {
                operator: Some(operator.as_str().to_string()),
                value: Some(value),
                ..Default::default()
            },
            Condition::Trend(direction) => RawCondition {
                operator: Some("trend".to_string()),
                trend: Some(direction),
                ..Default::default()
            },
            Condition::MultiSensor { sensors, logic } => RawCondition {
                sensors: Some(sensors),
                logic: Some(logic),
                ..Default::default()
            },
        }
    }
}

/// Conditions keyed by field; a rule fires only when every entry holds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(
    try_from = "BTreeMap<SensorField, Condition>",
    into = "BTreeMap<SensorField, Condition>"
)]
pub struct ConditionSet {
    entries: Vec<(SensorField, Condition)>,
}

impl ConditionSet {
    /// Builds a set that is evaluated in the given entry order.
    pub fn new(entries: Vec<(SensorField, Condition)>) -> std::result::Result<Self, String> {
        for (field, condition) in &entries {
            validate_entry(*field, condition)?;
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[(SensorField, Condition)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn needs_history(&self) -> bool {
        self.entries.iter().any(|(_, c)| c.is_trend())
    }

    /// Fields referenced by trend conditions.
    pub fn trend_fields(&self) -> Vec<SensorField> {
        self.entries
            .iter()
            .filter(|(_, c)| c.is_trend())
            .map(|(f, _)| *f)
            .collect()
    }
}

fn validate_entry(field: SensorField, condition: &Condition) -> std::result::Result<(), String> {
    match condition {
        Condition::Trend(_) if !field.supports_trend() => Err(format!(
            "trend conditions are only supported on temperature, humidity and pressure, not {}",
            field
        )),
        Condition::MultiSensor { .. } if field != SensorField::SoilMoisture => Err(format!(
            "multi-sensor conditions are only supported on soilMoisture, not {}",
            field
        )),
        _ => Ok(()),
    }
}

impl TryFrom<BTreeMap<SensorField, Condition>> for ConditionSet {
    type Error = String;

    fn try_from(map: BTreeMap<SensorField, Condition>) -> std::result::Result<Self, Self::Error> {
        ConditionSet::new(map.into_iter().collect())
    }
}

impl From<ConditionSet> for BTreeMap<SensorField, Condition> {
    fn from(set: ConditionSet) -> Self {
        set.entries.into_iter().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    SetRainDelay {
        hours: u32,
        #[serde(
            default,
            rename = "deviceIds",
            alias = "device_ids",
            skip_serializing_if = "Option::is_none"
        )]
        device_ids: Option<Vec<String>>,
    },
    RunZone {
        minutes: u32,
        #[serde(
            default,
            rename = "zoneIds",
            alias = "zone_ids",
            skip_serializing_if = "Option::is_none"
        )]
        zone_ids: Option<Vec<String>>,
    },
}

impl Action {
    pub fn label(&self) -> String {
        match self {
            Action::SetRainDelay { hours, .. } => format!("set_rain_delay({}h)", hours),
            Action::RunZone { minutes, .. } => format!("run_zone({}m)", minutes),
        }
    }

    fn validate(&self) -> std::result::Result<(), String> {
        match self {
            Action::SetRainDelay { hours: 0, .. } => {
                Err("set_rain_delay requires hours > 0".into())
            }
            Action::RunZone { minutes: 0, .. } => Err("run_zone requires minutes > 0".into()),
            Action::SetRainDelay {
                device_ids: Some(ids),
                ..
            }
            | Action::RunZone {
                zone_ids: Some(ids),
                ..
            } if ids.iter().any(|id| id.trim().is_empty()) => {
                Err("target ids must not be empty".into())
            }
            _ => Ok(()),
        }
    }
}

/// Rule row as stored, with conditions and actions still in JSON form.
#[derive(Debug, Clone)]
pub struct RuleRecord {
    pub id: i64,
    pub name: String,
    pub enabled: bool,
    pub conditions: String,
    pub actions: String,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_result: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub id: i64,
    pub name: String,
    pub enabled: bool,
    pub conditions: ConditionSet,
    pub actions: Vec<Action>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_result: Option<serde_json::Value>,
}

impl Rule {
    /// Parse a stored rule. Shape problems surface as configuration errors
    /// scoped to this rule.
    pub fn from_record(record: RuleRecord) -> Result<Self> {
        let conditions: ConditionSet = serde_json::from_str(&record.conditions).map_err(|e| {
            RaincheckError::Config(format!(
                "rule '{}' has invalid conditions: {}",
                record.name, e
            ))
        })?;

        let actions = parse_actions(&record.actions).map_err(|e| {
            RaincheckError::Config(format!("rule '{}' has invalid actions: {}", record.name, e))
        })?;

        let last_result = record
            .last_result
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok());

        Ok(Self {
            id: record.id,
            name: record.name,
            enabled: record.enabled,
            conditions,
            actions,
            last_run_at: record.last_run_at,
            last_result,
        })
    }
}

/// Accepts a single action object (older rules) or a list of actions.
pub fn parse_actions(json: &str) -> std::result::Result<Vec<Action>, String> {
    let value: serde_json::Value = serde_json::from_str(json).map_err(|e| e.to_string())?;
    let actions: Vec<Action> = match value {
        serde_json::Value::Array(_) => serde_json::from_value(value).map_err(|e| e.to_string())?,
        serde_json::Value::Object(_) => {
            vec![serde_json::from_value(value).map_err(|e| e.to_string())?]
        }
        other => return Err(format!("expected an action object or list, got {}", other)),
    };

    if actions.is_empty() {
        return Err("rule has no actions".into());
    }
    for action in &actions {
        action.validate()?;
    }
    Ok(actions)
}
