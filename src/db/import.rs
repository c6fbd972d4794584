use crate::db::Database;
use crate::error::{RaincheckError, Result};
use crate::models::{parse_actions, ConditionSet, Device, SensorSnapshot, Zone};
use serde::Deserialize;
use std::path::Path;

/// YAML inventory accepted by `raincheck import`.
#[derive(Debug, Default, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub devices: Vec<Device>,
    #[serde(default)]
    pub zones: Vec<Zone>,
    #[serde(default)]
    pub rules: Vec<RuleDefinition>,
    #[serde(default)]
    pub readings: Vec<SensorSnapshot>,
}

#[derive(Debug, Deserialize)]
pub struct RuleDefinition {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub conditions: serde_json::Value,
    pub actions: serde_json::Value,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub devices: usize,
    pub zones: usize,
    pub rules: usize,
    pub readings: usize,
}

impl Inventory {
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }
}

impl RuleDefinition {
    /// Validated JSON forms of the conditions and actions, ready to store.
    fn to_json(&self) -> Result<(String, String)> {
        let conditions = if self.conditions.is_null() {
            serde_json::json!({})
        } else {
            self.conditions.clone()
        };

        serde_json::from_value::<ConditionSet>(conditions.clone()).map_err(|e| {
            RaincheckError::Config(format!("rule '{}' has invalid conditions: {}", self.name, e))
        })?;

        let actions = self.actions.to_string();
        parse_actions(&actions).map_err(|e| {
            RaincheckError::Config(format!("rule '{}' has invalid actions: {}", self.name, e))
        })?;

        Ok((conditions.to_string(), actions))
    }
}

impl Database {
    /// Store an inventory. Every rule is validated before anything is written.
    pub fn import_inventory(&self, inventory: &Inventory) -> Result<ImportSummary> {
        let rules = inventory
            .rules
            .iter()
            .map(|r| r.to_json().map(|json| (r, json)))
            .collect::<Result<Vec<_>>>()?;

        for device in &inventory.devices {
            self.upsert_device(device)?;
        }
        for zone in &inventory.zones {
            self.upsert_zone(zone)?;
        }
        for (rule, (conditions, actions)) in &rules {
            let id = self.upsert_rule(&rule.name, rule.enabled, conditions, actions)?;
            tracing::debug!(rule_id = id, name = %rule.name, "Imported rule");
        }
        for reading in &inventory.readings {
            self.insert_reading(reading)?;
        }

        Ok(ImportSummary {
            devices: inventory.devices.len(),
            zones: inventory.zones.len(),
            rules: rules.len(),
            readings: inventory.readings.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
devices:
  - id: dev-1
    name: Front Controller
zones:
  - id: z1
    name: Front Lawn
    cooldown_period_days: 2
    device_id: dev-1
rules:
  - name: Rain delay after storms
    conditions:
      rain24h: { operator: ">=", value: 0.5 }
    actions:
      - type: set_rain_delay
        hours: 48
  - name: Dry soil
    enabled: false
    conditions:
      soilMoisture:
        sensors:
          - { channel: 1, operator: "<", value: 25 }
        logic: OR
    actions:
      type: run_zone
      minutes: 10
readings:
  - timestamp: 2026-07-01T06:00:00Z
    rain24h: 0.1
    soilMoisture: 22
"#;

    #[test]
    fn imports_full_inventory() {
        let db = Database::open_in_memory().unwrap();
        let inventory = Inventory::from_yaml(SAMPLE).unwrap();
        let summary = db.import_inventory(&inventory).unwrap();

        assert_eq!(
            summary,
            ImportSummary {
                devices: 1,
                zones: 1,
                rules: 2,
                readings: 1
            }
        );
        assert_eq!(db.get_known_devices().unwrap(), vec!["dev-1"]);
        assert_eq!(db.get_enabled_rules().unwrap().len(), 1);
        let latest = db.get_latest_snapshot().unwrap().unwrap();
        assert_eq!(latest.soil_moisture, Some(22.0));
    }

    #[test]
    fn invalid_rule_aborts_import_before_writes() {
        let db = Database::open_in_memory().unwrap();
        let inventory = Inventory::from_yaml(
            r#"
devices:
  - id: dev-1
    name: Front
rules:
  - name: bad
    conditions:
      rain24h: { operator: trend, trend: increasing }
    actions:
      type: set_rain_delay
      hours: 24
"#,
        )
        .unwrap();

        let err = db.import_inventory(&inventory).unwrap_err();
        assert!(matches!(err, RaincheckError::Config(_)));
        assert!(db.get_known_devices().unwrap().is_empty());
    }
}
