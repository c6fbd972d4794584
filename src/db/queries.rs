use crate::db::Database;
use crate::error::{RaincheckError, Result};
use crate::models::{
    AuditAction, AuditEntry, Device, HistoricalSeries, RuleRecord, Sample, SensorField,
    SensorSnapshot, WateringEvent, WateringSource, Zone, ZoneCooldown,
};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Row};
use std::collections::BTreeMap;
use tracing::warn;

/// Zone names that identify the main lawn when a rule names no zones.
const LAWN_ZONE_PATTERN: &str = r"(?i)\b(lawn|grass|turf|yard|sod)\b";

/// Fixed-width UTC timestamps so text ordering matches time ordering.
pub(crate) fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

// Rule Queries

impl Database {
    pub fn get_enabled_rules(&self) -> Result<Vec<RuleRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM rules WHERE enabled = 1 ORDER BY id")?;
            let rules = stmt
                .query_map([], row_to_rule)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rules)
        })
    }

    pub fn list_rules(&self) -> Result<Vec<RuleRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM rules ORDER BY id")?;
            let rules = stmt
                .query_map([], row_to_rule)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rules)
        })
    }

    /// Insert a rule, or replace the definition of the rule with the same name.
    pub fn upsert_rule(
        &self,
        name: &str,
        enabled: bool,
        conditions: &str,
        actions: &str,
    ) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO rules (name, enabled, conditions, actions)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(name) DO UPDATE SET
                    enabled = excluded.enabled,
                    conditions = excluded.conditions,
                    actions = excluded.actions,
                    updated_at = datetime('now')
                "#,
                params![name, enabled, conditions, actions],
            )?;
            let id = conn.query_row("SELECT id FROM rules WHERE name = ?1", [name], |row| {
                row.get(0)
            })?;
            Ok(id)
        })
    }

    pub fn update_rule_run_result(
        &self,
        rule_id: i64,
        timestamp: DateTime<Utc>,
        result: &serde_json::Value,
    ) -> Result<()> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE rules SET last_run_at = ?1, last_result = ?2 WHERE id = ?3",
                params![format_ts(&timestamp), result.to_string(), rule_id],
            )?;
            if updated == 0 {
                return Err(RaincheckError::NotFound(format!("rule {}", rule_id)));
            }
            Ok(())
        })
    }
}

fn row_to_rule(row: &Row) -> rusqlite::Result<RuleRecord> {
    let last_run_at: Option<String> = row.get("last_run_at")?;

    Ok(RuleRecord {
        id: row.get("id")?,
        name: row.get("name")?,
        enabled: row.get("enabled")?,
        conditions: row.get("conditions")?,
        actions: row.get("actions")?,
        last_run_at: last_run_at.as_deref().and_then(parse_ts),
        last_result: row.get("last_result")?,
    })
}

// Inventory Queries

impl Database {
    pub fn upsert_device(&self, device: &Device) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO devices (id, name) VALUES (?1, ?2)
                ON CONFLICT(id) DO UPDATE SET name = excluded.name
                "#,
                params![device.id, device.name],
            )?;
            Ok(())
        })
    }

    pub fn get_known_devices(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id FROM devices ORDER BY id")?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(ids)
        })
    }

    pub fn upsert_zone(&self, zone: &Zone) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO zones (id, name, enabled, cooldown_period_days, device_id)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    enabled = excluded.enabled,
                    cooldown_period_days = excluded.cooldown_period_days,
                    device_id = excluded.device_id
                "#,
                params![
                    zone.id,
                    zone.name,
                    zone.enabled,
                    zone.cooldown_period_days,
                    zone.device_id,
                ],
            )?;
            Ok(())
        })
    }

    pub fn list_zones(&self) -> Result<Vec<Zone>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM zones ORDER BY name COLLATE NOCASE")?;
            let zones = stmt
                .query_map([], row_to_zone)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(zones)
        })
    }

    pub fn get_zone_cooldown_config(&self, zone_id: &str) -> Result<Option<ZoneCooldown>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT name, cooldown_period_days FROM zones WHERE id = ?1",
                [zone_id],
                |row| {
                    Ok(ZoneCooldown {
                        name: row.get(0)?,
                        cooldown_days: row.get(1)?,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
        })
    }

    /// Zone a rule waters when it names none: the first enabled zone whose
    /// name looks like a lawn, else the first enabled zone alphabetically.
    pub fn find_default_zone(&self) -> Result<Option<String>> {
        let pattern = regex_lite::Regex::new(LAWN_ZONE_PATTERN)
            .map_err(|e| RaincheckError::Config(format!("Bad zone pattern: {}", e)))?;

        let zones: Vec<Zone> = self
            .list_zones()?
            .into_iter()
            .filter(|z| z.enabled)
            .collect();

        let chosen = zones
            .iter()
            .find(|z| pattern.is_match(&z.name))
            .or_else(|| zones.first())
            .map(|z| z.id.clone());

        Ok(chosen)
    }
}

fn row_to_zone(row: &Row) -> rusqlite::Result<Zone> {
    Ok(Zone {
        id: row.get("id")?,
        name: row.get("name")?,
        enabled: row.get("enabled")?,
        cooldown_period_days: row.get("cooldown_period_days")?,
        device_id: row.get("device_id")?,
    })
}

// Sensor Reading Queries

impl Database {
    pub fn insert_reading(&self, snapshot: &SensorSnapshot) -> Result<()> {
        let channels = snapshot
            .soil_channels
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT OR REPLACE INTO sensor_readings
                    (timestamp, rain_24h, rain_1h, temperature, humidity, pressure,
                     soil_moisture, soil_channels)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    format_ts(&snapshot.timestamp),
                    snapshot.rain_24h,
                    snapshot.rain_1h,
                    snapshot.temperature,
                    snapshot.humidity,
                    snapshot.pressure,
                    snapshot.soil_moisture,
                    channels,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_latest_snapshot(&self) -> Result<Option<SensorSnapshot>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM sensor_readings ORDER BY timestamp DESC LIMIT 1",
                [],
                row_to_snapshot,
            )
            .optional()
            .map_err(Into::into)
        })
    }

    /// Samples for `fields` recorded at or after `since`, oldest first.
    pub fn get_historical_series(
        &self,
        fields: &[SensorField],
        since: DateTime<Utc>,
    ) -> Result<HistoricalSeries> {
        let mut history = HistoricalSeries::new();
        if fields.is_empty() {
            return Ok(history);
        }

        let columns: Vec<&str> = fields.iter().map(|f| f.column()).collect();
        let sql = format!(
            "SELECT timestamp, {} FROM sensor_readings WHERE timestamp >= ?1 ORDER BY timestamp ASC",
            columns.join(", ")
        );

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([format_ts(&since)])?;
            while let Some(row) = rows.next()? {
                let ts_str: String = row.get(0)?;
                let Some(timestamp) = parse_ts(&ts_str) else {
                    warn!(timestamp = %ts_str, "Skipping reading with unparseable timestamp");
                    continue;
                };
                for (i, field) in fields.iter().enumerate() {
                    let value: Option<f64> = row.get(i + 1)?;
                    if let Some(value) = value {
                        history.push(*field, Sample::new(timestamp, value));
                    }
                }
            }
            Ok(())
        })?;

        Ok(history)
    }
}

fn row_to_snapshot(row: &Row) -> rusqlite::Result<SensorSnapshot> {
    let ts_str: String = row.get("timestamp")?;
    let channels_str: Option<String> = row.get("soil_channels")?;

    let timestamp = parse_ts(&ts_str).unwrap_or_else(|| {
        warn!(timestamp = %ts_str, "Unparseable reading timestamp, using now");
        Utc::now()
    });

    let soil_channels = channels_str.as_deref().and_then(|s| {
        serde_json::from_str::<BTreeMap<u8, f64>>(s)
            .map_err(|e| warn!(error = %e, "Ignoring malformed soil_channels"))
            .ok()
    });

    Ok(SensorSnapshot {
        timestamp,
        rain_24h: row.get("rain_24h")?,
        rain_1h: row.get("rain_1h")?,
        temperature: row.get("temperature")?,
        humidity: row.get("humidity")?,
        pressure: row.get("pressure")?,
        soil_moisture: row.get("soil_moisture")?,
        soil_channels,
    })
}

// Watering Event Queries

impl Database {
    pub fn write_watering_event(&self, event: &WateringEvent) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO watering_events (zone_id, timestamp, duration_sec, source, raw_payload)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    event.zone_id,
                    format_ts(&event.timestamp),
                    event.duration_sec,
                    event.source.as_str(),
                    event.raw_payload.to_string(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get_last_watering_event(&self, zone_id: &str) -> Result<Option<WateringEvent>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM watering_events WHERE zone_id = ?1 ORDER BY timestamp DESC, id DESC LIMIT 1",
                [zone_id],
                row_to_watering_event,
            )
            .optional()
            .map_err(Into::into)
        })
    }
}

fn row_to_watering_event(row: &Row) -> rusqlite::Result<WateringEvent> {
    let ts_str: String = row.get("timestamp")?;
    let source_str: String = row.get("source")?;
    let payload_str: Option<String> = row.get("raw_payload")?;

    let source = WateringSource::from_str(&source_str).unwrap_or_else(|| {
        warn!(source = %source_str, "Unknown watering source in database, defaulting to manual");
        WateringSource::Manual
    });

    Ok(WateringEvent {
        id: Some(row.get("id")?),
        zone_id: row.get("zone_id")?,
        timestamp: parse_ts(&ts_str).unwrap_or_else(|| {
            warn!(timestamp = %ts_str, "Unparseable watering timestamp, using now");
            Utc::now()
        }),
        duration_sec: row.get("duration_sec")?,
        source,
        raw_payload: payload_str
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or(serde_json::Value::Null),
    })
}

// Audit Queries

impl Database {
    pub fn write_audit_entry(&self, entry: &AuditEntry) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO audit_log (timestamp, rule_id, rule_name, action, details)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    format_ts(&entry.timestamp),
                    entry.rule_id,
                    entry.rule_name,
                    entry.action.as_str(),
                    entry.details.to_string(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn recent_audit_entries(&self, limit: u32) -> Result<Vec<AuditEntry>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT * FROM audit_log ORDER BY timestamp DESC, id DESC LIMIT ?1")?;
            let entries = stmt
                .query_map([limit], row_to_audit_entry)?
                .filter_map(|r| r.ok())
                .flatten()
                .collect();
            Ok(entries)
        })
    }
}

fn row_to_audit_entry(row: &Row) -> rusqlite::Result<Option<AuditEntry>> {
    let ts_str: String = row.get("timestamp")?;
    let action_str: String = row.get("action")?;
    let details_str: String = row.get("details")?;

    let Some(action) = AuditAction::from_str(&action_str) else {
        warn!(action = %action_str, "Unknown audit action in database, skipping");
        return Ok(None);
    };

    Ok(Some(AuditEntry {
        id: Some(row.get("id")?),
        timestamp: parse_ts(&ts_str).unwrap_or_else(Utc::now),
        rule_id: row.get("rule_id")?,
        rule_name: row.get("rule_name")?,
        action,
        details: serde_json::from_str(&details_str).unwrap_or(serde_json::Value::Null),
    }))
}

trait OptionalExt<T> {
    fn optional(self) -> rusqlite::Result<Option<T>>;
}

impl<T> OptionalExt<T> for rusqlite::Result<T> {
    fn optional(self) -> rusqlite::Result<Option<T>> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
