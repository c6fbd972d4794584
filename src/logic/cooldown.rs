use crate::db::Database;
use crate::error::Result;
use chrono::{DateTime, Utc};

/// Holds a zone back until enough calendar days have passed since it was
/// last watered.
#[derive(Clone)]
pub struct CooldownGuard {
    db: Database,
}

impl CooldownGuard {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn in_cooldown(&self, zone_id: &str, cooldown_days: i64) -> Result<bool> {
        self.in_cooldown_at(zone_id, cooldown_days, Utc::now())
    }

    pub fn in_cooldown_at(
        &self,
        zone_id: &str,
        cooldown_days: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if cooldown_days <= 0 {
            return Ok(false);
        }

        let Some(last) = self.db.get_last_watering_event(zone_id)? else {
            return Ok(false);
        };

        let days_since = calendar_days_between(last.timestamp, now);
        tracing::debug!(zone_id, days_since, cooldown_days, "Cooldown check");
        Ok(days_since < cooldown_days)
    }
}

/// Whole UTC days between the dates of `earlier` and `later`, ignoring time of day.
pub fn calendar_days_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> i64 {
    (later.date_naive() - earlier.date_naive()).num_days()
}
