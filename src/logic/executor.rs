use super::cooldown::CooldownGuard;
use crate::controller::{IrrigationController, ZoneRun};
use crate::db::Database;
use crate::error::{RaincheckError, Result};
use crate::models::{Action, ExecutionResult, SensorSnapshot, WateringEvent, WateringSource};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What one evaluation pass has learned about the controller so far.
#[derive(Debug, Default)]
pub struct PassState {
    excluded: HashSet<String>,
    rate_limited: bool,
    rate_limit_reset: Option<DateTime<Utc>>,
}

impl PassState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_rate_limited(&self) -> bool {
        self.rate_limited
    }

    pub fn rate_limit_reset(&self) -> Option<DateTime<Utc>> {
        self.rate_limit_reset
    }

    pub fn is_excluded(&self, id: &str) -> bool {
        self.excluded.contains(id)
    }

    fn exclude(&mut self, ids: &[String]) {
        self.excluded.extend(ids.iter().cloned());
    }

    fn limit(&mut self, reset_at: Option<DateTime<Utc>>) {
        self.rate_limited = true;
        self.rate_limit_reset = reset_at;
    }
}

/// Applies rule actions to the controller. Per-target failures are folded
/// into the returned [`ExecutionResult`]; only problems with the action
/// itself come back as errors.
pub struct ActionExecutor {
    controller: Arc<dyn IrrigationController>,
    db: Database,
    cooldown: CooldownGuard,
    source: WateringSource,
}

impl ActionExecutor {
    pub fn new(
        controller: Arc<dyn IrrigationController>,
        db: Database,
        source: WateringSource,
    ) -> Self {
        Self {
            controller,
            cooldown: CooldownGuard::new(db.clone()),
            db,
            source,
        }
    }

    pub async fn execute(
        &self,
        action: &Action,
        snapshot: &SensorSnapshot,
        state: &mut PassState,
    ) -> Result<ExecutionResult> {
        self.execute_at(action, snapshot, state, Utc::now()).await
    }

    pub async fn execute_at(
        &self,
        action: &Action,
        snapshot: &SensorSnapshot,
        state: &mut PassState,
        now: DateTime<Utc>,
    ) -> Result<ExecutionResult> {
        let result = match action {
            Action::SetRainDelay { hours, device_ids } => {
                let targets = self.resolve_devices(device_ids.as_deref())?;
                self.set_rain_delay(action, *hours, &targets, state).await
            }
            Action::RunZone { minutes, zone_ids } => {
                let targets = self.resolve_zones(zone_ids.as_deref())?;
                self.run_zones(action, *minutes, &targets, snapshot, state, now)
                    .await
            }
        };
        Ok(result.finish())
    }

    fn resolve_devices(&self, explicit: Option<&[String]>) -> Result<Vec<String>> {
        let devices = match explicit {
            Some(ids) => dedup(ids),
            None => self.db.get_known_devices()?,
        };
        if devices.is_empty() {
            return Err(RaincheckError::Config(
                "set_rain_delay has no target devices".into(),
            ));
        }
        Ok(devices)
    }

    fn resolve_zones(&self, explicit: Option<&[String]>) -> Result<Vec<String>> {
        if let Some(ids) = explicit {
            let zones = dedup(ids);
            if !zones.is_empty() {
                return Ok(zones);
            }
        }
        match self.db.find_default_zone()? {
            Some(zone) => {
                debug!(zone_id = %zone, "No zones named, using default lawn zone");
                Ok(vec![zone])
            }
            None => Err(RaincheckError::Config(
                "run_zone names no zones and no enabled default zone exists".into(),
            )),
        }
    }

    async fn set_rain_delay(
        &self,
        action: &Action,
        hours: u32,
        devices: &[String],
        state: &mut PassState,
    ) -> ExecutionResult {
        let mut result = ExecutionResult::new(action.label());

        for device_id in devices {
            if skip_blocked(device_id, state, &mut result) {
                continue;
            }
            match self.controller.set_rain_delay(device_id, hours).await {
                Ok(()) => result.record_success(device_id),
                Err(e) => record_error(&[device_id.clone()], e, state, &mut result),
            }
        }

        result
    }

    async fn run_zones(
        &self,
        action: &Action,
        minutes: u32,
        zones: &[String],
        snapshot: &SensorSnapshot,
        state: &mut PassState,
        now: DateTime<Utc>,
    ) -> ExecutionResult {
        let mut result = ExecutionResult::new(action.label());
        let duration_sec = minutes.saturating_mul(60);
        let mut run_set = Vec::new();

        for zone_id in zones {
            if skip_blocked(zone_id, state, &mut result) {
                continue;
            }
            match self.check_cooldown(zone_id, now) {
                Ok(Some(reason)) => {
                    info!(zone_id = %zone_id, "{}", reason);
                    result.record_skip(zone_id, reason);
                }
                Ok(None) => run_set.push(zone_id.clone()),
                Err(e) => {
                    warn!(zone_id = %zone_id, error = %e, "Cooldown check failed");
                    result.record_failure(zone_id, format!("cooldown check failed: {}", e));
                }
            }
        }

        if run_set.is_empty() {
            return result;
        }

        let outcome = if run_set.len() > 1 {
            let runs: Vec<ZoneRun> = run_set
                .iter()
                .enumerate()
                .map(|(i, zone_id)| ZoneRun {
                    zone_id: zone_id.clone(),
                    duration_sec,
                    order: i as u32 + 1,
                })
                .collect();
            self.controller.run_zones(&runs).await
        } else {
            self.controller.run_zone(&run_set[0], duration_sec).await
        };

        match outcome {
            Ok(()) => {
                for zone_id in &run_set {
                    result.record_success(zone_id);
                    self.record_watering(zone_id, duration_sec, action, snapshot, now, &mut result);
                }
            }
            Err(e) => record_error(&run_set, e, state, &mut result),
        }

        result
    }

    /// Reason to hold the zone back, if it is still cooling down.
    fn check_cooldown(&self, zone_id: &str, now: DateTime<Utc>) -> Result<Option<String>> {
        let cooldown_days = match self.db.get_zone_cooldown_config(zone_id)? {
            Some(config) => config.cooldown_days,
            None => {
                warn!(zone_id, "Zone has no cooldown config, treating as none");
                0
            }
        };

        if self.cooldown.in_cooldown_at(zone_id, cooldown_days, now)? {
            Ok(Some(format!("in {}-day cooldown", cooldown_days)))
        } else {
            Ok(None)
        }
    }

    fn record_watering(
        &self,
        zone_id: &str,
        duration_sec: u32,
        action: &Action,
        snapshot: &SensorSnapshot,
        now: DateTime<Utc>,
        result: &mut ExecutionResult,
    ) {
        let event = WateringEvent::new(zone_id, now, duration_sec, self.source).with_payload(json!({
            "action": action,
            "sensors": snapshot.known_values(),
        }));
        if let Err(e) = self.db.write_watering_event(&event) {
            error!(zone_id, error = %e, "Failed to record watering event, cooldown will not see this run");
            result
                .details
                .insert(zone_id.to_string(), format!("watered, but event not recorded: {}", e));
        }
    }
}

/// Fails the target without a call when the pass already ruled it out.
fn skip_blocked(id: &str, state: &PassState, result: &mut ExecutionResult) -> bool {
    if state.is_rate_limited() {
        result.record_failure(id, "not attempted: controller rate limited");
        result.mark_rate_limited(state.rate_limit_reset());
        return true;
    }
    if state.is_excluded(id) {
        result.record_failure(id, "not attempted: rejected earlier in this pass");
        return true;
    }
    false
}

fn record_error(
    ids: &[String],
    err: RaincheckError,
    state: &mut PassState,
    result: &mut ExecutionResult,
) {
    match err {
        RaincheckError::RateLimited { reset_at, .. } => {
            warn!(targets = ?ids, reset = ?reset_at, "Rate limited, abandoning controller calls for this pass");
            state.limit(reset_at);
            result.mark_rate_limited(reset_at);
            for id in ids {
                result.record_failure(id, "rate limited");
            }
        }
        RaincheckError::InvalidTarget {
            ids: rejected,
            code,
            message,
        } => {
            warn!(targets = ?rejected, code = %code, "Controller rejected target: {}", message);
            state.exclude(&rejected);
            for id in ids {
                result.record_failure(id, format!("invalid target [{}]: {}", code, message));
            }
        }
        other => {
            warn!(targets = ?ids, error = %other, "Controller call failed");
            let reason = other.to_string();
            for id in ids {
                result.record_failure(id, reason.clone());
            }
        }
    }
}

fn dedup(ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.iter()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty() && seen.insert(id.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::fake::{Call, FakeController, Failure};
    use crate::models::{Device, Zone};
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 15, 6, 0, 0).unwrap()
    }

    fn snapshot() -> SensorSnapshot {
        let mut s = SensorSnapshot::new(now());
        s.rain_24h = Some(0.6);
        s.soil_moisture = Some(45.0);
        s
    }

    fn zone(id: &str, name: &str, cooldown: i64) -> Zone {
        Zone {
            id: id.into(),
            name: name.into(),
            enabled: true,
            cooldown_period_days: cooldown,
            device_id: None,
        }
    }

    fn setup(controller: FakeController) -> (ActionExecutor, Arc<FakeController>, Database) {
        let db = Database::open_in_memory().unwrap();
        let controller = Arc::new(controller);
        let executor = ActionExecutor::new(
            controller.clone(),
            db.clone(),
            WateringSource::Automation,
        );
        (executor, controller, db)
    }

    fn add_devices(db: &Database, ids: &[&str]) {
        for id in ids {
            db.upsert_device(&Device {
                id: id.to_string(),
                name: format!("Controller {}", id),
            })
            .unwrap();
        }
    }

    fn rain_delay(hours: u32, device_ids: Option<Vec<&str>>) -> Action {
        Action::SetRainDelay {
            hours,
            device_ids: device_ids.map(|ids| ids.into_iter().map(String::from).collect()),
        }
    }

    fn run_zone(minutes: u32, zone_ids: Option<Vec<&str>>) -> Action {
        Action::RunZone {
            minutes,
            zone_ids: zone_ids.map(|ids| ids.into_iter().map(String::from).collect()),
        }
    }

    #[tokio::test]
    async fn rain_delay_partial_failure_still_triggers() {
        let (executor, controller, db) =
            setup(FakeController::new().fail("device1", Failure::InvalidTarget));
        add_devices(&db, &["device1", "device2"]);
        let mut state = PassState::new();

        let result = executor
            .execute_at(&rain_delay(48, None), &snapshot(), &mut state, now())
            .await
            .unwrap();

        assert!(result.triggered);
        assert_eq!(result.successful_targets, vec!["device2"]);
        assert_eq!(result.failed_targets, vec!["device1"]);
        assert!(result.skipped_targets.is_empty());
        assert!(state.is_excluded("device1"));
        assert_eq!(controller.calls().len(), 2);
    }

    #[tokio::test]
    async fn rain_delay_total_failure_does_not_trigger() {
        let (executor, _, _) = setup(FakeController::new().fail("d1", Failure::Transport));
        let mut state = PassState::new();

        let result = executor
            .execute_at(&rain_delay(24, Some(vec!["d1"])), &snapshot(), &mut state, now())
            .await
            .unwrap();

        assert!(!result.triggered);
        assert_eq!(result.failed_targets, vec!["d1"]);
        assert!(result.details["d1"].contains("connection reset"));
    }

    #[tokio::test]
    async fn rain_delay_without_devices_is_config_error() {
        let (executor, controller, _) = setup(FakeController::new());
        let err = executor
            .execute_at(&rain_delay(24, None), &snapshot(), &mut PassState::new(), now())
            .await
            .unwrap_err();
        assert!(matches!(err, RaincheckError::Config(_)));
        assert!(controller.calls().is_empty());
    }

    #[tokio::test]
    async fn rate_limit_stops_remaining_calls() {
        let reset = now() + Duration::minutes(20);
        let (executor, controller, _) =
            setup(FakeController::new().fail("d1", Failure::RateLimited(Some(reset))));
        let mut state = PassState::new();

        let result = executor
            .execute_at(
                &rain_delay(24, Some(vec!["d1", "d2", "d3"])),
                &snapshot(),
                &mut state,
                now(),
            )
            .await
            .unwrap();

        assert!(!result.triggered);
        assert!(result.rate_limited);
        assert_eq!(result.rate_limited_until, Some(reset));
        assert_eq!(result.failed_targets, vec!["d1", "d2", "d3"]);
        assert_eq!(controller.calls().len(), 1);
        assert!(state.is_rate_limited());

        // Later actions in the same pass make no calls either
        let later = executor
            .execute_at(&run_zone(5, Some(vec!["z1"])), &snapshot(), &mut state, now())
            .await
            .unwrap();
        assert_eq!(later.failed_targets, vec!["z1"]);
        assert_eq!(controller.calls().len(), 1);
    }

    #[tokio::test]
    async fn batched_run_skips_zone_in_cooldown() {
        let (executor, controller, db) = setup(FakeController::new());
        for z in [zone("A", "Front", 1), zone("B", "Side", 3), zone("C", "Back", 1)] {
            db.upsert_zone(&z).unwrap();
        }
        db.write_watering_event(&WateringEvent::new(
            "B",
            now() - Duration::days(1),
            300,
            WateringSource::Manual,
        ))
        .unwrap();

        let result = executor
            .execute_at(
                &run_zone(10, Some(vec!["A", "B", "C"])),
                &snapshot(),
                &mut PassState::new(),
                now(),
            )
            .await
            .unwrap();

        assert!(result.triggered);
        assert_eq!(result.skipped_targets, vec!["B"]);
        assert_eq!(result.successful_targets, vec!["A", "C"]);
        assert!(result.failed_targets.is_empty());

        assert_eq!(
            controller.calls(),
            vec![Call::RunZones(vec![
                ZoneRun {
                    zone_id: "A".into(),
                    duration_sec: 600,
                    order: 1
                },
                ZoneRun {
                    zone_id: "C".into(),
                    duration_sec: 600,
                    order: 2
                },
            ])]
        );

        let event = db.get_last_watering_event("A").unwrap().unwrap();
        assert_eq!(event.duration_sec, 600);
        assert_eq!(event.source, WateringSource::Automation);
        assert_eq!(event.raw_payload["sensors"]["rain24h"], json!(0.6));
        assert_eq!(db.get_last_watering_event("B").unwrap().unwrap().source, WateringSource::Manual);
    }

    #[tokio::test]
    async fn failed_batch_fails_every_zone() {
        let (executor, _, db) = setup(FakeController::new().fail("C", Failure::Transport));
        for z in [zone("A", "Front", 1), zone("B", "Side", 3), zone("C", "Back", 1)] {
            db.upsert_zone(&z).unwrap();
        }
        db.write_watering_event(&WateringEvent::new(
            "B",
            now(),
            300,
            WateringSource::Automation,
        ))
        .unwrap();

        let result = executor
            .execute_at(
                &run_zone(10, Some(vec!["A", "B", "C"])),
                &snapshot(),
                &mut PassState::new(),
                now(),
            )
            .await
            .unwrap();

        assert!(!result.triggered);
        assert_eq!(result.skipped_targets, vec!["B"]);
        assert_eq!(result.failed_targets, vec!["A", "C"]);
        assert!(db.get_last_watering_event("A").unwrap().is_none());
    }

    #[tokio::test]
    async fn single_zone_uses_plain_run() {
        let (executor, controller, db) = setup(FakeController::new());
        db.upsert_zone(&zone("z1", "Garden Beds", 0)).unwrap();

        let result = executor
            .execute_at(&run_zone(5, Some(vec!["z1", "z1"])), &snapshot(), &mut PassState::new(), now())
            .await
            .unwrap();

        assert_eq!(result.successful_targets, vec!["z1"]);
        assert_eq!(
            controller.calls(),
            vec![Call::RunZone {
                zone_id: "z1".into(),
                duration_sec: 300
            }]
        );
    }

    #[tokio::test]
    async fn legacy_run_zone_uses_default_lawn_zone() {
        let (executor, controller, db) = setup(FakeController::new());
        db.upsert_zone(&zone("z1", "Flower Beds", 0)).unwrap();
        db.upsert_zone(&zone("z2", "Back Lawn", 0)).unwrap();

        let result = executor
            .execute_at(&run_zone(15, None), &snapshot(), &mut PassState::new(), now())
            .await
            .unwrap();

        assert_eq!(result.successful_targets, vec!["z2"]);
        assert_eq!(controller.calls().len(), 1);
    }

    #[tokio::test]
    async fn legacy_run_zone_without_zones_is_config_error() {
        let (executor, _, _) = setup(FakeController::new());
        let err = executor
            .execute_at(&run_zone(15, None), &snapshot(), &mut PassState::new(), now())
            .await
            .unwrap_err();
        assert!(matches!(err, RaincheckError::Config(_)));
    }

    #[tokio::test]
    async fn excluded_ids_are_not_retried_in_pass() {
        let (executor, controller, _) =
            setup(FakeController::new().fail("d1", Failure::InvalidTarget));
        let mut state = PassState::new();
        let action = rain_delay(12, Some(vec!["d1", "d2"]));

        executor
            .execute_at(&action, &snapshot(), &mut state, now())
            .await
            .unwrap();
        let second = executor
            .execute_at(&action, &snapshot(), &mut state, now())
            .await
            .unwrap();

        assert_eq!(second.failed_targets, vec!["d1"]);
        assert_eq!(second.successful_targets, vec!["d2"]);
        assert!(second.details["d1"].contains("earlier in this pass"));
        assert_eq!(controller.calls().len(), 3);
    }

    #[tokio::test]
    async fn zone_without_config_has_no_cooldown() {
        let (executor, _, db) = setup(FakeController::new());
        db.write_watering_event(&WateringEvent::new("ghost", now(), 60, WateringSource::Manual))
            .unwrap();

        let result = executor
            .execute_at(&run_zone(1, Some(vec!["ghost"])), &snapshot(), &mut PassState::new(), now())
            .await
            .unwrap();
        assert_eq!(result.successful_targets, vec!["ghost"]);
    }

    #[tokio::test]
    async fn unrecorded_watering_is_reported() {
        let (executor, controller, db) = setup(FakeController::new());
        db.upsert_zone(&zone("z1", "Front Lawn", 1)).unwrap();
        db.with_conn(|conn| {
            conn.execute_batch(
                "CREATE TRIGGER reject_events BEFORE INSERT ON watering_events
                 BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
            )?;
            Ok(())
        })
        .unwrap();

        let result = executor
            .execute_at(&run_zone(5, Some(vec!["z1"])), &snapshot(), &mut PassState::new(), now())
            .await
            .unwrap();

        assert!(result.triggered);
        assert_eq!(result.successful_targets, vec!["z1"]);
        assert!(result.details["z1"].contains("event not recorded"));
        assert_eq!(controller.calls().len(), 1);
        assert!(db.get_last_watering_event("z1").unwrap().is_none());
    }
}
