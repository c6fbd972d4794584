use crate::controller::{IrrigationController, ZoneRun};
use crate::error::{RaincheckError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    RainDelay { device_id: String, hours: u32 },
    RunZone { zone_id: String, duration_sec: u32 },
    RunZones(Vec<ZoneRun>),
    Stop { device_id: String },
}

#[derive(Debug, Clone, Copy)]
pub enum Failure {
    InvalidTarget,
    RateLimited(Option<DateTime<Utc>>),
    Transport,
}

/// Scripted controller that records every call it receives.
#[derive(Default)]
pub struct FakeController {
    calls: Mutex<Vec<Call>>,
    failures: Mutex<HashMap<String, Failure>>,
}

impl FakeController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(self, target: &str, failure: Failure) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert(target.to_string(), failure);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Yields before answering, like a real network round trip.
    async fn respond(&self, call: Call, targets: &[&str]) -> Result<()> {
        tokio::task::yield_now().await;
        self.calls.lock().unwrap().push(call);
        let failures = self.failures.lock().unwrap();
        for target in targets {
            if let Some(failure) = failures.get(*target) {
                return Err(match failure {
                    Failure::InvalidTarget => RaincheckError::InvalidTarget {
                        ids: vec![target.to_string()],
                        code: "301".into(),
                        message: "not found".into(),
                    },
                    Failure::RateLimited(reset_at) => RaincheckError::RateLimited {
                        reset_at: *reset_at,
                        remaining: Some(0),
                    },
                    Failure::Transport => RaincheckError::Transport("connection reset".into()),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl IrrigationController for FakeController {
    async fn set_rain_delay(&self, device_id: &str, hours: u32) -> Result<()> {
        self.respond(
            Call::RainDelay {
                device_id: device_id.to_string(),
                hours,
            },
            &[device_id],
        )
        .await
    }

    async fn run_zone(&self, zone_id: &str, duration_sec: u32) -> Result<()> {
        self.respond(
            Call::RunZone {
                zone_id: zone_id.to_string(),
                duration_sec,
            },
            &[zone_id],
        )
        .await
    }

    async fn run_zones(&self, runs: &[ZoneRun]) -> Result<()> {
        let ids: Vec<&str> = runs.iter().map(|r| r.zone_id.as_str()).collect();
        self.respond(Call::RunZones(runs.to_vec()), &ids).await
    }

    async fn stop(&self, device_id: &str) -> Result<()> {
        self.respond(
            Call::Stop {
                device_id: device_id.to_string(),
            },
            &[device_id],
        )
        .await
    }
}
