pub mod client;
pub mod rate_limit;

pub use client::ControllerClient;
pub use rate_limit::{RateLimitRegistry, RateLimitTracker};

use crate::error::Result;
use async_trait::async_trait;

/// One entry of a batched zone run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneRun {
    pub zone_id: String,
    pub duration_sec: u32,
    /// Zones start one at a time in ascending order.
    pub order: u32,
}

/// Outbound operations against the irrigation controller.
///
/// None of these are idempotent and none are retried by implementations.
#[async_trait]
pub trait IrrigationController: Send + Sync {
    async fn set_rain_delay(&self, device_id: &str, hours: u32) -> Result<()>;

    async fn run_zone(&self, zone_id: &str, duration_sec: u32) -> Result<()>;

    /// Start several zones in a single request; the controller waters them
    /// sequentially by `order`, never concurrently.
    async fn run_zones(&self, runs: &[ZoneRun]) -> Result<()>;

    async fn stop(&self, device_id: &str) -> Result<()>;
}
