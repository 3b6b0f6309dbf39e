//! Storage backend abstraction (§4.6).
//!
//! Every backend implements [`StorageBackend`]; some additionally implement
//! [`Uploadable`] to hand a finished file artefact to an uploader. Recording
//! calls are fire-and-forget from the caller's perspective — `startMission`
//! and `endMission` are the only calls allowed to block on backend I/O.

pub mod memory;
pub mod relational;
pub mod streaming;

use async_trait::async_trait;

use crate::domain::*;
use crate::error::RecorderError;

#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn init(&self) -> Result<(), RecorderError>;
    async fn close(&self) -> Result<(), RecorderError>;

    async fn start_mission(&self, mission: Mission, world: World) -> Result<Mission, RecorderError>;
    async fn end_mission(&self) -> Result<(), RecorderError>;

    async fn add_soldier(&self, soldier: Soldier) -> Result<(), RecorderError>;
    async fn add_vehicle(&self, vehicle: Vehicle) -> Result<(), RecorderError>;
    /// Synchronous with respect to the marker cache: returns the assigned ID.
    async fn add_marker(&self, marker: Marker) -> Result<i64, RecorderError>;

    async fn record_soldier_state(&self, state: SoldierState) -> Result<(), RecorderError>;
    async fn record_vehicle_state(&self, state: VehicleState) -> Result<(), RecorderError>;
    async fn record_marker_state(&self, state: MarkerState) -> Result<(), RecorderError>;
    async fn delete_marker(&self, marker_id: i64, end_frame: i64) -> Result<(), RecorderError>;

    async fn record_fired_event(&self, event: FiredEvent) -> Result<(), RecorderError>;
    async fn record_projectile_event(&self, event: ProjectileEvent) -> Result<(), RecorderError>;
    async fn record_general_event(&self, event: GeneralEvent) -> Result<(), RecorderError>;
    async fn record_hit_event(&self, event: HitEvent) -> Result<(), RecorderError>;
    async fn record_kill_event(&self, event: KillEvent) -> Result<(), RecorderError>;
    async fn record_chat_event(&self, event: ChatEvent) -> Result<(), RecorderError>;
    async fn record_radio_event(&self, event: RadioEvent) -> Result<(), RecorderError>;
    async fn record_telemetry_event(&self, event: TelemetryEvent) -> Result<(), RecorderError>;
    async fn record_time_state(&self, state: TimeState) -> Result<(), RecorderError>;
    async fn record_ace3_death_event(&self, event: Ace3DeathEvent) -> Result<(), RecorderError>;
    async fn record_ace3_unconscious_event(&self, event: Ace3UnconsciousEvent) -> Result<(), RecorderError>;
}

/// Metadata the uploader needs alongside the file path.
pub struct UploadMetadata {
    pub world_name: String,
    pub mission_name: String,
    pub mission_duration_secs: f64,
    pub tag: String,
}

#[async_trait]
pub trait Uploadable: StorageBackend {
    async fn healthcheck(&self) -> Result<(), RecorderError>;
    async fn upload(&self, path: &std::path::Path, metadata: UploadMetadata) -> Result<(), RecorderError>;
}
