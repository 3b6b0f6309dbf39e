//! Mission lifecycle & monitor (§4.10).
//!
//! Ties the dispatcher, caches, mission context and backend together:
//! `:NEW:MISSION:` parses, publishes the mission context, resets the marker
//! cache (not the entity cache — the host re-announces entities), and calls
//! the backend's `startMission`. A 1 Hz monitor writes a status snapshot
//! while a mission is active. A single shutdown signal is handed to every
//! long-running task the way the spec's concurrency model requires.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

use crate::backend::StorageBackend;
use crate::cache::{EntityCache, MarkerCache};
use crate::domain::{Mission, World};
use crate::error::RecorderError;
use crate::mission_context::MissionContext;

/// Broadcast-style shutdown signal. `ShutdownHandle::fire` is called once,
/// at most, by the process owner; every long-running task holds a clone of
/// the `ShutdownSignal` side and polls it between units of work.
#[derive(Clone)]
pub struct ShutdownSignal(watch::Receiver<bool>);

impl ShutdownSignal {
    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once the signal transitions to fired. Safe to call
    /// repeatedly; once fired it resolves immediately forever after.
    pub async fn changed(&mut self) {
        if self.is_shutdown() {
            return;
        }
        let _ = self.0.changed().await;
    }
}

pub struct ShutdownHandle(watch::Sender<bool>);

impl ShutdownHandle {
    pub fn fire(&self) {
        let _ = self.0.send(true);
    }
}

pub fn shutdown_channel() -> (ShutdownHandle, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle(tx), ShutdownSignal(rx))
}

/// Per-mission snapshot written to the status file once a second.
#[derive(Debug, Serialize)]
pub struct StatusSnapshot {
    pub mission_id: i64,
    pub mission_name: String,
    pub queue_depths: Vec<(String, usize)>,
    pub last_write_duration_ms: u128,
}

pub struct Lifecycle {
    mission_context: Arc<MissionContext>,
    entity_cache: Arc<EntityCache>,
    marker_cache: Arc<MarkerCache>,
    backend: Arc<dyn StorageBackend>,
    status_file: PathBuf,
    shutdown: ShutdownSignal,
}

impl Lifecycle {
    pub fn new(
        mission_context: Arc<MissionContext>,
        entity_cache: Arc<EntityCache>,
        marker_cache: Arc<MarkerCache>,
        backend: Arc<dyn StorageBackend>,
        status_file: PathBuf,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            mission_context,
            entity_cache,
            marker_cache,
            backend,
            status_file,
            shutdown,
        }
    }

    /// `:NEW:MISSION:` processing, in the order the spec requires: set
    /// mission context, reset marker cache, call backend `startMission`.
    /// The entity cache is deliberately untouched here.
    pub async fn start_mission(&self, mission: Mission, world: World) -> Result<(), RecorderError> {
        let started = self.backend.start_mission(mission, world).await?;
        self.mission_context.start(started.clone()).await;
        self.marker_cache.reset().await;
        info!(mission_id = started.mission_id, mission_name = %started.mission_name, "mission started");
        Ok(())
    }

    /// Closes the backend, resets the entity cache, and clears the mission
    /// context back to the sentinel.
    pub async fn end_mission(&self) -> Result<(), RecorderError> {
        self.backend.end_mission().await?;
        self.entity_cache.reset().await;
        self.mission_context.end().await;
        info!("mission ended");
        Ok(())
    }

    /// Runs the 1 Hz status monitor until the shutdown signal fires. Meant
    /// to be spawned as its own task.
    pub async fn run_monitor(&self, queue_depths: impl Fn() -> Vec<(String, usize)> + Send + Sync + 'static) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if shutdown.is_shutdown() {
                break;
            }

            let mission = self.mission_context.current().await;
            if mission.mission_id == 0 {
                continue;
            }

            let started = Instant::now();
            let snapshot = StatusSnapshot {
                mission_id: mission.mission_id,
                mission_name: mission.mission_name.clone(),
                queue_depths: queue_depths(),
                last_write_duration_ms: 0,
            };
            let elapsed = started.elapsed().as_millis();
            let snapshot = StatusSnapshot {
                last_write_duration_ms: elapsed,
                ..snapshot
            };

            if let Err(e) = write_status_file(&self.status_file, &snapshot).await {
                tracing::warn!(error = %e, "monitor: failed to write status file");
            }
        }
    }
}

/// Writes the snapshot atomically: to a `.tmp` sibling, then renamed over
/// the real path, so a reader tailing the status file never observes a
/// half-written document.
async fn write_status_file(path: &std::path::Path, snapshot: &StatusSnapshot) -> Result<(), RecorderError> {
    let json = serde_json::to_vec_pretty(snapshot)
        .map_err(|e| RecorderError::Configuration(format!("status snapshot serialisation failed: {e}")))?;
    let tmp_path = path.with_extension("tmp");
    tokio::fs::write(&tmp_path, json)
        .await
        .map_err(|e| RecorderError::Configuration(format!("status file write failed: {e}")))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| RecorderError::Configuration(format!("status file rename failed: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_signal_fires_once_and_stays_fired() {
        let (handle, mut signal) = shutdown_channel();
        assert!(!signal.is_shutdown());
        handle.fire();
        signal.changed().await;
        assert!(signal.is_shutdown());
        // Calling changed() again must resolve immediately, not hang.
        signal.changed().await;
        assert!(signal.is_shutdown());
    }

    #[tokio::test]
    async fn status_file_write_is_atomic_rename() {
        let dir = std::env::temp_dir().join(format!("mission-recorder-test-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("status.json");

        let snapshot = StatusSnapshot {
            mission_id: 1,
            mission_name: "Test".to_string(),
            queue_depths: vec![("soldiers".to_string(), 0)],
            last_write_duration_ms: 5,
        };
        write_status_file(&path, &snapshot).await.unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
