//! Process-wide current mission/world (§4.3).
//!
//! A read-mostly `RwLock` over the sentinel-or-live `Mission`. Consumers are
//! expected to snapshot the missionID at event time; the dispatcher must
//! never stamp a record with a stale missionID by reading the context
//! before a handler has actually run (spec design note on the mutable
//! global — see `handlers.rs` for where the snapshot happens).

use tokio::sync::RwLock;

use crate::domain::{Mission, PlayableSlots, SideFriendly, World};

fn sentinel_mission() -> Mission {
    Mission {
        mission_id: 0,
        mission_name: "No mission loaded".to_string(),
        briefing_name: String::new(),
        on_load_name: String::new(),
        author: String::new(),
        server_name: String::new(),
        server_profile: String::new(),
        tag: String::new(),
        start_time: chrono::DateTime::<chrono::Utc>::UNIX_EPOCH,
        capture_delay: 0.0,
        addon_version: String::new(),
        extension_version: String::new(),
        playable_slots: PlayableSlots::default(),
        side_friendly: SideFriendly::default(),
        addons: Vec::new(),
        world: World {
            world_name: "none".to_string(),
            display_name: "No mission loaded".to_string(),
            world_size: 0.0,
            centroid: crate::domain::Position2D::default(),
        },
    }
}

#[derive(Debug)]
pub struct MissionContext {
    inner: RwLock<Mission>,
}

impl Default for MissionContext {
    fn default() -> Self {
        Self {
            inner: RwLock::new(sentinel_mission()),
        }
    }
}

impl MissionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn current(&self) -> Mission {
        self.inner.read().await.clone()
    }

    pub async fn mission_id(&self) -> i64 {
        self.inner.read().await.mission_id
    }

    /// Publishes a freshly started mission. Takes the exclusive lock once so
    /// mission and world are visible atomically to readers.
    pub async fn start(&self, mission: Mission) {
        *self.inner.write().await = mission;
    }

    pub async fn end(&self) {
        *self.inner.write().await = sentinel_mission();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn default_context_is_sentinel() {
        let ctx = MissionContext::new();
        let m = ctx.current().await;
        assert_eq!(m.mission_id, 0);
        assert_eq!(m.mission_name, "No mission loaded");
    }

    #[tokio::test]
    async fn start_publishes_mission_and_world_atomically() {
        let ctx = MissionContext::new();
        let mut mission = sentinel_mission();
        mission.mission_id = 7;
        mission.mission_name = "Operation Foo".to_string();
        ctx.start(mission).await;

        let m = ctx.current().await;
        assert_eq!(m.mission_id, 7);
        assert_eq!(m.mission_name, "Operation Foo");
    }

    #[tokio::test]
    async fn end_resets_to_sentinel() {
        let ctx = MissionContext::new();
        let mut mission = sentinel_mission();
        mission.mission_id = 7;
        ctx.start(mission).await;
        ctx.end().await;
        assert_eq!(ctx.mission_id().await, 0);
    }
}
